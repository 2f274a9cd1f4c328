//! Example: an inspector session inside one process
//!
//! Wires a synthetic page, an observer, the relay and a presentation client
//! together over in-process ports, then walks through an edit, a snapshot
//! and a restore while printing what the presentation sees.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=debug cargo run --example in_process_session
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde_json::json;
use statescope::observer::{MemoryHost, Observer};
use statescope::relay::Relay;
use statescope::sdk::{Context, EventBus, Port, Settings};
use statescope::{init_logging, InspectorView, PresentationClient};

fn print_view(label: &str, view: &InspectorView) {
    println!("== {} (revision {})", label, view.revision);
    for component in view.components.values() {
        let props: Vec<String> = component
            .properties
            .iter()
            .map(|(name, prop)| format!("{}={}", name, prop.value))
            .collect();
        println!("  {} [{}] {}", component.name, component.id, props.join(" "));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    let settings = Settings::load(None).context("loading settings")?;
    let timeout = settings.health.request_timeout();
    let relay = Relay::new(Context::new(settings));
    relay.start();

    // A page with a single counter.
    let host = Arc::new(MemoryHost::new());
    host.add_element(
        "counter",
        None,
        json!({
            "id": "counter-1",
            "name": "Counter",
            "data": {"count": 0, "label": "clicks"},
            "methods": [{"name": "increment", "params": []}]
        }),
    );
    host.register_method("increment", |data, _| {
        let next = data["count"].as_i64().unwrap_or(0) + 1;
        data.insert("count".into(), json!(next));
        json!(next)
    });

    let observer = Observer::new(host.clone(), EventBus::new());
    let found = observer.initialize()?;
    println!("observer found {} component(s)", found);

    let (page, relay_side) = Port::pair();
    observer.connect(page);
    relay.attach_observer(observer.session_id(), relay_side);

    let (ui, relay_side) = Port::pair();
    relay.attach_presentation(relay_side);
    let client = PresentationClient::connect(ui, timeout);
    let mut source = client.watch();

    tokio::time::sleep(Duration::from_millis(50)).await;
    print_view("initial", &client.refresh().await?);

    let snapshot = client.create_snapshot("counter-1", Some("zero")).await?;
    for _ in 0..3 {
        client.execute_method("counter-1", "increment", vec![]).await?;
    }
    client.update_component("counter-1", "label", json!("taps")).await?;
    if let Some(view) = source.changed().await {
        print_view("after edits", &view);
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    for (path, change) in client.compare_snapshots(&snapshot.id, None).await? {
        println!("  {}: {:?} -> {:?}", path, change.before, change.after);
    }

    let applied = client.restore_snapshot(&snapshot.id).await?;
    println!("restored {} propert(ies)", applied);
    tokio::time::sleep(Duration::from_millis(50)).await;
    print_view("after restore", &client.view());

    for report in client.connection_status().await? {
        println!("  connection {}: {:?}", report.connection_id, report.status);
    }

    client.close();
    observer.stop();
    relay.stop();
    Ok(())
}
