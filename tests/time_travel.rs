//! End-to-end: a host page, an observer, the relay and a presentation
//! client wired together over in-process ports.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use statescope::observer::{MemoryHost, Observer};
use statescope::relay::{HealthConfig, Relay};
use statescope::sdk::{Context, EventBus, FileStorage, Port, Settings};
use statescope::types::{Action, ConnectionStatus, Reason};
use statescope::{ClientError, PresentationClient};

fn page() -> Arc<MemoryHost> {
    let host = Arc::new(MemoryHost::new());
    host.add_element(
        "app",
        None,
        json!({"id": "app", "name": "App", "data": {"theme": "light"}}),
    );
    host.add_element(
        "counter",
        Some("app"),
        json!({
            "id": "comp-1",
            "name": "Counter",
            "fingerprint": "f1",
            "data": {"count": 0, "title": "My Counter", "double": 0, "token": "t"},
            "computed": ["double"],
            "protected": ["token"],
            "methods": [{"name": "increment", "params": []}]
        }),
    );
    host.register_method("increment", |data, _| {
        let next = data["count"].as_i64().unwrap_or(0) + 1;
        data.insert("count".into(), json!(next));
        json!(next)
    });
    host
}

struct Session {
    relay: Relay,
    host: Arc<MemoryHost>,
    _observer: Observer,
    client: PresentationClient,
}

async fn session() -> Session {
    let health = HealthConfig {
        ping_interval: Duration::from_millis(100),
        max_missed_pongs: 3,
        max_reconnect_attempts: 2,
        base_backoff: Duration::from_millis(50),
    };
    let relay = Relay::with_health(Context::new(Settings::default()), health);

    let host = page();
    let observer = Observer::new(host.clone(), EventBus::new());
    observer.initialize().unwrap();
    let (near, far) = Port::pair();
    observer.connect(near);
    relay.attach_observer(observer.session_id(), far);

    let (near, far) = Port::pair();
    relay.attach_presentation(far);
    let client = PresentationClient::connect(near, Duration::from_secs(2));

    // Let the observer's initial report reach the index.
    tokio::time::sleep(Duration::from_millis(20)).await;

    Session {
        relay,
        host,
        _observer: observer,
        client,
    }
}

#[tokio::test]
async fn presentation_sees_the_component_tree() {
    let session = session().await;

    let view = session.client.refresh().await.unwrap();
    let roots: Vec<&str> = view.roots().iter().map(|c| c.id.as_str()).collect();
    assert_eq!(roots, vec!["app"]);
    assert_eq!(view.children("app")[0].id, "comp-1");
    assert!(session.relay.owner_of("comp-1").is_some());
}

#[tokio::test]
async fn edit_snapshot_compare_restore() {
    let session = session().await;
    let client = &session.client;

    client
        .update_component("comp-1", "count", json!(3))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let three = client.create_snapshot("comp-1", Some("three")).await.unwrap();
    assert_eq!(three.state["count"], json!(3));

    assert_eq!(client.execute_method("comp-1", "increment", vec![]).await.unwrap(), json!(4));
    client
        .update_component("comp-1", "title", json!("Renamed"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let diff = client.compare_snapshots(&three.id, None).await.unwrap();
    assert_eq!(diff["count"].before, Some(json!(3)));
    assert_eq!(diff["count"].after, Some(json!(4)));
    assert_eq!(diff["title"].after, Some(json!("Renamed")));

    let applied = client.restore_snapshot(&three.id).await.unwrap();
    assert_eq!(applied, 2);
    let data = session.host.data("counter").unwrap();
    assert_eq!(data["count"], json!(3));
    assert_eq!(data["title"], json!("My Counter"));
    assert_eq!(data["token"], json!("t"));

    let renamed = client.rename_snapshot(&three.id, "checkpoint").await.unwrap();
    assert_eq!(renamed.name, "checkpoint");
}

#[tokio::test]
async fn export_then_import_keeps_both_copies() {
    let session = session().await;
    let client = &session.client;

    let original = client.create_snapshot("comp-1", Some("start")).await.unwrap();
    let bundle = client.export_snapshots("comp-1").await.unwrap();
    assert!(bundle.snapshots.iter().any(|s| s.id == original.id));

    let imported = client.import_snapshots(&bundle).await.unwrap();
    assert_eq!(imported.len(), bundle.snapshots.len());
    assert!(imported.iter().all(|s| s.component_id == "comp-1"));
    assert!(imported.iter().all(|s| s.id != original.id));

    let stored = client.get_snapshots(Some("comp-1")).await.unwrap();
    assert!(stored.iter().any(|s| s.id == original.id));

    let deleted = client.delete_snapshot(&original.id).await.unwrap();
    assert_eq!(deleted.id, original.id);
    let err = client.delete_snapshot(&original.id).await.unwrap_err();
    assert_eq!(err.reason(), Some(Reason::NotFound));
}

#[tokio::test]
async fn invalid_edits_are_rejected_before_the_page() {
    let session = session().await;
    let client = &session.client;

    let forbidden = client
        .update_component("comp-1", "token", json!("stolen"))
        .await
        .unwrap_err();
    assert_eq!(forbidden.reason(), Some(Reason::Forbidden));

    let invalid = client
        .update_component("comp-1", "count", json!("many"))
        .await
        .unwrap_err();
    assert_eq!(invalid.reason(), Some(Reason::Invalid));

    let missing = client
        .update_component("comp-404", "count", json!(1))
        .await
        .unwrap_err();
    assert_eq!(missing.reason(), Some(Reason::NotFound));

    assert_eq!(session.host.data("counter").unwrap()["count"], json!(0));
    assert!(session.host.calls().is_empty());
}

#[tokio::test]
async fn status_and_clear() {
    let session = session().await;
    let client = &session.client;

    let reports = client.connection_status().await.unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.status == ConnectionStatus::Healthy));

    client.clear_data().await.unwrap();
    assert!(client.get_components().await.unwrap().is_empty());

    session.relay.stop();
    let err = client
        .request(Action::GetComponents, json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Disconnected | ClientError::Timeout(_)));
}

#[tokio::test]
async fn snapshots_survive_a_relay_restart() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::new(dir.path()));

    let relay = Relay::new(Context::with_storage(Settings::default(), storage.clone()));
    let host = page();
    let observer = Observer::new(host, EventBus::new());
    observer.initialize().unwrap();
    let (near, far) = Port::pair();
    observer.connect(near);
    relay.attach_observer(observer.session_id(), far);
    let (near, far) = Port::pair();
    relay.attach_presentation(far);
    let client = PresentationClient::connect(near, Duration::from_secs(2));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let saved = client.create_snapshot("comp-1", Some("keep")).await.unwrap();
    client.close();
    relay.stop();

    let context = Context::with_storage(Settings::default(), storage);
    context.restore().await.unwrap();
    let restored = context.snapshots().get_component_snapshots("comp-1").await;
    assert!(restored.iter().any(|s| s.id == saved.id && s.name == "keep"));
}
