//! The presentation client.
//!
//! Speaks the relay's command surface over a [`Port`], correlates each
//! `RESPONSE` with its request by timestamp, and keeps an [`InspectorView`]
//! current from the relay's broadcasts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use statescope_sdk::{HealthSettings, Port, PortSender};
use statescope_types::{
    current_timestamp_ms, Action, Component, ConnectionReport, Envelope, Reply, Snapshot,
    SnapshotBundle, StateDiff, TimelineEvent,
};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::source::ViewSource;
use crate::view::InspectorView;

struct ClientInner {
    sender: PortSender,
    pending: Mutex<HashMap<u64, oneshot::Sender<Envelope>>>,
    last_stamp: Mutex<u64>,
    timeout: Duration,
    view: watch::Sender<InspectorView>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// A presentation endpoint connected to a relay.
///
/// Cloning is cheap; clones share the port and the view.
#[derive(Clone)]
pub struct PresentationClient {
    inner: Arc<ClientInner>,
}

impl PresentationClient {
    /// Start a client over `port`. Requests without an answer after
    /// `timeout` fail with [`ClientError::Timeout`]. Must be called within a
    /// tokio runtime.
    pub fn connect(port: Port, timeout: Duration) -> Self {
        let (sender, mut receiver) = port.split();
        let (view, _) = watch::channel(InspectorView::default());
        let inner = Arc::new(ClientInner {
            sender,
            pending: Mutex::new(HashMap::new()),
            last_stamp: Mutex::new(0),
            timeout,
            view,
            reader: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let reader = tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.on_envelope(envelope);
            }
            if let Some(inner) = weak.upgrade() {
                // Dropping the waiters' senders fails them with `Disconnected`.
                inner.pending.lock().clear();
                debug!("Relay port closed");
            }
        });
        *inner.reader.lock() = Some(reader);

        Self { inner }
    }

    /// Start a client using the request timeout from `settings`.
    pub fn with_settings(port: Port, settings: &HealthSettings) -> Self {
        Self::connect(port, settings.request_timeout())
    }

    /// Send a request and wait for its `RESPONSE`.
    pub async fn request(&self, action: Action, payload: Value) -> Result<Value, ClientError> {
        self.send_request(Envelope::new(action, payload)).await
    }

    /// Send a request addressed to one observer session.
    pub async fn request_to(
        &self,
        session_id: &str,
        action: Action,
        payload: Value,
    ) -> Result<Value, ClientError> {
        self.send_request(Envelope::new(action, payload).with_target(session_id))
            .await
    }

    async fn send_request(&self, envelope: Envelope) -> Result<Value, ClientError> {
        let action = envelope.action;
        let stamp = self.next_stamp();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(stamp, tx);

        if self.inner.sender.send(envelope.with_timestamp(stamp)).is_err() {
            self.inner.pending.lock().remove(&stamp);
            return Err(ClientError::Disconnected);
        }

        let response = match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(ClientError::Disconnected),
            Err(_) => {
                self.inner.pending.lock().remove(&stamp);
                return Err(ClientError::Timeout(action));
            }
        };

        let reply: Reply = serde_json::from_value(response.payload)?;
        reply
            .into_result()
            .map_err(|(reason, message)| ClientError::Remote {
                action,
                reason,
                message,
            })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        action: Action,
        payload: Value,
    ) -> Result<T, ClientError> {
        let data = self.request(action, payload).await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Strictly increasing, so concurrent requests never share a timestamp.
    fn next_stamp(&self) -> u64 {
        let mut last = self.inner.last_stamp.lock();
        *last = current_timestamp_ms().max(*last + 1);
        *last
    }

    // ========================================================================
    // Components
    // ========================================================================

    pub async fn get_components(&self) -> Result<Vec<Component>, ClientError> {
        self.call(Action::GetComponents, Value::Null).await
    }

    /// Edit a property on the live component. Validation happens at the
    /// relay; the observer applies it through the component's own setter.
    pub async fn update_component(
        &self,
        component_id: &str,
        property: &str,
        value: Value,
    ) -> Result<(), ClientError> {
        self.request(
            Action::UpdateComponent,
            json!({"componentId": component_id, "property": property, "value": value}),
        )
        .await
        .map(|_| ())
    }

    pub async fn execute_method(
        &self,
        component_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ClientError> {
        self.request(
            Action::ExecuteMethod,
            json!({"componentId": component_id, "method": method, "args": args}),
        )
        .await
    }

    pub async fn highlight_component(&self, component_id: &str) -> Result<(), ClientError> {
        self.request(Action::HighlightComponent, json!({"componentId": component_id}))
            .await
            .map(|_| ())
    }

    // ========================================================================
    // Timeline
    // ========================================================================

    pub async fn get_events(&self) -> Result<Vec<TimelineEvent>, ClientError> {
        self.call(Action::GetEvents, Value::Null).await
    }

    pub async fn get_events_between(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<TimelineEvent>, ClientError> {
        self.call(Action::GetEvents, json!({"start": start, "end": end})).await
    }

    pub async fn get_queries(&self) -> Result<Vec<TimelineEvent>, ClientError> {
        self.call(Action::GetQueries, Value::Null).await
    }

    /// Drop the relay's component index and event history.
    pub async fn clear_data(&self) -> Result<(), ClientError> {
        self.request(Action::ClearData, Value::Null).await.map(|_| ())
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub async fn create_snapshot(
        &self,
        component_id: &str,
        name: Option<&str>,
    ) -> Result<Snapshot, ClientError> {
        self.call(
            Action::CreateSnapshot,
            json!({"componentId": component_id, "name": name}),
        )
        .await
    }

    /// Snapshots of one component, or of every component.
    pub async fn get_snapshots(
        &self,
        component_id: Option<&str>,
    ) -> Result<Vec<Snapshot>, ClientError> {
        self.call(Action::GetSnapshots, json!({"componentId": component_id}))
            .await
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<Snapshot, ClientError> {
        self.call(Action::DeleteSnapshot, json!({"snapshotId": snapshot_id}))
            .await
    }

    pub async fn rename_snapshot(
        &self,
        snapshot_id: &str,
        name: &str,
    ) -> Result<Snapshot, ClientError> {
        self.call(
            Action::RenameSnapshot,
            json!({"snapshotId": snapshot_id, "name": name}),
        )
        .await
    }

    /// Diff two snapshots, or a snapshot against the component's current
    /// state when `other` is `None`.
    pub async fn compare_snapshots(
        &self,
        snapshot_id: &str,
        other: Option<&str>,
    ) -> Result<StateDiff, ClientError> {
        self.call(
            Action::CompareSnapshots,
            json!({"snapshotId": snapshot_id, "otherId": other}),
        )
        .await
    }

    /// Write a snapshot's editable properties back into the live component.
    /// Returns how many properties were applied.
    pub async fn restore_snapshot(&self, snapshot_id: &str) -> Result<u64, ClientError> {
        let data = self
            .request(Action::RestoreSnapshot, json!({"snapshotId": snapshot_id}))
            .await?;
        Ok(data.get("applied").and_then(Value::as_u64).unwrap_or(0))
    }

    pub async fn export_snapshots(
        &self,
        component_id: &str,
    ) -> Result<SnapshotBundle, ClientError> {
        self.call(Action::ExportSnapshots, json!({"componentId": component_id}))
            .await
    }

    pub async fn import_snapshots(
        &self,
        bundle: &SnapshotBundle,
    ) -> Result<Vec<Snapshot>, ClientError> {
        let bundle = serde_json::to_value(bundle)?;
        self.call(Action::ImportSnapshots, json!({"bundle": bundle})).await
    }

    // ========================================================================
    // Connections and view
    // ========================================================================

    pub async fn connection_status(&self) -> Result<Vec<ConnectionReport>, ClientError> {
        self.call(Action::GetConnectionStatus, Value::Null).await
    }

    /// Current view.
    pub fn view(&self) -> InspectorView {
        self.inner.view.borrow().clone()
    }

    /// A source that sees every view update from now on.
    pub fn watch(&self) -> ViewSource {
        ViewSource::new(self.inner.view.subscribe(), "presentation")
    }

    /// Reload the component set from the relay into the view.
    pub async fn refresh(&self) -> Result<InspectorView, ClientError> {
        let components = self.get_components().await?;
        self.inner
            .view
            .send_modify(|view| view.reset_components(components));
        Ok(self.view())
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.sender.is_closed()
            && self
                .inner
                .reader
                .lock()
                .as_ref()
                .is_some_and(|reader| !reader.is_finished())
    }

    /// Stop reading from the relay. Outstanding requests fail with
    /// [`ClientError::Disconnected`].
    pub fn close(&self) {
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        self.inner.pending.lock().clear();
    }
}

impl ClientInner {
    fn on_envelope(&self, envelope: Envelope) {
        match envelope.action {
            Action::Response => match self.pending.lock().remove(&envelope.timestamp) {
                Some(waiter) => {
                    let _ = waiter.send(envelope);
                }
                None => debug!(
                    stamp = envelope.timestamp,
                    "Response for unknown or expired request"
                ),
            },
            Action::Ping => {
                let pong =
                    Envelope::new(Action::Pong, Value::Null).with_timestamp(envelope.timestamp);
                if self.sender.send(pong).is_err() {
                    warn!("Failed to answer relay ping");
                }
            }
            _ => {
                self.view.send_if_modified(|view| view.apply(&envelope));
            }
        }
    }
}

impl std::fmt::Debug for PresentationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentationClient")
            .field("pending", &self.inner.pending.lock().len())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statescope_types::Reason;

    /// A fake relay that answers every request with `reply` and records it.
    fn fake_relay(reply: Reply) -> (Port, Arc<Mutex<Vec<Envelope>>>) {
        let (near, far) = Port::pair();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let (sender, mut receiver) = far.split();
        tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                s.lock().push(request.clone());
                let _ = sender.send(Envelope::response_to(&request, reply.clone()));
            }
        });
        (near, seen)
    }

    #[tokio::test]
    async fn responses_are_matched_by_timestamp() {
        let (port, seen) = fake_relay(Reply::ok(json!([])));
        let client = PresentationClient::connect(port, Duration::from_secs(1));

        let (a, b) = tokio::join!(client.get_components(), client.get_events());
        assert!(a.unwrap().is_empty());
        assert!(b.unwrap().is_empty());

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0].timestamp, seen[1].timestamp);
    }

    #[tokio::test]
    async fn remote_errors_carry_the_reason() {
        let (port, _) = fake_relay(Reply::error(Reason::Forbidden, "double is computed"));
        let client = PresentationClient::connect(port, Duration::from_secs(1));

        let err = client
            .update_component("comp-1", "double", json!(2))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(Reason::Forbidden));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_relay_times_out() {
        let (near, _far) = Port::pair();
        let client = PresentationClient::connect(near, Duration::from_millis(200));

        let err = client.get_components().await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(Action::GetComponents)));
        assert!(client.inner.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn closed_relay_fails_requests() {
        let (near, far) = Port::pair();
        let client = PresentationClient::connect(near, Duration::from_secs(1));
        drop(far);

        let err = client.get_components().await.unwrap_err();
        assert!(matches!(err, ClientError::Disconnected));
    }

    #[tokio::test]
    async fn broadcasts_update_the_view_and_pings_are_answered() {
        let (near, far) = Port::pair();
        let client = PresentationClient::connect(near, Duration::from_secs(1));
        let mut source = client.watch();
        let (relay_tx, mut relay_rx) = far.split();

        let component = Component::builder("comp-1", "Counter").property("count", json!(0)).build();
        relay_tx
            .send(Envelope::new(Action::ComponentAdded, serde_json::to_value(&component).unwrap()))
            .unwrap();
        let view = source.changed().await.unwrap();
        assert!(view.components.contains_key("comp-1"));

        relay_tx
            .send(Envelope::new(Action::Ping, Value::Null).with_timestamp(55))
            .unwrap();
        let pong = relay_rx.recv().await.unwrap();
        assert_eq!(pong.action, Action::Pong);
        assert_eq!(pong.timestamp, 55);

        client.close();
        assert!(!client.is_connected());
    }
}
