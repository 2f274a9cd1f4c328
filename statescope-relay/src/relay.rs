//! The relay: routes envelopes between observers and presentations.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};
use statescope_sdk::{Context, Ingested, Port, TaskHandle};
use statescope_types::{
    current_timestamp_ms, Action, Component, ComponentId, ConnectionReport, ConnectionRole,
    ConnectionStatus, Envelope, IngestRecord, Reason, Reply, TimelineEvent,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connector::Connector;
use crate::health::HealthConfig;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::RelayError;

/// Bus topic published when a connection runs out of reconnect attempts.
pub const TOPIC_CONNECTION_FAILED: &str = "connection:failed";

/// A command forwarded to an observer, awaiting its `RESPONSE`.
struct PendingRequest {
    presentation: ConnectionId,
    observer: ConnectionId,
    request: Envelope,
    forwarded_at: u64,
}

#[derive(Default)]
struct RelayState {
    registry: ConnectionRegistry,
    /// Which observer connection reported each component.
    owners: HashMap<ComponentId, ConnectionId>,
    /// Keyed by the relay-stamped timestamp of the forwarded envelope.
    pending: HashMap<u64, PendingRequest>,
    monitor: Option<TaskHandle>,
    last_stamp: u64,
    stopped: bool,
}

struct RelayInner {
    context: Context,
    health: HealthConfig,
    state: Mutex<RelayState>,
}

/// Result of handling one presentation request.
enum Outcome {
    Reply(Value),
    /// The request went to an observer; its response is relayed later.
    Forwarded,
}

/// Message broker between observers and presentations.
///
/// The relay owns a [`Context`]: observer reports are merged into its
/// component processor, its event bus keeps the timeline, and its snapshot
/// manager serves the time-travel commands.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    /// Create a relay over `context`. Health settings are taken from the
    /// context's settings.
    pub fn new(context: Context) -> Self {
        let health = HealthConfig::from(&context.settings().health);
        Self::with_health(context, health)
    }

    pub fn with_health(context: Context, health: HealthConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                context,
                health,
                state: Mutex::new(RelayState::default()),
            }),
        }
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn health_config(&self) -> &HealthConfig {
        &self.inner.health
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the periodic ping task. A running monitor is replaced.
    pub fn start(&self) {
        let weak = Arc::downgrade(&self.inner);
        let monitor = TaskHandle::spawn_periodic(self.inner.health.ping_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(relay) = upgrade(&weak) {
                    relay.health_tick();
                }
            }
        });

        let mut state = self.inner.state.lock();
        state.stopped = false;
        state.monitor = Some(monitor);
        info!(interval = ?self.inner.health.ping_interval, "Relay health monitor started");
    }

    /// Cancel the health monitor, then drop every connection and the
    /// context's subscriptions.
    pub fn stop(&self) {
        let monitor = {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            state.monitor.take()
        };
        drop(monitor);

        {
            let mut state = self.inner.state.lock();
            state.pending.clear();
            state.owners.clear();
            state.registry.clear();
        }
        self.inner.context.shutdown();
        info!("Relay stopped");
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Register a presentation endpoint.
    pub fn attach_presentation(&self, port: Port) -> ConnectionId {
        self.attach(ConnectionRole::Presentation, None, port)
    }

    /// Register an observer endpoint that cannot be reconnected. Once its
    /// port closes or it stops answering pings it is removed.
    pub fn attach_observer(&self, session_id: impl Into<String>, port: Port) -> ConnectionId {
        let role = ConnectionRole::Observer {
            session_id: session_id.into(),
        };
        self.attach(role, None, port)
    }

    /// Open a reconnectable observer connection through `connector`.
    pub async fn connect_observer(
        &self,
        session_id: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> Result<ConnectionId, RelayError> {
        let port = connector.connect(0).await?;
        let role = ConnectionRole::Observer {
            session_id: session_id.into(),
        };
        Ok(self.attach(role, Some(connector), port))
    }

    fn attach(&self, role: ConnectionRole, connector: Option<Arc<dyn Connector>>, port: Port) -> ConnectionId {
        let id = {
            let mut state = self.inner.state.lock();
            state.registry.insert(role.clone(), connector, self.inner.health)
        };
        self.install_port(id, port);
        info!(connection = id, role = ?role, "Connection attached");
        id
    }

    /// Remove a connection and everything routed through it.
    pub fn detach(&self, id: ConnectionId) -> bool {
        let mut state = self.inner.state.lock();
        let Some(connection) = state.registry.remove(id) else {
            return false;
        };
        release_routes(&mut state, id);
        drop(connection);
        debug!(connection = id, "Connection detached");
        true
    }

    pub fn connections(&self) -> Vec<ConnectionReport> {
        self.inner.state.lock().registry.reports()
    }

    pub fn connection_status(&self, id: ConnectionId) -> Option<ConnectionStatus> {
        self.inner.state.lock().registry.status(id)
    }

    /// Observer connection that reported a component.
    pub fn owner_of(&self, component_id: &str) -> Option<ConnectionId> {
        self.inner.state.lock().owners.get(component_id).copied()
    }

    fn install_port(&self, id: ConnectionId, port: Port) {
        let (sender, receiver) = port.split();
        let mut state = self.inner.state.lock();
        let Some(connection) = state.registry.get_mut(id) else {
            return;
        };
        connection.teardown();
        connection.generation += 1;
        connection.sender = Some(sender);
        connection.health.mark_connected();
        connection.reader = Some(self.spawn_reader(id, connection.generation, receiver));

        let report = connection.report(id);
        broadcast(&mut state, status_envelope(&report, None));
    }

    fn spawn_reader(
        &self,
        id: ConnectionId,
        generation: u64,
        mut receiver: UnboundedReceiver<Envelope>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                let Some(relay) = upgrade(&weak) else {
                    return;
                };
                relay.dispatch(id, envelope).await;
            }
            if let Some(relay) = upgrade(&weak) {
                relay.on_port_closed(id, generation);
            }
        })
    }

    /// Port closure is the disconnect signal. Per-connection state is
    /// released here, before anything else can observe it.
    fn on_port_closed(&self, id: ConnectionId, generation: u64) {
        let mut state = self.inner.state.lock();
        let current = state.registry.get(id).map(|c| c.generation);
        if current != Some(generation) {
            return;
        }
        debug!(connection = id, "Port closed");
        self.lose_channel(&mut state, id);
    }

    /// Tear down a channel that closed or went silent. Observers with a
    /// connector are scheduled for reconnection; everything else is removed.
    fn lose_channel(&self, state: &mut RelayState, id: ConnectionId) {
        let stopped = state.stopped;
        let Some(connection) = state.registry.get_mut(id) else {
            return;
        };
        connection.teardown();
        connection.health.mark_disconnected();
        let reconnectable = connection.connector.is_some() && !stopped;
        let report = connection.report(id);

        fail_pending(state, id);
        if reconnectable {
            broadcast(state, status_envelope(&report, None));
            let task = self.spawn_reconnect(id);
            if let Some(connection) = state.registry.get_mut(id) {
                connection.reconnect = Some(task);
            }
        } else {
            state.registry.remove(id);
            release_routes(state, id);
            broadcast(state, status_envelope(&report, None));
        }
    }

    fn spawn_reconnect(&self, id: ConnectionId) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let Some(relay) = upgrade(&weak) else {
                    return;
                };
                let step = {
                    let mut state = relay.inner.state.lock();
                    let Some(connection) = state.registry.get_mut(id) else {
                        return;
                    };
                    connection
                        .health
                        .next_backoff()
                        .map(|delay| (delay, connection.health.attempts(), connection.connector.clone()))
                };

                let Some((delay, attempt, Some(connector))) = step else {
                    relay.on_exhausted(id);
                    return;
                };
                drop(relay);

                tokio::time::sleep(delay).await;
                match connector.connect(attempt).await {
                    Ok(port) => {
                        if let Some(relay) = upgrade(&weak) {
                            relay.install_port(id, port);
                            info!(connection = id, attempt, "Reconnected");
                        }
                        return;
                    }
                    Err(e) => warn!(connection = id, attempt, error = %e, "Reconnect attempt failed"),
                }
            }
        })
    }

    fn on_exhausted(&self, id: ConnectionId) {
        let attempts = self.inner.health.max_reconnect_attempts;
        let report = {
            let mut state = self.inner.state.lock();
            let Some(connection) = state.registry.get_mut(id) else {
                return;
            };
            connection.health.mark_failed();
            let report = connection.report(id);
            broadcast(&mut state, status_envelope(&report, Some(Reason::ChannelExhausted)));
            report
        };

        error!(connection = id, attempts, "Connection failed, reconnect attempts exhausted");
        self.inner.context.bus().publish(
            TOPIC_CONNECTION_FAILED,
            json!({
                "connectionId": id,
                "sessionId": report.role.session_id(),
                "attempts": attempts,
                "reason": Reason::ChannelExhausted,
            }),
        );
    }

    /// One health-monitor tick: ping every live connection, tear down
    /// zombies and expire forwarded requests nobody answered.
    fn health_tick(&self) {
        let now = current_timestamp_ms();
        let mut state = self.inner.state.lock();
        if state.stopped {
            return;
        }

        let mut zombies = Vec::new();
        let mut changed = Vec::new();
        for id in state.registry.pingable() {
            let Some(connection) = state.registry.get_mut(id) else {
                continue;
            };
            let before = connection.health.status();
            let status = connection.health.ping_sent(now);
            if status == ConnectionStatus::Unhealthy {
                warn!(
                    connection = id,
                    missed = connection.health.missed_pongs(),
                    "Connection stopped answering pings"
                );
                zombies.push(id);
            } else {
                connection.send(Envelope::new(Action::Ping, Value::Null).with_timestamp(now));
                if status != before {
                    changed.push(connection.report(id));
                }
            }
        }

        for report in changed {
            broadcast(&mut state, status_envelope(&report, None));
        }
        for id in zombies {
            self.lose_channel(&mut state, id);
        }

        self.expire_pending(&mut state, now);
    }

    /// Drop forwarded requests older than the configured request timeout.
    fn expire_pending(&self, state: &mut RelayState, now: u64) {
        let timeout = self.inner.context.settings().health.request_timeout_ms;
        state.pending.retain(|stamp, pending| {
            let live = now.saturating_sub(pending.forwarded_at) <= timeout;
            if !live {
                debug!(observer = pending.observer, stamp = *stamp, "Forwarded request expired");
            }
            live
        });
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    async fn dispatch(&self, id: ConnectionId, envelope: Envelope) {
        let role = {
            let mut state = self.inner.state.lock();
            let Some(connection) = state.registry.get_mut(id) else {
                return;
            };
            connection.health.record_received();
            connection.role.clone()
        };

        match envelope.action {
            Action::Ping => {
                let pong = Envelope::new(Action::Pong, Value::Null).with_timestamp(envelope.timestamp);
                self.send_to(id, pong);
                return;
            }
            Action::Pong => {
                if let Some(connection) = self.inner.state.lock().registry.get_mut(id) {
                    connection
                        .health
                        .pong_received(envelope.timestamp, current_timestamp_ms());
                }
                return;
            }
            Action::Unknown => {
                debug!(connection = id, "Dropping envelope with unknown action");
                return;
            }
            _ => {}
        }

        match role {
            ConnectionRole::Observer { .. } => self.handle_observer(id, envelope).await,
            ConnectionRole::Presentation => self.handle_presentation(id, envelope).await,
        }
    }

    async fn handle_observer(&self, id: ConnectionId, envelope: Envelope) {
        match envelope.action {
            Action::ComponentAdded | Action::ComponentUpdated => {
                let component: Component = match envelope.decode_payload() {
                    Ok(component) => component,
                    Err(e) => {
                        warn!(connection = id, error = %e, "Dropping malformed component report");
                        return;
                    }
                };
                self.store_component(id, component, envelope).await;
            }
            Action::ComponentRemoved => {
                let Some(component_id) = envelope.payload.get("componentId").and_then(Value::as_str) else {
                    warn!(connection = id, "Dropping removal without componentId");
                    return;
                };
                if let Err(e) = self.inner.context.processor().remove_component(component_id).await {
                    warn!(component = component_id, error = %e, "Failed to persist removal");
                }
                let mut state = self.inner.state.lock();
                if state.owners.get(component_id) == Some(&id) {
                    state.owners.remove(component_id);
                }
                broadcast(&mut state, envelope);
            }
            Action::EventRecorded => match envelope.decode_payload::<TimelineEvent>() {
                Ok(event) => {
                    self.inner.context.bus().publish_event(event);
                    broadcast(&mut self.inner.state.lock(), envelope);
                }
                Err(e) => warn!(connection = id, error = %e, "Dropping malformed event"),
            },
            Action::Ingest => {
                let record: IngestRecord = match envelope.decode_payload() {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(connection = id, error = %e, "Dropping malformed ingest record");
                        return;
                    }
                };
                match self.inner.context.ingest(record).await {
                    Ok(Ingested::Component(component)) => {
                        let mut state = self.inner.state.lock();
                        state.owners.insert(component.id.clone(), id);
                        if let Ok(payload) = serde_json::to_value(&component) {
                            broadcast(&mut state, Envelope::new(Action::ComponentUpdated, payload));
                        }
                    }
                    Ok(Ingested::Event(event)) => {
                        if let Ok(payload) = serde_json::to_value(&event) {
                            let notice = Envelope::new(Action::EventRecorded, payload)
                                .with_timestamp(event.timestamp);
                            broadcast(&mut self.inner.state.lock(), notice);
                        }
                    }
                    Err(e) => warn!(connection = id, error = %e, "Rejected ingest record"),
                }
            }
            Action::Response => self.relay_response(id, envelope),
            other => debug!(connection = id, action = ?other, "Dropping unexpected observer action"),
        }
    }

    async fn store_component(&self, id: ConnectionId, component: Component, envelope: Envelope) {
        match self.inner.context.processor().process_component(component).await {
            Ok(stored) => {
                let mut state = self.inner.state.lock();
                state.owners.insert(stored.id, id);
                broadcast(&mut state, envelope);
            }
            Err(e) => warn!(connection = id, error = %e, "Failed to store component"),
        }
    }

    /// Hand an observer's answer back to the presentation that asked,
    /// under the presentation's original timestamp.
    fn relay_response(&self, observer: ConnectionId, envelope: Envelope) {
        let mut state = self.inner.state.lock();
        let Some(pending) = state.pending.remove(&envelope.timestamp) else {
            debug!(connection = observer, stamp = envelope.timestamp, "Response without pending request");
            return;
        };
        if pending.observer != observer {
            debug!(connection = observer, "Response from unexpected connection");
            return;
        }

        let response = Envelope {
            action: Action::Response,
            payload: envelope.payload,
            target: pending.request.target.clone(),
            timestamp: pending.request.timestamp,
        };
        if let Some(connection) = state.registry.get_mut(pending.presentation) {
            connection.send(response);
        }
    }

    async fn handle_presentation(&self, id: ConnectionId, envelope: Envelope) {
        if !envelope.action.is_request() {
            debug!(connection = id, action = ?envelope.action, "Dropping non-request from presentation");
            return;
        }

        let reply = match self.handle_request(id, &envelope).await {
            Ok(Outcome::Forwarded) => return,
            Ok(Outcome::Reply(data)) => Reply::ok(data),
            Err(e) => {
                debug!(connection = id, action = ?envelope.action, error = %e, "Request failed");
                e.to_reply()
            }
        };
        self.send_to(id, Envelope::response_to(&envelope, reply));
    }

    async fn handle_request(&self, id: ConnectionId, request: &Envelope) -> Result<Outcome, RelayError> {
        let context = &self.inner.context;
        let payload = &request.payload;

        let data = match request.action {
            Action::GetComponents => to_value(context.processor().get_components().await)?,

            Action::UpdateComponent => {
                let component_id = str_field(payload, "componentId")?;
                let property = str_field(payload, "property")?;
                let value = payload
                    .get("value")
                    .cloned()
                    .ok_or_else(|| RelayError::Invalid("missing value".into()))?;

                let value = context
                    .processor()
                    .validate_property_edit(component_id, property, &value)
                    .await?;
                let update = context
                    .processor()
                    .prepare_property_update_payload(component_id, property, value)
                    .await?;
                return self.forward(id, request, Action::UpdateComponent, to_value(update)?, component_id);
            }

            Action::ExecuteMethod => {
                let component_id = str_field(payload, "componentId")?;
                let method = str_field(payload, "method")?;
                let component = self.component(component_id).await?;
                if component.method(method).is_none() {
                    return Err(statescope_sdk::Error::NotFound(format!("method {} on {}", method, component_id)).into());
                }
                return self.forward(id, request, Action::ExecuteMethod, payload.clone(), component_id);
            }

            Action::HighlightComponent => {
                let component_id = str_field(payload, "componentId")?;
                self.component(component_id).await?;
                return self.forward(id, request, Action::HighlightComponent, payload.clone(), component_id);
            }

            Action::GetEvents => {
                let bus = context.bus();
                let events = match (
                    payload.get("start").and_then(Value::as_u64),
                    payload.get("end").and_then(Value::as_u64),
                ) {
                    (Some(start), Some(end)) => bus.events_by_time_range(start, end),
                    _ => match payload.get("type").and_then(Value::as_str) {
                        Some(kind) => bus.filtered_events(|e| e.event_type == kind),
                        None => bus.history(),
                    },
                };
                to_value(events)?
            }

            Action::GetQueries => {
                let topic = statescope_types::RecordKind::Query.topic();
                to_value(context.bus().filtered_events(|e| e.event_type == topic))?
            }

            Action::ClearData => {
                context.processor().clear_components().await?;
                context.bus().clear_history();
                let mut state = self.inner.state.lock();
                state.owners.clear();
                broadcast(&mut state, Envelope::new(Action::DataCleared, Value::Null));
                json!({"cleared": true})
            }

            Action::CreateSnapshot => {
                let component = self.component(str_field(payload, "componentId")?).await?;
                let name = payload.get("name").and_then(Value::as_str);
                to_value(context.snapshots().create_snapshot(&component, name).await?)?
            }

            Action::GetSnapshots => match payload.get("componentId").and_then(Value::as_str) {
                Some(component_id) => to_value(context.snapshots().get_component_snapshots(component_id).await)?,
                None => to_value(context.snapshots().all_snapshots().await)?,
            },

            Action::DeleteSnapshot => {
                to_value(context.snapshots().delete_snapshot(str_field(payload, "snapshotId")?).await?)?
            }

            Action::RenameSnapshot => {
                let snapshot_id = str_field(payload, "snapshotId")?;
                let name = str_field(payload, "name")?;
                to_value(context.snapshots().rename_snapshot(snapshot_id, name).await?)?
            }

            Action::CompareSnapshots => {
                let first = str_field(payload, "snapshotId")?;
                let diff = match payload.get("otherId").and_then(Value::as_str) {
                    Some(second) => context.snapshots().compare_snapshots(first, second).await?,
                    None => {
                        let snapshot = context.snapshots().restore_snapshot(first).await?;
                        let current = self.component(&snapshot.component_id).await?;
                        context
                            .snapshots()
                            .compare_with_current_state(first, &current.state())
                            .await?
                    }
                };
                to_value(diff)?
            }

            Action::RestoreSnapshot => {
                let snapshot = context
                    .snapshots()
                    .restore_snapshot(str_field(payload, "snapshotId")?)
                    .await?;
                let current = self.component(&snapshot.component_id).await?;

                // Only properties the live component still accepts edits for.
                let state: serde_json::Map<String, Value> = snapshot
                    .state
                    .iter()
                    .filter(|(name, _)| current.properties.get(*name).is_some_and(|p| p.is_editable()))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                let apply = json!({
                    "componentId": current.id,
                    "fingerprint": current.fingerprint,
                    "snapshotId": snapshot.id,
                    "state": state,
                });
                return self.forward(id, request, Action::ApplyState, apply, &current.id);
            }

            Action::ExportSnapshots => {
                to_value(context.snapshots().export_snapshots(str_field(payload, "componentId")?).await?)?
            }

            Action::ImportSnapshots => {
                let bundle = payload.get("bundle").unwrap_or(payload);
                to_value(context.snapshots().import_snapshots(bundle).await?)?
            }

            Action::GetConnectionStatus => to_value(self.connections())?,

            other => return Err(RelayError::Invalid(format!("{:?} is not a request", other))),
        };

        Ok(Outcome::Reply(data))
    }

    async fn component(&self, id: &str) -> Result<Component, RelayError> {
        self.inner
            .context
            .processor()
            .get_component(id)
            .await
            .ok_or_else(|| RelayError::NoRoute(format!("component {}", id)))
    }

    /// Send a command to the observer owning `component_id` (or the session
    /// named in the request's target) and remember who asked.
    fn forward(
        &self,
        presentation: ConnectionId,
        request: &Envelope,
        action: Action,
        payload: Value,
        component_id: &str,
    ) -> Result<Outcome, RelayError> {
        let mut state = self.inner.state.lock();

        let target = match request.target.as_deref() {
            Some(session) => state
                .registry
                .observer_by_session(session)
                .ok_or_else(|| RelayError::NoRoute(format!("session {}", session)))?,
            None => *state
                .owners
                .get(component_id)
                .ok_or_else(|| RelayError::NoRoute(format!("owner of {}", component_id)))?,
        };

        let stamp = next_stamp(&mut state);
        let connection = state
            .registry
            .get_mut(target)
            .ok_or(RelayError::UnknownConnection(target))?;
        match connection.health.status() {
            ConnectionStatus::Failed => {
                return Err(RelayError::Exhausted {
                    connection: target,
                    attempts: connection.health.config().max_reconnect_attempts,
                })
            }
            status if !status.is_usable() || connection.sender.is_none() => {
                return Err(RelayError::Unhealthy(target))
            }
            _ => {}
        }

        let mut envelope = Envelope::new(action, payload).with_timestamp(stamp);
        if let Some(session) = connection.role.session_id() {
            envelope = envelope.with_target(session);
        }
        if !connection.send(envelope) {
            return Err(RelayError::Unhealthy(target));
        }

        let now = current_timestamp_ms();
        self.expire_pending(&mut state, now);
        state.pending.insert(
            stamp,
            PendingRequest {
                presentation,
                observer: target,
                request: request.clone(),
                forwarded_at: now,
            },
        );
        debug!(observer = target, action = ?action, stamp, "Forwarded command");
        Ok(Outcome::Forwarded)
    }

    fn send_to(&self, id: ConnectionId, envelope: Envelope) -> bool {
        self.inner
            .state
            .lock()
            .registry
            .get_mut(id)
            .is_some_and(|connection| connection.send(envelope))
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Relay")
            .field("connections", &state.registry.len())
            .field("owners", &state.owners.len())
            .field("pending", &state.pending.len())
            .field("monitoring", &state.monitor.is_some())
            .finish()
    }
}

fn upgrade(weak: &Weak<RelayInner>) -> Option<Relay> {
    weak.upgrade().map(|inner| Relay { inner })
}

/// Strictly increasing relay timestamp, used to correlate forwarded commands.
fn next_stamp(state: &mut RelayState) -> u64 {
    state.last_stamp = current_timestamp_ms().max(state.last_stamp + 1);
    state.last_stamp
}

fn broadcast(state: &mut RelayState, envelope: Envelope) {
    for id in state.registry.presentations() {
        if let Some(connection) = state.registry.get_mut(id) {
            connection.send(envelope.clone());
        }
    }
}

fn status_envelope(report: &ConnectionReport, reason: Option<Reason>) -> Envelope {
    Envelope::new(
        Action::ConnectionStatus,
        json!({"connection": report, "reason": reason}),
    )
}

/// Answer every request forwarded to `observer` with `ChannelUnhealthy`, and
/// forget requests issued by it if it was a presentation.
fn fail_pending(state: &mut RelayState, id: ConnectionId) {
    let stamps: Vec<u64> = state
        .pending
        .iter()
        .filter(|(_, p)| p.observer == id || p.presentation == id)
        .map(|(stamp, _)| *stamp)
        .collect();

    for stamp in stamps {
        let Some(pending) = state.pending.remove(&stamp) else {
            continue;
        };
        if pending.observer != id {
            continue;
        }
        let reply = RelayError::Unhealthy(id).to_reply();
        if let Some(connection) = state.registry.get_mut(pending.presentation) {
            connection.send(Envelope::response_to(&pending.request, reply));
        }
    }
}

/// Forget ownership and pending requests tied to a removed connection.
fn release_routes(state: &mut RelayState, id: ConnectionId) {
    fail_pending(state, id);
    state.owners.retain(|_, owner| *owner != id);
}

fn str_field<'a>(payload: &'a Value, name: &str) -> Result<&'a str, RelayError> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::Invalid(format!("missing {}", name)))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, RelayError> {
    serde_json::to_value(value).map_err(|e| RelayError::Sdk(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use statescope_observer::{MemoryHost, Observer};
    use statescope_sdk::{PortSender, Settings};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// A presentation endpoint that answers pings and hands everything else
    /// to the test.
    struct TestPresentation {
        sender: PortSender,
        inbox: mpsc::UnboundedReceiver<Envelope>,
    }

    impl TestPresentation {
        fn attach(relay: &Relay) -> Self {
            let (near, far) = Port::pair();
            relay.attach_presentation(far);
            let (sender, mut receiver) = near.split();
            let (tx, inbox) = mpsc::unbounded_channel();
            let pong = sender.clone();
            tokio::spawn(async move {
                while let Some(envelope) = receiver.recv().await {
                    if envelope.action == Action::Ping {
                        let _ = pong.send(Envelope::new(Action::Pong, Value::Null).with_timestamp(envelope.timestamp));
                    } else if tx.send(envelope).is_err() {
                        break;
                    }
                }
            });
            Self { sender, inbox }
        }

        async fn request(&mut self, action: Action, payload: Value, timestamp: u64) -> Reply {
            self.sender
                .send(Envelope::new(action, payload).with_timestamp(timestamp))
                .unwrap();
            loop {
                let envelope = self.inbox.recv().await.unwrap();
                if envelope.action == Action::Response && envelope.timestamp == timestamp {
                    return serde_json::from_value(envelope.payload).unwrap();
                }
            }
        }

        async fn next_status(&mut self) -> Value {
            loop {
                let envelope = self.inbox.recv().await.unwrap();
                if envelope.action == Action::ConnectionStatus {
                    return envelope.payload;
                }
            }
        }
    }

    fn host() -> Arc<MemoryHost> {
        let host = Arc::new(MemoryHost::new());
        host.add_element(
            "counter",
            None,
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

    fn health() -> HealthConfig {
        HealthConfig {
            ping_interval: Duration::from_millis(100),
            max_missed_pongs: 3,
            max_reconnect_attempts: 2,
            base_backoff: Duration::from_millis(50),
        }
    }

    async fn session() -> (Relay, Arc<MemoryHost>, Observer, TestPresentation) {
        let relay = Relay::with_health(Context::new(Settings::default()), health());
        let host = host();
        let observer = Observer::new(host.clone(), statescope_sdk::EventBus::new());
        observer.initialize().unwrap();

        let (near, far) = Port::pair();
        observer.connect(near);
        relay.attach_observer(observer.session_id().to_string(), far);
        let presentation = TestPresentation::attach(&relay);

        // Let the resync reach the processor.
        tokio::time::sleep(Duration::from_millis(10)).await;
        (relay, host, observer, presentation)
    }

    #[tokio::test]
    async fn observer_reports_reach_the_index() {
        let (relay, _host, _observer, mut presentation) = session().await;

        let reply = presentation.request(Action::GetComponents, Value::Null, 1).await;
        assert!(reply.ok);
        assert_eq!(reply.data[0]["id"], json!("comp-1"));
        assert!(relay.owner_of("comp-1").is_some());
    }

    #[tokio::test]
    async fn edits_round_trip_through_the_observer() {
        let (_relay, host, _observer, mut presentation) = session().await;

        let reply = presentation
            .request(
                Action::UpdateComponent,
                json!({"componentId": "comp-1", "property": "count", "value": 5}),
                42,
            )
            .await;
        assert!(reply.ok, "{:?}", reply);
        assert_eq!(host.data("counter").unwrap()["count"], json!(5));

        let reply = presentation
            .request(
                Action::ExecuteMethod,
                json!({"componentId": "comp-1", "method": "increment"}),
                43,
            )
            .await;
        assert_eq!(reply.data, json!(6));
    }

    #[tokio::test]
    async fn rejected_edits_never_leave_the_relay() {
        let (_relay, host, _observer, mut presentation) = session().await;

        let computed = presentation
            .request(
                Action::UpdateComponent,
                json!({"componentId": "comp-1", "property": "double", "value": 3}),
                1,
            )
            .await;
        assert_eq!(computed.reason, Some(Reason::Forbidden));

        let mistyped = presentation
            .request(
                Action::UpdateComponent,
                json!({"componentId": "comp-1", "property": "count", "value": "five"}),
                2,
            )
            .await;
        assert_eq!(mistyped.reason, Some(Reason::Invalid));

        let missing = presentation
            .request(Action::ExecuteMethod, json!({"componentId": "comp-1", "method": "explode"}), 3)
            .await;
        assert_eq!(missing.reason, Some(Reason::NotFound));
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_session_target_is_not_found() {
        let (_relay, _host, _observer, mut presentation) = session().await;

        presentation
            .sender
            .send(
                Envelope::new(Action::HighlightComponent, json!({"componentId": "comp-1"}))
                    .with_target("no-such-session")
                    .with_timestamp(7),
            )
            .unwrap();
        let reply = loop {
            let envelope = presentation.inbox.recv().await.unwrap();
            if envelope.action == Action::Response {
                break envelope;
            }
        };
        assert_eq!(reply.timestamp, 7);
        assert_eq!(reply.payload["reason"], json!("NotFound"));
    }

    #[tokio::test]
    async fn snapshot_restore_applies_editable_state() {
        let (_relay, host, _observer, mut presentation) = session().await;

        let created = presentation
            .request(Action::CreateSnapshot, json!({"componentId": "comp-1", "name": "zero"}), 1)
            .await;
        let snapshot_id = created.data["id"].as_str().unwrap().to_string();

        presentation
            .request(
                Action::UpdateComponent,
                json!({"componentId": "comp-1", "property": "count", "value": 9}),
                2,
            )
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let diff = presentation
            .request(Action::CompareSnapshots, json!({"snapshotId": snapshot_id}), 3)
            .await;
        assert_eq!(diff.data["count"]["after"], json!(9));

        let restored = presentation
            .request(Action::RestoreSnapshot, json!({"snapshotId": snapshot_id}), 4)
            .await;
        assert!(restored.ok, "{:?}", restored);
        assert_eq!(restored.data["applied"], json!(2));
        assert_eq!(host.data("counter").unwrap()["count"], json!(0));
        assert_eq!(host.data("counter").unwrap()["double"], json!(0));
    }

    #[tokio::test]
    async fn closed_presentation_is_released() {
        let relay = Relay::with_health(Context::new(Settings::default()), health());
        let (near, far) = Port::pair();
        relay.attach_presentation(far);
        assert_eq!(relay.connections().len(), 1);

        drop(near);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(relay.connections().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zombie_observer_is_reconnected_then_fails() {
        let relay = Relay::with_health(Context::new(Settings::default()), health());
        let failed = Arc::new(Mutex::new(Vec::new()));
        let f = failed.clone();
        relay.context().bus().subscribe(TOPIC_CONNECTION_FAILED, move |event| {
            f.lock().push(event.payload.clone());
            Ok(())
        });

        // An observer that reports one component and then goes silent.
        let (silent, far) = Port::pair();
        let far = Mutex::new(Some(far));
        let connector = move |attempt: u32| -> Result<Port, RelayError> {
            if attempt == 0 {
                Ok(far_slot(&far))
            } else {
                Err(RelayError::Connect("host gone".into()))
            }
        };
        let id = relay
            .connect_observer("silent", Arc::new(connector))
            .await
            .unwrap();
        silent
            .send(Envelope::new(
                Action::ComponentAdded,
                serde_json::to_value(Component::builder("ghost", "Ghost").build()).unwrap(),
            ))
            .unwrap();

        let mut presentation = TestPresentation::attach(&relay);
        relay.start();

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(relay.connection_status(id), Some(ConnectionStatus::Failed));
        let payload = failed.lock()[0].clone();
        assert_eq!(payload["sessionId"], json!("silent"));
        assert_eq!(payload["attempts"], json!(2));

        let mut exhausted = None;
        while let Ok(envelope) = presentation.inbox.try_recv() {
            if envelope.action == Action::ConnectionStatus && envelope.payload["reason"] == json!("ChannelExhausted") {
                exhausted = Some(envelope);
            }
        }
        assert!(exhausted.is_some());

        let reply = presentation
            .request(Action::HighlightComponent, json!({"componentId": "ghost"}), 99)
            .await;
        assert_eq!(reply.reason, Some(Reason::ChannelExhausted));

        relay.stop();
        drop(silent);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_relay_sends_no_more_pings() {
        let relay = Relay::with_health(Context::new(Settings::default()), health());
        let (near, far) = Port::pair();
        relay.attach_presentation(far);
        let (_sender, mut inbox) = near.split();

        relay.start();
        tokio::time::sleep(Duration::from_millis(250)).await;
        let mut pings = 0;
        while let Ok(envelope) = inbox.try_recv() {
            if envelope.action == Action::Ping {
                pings += 1;
            }
        }
        assert!(pings > 0);

        relay.stop();
        tokio::time::sleep(Duration::from_secs(1)).await;
        while let Ok(envelope) = inbox.try_recv() {
            assert_ne!(envelope.action, Action::Ping);
        }
    }

    #[tokio::test]
    async fn unanswered_forwards_expire_on_the_next_forward() {
        let mut settings = Settings::default();
        settings.health.request_timeout_ms = 1;
        let relay = Relay::with_health(Context::new(settings), health());

        // An observer that reports a component and never answers commands.
        let (silent, far) = Port::pair();
        relay.attach_observer("silent", far);
        silent
            .send(Envelope::new(
                Action::ComponentAdded,
                serde_json::to_value(Component::builder("ghost", "Ghost").build()).unwrap(),
            ))
            .unwrap();
        let presentation = TestPresentation::attach(&relay);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let highlight = |timestamp: u64| {
            presentation
                .sender
                .send(Envelope::new(Action::HighlightComponent, json!({"componentId": "ghost"})).with_timestamp(timestamp))
                .unwrap();
        };
        highlight(1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(relay.inner.state.lock().pending.len(), 1);

        highlight(2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let state = relay.inner.state.lock();
        assert_eq!(state.pending.len(), 1);
        assert!(state.pending.values().all(|p| p.request.timestamp == 2));
    }

    /// Hands out the far half once; the relay keeps it alive.
    fn far_slot(slot: &Mutex<Option<Port>>) -> Port {
        slot.lock().take().unwrap_or_else(|| Port::pair().0)
    }

    #[tokio::test(start_paused = true)]
    async fn closed_observer_port_reconnects() {
        let relay = Relay::with_health(Context::new(Settings::default()), health());
        let observer = Observer::new(host(), statescope_sdk::EventBus::new());
        observer.initialize().unwrap();

        let o = observer.clone();
        let connector = move |_attempt: u32| -> Result<Port, RelayError> {
            let (near, far) = Port::pair();
            o.connect(near);
            Ok(far)
        };
        let id = relay
            .connect_observer(observer.session_id().to_string(), Arc::new(connector))
            .await
            .unwrap();
        let mut presentation = TestPresentation::attach(&relay);
        relay.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        observer.disconnect();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let report = relay
            .connections()
            .into_iter()
            .find(|r| r.connection_id == id)
            .unwrap();
        assert_eq!(report.status, ConnectionStatus::Healthy);
        assert_eq!(report.metrics.reconnect_count, 1);
        assert_eq!(report.metrics.disconnects, 1);
        assert!(observer.is_connected());

        let status = presentation.next_status().await;
        assert!(status["connection"]["connectionId"].is_u64());

        let reply = presentation
            .request(Action::HighlightComponent, json!({"componentId": "comp-1"}), 5)
            .await;
        assert!(reply.ok, "{:?}", reply);

        relay.stop();
        observer.stop();
    }
}
