//! In-process publish/subscribe with optional bounded history.
//!
//! Every subsystem signals through an [`EventBus`]. Delivery is synchronous
//! and in subscription order for [`EventBus::publish`]. A subscriber that
//! returns an error or panics is logged and skipped; the remaining
//! subscribers still receive the event.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use statescope_types::{current_timestamp_ms, TimelineEvent};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::{Error, Result};

/// Identifier returned by every `subscribe*` call.
pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(&TimelineEvent) -> anyhow::Result<()> + Send + Sync>;

/// Default number of events kept when history tracking is enabled.
pub const DEFAULT_HISTORY_LIMIT: usize = 500;

#[derive(Debug)]
enum TopicMatcher {
    Exact(String),
    Pattern(Regex),
}

impl TopicMatcher {
    fn matches(&self, topic: &str) -> bool {
        match self {
            TopicMatcher::Exact(t) => t == topic,
            TopicMatcher::Pattern(re) => re.is_match(topic),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            TopicMatcher::Exact(t) => t,
            TopicMatcher::Pattern(re) => re.as_str(),
        }
    }
}

struct Subscription {
    id: SubscriptionId,
    matcher: TopicMatcher,
    handler: Handler,
    once: bool,
    tag: Option<String>,
    active: bool,
}

/// What a `publish_with_filter` predicate gets to see about a subscriber.
#[derive(Debug, Clone, Copy)]
pub struct SubscriberInfo<'a> {
    pub id: SubscriptionId,
    /// Exact topic or regex source.
    pub pattern: &'a str,
    pub tag: Option<&'a str>,
}

#[derive(Debug, Default)]
struct History {
    enabled: bool,
    limit: usize,
    events: VecDeque<TimelineEvent>,
}

impl History {
    fn record(&mut self, event: &TimelineEvent) {
        if !self.enabled {
            return;
        }
        self.events.push_back(event.clone());
        while self.events.len() > self.limit {
            self.events.pop_front();
        }
    }
}

#[derive(Default)]
struct BusState {
    subscriptions: Vec<Subscription>,
    history: History,
    /// Pending trailing-edge publishes by topic, tagged with a sequence
    /// number so a fired task only clears its own entry.
    debounced: HashMap<String, (u64, JoinHandle<()>)>,
    debounce_seq: u64,
    throttled: HashMap<String, Instant>,
}

struct BusInner {
    state: Mutex<BusState>,
    next_subscription: AtomicU64,
    next_event: AtomicU64,
}

/// Cheaply clonable handle to a shared bus.
///
/// # Example
///
/// ```rust
/// use statescope_sdk::EventBus;
/// use serde_json::json;
///
/// let bus = EventBus::new();
/// bus.subscribe("component:updated", |event| {
///     println!("{} changed", event.payload["componentId"]);
///     Ok(())
/// });
///
/// let delivered = bus.publish("component:updated", json!({"componentId": "comp-1"}));
/// assert_eq!(delivered, 1);
/// ```
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with history tracking disabled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState::default()),
                next_subscription: AtomicU64::new(1),
                next_event: AtomicU64::new(1),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe to an exact topic.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&TimelineEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(TopicMatcher::Exact(topic.to_string()), Arc::new(handler), false, None)
    }

    /// Subscribe to an exact topic with a tag visible to `publish_with_filter`.
    pub fn subscribe_tagged<F>(&self, topic: &str, tag: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&TimelineEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(
            TopicMatcher::Exact(topic.to_string()),
            Arc::new(handler),
            false,
            Some(tag.to_string()),
        )
    }

    /// Subscribe for a single delivery; the subscription is removed before
    /// the handler runs.
    pub fn subscribe_once<F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&TimelineEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(TopicMatcher::Exact(topic.to_string()), Arc::new(handler), true, None)
    }

    /// Subscribe to every topic matching a regular expression.
    pub fn subscribe_many_with_regex<F>(&self, pattern: &str, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&TimelineEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let re = Regex::new(pattern)
            .map_err(|e| Error::Invalid(format!("topic pattern {:?}: {}", pattern, e)))?;
        Ok(self.add(TopicMatcher::Pattern(re), Arc::new(handler), false, None))
    }

    fn add(
        &self,
        matcher: TopicMatcher,
        handler: Handler,
        once: bool,
        tag: Option<String>,
    ) -> SubscriptionId {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.inner.state.lock().subscriptions.push(Subscription {
            id,
            matcher,
            handler,
            once,
            tag,
            active: true,
        });
        id
    }

    /// Remove a subscription. Returns `false` if it did not exist.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| s.id != id);
        state.subscriptions.len() != before
    }

    /// Remove every subscription registered for `topic` (exact topic or
    /// identical pattern source). Returns the number removed.
    pub fn unsubscribe_all(&self, topic: &str) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| s.matcher.as_str() != topic);
        before - state.subscriptions.len()
    }

    /// Remove every subscription and cancel pending debounced publishes.
    pub fn unsubscribe_all_events(&self) {
        let mut state = self.inner.state.lock();
        state.subscriptions.clear();
        for (_, (_, handle)) in state.debounced.drain() {
            handle.abort();
        }
        state.throttled.clear();
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.active)
            .count()
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    /// Build a timeline event for `topic` with a fresh id and timestamp.
    pub fn event(&self, topic: &str, payload: Value) -> TimelineEvent {
        let id = self.inner.next_event.fetch_add(1, Ordering::Relaxed);
        TimelineEvent::new(id, topic, payload, current_timestamp_ms())
    }

    /// Publish synchronously. Returns the number of subscribers that
    /// handled the event without error.
    pub fn publish(&self, topic: &str, payload: Value) -> usize {
        self.publish_event(self.event(topic, payload))
    }

    /// Publish a prepared event; its `event_type` is the topic.
    pub fn publish_event(&self, event: TimelineEvent) -> usize {
        let handlers = self.collect_handlers(&event, |_| true);
        deliver_all(&handlers, &event)
    }

    /// Publish only to the subscribers the predicate selects.
    pub fn publish_with_filter<P>(&self, topic: &str, payload: Value, predicate: P) -> usize
    where
        P: Fn(&SubscriberInfo<'_>) -> bool,
    {
        let event = self.event(topic, payload);
        let handlers = self.collect_handlers(&event, predicate);
        deliver_all(&handlers, &event)
    }

    /// Publish with each handler spawned as its own task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn publish_async(&self, topic: &str, payload: Value) -> Vec<JoinHandle<()>> {
        let event = Arc::new(self.event(topic, payload));
        self.collect_handlers(&event, |_| true)
            .into_iter()
            .map(|(id, handler)| {
                let event = event.clone();
                tokio::spawn(async move {
                    deliver(id, &handler, &event);
                })
            })
            .collect()
    }

    /// Publish after `delay`; a later call for the same topic replaces the
    /// pending one (trailing edge).
    pub fn publish_debounced(&self, topic: &str, payload: Value, delay: Duration) {
        let bus = self.clone();
        let owned_topic = topic.to_string();

        // Spawned under the lock so the task cannot look for its entry before
        // it is inserted.
        let mut state = self.inner.state.lock();
        state.debounce_seq += 1;
        let seq = state.debounce_seq;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = bus.inner.state.lock();
                let ours = state
                    .debounced
                    .get(&owned_topic)
                    .is_some_and(|(current, _)| *current == seq);
                if !ours {
                    return;
                }
                state.debounced.remove(&owned_topic);
            }
            bus.publish(&owned_topic, payload);
        });

        if let Some((_, previous)) = state.debounced.insert(topic.to_string(), (seq, handle)) {
            previous.abort();
        }
    }

    /// Debounced publishes that have not fired yet.
    pub fn pending_debounced(&self) -> usize {
        self.inner.state.lock().debounced.len()
    }

    /// Publish at most once per `interval` per topic (leading edge).
    /// Returns `true` if the event went out.
    pub fn publish_throttled(&self, topic: &str, payload: Value, interval: Duration) -> bool {
        let now = Instant::now();
        {
            let mut state = self.inner.state.lock();
            if let Some(last) = state.throttled.get(topic) {
                if now.duration_since(*last) < interval {
                    debug!("Throttled publish dropped for topic {}", topic);
                    return false;
                }
            }
            state.throttled.insert(topic.to_string(), now);
        }
        self.publish(topic, payload);
        true
    }

    /// Record history and snapshot the matching handlers. Handlers run
    /// outside the lock so they may subscribe or publish themselves.
    fn collect_handlers<P>(&self, event: &TimelineEvent, predicate: P) -> Vec<(SubscriptionId, Handler)>
    where
        P: Fn(&SubscriberInfo<'_>) -> bool,
    {
        let mut state = self.inner.state.lock();
        state.history.record(event);

        let mut handlers = Vec::new();
        for sub in state.subscriptions.iter_mut() {
            if !sub.active || !sub.matcher.matches(&event.event_type) {
                continue;
            }
            let info = SubscriberInfo {
                id: sub.id,
                pattern: sub.matcher.as_str(),
                tag: sub.tag.as_deref(),
            };
            if !predicate(&info) {
                continue;
            }
            if sub.once {
                sub.active = false;
            }
            handlers.push((sub.id, sub.handler.clone()));
        }
        state.subscriptions.retain(|s| s.active);
        handlers
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Start recording published events, keeping at most `limit`.
    pub fn enable_history_tracking(&self, limit: usize) {
        let mut state = self.inner.state.lock();
        state.history.enabled = true;
        state.history.limit = limit.max(1);
        while state.history.events.len() > state.history.limit {
            state.history.events.pop_front();
        }
    }

    /// Stop recording. Already recorded events are kept.
    pub fn disable_history_tracking(&self) {
        self.inner.state.lock().history.enabled = false;
    }

    pub fn is_history_enabled(&self) -> bool {
        self.inner.state.lock().history.enabled
    }

    pub fn clear_history(&self) {
        self.inner.state.lock().history.events.clear();
    }

    /// Recorded events, oldest first.
    pub fn history(&self) -> Vec<TimelineEvent> {
        self.inner.state.lock().history.events.iter().cloned().collect()
    }

    /// Recorded events matching a predicate.
    pub fn filtered_events<P>(&self, predicate: P) -> Vec<TimelineEvent>
    where
        P: Fn(&TimelineEvent) -> bool,
    {
        self.inner
            .state
            .lock()
            .history
            .events
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    /// Recorded events with `start <= timestamp <= end`.
    pub fn events_by_time_range(&self, start: u64, end: u64) -> Vec<TimelineEvent> {
        self.filtered_events(|e| e.timestamp >= start && e.timestamp <= end)
    }

    /// Number of recorded events per event type.
    pub fn event_count_by_type(&self) -> BTreeMap<String, usize> {
        let state = self.inner.state.lock();
        let mut counts = BTreeMap::new();
        for event in &state.history.events {
            *counts.entry(event.event_type.clone()).or_insert(0) += 1;
        }
        counts
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

fn deliver_all(handlers: &[(SubscriptionId, Handler)], event: &TimelineEvent) -> usize {
    handlers
        .iter()
        .filter(|(id, handler)| deliver(*id, handler, event))
        .count()
}

fn deliver(id: SubscriptionId, handler: &Handler, event: &TimelineEvent) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(
                topic = %event.event_type,
                subscription = id,
                error = %e,
                "subscriber failed"
            );
            false
        }
        Err(_) => {
            error!(topic = %event.event_type, subscription = id, "subscriber panicked");
            false
        }
    }
}
