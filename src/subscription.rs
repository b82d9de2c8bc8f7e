//! Resilient topic subscriptions over the node's streaming `pubsub/sub` API.
//!
//! Each topic moves through
//!
//! ```text
//! unsubscribed -> connecting -> streaming -> reconnect-pending -> connecting ...
//!                                   \______________________________ unsubscribed
//! ```
//!
//! A topic has at most one stream task at a time. Stream tasks and retry
//! timers only act if the generation they were started with still matches
//! the registry, so a task that lost a race with `unsubscribe`, teardown or
//! a forced reconnect does nothing. A 30 s health check compares streaming
//! and connecting topics against `pubsub/ls` and restarts the ones the node
//! has forgotten.

use crate::codec::{decode_payload, decode_topic, split_concatenated_records};
use crate::error::{BridgeError, Result};
use crate::events::{EventSender, TransportEvent};
use crate::metrics;
use crate::node_api::NodeApi;
use crate::retry::{retry_with_linear_backoff, BackoffPolicy};
use futures::StreamExt;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// One initial attempt plus exactly one retry.
pub const PUBLISH_MAX_ATTEMPTS: u32 = 2;
pub const PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    Connecting,
    Streaming,
    ReconnectPending,
}

/// One line of the `pubsub/sub` response.
#[derive(Debug, Deserialize)]
struct WireMessage {
    data: String,
    #[serde(default)]
    from: Option<String>,
}

struct TopicState {
    phase: SubscriptionPhase,
    stream: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
    retry_count: u32,
    generation: u64,
}

impl TopicState {
    fn new() -> Self {
        Self {
            phase: SubscriptionPhase::Connecting,
            stream: None,
            retry_timer: None,
            retry_count: 0,
            generation: 0,
        }
    }

    fn abort(self) {
        if let Some(stream) = self.stream {
            stream.abort();
        }
        if let Some(timer) = self.retry_timer {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct Registry {
    topics: HashMap<String, TopicState>,
    intentional: HashSet<String>,
    health: Option<JoinHandle<()>>,
    next_generation: u64,
}

impl Registry {
    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn stop_health_check(&mut self) {
        if let Some(health) = self.health.take() {
            health.abort();
            debug!("Subscription health check stopped");
        }
    }

    fn clear(&mut self) {
        self.stop_health_check();
        for (_, state) in self.topics.drain() {
            state.abort();
        }
        self.intentional.clear();
        metrics::ACTIVE_SUBSCRIPTIONS.set(0);
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.clear();
    }
}

struct Inner {
    api: NodeApi,
    events: EventSender,
    backoff: BackoffPolicy,
    registry: Mutex<Registry>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_stream(self: &Arc<Self>, topic: &str, state: &mut TopicState, generation: u64) {
        state.generation = generation;
        state.phase = SubscriptionPhase::Connecting;
        state.stream = Some(tokio::spawn(run_stream(
            Arc::downgrade(self),
            self.api.clone(),
            self.events.clone(),
            topic.to_string(),
            generation,
        )));
    }

    fn schedule_reconnect(self: &Arc<Self>, topic: &str, state: &mut TopicState) {
        let delay = self.backoff.delay_for(state.retry_count);
        state.retry_count = state.retry_count.saturating_add(1);
        state.phase = SubscriptionPhase::ReconnectPending;
        if let Some(previous) = state.retry_timer.take() {
            previous.abort();
        }

        info!(
            topic,
            attempt = state.retry_count,
            delay_ms = delay.as_millis() as u64,
            "Scheduling subscription reconnect"
        );
        metrics::RECONNECTS_SCHEDULED.inc();

        let weak = Arc::downgrade(self);
        let topic = topic.to_string();
        let generation = state.generation;
        state.retry_timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.reconnect(&topic, generation);
            }
        }));
    }

    /// Retry timer fired.
    fn reconnect(self: &Arc<Self>, topic: &str, expected_generation: u64) {
        let mut guard = self.registry();
        let reg = &mut *guard;
        if reg.intentional.contains(topic) {
            return;
        }
        let generation = reg.bump_generation();
        let Some(state) = reg.topics.get_mut(topic) else {
            return;
        };
        if state.generation != expected_generation
            || state.phase != SubscriptionPhase::ReconnectPending
            || state.stream.is_some()
        {
            return;
        }
        // This handle belongs to the task running us; dropping it detaches.
        state.retry_timer = None;
        debug!(topic, "Reconnecting subscription");
        self.start_stream(topic, state, generation);
    }

    /// The stream opened successfully.
    fn mark_streaming(&self, topic: &str, generation: u64) -> bool {
        let mut reg = self.registry();
        match reg.topics.get_mut(topic) {
            Some(state) if state.generation == generation => {
                state.phase = SubscriptionPhase::Streaming;
                state.retry_count = 0;
                true
            }
            _ => false,
        }
    }

    /// The stream failed to open, ended, or errored.
    fn stream_closed(self: &Arc<Self>, topic: &str, generation: u64) {
        let mut reg = self.registry();
        if reg.intentional.contains(topic) {
            return;
        }
        let Some(state) = reg.topics.get_mut(topic) else {
            return;
        };
        if state.generation != generation {
            return;
        }
        state.stream = None;
        self.schedule_reconnect(topic, state);
    }

    fn force_reconnect(self: &Arc<Self>, topic: &str, expected_generation: u64) -> bool {
        let mut guard = self.registry();
        let reg = &mut *guard;
        if reg.intentional.contains(topic) {
            return false;
        }
        let generation = reg.bump_generation();
        let Some(state) = reg.topics.get_mut(topic) else {
            return false;
        };
        let live = matches!(
            state.phase,
            SubscriptionPhase::Streaming | SubscriptionPhase::Connecting
        );
        if state.generation != expected_generation || !live {
            return false;
        }
        if let Some(stale) = state.stream.take() {
            stale.abort();
        }
        warn!(topic, "Subscription missing from node, forcing reconnect");
        metrics::HEALTH_RECONNECTS.inc();
        self.start_stream(topic, state, generation);
        true
    }

    fn ensure_health_check(self: &Arc<Self>, reg: &mut Registry) {
        if reg.health.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(self);
        reg.health = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + HEALTH_CHECK_INTERVAL, HEALTH_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.registry().topics.is_empty() {
                    break;
                }
                if let Err(e) = inner.reconcile().await {
                    warn!("Subscription health check failed: {}", e);
                }
            }
        }));
        debug!("Subscription health check started");
    }

    /// Restart every streaming or connecting topic the node doesn't list.
    /// A connect that never got response headers is caught here too.
    /// Topics waiting on a retry timer are left to it.
    async fn reconcile(self: &Arc<Self>) -> Result<usize> {
        let tracked: Vec<(String, u64)> = self
            .registry()
            .topics
            .iter()
            .filter(|(_, s)| s.phase != SubscriptionPhase::ReconnectPending)
            .map(|(topic, s)| (topic.clone(), s.generation))
            .collect();
        if tracked.is_empty() {
            return Ok(0);
        }

        let remote: HashSet<String> = self
            .api
            .pubsub_ls()
            .await?
            .iter()
            .map(|t| decode_topic(t))
            .collect();

        let mut forced = 0;
        for (topic, generation) in tracked {
            if !remote.contains(&topic) && self.force_reconnect(&topic, generation) {
                forced += 1;
            }
        }
        Ok(forced)
    }
}

/// Decode one line of a subscription stream into the messages it carries.
///
/// Lines that aren't `{"data": ...}` wrappers are treated as raw payloads.
pub fn decode_stream_line(line: &str) -> Vec<String> {
    match serde_json::from_str::<WireMessage>(line) {
        Ok(wire) => match decode_payload(&wire.data) {
            Some(text) => split_concatenated_records(&text),
            None => {
                warn!(from = ?wire.from, "Dropping undecodable message payload");
                metrics::UNDECODABLE_PAYLOADS.inc();
                Vec::new()
            }
        },
        Err(_) => split_concatenated_records(line),
    }
}

fn deliver_line(events: &EventSender, topic: &str, line: &[u8]) {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    for message in decode_stream_line(line) {
        metrics::MESSAGES_DELIVERED.inc();
        let event = TransportEvent::Message {
            topic: topic.to_string(),
            message,
        };
        if events.send(event).is_err() {
            debug!(topic, "Event receiver dropped, discarding message");
        }
    }
}

async fn run_stream(weak: Weak<Inner>, api: NodeApi, events: EventSender, topic: String, generation: u64) {
    let resp = match api.pubsub_sub(&topic).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(topic = %topic, "Subscription request failed: {}", e);
            if let Some(inner) = weak.upgrade() {
                inner.stream_closed(&topic, generation);
            }
            return;
        }
    };

    match weak.upgrade() {
        Some(inner) if inner.mark_streaming(&topic, generation) => {}
        _ => return,
    }
    info!(topic = %topic, "Subscription stream open");

    let mut stream = resp.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                buffer.extend_from_slice(&bytes);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    deliver_line(&events, &topic, &line);
                }
            }
            Err(e) => {
                warn!(topic = %topic, "Subscription stream error: {}", e);
                break;
            }
        }
    }
    deliver_line(&events, &topic, &buffer);

    info!(topic = %topic, "Subscription stream ended");
    if let Some(inner) = weak.upgrade() {
        inner.stream_closed(&topic, generation);
    }
}

/// Owns every topic subscription for the lifetime of the application.
/// Cloning shares the same registry.
#[derive(Clone)]
pub struct SubscriptionEngine {
    inner: Arc<Inner>,
}

impl SubscriptionEngine {
    pub fn new(api: NodeApi, events: EventSender) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                events,
                backoff: BackoffPolicy::default(),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub fn api(&self) -> &NodeApi {
        &self.inner.api
    }

    /// Start streaming `topic`. A topic that is already connecting,
    /// streaming or waiting to reconnect is left alone.
    pub fn subscribe(&self, topic: &str) {
        let mut guard = self.inner.registry();
        let reg = &mut *guard;

        if let Some(state) = reg.topics.get(topic) {
            if state.stream.is_some() || state.retry_timer.is_some() {
                debug!(topic, phase = ?state.phase, "Already subscribed");
                return;
            }
        }

        reg.intentional.remove(topic);
        let generation = reg.bump_generation();
        let state = reg
            .topics
            .entry(topic.to_string())
            .or_insert_with(TopicState::new);
        self.inner.start_stream(topic, state, generation);
        metrics::ACTIVE_SUBSCRIPTIONS.set(reg.topics.len() as i64);
        info!(topic, "Subscribed");

        self.inner.ensure_health_check(reg);
    }

    /// Stop streaming `topic` and suppress any pending or future reconnect.
    /// Unknown topics are ignored.
    pub fn unsubscribe(&self, topic: &str) {
        let mut reg = self.inner.registry();
        if let Some(state) = reg.topics.remove(topic) {
            reg.intentional.insert(topic.to_string());
            state.abort();
            info!(topic, "Unsubscribed");
        }
        metrics::ACTIVE_SUBSCRIPTIONS.set(reg.topics.len() as i64);
        if reg.topics.is_empty() {
            reg.stop_health_check();
        }
    }

    /// Publish `data` to `topic`, retrying once after a short delay.
    pub async fn publish(&self, topic: &str, data: &[u8]) -> Result<()> {
        let api = &self.inner.api;
        let result = retry_with_linear_backoff(
            || api.pubsub_pub(topic, data),
            PUBLISH_MAX_ATTEMPTS,
            PUBLISH_RETRY_DELAY.as_millis() as u64,
        )
        .await;

        result.map_err(|e| {
            metrics::PUBLISH_FAILURES.inc();
            warn!(topic, "Publish failed: {}", e);
            BridgeError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            }
        })
    }

    pub async fn peers(&self, topic: &str) -> Result<Vec<String>> {
        self.inner.api.pubsub_peers(topic).await
    }

    /// Run one health pass now. Returns how many topics were reconnected.
    pub async fn reconcile(&self) -> Result<usize> {
        self.inner.reconcile().await
    }

    /// Cancel the health check, every timer and every stream, and forget
    /// all per-topic state.
    pub fn teardown(&self) {
        let mut reg = self.inner.registry();
        let count = reg.topics.len();
        reg.clear();
        info!(subscriptions = count, "Subscription state torn down");
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.registry().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn phase(&self, topic: &str) -> Option<SubscriptionPhase> {
        self.inner.registry().topics.get(topic).map(|s| s.phase)
    }

    pub fn retry_count(&self, topic: &str) -> Option<u32> {
        self.inner.registry().topics.get(topic).map(|s| s.retry_count)
    }

    pub fn is_intentionally_unsubscribed(&self, topic: &str) -> bool {
        self.inner.registry().intentional.contains(topic)
    }

    pub fn health_check_active(&self) -> bool {
        self.inner
            .registry()
            .health
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}
