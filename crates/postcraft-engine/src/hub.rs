//! Topic fan-out for session and posting events.
//!
//! Delivery is best-effort and at-least-once to current subscribers. A small
//! per-topic replay ring lets late subscribers catch up on recent events.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::select_all;
use postcraft_contracts::events::{Event, EventPayload};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;
pub const DEFAULT_REPLAY: usize = 32;
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum HubMessage {
    Event(Event),
    /// Nothing arrived within the keepalive interval.
    Keepalive,
    /// Every subscribed topic was closed.
    Closed,
}

struct Topic {
    sender: broadcast::Sender<Event>,
    recent: VecDeque<Event>,
}

struct HubInner {
    topics: DashMap<String, Topic>,
    firehose: broadcast::Sender<Event>,
    capacity: usize,
    replay: usize,
    keepalive: Duration,
}

#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY, DEFAULT_REPLAY, DEFAULT_KEEPALIVE)
    }
}

impl EventHub {
    /// `replay` of 0 disables the replay ring.
    pub fn new(capacity: usize, replay: usize, keepalive: Duration) -> Self {
        let capacity = capacity.max(1);
        let (firehose, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(HubInner {
                topics: DashMap::new(),
                firehose,
                capacity,
                replay,
                keepalive,
            }),
        }
    }

    pub fn publish(&self, topic: &str, event_type: &str, payload: EventPayload) -> Event {
        let event = Event::new(topic, event_type, payload);
        let receivers = {
            let mut entry = self
                .inner
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| self.new_topic());
            if self.inner.replay > 0 {
                if entry.recent.len() == self.inner.replay {
                    entry.recent.pop_front();
                }
                entry.recent.push_back(event.clone());
            }
            entry.sender.send(event.clone()).unwrap_or(0)
        };
        let _ = self.inner.firehose.send(event.clone());
        debug!(topic, event_type, receivers, "event published");
        event
    }

    /// Replayed events come first, in publish order per topic.
    pub fn subscribe(&self, topics: &[String]) -> Subscription {
        let mut pending = VecDeque::new();
        let mut receivers = Vec::with_capacity(topics.len());
        for topic in topics {
            let entry = self
                .inner
                .topics
                .entry(topic.clone())
                .or_insert_with(|| self.new_topic());
            pending.extend(entry.recent.iter().cloned());
            receivers.push(entry.sender.subscribe());
        }
        Subscription {
            pending,
            receivers,
            keepalive: self.inner.keepalive,
        }
    }

    /// Every event on every topic, without replay.
    pub fn subscribe_all(&self) -> Subscription {
        Subscription {
            pending: VecDeque::new(),
            receivers: vec![self.inner.firehose.subscribe()],
            keepalive: self.inner.keepalive,
        }
    }

    /// Drops the topic; its subscribers receive [`HubMessage::Closed`] once
    /// drained.
    pub fn close_topic(&self, topic: &str) {
        if self.inner.topics.remove(topic).is_some() {
            debug!(topic, "topic closed");
        }
    }

    /// Drops the topic only when nobody is subscribed to it.
    pub fn close_idle_topic(&self, topic: &str) -> bool {
        let removed = self
            .inner
            .topics
            .remove_if(topic, |_, entry| entry.sender.receiver_count() == 0)
            .is_some();
        if removed {
            debug!(topic, "idle topic dropped");
        }
        removed
    }

    pub fn recent(&self, topic: &str) -> Vec<Event> {
        self.inner
            .topics
            .get(topic)
            .map(|entry| entry.recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn new_topic(&self) -> Topic {
        let (sender, _) = broadcast::channel(self.inner.capacity);
        Topic {
            sender,
            recent: VecDeque::with_capacity(self.inner.replay),
        }
    }
}

pub struct Subscription {
    pending: VecDeque<Event>,
    receivers: Vec<broadcast::Receiver<Event>>,
    keepalive: Duration,
}

impl Subscription {
    pub async fn next(&mut self) -> HubMessage {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return HubMessage::Event(event);
            }
            if self.receivers.is_empty() {
                return HubMessage::Closed;
            }
            let outcome = {
                let waits = self
                    .receivers
                    .iter_mut()
                    .map(|receiver| Box::pin(receiver.recv()));
                match tokio::time::timeout(self.keepalive, select_all(waits)).await {
                    Ok((result, index, _rest)) => Some((result, index)),
                    Err(_) => None,
                }
            };
            match outcome {
                None => return HubMessage::Keepalive,
                Some((Ok(event), _)) => return HubMessage::Event(event),
                Some((Err(RecvError::Lagged(skipped)), _)) => {
                    warn!(skipped, "subscriber lagged, skipping missed events");
                }
                Some((Err(RecvError::Closed), index)) => {
                    self.receivers.swap_remove(index);
                }
            }
        }
    }

    /// Next event within `wait`, skipping keepalives. `None` on close or
    /// timeout.
    pub async fn next_event(&mut self, wait: Duration) -> Option<Event> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match tokio::time::timeout(remaining, self.next()).await {
                Ok(HubMessage::Event(event)) => return Some(event),
                Ok(HubMessage::Keepalive) => continue,
                Ok(HubMessage::Closed) | Err(_) => return None,
            }
        }
    }
}
