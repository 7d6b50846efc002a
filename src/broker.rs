//! Topic-keyed event broker.
//!
//! Streamed answer events fan out to subscribers through per-topic
//! broadcast channels (topic = tenant/thread). Publishing never blocks
//! on slow subscribers; a lagging receiver drops the oldest events. This
//! replaces process-local socket-room maps so the streaming transport
//! can scale out behind any delivery layer.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::answer::AnswerEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Per-topic broadcast hub for [`AnswerEvent`]s.
pub struct EventBroker {
    topics: Mutex<HashMap<String, broadcast::Sender<AnswerEvent>>>,
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroker {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<AnswerEvent> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish an event to a topic. Events published with no subscribers
    /// are dropped.
    pub fn publish(&self, topic: &str, event: AnswerEvent) {
        let _ = self.sender(topic).send(event);
    }

    /// Subscribe to a topic. Events published after this call are
    /// delivered in publish order.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<AnswerEvent> {
        self.sender(topic).subscribe()
    }

    /// Drop a topic once its conversation is over.
    pub fn remove_topic(&self, topic: &str) {
        self.topics.lock().unwrap().remove(topic);
    }
}
