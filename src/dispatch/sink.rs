use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::DispatchError;
use crate::lock_or_recover;

/// External message bus.
pub trait EventSink: Send {
    fn name(&self) -> &'static str;

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), DispatchError>;

    /// Called once when the dispatcher stops.
    fn close(&mut self) {}
}

/// Writes events to the log at debug level.
#[derive(Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn publish(&mut self, topic: &str, payload: &[u8], _retain: bool) -> Result<(), DispatchError> {
        log::debug!("event {}: {}", topic, String::from_utf8_lossy(payload));
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Collects messages in memory; can be switched offline to simulate an
/// unreachable broker.
#[derive(Clone, Default)]
pub struct MemorySink {
    messages: Arc<Mutex<Vec<PublishedMessage>>>,
    offline: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        lock_or_recover(&self.messages).clone()
    }

    pub fn topics(&self) -> Vec<String> {
        lock_or_recover(&self.messages)
            .iter()
            .map(|m| m.topic.clone())
            .collect()
    }
}

impl EventSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), DispatchError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DispatchError("sink offline".to_string()));
        }
        lock_or_recover(&self.messages).push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        });
        Ok(())
    }
}
