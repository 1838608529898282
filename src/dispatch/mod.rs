//! Event Dispatcher.
//!
//! Producers (capture tasks, detection workers) hand events to an
//! `EventEmitter`, which never blocks: when the channel is full the event is
//! dropped and counted. One delivery thread moves events into the outbox and
//! drains it into the sink, retrying with capped exponential backoff while
//! the sink is failing.

mod event;
mod mqtt;
mod outbox;
mod sink;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use serde::Serialize;

use crate::capture::Backoff;
use crate::error::DispatchError;
use crate::lock_or_recover;

pub use event::{EventKind, EventRecord, StatusChange};
pub use mqtt::{MqttSettings, MqttSink};
pub use outbox::{InMemoryOutbox, Outbox, SqliteOutbox};
pub use sink::{EventSink, LogSink, MemorySink, PublishedMessage};

const IDLE_WAIT: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub channel_capacity: usize,
    pub topic_prefix: String,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            topic_prefix: "video_analytics".to_string(),
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub delivered: u64,
    /// Dropped because the channel was full or the outbox overflowed.
    pub dropped: u64,
    pub failed_attempts: u64,
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed_attempts: AtomicU64,
    queued: AtomicUsize,
    stored: AtomicUsize,
}

/// Cloneable, non-blocking handle for producers.
#[derive(Clone)]
pub struct EventEmitter {
    tx: Sender<EventRecord>,
    counters: Arc<Counters>,
}

impl EventEmitter {
    pub fn emit(&self, event: EventRecord) {
        // Counted before sending so the delivery thread never decrements first.
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.tx.try_send(event) {
            self.counters.queued.fetch_sub(1, Ordering::Relaxed);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            if let TrySendError::Full(event) = err {
                log::debug!(
                    "event channel full, dropped {:?} for {}",
                    event.kind,
                    event.source_id
                );
            }
        }
    }
}

pub struct EventDispatcher {
    emitter: EventEmitter,
    stop_tx: Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
    sink_name: &'static str,
}

impl EventDispatcher {
    pub fn start(
        config: DispatcherConfig,
        sink: Box<dyn EventSink>,
        outbox: Box<dyn Outbox>,
    ) -> Result<Self, DispatchError> {
        let (tx, rx) = bounded(config.channel_capacity.max(1));
        let (stop_tx, stop_rx) = bounded(1);
        let counters = Arc::new(Counters::default());
        counters.stored.store(outbox.len(), Ordering::Relaxed);
        let sink_name = sink.name();

        let mut worker = DeliveryLoop {
            rx,
            stop_rx,
            sink,
            outbox,
            backoff: Backoff::new(config.retry_base, config.retry_max),
            retry_at: None,
            prefix: config.topic_prefix,
            counters: Arc::clone(&counters),
        };
        let handle = std::thread::Builder::new()
            .name("event-dispatch".to_string())
            .spawn(move || worker.run())
            .map_err(|err| DispatchError(format!("spawn dispatcher thread: {err}")))?;

        log::info!("event dispatcher started (sink: {})", sink_name);
        Ok(Self {
            emitter: EventEmitter { tx, counters },
            stop_tx,
            handle: Mutex::new(Some(handle)),
            sink_name,
        })
    }

    pub fn emitter(&self) -> EventEmitter {
        self.emitter.clone()
    }

    pub fn emit(&self, event: EventRecord) {
        self.emitter.emit(event);
    }

    pub fn sink_name(&self) -> &'static str {
        self.sink_name
    }

    pub fn stats(&self) -> DispatchStats {
        let counters = &self.emitter.counters;
        DispatchStats {
            delivered: counters.delivered.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            failed_attempts: counters.failed_attempts.load(Ordering::Relaxed),
            pending: counters.queued.load(Ordering::Relaxed)
                + counters.stored.load(Ordering::Relaxed),
        }
    }

    /// Stop the delivery thread. Events still in the outbox are kept by a
    /// persistent outbox and lost with an in-memory one.
    pub fn shutdown(&self) {
        let handle = lock_or_recover(&self.handle).take();
        if let Some(handle) = handle {
            let _ = self.stop_tx.try_send(());
            if handle.join().is_err() {
                log::error!("event dispatcher thread panicked");
            }
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct DeliveryLoop {
    rx: Receiver<EventRecord>,
    stop_rx: Receiver<()>,
    sink: Box<dyn EventSink>,
    outbox: Box<dyn Outbox>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    prefix: String,
    counters: Arc<Counters>,
}

impl DeliveryLoop {
    fn run(&mut self) {
        loop {
            let wait = match self.retry_at {
                Some(at) => at.saturating_duration_since(Instant::now()),
                None if self.outbox.is_empty() => IDLE_WAIT,
                None => Duration::ZERO,
            };
            select! {
                recv(self.rx) -> event => match event {
                    Ok(event) => self.store(event),
                    Err(_) => break,
                },
                recv(self.stop_rx) -> _ => break,
                default(wait) => {}
            }
            while let Ok(event) = self.rx.try_recv() {
                self.store(event);
            }
            if self.retry_at.map_or(true, |at| Instant::now() >= at) {
                self.retry_at = None;
                self.deliver();
            }
        }

        let pending = self.outbox.len() + self.rx.len();
        if pending > 0 {
            log::info!("event dispatcher stopping with {} undelivered events", pending);
        }
        self.sink.close();
    }

    fn store(&mut self, event: EventRecord) {
        self.counters.queued.fetch_sub(1, Ordering::Relaxed);
        match self.outbox.push(event) {
            Ok(dropped) => {
                if dropped > 0 {
                    self.counters
                        .dropped
                        .fetch_add(dropped as u64, Ordering::Relaxed);
                    log::debug!("outbox full, discarded {} oldest events", dropped);
                }
            }
            Err(err) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("event not stored: {}", err);
            }
        }
        self.counters.stored.store(self.outbox.len(), Ordering::Relaxed);
    }

    fn deliver(&mut self) {
        loop {
            let (id, event) = match self.outbox.peek() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    self.schedule_retry(&err);
                    break;
                }
            };
            let topic = event.topic(&self.prefix);
            match self.sink.publish(&topic, &event.to_bytes(), event.retain()) {
                Ok(()) => {
                    if let Err(err) = self.outbox.ack(id) {
                        self.schedule_retry(&err);
                        break;
                    }
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    self.backoff.reset();
                }
                Err(err) => {
                    self.schedule_retry(&err);
                    break;
                }
            }
        }
        self.counters.stored.store(self.outbox.len(), Ordering::Relaxed);
    }

    fn schedule_retry(&mut self, err: &DispatchError) {
        self.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
        let delay = self.backoff.next_delay();
        log::warn!(
            "event delivery via {} failed: {} (attempt {}, retry in {:?})",
            self.sink.name(),
            err,
            self.backoff.attempt(),
            delay
        );
        self.retry_at = Some(Instant::now() + delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SourceState;

    fn fast_config(capacity: usize) -> DispatcherConfig {
        DispatcherConfig {
            channel_capacity: capacity,
            topic_prefix: "test".to_string(),
            retry_base: Duration::from_millis(10),
            retry_max: Duration::from_millis(40),
        }
    }

    fn status(source: &str) -> EventRecord {
        EventRecord::status(source, &StatusChange::new(SourceState::Running))
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn delivers_events_to_sink_topics() {
        let sink = MemorySink::new();
        let dispatcher = EventDispatcher::start(
            fast_config(16),
            Box::new(sink.clone()),
            Box::new(InMemoryOutbox::new(16)),
        )
        .unwrap();

        dispatcher.emit(status("cam1"));
        dispatcher.emitter().emit(status("cam2"));
        assert!(wait_for(|| sink.messages().len() == 2));

        let messages = sink.messages();
        assert_eq!(messages[0].topic, "test/sources/cam1/status");
        assert!(messages[0].retain);
        assert_eq!(dispatcher.stats().delivered, 2);
        dispatcher.shutdown();
    }

    #[test]
    fn outage_is_retried_without_losing_events() {
        let sink = MemorySink::new();
        sink.set_offline(true);
        let dispatcher = EventDispatcher::start(
            fast_config(16),
            Box::new(sink.clone()),
            Box::new(InMemoryOutbox::new(16)),
        )
        .unwrap();

        for i in 0..3 {
            dispatcher.emit(status(&format!("cam{i}")));
        }
        assert!(wait_for(|| dispatcher.stats().failed_attempts >= 2));
        assert!(sink.messages().is_empty());
        assert_eq!(dispatcher.stats().pending, 3);

        sink.set_offline(false);
        assert!(wait_for(|| sink.messages().len() == 3));
        assert_eq!(
            sink.topics(),
            vec![
                "test/sources/cam0/status",
                "test/sources/cam1/status",
                "test/sources/cam2/status"
            ]
        );
        assert!(wait_for(|| dispatcher.stats().pending == 0));
    }

    struct BlockingSink {
        release: Receiver<()>,
    }

    impl EventSink for BlockingSink {
        fn name(&self) -> &'static str {
            "blocking"
        }

        fn publish(&mut self, _: &str, _: &[u8], _: bool) -> Result<(), DispatchError> {
            let _ = self.release.recv_timeout(Duration::from_secs(5));
            Ok(())
        }
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (release_tx, release_rx) = bounded(0);
        let dispatcher = EventDispatcher::start(
            fast_config(1),
            Box::new(BlockingSink {
                release: release_rx,
            }),
            Box::new(InMemoryOutbox::new(16)),
        )
        .unwrap();

        let started = Instant::now();
        for _ in 0..50 {
            dispatcher.emit(status("cam"));
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(dispatcher.stats().dropped > 0);

        drop(release_tx);
        dispatcher.shutdown();
    }
}
