//! Source Registry: the single authority over source lifecycle.
//!
//! Each entry pairs an immutable `SourceSpec` with a runtime record shared
//! with its capture task. Mutations of one source serialize on that
//! source's control lock; the map lock is held only to look entries up,
//! insert or delete them, so a slow stop on one source never stalls
//! another.

mod source;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::capture::{self, CaptureContext, CaptureHandle};
use crate::dispatch::{EventRecord, StatusChange};
use crate::error::{ControlError, ControlResult};
use crate::{lock_or_recover, read_or_recover, write_or_recover};

pub use source::{SourceInfo, SourceSpec, SourceState};
pub(crate) use source::SourceRuntime;

#[derive(Default)]
struct Control {
    task: Option<CaptureHandle>,
    removed: bool,
}

struct SourceEntry {
    spec: SourceSpec,
    runtime: Arc<Mutex<SourceRuntime>>,
    control: Mutex<Control>,
}

impl SourceEntry {
    fn info(&self) -> SourceInfo {
        SourceInfo::new(&self.spec, &lock_or_recover(&self.runtime))
    }
}

pub struct SourceRegistry {
    sources: RwLock<BTreeMap<String, Arc<SourceEntry>>>,
    context: Arc<CaptureContext>,
}

impl SourceRegistry {
    pub fn new(context: Arc<CaptureContext>) -> Self {
        Self {
            sources: RwLock::new(BTreeMap::new()),
            context,
        }
    }

    fn entry(&self, id: &str) -> ControlResult<Arc<SourceEntry>> {
        read_or_recover(&self.sources)
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(id.to_string()))
    }

    /// Register a source in the Stopped state. Does not start it.
    pub fn add(&self, spec: SourceSpec) -> ControlResult<SourceInfo> {
        if spec.id.trim().is_empty() {
            return Err(ControlError::InvalidArgument("source id is empty".into()));
        }
        if spec.url.trim().is_empty() {
            return Err(ControlError::InvalidArgument(format!(
                "source {} has no url",
                spec.id
            )));
        }
        if spec.width == 0 || spec.height == 0 {
            return Err(ControlError::InvalidArgument(format!(
                "source {} has zero resolution",
                spec.id
            )));
        }

        let mut sources = write_or_recover(&self.sources);
        if sources.contains_key(&spec.id) {
            return Err(ControlError::DuplicateSource(spec.id));
        }
        self.context.buffer.register(&spec.id);
        let entry = Arc::new(SourceEntry {
            spec,
            runtime: Arc::new(Mutex::new(SourceRuntime::default())),
            control: Mutex::new(Control::default()),
        });
        let info = entry.info();
        sources.insert(entry.spec.id.clone(), entry);
        drop(sources);

        log::info!("source {} added ({})", info.id, info.url);
        Ok(info)
    }

    pub fn start(&self, id: &str) -> ControlResult<()> {
        let entry = self.entry(id)?;
        let mut control = lock_or_recover(&entry.control);
        if control.removed {
            return Err(ControlError::NotFound(id.to_string()));
        }
        if let Some(task) = &control.task {
            if !task.is_finished() {
                return Err(ControlError::AlreadyRunning(id.to_string()));
            }
        }
        if let Some(finished) = control.task.take() {
            finished.stop();
        }

        {
            let mut runtime = lock_or_recover(&entry.runtime);
            if matches!(runtime.state, SourceState::Running | SourceState::Connecting) {
                return Err(ControlError::AlreadyRunning(id.to_string()));
            }
            runtime.state = SourceState::Connecting;
            runtime.reconnect_attempt = 0;
            runtime.error_since = None;
            runtime.last_error = None;
        }
        self.context.buffer.register(id);

        match capture::spawn(
            entry.spec.clone(),
            Arc::clone(&entry.runtime),
            Arc::clone(&self.context),
        ) {
            Ok(task) => {
                control.task = Some(task);
                log::info!("source {} started", id);
                Ok(())
            }
            Err(err) => {
                lock_or_recover(&entry.runtime).state = SourceState::Stopped;
                Err(err)
            }
        }
    }

    /// Cancel the capture task and wait until it has released the
    /// transport. Stopping a stopped source is a no-op.
    pub fn stop(&self, id: &str) -> ControlResult<()> {
        let entry = self.entry(id)?;
        let mut control = lock_or_recover(&entry.control);
        let Some(task) = control.task.take() else {
            return Ok(());
        };
        task.stop();

        let change = {
            let mut runtime = lock_or_recover(&entry.runtime);
            let announce = runtime.state != SourceState::Stopped;
            runtime.state = SourceState::Stopped;
            announce.then(|| StatusChange::new(SourceState::Stopped))
        };
        if let Some(change) = change {
            self.context.events.emit(EventRecord::status(id, &change));
        }
        log::info!("source {} stopped", id);
        Ok(())
    }

    /// Delete a stopped source with its cached frame, detection and any
    /// queued detection job.
    pub fn remove(&self, id: &str) -> ControlResult<SourceInfo> {
        let entry = self.entry(id)?;
        let mut control = lock_or_recover(&entry.control);
        if control.removed {
            return Err(ControlError::NotFound(id.to_string()));
        }
        let running = control.task.as_ref().is_some_and(|task| !task.is_finished());
        if running || lock_or_recover(&entry.runtime).state != SourceState::Stopped {
            return Err(ControlError::SourceBusy(id.to_string()));
        }
        if let Some(finished) = control.task.take() {
            finished.stop();
        }
        control.removed = true;
        write_or_recover(&self.sources).remove(id);
        drop(control);

        self.context.buffer.remove(id);
        let purged = self.context.pool.purge(id);
        if purged > 0 {
            log::debug!("source {}: purged {} queued detection jobs", id, purged);
        }
        log::info!("source {} removed", id);
        Ok(entry.info())
    }

    /// Snapshots of all sources, ordered by id.
    pub fn list(&self) -> Vec<SourceInfo> {
        let entries: Vec<_> = read_or_recover(&self.sources).values().cloned().collect();
        entries.iter().map(|entry| entry.info()).collect()
    }

    pub fn get(&self, id: &str) -> ControlResult<SourceInfo> {
        Ok(self.entry(id)?.info())
    }

    pub fn contains(&self, id: &str) -> bool {
        read_or_recover(&self.sources).contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        read_or_recover(&self.sources).keys().cloned().collect()
    }

    /// Stop every source. Used on shutdown.
    pub fn stop_all(&self) {
        for id in self.ids() {
            if let Err(err) = self.stop(&id) {
                log::debug!("stop {} during shutdown: {}", id, err);
            }
        }
    }
}

impl Drop for SourceRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureSettings;
    use crate::detect::{
        BackendFactory, DetectionPool, DetectionResult, DetectorBackend, PoolConfig,
        ResultHandler, StubBackend,
    };
    use crate::dispatch::{DispatcherConfig, EventDispatcher, InMemoryOutbox, MemorySink};
    use crate::error::{CaptureError, DetectionError};
    use crate::frame::{FrameBuffer, PutOutcome};
    use crate::ingest::{FrameReader, TransportOpener};
    use std::time::{Duration, Instant};

    struct Discard;

    impl ResultHandler for Discard {
        fn handle(&self, _: DetectionResult) -> PutOutcome {
            PutOutcome::Applied
        }
    }

    struct Unreachable;

    impl TransportOpener for Unreachable {
        fn open(&self, source: &SourceSpec) -> Result<Box<dyn FrameReader>, CaptureError> {
            Err(CaptureError::Transport(format!("{} unreachable", source.url)))
        }
    }

    fn registry() -> (SourceRegistry, EventDispatcher, MemorySink) {
        let factory: BackendFactory =
            Arc::new(|| -> Result<Box<dyn DetectorBackend>, DetectionError> {
                Ok(Box::new(StubBackend::new()))
            });
        let pool = DetectionPool::start(PoolConfig::default(), factory, Arc::new(Discard)).unwrap();
        let sink = MemorySink::new();
        let dispatcher = EventDispatcher::start(
            DispatcherConfig::default(),
            Box::new(sink.clone()),
            Box::new(InMemoryOutbox::new(64)),
        )
        .unwrap();
        let context = Arc::new(CaptureContext {
            opener: Arc::new(Unreachable),
            buffer: Arc::new(FrameBuffer::new()),
            pool: Arc::new(pool),
            events: dispatcher.emitter(),
            settings: CaptureSettings {
                frame_skip: 1,
                backoff_base: Duration::from_millis(20),
                backoff_max: Duration::from_millis(20),
            },
        });
        (SourceRegistry::new(context), dispatcher, sink)
    }

    #[test]
    fn add_rejects_duplicates_and_bad_specs() {
        let (registry, _d, _s) = registry();
        let info = registry.add(SourceSpec::new("cam1", "stub://", 64, 48)).unwrap();
        assert_eq!(info.state, SourceState::Stopped);
        assert_eq!(
            registry
                .add(SourceSpec::new("cam1", "stub://", 64, 48))
                .unwrap_err(),
            ControlError::DuplicateSource("cam1".into())
        );
        assert!(matches!(
            registry.add(SourceSpec::new("cam2", "stub://", 0, 48)),
            Err(ControlError::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.add(SourceSpec::new("", "stub://", 64, 48)),
            Err(ControlError::InvalidArgument(_))
        ));
    }

    #[test]
    fn lifecycle_rejects_invalid_operations() {
        let (registry, _d, _s) = registry();
        assert_eq!(
            registry.start("ghost"),
            Err(ControlError::NotFound("ghost".into()))
        );
        registry.add(SourceSpec::new("cam", "rtsp://nowhere", 64, 48)).unwrap();

        registry.stop("cam").unwrap();
        registry.start("cam").unwrap();
        assert_eq!(
            registry.start("cam"),
            Err(ControlError::AlreadyRunning("cam".into()))
        );
        assert_eq!(
            registry.remove("cam").unwrap_err(),
            ControlError::SourceBusy("cam".into())
        );

        registry.stop("cam").unwrap();
        registry.stop("cam").unwrap();
        assert_eq!(registry.get("cam").unwrap().state, SourceState::Stopped);
        registry.remove("cam").unwrap();
        assert_eq!(registry.get("cam").unwrap_err(), ControlError::NotFound("cam".into()));
        assert_eq!(registry.stop("cam"), Err(ControlError::NotFound("cam".into())));
    }

    #[test]
    fn failing_source_reports_error_duration_and_status_events() {
        let (registry, _dispatcher, sink) = registry();
        registry.add(SourceSpec::new("cam", "rtsp://nowhere", 64, 48)).unwrap();
        registry.start("cam").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let info = registry.get("cam").unwrap();
            if info.reconnect_attempt >= 2 {
                assert!(info.error_since.is_some());
                assert!(info.error_duration.is_some());
                assert!(info.last_error.unwrap().contains("unreachable"));
                break;
            }
            assert!(Instant::now() < deadline, "source never retried");
            std::thread::sleep(Duration::from_millis(5));
        }
        registry.stop("cam").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !sink.topics().iter().any(|t| t.ends_with("/cam/status")) {
            assert!(Instant::now() < deadline, "no status event delivered");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn sources_are_listed_in_id_order() {
        let (registry, _d, _s) = registry();
        for id in ["b", "c", "a"] {
            registry.add(SourceSpec::new(id, "stub://", 8, 8)).unwrap();
        }
        let ids: Vec<_> = registry.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
