//! Capture Task: one thread per running source.
//!
//! ```text
//! Stopped -> Connecting -> Running -> Error -> Connecting -> ... -> Stopped
//! ```
//!
//! Connecting opens the transport; Running caches frames and submits every
//! Kth one for detection; Error waits out the backoff delay.
//!
//! Opening, reading and normalizing happen on a reader thread started per
//! connection, which hands results over a one-slot channel. The capture
//! thread selects between that channel and its stop signal, so a stop never
//! waits for a blocked `open` or `read_frame`. An abandoned reader thread
//! drops its transport as soon as the pending call returns. Panics in the
//! transport or in capture itself count as capture errors and go through
//! backoff like any other failure.

mod backoff;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use image::RgbImage;

use crate::detect::{DetectionPool, SubmitOutcome};
use crate::dispatch::{EventEmitter, EventRecord, StatusChange};
use crate::error::{CaptureError, ControlError};
use crate::frame::{Frame, FrameBuffer};
use crate::ingest::{normalize, FrameReader, TransportOpener};
use crate::lock_or_recover;
use crate::registry::{SourceRuntime, SourceSpec, SourceState};

pub use backoff::Backoff;

#[derive(Clone, Debug)]
pub struct CaptureSettings {
    /// Submit every Kth captured frame for detection.
    pub frame_skip: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            frame_skip: 1,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Collaborators shared by every capture task.
pub struct CaptureContext {
    pub opener: Arc<dyn TransportOpener>,
    pub buffer: Arc<FrameBuffer>,
    pub pool: Arc<DetectionPool>,
    pub events: EventEmitter,
    pub settings: CaptureSettings,
}

/// Owner's side of a running capture thread.
pub(crate) struct CaptureHandle {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl CaptureHandle {
    /// Signal the task and wait for its thread to exit.
    pub(crate) fn stop(self) {
        let _ = self.stop_tx.try_send(());
        if self.thread.join().is_err() {
            log::error!("capture thread panicked");
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

pub(crate) fn spawn(
    spec: SourceSpec,
    runtime: Arc<Mutex<SourceRuntime>>,
    context: Arc<CaptureContext>,
) -> Result<CaptureHandle, ControlError> {
    let (stop_tx, stop_rx) = bounded(1);
    let name = format!("capture-{}", spec.id);
    let task = CaptureTask {
        backoff: Backoff::new(context.settings.backoff_base, context.settings.backoff_max),
        spec,
        runtime,
        context,
        stop_rx,
    };
    let thread = std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || task.run())
        .map_err(|err| {
            log::error!("cannot spawn {}: {}", name, err);
            ControlError::spawn_failed(&name, &err)
        })?;
    Ok(CaptureHandle { stop_tx, thread })
}

enum StreamEnd {
    Stopped,
    Failed(CaptureError),
}

/// What the reader thread hands to the capture thread.
enum ReadEvent {
    Connected,
    Frame(RgbImage),
    Failed(CaptureError),
}

/// One transport connection served by its own reader thread.
struct Connection {
    events: Receiver<ReadEvent>,
    /// Never sent on; dropping it tells the reader thread to quit.
    _done: Sender<()>,
}

impl Connection {
    fn open(spec: &SourceSpec, opener: Arc<dyn TransportOpener>) -> Result<Self, CaptureError> {
        let (events_tx, events) = bounded(1);
        let (done, done_rx) = bounded::<()>(0);
        let spec = spec.clone();
        std::thread::Builder::new()
            .name(format!("read-{}", spec.id))
            .spawn(move || read_loop(&spec, opener.as_ref(), &events_tx, &done_rx))
            .map_err(|err| CaptureError::Transport(format!("spawn reader thread: {err}")))?;
        Ok(Self {
            events,
            _done: done,
        })
    }
}

fn read_loop(
    spec: &SourceSpec,
    opener: &dyn TransportOpener,
    events: &Sender<ReadEvent>,
    done: &Receiver<()>,
) {
    let opened = panic::catch_unwind(AssertUnwindSafe(|| opener.open(spec))).unwrap_or_else(
        |payload| {
            Err(CaptureError::Transport(format!(
                "open panicked: {}",
                panic_message(payload.as_ref())
            )))
        },
    );
    let mut reader = match opened {
        Ok(reader) => reader,
        Err(err) => {
            let _ = events.send(ReadEvent::Failed(err));
            return;
        }
    };
    if events.send(ReadEvent::Connected).is_err() {
        return;
    }

    let interval = reader.frame_interval();
    let mut next_due = Instant::now();
    loop {
        if let Some(interval) = interval {
            let now = Instant::now();
            let wait = next_due.saturating_duration_since(now);
            next_due = next_due.max(now) + interval;
            if !matches!(done.recv_timeout(wait), Err(RecvTimeoutError::Timeout)) {
                return;
            }
        }
        let event = match read_normalized(reader.as_mut(), spec) {
            Ok(image) => ReadEvent::Frame(image),
            Err(err) => ReadEvent::Failed(err),
        };
        let failed = matches!(event, ReadEvent::Failed(_));
        if events.send(event).is_err() || failed {
            return;
        }
    }
}

fn read_normalized(
    reader: &mut dyn FrameReader,
    spec: &SourceSpec,
) -> Result<RgbImage, CaptureError> {
    panic::catch_unwind(AssertUnwindSafe(|| {
        reader
            .read_frame()
            .and_then(|raw| normalize(raw, spec.width, spec.height))
    }))
    .unwrap_or_else(|payload| {
        Err(CaptureError::Decode(format!(
            "reader panicked: {}",
            panic_message(payload.as_ref())
        )))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct CaptureTask {
    spec: SourceSpec,
    runtime: Arc<Mutex<SourceRuntime>>,
    context: Arc<CaptureContext>,
    stop_rx: Receiver<()>,
    backoff: Backoff,
}

impl CaptureTask {
    fn run(mut self) {
        loop {
            self.transition(SourceState::Connecting, None);
            let connection = match self.connect() {
                Ok(connection) => connection,
                Err(StreamEnd::Stopped) => break,
                Err(StreamEnd::Failed(err)) => {
                    if self.fail(err) {
                        continue;
                    }
                    break;
                }
            };

            self.backoff.reset();
            {
                let mut runtime = lock_or_recover(&self.runtime);
                runtime.reconnect_attempt = 0;
                runtime.error_since = None;
                runtime.last_error = None;
            }
            self.transition(SourceState::Running, None);
            log::info!("source {} connected ({})", self.spec.id, self.spec.url);

            let end = panic::catch_unwind(AssertUnwindSafe(|| self.stream(&connection)))
                .unwrap_or_else(|payload| {
                    StreamEnd::Failed(CaptureError::Decode(format!(
                        "capture panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                });
            drop(connection);
            match end {
                StreamEnd::Stopped => break,
                StreamEnd::Failed(err) => {
                    if !self.fail(err) {
                        break;
                    }
                }
            }
        }
        self.transition(SourceState::Stopped, None);
        log::debug!("capture task for {} exited", self.spec.id);
    }

    /// Start a reader thread and wait for it to open the transport.
    fn connect(&self) -> Result<Connection, StreamEnd> {
        let connection = Connection::open(&self.spec, Arc::clone(&self.context.opener))
            .map_err(StreamEnd::Failed)?;
        let event = select! {
            recv(self.stop_rx) -> _ => None,
            recv(connection.events) -> event => Some(event),
        };
        match event {
            None => Err(StreamEnd::Stopped),
            Some(Ok(ReadEvent::Connected)) => Ok(connection),
            Some(Ok(ReadEvent::Failed(err))) => Err(StreamEnd::Failed(err)),
            Some(Ok(ReadEvent::Frame(_)) | Err(_)) => Err(StreamEnd::Failed(
                CaptureError::Transport("reader thread exited while connecting".into()),
            )),
        }
    }

    /// Cache and submit frames until the transport fails or a stop arrives.
    fn stream(&mut self, connection: &Connection) -> StreamEnd {
        let frame_skip = u64::from(self.context.settings.frame_skip.max(1));
        let mut captured: u64 = 0;

        loop {
            let event = select! {
                recv(self.stop_rx) -> _ => None,
                recv(connection.events) -> event => Some(event),
            };
            let image = match event {
                None => return StreamEnd::Stopped,
                Some(Ok(ReadEvent::Frame(image))) => image,
                Some(Ok(ReadEvent::Connected)) => continue,
                Some(Ok(ReadEvent::Failed(err))) => return StreamEnd::Failed(err),
                Some(Err(_)) => {
                    return StreamEnd::Failed(CaptureError::Transport(
                        "reader thread exited".into(),
                    ))
                }
            };

            let sequence = {
                let mut runtime = lock_or_recover(&self.runtime);
                runtime.sequence += 1;
                runtime.frames_captured += 1;
                runtime.last_frame_at = Some(SystemTime::now());
                runtime.sequence
            };
            let frame = Arc::new(Frame::new(self.spec.id.as_str(), sequence, image));
            if !self.context.buffer.put_frame(Arc::clone(&frame)) {
                log::debug!("frame {} for {} not cached", sequence, self.spec.id);
                continue;
            }

            if captured % frame_skip == 0 {
                match self.context.pool.submit(frame) {
                    SubmitOutcome::Queued => {}
                    SubmitOutcome::Replaced => {
                        log::debug!("{}: frame {} replaced queued job", self.spec.id, sequence)
                    }
                    SubmitOutcome::Evicted => {
                        log::debug!("{}: detection queue full, evicted oldest", self.spec.id)
                    }
                    SubmitOutcome::Closed => {}
                }
            }
            captured += 1;
        }
    }

    /// Enter Error, publish it and wait out the backoff delay. Returns false
    /// if a stop arrived during the wait.
    fn fail(&mut self, err: CaptureError) -> bool {
        let delay = self.backoff.next_delay();
        let attempt = self.backoff.attempt();
        {
            let mut runtime = lock_or_recover(&self.runtime);
            runtime.reconnect_attempt = attempt;
            runtime.error_since.get_or_insert_with(SystemTime::now);
            runtime.last_error = Some(err.to_string());
        }
        self.transition(SourceState::Error, Some(err.to_string()));
        log::warn!(
            "source {}: {} (attempt {}, retry in {:?})",
            self.spec.id,
            err,
            attempt,
            delay
        );

        matches!(self.stop_rx.recv_timeout(delay), Err(RecvTimeoutError::Timeout))
    }

    fn transition(&self, next: SourceState, error: Option<String>) {
        let change = {
            let mut runtime = lock_or_recover(&self.runtime);
            let previous = runtime.state;
            if previous != next && !previous.can_transition_to(next) {
                log::warn!(
                    "source {}: unexpected transition {} -> {}",
                    self.spec.id,
                    previous,
                    next
                );
            }
            runtime.state = next;
            log::debug!("source {}: {} -> {}", self.spec.id, previous, next);
            StatusChange {
                state: next,
                reconnect_attempt: runtime.reconnect_attempt,
                error,
                error_secs: runtime
                    .error_since
                    .and_then(|since| SystemTime::now().duration_since(since).ok())
                    .map(|elapsed| elapsed.as_secs()),
            }
        };
        self.context
            .events
            .emit(EventRecord::status(&self.spec.id, &change));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{
        BackendFactory, DetectionResult, DetectorBackend, PoolConfig, ResultHandler, StubBackend,
    };
    use crate::dispatch::{DispatcherConfig, EventDispatcher, InMemoryOutbox, MemorySink};
    use crate::error::DetectionError;
    use crate::frame::PutOutcome;
    use crate::ingest::{PixelFormat, RawImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Discard;

    impl ResultHandler for Discard {
        fn handle(&self, _: DetectionResult) -> PutOutcome {
            PutOutcome::Applied
        }
    }

    /// Fails the first `failures` opens, then serves 4x4 frames forever.
    struct FlakyOpener {
        failures: usize,
        opens: AtomicUsize,
    }

    struct SolidReader;

    impl FrameReader for SolidReader {
        fn read_frame(&mut self) -> Result<RawImage, CaptureError> {
            Ok(RawImage::rgb(4, 4, vec![7; 4 * 4 * 3]))
        }

        fn frame_interval(&self) -> Option<Duration> {
            Some(Duration::from_millis(2))
        }
    }

    impl TransportOpener for FlakyOpener {
        fn open(&self, _: &SourceSpec) -> Result<Box<dyn FrameReader>, CaptureError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(CaptureError::Transport("connection refused".into()))
            } else {
                Ok(Box::new(SolidReader))
            }
        }
    }

    fn context(
        opener: impl TransportOpener + 'static,
        settings: CaptureSettings,
    ) -> (Arc<CaptureContext>, EventDispatcher) {
        let factory: BackendFactory = Arc::new(|| -> Result<Box<dyn DetectorBackend>, DetectionError> {
            Ok(Box::new(StubBackend::new()))
        });
        let pool = DetectionPool::start(PoolConfig::default(), factory, Arc::new(Discard)).unwrap();
        let dispatcher = EventDispatcher::start(
            DispatcherConfig::default(),
            Box::new(MemorySink::new()),
            Box::new(InMemoryOutbox::new(64)),
        )
        .unwrap();
        let context = Arc::new(CaptureContext {
            opener: Arc::new(opener),
            buffer: Arc::new(FrameBuffer::new()),
            pool: Arc::new(pool),
            events: dispatcher.emitter(),
            settings,
        });
        (context, dispatcher)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn recovers_after_failures_and_resets_attempts() {
        let settings = CaptureSettings {
            frame_skip: 1,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
        };
        let opener = FlakyOpener {
            failures: 3,
            opens: AtomicUsize::new(0),
        };
        let (context, _dispatcher) = context(opener, settings);
        context.buffer.register("cam");
        let runtime = Arc::new(Mutex::new(SourceRuntime::default()));
        let handle = spawn(SourceSpec::new("cam", "stub://", 4, 4), Arc::clone(&runtime), Arc::clone(&context)).unwrap();

        assert!(wait_for(|| lock_or_recover(&runtime).frames_captured >= 3));
        {
            let runtime = lock_or_recover(&runtime);
            assert_eq!(runtime.state, SourceState::Running);
            assert_eq!(runtime.reconnect_attempt, 0);
            assert!(runtime.error_since.is_none());
        }
        handle.stop();
        assert_eq!(lock_or_recover(&runtime).state, SourceState::Stopped);
        assert!(context.buffer.get_frame("cam").is_some());
    }

    #[test]
    fn stop_interrupts_backoff_wait() {
        let settings = CaptureSettings {
            frame_skip: 1,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(30),
        };
        let opener = FlakyOpener {
            failures: usize::MAX,
            opens: AtomicUsize::new(0),
        };
        let (context, _dispatcher) = context(opener, settings);
        let runtime = Arc::new(Mutex::new(SourceRuntime::default()));
        let handle = spawn(SourceSpec::new("cam", "rtsp://gone", 4, 4), Arc::clone(&runtime), context).unwrap();

        assert!(wait_for(|| lock_or_recover(&runtime).state == SourceState::Error));
        {
            let runtime = lock_or_recover(&runtime);
            assert_eq!(runtime.reconnect_attempt, 1);
            assert!(runtime.error_since.is_some());
            assert!(runtime.last_error.as_deref().unwrap_or("").contains("refused"));
        }
        let started = Instant::now();
        handle.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(lock_or_recover(&runtime).state, SourceState::Stopped);
    }

    #[test]
    fn frame_skip_submits_every_kth_frame() {
        let settings = CaptureSettings {
            frame_skip: 3,
            ..CaptureSettings::default()
        };
        let opener = FlakyOpener {
            failures: 0,
            opens: AtomicUsize::new(0),
        };
        let (context, _dispatcher) = context(opener, settings);
        context.buffer.register("cam");
        let runtime = Arc::new(Mutex::new(SourceRuntime::default()));
        let handle = spawn(SourceSpec::new("cam", "stub://", 4, 4), Arc::clone(&runtime), Arc::clone(&context)).unwrap();

        assert!(wait_for(|| lock_or_recover(&runtime).frames_captured >= 9));
        handle.stop();
        let captured = lock_or_recover(&runtime).frames_captured;
        let submitted = context.pool.stats().submitted;
        assert_eq!(submitted, captured.div_ceil(3));
    }

    /// Opens after `open_delay`; every read after the first `ready` frames
    /// blocks for `read_delay`.
    struct SlowOpener {
        open_delay: Duration,
        read_delay: Duration,
        ready: usize,
    }

    struct SlowReader {
        read_delay: Duration,
        ready: usize,
    }

    impl FrameReader for SlowReader {
        fn read_frame(&mut self) -> Result<RawImage, CaptureError> {
            if self.ready == 0 {
                std::thread::sleep(self.read_delay);
            } else {
                self.ready -= 1;
            }
            Ok(RawImage::rgb(4, 4, vec![7; 4 * 4 * 3]))
        }
    }

    impl TransportOpener for SlowOpener {
        fn open(&self, _: &SourceSpec) -> Result<Box<dyn FrameReader>, CaptureError> {
            std::thread::sleep(self.open_delay);
            Ok(Box::new(SlowReader {
                read_delay: self.read_delay,
                ready: self.ready,
            }))
        }
    }

    #[test]
    fn stop_interrupts_a_blocked_read() {
        let opener = SlowOpener {
            open_delay: Duration::ZERO,
            read_delay: Duration::from_secs(8),
            ready: 1,
        };
        let (context, _dispatcher) = context(opener, CaptureSettings::default());
        context.buffer.register("cam");
        let runtime = Arc::new(Mutex::new(SourceRuntime::default()));
        let handle = spawn(SourceSpec::new("cam", "rtsp://slow", 4, 4), Arc::clone(&runtime), context).unwrap();

        assert!(wait_for(|| lock_or_recover(&runtime).frames_captured == 1));
        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        handle.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(lock_or_recover(&runtime).state, SourceState::Stopped);
    }

    #[test]
    fn stop_interrupts_a_blocked_open() {
        let opener = SlowOpener {
            open_delay: Duration::from_secs(8),
            read_delay: Duration::ZERO,
            ready: 0,
        };
        let (context, _dispatcher) = context(opener, CaptureSettings::default());
        let runtime = Arc::new(Mutex::new(SourceRuntime::default()));
        let handle = spawn(SourceSpec::new("cam", "rtsp://slow", 4, 4), Arc::clone(&runtime), context).unwrap();

        assert!(wait_for(|| lock_or_recover(&runtime).state == SourceState::Connecting));
        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        handle.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(lock_or_recover(&runtime).state, SourceState::Stopped);
    }

    /// Serves frames built by `make`, counting opens.
    struct FnOpener<F> {
        make: F,
        opens: Arc<AtomicUsize>,
    }

    struct FnReader<F>(F);

    impl<F> FrameReader for FnReader<F>
    where
        F: Fn() -> RawImage + Send + Sync + Clone,
    {
        fn read_frame(&mut self) -> Result<RawImage, CaptureError> {
            Ok((self.0)())
        }

        fn frame_interval(&self) -> Option<Duration> {
            Some(Duration::from_millis(2))
        }
    }

    impl<F> TransportOpener for FnOpener<F>
    where
        F: Fn() -> RawImage + Send + Sync + Clone + 'static,
    {
        fn open(&self, _: &SourceSpec) -> Result<Box<dyn FrameReader>, CaptureError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FnReader(self.make.clone())))
        }
    }

    fn fast_retry() -> CaptureSettings {
        CaptureSettings {
            frame_skip: 1,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
        }
    }

    #[test]
    fn reader_panic_enters_error_and_retries() {
        let opens = Arc::new(AtomicUsize::new(0));
        let opener = FnOpener {
            make: || -> RawImage { panic!("decoder bug") },
            opens: Arc::clone(&opens),
        };
        let (context, _dispatcher) = context(opener, fast_retry());
        let runtime = Arc::new(Mutex::new(SourceRuntime::default()));
        let handle = spawn(SourceSpec::new("cam", "rtsp://cam", 4, 4), Arc::clone(&runtime), context).unwrap();

        assert!(wait_for(|| opens.load(Ordering::SeqCst) >= 3));
        assert!(wait_for(|| {
            let runtime = lock_or_recover(&runtime);
            runtime.state == SourceState::Error
                && runtime.reconnect_attempt >= 1
                && runtime
                    .last_error
                    .as_deref()
                    .is_some_and(|e| e.contains("decoder bug"))
        }));
        assert_eq!(lock_or_recover(&runtime).frames_captured, 0);
        handle.stop();
        assert_eq!(lock_or_recover(&runtime).state, SourceState::Stopped);
    }

    #[test]
    fn odd_sized_nv12_frames_are_captured() {
        let opener = FnOpener {
            make: || RawImage {
                pixels: vec![128; 9 + 8],
                width: 3,
                height: 3,
                format: PixelFormat::Nv12,
            },
            opens: Arc::new(AtomicUsize::new(0)),
        };
        let (context, _dispatcher) = context(opener, fast_retry());
        context.buffer.register("cam");
        let runtime = Arc::new(Mutex::new(SourceRuntime::default()));
        let handle = spawn(SourceSpec::new("cam", "rtsp://cam", 3, 3), Arc::clone(&runtime), Arc::clone(&context)).unwrap();

        assert!(wait_for(|| lock_or_recover(&runtime).frames_captured >= 3));
        assert_eq!(lock_or_recover(&runtime).state, SourceState::Running);
        assert_eq!(context.buffer.get_frame("cam").unwrap().width(), 3);
        handle.stop();
    }
}
