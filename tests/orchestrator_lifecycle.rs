use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};
use tempfile::TempDir;

use video_analytics::dispatch::MemorySink;
use video_analytics::ingest::{FrameReader, RawImage, TransportOpener};
use video_analytics::publish::{StreamKind, StreamSpec};
use video_analytics::{
    CaptureError, ControlError, FrameReply, Orchestrator, OrchestratorSettings, SourceSpec,
    SourceState,
};

fn wait_until<T>(what: &str, mut probe: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(value) = probe() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn fast_settings(backend: &str) -> OrchestratorSettings {
    let mut settings = OrchestratorSettings::default();
    settings.backend = backend.to_string();
    settings.ingest.target_fps = 50;
    settings.capture.backoff_base = Duration::from_millis(10);
    settings.capture.backoff_max = Duration::from_millis(40);
    settings
}

fn car_image(dir: &TempDir) -> std::path::PathBuf {
    let mut image = RgbImage::from_pixel(96, 64, Rgb([40, 40, 40]));
    for y in 20..44 {
        for x in 30..70 {
            image.put_pixel(x, y, Rgb([200, 30, 30]));
        }
    }
    let path = dir.path().join("car.png");
    image.save(&path).expect("write fixture");
    path
}

#[test]
fn local_file_source_end_to_end() {
    let dir = TempDir::new().unwrap();
    let path = car_image(&dir);
    let sink = MemorySink::new();
    let pipeline = Orchestrator::builder(fast_settings("stub"))
        .sink(Box::new(sink.clone()))
        .build()
        .unwrap();

    let info = pipeline
        .add_source(SourceSpec::new("local_car", path.to_string_lossy(), 96, 64))
        .unwrap();
    assert_eq!(info.state, SourceState::Stopped);
    assert_eq!(pipeline.frame("local_car", false).unwrap(), FrameReply::NoData);

    pipeline.start_source("local_car").unwrap();

    let jpeg = wait_until("first frame", || match pipeline.frame("local_car", false) {
        Ok(FrameReply::Image(bytes)) => Some(bytes),
        _ => None,
    });
    assert!(!jpeg.is_empty());
    let decoded = image::load_from_memory(&jpeg).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (96, 64));

    let result = wait_until("detections", || pipeline.detections("local_car").unwrap());
    assert_eq!(result.source_id, "local_car");
    assert!(result.for_sequence >= 1);

    assert!(pipeline.frame("local_car", true).unwrap().is_image());
    let info = pipeline.source("local_car").unwrap();
    assert_eq!(info.state, SourceState::Running);
    assert!(info.last_frame_at.is_some());
    assert_eq!(info.resolution(), (96, 64));

    assert_eq!(
        pipeline.remove_source("local_car").unwrap_err(),
        ControlError::SourceBusy("local_car".into())
    );
    pipeline.stop_source("local_car").unwrap();
    assert_eq!(pipeline.source("local_car").unwrap().state, SourceState::Stopped);
    pipeline.remove_source("local_car").unwrap();

    assert_eq!(
        pipeline.frame("local_car", false).unwrap_err(),
        ControlError::NotFound("local_car".into())
    );
    assert_eq!(
        pipeline.detections("local_car").unwrap_err(),
        ControlError::NotFound("local_car".into())
    );
    assert!(pipeline.sources().is_empty());

    wait_until("detection event", || {
        sink.topics()
            .iter()
            .any(|t| t == "video_analytics/sources/local_car/detections")
            .then_some(())
    });
}

#[test]
fn sequences_keep_increasing_across_restarts() {
    let pipeline = Orchestrator::builder(fast_settings("motion"))
        .sink(Box::new(MemorySink::new()))
        .build()
        .unwrap();
    pipeline
        .add_source(SourceSpec::new("cam", "stub://pattern", 64, 48))
        .unwrap();

    pipeline.start_source("cam").unwrap();
    wait_until("frames", || {
        (pipeline.source("cam").unwrap().frames_captured >= 3).then_some(())
    });
    pipeline.stop_source("cam").unwrap();
    let before = pipeline.latest_frame("cam", false).unwrap().unwrap().sequence();

    pipeline.start_source("cam").unwrap();
    let after = wait_until("frame after restart", || {
        let seq = pipeline.latest_frame("cam", false).unwrap()?.sequence();
        (seq > before).then_some(seq)
    });
    assert!(after > before);
    pipeline.stop_source("cam").unwrap();
}

/// Refuses the first few connections, then serves a solid grey image.
struct RecoveringOpener {
    refusals: usize,
    opens: Arc<AtomicUsize>,
}

struct GreyReader;

impl FrameReader for GreyReader {
    fn read_frame(&mut self) -> Result<RawImage, CaptureError> {
        Ok(RawImage::rgb(32, 32, vec![128; 32 * 32 * 3]))
    }

    fn frame_interval(&self) -> Option<Duration> {
        Some(Duration::from_millis(10))
    }
}

impl TransportOpener for RecoveringOpener {
    fn open(&self, _: &SourceSpec) -> Result<Box<dyn FrameReader>, CaptureError> {
        if self.opens.fetch_add(1, Ordering::SeqCst) < self.refusals {
            Err(CaptureError::Transport("camera offline".into()))
        } else {
            Ok(Box::new(GreyReader))
        }
    }
}

#[test]
fn flaky_transport_recovers_and_reports_status() {
    let opens = Arc::new(AtomicUsize::new(0));
    let sink = MemorySink::new();
    let pipeline = Orchestrator::builder(fast_settings("stub"))
        .opener(Arc::new(RecoveringOpener {
            refusals: 3,
            opens: Arc::clone(&opens),
        }))
        .sink(Box::new(sink.clone()))
        .build()
        .unwrap();
    pipeline
        .add_source(SourceSpec::new("gate", "rtsp://gate/stream", 32, 32))
        .unwrap();
    pipeline.start_source("gate").unwrap();
    assert_eq!(
        pipeline.start_source("gate").unwrap_err(),
        ControlError::AlreadyRunning("gate".into())
    );

    wait_until("recovery", || {
        let info = pipeline.source("gate").unwrap();
        (info.state == SourceState::Running && info.frames_captured > 0).then_some(())
    });
    assert!(opens.load(Ordering::SeqCst) >= 4);
    let info = pipeline.source("gate").unwrap();
    assert_eq!(info.reconnect_attempt, 0);
    assert!(info.error_since.is_none());

    let states = wait_until("status events", || {
        let states: Vec<String> = sink
            .messages()
            .iter()
            .filter(|m| m.topic.ends_with("/gate/status"))
            .filter_map(|m| serde_json::from_slice::<serde_json::Value>(&m.payload).ok())
            .filter_map(|v| v["payload"]["state"].as_str().map(str::to_string))
            .collect();
        states.iter().any(|s| s == "running").then_some(states)
    });
    assert!(states.iter().filter(|s| *s == "error").count() >= 3);
    pipeline.stop_source("gate").unwrap();
}

#[test]
fn annotated_stream_publishes_packets() {
    let pipeline = Orchestrator::builder(fast_settings("stub"))
        .sink(Box::new(MemorySink::new()))
        .build()
        .unwrap();
    pipeline
        .add_source(SourceSpec::new("cam", "stub://", 64, 48))
        .unwrap();
    pipeline
        .create_stream(
            StreamSpec::new("cam-annotated", "cam", StreamKind::Annotated)
                .with_resolution(32, 24)
                .with_framerate(20),
        )
        .unwrap();
    assert_eq!(
        pipeline
            .create_stream(StreamSpec::new("cam-annotated", "cam", StreamKind::Raw))
            .unwrap_err(),
        ControlError::DuplicateStream("cam-annotated".into())
    );

    let placeholder = wait_until("placeholder", || {
        pipeline.latest_packet("cam-annotated").unwrap()
    });
    assert_eq!(placeholder.sequence, 0);

    pipeline.start_source("cam").unwrap();
    let packet = wait_until("live packet", || {
        pipeline
            .latest_packet("cam-annotated")
            .unwrap()
            .filter(|p| p.sequence > 0)
    });
    let decoded = image::load_from_memory(&packet.data).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (32, 24));

    pipeline.remove_stream("cam-annotated").unwrap();
    assert_eq!(
        pipeline.remove_stream("cam-annotated").unwrap_err(),
        ControlError::NotFound("cam-annotated".into())
    );
    pipeline.shutdown();
}

/// Delivers one frame, then hangs on every read.
struct HangingOpener;

struct HangingReader {
    delivered: bool,
}

impl FrameReader for HangingReader {
    fn read_frame(&mut self) -> Result<RawImage, CaptureError> {
        if self.delivered {
            std::thread::sleep(Duration::from_secs(8));
        }
        self.delivered = true;
        Ok(RawImage::rgb(16, 16, vec![90; 16 * 16 * 3]))
    }
}

impl TransportOpener for HangingOpener {
    fn open(&self, _: &SourceSpec) -> Result<Box<dyn FrameReader>, CaptureError> {
        Ok(Box::new(HangingReader { delivered: false }))
    }
}

#[test]
fn stop_source_does_not_wait_for_a_hung_read() {
    let pipeline = Orchestrator::builder(fast_settings("stub"))
        .opener(Arc::new(HangingOpener))
        .sink(Box::new(MemorySink::new()))
        .build()
        .unwrap();
    pipeline
        .add_source(SourceSpec::new("dock", "rtsp://dock/live", 16, 16))
        .unwrap();
    pipeline.start_source("dock").unwrap();
    wait_until("first frame", || {
        (pipeline.source("dock").unwrap().frames_captured == 1).then_some(())
    });
    std::thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    pipeline.stop_source("dock").unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(pipeline.source("dock").unwrap().state, SourceState::Stopped);
    pipeline.remove_source("dock").unwrap();
}
