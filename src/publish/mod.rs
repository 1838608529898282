//! Stream publisher.
//!
//! Every active stream runs its own ticker thread at the stream framerate.
//! A tick snapshots the source's frame/detection pair from the frame buffer,
//! annotates it for `annotated` streams and hands it to the stream's encoder.
//! Capture never waits on a publisher: the only shared step is cloning two
//! `Arc`s out of the frame buffer.

mod encoder;

pub use encoder::{encode_jpeg, EncodedPacket, Encoder, MjpegEncoder, JPEG_QUALITY};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use image::RgbImage;
use serde::Serialize;

use crate::annotate::{annotate, HeatmapStore};
use crate::error::{ControlError, ControlResult};
use crate::frame::{Frame, FrameBuffer};
use crate::lock_or_recover;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Raw,
    Annotated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StreamState {
    Active,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamSpec {
    pub id: String,
    pub source_id: String,
    pub kind: StreamKind,
    pub framerate: u32,
    /// kbit/s, passed through to the encoder.
    pub bitrate: u32,
    pub width: u32,
    pub height: u32,
}

impl StreamSpec {
    pub fn new(id: impl Into<String>, source_id: impl Into<String>, kind: StreamKind) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            kind,
            framerate: 30,
            bitrate: 1000,
            width: 640,
            height: 480,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_framerate(mut self, framerate: u32) -> Self {
        self.framerate = framerate;
        self
    }

    fn tick(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.framerate.max(1)))
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StreamInfo {
    #[serde(flatten)]
    pub spec: StreamSpec,
    pub state: StreamState,
    pub frames_encoded: u64,
    pub encode_errors: u64,
}

/// Builds the encoder for a new stream.
pub type EncoderFactory = Arc<dyn Fn(&StreamSpec) -> Box<dyn Encoder> + Send + Sync>;

pub fn mjpeg_factory() -> EncoderFactory {
    Arc::new(|spec: &StreamSpec| {
        Box::new(MjpegEncoder::new(spec.width, spec.height)) as Box<dyn Encoder>
    })
}

#[derive(Default)]
struct StreamCounters {
    encoded: AtomicU64,
    errors: AtomicU64,
}

struct StreamHandle {
    spec: StreamSpec,
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
    latest: Arc<Mutex<Option<EncodedPacket>>>,
    counters: Arc<StreamCounters>,
}

impl StreamHandle {
    fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("stream {}: publisher thread panicked", self.spec.id);
            }
        }
    }
}

pub struct StreamPublisher {
    buffer: Arc<FrameBuffer>,
    heatmaps: Option<Arc<HeatmapStore>>,
    encoders: EncoderFactory,
    streams: Mutex<HashMap<String, StreamHandle>>,
}

impl StreamPublisher {
    /// `heatmaps` is blended into annotated streams when given.
    pub fn new(
        buffer: Arc<FrameBuffer>,
        heatmaps: Option<Arc<HeatmapStore>>,
        encoders: EncoderFactory,
    ) -> Self {
        Self {
            buffer,
            heatmaps,
            encoders,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn create_stream(&self, spec: StreamSpec) -> ControlResult<()> {
        if spec.id.trim().is_empty() {
            return Err(ControlError::InvalidArgument("stream id is empty".into()));
        }
        if spec.framerate == 0 || spec.width == 0 || spec.height == 0 {
            return Err(ControlError::InvalidArgument(format!(
                "stream {}: framerate and resolution must be non-zero",
                spec.id
            )));
        }
        let mut streams = lock_or_recover(&self.streams);
        if streams.contains_key(&spec.id) {
            return Err(ControlError::DuplicateStream(spec.id));
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let latest = Arc::new(Mutex::new(None));
        let counters = Arc::new(StreamCounters::default());
        let mut worker = StreamWorker {
            spec: spec.clone(),
            buffer: self.buffer.clone(),
            heatmaps: self.heatmaps.clone(),
            encoder: (self.encoders)(&spec),
            latest: latest.clone(),
            counters: counters.clone(),
            last_key: None,
        };
        let tick = spec.tick();
        let name = format!("stream-{}", spec.id);
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || loop {
                worker.tick();
                match stop_rx.recv_timeout(tick) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            })
            .map_err(|e| {
                log::error!("stream {}: cannot spawn worker thread: {}", spec.id, e);
                ControlError::spawn_failed(&name, &e)
            })?;

        log::info!(
            "stream {} created for source {} ({:?}, {}x{} @ {} fps)",
            spec.id,
            spec.source_id,
            spec.kind,
            spec.width,
            spec.height,
            spec.framerate
        );
        streams.insert(
            spec.id.clone(),
            StreamHandle {
                spec,
                stop_tx,
                thread: Some(thread),
                latest,
                counters,
            },
        );
        Ok(())
    }

    pub fn remove_stream(&self, stream_id: &str) -> ControlResult<()> {
        let handle = lock_or_recover(&self.streams).remove(stream_id);
        let mut handle = handle.ok_or_else(|| ControlError::NotFound(stream_id.to_string()))?;
        handle.stop();
        log::info!("stream {stream_id} removed");
        Ok(())
    }

    /// Remove every stream fed by `source_id`. Returns the removed ids.
    pub fn remove_streams_for(&self, source_id: &str) -> Vec<String> {
        let removed: Vec<StreamHandle> = {
            let mut streams = lock_or_recover(&self.streams);
            let ids: Vec<String> = streams
                .values()
                .filter(|h| h.spec.source_id == source_id)
                .map(|h| h.spec.id.clone())
                .collect();
            ids.iter().filter_map(|id| streams.remove(id)).collect()
        };
        removed
            .into_iter()
            .map(|mut handle| {
                handle.stop();
                log::info!("stream {} removed with source {}", handle.spec.id, source_id);
                handle.spec.id
            })
            .collect()
    }

    pub fn streams(&self) -> Vec<StreamInfo> {
        let streams = lock_or_recover(&self.streams);
        let mut out: Vec<StreamInfo> = streams
            .values()
            .map(|h| StreamInfo {
                spec: h.spec.clone(),
                state: if h.thread.is_some() {
                    StreamState::Active
                } else {
                    StreamState::Stopped
                },
                frames_encoded: h.counters.encoded.load(Ordering::Relaxed),
                encode_errors: h.counters.errors.load(Ordering::Relaxed),
            })
            .collect();
        out.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        out
    }

    /// Most recent packet produced for the stream, for external muxers.
    pub fn latest_packet(&self, stream_id: &str) -> ControlResult<Option<EncodedPacket>> {
        let streams = lock_or_recover(&self.streams);
        let handle = streams
            .get(stream_id)
            .ok_or_else(|| ControlError::NotFound(stream_id.to_string()))?;
        let packet = lock_or_recover(&handle.latest).clone();
        Ok(packet)
    }

    pub fn shutdown(&self) {
        let handles: Vec<StreamHandle> = lock_or_recover(&self.streams)
            .drain()
            .map(|(_, h)| h)
            .collect();
        for mut handle in handles {
            handle.stop();
        }
    }
}

impl Drop for StreamPublisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// What was last encoded: frame sequence and detection sequence.
type TickKey = (Option<u64>, Option<u64>);

struct StreamWorker {
    spec: StreamSpec,
    buffer: Arc<FrameBuffer>,
    heatmaps: Option<Arc<HeatmapStore>>,
    encoder: Box<dyn Encoder>,
    latest: Arc<Mutex<Option<EncodedPacket>>>,
    counters: Arc<StreamCounters>,
    last_key: Option<TickKey>,
}

impl StreamWorker {
    fn tick(&mut self) {
        let (frame, detection) = self.buffer.snapshot(&self.spec.source_id);
        let detection = match self.spec.kind {
            StreamKind::Raw => None,
            StreamKind::Annotated => detection,
        };
        let key = (
            frame.as_ref().map(|f| f.sequence()),
            detection.as_ref().map(|d| d.for_sequence),
        );
        if self.last_key == Some(key) {
            return;
        }

        let frame = match frame {
            Some(frame) => match self.spec.kind {
                StreamKind::Raw => frame,
                StreamKind::Annotated => {
                    let heatmap = self
                        .heatmaps
                        .as_ref()
                        .and_then(|store| store.get(&self.spec.source_id));
                    Arc::new(annotate(&frame, detection.as_deref(), heatmap.as_ref()))
                }
            },
            None => Arc::new(placeholder(&self.spec)),
        };

        match self.encoder.encode(&frame) {
            Ok(packet) => {
                *lock_or_recover(&self.latest) = Some(packet);
                self.counters.encoded.fetch_add(1, Ordering::Relaxed);
                self.last_key = Some(key);
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("stream {}: {e}", self.spec.id);
            }
        }
    }
}

/// Black frame at the stream resolution, shown until the source has data.
pub fn placeholder(spec: &StreamSpec) -> Frame {
    Frame::new(
        spec.source_id.clone(),
        0,
        RgbImage::new(spec.width.max(1), spec.height.max(1)),
    )
}
