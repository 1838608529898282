//! Pipeline facade.
//!
//! `Orchestrator` owns one instance of every stage and exposes the control
//! and read surface external collaborators use (an API server, the daemon,
//! tests). Dependencies are injected through `OrchestratorBuilder`, so
//! transports, detectors and the event sink can be replaced by test doubles.

use std::sync::Arc;

use serde::Serialize;

use crate::annotate::{annotate, HeatmapStore};
use crate::capture::{CaptureContext, CaptureSettings};
use crate::detect::{
    BackendFactory, BackendRegistry, DetectionPool, DetectionResult, DetectorSettings, PoolConfig,
    PoolStats, ResultHandler,
};
use crate::dispatch::{
    DispatchStats, DispatcherConfig, EventDispatcher, EventEmitter, EventRecord, EventSink,
    InMemoryOutbox, LogSink, Outbox,
};
use crate::error::{ControlError, ControlResult};
use crate::frame::{Frame, FrameBuffer, PutOutcome};
use crate::ingest::{DefaultOpener, IngestOptions, TransportOpener};
use crate::publish::{
    encode_jpeg, mjpeg_factory, EncodedPacket, EncoderFactory, StreamInfo, StreamPublisher,
    StreamSpec, JPEG_QUALITY,
};
use crate::registry::{SourceInfo, SourceRegistry, SourceSpec};

/// Answer to a frame request for a known source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameReply {
    /// JPEG bytes.
    Image(Vec<u8>),
    /// The source has not produced a frame yet.
    NoData,
}

impl FrameReply {
    pub fn is_image(&self) -> bool {
        matches!(self, FrameReply::Image(_))
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub capture: CaptureSettings,
    pub ingest: IngestOptions,
    pub pool: PoolConfig,
    pub detector: DetectorSettings,
    /// Name in the backend registry; ignored when a factory is injected.
    pub backend: String,
    pub heatmap: bool,
    pub dispatcher: DispatcherConfig,
    pub outbox_capacity: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            capture: CaptureSettings::default(),
            ingest: IngestOptions::default(),
            pool: PoolConfig::default(),
            detector: DetectorSettings::default(),
            backend: "motion".to_string(),
            heatmap: true,
            dispatcher: DispatcherConfig::default(),
            outbox_capacity: 1000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct PipelineStats {
    pub sources: usize,
    pub streams: usize,
    pub detection: PoolStats,
    pub events: DispatchStats,
}

/// Routes worker output into the cache, the heatmaps and the event bus.
struct ResultRouter {
    buffer: Arc<FrameBuffer>,
    heatmaps: Option<Arc<HeatmapStore>>,
    events: EventEmitter,
}

impl ResultHandler for ResultRouter {
    fn wants(&self, source_id: &str, sequence: u64) -> bool {
        self.buffer.is_current(source_id, sequence)
    }

    fn handle(&self, result: DetectionResult) -> PutOutcome {
        let result = Arc::new(result);
        let outcome = self.buffer.put_detection(Arc::clone(&result));
        if outcome != PutOutcome::Applied {
            return outcome;
        }
        // A source removed meanwhile has no heatmap left to update.
        if let Some(heatmaps) = &self.heatmaps {
            if let Some(frame) = self.buffer.get_frame(&result.source_id) {
                heatmaps.update(
                    &result.source_id,
                    frame.width(),
                    frame.height(),
                    &result.detections,
                );
            }
        }
        self.events.emit(EventRecord::detection(&result));
        outcome
    }
}

#[derive(Default)]
pub struct OrchestratorBuilder {
    settings: OrchestratorSettings,
    opener: Option<Arc<dyn TransportOpener>>,
    backend: Option<BackendFactory>,
    sink: Option<Box<dyn EventSink>>,
    outbox: Option<Box<dyn Outbox>>,
    encoders: Option<EncoderFactory>,
}

impl OrchestratorBuilder {
    pub fn new(settings: OrchestratorSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn opener(mut self, opener: Arc<dyn TransportOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn backend(mut self, factory: BackendFactory) -> Self {
        self.backend = Some(factory);
        self
    }

    pub fn sink(mut self, sink: Box<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn outbox(mut self, outbox: Box<dyn Outbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn encoders(mut self, encoders: EncoderFactory) -> Self {
        self.encoders = Some(encoders);
        self
    }

    pub fn build(self) -> anyhow::Result<Orchestrator> {
        let settings = self.settings;
        let factory = match self.backend {
            Some(factory) => factory,
            None => {
                let backends = BackendRegistry::with_builtin(&settings.detector);
                backends.factory(&settings.backend).ok_or_else(|| {
                    anyhow::anyhow!(
                        "unknown detection backend '{}' (available: {})",
                        settings.backend,
                        backends.list().join(", ")
                    )
                })?
            }
        };

        let dispatcher = EventDispatcher::start(
            settings.dispatcher.clone(),
            self.sink
                .unwrap_or_else(|| Box::new(LogSink) as Box<dyn EventSink>),
            self.outbox.unwrap_or_else(|| {
                Box::new(InMemoryOutbox::new(settings.outbox_capacity)) as Box<dyn Outbox>
            }),
        )?;

        let buffer = Arc::new(FrameBuffer::new());
        let heatmaps = settings.heatmap.then(|| Arc::new(HeatmapStore::new()));
        let router = Arc::new(ResultRouter {
            buffer: Arc::clone(&buffer),
            heatmaps: heatmaps.clone(),
            events: dispatcher.emitter(),
        });
        let pool = Arc::new(DetectionPool::start(settings.pool, factory, router)?);
        log::info!(
            "detection pool: {} workers, queue {}, backend {}",
            settings.pool.workers.max(1),
            pool.capacity(),
            pool.backend_name()
        );

        let opener = self.opener.unwrap_or_else(|| {
            Arc::new(DefaultOpener::new(settings.ingest.clone())) as Arc<dyn TransportOpener>
        });
        let context = Arc::new(CaptureContext {
            opener,
            buffer: Arc::clone(&buffer),
            pool: Arc::clone(&pool),
            events: dispatcher.emitter(),
            settings: settings.capture.clone(),
        });
        let publisher = StreamPublisher::new(
            Arc::clone(&buffer),
            heatmaps.clone(),
            self.encoders.unwrap_or_else(mjpeg_factory),
        );

        Ok(Orchestrator {
            registry: SourceRegistry::new(context),
            buffer,
            heatmaps,
            pool,
            publisher,
            dispatcher,
        })
    }
}

pub struct Orchestrator {
    registry: SourceRegistry,
    buffer: Arc<FrameBuffer>,
    heatmaps: Option<Arc<HeatmapStore>>,
    pool: Arc<DetectionPool>,
    publisher: StreamPublisher,
    dispatcher: EventDispatcher,
}

impl Orchestrator {
    pub fn builder(settings: OrchestratorSettings) -> OrchestratorBuilder {
        OrchestratorBuilder::new(settings)
    }

    pub fn add_source(&self, spec: SourceSpec) -> ControlResult<SourceInfo> {
        let info = self.registry.add(spec)?;
        if let Some(heatmaps) = &self.heatmaps {
            heatmaps.register(&info.id);
        }
        Ok(info)
    }

    pub fn start_source(&self, id: &str) -> ControlResult<()> {
        self.registry.start(id)
    }

    pub fn stop_source(&self, id: &str) -> ControlResult<()> {
        self.registry.stop(id)
    }

    /// Remove a stopped source together with its heatmap and streams.
    pub fn remove_source(&self, id: &str) -> ControlResult<SourceInfo> {
        let info = self.registry.remove(id)?;
        if let Some(heatmaps) = &self.heatmaps {
            heatmaps.remove(id);
        }
        let streams = self.publisher.remove_streams_for(id);
        if !streams.is_empty() {
            log::info!("source {}: removed streams {}", id, streams.join(", "));
        }
        Ok(info)
    }

    pub fn sources(&self) -> Vec<SourceInfo> {
        self.registry.list()
    }

    pub fn source(&self, id: &str) -> ControlResult<SourceInfo> {
        self.registry.get(id)
    }

    /// Latest frame of a known source, optionally annotated. `None` while
    /// the source has produced nothing.
    pub fn latest_frame(&self, id: &str, annotated: bool) -> ControlResult<Option<Frame>> {
        if !self.registry.contains(id) {
            return Err(ControlError::NotFound(id.to_string()));
        }
        let (frame, detection) = self.buffer.snapshot(id);
        let Some(frame) = frame else {
            return Ok(None);
        };
        if !annotated {
            return Ok(Some(Frame::clone(&frame)));
        }
        let heatmap = self.heatmaps.as_ref().and_then(|maps| maps.get(id));
        Ok(Some(annotate(&frame, detection.as_deref(), heatmap.as_ref())))
    }

    /// Latest frame as JPEG bytes.
    pub fn frame(&self, id: &str, annotated: bool) -> ControlResult<FrameReply> {
        let Some(frame) = self.latest_frame(id, annotated)? else {
            return Ok(FrameReply::NoData);
        };
        match encode_jpeg(frame.image(), JPEG_QUALITY) {
            Ok(bytes) => Ok(FrameReply::Image(bytes)),
            Err(err) => {
                log::warn!("source {}: {}", id, err);
                Ok(FrameReply::NoData)
            }
        }
    }

    /// Latest applied detection result, `None` while there is none.
    pub fn detections(&self, id: &str) -> ControlResult<Option<Arc<DetectionResult>>> {
        if !self.registry.contains(id) {
            return Err(ControlError::NotFound(id.to_string()));
        }
        Ok(self.buffer.get_detection(id))
    }

    pub fn create_stream(&self, spec: StreamSpec) -> ControlResult<()> {
        if !self.registry.contains(&spec.source_id) {
            return Err(ControlError::NotFound(spec.source_id));
        }
        self.publisher.create_stream(spec)
    }

    pub fn remove_stream(&self, id: &str) -> ControlResult<()> {
        self.publisher.remove_stream(id)
    }

    pub fn streams(&self) -> Vec<StreamInfo> {
        self.publisher.streams()
    }

    pub fn latest_packet(&self, stream_id: &str) -> ControlResult<Option<EncodedPacket>> {
        self.publisher.latest_packet(stream_id)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            sources: self.registry.ids().len(),
            streams: self.publisher.streams().len(),
            detection: self.pool.stats(),
            events: self.dispatcher.stats(),
        }
    }

    /// Stop sources, streams, workers and the dispatcher, in that order.
    pub fn shutdown(&self) {
        self.registry.stop_all();
        self.publisher.shutdown();
        self.pool.shutdown();
        self.dispatcher.shutdown();
        log::info!("pipeline stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection, DetectorBackend, StubBackend};
    use crate::dispatch::MemorySink;
    use crate::error::DetectionError;
    use crate::publish::StreamKind;
    use std::time::{Duration, Instant};

    fn orchestrator(sink: MemorySink) -> Orchestrator {
        let mut settings = OrchestratorSettings::default();
        settings.ingest.target_fps = 100;
        settings.dispatcher.topic_prefix = "t".to_string();
        let factory: BackendFactory =
            Arc::new(|| -> Result<Box<dyn DetectorBackend>, DetectionError> {
                Ok(Box::new(StubBackend::with_detections(vec![Detection::new(
                    "person",
                    0.75,
                    BoundingBox::new(2.0, 2.0, 10.0, 10.0),
                )])))
            });
        Orchestrator::builder(settings)
            .backend(factory)
            .sink(Box::new(sink))
            .build()
            .unwrap()
    }

    fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(value) = probe() {
                return value;
            }
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn unknown_backend_name_fails_to_build() {
        let mut settings = OrchestratorSettings::default();
        settings.backend = "yolo-v99".to_string();
        let err = Orchestrator::builder(settings).build().err().unwrap();
        assert!(err.to_string().contains("yolo-v99"));
    }

    #[test]
    fn synthetic_source_flows_to_cache_heatmap_and_events() {
        let sink = MemorySink::new();
        let pipeline = orchestrator(sink.clone());
        pipeline
            .add_source(SourceSpec::new("cam", "stub://pattern", 64, 48))
            .unwrap();
        assert_eq!(pipeline.frame("cam", false).unwrap(), FrameReply::NoData);
        assert!(pipeline.detections("cam").unwrap().is_none());

        pipeline.start_source("cam").unwrap();
        let result = wait_for(|| pipeline.detections("cam").unwrap());
        assert_eq!(result.detections[0].class_label, "person");

        let annotated = pipeline.latest_frame("cam", true).unwrap().unwrap();
        assert_eq!((annotated.width(), annotated.height()), (64, 48));
        assert!(pipeline.frame("cam", true).unwrap().is_image());

        wait_for(|| {
            sink.topics()
                .iter()
                .any(|t| t == "t/sources/cam/detections")
                .then_some(())
        });
        assert!(sink.topics().iter().any(|t| t == "t/sources/cam/status"));
    }

    #[test]
    fn removing_a_source_drops_its_streams() {
        let pipeline = orchestrator(MemorySink::new());
        pipeline
            .add_source(SourceSpec::new("cam", "stub://", 32, 32))
            .unwrap();
        assert_eq!(
            pipeline
                .create_stream(StreamSpec::new("s1", "ghost", StreamKind::Raw))
                .unwrap_err(),
            ControlError::NotFound("ghost".into())
        );
        pipeline
            .create_stream(StreamSpec::new("s1", "cam", StreamKind::Annotated))
            .unwrap();
        assert_eq!(pipeline.streams().len(), 1);

        pipeline.remove_source("cam").unwrap();
        assert!(pipeline.streams().is_empty());
        assert_eq!(
            pipeline.frame("cam", false).unwrap_err(),
            ControlError::NotFound("cam".into())
        );
    }

    #[test]
    fn removed_source_leaves_no_heatmap_behind() {
        let pipeline = orchestrator(MemorySink::new());
        pipeline
            .add_source(SourceSpec::new("cam", "stub://pattern", 32, 32))
            .unwrap();
        pipeline.start_source("cam").unwrap();
        wait_for(|| pipeline.detections("cam").unwrap());

        let heatmaps = pipeline.heatmaps.clone().unwrap();
        assert!(heatmaps.get("cam").is_some());

        pipeline.stop_source("cam").unwrap();
        pipeline.remove_source("cam").unwrap();
        assert!(!heatmaps.update("cam", 32, 32, &[]));
        assert!(!heatmaps.contains("cam"));

        pipeline
            .add_source(SourceSpec::new("cam", "stub://pattern", 32, 32))
            .unwrap();
        assert!(heatmaps.contains("cam"));
        assert!(heatmaps.get("cam").is_none());
    }
}
