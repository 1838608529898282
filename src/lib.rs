//! Video Analytics Pipeline
//!
//! This crate implements the per-source concurrent pipeline that sits between
//! live video sources and their consumers.
//!
//! # Architecture
//!
//! Every running source has its own capture thread. Frames flow one way:
//!
//! 1. **Capture**: open the transport, normalize frames, reconnect with
//!    capped exponential backoff on failure.
//! 2. **Frame Buffer**: latest frame and detection per source, swapped
//!    atomically per source; there is no history.
//! 3. **Detection**: a fixed pool of workers drains one bounded queue; a
//!    newer frame replaces a source's queued job instead of waiting behind it.
//! 4. **Readers**: the stream publisher and API callers pull from the Frame
//!    Buffer at their own pace; the event dispatcher delivers detections and
//!    status changes asynchronously.
//!
//! No failure in capture, detection, publishing or dispatch stops the
//! process. Only control-plane misuse returns an error to the caller.
//!
//! # Module Structure
//!
//! - `registry`: source lifecycle (Add, Start, Stop, Remove, List, Get)
//! - `capture`: per-source capture task and backoff schedule
//! - `ingest`: transports (synthetic, still images, GStreamer, FFmpeg)
//! - `frame`: `Frame` and the latest-value `FrameBuffer`
//! - `detect`: detector backends and the worker pool
//! - `annotate`: overlay drawing and heatmaps
//! - `publish`: outgoing raw and annotated streams
//! - `dispatch`: event delivery to a message bus
//! - `orchestrator`: facade wiring the stages together

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod annotate;
pub mod capture;
pub mod config;
pub mod detect;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod orchestrator;
pub mod publish;
pub mod registry;

pub use detect::{BoundingBox, Detection, DetectionResult};
pub use error::{
    CaptureError, ControlError, ControlResult, DetectionError, DispatchError, PublishError,
};
pub use frame::{Frame, FrameBuffer, PutOutcome};
pub use orchestrator::{FrameReply, Orchestrator, OrchestratorBuilder, OrchestratorSettings};
pub use registry::{SourceInfo, SourceSpec, SourceState};

/// Lock a mutex, taking over the data if a previous holder panicked.
///
/// Every structure guarded this way stays consistent between statements, so
/// readers keep working after a worker thread dies.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_or_recover<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_or_recover<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
