//! Error taxonomy.
//!
//! Only `ControlError` is ever returned to control-plane callers. The other
//! kinds are recovered where they occur: capture errors drive reconnect
//! backoff, detection errors drop the frame, publish and dispatch errors are
//! retried by their own loops.

use thiserror::Error;

/// Control-plane misuse, surfaced synchronously to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("source already exists: {0}")]
    DuplicateSource(String),

    #[error("source already running: {0}")]
    AlreadyRunning(String),

    #[error("source must be stopped first: {0}")]
    SourceBusy(String),

    #[error("stream already exists: {0}")]
    DuplicateStream(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The host refused a resource the operation needs (e.g. a thread).
    #[error("resource unavailable: {0}")]
    Unavailable(String),
}

impl ControlError {
    /// The OS refused to start a worker thread.
    pub(crate) fn spawn_failed(thread: &str, err: &std::io::Error) -> Self {
        Self::Unavailable(format!("cannot spawn thread {thread}: {err}"))
    }
}

/// Failure while opening or reading a media transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("end of stream")]
    EndOfStream,
}

/// Failure inside a detector backend. The frame is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectionError {
    #[error("model error: {0}")]
    Model(String),

    #[error("corrupt frame: {0}")]
    CorruptFrame(String),
}

/// Failure while encoding or handing a frame to an outgoing stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("publish error: {0}")]
pub struct PublishError(pub String);

/// Failure while delivering an event to the external sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("dispatch error: {0}")]
pub struct DispatchError(pub String);

pub type ControlResult<T> = std::result::Result<T, ControlError>;
