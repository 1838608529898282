//! Frame ingestion.
//!
//! A `TransportOpener` turns a source url into a `FrameReader`; each capture
//! task opens and reads on its own reader thread, which drops the reader to
//! close the transport. Readers hand
//! back `RawImage`s which capture normalizes to RGB24 at the configured
//! resolution.
//!
//! Url classification:
//! - `stub://...` synthetic moving test pattern
//! - `rtsp://`, `http://`, `https://` network stream (feature: rtsp-gstreamer)
//! - `v4l2://N`, `/dev/videoN`, `N` webcam (feature: rtsp-gstreamer)
//! - `file://...` or a path: still images are decoded with `image`,
//!   everything else goes to FFmpeg (feature: ingest-file-ffmpeg)

#[cfg(feature = "ingest-file-ffmpeg")]
mod file_ffmpeg;
mod gst;
mod image_file;
mod normalize;
mod synthetic;

use std::path::{Path, PathBuf};
use std::time::Duration;

pub use gst::{network_pipeline, webcam_pipeline};
pub use image_file::ImageFileReader;
pub use normalize::{normalize, PixelFormat, RawImage};
pub use synthetic::SyntheticReader;

use crate::error::CaptureError;
use crate::registry::SourceSpec;

/// An open transport. Dropping it releases the underlying handle.
pub trait FrameReader: Send {
    /// Block until the next frame is available.
    ///
    /// Called on a dedicated reader thread. Stopping the source does not wait
    /// for a read in progress; the reader is dropped once it returns.
    fn read_frame(&mut self) -> Result<RawImage, CaptureError>;

    /// Pacing for sources that would otherwise deliver as fast as they
    /// decode (files, synthetic). Live transports return `None`.
    fn frame_interval(&self) -> Option<Duration> {
        None
    }
}

/// Opens transports for sources. Shared by every capture task; `open` runs
/// on the task's reader thread and may block.
pub trait TransportOpener: Send + Sync {
    fn open(&self, source: &SourceSpec) -> Result<Box<dyn FrameReader>, CaptureError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Synthetic(String),
    Network(String),
    Webcam(String),
    File(PathBuf),
}

impl SourceKind {
    pub fn classify(url: &str) -> Option<Self> {
        let url = url.trim();
        if url.is_empty() {
            return None;
        }
        if let Some(rest) = url.strip_prefix("stub://") {
            return Some(Self::Synthetic(rest.to_string()));
        }
        if url.starts_with("rtsp://") || url.starts_with("http://") || url.starts_with("https://")
        {
            return Some(Self::Network(url.to_string()));
        }
        if let Some(rest) = url.strip_prefix("v4l2://") {
            return Some(Self::Webcam(device_path(rest)));
        }
        if url.starts_with("/dev/video") {
            return Some(Self::Webcam(url.to_string()));
        }
        if url.parse::<u32>().is_ok() {
            return Some(Self::Webcam(device_path(url)));
        }
        if let Some(rest) = url.strip_prefix("file://") {
            return Some(Self::File(PathBuf::from(rest)));
        }
        if url.contains("://") {
            return None;
        }
        Some(Self::File(PathBuf::from(url)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Synthetic(_) => "synthetic",
            Self::Network(_) => "network",
            Self::Webcam(_) => "webcam",
            Self::File(_) => "file",
        }
    }
}

fn device_path(device: &str) -> String {
    if device.parse::<u32>().is_ok() {
        format!("/dev/video{device}")
    } else {
        device.to_string()
    }
}

pub fn is_still_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .is_some_and(|ext| matches!(ext.as_str(), "png" | "jpg" | "jpeg" | "bmp"))
}

/// Options shared by the built-in readers.
#[derive(Clone, Debug)]
pub struct IngestOptions {
    pub target_fps: u32,
    pub loop_files: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            target_fps: 30,
            loop_files: true,
        }
    }
}

impl IngestOptions {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.target_fps.max(1)))
    }
}

/// Opener backed by the readers compiled into this build.
#[derive(Clone, Debug, Default)]
pub struct DefaultOpener {
    options: IngestOptions,
}

impl DefaultOpener {
    pub fn new(options: IngestOptions) -> Self {
        Self { options }
    }
}

impl TransportOpener for DefaultOpener {
    fn open(&self, source: &SourceSpec) -> Result<Box<dyn FrameReader>, CaptureError> {
        let kind = SourceKind::classify(&source.url).ok_or_else(|| {
            CaptureError::Transport(format!("unsupported source url '{}'", source.url))
        })?;
        log::debug!("source {}: opening {} transport", source.id, kind.name());
        match kind {
            SourceKind::Synthetic(_) => Ok(Box::new(SyntheticReader::new(
                source.width,
                source.height,
                &self.options,
            ))),
            SourceKind::File(path) if is_still_image(&path) => {
                Ok(Box::new(ImageFileReader::open(&path, &self.options)?))
            }
            SourceKind::File(path) => open_video_file(&path, &self.options),
            SourceKind::Network(url) => gst::open(&network_pipeline(&url)),
            SourceKind::Webcam(device) => gst::open(&webcam_pipeline(&device)),
        }
    }
}

#[cfg(feature = "ingest-file-ffmpeg")]
fn open_video_file(
    path: &Path,
    options: &IngestOptions,
) -> Result<Box<dyn FrameReader>, CaptureError> {
    Ok(Box::new(file_ffmpeg::FfmpegFileReader::open(path, options)?))
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
fn open_video_file(
    path: &Path,
    _options: &IngestOptions,
) -> Result<Box<dyn FrameReader>, CaptureError> {
    Err(CaptureError::Transport(format!(
        "video file '{}' requires the ingest-file-ffmpeg feature",
        path.display()
    )))
}
