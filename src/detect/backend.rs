use crate::error::DetectionError;
use crate::frame::Frame;

use super::result::Detection;

/// Detector backend trait.
///
/// Each pool worker owns its own instance, so `detect` may keep per-call
/// scratch state behind `&mut self`. Implementations must not hold on to the
/// frame after returning.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError>;

    /// Optional warm-up hook, run once on the worker thread before any job.
    fn warm_up(&mut self) -> Result<(), DetectionError> {
        Ok(())
    }
}

/// Reject frames whose pixel buffer cannot be what the header claims.
pub(crate) fn check_frame(frame: &Frame) -> Result<(), DetectionError> {
    let expected = (frame.width() as usize)
        .checked_mul(frame.height() as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| DetectionError::CorruptFrame("frame dimensions overflow".into()))?;
    if frame.width() == 0 || frame.height() == 0 || frame.pixels().len() != expected {
        return Err(DetectionError::CorruptFrame(format!(
            "expected {} RGB bytes for {}x{}, got {}",
            expected,
            frame.width(),
            frame.height(),
            frame.pixels().len()
        )));
    }
    Ok(())
}
