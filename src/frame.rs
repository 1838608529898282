//! Frames and the latest-value frame cache.
//!
//! - `Frame`: one decoded RGB image of one source. Immutable once built and
//!   shared as `Arc<Frame>` between the cache, detection jobs and publishers.
//! - `FrameBuffer`: one slot per source holding the current `Frame` and the
//!   current `DetectionResult`. There is no history.
//!
//! The slot map is only locked long enough to find (or insert/remove) a slot;
//! reads and writes for one source then lock that source's slot alone, so a
//! busy source never contends with another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use image::RgbImage;

use crate::detect::DetectionResult;
use crate::{lock_or_recover, read_or_recover, write_or_recover};

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded image sample of one source.
///
/// Fields are read-only after construction; there is no `&mut` access to the
/// pixel buffer.
#[derive(Clone, Debug)]
pub struct Frame {
    source_id: String,
    sequence: u64,
    captured_at: SystemTime,
    image: RgbImage,
}

impl Frame {
    pub fn new(source_id: impl Into<String>, sequence: u64, image: RgbImage) -> Self {
        Self::with_timestamp(source_id, sequence, SystemTime::now(), image)
    }

    pub fn with_timestamp(
        source_id: impl Into<String>,
        sequence: u64,
        captured_at: SystemTime,
        image: RgbImage,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            sequence,
            captured_at,
            image,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Strictly increasing per source.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Packed RGB24 pixels, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer
// ----------------------------------------------------------------------------

/// Outcome of `FrameBuffer::put_detection`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Applied,
    /// Computed from a frame older than the cached one.
    Stale,
    UnknownSource,
}

#[derive(Default)]
struct SlotState {
    frame: Option<Arc<Frame>>,
    detection: Option<Arc<DetectionResult>>,
}

#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
}

/// Latest-value cache keyed by source id.
#[derive(Default)]
pub struct FrameBuffer {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty slot. Returns false if the source already has one.
    pub fn register(&self, source_id: &str) -> bool {
        let mut slots = write_or_recover(&self.slots);
        if slots.contains_key(source_id) {
            return false;
        }
        slots.insert(source_id.to_string(), Arc::new(Slot::default()));
        true
    }

    /// Drop the slot and everything cached in it.
    pub fn remove(&self, source_id: &str) -> bool {
        write_or_recover(&self.slots).remove(source_id).is_some()
    }

    pub fn contains(&self, source_id: &str) -> bool {
        read_or_recover(&self.slots).contains_key(source_id)
    }

    pub fn len(&self) -> usize {
        read_or_recover(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, source_id: &str) -> Option<Arc<Slot>> {
        read_or_recover(&self.slots).get(source_id).cloned()
    }

    /// Replace the cached frame for the frame's source.
    ///
    /// Returns false when the source has no slot or the frame does not advance
    /// the sequence.
    pub fn put_frame(&self, frame: Arc<Frame>) -> bool {
        let Some(slot) = self.slot(frame.source_id()) else {
            return false;
        };
        let mut state = lock_or_recover(&slot.state);
        if let Some(current) = &state.frame {
            if frame.sequence() <= current.sequence() {
                return false;
            }
        }
        state.frame = Some(frame);
        true
    }

    /// Store a detection result unless it is stale.
    ///
    /// Only a result for the cached frame is accepted, and never one that
    /// would replace a result for the same frame.
    pub fn put_detection(&self, result: Arc<DetectionResult>) -> PutOutcome {
        let Some(slot) = self.slot(&result.source_id) else {
            return PutOutcome::UnknownSource;
        };
        let mut state = lock_or_recover(&slot.state);
        if !accepts(&state, result.for_sequence) {
            return PutOutcome::Stale;
        }
        state.detection = Some(result);
        PutOutcome::Applied
    }

    /// Would a result for `sequence` still be accepted right now?
    pub fn is_current(&self, source_id: &str, sequence: u64) -> bool {
        let Some(slot) = self.slot(source_id) else {
            return false;
        };
        let state = lock_or_recover(&slot.state);
        accepts(&state, sequence)
    }

    /// Latest frame, or `None` when nothing was ingested yet (or the source
    /// is unknown). Never blocks on capture.
    pub fn get_frame(&self, source_id: &str) -> Option<Arc<Frame>> {
        let slot = self.slot(source_id)?;
        let state = lock_or_recover(&slot.state);
        state.frame.clone()
    }

    pub fn get_detection(&self, source_id: &str) -> Option<Arc<DetectionResult>> {
        let slot = self.slot(source_id)?;
        let state = lock_or_recover(&slot.state);
        state.detection.clone()
    }

    /// Frame and detection read under one lock, so they belong together.
    pub fn snapshot(
        &self,
        source_id: &str,
    ) -> (Option<Arc<Frame>>, Option<Arc<DetectionResult>>) {
        let Some(slot) = self.slot(source_id) else {
            return (None, None);
        };
        let state = lock_or_recover(&slot.state);
        (state.frame.clone(), state.detection.clone())
    }

    pub fn latest_sequence(&self, source_id: &str) -> Option<u64> {
        self.get_frame(source_id).map(|f| f.sequence())
    }
}

fn accepts(state: &SlotState, sequence: u64) -> bool {
    let Some(frame) = &state.frame else {
        return false;
    };
    if sequence != frame.sequence() {
        return false;
    }
    !state
        .detection
        .as_ref()
        .is_some_and(|current| current.for_sequence >= sequence)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
