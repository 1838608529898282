//! Grid motion detector.
//!
//! The frame is split into `grid x grid` cells and the mean luminance of each
//! cell is compared with the previous frame of the same source. Adjacent
//! changed cells are merged into one `motion` box whose confidence is the
//! strongest change in it, scaled so a quarter of full range reads as 1.0.
//!
//! Previous-frame memory is shared by all instances built from one
//! `MotionMemory`, so a source keeps its history whichever worker picks up
//! the next job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::detect::backend::{check_frame, DetectorBackend};
use crate::detect::result::{BoundingBox, Detection};
use crate::error::DetectionError;
use crate::frame::Frame;
use crate::lock_or_recover;

const FULL_SCALE_CHANGE: f32 = 0.25;
const FORGET_AFTER: Duration = Duration::from_secs(60);

struct CellHistory {
    seen_at: Instant,
    width: u32,
    height: u32,
    means: Vec<f32>,
}

/// Per-source cell means shared between motion backend instances.
#[derive(Clone, Default)]
pub struct MotionMemory {
    inner: Arc<Mutex<HashMap<String, CellHistory>>>,
}

impl MotionMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `means` for the source and return what was stored before.
    fn swap(&self, source_id: &str, width: u32, height: u32, means: Vec<f32>) -> Option<Vec<f32>> {
        let mut map = lock_or_recover(&self.inner);
        let now = Instant::now();
        map.retain(|_, h| now.duration_since(h.seen_at) < FORGET_AFTER);
        let previous = map.insert(
            source_id.to_string(),
            CellHistory {
                seen_at: now,
                width,
                height,
                means,
            },
        )?;
        (previous.width == width && previous.height == height).then_some(previous.means)
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct MotionBackend {
    memory: MotionMemory,
    grid: u32,
    threshold: f32,
}

impl MotionBackend {
    pub fn new(memory: MotionMemory) -> Self {
        Self {
            memory,
            grid: 8,
            threshold: 0.05,
        }
    }

    /// Minimum normalized mean change for a cell to count as moving.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_grid(mut self, grid: u32) -> Self {
        self.grid = grid.max(1);
        self
    }

    fn cell_means(&self, frame: &Frame) -> Vec<f32> {
        let grid = self.grid as usize;
        let (w, h) = (frame.width() as usize, frame.height() as usize);
        let mut sums = vec![0f32; grid * grid];
        let mut counts = vec![0u32; grid * grid];
        for (x, y, px) in frame.image().enumerate_pixels() {
            let cx = (x as usize * grid / w).min(grid - 1);
            let cy = (y as usize * grid / h).min(grid - 1);
            let luma = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
            sums[cy * grid + cx] += luma / 255.0;
            counts[cy * grid + cx] += 1;
        }
        sums.iter()
            .zip(&counts)
            .map(|(s, &c)| if c == 0 { 0.0 } else { s / c as f32 })
            .collect()
    }

    /// Flood-fill changed cells into connected regions.
    fn regions(&self, changes: &[f32], frame: &Frame) -> Vec<Detection> {
        let grid = self.grid as usize;
        let cell_w = frame.width() as f32 / grid as f32;
        let cell_h = frame.height() as f32 / grid as f32;
        let mut visited = vec![false; changes.len()];
        let mut out = Vec::new();

        for start in 0..changes.len() {
            if visited[start] || changes[start] < self.threshold {
                continue;
            }
            let (mut min_x, mut min_y, mut max_x, mut max_y) = (grid, grid, 0, 0);
            let mut strongest = 0f32;
            let mut stack = vec![start];
            visited[start] = true;
            while let Some(idx) = stack.pop() {
                let (cx, cy) = (idx % grid, idx / grid);
                min_x = min_x.min(cx);
                min_y = min_y.min(cy);
                max_x = max_x.max(cx);
                max_y = max_y.max(cy);
                strongest = strongest.max(changes[idx]);

                let mut neighbours = Vec::with_capacity(4);
                if cx > 0 {
                    neighbours.push(idx - 1);
                }
                if cx + 1 < grid {
                    neighbours.push(idx + 1);
                }
                if cy > 0 {
                    neighbours.push(idx - grid);
                }
                if cy + 1 < grid {
                    neighbours.push(idx + grid);
                }
                for n in neighbours {
                    if !visited[n] && changes[n] >= self.threshold {
                        visited[n] = true;
                        stack.push(n);
                    }
                }
            }
            out.push(Detection::new(
                "motion",
                strongest / FULL_SCALE_CHANGE,
                BoundingBox::new(
                    min_x as f32 * cell_w,
                    min_y as f32 * cell_h,
                    (max_x - min_x + 1) as f32 * cell_w,
                    (max_y - min_y + 1) as f32 * cell_h,
                ),
            ));
        }
        out
    }
}

impl DetectorBackend for MotionBackend {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        check_frame(frame)?;
        let means = self.cell_means(frame);
        let previous = self
            .memory
            .swap(frame.source_id(), frame.width(), frame.height(), means.clone());
        let Some(previous) = previous else {
            return Ok(Vec::new());
        };
        let changes: Vec<f32> = means
            .iter()
            .zip(&previous)
            .map(|(now, before)| (now - before).abs())
            .collect();
        Ok(self.regions(&changes, frame))
    }
}
