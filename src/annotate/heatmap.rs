//! Detection heatmap accumulation.
//!
//! Each update adds a Gaussian blob per detection (centred on the box,
//! sigma = max(w, h) / 4), decays the whole map by 0.95 and renormalizes
//! it to 0..=1. The map is kept at a quarter of the frame resolution.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::detect::Detection;
use crate::lock_or_recover;

const DECAY: f32 = 0.95;
const CELL: u32 = 4;

#[derive(Clone, Debug)]
pub struct Heatmap {
    frame_width: u32,
    frame_height: u32,
    cols: u32,
    rows: u32,
    values: Vec<f32>,
}

impl Heatmap {
    pub fn new(frame_width: u32, frame_height: u32) -> Self {
        let cols = frame_width.div_ceil(CELL).max(1);
        let rows = frame_height.div_ceil(CELL).max(1);
        Self {
            frame_width,
            frame_height,
            cols,
            rows,
            values: vec![0.0; (cols * rows) as usize],
        }
    }

    pub fn frame_size(&self) -> (u32, u32) {
        (self.frame_width, self.frame_height)
    }

    pub fn accumulate(&mut self, detections: &[Detection]) {
        for detection in detections {
            self.add_blob(detection);
        }
        let mut max = 0f32;
        for v in &mut self.values {
            *v *= DECAY;
            max = max.max(*v);
        }
        if max > 0.0 {
            for v in &mut self.values {
                *v /= max;
            }
        }
    }

    fn add_blob(&mut self, detection: &Detection) {
        let b = &detection.bounding_box;
        let (cx, cy) = b.center();
        let sigma = (b.w.max(b.h) / 4.0).max(1.0);
        let two_sigma_sq = 2.0 * sigma * sigma;
        let reach = 3.0 * sigma;

        let col_lo = ((cx - reach) / CELL as f32).floor().max(0.0) as u32;
        let col_hi = (((cx + reach) / CELL as f32).ceil() as u32).min(self.cols - 1);
        let row_lo = ((cy - reach) / CELL as f32).floor().max(0.0) as u32;
        let row_hi = (((cy + reach) / CELL as f32).ceil() as u32).min(self.rows - 1);
        if col_lo > col_hi || row_lo > row_hi {
            return;
        }

        for row in row_lo..=row_hi {
            let y = (row * CELL + CELL / 2) as f32;
            for col in col_lo..=col_hi {
                let x = (col * CELL + CELL / 2) as f32;
                let d2 = (x - cx).powi(2) + (y - cy).powi(2);
                self.values[(row * self.cols + col) as usize] += (-d2 / two_sigma_sq).exp();
            }
        }
    }

    /// Normalized intensity at a frame pixel.
    pub fn at(&self, x: u32, y: u32) -> f32 {
        let col = (x / CELL).min(self.cols - 1);
        let row = (y / CELL).min(self.rows - 1);
        self.values[(row * self.cols + col) as usize]
    }

    pub fn peak(&self) -> f32 {
        self.values.iter().copied().fold(0.0, f32::max)
    }
}

/// Heatmaps by source id. Only registered sources accumulate.
#[derive(Default)]
pub struct HeatmapStore {
    maps: Mutex<HashMap<String, Option<Heatmap>>>,
}

impl HeatmapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source_id: &str) {
        lock_or_recover(&self.maps)
            .entry(source_id.to_string())
            .or_insert(None);
    }

    /// Fold detections into the source's map, resetting it if the frame size
    /// changed. Returns false for sources that are not registered.
    pub fn update(
        &self,
        source_id: &str,
        width: u32,
        height: u32,
        detections: &[Detection],
    ) -> bool {
        let mut maps = lock_or_recover(&self.maps);
        let Some(slot) = maps.get_mut(source_id) else {
            return false;
        };
        let map = slot.get_or_insert_with(|| Heatmap::new(width, height));
        if map.frame_size() != (width, height) {
            *map = Heatmap::new(width, height);
        }
        map.accumulate(detections);
        true
    }

    pub fn get(&self, source_id: &str) -> Option<Heatmap> {
        lock_or_recover(&self.maps).get(source_id)?.clone()
    }

    pub fn contains(&self, source_id: &str) -> bool {
        lock_or_recover(&self.maps).contains_key(source_id)
    }

    pub fn remove(&self, source_id: &str) {
        lock_or_recover(&self.maps).remove(source_id);
    }
}
