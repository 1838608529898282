//! Synthetic `stub://` source.
//!
//! Static gradient background with a bright block sliding across it, so the
//! motion backend always has something to report.

use std::time::Duration;

use super::{FrameReader, IngestOptions, RawImage};
use crate::error::CaptureError;

pub struct SyntheticReader {
    width: u32,
    height: u32,
    interval: Duration,
    frame_count: u64,
}

impl SyntheticReader {
    pub fn new(width: u32, height: u32, options: &IngestOptions) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            interval: options.frame_interval(),
            frame_count: 0,
        }
    }

    fn block_origin(&self) -> (u32, u32) {
        let block = self.block_size();
        let travel = (self.width.saturating_sub(block)).max(1) as u64;
        let x = ((self.frame_count * 4) % travel) as u32;
        let y = (self.height.saturating_sub(block)) / 2;
        (x, y)
    }

    fn block_size(&self) -> u32 {
        (self.width.min(self.height) / 4).max(1)
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut pixels = vec![0u8; w * h * 3];
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let x = i % w;
            let y = i / w;
            px[0] = (x * 64 / w) as u8;
            px[1] = (y * 64 / h) as u8;
            px[2] = 32;
        }

        let (bx, by) = self.block_origin();
        let size = self.block_size() as usize;
        for y in by as usize..(by as usize + size).min(h) {
            for x in bx as usize..(bx as usize + size).min(w) {
                let offset = (y * w + x) * 3;
                pixels[offset..offset + 3].copy_from_slice(&[240, 240, 240]);
            }
        }
        pixels
    }
}

impl FrameReader for SyntheticReader {
    fn read_frame(&mut self) -> Result<RawImage, CaptureError> {
        self.frame_count += 1;
        Ok(RawImage::rgb(self.width, self.height, self.render()))
    }

    fn frame_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }
}
