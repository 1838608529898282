//! Still image files replayed as a video stream.

use std::path::Path;
use std::time::Duration;

use super::{FrameReader, IngestOptions, RawImage};
use crate::error::CaptureError;

pub struct ImageFileReader {
    image: RawImage,
    interval: Duration,
    repeat: bool,
    served: u64,
}

impl ImageFileReader {
    pub fn open(path: &Path, options: &IngestOptions) -> Result<Self, CaptureError> {
        if !path.is_file() {
            return Err(CaptureError::Transport(format!(
                "file '{}' does not exist",
                path.display()
            )));
        }
        let decoded = image::open(path)
            .map_err(|e| CaptureError::Decode(format!("decode '{}': {e}", path.display())))?
            .to_rgb8();
        let (width, height) = decoded.dimensions();
        log::debug!(
            "ImageFileReader: loaded {} ({}x{})",
            path.display(),
            width,
            height
        );
        Ok(Self {
            image: RawImage::rgb(width, height, decoded.into_raw()),
            interval: options.frame_interval(),
            repeat: options.loop_files,
            served: 0,
        })
    }
}

impl FrameReader for ImageFileReader {
    fn read_frame(&mut self) -> Result<RawImage, CaptureError> {
        if !self.repeat && self.served > 0 {
            return Err(CaptureError::EndOfStream);
        }
        self.served += 1;
        Ok(self.image.clone())
    }

    fn frame_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_png(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("car.png");
        RgbImage::from_pixel(8, 6, Rgb([10, 20, 30]))
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn replays_the_image_while_looping() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path());
        let mut reader = ImageFileReader::open(&path, &IngestOptions::default()).unwrap();
        for _ in 0..3 {
            let raw = reader.read_frame().unwrap();
            assert_eq!((raw.width, raw.height), (8, 6));
            assert_eq!(&raw.pixels[..3], &[10, 20, 30]);
        }
    }

    #[test]
    fn ends_after_one_frame_without_looping() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path());
        let options = IngestOptions {
            target_fps: 30,
            loop_files: false,
        };
        let mut reader = ImageFileReader::open(&path, &options).unwrap();
        assert!(reader.read_frame().is_ok());
        assert_eq!(reader.read_frame().unwrap_err(), CaptureError::EndOfStream);
    }

    #[test]
    fn missing_file_is_a_transport_error() {
        let err = ImageFileReader::open(Path::new("/no/such/car.png"), &IngestOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::Transport(_)));
    }
}
