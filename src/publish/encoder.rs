use std::sync::Arc;
use std::time::SystemTime;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::error::PublishError;
use crate::frame::Frame;

pub const JPEG_QUALITY: u8 = 85;

/// One encoded unit ready for a muxer.
#[derive(Clone, Debug)]
pub struct EncodedPacket {
    pub sequence: u64,
    pub encoded_at: SystemTime,
    pub content_type: &'static str,
    pub data: Arc<[u8]>,
}

/// Turns frames into packets for one outgoing stream.
pub trait Encoder: Send {
    fn name(&self) -> &'static str;

    fn encode(&mut self, frame: &Frame) -> Result<EncodedPacket, PublishError>;
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, PublishError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| PublishError(format!("JPEG encode failed: {err}")))?;
    Ok(buffer)
}

/// Motion-JPEG: every frame is an independent JPEG at the stream size.
pub struct MjpegEncoder {
    width: u32,
    height: u32,
    quality: u8,
}

impl MjpegEncoder {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            quality: JPEG_QUALITY,
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }
}

impl Encoder for MjpegEncoder {
    fn name(&self) -> &'static str {
        "mjpeg"
    }

    fn encode(&mut self, frame: &Frame) -> Result<EncodedPacket, PublishError> {
        let same_size = frame.width() == self.width && frame.height() == self.height;
        let data = if same_size || self.width == 0 || self.height == 0 {
            encode_jpeg(frame.image(), self.quality)?
        } else {
            let resized =
                imageops::resize(frame.image(), self.width, self.height, FilterType::Triangle);
            encode_jpeg(&resized, self.quality)?
        };
        Ok(EncodedPacket {
            sequence: frame.sequence(),
            encoded_at: SystemTime::now(),
            content_type: "image/jpeg",
            data: data.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn jpeg_bytes_have_soi_marker() {
        let image = RgbImage::from_pixel(16, 16, Rgb([200, 10, 10]));
        let jpeg = encode_jpeg(&image, JPEG_QUALITY).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn mjpeg_packets_are_scaled_to_stream_size() {
        let frame = Frame::new("cam", 3, RgbImage::new(32, 24));
        let mut encoder = MjpegEncoder::new(16, 12);
        let packet = encoder.encode(&frame).unwrap();
        assert_eq!(packet.sequence, 3);
        let decoded = image::load_from_memory(&packet.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 12));
    }
}
