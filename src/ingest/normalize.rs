use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::error::CaptureError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Nv12,
}

/// Undecorated pixels as handed over by a transport.
#[derive(Clone, Debug)]
pub struct RawImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl RawImage {
    pub fn rgb(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            pixels,
            width,
            height,
            format: PixelFormat::Rgb24,
        }
    }
}

/// Convert to RGB24 and resize to `width`x`height` if needed.
pub fn normalize(raw: RawImage, width: u32, height: u32) -> Result<RgbImage, CaptureError> {
    let RawImage {
        pixels,
        width: src_w,
        height: src_h,
        format,
    } = raw;
    let rgb = match format {
        PixelFormat::Rgb24 => {
            check_len(&pixels, packed_len(src_w, src_h)?, "RGB")?;
            pixels
        }
        PixelFormat::Bgr24 => {
            check_len(&pixels, packed_len(src_w, src_h)?, "BGR")?;
            bgr_to_rgb(pixels)
        }
        PixelFormat::Nv12 => nv12_to_rgb(&pixels, src_w, src_h)?,
    };
    let image = RgbImage::from_raw(src_w, src_h, rgb)
        .ok_or_else(|| CaptureError::Decode("frame buffer does not fit dimensions".to_string()))?;

    if width == 0 || height == 0 || (src_w == width && src_h == height) {
        return Ok(image);
    }
    Ok(imageops::resize(&image, width, height, FilterType::Triangle))
}

fn packed_len(width: u32, height: u32) -> Result<usize, CaptureError> {
    width
        .checked_mul(height)
        .and_then(|v| v.checked_mul(3))
        .map(|v| v as usize)
        .ok_or_else(|| CaptureError::Decode("frame dimensions overflow".to_string()))
}

fn check_len(pixels: &[u8], expected: usize, kind: &str) -> Result<(), CaptureError> {
    if pixels.len() != expected {
        return Err(CaptureError::Decode(format!(
            "{kind} frame length mismatch: expected {expected}, got {}",
            pixels.len()
        )));
    }
    Ok(())
}

fn bgr_to_rgb(mut pixels: Vec<u8>) -> Vec<u8> {
    for px in pixels.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    pixels
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CaptureError> {
    let w = width as usize;
    let h = height as usize;
    let overflow = || CaptureError::Decode("NV12 frame dimensions overflow".to_string());
    let y_plane = w.checked_mul(h).ok_or_else(overflow)?;
    // Interleaved UV at half resolution, rounded up for odd sizes.
    let uv_stride = w.div_ceil(2) * 2;
    let uv_plane = uv_stride.checked_mul(h.div_ceil(2)).ok_or_else(overflow)?;
    let expected = y_plane.checked_add(uv_plane).ok_or_else(overflow)?;
    check_len(pixels, expected, "NV12")?;

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * uv_stride + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;

            let r = y + 1.402_f32 * v;
            let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
            let b = y + 1.772_f32 * u;

            let offset = (j * w + i) * 3;
            rgb[offset] = clamp_to_u8(r);
            rgb[offset + 1] = clamp_to_u8(g);
            rgb[offset + 2] = clamp_to_u8(b);
        }
    }

    Ok(rgb)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
