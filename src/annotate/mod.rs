//! Frame annotation.
//!
//! `annotate` is a pure function of its inputs: it copies the frame, blends
//! the heatmap (if any), then draws every detection box with a label strip
//! reading `class: NN%` in a 5x7 bitmap font.

mod heatmap;

pub use heatmap::{Heatmap, HeatmapStore};

use image::{Rgb, RgbImage};

use crate::detect::DetectionResult;
use crate::frame::Frame;

pub const HEATMAP_ALPHA: f32 = 0.4;

const PALETTE: [[u8; 3]; 8] = [
    [0, 255, 0],
    [255, 64, 64],
    [64, 160, 255],
    [255, 200, 0],
    [255, 0, 255],
    [0, 255, 255],
    [255, 128, 0],
    [160, 96, 255],
];

/// Colour used for a class label; stable across frames and runs.
pub fn class_color(label: &str) -> Rgb<u8> {
    // FNV-1a
    let mut hash: u32 = 0x811c_9dc5;
    for byte in label.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    Rgb(PALETTE[(hash as usize) % PALETTE.len()])
}

/// Produce an annotated copy of `frame`.
///
/// The result carries the same source id, sequence and capture time.
pub fn annotate(
    frame: &Frame,
    detections: Option<&DetectionResult>,
    heatmap: Option<&Heatmap>,
) -> Frame {
    let mut image = frame.image().clone();

    if let Some(map) = heatmap {
        blend_heatmap(&mut image, map, HEATMAP_ALPHA);
    }

    if let Some(result) = detections {
        let (width, height) = image.dimensions();
        let max_x = width.saturating_sub(1) as f32;
        let max_y = height.saturating_sub(1) as f32;
        for detection in &result.detections {
            let b = &detection.bounding_box;
            let color = class_color(&detection.class_label);
            let left = b.x.clamp(0.0, max_x).round() as i32;
            let top = b.y.clamp(0.0, max_y).round() as i32;
            let right = (b.x + b.w).clamp(0.0, max_x).round() as i32;
            let bottom = (b.y + b.h).clamp(0.0, max_y).round() as i32;
            draw_rectangle(&mut image, left, top, right, bottom, color);

            let label = format!(
                "{}: {:.0}%",
                detection.class_label,
                detection.confidence * 100.0
            );
            let label_y = if top >= 10 { top - 10 } else { top + 1 };
            let text_width = label.chars().count() as i32 * 6;
            fill_rect(
                &mut image,
                left,
                label_y,
                left + text_width,
                label_y + 8,
                Rgb([0, 0, 0]),
            );
            draw_label(&mut image, left + 1, label_y + 1, &label, color);
        }
    }

    Frame::with_timestamp(
        frame.source_id(),
        frame.sequence(),
        frame.captured_at(),
        image,
    )
}

fn blend_heatmap(image: &mut RgbImage, map: &Heatmap, alpha: f32) {
    for (x, y, px) in image.enumerate_pixels_mut() {
        let heat = jet(map.at(x, y));
        for c in 0..3 {
            let mixed = alpha * heat[c] as f32 + (1.0 - alpha) * px[c] as f32;
            px[c] = mixed.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Jet colour map: 0 is dark blue, 0.5 green, 1 dark red.
pub fn jet(value: f32) -> [u8; 3] {
    let v = value.clamp(0.0, 1.0);
    let channel = |offset: f32| -> u8 {
        let c = 1.5 - (4.0 * v - offset).abs();
        (c.clamp(0.0, 1.0) * 255.0).round() as u8
    };
    [channel(3.0), channel(2.0), channel(1.0)]
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 {
        return;
    }
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for x in left..=right {
        image.put_pixel(x as u32, top as u32, color);
        image.put_pixel(x as u32, bottom as u32, color);
    }
    for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, color);
        image.put_pixel(right as u32, y as u32, color);
    }
}

fn fill_rect(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 {
        return;
    }
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col;
                        if px >= 0 && px < width {
                            image.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
        x += 6;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        ':' => [0, 0b00110, 0b00110, 0, 0b00110, 0b00110, 0],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection};

    fn gray_frame() -> Frame {
        Frame::new("cam", 9, RgbImage::from_pixel(64, 48, Rgb([50, 50, 50])))
    }

    #[test]
    fn box_outline_uses_class_colour_and_input_is_untouched() {
        let frame = gray_frame();
        let result = DetectionResult::new(
            "cam",
            9,
            vec![Detection::new("car", 0.87, BoundingBox::new(10.0, 20.0, 30.0, 20.0))],
        );
        let out = annotate(&frame, Some(&result), None);

        assert_eq!(out.sequence(), 9);
        assert_eq!(out.source_id(), "cam");
        assert_eq!(*out.image().get_pixel(40, 40), class_color("car"));
        assert_eq!(*out.image().get_pixel(25, 30), Rgb([50, 50, 50]));
        assert!(frame.image().pixels().all(|p| *p == Rgb([50, 50, 50])));
    }

    #[test]
    fn no_detections_and_no_heatmap_is_identity() {
        let frame = gray_frame();
        let out = annotate(&frame, None, None);
        assert_eq!(out.image(), frame.image());
    }

    #[test]
    fn heatmap_tints_hot_regions() {
        let frame = gray_frame();
        let mut map = Heatmap::new(64, 48);
        map.accumulate(&[Detection::new(
            "car",
            0.9,
            BoundingBox::new(0.0, 0.0, 16.0, 16.0),
        )]);
        let out = annotate(&frame, None, Some(&map));
        assert_ne!(*out.image().get_pixel(8, 8), Rgb([50, 50, 50]));
    }

    #[test]
    fn oversized_boxes_are_clipped() {
        let frame = gray_frame();
        let result = DetectionResult::new(
            "cam",
            9,
            vec![Detection::new("person", 1.0, BoundingBox::new(-20.0, -20.0, 500.0, 500.0))],
        );
        let out = annotate(&frame, Some(&result), None);
        assert_eq!(*out.image().get_pixel(63, 47), class_color("person"));
    }

    #[test]
    fn jet_endpoints() {
        assert_eq!(jet(0.0), [0, 0, 128]);
        assert_eq!(jet(0.5), [128, 255, 128]);
        assert_eq!(jet(1.0), [128, 0, 0]);
    }

    #[test]
    fn class_colours_are_stable() {
        assert_eq!(class_color("car"), class_color("car"));
    }
}
