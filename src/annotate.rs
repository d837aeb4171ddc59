use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use crate::catalog::{BoundingBox, Catalog};
use crate::detect::DetectionResult;
use crate::error::PersistenceError;
use crate::frame::Frame;

pub const MATCHED_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
pub const MISSING_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
pub const UNLABELED_COLOR: Rgb<u8> = Rgb([240, 200, 0]);

const STROKE: i32 = 2;

/// Draw the detection outcome over a copy of the frame.
///
/// Matched products are outlined green at the detected box, missing products
/// red at their catalog region, unlabeled detections yellow.
pub fn annotate(frame: &Frame, result: &DetectionResult, catalog: &Catalog) -> RgbImage {
    let mut image = frame.to_image();
    for product_id in &result.missing {
        if let Some(entry) = catalog.get(product_id) {
            draw_box(&mut image, &entry.bounding_box, MISSING_COLOR);
        }
    }
    for detection in &result.unlabeled {
        draw_box(&mut image, &detection.bbox, UNLABELED_COLOR);
    }
    for matched in &result.matched {
        draw_box(&mut image, &matched.matched_box, MATCHED_COLOR);
    }
    image
}

/// Encode an RGB image as JPEG. `quality` is clamped to `1..=100`.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, PersistenceError> {
    let mut buffer = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|e| PersistenceError::Encode(format!("JPEG encode failed: {e}")))?;
    Ok(buffer.into_inner())
}

/// Outline `bbox` (exclusive right/bottom edge), clipped to the image.
pub fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 {
        return;
    }
    if bbox.x1 >= width || bbox.y1 >= height || bbox.x2 <= 0 || bbox.y2 <= 0 {
        return;
    }
    let left = bbox.x1.clamp(0, width - 1);
    let top = bbox.y1.clamp(0, height - 1);
    let right = (bbox.x2 - 1).clamp(0, width - 1);
    let bottom = (bbox.y2 - 1).clamp(0, height - 1);

    for t in 0..STROKE {
        let (l, r) = (left + t, right - t);
        let (tp, b) = (top + t, bottom - t);
        if l > r || tp > b {
            break;
        }
        for x in l..=r {
            image.put_pixel(x as u32, tp as u32, color);
            image.put_pixel(x as u32, b as u32, color);
        }
        for y in tp..=b {
            image.put_pixel(l as u32, y as u32, color);
            image.put_pixel(r as u32, y as u32, color);
        }
    }
}
