//! Face crop extraction. A crop is the comparable representation of a registered face.
//!
//! A detected box is clamped to the source image and the covered RGB region
//! is copied out. Crops are stored as lossless PNG so a reloaded crop is
//! bit-identical to the one that was extracted.

use crate::types::BoundingBox;
use image::{DynamicImage, RgbImage};

/// Integer pixel rectangle lying entirely inside its source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    /// Clamp a detector box to an image of `img_width` × `img_height`.
    ///
    /// Negative origins are moved to 0; width and height are then cut so the
    /// rectangle never runs past the right or bottom edge. Returns `None` when
    /// nothing of the box remains inside the image.
    pub fn clamp(face: &BoundingBox, img_width: u32, img_height: u32) -> Option<Self> {
        let x = clamp_origin(face.x);
        let y = clamp_origin(face.y);
        let width = clamp_extent(face.width, x, img_width);
        let height = clamp_extent(face.height, y, img_height);

        if width == 0 || height == 0 {
            return None;
        }
        Some(Self { x, y, width, height })
    }
}

fn clamp_origin(v: f32) -> u32 {
    if v.is_finite() && v > 0.0 {
        v.floor().min(u32::MAX as f32) as u32
    } else {
        0
    }
}

fn clamp_extent(extent: f32, origin: u32, limit: u32) -> u32 {
    let available = limit.saturating_sub(origin);
    if !extent.is_finite() || extent <= 0.0 {
        return 0;
    }
    (extent.round().min(u32::MAX as f32) as u32).min(available)
}

/// A face crop in RGB.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceCrop {
    pixels: RgbImage,
}

impl FaceCrop {
    pub fn from_image(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    pub fn image(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn into_image(self) -> RgbImage {
        self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.width() == 0 || self.pixels.height() == 0
    }

    /// Decode a crop from encoded image bytes (PNG on disk).
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        Ok(Self::from_image(image::load_from_memory(bytes)?.to_rgb8()))
    }

    /// Encode the crop as PNG.
    pub fn encode_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut out = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(self.pixels.clone()).write_to(&mut out, image::ImageFormat::Png)?;
        Ok(out.into_inner())
    }
}

/// Cut the region of `face` out of `image`.
///
/// Deterministic: the same image and box always give the same pixels.
/// Returns `None` if the clamped region is empty.
pub fn extract(image: &RgbImage, face: &BoundingBox) -> Option<FaceCrop> {
    let rect = CropRect::clamp(face, image.width(), image.height())?;
    let view = image::imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height);
    Some(FaceCrop::from_image(view.to_image()))
}
