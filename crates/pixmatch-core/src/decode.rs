//! Raw upload bytes → RGB raster.

use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty image payload")]
    Empty,
    #[error("unreadable image: {0}")]
    Unreadable(#[from] image::ImageError),
    #[error("image has zero size ({width}x{height})")]
    ZeroSize { width: u32, height: u32 },
}

/// Decode an uploaded image (any format the `image` crate recognizes) into RGB8.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let rgb = image::load_from_memory(bytes)?.to_rgb8();
    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return Err(DecodeError::ZeroSize { width, height });
    }

    tracing::trace!(width, height, bytes = bytes.len(), "decoded image");
    Ok(rgb)
}
