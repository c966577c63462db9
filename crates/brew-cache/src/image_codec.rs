//! Content-adaptive image compression.
//!
//! Images with an alpha channel are stored losslessly (PNG) so logos and badges keep
//! crisp edges; opaque images are stored as JPEG at a configurable quality.

use crate::error::{CacheError, Result};
use crate::key::ImageFormat;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::DynamicImage;

pub const DEFAULT_LOSSY_QUALITY: u8 = 75;

/// Picks the storage format for `image` based on whether it carries alpha.
pub fn format_for(image: &DynamicImage) -> ImageFormat {
    if image.color().has_alpha() {
        ImageFormat::Lossless
    } else {
        ImageFormat::Lossy
    }
}

/// Compresses `image` with the format chosen by [`format_for`].
pub fn compress(image: &DynamicImage, quality: u8) -> Result<(Vec<u8>, ImageFormat)> {
    let format = format_for(image);
    let mut bytes = Vec::new();
    match format {
        ImageFormat::Lossless => image
            .to_rgba8()
            .write_with_encoder(PngEncoder::new(&mut bytes))
            .map_err(CacheError::encode)?,
        ImageFormat::Lossy => image
            .to_rgb8()
            .write_with_encoder(JpegEncoder::new_with_quality(
                &mut bytes,
                quality.clamp(1, 100),
            ))
            .map_err(CacheError::encode)?,
    }
    Ok((bytes, format))
}

/// Decodes bytes produced by [`compress`] (or any PNG/JPEG), detecting the format from
/// the embedded signature rather than trusting the file name.
pub fn decompress(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(CacheError::decode)
}

/// Decodes freshly downloaded bytes and re-encodes them for the cache.
pub fn transcode(downloaded: &[u8], quality: u8) -> Result<(DynamicImage, Vec<u8>, ImageFormat)> {
    let image = decompress(downloaded)?;
    let (bytes, format) = compress(&image, quality)?;
    Ok((image, bytes, format))
}
