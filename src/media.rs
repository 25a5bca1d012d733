//! Upload preparation: content-type gate, decode, re-encode.
//!
//! JPEG uploads are rotated according to their EXIF orientation and
//! re-encoded at the configured quality; PNG uploads are re-encoded with
//! the best compression level.  WebP, GIF and SVG are stored exactly as
//! received.  Decoding is CPU bound, so async callers go through
//! [`prepare_blocking`].

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use std::io::Cursor;
use tracing::debug;

use crate::config::MediaConfig;
use crate::errors::MediaError;

/// Raw upload as received from the caller.
#[derive(Debug, Clone)]
pub struct Upload {
    pub content_type: String,
    pub bytes: Bytes,
}

impl Upload {
    pub fn new(content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }
}

/// Stored image formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFormat {
    Jpeg,
    Png,
    Webp,
    Gif,
    Svg,
}

impl MediaFormat {
    pub fn extension(self) -> &'static str {
        match self {
            MediaFormat::Jpeg => "jpg",
            MediaFormat::Png => "png",
            MediaFormat::Webp => "webp",
            MediaFormat::Gif => "gif",
            MediaFormat::Svg => "svg",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            MediaFormat::Jpeg => "image/jpeg",
            MediaFormat::Png => "image/png",
            MediaFormat::Webp => "image/webp",
            MediaFormat::Gif => "image/gif",
            MediaFormat::Svg => "image/svg+xml",
        }
    }

    /// Format stored under a key ending in `extension`.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(MediaFormat::Jpeg),
            "png" => Some(MediaFormat::Png),
            "webp" => Some(MediaFormat::Webp),
            "gif" => Some(MediaFormat::Gif),
            "svg" => Some(MediaFormat::Svg),
            _ => None,
        }
    }

    fn passthrough(content_type: &str) -> Option<Self> {
        match content_type {
            "image/webp" => Some(MediaFormat::Webp),
            "image/gif" => Some(MediaFormat::Gif),
            "image/svg+xml" => Some(MediaFormat::Svg),
            _ => None,
        }
    }
}

/// Bytes ready to be written to the blob store.
#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub format: MediaFormat,
    pub bytes: Bytes,
}

impl MediaPayload {
    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }
}

/// Validate and normalize an upload.
pub fn prepare(upload: &Upload, config: &MediaConfig) -> Result<MediaPayload, MediaError> {
    let content_type = upload
        .content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if !content_type.starts_with("image/") {
        return Err(MediaError::UnsupportedMediaFormat { content_type });
    }
    if upload.bytes.is_empty() {
        return Err(MediaError::invalid("image", "empty upload"));
    }
    if upload.bytes.len() > config.max_image_bytes {
        return Err(MediaError::invalid(
            "image",
            format!("exceeds {} bytes", config.max_image_bytes),
        ));
    }

    if let Some(format) = MediaFormat::passthrough(&content_type) {
        return Ok(MediaPayload {
            format,
            bytes: upload.bytes.clone(),
        });
    }

    let decode_err = |e: image::ImageError| MediaError::invalid("image", e.to_string());

    let reader = ImageReader::new(Cursor::new(upload.bytes.as_ref()))
        .with_guessed_format()
        .map_err(|e| MediaError::invalid("image", e.to_string()))?;

    let format = match reader.format() {
        Some(ImageFormat::Jpeg) => MediaFormat::Jpeg,
        Some(ImageFormat::Png) => MediaFormat::Png,
        Some(ImageFormat::WebP) => MediaFormat::Webp,
        Some(ImageFormat::Gif) => MediaFormat::Gif,
        Some(_) => return Err(MediaError::UnsupportedMediaFormat { content_type }),
        None => return Err(MediaError::invalid("image", "unrecognized image data")),
    };

    // Content type lied about an animated or lossless-as-is format.
    if matches!(format, MediaFormat::Webp | MediaFormat::Gif) {
        return Ok(MediaPayload {
            format,
            bytes: upload.bytes.clone(),
        });
    }

    let mut decoder = reader.into_decoder().map_err(decode_err)?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut img = DynamicImage::from_decoder(decoder).map_err(decode_err)?;

    let mut out = Vec::with_capacity(upload.bytes.len());
    match format {
        MediaFormat::Jpeg => {
            img.apply_orientation(orientation);
            let encoder = JpegEncoder::new_with_quality(&mut out, config.jpeg_quality);
            img.to_rgb8().write_with_encoder(encoder).map_err(decode_err)?;
        }
        _ => {
            let encoder =
                PngEncoder::new_with_quality(&mut out, CompressionType::Best, FilterType::Adaptive);
            img.write_with_encoder(encoder).map_err(decode_err)?;
        }
    }

    debug!(
        "Prepared {} upload: {} -> {} bytes",
        format.extension(),
        upload.bytes.len(),
        out.len()
    );

    Ok(MediaPayload {
        format,
        bytes: Bytes::from(out),
    })
}

/// [`prepare`] on the blocking pool.
pub async fn prepare_blocking(upload: Upload, config: MediaConfig) -> Result<MediaPayload, MediaError> {
    tokio::task::spawn_blocking(move || prepare(&upload, &config))
        .await
        .map_err(|e| MediaError::Internal(anyhow::anyhow!("image preparation task failed: {e}")))?
}


#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> MediaConfig {
        MediaConfig::default()
    }

    #[test]
    fn test_rejects_non_image_content_type() {
        let err = prepare(&Upload::new("application/pdf", vec![1, 2, 3]), &cfg()).unwrap_err();
        assert!(matches!(err, MediaError::UnsupportedMediaFormat { .. }));
    }

    #[test]
    fn test_svg_passes_through_untouched() {
        let svg = b"<svg xmlns='http://www.w3.org/2000/svg'/>".to_vec();
        let payload = prepare(&Upload::new("image/svg+xml", svg.clone()), &cfg()).unwrap();
        assert_eq!(payload.format, MediaFormat::Svg);
        assert_eq!(payload.bytes.as_ref(), svg.as_slice());
        assert_eq!(payload.content_type(), "image/svg+xml");
    }

    #[test]
    fn test_png_is_reencoded() {
        let payload = prepare(&Upload::new("image/png", fixtures::png()), &cfg()).unwrap();
        assert_eq!(payload.format, MediaFormat::Png);
        let img = image::load_from_memory(&payload.bytes).unwrap();
        assert_eq!((img.width(), img.height()), (4, 3));
    }

    #[test]
    fn test_jpeg_is_reencoded() {
        let payload = prepare(&Upload::new("image/jpeg; charset=binary", fixtures::jpeg()), &cfg())
            .unwrap();
        assert_eq!(payload.format, MediaFormat::Jpeg);
        assert_eq!(payload.format.extension(), "jpg");
        assert!(image::load_from_memory(&payload.bytes).is_ok());
    }

    #[test]
    fn test_corrupt_bytes_are_invalid_input() {
        let mut bytes = fixtures::png();
        bytes.truncate(20);
        let err = prepare(&Upload::new("image/png", bytes), &cfg()).unwrap_err();
        assert_eq!(err.code(), "InvalidInput");
    }

    #[test]
    fn test_oversized_upload_rejected() {
        let small = MediaConfig {
            max_image_bytes: 8,
            jpeg_quality: 80,
        };
        let err = prepare(&Upload::new("image/png", fixtures::png()), &small).unwrap_err();
        assert_eq!(err.code(), "InvalidInput");
    }

    #[tokio::test]
    async fn test_prepare_blocking() {
        let payload = prepare_blocking(Upload::new("image/png", fixtures::png()), cfg())
            .await
            .unwrap();
        assert_eq!(payload.format, MediaFormat::Png);
    }
}
