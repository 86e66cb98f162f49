//! nexus-ingest: turns local files into normalized `Document`s
//!
//! Text is checked for UTF-8 and size. Images are base64-encoded as-is when
//! they already fit the configured budget, otherwise decoded, downscaled and
//! re-encoded as JPEG until they do. PDFs pass through untouched.

use std::io::Cursor;
use std::path::Path;

use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use nexus_core::config::IngestConfig;
use nexus_core::models::Document;
use thiserror::Error;

/// Quality used when an image has to be re-encoded.
const JPEG_QUALITY: u8 = 85;
/// Each downscale pass shrinks both sides by this factor.
const SCALE_STEP: f32 = 0.75;
/// Refuse to shrink below this many pixels on the short side.
const MIN_DIMENSION: u32 = 64;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported media type: {0}")]
    Unsupported(String),

    #[error("Image decode error: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Payload too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("Text is not valid UTF-8")]
    NotUtf8,
}

/// Media-type family the normalizer knows how to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Text,
    Image,
    Pdf,
}

fn family(media_type: &str) -> Option<Family> {
    match media_type {
        "image/jpeg" | "image/png" => Some(Family::Image),
        "application/pdf" => Some(Family::Pdf),
        "application/json" | "text/markdown" => Some(Family::Text),
        m if m.starts_with("text/") => Some(Family::Text),
        _ => None,
    }
}

/// Guess a media type from a file name, falling back to octet-stream.
pub fn media_type_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

fn encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Length of the base64 encoding of `n` raw bytes.
fn encoded_len(n: usize) -> usize {
    n.div_ceil(3) * 4
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    limits: IngestConfig,
}

impl Normalizer {
    pub fn new(limits: IngestConfig) -> Self {
        Self { limits }
    }

    /// Read and normalize a file, detecting its media type from the extension.
    pub fn normalize_path(&self, path: &Path) -> Result<Document, IngestError> {
        let media_type = media_type_for(path);
        let bytes = std::fs::read(path)?;
        tracing::debug!(path = %path.display(), media_type = %media_type, size = bytes.len(), "Normalizing file");
        self.normalize_bytes(&bytes, &media_type)
    }

    pub fn normalize_bytes(&self, bytes: &[u8], media_type: &str) -> Result<Document, IngestError> {
        match family(media_type) {
            Some(Family::Text) => self.text(bytes),
            Some(Family::Image) => self.image(bytes, media_type),
            Some(Family::Pdf) => self.passthrough(bytes, media_type),
            None => Err(IngestError::Unsupported(media_type.to_string())),
        }
    }

    fn text(&self, bytes: &[u8]) -> Result<Document, IngestError> {
        if bytes.len() > self.limits.max_text_bytes {
            return Err(IngestError::TooLarge {
                size: bytes.len(),
                limit: self.limits.max_text_bytes,
            });
        }
        let text = std::str::from_utf8(bytes).map_err(|_| IngestError::NotUtf8)?;
        Ok(Document::text(text))
    }

    fn passthrough(&self, bytes: &[u8], media_type: &str) -> Result<Document, IngestError> {
        let size = encoded_len(bytes.len());
        if size > self.limits.max_image_bytes {
            return Err(IngestError::TooLarge {
                size,
                limit: self.limits.max_image_bytes,
            });
        }
        Ok(Document::image(media_type, encode(bytes)))
    }

    fn image(&self, bytes: &[u8], media_type: &str) -> Result<Document, IngestError> {
        if encoded_len(bytes.len()) <= self.limits.max_image_bytes {
            return Ok(Document::image(media_type, encode(bytes)));
        }

        let rgb = image::load_from_memory(bytes)?.to_rgb8();
        let (mut width, mut height) = rgb.dimensions();
        loop {
            width = (width as f32 * SCALE_STEP) as u32;
            height = (height as f32 * SCALE_STEP) as u32;
            if width.min(height) < MIN_DIMENSION {
                return Err(IngestError::TooLarge {
                    size: encoded_len(bytes.len()),
                    limit: self.limits.max_image_bytes,
                });
            }

            let resized = image::imageops::resize(&rgb, width, height, FilterType::Triangle);
            let mut out = Cursor::new(Vec::new());
            JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode_image(&resized)?;
            let jpeg = out.into_inner();

            if encoded_len(jpeg.len()) <= self.limits.max_image_bytes {
                tracing::info!(width, height, bytes = jpeg.len(), "Downscaled image to fit payload budget");
                return Ok(Document::image("image/jpeg", encode(&jpeg)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Write;

    fn limits(max_image_bytes: usize) -> IngestConfig {
        IngestConfig {
            max_image_bytes,
            max_text_bytes: 1024,
        }
    }

    /// A noisy PNG that compresses poorly, so size tracks dimensions.
    fn noisy_png(side: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(side, side, |x, y| {
            let v = x.wrapping_mul(7919) ^ y.wrapping_mul(104729);
            Rgb([(v & 0xff) as u8, ((v >> 8) & 0xff) as u8, ((v >> 3) & 0xff) as u8])
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_text_file_becomes_text_document() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        write!(file, "2023年5月1日 门诊诊断").unwrap();

        let doc = Normalizer::default().normalize_path(file.path()).unwrap();
        assert_eq!(doc, Document::text("2023年5月1日 门诊诊断"));
    }

    #[test]
    fn test_text_limits() {
        let normalizer = Normalizer::new(limits(1024));
        let err = normalizer.normalize_bytes(&[0xff, 0xfe], "text/plain").unwrap_err();
        assert!(matches!(err, IngestError::NotUtf8));

        let big = vec![b'a'; 2048];
        let err = normalizer.normalize_bytes(&big, "text/plain").unwrap_err();
        assert!(matches!(err, IngestError::TooLarge { size: 2048, limit: 1024 }));
    }

    #[test]
    fn test_small_png_is_passed_through() {
        let png = noisy_png(32);
        let doc = Normalizer::default().normalize_bytes(&png, "image/png").unwrap();
        match doc {
            Document::Image { media_type, data } => {
                assert_eq!(media_type, "image/png");
                let decoded = base64::engine::general_purpose::STANDARD.decode(data).unwrap();
                assert_eq!(decoded, png);
            }
            other => panic!("Expected image, got {:?}", other),
        }
    }

    #[test]
    fn test_large_image_is_downscaled_under_budget() {
        let png = noisy_png(512);
        let budget = encoded_len(png.len()) / 4;
        let normalizer = Normalizer::new(limits(budget));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.png");
        std::fs::write(&path, &png).unwrap();

        let doc = normalizer.normalize_path(&path).unwrap();
        match doc {
            Document::Image { media_type, data } => {
                assert_eq!(media_type, "image/jpeg");
                assert!(data.len() <= budget, "{} > {}", data.len(), budget);
            }
            other => panic!("Expected image, got {:?}", other),
        }
    }

    #[test]
    fn test_image_that_cannot_shrink_enough_is_rejected() {
        let png = noisy_png(128);
        let err = Normalizer::new(limits(16)).normalize_bytes(&png, "image/png").unwrap_err();
        assert!(matches!(err, IngestError::TooLarge { limit: 16, .. }));
    }

    #[test]
    fn test_pdf_passthrough_and_unsupported_types() {
        let normalizer = Normalizer::new(limits(1024));
        let doc = normalizer.normalize_bytes(b"%PDF-1.4", "application/pdf").unwrap();
        assert!(matches!(doc, Document::Image { ref media_type, .. } if media_type == "application/pdf"));

        let err = normalizer
            .normalize_bytes(b"\0\0", "application/octet-stream")
            .unwrap_err();
        assert!(matches!(err, IngestError::Unsupported(_)));
    }

    #[test]
    fn test_media_type_detection() {
        assert_eq!(media_type_for(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(media_type_for(Path::new("notes.md")), "text/markdown");
        assert_eq!(media_type_for(Path::new("blob")), "application/octet-stream");
    }
}
