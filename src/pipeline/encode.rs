//! Byte-level transforms: classify, re-encode images, hash, and wrap pages
//! for the vision backend.
//!
//! Everything here is synchronous CPU work. Callers on the async side run it
//! through `tokio::task::spawn_blocking` so a 4000 px decode never stalls a
//! runtime worker.
//!
//! ## Why JPEG for normalized images?
//!
//! Receipts are photos. JPEG at quality ~90 keeps them legible at a fraction
//! of the PNG size, and the normalized copy is what gets merged into the
//! final PDF bundle, where DCT data embeds without re-encoding. Pages sent to
//! the vision backend are PNG instead, since they are rendered text and
//! lossless edges help OCR.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageReader};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use tracing::debug;

pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_PNG: &str = "image/png";
pub const MIME_PDF: &str = "application/pdf";

/// How the pipeline treats a file, decided by its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image,
    Pdf,
    Unsupported,
}

/// Lowercased extension after the last `.`, or `""`.
pub fn extension(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => String::new(),
    }
}

pub fn classify(name: &str) -> FileKind {
    match extension(name).as_str() {
        "jpg" | "jpeg" | "png" | "webp" | "bmp" | "tiff" => FileKind::Image,
        "pdf" => FileKind::Pdf,
        _ => FileKind::Unsupported,
    }
}

/// Mime type for a supported extension.
pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "jpg" | "jpeg" => MIME_JPEG,
        "png" => MIME_PNG,
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tiff" => "image/tiff",
        "pdf" => MIME_PDF,
        _ => return None,
    })
}

/// `true` when a fetched document should be treated as a PDF.
pub fn looks_like_pdf(name: &str, mime: Option<&str>, bytes: &[u8]) -> bool {
    mime.is_some_and(|m| m.eq_ignore_ascii_case(MIME_PDF))
        || extension(name) == "pdf"
        || bytes.starts_with(b"%PDF")
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Dimensions after a proportional downscale so the larger side is at most
/// `max_side`. Never upscales; each side is `floor(dim × scale)`, at least 1.
pub fn scaled_dimensions(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_side || longest == 0 {
        return (width, height);
    }
    let scale = max_side as f64 / longest as f64;
    let w = ((width as f64 * scale).floor() as u32).max(1);
    let h = ((height as f64 * scale).floor() as u32).max(1);
    (w, h)
}

/// A re-encoded JPEG image.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decode, apply EXIF orientation, downscale, force RGB8 and re-encode as
/// JPEG at `quality`.
pub fn normalize_image(
    bytes: &[u8],
    max_side: u32,
    quality: u8,
) -> Result<EncodedImage, image::ImageError> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_decoder()?;
    // Orientation is best-effort; a malformed EXIF block is not fatal.
    let orientation = decoder.orientation().ok();
    let mut img = DynamicImage::from_decoder(decoder)?;
    if let Some(o) = orientation {
        img.apply_orientation(o);
    }

    let (w, h) = scaled_dimensions(img.width(), img.height(), max_side);
    if (w, h) != (img.width(), img.height()) {
        debug!("Resizing {}x{} → {}x{}", img.width(), img.height(), w, h);
        img = img.resize_exact(w, h, FilterType::Lanczos3);
    }

    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let out = encode_jpeg(&rgb, quality)?;
    Ok(EncodedImage {
        bytes: out,
        width: rgb.width(),
        height: rgb.height(),
    })
}

/// Encode an image as JPEG, converting to RGB8 first when needed.
pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    match img {
        DynamicImage::ImageRgb8(_) => img.write_with_encoder(encoder)?,
        other => DynamicImage::ImageRgb8(other.to_rgb8()).write_with_encoder(encoder)?,
    }
    Ok(buf)
}

/// Page count of a PDF, or `None` when it does not parse.
pub fn pdf_page_count(bytes: &[u8]) -> Option<usize> {
    lopdf::Document::load_mem(bytes)
        .ok()
        .map(|doc| doc.get_pages().len())
}

/// Wrap an already-encoded image for the vision backend.
///
/// `detail: "high"` lets GPT-4-class models tile the full image instead of a
/// single 512 px overview; fine print on receipts is lost otherwise.
pub fn image_data(bytes: &[u8], mime: &str) -> ImageData {
    let b64 = STANDARD.encode(bytes);
    debug!("Encoded {} image → {} bytes base64", mime, b64.len());
    ImageData::new(b64, mime).with_detail("high")
}

/// Encode a rendered page as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}
