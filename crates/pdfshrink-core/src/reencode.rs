//! Image re-encode pass
//!
//! Each image XObject is decoded, downsampled to the policy's target DPI,
//! optionally converted to grayscale and written back as JPEG or lossless
//! Flate. A replacement is only kept if it passes the size acceptance test;
//! anything that goes wrong for one image leaves that image untouched.

use std::collections::HashSet;
use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};
use jpeg_encoder::{ColorType, Encoder, SamplingFactor};
use lopdf::{Document, Object, ObjectId, Stream, StringFormat};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ReencodeTuning;
use crate::error::CompressError;
use crate::images::{decode_image, image_object_ids, placement_dpi};
use crate::tier::ImagePolicy;

/// Per-pass image counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReencodeStats {
    pub seen: usize,
    pub replaced: usize,
    /// Re-encoded but failed the size acceptance test
    pub rejected: usize,
    /// Below the minimum payload size
    pub skipped: usize,
    /// Could not be decoded or encoded
    pub failed: usize,
    /// Payload bytes of replaced images before and after
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl ReencodeStats {
    pub fn merge(&mut self, other: &ReencodeStats) {
        self.seen += other.seen;
        self.replaced += other.replaced;
        self.rejected += other.rejected;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.bytes_before += other.bytes_before;
        self.bytes_after += other.bytes_after;
    }
}

#[derive(Debug, PartialEq)]
enum Outcome {
    Replaced { before: usize, after: usize },
    Rejected,
    Skipped,
}

/// Re-encode every image of a serialized document and save the result.
pub fn reencode_images(
    input: &[u8],
    policy: &ImagePolicy,
    tuning: &ReencodeTuning,
) -> Result<(Vec<u8>, ReencodeStats), CompressError> {
    let mut doc =
        Document::load_mem(input).map_err(|e| CompressError::CorruptInput(e.to_string()))?;

    let stats = reencode_document(&mut doc, policy, tuning);

    doc.prune_objects();
    doc.compress();

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)
        .map_err(|e| CompressError::Save(e.to_string()))?;

    Ok((buffer, stats))
}

/// Re-encode images in place. Never fails; per-image errors are counted.
pub fn reencode_document(
    doc: &mut Document,
    policy: &ImagePolicy,
    tuning: &ReencodeTuning,
) -> ReencodeStats {
    let dpi = placement_dpi(doc);
    let mut stats = ReencodeStats::default();

    for id in image_object_ids(doc) {
        stats.seen += 1;
        match reencode_one(doc, id, dpi.get(&id).copied(), policy, tuning) {
            Ok(Outcome::Replaced { before, after }) => {
                stats.replaced += 1;
                stats.bytes_before += before as u64;
                stats.bytes_after += after as u64;
            }
            Ok(Outcome::Rejected) => stats.rejected += 1,
            Ok(Outcome::Skipped) => stats.skipped += 1,
            Err(e) => {
                warn!("Leaving image unchanged: {}", e);
                stats.failed += 1;
            }
        }
    }

    info!(
        seen = stats.seen,
        replaced = stats.replaced,
        rejected = stats.rejected,
        skipped = stats.skipped,
        failed = stats.failed,
        "Image re-encode finished"
    );
    stats
}

/// Size acceptance test for a replacement payload.
pub fn accepts_replacement(
    original_len: usize,
    new_len: usize,
    quality: u8,
    tuning: &ReencodeTuning,
) -> bool {
    (new_len as f64) < original_len as f64 * tuning.acceptance_factor(quality)
}

fn reencode_one(
    doc: &mut Document,
    id: ObjectId,
    dpi: Option<(f32, f32)>,
    policy: &ImagePolicy,
    tuning: &ReencodeTuning,
) -> Result<Outcome, CompressError> {
    let stream = match doc.get_object(id) {
        Ok(Object::Stream(stream)) => stream,
        _ => return Err(CompressError::image(id, "object is not a stream")),
    };

    let original_len = stream.content.len();
    if original_len < tuning.min_payload_bytes(policy.quality) {
        return Ok(Outcome::Skipped);
    }

    let decoded = decode_image(doc, id, stream)?;
    let high_compression = tuning.is_high_compression(policy.quality);

    let mut image = rescale(decoded.image, dpi, policy.target_dpi);

    let is_color = !matches!(
        image,
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageLumaA8(_)
    );
    let to_gray = is_color
        && (policy.grayscale
            || (high_compression
                && image.width() > tuning.grayscale_min_dimension
                && image.height() > tuning.grayscale_min_dimension));
    if to_gray {
        image = image.grayscale();
    }

    let image = flatten_on_white(image);

    let lossless = !high_compression
        && policy.quality > tuning.lossless_min_quality
        && !decoded.lossy_source
        && distinct_colors_within(&image, tuning.palette_max_colors);

    let replacement = if lossless {
        encode_lossless(&image)
    } else {
        encode_jpeg(image, policy.quality, high_compression, tuning)
    }
    .map_err(|reason| CompressError::image(id, reason))?;

    let new_len = replacement.content.len();
    if !accepts_replacement(original_len, new_len, policy.quality, tuning) {
        debug!(
            "Image {:?}: {} -> {} bytes rejected",
            id, original_len, new_len
        );
        return Ok(Outcome::Rejected);
    }

    let mut dict = stream.dict.clone();
    for key in [
        &b"Filter"[..],
        b"DecodeParms",
        b"SMask",
        b"ColorSpace",
        b"BitsPerComponent",
        b"Width",
        b"Height",
        b"Length",
    ] {
        dict.remove(key);
    }
    for (key, value) in replacement.dict.iter() {
        dict.set(key.clone(), value.clone());
    }

    let mut stream = Stream::new(dict, replacement.content);
    stream.allows_compression = false;
    doc.objects.insert(id, Object::Stream(stream));

    debug!("Image {:?}: {} -> {} bytes", id, original_len, new_len);
    Ok(Outcome::Replaced {
        before: original_len,
        after: new_len,
    })
}

/// Downsample when displayed above `target_dpi`. Never upscales.
fn rescale(image: DynamicImage, dpi: Option<(f32, f32)>, target_dpi: u32) -> DynamicImage {
    let Some((x, y)) = dpi else {
        return image;
    };
    let declared = x.max(y);
    if declared <= target_dpi as f32 {
        return image;
    }

    let scaled = |px: u32| ((px as f64 * target_dpi as f64 / declared as f64).floor() as u32).max(1);
    let (width, height) = (scaled(image.width()), scaled(image.height()));
    if width >= image.width() && height >= image.height() {
        return image;
    }
    image.resize_exact(width, height, FilterType::Lanczos3)
}

/// Composite any alpha onto white, leaving an 8-bit gray or RGB image.
fn flatten_on_white(image: DynamicImage) -> DynamicImage {
    let blend = |value: u8, alpha: u8| -> u8 {
        let (v, a) = (value as u32, alpha as u32);
        ((v * a + 255 * (255 - a)) / 255) as u8
    };

    match image {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => image,
        DynamicImage::ImageLumaA8(gray) => {
            let mut out = GrayImage::new(gray.width(), gray.height());
            for (x, y, px) in out.enumerate_pixels_mut() {
                let [v, a] = gray.get_pixel(x, y).0;
                px.0 = [blend(v, a)];
            }
            DynamicImage::ImageLuma8(out)
        }
        other if other.color().has_alpha() => {
            let rgba = other.to_rgba8();
            let mut out = RgbImage::new(rgba.width(), rgba.height());
            for (x, y, px) in out.enumerate_pixels_mut() {
                let [r, g, b, a] = rgba.get_pixel(x, y).0;
                px.0 = [blend(r, a), blend(g, a), blend(b, a)];
            }
            DynamicImage::ImageRgb8(out)
        }
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    }
}

fn distinct_colors_within(image: &DynamicImage, max: usize) -> bool {
    match image {
        DynamicImage::ImageLuma8(_) => true,
        other => {
            let rgb = other.to_rgb8();
            let mut seen = HashSet::new();
            for px in rgb.pixels() {
                seen.insert(px.0);
                if seen.len() > max {
                    return false;
                }
            }
            true
        }
    }
}

fn encode_jpeg(
    image: DynamicImage,
    quality: u8,
    high_compression: bool,
    tuning: &ReencodeTuning,
) -> Result<Stream, String> {
    let gray = matches!(image, DynamicImage::ImageLuma8(_));
    let quality = if gray {
        tuning.grayscale_quality(quality)
    } else {
        quality
    };

    let image = if quality < tuning.sharpen_below_quality {
        image.unsharpen(tuning.sharpen_sigma, tuning.sharpen_threshold)
    } else {
        image
    };

    let (width, height) = (image.width(), image.height());
    let (w16, h16) = match (u16::try_from(width), u16::try_from(height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => return Err(format!("{}x{} is too large for JPEG", width, height)),
    };

    let sampling = if high_compression || quality <= 70 {
        SamplingFactor::R_4_2_0
    } else if quality <= 90 {
        SamplingFactor::R_4_2_2
    } else {
        SamplingFactor::R_4_4_4
    };

    let mut jpeg_bytes = Vec::new();
    let mut encoder = Encoder::new(&mut jpeg_bytes, quality);
    encoder.set_progressive(true);
    encoder.set_sampling_factor(sampling);

    let color_space = if gray {
        let luma = image.to_luma8();
        encoder
            .encode(luma.as_raw(), w16, h16, ColorType::Luma)
            .map_err(|e| format!("JPEG encode failed: {}", e))?;
        "DeviceGray"
    } else {
        let rgb = image.to_rgb8();
        encoder
            .encode(rgb.as_raw(), w16, h16, ColorType::Rgb)
            .map_err(|e| format!("JPEG encode failed: {}", e))?;
        "DeviceRGB"
    };

    let mut dict = image_dict(width, height, Object::Name(color_space.as_bytes().to_vec()));
    dict.set("Filter", Object::Name(b"DCTDecode".to_vec()));
    Ok(Stream::new(dict, jpeg_bytes))
}

/// 8-bit gray, or a palette-indexed RGB image, Flate compressed.
fn encode_lossless(image: &DynamicImage) -> Result<Stream, String> {
    let (width, height) = (image.width(), image.height());

    let (color_space, samples) = match image {
        DynamicImage::ImageLuma8(gray) => {
            (Object::Name(b"DeviceGray".to_vec()), gray.as_raw().clone())
        }
        other => {
            let rgb = other.to_rgb8();
            let mut palette: Vec<[u8; 3]> = Vec::new();
            let mut indices = Vec::with_capacity((width * height) as usize);
            for px in rgb.pixels() {
                let index = match palette.iter().position(|c| *c == px.0) {
                    Some(i) => i,
                    None => {
                        palette.push(px.0);
                        palette.len() - 1
                    }
                };
                let index = u8::try_from(index).map_err(|_| "too many colours for a palette")?;
                indices.push(index);
            }
            let hival = palette.len().saturating_sub(1) as i64;
            let lookup: Vec<u8> = palette.concat();
            let color_space = Object::Array(vec![
                Object::Name(b"Indexed".to_vec()),
                Object::Name(b"DeviceRGB".to_vec()),
                Object::Integer(hival),
                Object::String(lookup, StringFormat::Hexadecimal),
            ]);
            (color_space, indices)
        }
    };

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(&samples)
        .and_then(|_| encoder.finish())
        .map_err(|e| format!("Flate encode failed: {}", e))
        .map(|compressed| {
            let mut dict = image_dict(width, height, color_space);
            dict.set("Filter", Object::Name(b"FlateDecode".to_vec()));
            Stream::new(dict, compressed)
        })
}

fn image_dict(width: u32, height: u32, color_space: Object) -> lopdf::Dictionary {
    let mut dict = lopdf::Dictionary::new();
    dict.set("Width", Object::Integer(width as i64));
    dict.set("Height", Object::Integer(height as i64));
    dict.set("ColorSpace", color_space);
    dict.set("BitsPerComponent", Object::Integer(8));
    dict
}
