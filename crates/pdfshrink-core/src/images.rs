//! Embedded raster images
//!
//! Finds image XObjects, works out the resolution each one is displayed at
//! by walking page content streams, and decodes image samples into
//! [`image::DynamicImage`] for the re-encoder.

use std::collections::{BTreeSet, HashMap};

use image::imageops::FilterType;
use image::{DynamicImage, GrayAlphaImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use serde::Serialize;
use tracing::debug;

use crate::error::CompressError;

/// Nested form XObjects deeper than this are not scanned for placements.
const MAX_FORM_DEPTH: usize = 8;

/// Coarse color model of an embedded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    Gray,
    Rgb,
    Cmyk,
    Indexed,
    Unknown,
}

/// One embedded raster image as found in the document.
#[derive(Debug, Clone)]
pub struct ImageCandidate {
    pub id: ObjectId,
    /// Encoded stream content exactly as stored in the file
    pub payload: Vec<u8>,
    /// Last filter in the chain, e.g. `DCTDecode`
    pub filter: Option<String>,
    /// Effective resolution (x, y) of its largest placement on a page
    pub dpi: Option<(f32, f32)>,
    pub width: u32,
    pub height: u32,
    pub color_mode: ColorMode,
    pub has_alpha: bool,
}

impl ImageCandidate {
    /// Build a candidate for `id`, or `None` if it is not an image stream.
    pub fn load(doc: &Document, id: ObjectId, dpi: Option<(f32, f32)>) -> Option<Self> {
        let stream = match doc.get_object(id) {
            Ok(Object::Stream(stream)) if is_image(stream) => stream,
            _ => return None,
        };

        let color_mode = stream
            .dict
            .get(b"ColorSpace")
            .map(|cs| ColorSpace::resolve(doc, cs).mode())
            .unwrap_or(ColorMode::Unknown);

        Some(Self {
            id,
            payload: stream.content.clone(),
            filter: filter_names(&stream.dict).pop(),
            dpi,
            width: dict_u32(&stream.dict, b"Width").unwrap_or(0),
            height: dict_u32(&stream.dict, b"Height").unwrap_or(0),
            color_mode,
            has_alpha: stream.dict.get(b"SMask").is_ok(),
        })
    }

    /// Larger of the two effective resolutions.
    pub fn max_dpi(&self) -> Option<f32> {
        self.dpi.map(|(x, y)| x.max(y))
    }
}

/// All images in object-id order with their placement resolution.
pub fn collect_candidates(doc: &Document) -> Vec<ImageCandidate> {
    let dpi = placement_dpi(doc);
    image_object_ids(doc)
        .into_iter()
        .filter_map(|id| ImageCandidate::load(doc, id, dpi.get(&id).copied()))
        .collect()
}

/// Image XObject ids, excluding streams that only serve as soft masks.
pub fn image_object_ids(doc: &Document) -> Vec<ObjectId> {
    let mut images = BTreeSet::new();
    let mut masks = BTreeSet::new();

    for (id, object) in doc.objects.iter() {
        if let Object::Stream(stream) = object {
            if is_image(stream) {
                images.insert(*id);
                if let Ok(Object::Reference(mask)) = stream.dict.get(b"SMask") {
                    masks.insert(*mask);
                }
            }
        }
    }

    images.difference(&masks).copied().collect()
}

fn is_image(stream: &Stream) -> bool {
    matches!(stream.dict.get(b"Subtype"), Ok(Object::Name(name)) if name == b"Image")
}

// ============================================================================
// Placement scanning
// ============================================================================

/// Effective DPI of every image drawn on a page.
///
/// When an image is placed more than once the largest placement (lowest
/// resolution) wins, so downsampling never degrades the biggest rendering.
pub fn placement_dpi(doc: &Document) -> HashMap<ObjectId, (f32, f32)> {
    let mut scanner = PlacementScanner {
        doc,
        dpi: HashMap::new(),
        form_stack: Vec::new(),
    };

    for (page_num, page_id) in doc.get_pages() {
        let content = match doc.get_page_content(page_id) {
            Ok(content) => content,
            Err(e) => {
                debug!("Page {} has no readable content: {}", page_num, e);
                continue;
            }
        };
        let resources = page_resources(doc, page_id);
        scanner.scan(&content, resources, Matrix::IDENTITY, 0);
    }

    scanner.dpi
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Matrix([f32; 6]);

impl Matrix {
    const IDENTITY: Matrix = Matrix([1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);

    fn from_operands(operands: &[Object]) -> Option<Matrix> {
        if operands.len() != 6 {
            return None;
        }
        let mut m = [0.0; 6];
        for (slot, operand) in m.iter_mut().zip(operands) {
            *slot = as_number(operand)?;
        }
        Some(Matrix(m))
    }

    /// `self × other`, i.e. apply `self` first, then `other`.
    fn then(&self, other: &Matrix) -> Matrix {
        let [a, b, c, d, e, f] = self.0;
        let [a2, b2, c2, d2, e2, f2] = other.0;
        Matrix([
            a * a2 + b * c2,
            a * b2 + b * d2,
            c * a2 + d * c2,
            c * b2 + d * d2,
            e * a2 + f * c2 + e2,
            e * b2 + f * d2 + f2,
        ])
    }

    /// Length of the transformed unit x vector, in points.
    fn x_extent(&self) -> f32 {
        self.0[0].hypot(self.0[1])
    }

    fn y_extent(&self) -> f32 {
        self.0[2].hypot(self.0[3])
    }
}

struct PlacementScanner<'a> {
    doc: &'a Document,
    dpi: HashMap<ObjectId, (f32, f32)>,
    form_stack: Vec<ObjectId>,
}

impl<'a> PlacementScanner<'a> {
    fn scan(
        &mut self,
        content: &[u8],
        resources: Option<&'a Dictionary>,
        base: Matrix,
        depth: usize,
    ) {
        let content = match Content::decode(content) {
            Ok(content) => content,
            Err(e) => {
                debug!("Skipping undecodable content stream: {}", e);
                return;
            }
        };

        let mut saved = Vec::new();
        let mut ctm = base;

        for op in &content.operations {
            match op.operator.as_str() {
                "q" => saved.push(ctm),
                "Q" => {
                    if let Some(previous) = saved.pop() {
                        ctm = previous;
                    }
                }
                "cm" => {
                    if let Some(m) = Matrix::from_operands(&op.operands) {
                        ctm = m.then(&ctm);
                    }
                }
                "Do" => {
                    if let Some(Object::Name(name)) = op.operands.first() {
                        self.draw_xobject(name, resources, ctm, depth);
                    }
                }
                _ => {}
            }
        }
    }

    fn draw_xobject(
        &mut self,
        name: &[u8],
        resources: Option<&'a Dictionary>,
        ctm: Matrix,
        depth: usize,
    ) {
        let doc = self.doc;
        let Some(id) = resources.and_then(|r| xobject_id(doc, r, name)) else {
            return;
        };
        let Ok(Object::Stream(stream)) = doc.get_object(id) else {
            return;
        };

        match stream.dict.get(b"Subtype") {
            Ok(Object::Name(subtype)) if subtype == b"Image" => self.record(id, stream, ctm),
            Ok(Object::Name(subtype)) if subtype == b"Form" => {
                if depth >= MAX_FORM_DEPTH || self.form_stack.contains(&id) {
                    return;
                }
                let matrix = match stream.dict.get(b"Matrix") {
                    Ok(Object::Array(values)) => {
                        Matrix::from_operands(values).unwrap_or(Matrix::IDENTITY)
                    }
                    _ => Matrix::IDENTITY,
                };
                let form_resources = stream
                    .dict
                    .get(b"Resources")
                    .ok()
                    .and_then(|r| resolve_dict(doc, r))
                    .or(resources);

                self.form_stack.push(id);
                self.scan(
                    &stream_bytes(stream),
                    form_resources,
                    matrix.then(&ctm),
                    depth + 1,
                );
                self.form_stack.pop();
            }
            _ => {}
        }
    }

    fn record(&mut self, id: ObjectId, stream: &Stream, ctm: Matrix) {
        let (Some(width), Some(height)) = (
            dict_u32(&stream.dict, b"Width"),
            dict_u32(&stream.dict, b"Height"),
        ) else {
            return;
        };

        let (w_pt, h_pt) = (ctm.x_extent(), ctm.y_extent());
        if w_pt < 0.01 || h_pt < 0.01 {
            return;
        }

        let dpi = (width as f32 * 72.0 / w_pt, height as f32 * 72.0 / h_pt);
        self.dpi
            .entry(id)
            .and_modify(|existing| {
                if dpi.0.max(dpi.1) < existing.0.max(existing.1) {
                    *existing = dpi;
                }
            })
            .or_insert(dpi);
    }
}

/// Resources of a page, inherited from ancestors in the page tree if needed.
fn page_resources(doc: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    let mut current = doc.get_dictionary(page_id).ok();
    let mut hops = 0;

    while let Some(dict) = current {
        if let Some(resources) = dict.get(b"Resources").ok().and_then(|r| resolve_dict(doc, r)) {
            return Some(resources);
        }
        hops += 1;
        if hops > 64 {
            break;
        }
        current = match dict.get(b"Parent") {
            Ok(Object::Reference(parent)) => doc.get_dictionary(*parent).ok(),
            _ => None,
        };
    }

    None
}

fn xobject_id(doc: &Document, resources: &Dictionary, name: &[u8]) -> Option<ObjectId> {
    let xobjects = resources
        .get(b"XObject")
        .ok()
        .and_then(|x| resolve_dict(doc, x))?;
    match xobjects.get(name) {
        Ok(Object::Reference(id)) => Some(*id),
        _ => None,
    }
}

// ============================================================================
// Color spaces
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ColorSpace {
    Gray,
    Rgb,
    Cmyk,
    Indexed {
        base: Box<ColorSpace>,
        palette: Vec<u8>,
    },
    Unsupported(String),
}

impl ColorSpace {
    pub(crate) fn resolve(doc: &Document, object: &Object) -> ColorSpace {
        Self::resolve_inner(doc, object, true)
    }

    fn resolve_inner(doc: &Document, object: &Object, allow_indexed: bool) -> ColorSpace {
        match resolve(doc, object) {
            Object::Name(name) => Self::from_family(name),
            Object::Array(items) => {
                let Some(Object::Name(family)) = items.first() else {
                    return ColorSpace::Unsupported("empty color space array".into());
                };
                match family.as_slice() {
                    b"ICCBased" => {
                        let components = items
                            .get(1)
                            .and_then(|s| match resolve(doc, s) {
                                Object::Stream(stream) => dict_u32(&stream.dict, b"N"),
                                _ => None,
                            })
                            .unwrap_or(0);
                        match components {
                            1 => ColorSpace::Gray,
                            3 => ColorSpace::Rgb,
                            4 => ColorSpace::Cmyk,
                            n => ColorSpace::Unsupported(format!("ICCBased with {} components", n)),
                        }
                    }
                    b"Indexed" | b"I" if allow_indexed => Self::indexed(doc, items),
                    other => Self::from_family(other),
                }
            }
            _ => ColorSpace::Unsupported("unrecognised color space object".into()),
        }
    }

    fn from_family(name: &[u8]) -> ColorSpace {
        match name {
            b"DeviceGray" | b"CalGray" | b"G" => ColorSpace::Gray,
            b"DeviceRGB" | b"CalRGB" | b"RGB" => ColorSpace::Rgb,
            b"DeviceCMYK" | b"CMYK" => ColorSpace::Cmyk,
            other => ColorSpace::Unsupported(String::from_utf8_lossy(other).into_owned()),
        }
    }

    fn indexed(doc: &Document, items: &[Object]) -> ColorSpace {
        let (Some(base), Some(hival), Some(lookup)) = (items.get(1), items.get(2), items.get(3))
        else {
            return ColorSpace::Unsupported("malformed Indexed color space".into());
        };

        let base = Self::resolve_inner(doc, base, false);
        let Some(components) = base.components() else {
            return ColorSpace::Unsupported("Indexed over unsupported base".into());
        };

        let mut palette = match resolve(doc, lookup) {
            Object::String(bytes, _) => bytes.clone(),
            Object::Stream(stream) => stream_bytes(stream),
            _ => return ColorSpace::Unsupported("Indexed lookup missing".into()),
        };
        let entries = as_number(hival).map(|h| h as usize + 1).unwrap_or(0);
        palette.truncate(entries * components);

        ColorSpace::Indexed {
            base: Box::new(base),
            palette,
        }
    }

    fn components(&self) -> Option<usize> {
        match self {
            ColorSpace::Gray => Some(1),
            ColorSpace::Rgb => Some(3),
            ColorSpace::Cmyk => Some(4),
            ColorSpace::Indexed { .. } => Some(1),
            ColorSpace::Unsupported(_) => None,
        }
    }

    fn mode(&self) -> ColorMode {
        match self {
            ColorSpace::Gray => ColorMode::Gray,
            ColorSpace::Rgb => ColorMode::Rgb,
            ColorSpace::Cmyk => ColorMode::Cmyk,
            ColorSpace::Indexed { .. } => ColorMode::Indexed,
            ColorSpace::Unsupported(_) => ColorMode::Unknown,
        }
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decoded pixels of one image plus whether its stored form was lossy.
pub(crate) struct DecodedImage {
    pub image: DynamicImage,
    pub lossy_source: bool,
}

/// Decode an image stream (and its soft mask, as alpha) into pixels.
pub(crate) fn decode_image(
    doc: &Document,
    id: ObjectId,
    stream: &Stream,
) -> Result<DecodedImage, CompressError> {
    let dict = &stream.dict;

    if matches!(dict.get(b"ImageMask"), Ok(Object::Boolean(true))) {
        return Err(CompressError::image(id, "stencil masks are left as-is"));
    }
    if dict.get(b"Decode").is_ok() {
        return Err(CompressError::image(id, "custom /Decode arrays are not supported"));
    }
    if matches!(dict.get(b"Mask"), Ok(Object::Array(_))) {
        return Err(CompressError::image(id, "colour key masks are not supported"));
    }

    let (width, height) = match (dict_u32(dict, b"Width"), dict_u32(dict, b"Height")) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(CompressError::image(id, "missing or zero dimensions")),
    };

    let color_space = match dict.get(b"ColorSpace") {
        Ok(cs) => ColorSpace::resolve(doc, cs),
        Err(_) => ColorSpace::Unsupported("missing /ColorSpace".into()),
    };

    let filters = filter_names(dict);
    let (image, lossy_source) = match filters.last().map(String::as_str) {
        Some("DCTDecode") => {
            if filters.len() > 1 {
                return Err(CompressError::image(id, "chained filters before DCTDecode"));
            }
            // Re-encoded output is tagged DeviceGray or DeviceRGB, so any
            // other space would change the rendered colours.
            if !matches!(color_space, ColorSpace::Gray | ColorSpace::Rgb) {
                return Err(CompressError::image(
                    id,
                    format!("JPEG in color space {:?} is left as-is", color_space),
                ));
            }
            let image = image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)
                .map_err(|e| CompressError::image(id, format!("JPEG decode failed: {}", e)))?;
            (image, true)
        }
        None | Some("FlateDecode") | Some("LZWDecode") => {
            if filters.iter().any(|f| f != "FlateDecode" && f != "LZWDecode") {
                return Err(CompressError::image(id, format!("unsupported filter chain {:?}", filters)));
            }
            if dict_u32(dict, b"BitsPerComponent") != Some(8) {
                return Err(CompressError::image(id, "only 8 bits per component is supported"));
            }
            let samples = if filters.is_empty() {
                stream.content.clone()
            } else {
                stream
                    .decompressed_content()
                    .map_err(|e| CompressError::image(id, format!("inflate failed: {}", e)))?
            };
            let image = samples_to_image(&samples, width, height, &color_space)
                .map_err(|reason| CompressError::image(id, reason))?;
            (image, false)
        }
        Some(other) => {
            return Err(CompressError::image(id, format!("unsupported filter {}", other)));
        }
    };

    let image = match dict.get(b"SMask") {
        Ok(Object::Reference(mask_id)) => {
            let alpha = decode_soft_mask(doc, *mask_id, image.width(), image.height())
                .map_err(|reason| CompressError::image(id, reason))?;
            attach_alpha(image, &alpha)
        }
        _ => image,
    };

    Ok(DecodedImage {
        image,
        lossy_source,
    })
}

fn samples_to_image(
    samples: &[u8],
    width: u32,
    height: u32,
    color_space: &ColorSpace,
) -> Result<DynamicImage, String> {
    let pixels = width as usize * height as usize;

    match color_space {
        ColorSpace::Gray => {
            let data = take_samples(samples, pixels)?;
            GrayImage::from_raw(width, height, data)
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(|| "gray buffer size mismatch".to_string())
        }
        ColorSpace::Rgb => {
            let data = take_samples(samples, pixels * 3)?;
            RgbImage::from_raw(width, height, data)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| "RGB buffer size mismatch".to_string())
        }
        ColorSpace::Cmyk => {
            let data = take_samples(samples, pixels * 4)?;
            RgbImage::from_raw(width, height, cmyk_to_rgb(&data))
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| "CMYK buffer size mismatch".to_string())
        }
        ColorSpace::Indexed { base, palette } => {
            let indices = take_samples(samples, pixels)?;
            let components = base.components().unwrap_or(0);
            let mut expanded = Vec::with_capacity(pixels * components);
            for &index in &indices {
                let offset = index as usize * components;
                let entry = palette
                    .get(offset..offset + components)
                    .ok_or_else(|| format!("palette index {} out of range", index))?;
                expanded.extend_from_slice(entry);
            }
            samples_to_image(&expanded, width, height, base)
        }
        ColorSpace::Unsupported(name) => Err(format!("unsupported color space {}", name)),
    }
}

fn take_samples(samples: &[u8], expected: usize) -> Result<Vec<u8>, String> {
    samples
        .get(..expected)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| format!("expected {} samples, found {}", expected, samples.len()))
}

fn cmyk_to_rgb(cmyk: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(cmyk.len() / 4 * 3);
    for px in cmyk.chunks_exact(4) {
        let k = 255 - px[3] as u32;
        for &channel in &px[..3] {
            rgb.push(((255 - channel as u32) * k / 255) as u8);
        }
    }
    rgb
}

fn decode_soft_mask(
    doc: &Document,
    mask_id: ObjectId,
    width: u32,
    height: u32,
) -> Result<GrayImage, String> {
    let stream = match doc.get_object(mask_id) {
        Ok(Object::Stream(stream)) => stream,
        _ => return Err("soft mask is not a stream".into()),
    };

    let (mask_w, mask_h) = match (
        dict_u32(&stream.dict, b"Width"),
        dict_u32(&stream.dict, b"Height"),
    ) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err("soft mask has no dimensions".into()),
    };
    if dict_u32(&stream.dict, b"BitsPerComponent") != Some(8) {
        return Err("soft mask must be 8 bits per component".into());
    }

    let filters = filter_names(&stream.dict);
    if filters.iter().any(|f| f != "FlateDecode" && f != "LZWDecode") {
        return Err(format!("unsupported soft mask filters {:?}", filters));
    }
    let samples = stream_bytes(stream);
    let data = take_samples(&samples, mask_w as usize * mask_h as usize)?;
    let mask = GrayImage::from_raw(mask_w, mask_h, data)
        .ok_or_else(|| "soft mask buffer size mismatch".to_string())?;

    if (mask_w, mask_h) == (width, height) {
        Ok(mask)
    } else {
        Ok(image::imageops::resize(&mask, width, height, FilterType::Triangle))
    }
}

fn attach_alpha(image: DynamicImage, alpha: &GrayImage) -> DynamicImage {
    match image {
        DynamicImage::ImageLuma8(gray) => {
            let mut out = GrayAlphaImage::new(gray.width(), gray.height());
            for (x, y, px) in out.enumerate_pixels_mut() {
                px.0 = [gray.get_pixel(x, y).0[0], alpha.get_pixel(x, y).0[0]];
            }
            DynamicImage::ImageLumaA8(out)
        }
        other => {
            let rgb = other.to_rgb8();
            let mut out = RgbaImage::new(rgb.width(), rgb.height());
            for (x, y, px) in out.enumerate_pixels_mut() {
                let [r, g, b] = rgb.get_pixel(x, y).0;
                px.0 = [r, g, b, alpha.get_pixel(x, y).0[0]];
            }
            DynamicImage::ImageRgba8(out)
        }
    }
}

// ============================================================================
// Object helpers
// ============================================================================

pub(crate) fn resolve<'a>(doc: &'a Document, object: &'a Object) -> &'a Object {
    match object {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(object),
        _ => object,
    }
}

pub(crate) fn resolve_dict<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a Dictionary> {
    match resolve(doc, object) {
        Object::Dictionary(dict) => Some(dict),
        Object::Stream(stream) => Some(&stream.dict),
        _ => None,
    }
}

/// Filter names in application order.
pub(crate) fn filter_names(dict: &Dictionary) -> Vec<String> {
    match dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![String::from_utf8_lossy(name).into_owned()],
        Ok(Object::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Object::Name(name) => Some(String::from_utf8_lossy(name).into_owned()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Decoded stream bytes, or the raw content when no filter applies or
/// decoding fails.
fn stream_bytes(stream: &Stream) -> Vec<u8> {
    if stream.dict.get(b"Filter").is_err() {
        return stream.content.clone();
    }
    stream
        .decompressed_content()
        .unwrap_or_else(|_| stream.content.clone())
}

fn as_number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

pub(crate) fn dict_u32(dict: &Dictionary, key: &[u8]) -> Option<u32> {
    match dict.get(key) {
        Ok(Object::Integer(n)) if *n >= 0 => u32::try_from(*n).ok(),
        Ok(Object::Real(r)) if *r >= 0.0 => Some(*r as u32),
        _ => None,
    }
}
