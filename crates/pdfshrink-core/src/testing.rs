//! PDF fixtures shared by the unit tests.

use lopdf::{Dictionary, Document, Object, Stream, StringFormat};

pub(crate) struct ImageSpec {
    pub width: u32,
    pub height: u32,
    pub color_space: Object,
    pub filter: Option<&'static str>,
    pub payload: Vec<u8>,
    pub alpha: Option<Vec<u8>>,
}

impl ImageSpec {
    pub fn gray(width: u32, height: u32, samples: Vec<u8>) -> Self {
        Self {
            width,
            height,
            color_space: Object::Name(b"DeviceGray".to_vec()),
            filter: None,
            payload: samples,
            alpha: None,
        }
    }

    pub fn rgb(width: u32, height: u32, samples: Vec<u8>) -> Self {
        Self {
            color_space: Object::Name(b"DeviceRGB".to_vec()),
            ..Self::gray(width, height, samples)
        }
    }

    /// Store `payload` verbatim under `filter`.
    pub fn encoded(mut self, filter: &'static str, payload: Vec<u8>) -> Self {
        self.filter = Some(filter);
        self.payload = payload;
        self
    }

    pub fn with_alpha(mut self, alpha: Vec<u8>) -> Self {
        self.alpha = Some(alpha);
        self
    }
}

/// Smooth diagonal ramp; compresses well as JPEG.
pub(crate) fn gray_gradient(width: u32, height: u32) -> Vec<u8> {
    let span = (width + height).saturating_sub(2).max(1);
    let mut samples = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            samples.push(((x + y) * 255 / span) as u8);
        }
    }
    samples
}

/// Smooth colour ramp, 3 samples per pixel.
pub(crate) fn rgb_gradient(width: u32, height: u32) -> Vec<u8> {
    let mut samples = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            samples.push((x * 255 / width.max(1)) as u8);
            samples.push((y * 255 / height.max(1)) as u8);
            samples.push(128);
        }
    }
    samples
}

/// One page drawing a single image as a `display_pt` square.
pub(crate) fn pdf_with_image(spec: &ImageSpec, display_pt: f32) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let mut image_dict = Dictionary::new();
    image_dict.set("Type", Object::Name(b"XObject".to_vec()));
    image_dict.set("Subtype", Object::Name(b"Image".to_vec()));
    image_dict.set("Width", Object::Integer(spec.width as i64));
    image_dict.set("Height", Object::Integer(spec.height as i64));
    image_dict.set("ColorSpace", spec.color_space.clone());
    image_dict.set("BitsPerComponent", Object::Integer(8));
    if let Some(filter) = spec.filter {
        image_dict.set("Filter", Object::Name(filter.as_bytes().to_vec()));
    }
    if let Some(alpha) = &spec.alpha {
        let mut mask_dict = Dictionary::new();
        mask_dict.set("Type", Object::Name(b"XObject".to_vec()));
        mask_dict.set("Subtype", Object::Name(b"Image".to_vec()));
        mask_dict.set("Width", Object::Integer(spec.width as i64));
        mask_dict.set("Height", Object::Integer(spec.height as i64));
        mask_dict.set("ColorSpace", Object::Name(b"DeviceGray".to_vec()));
        mask_dict.set("BitsPerComponent", Object::Integer(8));
        let mask_id = doc.add_object(Stream::new(mask_dict, alpha.clone()));
        image_dict.set("SMask", Object::Reference(mask_id));
    }
    let mut image = Stream::new(image_dict, spec.payload.clone());
    image.allows_compression = false;
    let image_id = doc.add_object(image);

    let content = format!("q {0} 0 0 {0} 100 100 cm /Im1 Do Q", display_pt);
    let content_id = doc.add_object(Stream::new(Dictionary::new(), content.into_bytes()));

    let mut xobjects = Dictionary::new();
    xobjects.set("Im1", Object::Reference(image_id));
    let mut resources = Dictionary::new();
    resources.set("XObject", Object::Dictionary(xobjects));

    let mut page = Dictionary::new();
    page.set("Type", Object::Name(b"Page".to_vec()));
    page.set("Parent", Object::Reference(pages_id));
    page.set("Contents", Object::Reference(content_id));
    page.set("Resources", Object::Dictionary(resources));
    page.set(
        "MediaBox",
        Object::Array(vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(612),
            Object::Integer(792),
        ]),
    );
    let page_id = doc.add_object(page);

    finish(doc, pages_id, vec![page_id])
}

/// Text-only document with `num_pages` pages.
pub(crate) fn create_test_pdf(num_pages: u32) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let mut page_ids = Vec::new();
    for page_num in 0..num_pages {
        let content = format!("BT /F1 12 Tf 50 700 Td (Page {}) Tj ET", page_num + 1);
        let content_id = doc.add_object(Stream::new(Dictionary::new(), content.into_bytes()));

        let mut page = Dictionary::new();
        page.set("Type", Object::Name(b"Page".to_vec()));
        page.set("Parent", Object::Reference(pages_id));
        page.set("Contents", Object::Reference(content_id));
        page.set(
            "MediaBox",
            Object::Array(vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(612),
                Object::Integer(792),
            ]),
        );
        page_ids.push(doc.add_object(page));
    }

    finish(doc, pages_id, page_ids)
}

fn finish(mut doc: Document, pages_id: lopdf::ObjectId, page_ids: Vec<lopdf::ObjectId>) -> Vec<u8> {
    let mut pages = Dictionary::new();
    pages.set("Type", Object::Name(b"Pages".to_vec()));
    pages.set("Count", Object::Integer(page_ids.len() as i64));
    pages.set(
        "Kids",
        Object::Array(page_ids.into_iter().map(Object::Reference).collect()),
    );
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let mut catalog = Dictionary::new();
    catalog.set("Type", Object::Name(b"Catalog".to_vec()));
    catalog.set("Pages", Object::Reference(pages_id));
    let catalog_id = doc.add_object(catalog);

    let mut info = Dictionary::new();
    info.set(
        "Producer",
        Object::String(b"pdfshrink fixtures".to_vec(), StringFormat::Literal),
    );
    let info_id = doc.add_object(info);

    doc.trailer.set("Root", Object::Reference(catalog_id));
    doc.trailer.set("Info", Object::Reference(info_id));

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).unwrap();
    buffer
}
