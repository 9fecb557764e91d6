//! Structural optimizer
//!
//! Lossless cleanup: metadata removal, merging of byte-identical streams,
//! pruning of unreachable objects and re-saving with compressed streams (and
//! optionally object streams). Referenced objects are never dropped, even
//! when empty, since content streams may still name them.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use lopdf::{Document, Object, ObjectId, SaveOptions};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::CompressError;
use crate::tier::StructuralOptions;

/// What a structural pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StructuralStats {
    pub metadata_removed: bool,
    pub duplicates_merged: usize,
    pub objects_pruned: usize,
}

/// Load, clean and re-save a serialized document.
pub fn optimize_structure(
    input: &[u8],
    options: &StructuralOptions,
) -> Result<(Vec<u8>, StructuralStats), CompressError> {
    let mut doc =
        Document::load_mem(input).map_err(|e| CompressError::CorruptInput(e.to_string()))?;

    let stats = optimize_document(&mut doc);
    let output = save_document(&mut doc, options.object_streams)?;

    info!(
        duplicates = stats.duplicates_merged,
        pruned = stats.objects_pruned,
        object_streams = options.object_streams,
        "Structural optimization: {} -> {} bytes",
        input.len(),
        output.len()
    );
    Ok((output, stats))
}

/// In-memory part of the structural pass.
pub fn optimize_document(doc: &mut Document) -> StructuralStats {
    let metadata_removed = strip_metadata(doc);
    let duplicates_merged = merge_duplicate_streams(doc);
    let objects_pruned = doc.prune_objects().len();
    doc.compress();

    StructuralStats {
        metadata_removed,
        duplicates_merged,
        objects_pruned,
    }
}

pub(crate) fn save_document(
    doc: &mut Document,
    object_streams: bool,
) -> Result<Vec<u8>, CompressError> {
    let mut buffer = Vec::new();
    if object_streams {
        let options = SaveOptions::builder()
            .use_object_streams(true)
            .use_xref_streams(true)
            .compression_level(9)
            .build();
        doc.save_with_options(&mut buffer, options)
            .map_err(|e| CompressError::Save(e.to_string()))?;
    } else {
        doc.save_to(&mut buffer)
            .map_err(|e| CompressError::Save(e.to_string()))?;
    }
    Ok(buffer)
}

/// Drop the trailer `/Info` dictionary and the catalog `/Metadata` stream.
/// The orphaned objects are left for pruning.
fn strip_metadata(doc: &mut Document) -> bool {
    let had_info = doc.trailer.remove(b"Info").is_some();

    let catalog_id = match doc.trailer.get(b"Root") {
        Ok(Object::Reference(id)) => Some(*id),
        _ => None,
    };
    let had_metadata = catalog_id
        .and_then(|id| doc.get_object_mut(id).ok())
        .and_then(|catalog| catalog.as_dict_mut().ok())
        .map(|catalog| catalog.remove(b"Metadata").is_some())
        .unwrap_or(false);

    had_info || had_metadata
}

/// Point every reference to a duplicate stream at its first occurrence and
/// delete the duplicates. Returns the number of streams removed.
fn merge_duplicate_streams(doc: &mut Document) -> usize {
    let mut first_seen: HashMap<(String, u64), Vec<ObjectId>> = HashMap::new();
    let mut replacements: HashMap<ObjectId, ObjectId> = HashMap::new();

    for (id, object) in doc.objects.iter() {
        let Object::Stream(stream) = object else {
            continue;
        };

        let mut hasher = DefaultHasher::new();
        stream.content.hash(&mut hasher);
        let key = (format!("{:?}", stream.dict), hasher.finish());

        let survivors = first_seen.entry(key).or_default();
        let survivor = survivors.iter().copied().find(|other| {
            matches!(doc.objects.get(other), Some(Object::Stream(s)) if s.content == stream.content)
        });
        match survivor {
            Some(survivor) => {
                replacements.insert(*id, survivor);
            }
            None => survivors.push(*id),
        }
    }

    if replacements.is_empty() {
        return 0;
    }

    for object in doc.objects.values_mut() {
        remap_refs(object, &replacements);
    }
    for (_, value) in doc.trailer.iter_mut() {
        remap_refs(value, &replacements);
    }
    for duplicate in replacements.keys() {
        doc.objects.remove(duplicate);
    }

    debug!("Merged {} duplicate streams", replacements.len());
    replacements.len()
}

fn remap_refs(object: &mut Object, replacements: &HashMap<ObjectId, ObjectId>) {
    match object {
        Object::Reference(id) => {
            if let Some(survivor) = replacements.get(id) {
                *id = *survivor;
            }
        }
        Object::Array(items) => {
            for item in items.iter_mut() {
                remap_refs(item, replacements);
            }
        }
        Object::Dictionary(dict) => {
            for (_, value) in dict.iter_mut() {
                remap_refs(value, replacements);
            }
        }
        Object::Stream(stream) => {
            for (_, value) in stream.dict.iter_mut() {
                remap_refs(value, replacements);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::create_test_pdf;
    use lopdf::{Dictionary, Stream, StringFormat};

    /// Two pages sharing identical (but separate) content streams, an XMP
    /// metadata stream, an info dictionary and an empty thumbnail stream.
    fn create_redundant_pdf() -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let mut page_ids = Vec::new();
        for _ in 0..2 {
            let content = b"BT /F1 12 Tf 50 700 Td (Same text) Tj ET".to_vec();
            let content_id = doc.add_object(Stream::new(Dictionary::new(), content));
            let mut page = Dictionary::new();
            page.set("Type", Object::Name(b"Page".to_vec()));
            page.set("Parent", Object::Reference(pages_id));
            page.set("Contents", Object::Reference(content_id));
            page.set(
                "MediaBox",
                Object::Array(vec![0.into(), 0.into(), 612.into(), 792.into()]),
            );
            page_ids.push(doc.add_object(page));
        }

        let empty_id = doc.add_object(Stream::new(Dictionary::new(), Vec::new()));

        let mut pages = Dictionary::new();
        pages.set("Type", Object::Name(b"Pages".to_vec()));
        pages.set("Count", Object::Integer(2));
        pages.set(
            "Kids",
            Object::Array(page_ids.iter().map(|id| Object::Reference(*id)).collect()),
        );
        pages.set("Thumb", Object::Reference(empty_id));
        doc.objects.insert(pages_id, Object::Dictionary(pages));

        let mut xmp_dict = Dictionary::new();
        xmp_dict.set("Type", Object::Name(b"Metadata".to_vec()));
        xmp_dict.set("Subtype", Object::Name(b"XML".to_vec()));
        let xmp_id = doc.add_object(Stream::new(xmp_dict, b"<x:xmpmeta/>".to_vec()));

        let mut catalog = Dictionary::new();
        catalog.set("Type", Object::Name(b"Catalog".to_vec()));
        catalog.set("Pages", Object::Reference(pages_id));
        catalog.set("Metadata", Object::Reference(xmp_id));
        let catalog_id = doc.add_object(catalog);

        let mut info = Dictionary::new();
        info.set(
            "Author",
            Object::String(b"Someone".to_vec(), StringFormat::Literal),
        );
        let info_id = doc.add_object(info);

        doc.trailer.set("Root", Object::Reference(catalog_id));
        doc.trailer.set("Info", Object::Reference(info_id));

        let mut buffer = Vec::new();
        doc.save_to(&mut buffer).unwrap();
        buffer
    }

    fn page_contents(doc: &Document) -> Vec<ObjectId> {
        doc.get_pages()
            .values()
            .map(|page_id| {
                doc.get_dictionary(*page_id)
                    .unwrap()
                    .get(b"Contents")
                    .unwrap()
                    .as_reference()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_metadata_is_stripped() {
        let pdf = create_redundant_pdf();
        let (out, stats) = optimize_structure(&pdf, &StructuralOptions::default()).unwrap();

        assert!(stats.metadata_removed);
        let doc = Document::load_mem(&out).unwrap();
        assert!(doc.trailer.get(b"Info").is_err());
        let catalog = doc.catalog().unwrap();
        assert!(catalog.get(b"Metadata").is_err());
    }

    #[test]
    fn test_identical_streams_are_merged() {
        let pdf = create_redundant_pdf();
        let (out, stats) = optimize_structure(&pdf, &StructuralOptions::default()).unwrap();

        assert_eq!(stats.duplicates_merged, 1);
        let doc = Document::load_mem(&out).unwrap();
        let contents = page_contents(&doc);
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0], contents[1]);
    }

    /// One page drawing a zero-length form XObject.
    fn create_empty_form_pdf() -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let mut form_dict = Dictionary::new();
        form_dict.set("Type", Object::Name(b"XObject".to_vec()));
        form_dict.set("Subtype", Object::Name(b"Form".to_vec()));
        form_dict.set(
            "BBox",
            Object::Array(vec![0.into(), 0.into(), 10.into(), 10.into()]),
        );
        let form_id = doc.add_object(Stream::new(form_dict, Vec::new()));

        let content_id = doc.add_object(Stream::new(
            Dictionary::new(),
            b"q /Fm1 Do Q".to_vec(),
        ));

        let mut xobjects = Dictionary::new();
        xobjects.set("Fm1", Object::Reference(form_id));
        let mut resources = Dictionary::new();
        resources.set("XObject", Object::Dictionary(xobjects));

        let mut page = Dictionary::new();
        page.set("Type", Object::Name(b"Page".to_vec()));
        page.set("Parent", Object::Reference(pages_id));
        page.set("Contents", Object::Reference(content_id));
        page.set("Resources", Object::Dictionary(resources));
        page.set(
            "MediaBox",
            Object::Array(vec![0.into(), 0.into(), 612.into(), 792.into()]),
        );
        let page_id = doc.add_object(page);

        let mut pages = Dictionary::new();
        pages.set("Type", Object::Name(b"Pages".to_vec()));
        pages.set("Count", Object::Integer(1));
        pages.set("Kids", Object::Array(vec![Object::Reference(page_id)]));
        doc.objects.insert(pages_id, Object::Dictionary(pages));

        let mut catalog = Dictionary::new();
        catalog.set("Type", Object::Name(b"Catalog".to_vec()));
        catalog.set("Pages", Object::Reference(pages_id));
        let catalog_id = doc.add_object(catalog);
        doc.trailer.set("Root", Object::Reference(catalog_id));

        let mut buffer = Vec::new();
        doc.save_to(&mut buffer).unwrap();
        buffer
    }

    #[test]
    fn test_drawn_empty_form_is_kept() {
        let pdf = create_empty_form_pdf();
        let (out, _) = optimize_structure(&pdf, &StructuralOptions::default()).unwrap();

        let doc = Document::load_mem(&out).unwrap();
        let page_id = *doc.get_pages().get(&1).unwrap();
        let resources = doc
            .get_dictionary(page_id)
            .unwrap()
            .get(b"Resources")
            .unwrap()
            .as_dict()
            .unwrap();
        let xobjects = resources.get(b"XObject").unwrap().as_dict().unwrap();
        let form_id = xobjects.get(b"Fm1").unwrap().as_reference().unwrap();

        let form = doc.get_object(form_id).unwrap().as_stream().unwrap();
        assert_eq!(form.dict.get(b"Subtype").unwrap().as_name().unwrap(), b"Form");
        assert_eq!(doc.get_page_content(page_id).unwrap(), b"q /Fm1 Do Q".to_vec());
    }

    #[test]
    fn test_distinct_streams_are_kept() {
        let pdf = create_test_pdf(3);
        let (out, stats) = optimize_structure(&pdf, &StructuralOptions::default()).unwrap();

        assert_eq!(stats.duplicates_merged, 0);
        let doc = Document::load_mem(&out).unwrap();
        assert_eq!(doc.get_pages().len(), 3);
    }

    #[test]
    fn test_object_streams_output_loads() {
        let pdf = create_test_pdf(4);
        let options = StructuralOptions {
            object_streams: true,
        };
        let (out, _) = optimize_structure(&pdf, &options).unwrap();

        assert!(out.starts_with(b"%PDF-"));
        assert!(out.windows(6).any(|w| w == b"ObjStm"));
        let doc = Document::load_mem(&out).unwrap();
        assert_eq!(doc.get_pages().len(), 4);
    }

    #[test]
    fn test_non_pdf_is_corrupt_input() {
        let result = optimize_structure(b"definitely not a pdf", &StructuralOptions::default());
        assert!(matches!(result, Err(CompressError::CorruptInput(_))));
    }

    #[test]
    fn test_remap_refs_nested() {
        let mut map = HashMap::new();
        map.insert((5, 0), (2, 0));
        let mut object = Object::Array(vec![
            Object::Reference((5, 0)),
            Object::Reference((6, 0)),
            Object::Dictionary(Dictionary::from_iter(vec![(
                "Ref",
                Object::Reference((5, 0)),
            )])),
        ]);
        remap_refs(&mut object, &map);

        let Object::Array(items) = object else {
            panic!("expected array");
        };
        assert_eq!(items[0].as_reference().unwrap(), (2, 0));
        assert_eq!(items[1].as_reference().unwrap(), (6, 0));
        let nested = items[2].as_dict().unwrap().get(b"Ref").unwrap();
        assert_eq!(nested.as_reference().unwrap(), (2, 0));
    }
}
