//! PDF bundle assembly with `lopdf`.
//!
//! [`PdfBundle`] is a single writer: parts are appended in order (cover
//! first, then each normalized artifact) and [`PdfBundle::finish`] stitches
//! their page trees into one document. Images become one page each, sized
//! one point per pixel, with the JPEG data embedded as a `DCTDecode` XObject
//! so it is never re-compressed.
//!
//! ## Inherited page attributes
//!
//! `MediaBox`, `Resources`, `CropBox` and `Rotate` may live on an ancestor
//! `Pages` node rather than the page itself. Pages are re-parented under a
//! single new node, so those attributes are copied onto each page first.

use crate::pipeline::encode::encode_jpeg;
use image::{ColorType, ImageReader};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use std::collections::BTreeMap;
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

const INHERITABLE: [&[u8]; 4] = [b"MediaBox", b"Resources", b"CropBox", b"Rotate"];

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("invalid PDF: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("PDF has no pages")]
    NoPages,
    #[error("invalid image: {0}")]
    Image(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bundle is empty")]
    Empty,
}

/// One page lifted out of its source document.
struct PageEntry {
    id: ObjectId,
    dict: Dictionary,
}

/// Ordered, single-writer PDF merge.
#[derive(Default)]
pub struct PdfBundle {
    pages: Vec<PageEntry>,
    objects: BTreeMap<ObjectId, Object>,
    next_id: u32,
}

impl PdfBundle {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    /// Pages appended so far.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Append every page of a PDF.
    pub fn push_pdf(&mut self, bytes: &[u8]) -> Result<usize, MergeError> {
        let doc = Document::load_mem(bytes)?;
        self.push_document(doc)
    }

    /// Append an image as a single page.
    pub fn push_image(&mut self, bytes: &[u8]) -> Result<usize, MergeError> {
        let doc = image_page(bytes)?;
        self.push_document(doc)
    }

    fn push_document(&mut self, mut doc: Document) -> Result<usize, MergeError> {
        let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
        if page_ids.is_empty() {
            return Err(MergeError::NoPages);
        }

        // Resolve every page first so a failure leaves the bundle untouched.
        doc.renumber_objects_with(self.next_id);
        let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
        let mut entries = Vec::with_capacity(page_ids.len());
        for id in page_ids {
            let mut dict = doc.get_dictionary(id)?.clone();
            for key in INHERITABLE {
                if !dict.has(key) {
                    if let Some(value) = inherited(&doc, &dict, key) {
                        dict.set(key, value);
                    }
                }
            }
            entries.push(PageEntry { id, dict });
        }

        self.next_id = doc.max_id + 1;
        let added = entries.len();
        for (id, object) in doc.objects {
            if !is_structural(&object) {
                self.objects.insert(id, object);
            }
        }
        self.pages.extend(entries);
        debug!("Bundle: +{} page(s), {} total", added, self.pages.len());
        Ok(added)
    }

    /// Build the merged document.
    pub fn finish(self) -> Result<Vec<u8>, MergeError> {
        if self.pages.is_empty() {
            return Err(MergeError::Empty);
        }
        let mut doc = Document::with_version("1.5");
        doc.objects = self.objects;
        doc.max_id = self.next_id;

        let pages_id = doc.new_object_id();
        let kids: Vec<Object> = self.pages.iter().map(|p| Object::Reference(p.id)).collect();
        let count = kids.len() as i64;
        for PageEntry { id, mut dict } in self.pages {
            dict.set("Parent", pages_id);
            doc.objects.insert(id, Object::Dictionary(dict));
        }
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        doc.renumber_objects();
        doc.compress();
        let mut out = Vec::new();
        doc.save_to(&mut out)?;
        Ok(out)
    }
}

/// Catalogs, page-tree nodes, pages and outlines are rebuilt, not copied.
fn is_structural(object: &Object) -> bool {
    let Ok(dict) = object.as_dict() else {
        return false;
    };
    matches!(
        dict.get(b"Type").and_then(Object::as_name),
        Ok(b"Catalog" | b"Pages" | b"Page" | b"Outlines" | b"Outline")
    )
}

/// Walk up the `Parent` chain looking for `key`.
fn inherited(doc: &Document, page: &Dictionary, key: &[u8]) -> Option<Object> {
    let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
    // Bounded walk; malformed trees can be cyclic.
    for _ in 0..64 {
        let node = doc.get_dictionary(parent?).ok()?;
        if let Ok(value) = node.get(key) {
            return Some(value.clone());
        }
        parent = node.get(b"Parent").and_then(Object::as_reference).ok();
    }
    None
}

/// A one-page document showing `bytes` at one point per pixel.
fn image_page(bytes: &[u8]) -> Result<Document, MergeError> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    let is_jpeg = reader.format() == Some(image::ImageFormat::Jpeg);
    let img = reader.decode()?;
    let (w, h) = (img.width(), img.height());

    // RGB JPEGs embed as-is; anything else is re-encoded.
    let jpeg = if is_jpeg && img.color() == ColorType::Rgb8 {
        bytes.to_vec()
    } else {
        encode_jpeg(&img, 90)?
    };

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let image_id = doc.add_object(
        Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => w as i64,
                "Height" => h as i64,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            jpeg,
        )
        .with_compression(false),
    );

    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    (w as i64).into(),
                    0.into(),
                    0.into(),
                    (h as i64).into(),
                    0.into(),
                    0.into(),
                ],
            ),
            Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
            Operation::new("Q", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));
    let media_box: Vec<Object> = vec![0.into(), 0.into(), (w as i64).into(), (h as i64).into()];
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "MediaBox" => media_box,
        "Resources" => dictionary! {
            "XObject" => dictionary! { "Im0" => image_id },
        },
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![Object::Reference(page_id)],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb, RgbImage};

    fn jpeg(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([0, 128, 255])));
        encode_jpeg(&img, 80).unwrap()
    }

    fn pdf_with_pages(n: usize) -> Vec<u8> {
        let mut bundle = PdfBundle::new();
        for _ in 0..n {
            bundle.push_image(&jpeg(20, 10)).unwrap();
        }
        bundle.finish().unwrap()
    }

    #[test]
    fn image_becomes_one_page_sized_in_points() {
        let out = pdf_with_pages(1);
        let doc = Document::load_mem(&out).unwrap();
        let pages = doc.get_pages();
        assert_eq!(pages.len(), 1);
        let page = doc.get_dictionary(pages[&1]).unwrap();
        let media = page.get(b"MediaBox").unwrap().as_array().unwrap();
        assert_eq!(media[2].as_i64().unwrap(), 20);
        assert_eq!(media[3].as_i64().unwrap(), 10);
    }

    #[test]
    fn pages_keep_append_order() {
        let cover = pdf_with_pages(2);
        let mut bundle = PdfBundle::new();
        assert_eq!(bundle.push_pdf(&cover).unwrap(), 2);
        bundle.push_image(&jpeg(30, 40)).unwrap();
        assert_eq!(bundle.page_count(), 3);
        let out = bundle.finish().unwrap();

        let doc = Document::load_mem(&out).unwrap();
        let pages = doc.get_pages();
        assert_eq!(pages.len(), 3);
        let last = doc.get_dictionary(pages[&3]).unwrap();
        let media = last.get(b"MediaBox").unwrap().as_array().unwrap();
        assert_eq!(media[2].as_i64().unwrap(), 30);
    }

    #[test]
    fn bad_input_leaves_bundle_usable() {
        let mut bundle = PdfBundle::new();
        assert!(bundle.push_pdf(b"%PDF-1.4 garbage").is_err());
        assert!(bundle.push_image(b"not an image").is_err());
        assert!(matches!(PdfBundle::new().finish(), Err(MergeError::Empty)));
        bundle.push_image(&jpeg(5, 5)).unwrap();
        assert!(bundle.finish().is_ok());
    }

    #[test]
    fn png_is_reencoded() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(6, 4, Rgb([9, 9, 9])));
        let png = crate::pipeline::encode::encode_png(&img).unwrap();
        let mut bundle = PdfBundle::new();
        assert_eq!(bundle.push_image(&png).unwrap(), 1);
        assert!(bundle.finish().is_ok());
    }
}
