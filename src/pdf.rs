use crate::template::{Alignment, Emphasis, Font, FontFamily};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use std::collections::BTreeMap;
use thiserror::Error;

const MM_TO_PT: f64 = 72.0 / 25.4;
const A4_WIDTH_MM: f64 = 210.0;
const A4_HEIGHT_MM: f64 = 297.0;
/// Text cells stop this far from the right page edge.
pub const RIGHT_MARGIN_MM: f64 = 10.0;
pub const LINE_HEIGHT_FACTOR: f64 = 1.25;

#[derive(Debug, Error)]
pub enum PdfError {
    #[error("cannot decode background image: {0}")]
    Image(#[from] image::ImageError),
    #[error("cannot write document: {0}")]
    Write(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Portrait,
    Landscape,
}

impl Orientation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "portrait" => Some(Self::Portrait),
            "landscape" => Some(Self::Landscape),
            _ => None,
        }
    }

    /// Page size in millimetres, width first.
    pub fn page_mm(self) -> (f64, f64) {
        match self {
            Self::Portrait => (A4_WIDTH_MM, A4_HEIGHT_MM),
            Self::Landscape => (A4_HEIGHT_MM, A4_WIDTH_MM),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PageSetup {
    pub orientation: Orientation,
    pub compress: bool,
}

impl Default for PageSetup {
    fn default() -> Self {
        Self {
            orientation: Orientation::Portrait,
            compress: true,
        }
    }
}

/// A text cell anchored at its top-left corner, in millimetres.
#[derive(Debug, Clone)]
pub struct TextBlock {
    pub x: f64,
    pub y: f64,
    pub font: Font,
    pub align: Alignment,
    pub text: String,
}

/// Background decoded to raw RGB samples.
pub struct Background {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

pub fn decode_background(bytes: &[u8]) -> Result<Background, PdfError> {
    let img = image::load_from_memory(bytes)?.to_rgb8();
    Ok(Background {
        width: img.width(),
        height: img.height(),
        rgb: img.into_raw(),
    })
}

fn base_font(family: FontFamily, emphasis: Emphasis) -> &'static str {
    match (family, emphasis) {
        (FontFamily::Courier, Emphasis::Regular) => "Courier",
        (FontFamily::Courier, Emphasis::Bold) => "Courier-Bold",
        (FontFamily::Courier, Emphasis::Italic) => "Courier-Oblique",
        (FontFamily::Helvetica, Emphasis::Regular) => "Helvetica",
        (FontFamily::Helvetica, Emphasis::Bold) => "Helvetica-Bold",
        (FontFamily::Helvetica, Emphasis::Italic) => "Helvetica-Oblique",
        (FontFamily::Times, Emphasis::Regular) => "Times-Roman",
        (FontFamily::Times, Emphasis::Bold) => "Times-Bold",
        (FontFamily::Times, Emphasis::Italic) => "Times-Italic",
    }
}

fn resource_name(font: &Font) -> String {
    format!(
        "F{}{}",
        font.family.legacy_index(),
        font.emphasis.legacy_index()
    )
}

// Advance widths (1/1000 em) for bytes 32..=126, regular faces.
#[rustfmt::skip]
const HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278,
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 278, 278, 584, 584, 584, 556,
    1015, 667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, 722, 778,
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 278, 278, 278, 469, 556,
    333, 556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, 556, 556,
    556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, 334, 260, 334, 584,
];

#[rustfmt::skip]
const TIMES_WIDTHS: [u16; 95] = [
    250, 333, 408, 500, 500, 833, 778, 180, 333, 333, 500, 564, 250, 333, 250, 278,
    500, 500, 500, 500, 500, 500, 500, 500, 500, 500, 278, 278, 564, 564, 564, 444,
    921, 722, 667, 667, 722, 611, 556, 722, 722, 333, 389, 722, 611, 889, 722, 722,
    556, 722, 667, 556, 611, 722, 722, 944, 722, 722, 611, 333, 278, 333, 469, 500,
    333, 444, 500, 444, 500, 444, 333, 500, 500, 278, 278, 500, 278, 778, 500, 500,
    500, 500, 333, 389, 278, 500, 500, 722, 500, 500, 444, 480, 200, 480, 541,
];

fn glyph_width(family: FontFamily, byte: u8) -> u16 {
    let idx = byte.wrapping_sub(32) as usize;
    match family {
        FontFamily::Courier => 600,
        FontFamily::Helvetica => HELVETICA_WIDTHS.get(idx).copied().unwrap_or(556),
        FontFamily::Times => TIMES_WIDTHS.get(idx).copied().unwrap_or(500),
    }
}

/// Width in points of WinAnsi-encoded text.
pub fn text_width_pt(font: &Font, encoded: &[u8]) -> f64 {
    let units: u32 = encoded
        .iter()
        .map(|b| u32::from(glyph_width(font.family, *b)))
        .sum();
    f64::from(units) * f64::from(font.size.points()) / 1000.0
}

/// Maps text onto WinAnsiEncoding. Characters with no slot become `?`.
pub fn encode_win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match c {
            '\u{20AC}' => 0x80,
            '\u{201A}' => 0x82,
            '\u{2026}' => 0x85,
            '\u{2018}' => 0x91,
            '\u{2019}' => 0x92,
            '\u{201C}' => 0x93,
            '\u{201D}' => 0x94,
            '\u{2022}' => 0x95,
            '\u{2013}' => 0x96,
            '\u{2014}' => 0x97,
            '\u{0152}' => 0x8C,
            '\u{0153}' => 0x9C,
            c if (c as u32) < 0x80 => c as u8,
            c if (0xA0..=0xFF).contains(&(c as u32)) => c as u8,
            _ => b'?',
        })
        .collect()
}

/// One laid out line: bytes to show, x offset inside the cell and the word
/// spacing used to justify it.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub bytes: Vec<u8>,
    pub offset_pt: f64,
    pub word_spacing_pt: f64,
}

/// Breaks text into lines that fit `cell_pt`, then aligns each one.
/// Explicit newlines always break. A word longer than the cell stays whole.
/// Leading spaces of a paragraph indent all of its lines.
pub fn layout_lines(font: &Font, align: Alignment, text: &str, cell_pt: f64) -> Vec<Line> {
    let mut out = Vec::new();
    for paragraph in text.split('\n') {
        let body = paragraph.trim_start_matches(' ');
        let indent_pt = (text_width_pt(font, b" ") * (paragraph.len() - body.len()) as f64)
            .min(cell_pt);
        let avail_pt = cell_pt - indent_pt;
        let wrapped = wrap_paragraph(font, body, avail_pt);
        let last = wrapped.len().saturating_sub(1);
        for (i, bytes) in wrapped.into_iter().enumerate() {
            let width = text_width_pt(font, &bytes);
            let free = (avail_pt - width).max(0.0);
            let (offset_pt, word_spacing_pt) = match align {
                Alignment::Left => (0.0, 0.0),
                Alignment::Right => (free, 0.0),
                Alignment::Center => (free / 2.0, 0.0),
                Alignment::Justify => {
                    let gaps = bytes.iter().filter(|b| **b == b' ').count();
                    if i < last && gaps > 0 {
                        (0.0, free / gaps as f64)
                    } else {
                        (0.0, 0.0)
                    }
                }
            };
            out.push(Line {
                bytes,
                offset_pt: indent_pt + offset_pt,
                word_spacing_pt,
            });
        }
    }
    out
}

fn wrap_paragraph(font: &Font, paragraph: &str, cell_pt: f64) -> Vec<Vec<u8>> {
    let space = text_width_pt(font, b" ");
    let mut lines: Vec<Vec<u8>> = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    let mut current_w = 0.0;
    for word in paragraph.split(' ').filter(|w| !w.is_empty()) {
        let bytes = encode_win_ansi(word);
        let w = text_width_pt(font, &bytes);
        if current.is_empty() {
            current = bytes;
            current_w = w;
        } else if current_w + space + w <= cell_pt {
            current.push(b' ');
            current.extend_from_slice(&bytes);
            current_w += space + w;
        } else {
            lines.push(std::mem::take(&mut current));
            current = bytes;
            current_w = w;
        }
    }
    lines.push(current);
    lines
}

fn real(v: f64) -> Object {
    Object::Real(v as f32)
}

/// Writes a single-page document. The background, when present, covers the
/// whole page and is painted before any text.
pub fn render_page(
    setup: &PageSetup,
    background: Option<&Background>,
    blocks: &[TextBlock],
) -> Result<Vec<u8>, PdfError> {
    let (page_w_mm, page_h_mm) = setup.orientation.page_mm();
    let page_w = page_w_mm * MM_TO_PT;
    let page_h = page_h_mm * MM_TO_PT;

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let mut fonts: BTreeMap<String, ObjectId> = BTreeMap::new();
    for block in blocks {
        let name = resource_name(&block.font);
        if fonts.contains_key(&name) {
            continue;
        }
        let id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => base_font(block.font.family, block.font.emphasis),
            "Encoding" => "WinAnsiEncoding",
        });
        fonts.insert(name, id);
    }

    let mut operations = Vec::new();
    let mut xobjects = lopdf::Dictionary::new();
    if let Some(bg) = background {
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => i64::from(bg.width),
                "Height" => i64::from(bg.height),
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            bg.rgb.clone(),
        ));
        xobjects.set("Im1", image_id);
        operations.push(Operation::new("q", vec![]));
        operations.push(Operation::new(
            "cm",
            vec![real(page_w), real(0.0), real(0.0), real(page_h), real(0.0), real(0.0)],
        ));
        operations.push(Operation::new("Do", vec![Object::Name(b"Im1".to_vec())]));
        operations.push(Operation::new("Q", vec![]));
    }

    for block in blocks {
        let size = f64::from(block.font.size.points());
        let line_h = size * LINE_HEIGHT_FACTOR;
        let cell_pt = ((page_w_mm - RIGHT_MARGIN_MM - block.x) * MM_TO_PT).max(0.0);
        let left = block.x * MM_TO_PT;
        let mut top = block.y * MM_TO_PT;
        let font_name = resource_name(&block.font);

        for line in layout_lines(&block.font, block.align, &block.text, cell_pt) {
            let baseline = top + line_h / 2.0 + 0.3 * size;
            if !line.bytes.is_empty() {
                operations.push(Operation::new("BT", vec![]));
                operations.push(Operation::new(
                    "Tf",
                    vec![Object::Name(font_name.clone().into_bytes()), real(size)],
                ));
                operations.push(Operation::new("Tw", vec![real(line.word_spacing_pt)]));
                operations.push(Operation::new(
                    "Td",
                    vec![real(left + line.offset_pt), real(page_h - baseline)],
                ));
                operations.push(Operation::new(
                    "Tj",
                    vec![Object::string_literal(line.bytes)],
                ));
                operations.push(Operation::new("ET", vec![]));
            }
            top += line_h;
        }
    }

    let content = Content { operations };
    let encoded = content
        .encode()
        .map_err(|e| PdfError::Write(e.to_string()))?;
    let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));

    let mut font_dict = lopdf::Dictionary::new();
    for (name, id) in fonts {
        font_dict.set(name, id);
    }
    let resources_id = doc.add_object(dictionary! {
        "Font" => font_dict,
        "XObject" => xobjects,
    });

    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => resources_id,
        "MediaBox" => vec![real(0.0), real(0.0), real(page_w), real(page_h)],
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    if setup.compress {
        doc.compress();
    }
    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| PdfError::Write(e.to_string()))?;
    Ok(out)
}
