//! The crate's public surface: format sniffing, the `Document` handle and
//! decoded standalone images.

use std::cell::RefCell;

use crate::backend::Backend;
use crate::error::*;
use crate::file::Storage;
use crate::jpeg::JpegImage;
use crate::jpx::JpxImage;
use crate::primitive::{Dictionary, Primitive};
use crate::render::glyph::GlyphCache;
use crate::render::page::{self, PageInfo, RenderFlags};
use crate::render::{Bitmap, Color};

/// What the leading bytes say the input is.
pub enum FileKind {
    Pdf(Document),
    Image(DecodedImage),
}

/// Opens a byte buffer, auto-detecting PDF, JPEG, raw J2K codestreams and
/// JP2 files.
pub fn open(data: Vec<u8>, password: &[u8]) -> Result<FileKind> {
    if data.len() < 8 {
        return Err(PdfError::NotFormat);
    }
    if data.starts_with(b"\xff\xd8") {
        return Ok(FileKind::Image(DecodedImage::Jpeg(JpegImage::decode(&data)?)));
    }
    if data.starts_with(&[0xff, 0x4f, 0xff, 0x51]) || (data.len() > 8 && &data[4..8] == b"jP  ") {
        return Ok(FileKind::Image(DecodedImage::Jpx(JpxImage::decode(&data)?)));
    }
    // the %PDF header may sit past leading junk
    if data
        .windows(5)
        .take(1024)
        .any(|w| w == b"%PDF-")
    {
        return Ok(FileKind::Pdf(Document::load(data, password)?));
    }
    Err(PdfError::NotFormat)
}

/// A decoded standalone image of either codec.
pub enum DecodedImage {
    Jpeg(JpegImage),
    Jpx(JpxImage),
}

impl DecodedImage {
    pub fn width(&self) -> u32 {
        match self {
            DecodedImage::Jpeg(i) => i.width,
            DecodedImage::Jpx(i) => i.width(),
        }
    }
    pub fn height(&self) -> u32 {
        match self {
            DecodedImage::Jpeg(i) => i.height,
            DecodedImage::Jpx(i) => i.height(),
        }
    }
    pub fn components(&self) -> usize {
        match self {
            DecodedImage::Jpeg(i) => i.components(),
            DecodedImage::Jpx(i) => i.components.len(),
        }
    }
    pub fn colorspace(&self) -> &'static str {
        match self {
            DecodedImage::Jpeg(i) => match i.color {
                crate::jpeg::JpegColor::Gray => "Gray",
                crate::jpeg::JpegColor::Rgb => "RGB",
                crate::jpeg::JpegColor::YCbCr => "YCbCr",
                crate::jpeg::JpegColor::Cmyk => "CMYK",
                crate::jpeg::JpegColor::Ycck => "YCCK",
            },
            DecodedImage::Jpx(i) => match i.color {
                crate::jpx::JpxColor::Gray => "Gray",
                crate::jpx::JpxColor::Srgb => "sRGB",
                crate::jpx::JpxColor::Sycc => "sYCC",
                crate::jpx::JpxColor::Unknown => "Unknown",
            },
        }
    }
    /// Packed RGB bytes, w*h*3.
    pub fn to_rgb(&self) -> Vec<u8> {
        match self {
            DecodedImage::Jpeg(i) => i.to_rgb(),
            DecodedImage::Jpx(i) => i.to_rgb(),
        }
    }
    /// Packed RGBA bytes, w*h*4.
    pub fn to_rgba(&self) -> Vec<u8> {
        match self {
            DecodedImage::Jpeg(i) => i.to_rgba(),
            DecodedImage::Jpx(i) => i.to_rgba(),
        }
    }
}

/// Per-page geometry surfaced without rendering.
pub struct PageLayout {
    pub width_points: f64,
    pub height_points: f64,
    pub rotation: i64,
    pub media_box: [f64; 4],
    pub crop_box: [f64; 4],
}

/// An opened PDF. Immutable once loaded; rendering only mutates the glyph
/// cache behind a `RefCell`.
pub struct Document {
    storage: Storage<Vec<u8>>,
    glyphs: RefCell<GlyphCache>,
    version: String,
}

impl Document {
    pub fn load(data: Vec<u8>, password: &[u8]) -> Result<Document> {
        let version = parse_version(&data).unwrap_or_else(|| "1.4".into());
        let storage = t!(Storage::load(data, password));
        let mut doc = Document {
            storage,
            glyphs: RefCell::new(GlyphCache::new()),
            version,
        };
        // the catalog may carry a newer /Version than the header
        if let Some(v) = doc.catalog_version() {
            doc.version = v;
        }
        Ok(doc)
    }

    fn catalog_version(&self) -> Option<String> {
        let root = self.storage.get_entry(self.storage.trailer(), "Root")?;
        let catalog = root.as_dictionary().ok()?.clone();
        let v = self.storage.get_entry(&catalog, "Version")?;
        Some(v.as_name().ok()?.as_str().into_owned())
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_encrypted(&self) -> bool {
        self.storage.is_encrypted()
    }

    /// Recovery notes accumulated so far.
    pub fn warnings(&self) -> Vec<String> {
        self.storage.warnings.entries()
    }

    pub fn page_count(&self) -> u32 {
        page::page_count(&self.storage)
    }

    pub fn page_layout(&self, index: u32) -> Option<PageLayout> {
        let info = self.find_page(index)?;
        Some(PageLayout {
            width_points: info.width_points(),
            height_points: info.height_points(),
            rotation: info.rotate,
            media_box: info.media_box,
            crop_box: info.crop_box,
        })
    }

    fn find_page(&self, index: u32) -> Option<PageInfo> {
        if index >= self.page_count() {
            return None;
        }
        match page::find_page(&self.storage, index) {
            Ok(info) => Some(info),
            Err(e) => {
                self.storage.warnings.push(format!("page {} unusable: {}", index, e));
                None
            }
        }
    }

    /// The /Info dictionary's standard entries, decoded to strings.
    pub fn metadata(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let Some(info) = self.storage.get_entry(self.storage.trailer(), "Info") else {
            return out;
        };
        let Ok(info) = info.into_dictionary() else { return out };
        for key in [
            "Title", "Author", "Subject", "Keywords", "Creator", "Producer", "CreationDate", "ModDate",
        ] {
            if let Some(p) = self.storage.get_entry(&info, key) {
                if let Ok(s) = p.as_string() {
                    out.push((key.into(), s.to_string_lossy()));
                }
            }
        }
        out
    }

    /// Renders page `index` into a `width x height` bitmap over `background`.
    /// `None` when the index is out of range; malformed content renders
    /// best-effort rather than failing.
    pub fn render_page(
        &self,
        index: u32,
        width: u32,
        height: u32,
        background: Color,
        flags: RenderFlags,
    ) -> Option<Bitmap> {
        let info = self.find_page(index)?;
        let mut glyphs = self.glyphs.borrow_mut();
        match page::render_page(&self.storage, &mut glyphs, &info, width, height, background, flags) {
            Ok(bitmap) => Some(bitmap),
            Err(e) => {
                self.storage.warnings.push(format!("page {} render failed: {}", index, e));
                None
            }
        }
    }

    /// Access to the underlying object model.
    pub fn trailer(&self) -> &Dictionary {
        self.storage.trailer()
    }
    pub fn resolve(&self, p: &Primitive) -> Result<Primitive> {
        self.storage.deref(p)
    }
    pub fn storage(&self) -> &Storage<Vec<u8>> {
        &self.storage
    }
}

fn parse_version(data: &[u8]) -> Option<String> {
    let pos = data.windows(5).take(1024).position(|w| w == b"%PDF-")?;
    let rest = &data[pos + 5..];
    let end = rest
        .iter()
        .position(|&b| !(b.is_ascii_digit() || b == b'.'))
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    std::str::from_utf8(&rest[..end]).ok().map(|s| s.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_from_header() {
        assert_eq!(parse_version(b"%PDF-1.7\nrest").unwrap(), "1.7");
        assert_eq!(parse_version(b"junk\n%PDF-2.0\n").unwrap(), "2.0");
        assert!(parse_version(b"no header").is_none());
    }

    #[test]
    fn sniffs_jpeg() {
        let jpeg = crate::jpeg::testenc::encode_gray8(8, 8, &[77; 64]);
        match open(jpeg, b"").unwrap() {
            FileKind::Image(img) => {
                assert_eq!(img.width(), 8);
                assert_eq!(img.components(), 1);
                assert_eq!(img.to_rgb().len(), 8 * 8 * 3);
                assert_eq!(img.to_rgba().len(), 8 * 8 * 4);
            }
            _ => panic!("expected image"),
        }
    }

    #[test]
    fn rejects_unknown_magic() {
        assert!(matches!(open(b"GIF89a....".to_vec(), b""), Err(PdfError::NotFormat)));
    }
}
