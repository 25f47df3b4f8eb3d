//! Simple-font handling: width tables for advances and embedded TrueType
//! outlines for rendering.

use crate::backend::Backend;
use crate::error::*;
use crate::file::Storage;
use crate::primitive::{Dictionary, Primitive};
use crate::render::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontKind {
    Type1,
    TrueType,
    Type3,
    Type0,
    Unknown,
}

pub struct Font {
    pub name: Vec<u8>,
    pub kind: FontKind,
    first_char: i64,
    /// advances in em units (PDF widths are expressed per mille)
    widths: Vec<f64>,
    default_width: f64,
    face_data: Option<Vec<u8>>,
}

impl Font {
    /// Reads what rendering needs out of a /Font dictionary. Lenient: any
    /// missing piece degrades to metrics-only or default metrics.
    pub fn load<B: Backend>(dict: &Dictionary, storage: &Storage<B>) -> Font {
        let name = dict
            .get("BaseFont")
            .and_then(|p| p.as_name().ok())
            .map(|n| n.0.clone())
            .unwrap_or_default();

        let kind = match dict.get("Subtype").and_then(|p| p.as_name().ok()) {
            Some(n) if *n == "Type1" || *n == "MMType1" => FontKind::Type1,
            Some(n) if *n == "TrueType" => FontKind::TrueType,
            Some(n) if *n == "Type3" => FontKind::Type3,
            Some(n) if *n == "Type0" => FontKind::Type0,
            _ => FontKind::Unknown,
        };
        match kind {
            FontKind::Type3 => {
                storage.warnings.push("Type3 fonts are not supported; glyphs skipped".into())
            }
            FontKind::Type0 => {
                storage.warnings.push("composite (Type0) fonts are not supported; glyphs skipped".into())
            }
            _ => {}
        }

        let first_char = storage
            .get_entry(dict, "FirstChar")
            .and_then(|p| p.as_int().ok())
            .unwrap_or(0);

        let mut widths = Vec::new();
        if let Some(arr) = storage.get_entry(dict, "Widths") {
            if let Ok(arr) = arr.as_array() {
                for p in arr {
                    let w = storage
                        .deref(p)
                        .ok()
                        .and_then(|p| p.as_number().ok())
                        .unwrap_or(0.0);
                    widths.push(w / 1000.0);
                }
            }
        }

        let descriptor = storage.get_entry(dict, "FontDescriptor").and_then(|p| match p {
            Primitive::Dictionary(d) => Some(d),
            _ => None,
        });

        let mut default_width = 0.5;
        let mut face_data = None;
        if let Some(desc) = &descriptor {
            if let Some(mw) = storage.get_entry(desc, "MissingWidth").and_then(|p| p.as_number().ok()) {
                default_width = mw / 1000.0;
            }
            if let Some(ff) = desc.get("FontFile2") {
                match storage.stream_data(ff) {
                    Ok(data) => face_data = Some(data),
                    Err(e) => storage.warnings.push(format!("unusable FontFile2: {}", e)),
                }
            } else if desc.contains_key("FontFile") || desc.contains_key("FontFile3") {
                storage
                    .warnings
                    .push("only TrueType font programs are rendered; using metrics only".into());
            }
        }

        if widths.is_empty() && face_data.is_none() {
            debug!("font {:?} has no widths; using default advance", String::from_utf8_lossy(&name));
        }

        Font {
            name,
            kind,
            first_char,
            widths,
            default_width,
            face_data,
        }
    }

    /// Horizontal advance for a character code, in em units.
    pub fn advance(&self, code: u8) -> f64 {
        let idx = code as i64 - self.first_char;
        if idx >= 0 {
            if let Some(&w) = self.widths.get(idx as usize) {
                return w;
            }
        }
        // fall back to the font program's own metrics
        if let Some(face) = self.face() {
            if let Some(gid) = self.glyph_id_internal(&face, code) {
                if let Some(adv) = face.glyph_hor_advance(gid) {
                    return adv as f64 / face.units_per_em() as f64;
                }
            }
        }
        self.default_width
    }

    pub fn is_renderable(&self) -> bool {
        self.face_data.is_some() && !matches!(self.kind, FontKind::Type3 | FontKind::Type0)
    }

    fn face(&self) -> Option<ttf_parser::Face> {
        let data = self.face_data.as_deref()?;
        ttf_parser::Face::parse(data, 0).ok()
    }

    fn glyph_id_internal(&self, face: &ttf_parser::Face, code: u8) -> Option<ttf_parser::GlyphId> {
        // simple fonts map codes through the cmap as if they were Latin-1;
        // fall back to treating the code as a raw glyph index
        face.glyph_index(code as char)
            .or(Some(ttf_parser::GlyphId(code as u16)))
    }

    /// Stable id for glyph-cache keys.
    pub fn glyph_id(&self, code: u8) -> u32 {
        match self.face() {
            Some(face) => self
                .glyph_id_internal(&face, code)
                .map(|g| g.0 as u32)
                .unwrap_or(code as u32),
            None => code as u32,
        }
    }

    /// Outline in em units, y up. None when the font carries no program or
    /// the glyph has no outline.
    pub fn glyph_outline(&self, code: u8) -> Option<Path> {
        let face = self.face()?;
        let gid = self.glyph_id_internal(&face, code)?;
        let scale = 1.0 / face.units_per_em() as f64;

        let mut builder = PathBuilder { path: Path::new(), scale, open: false };
        face.outline_glyph(gid, &mut builder)?;
        if builder.open {
            builder.path.close();
        }
        if builder.path.is_empty() {
            None
        } else {
            Some(builder.path)
        }
    }
}

struct PathBuilder {
    path: Path,
    scale: f64,
    open: bool,
}

impl ttf_parser::OutlineBuilder for PathBuilder {
    fn move_to(&mut self, x: f32, y: f32) {
        if self.open {
            self.path.close();
        }
        self.path.move_to(x as f64 * self.scale, y as f64 * self.scale);
        self.open = true;
    }
    fn line_to(&mut self, x: f32, y: f32) {
        self.path.line_to(x as f64 * self.scale, y as f64 * self.scale);
    }
    fn quad_to(&mut self, x1: f32, y1: f32, x: f32, y: f32) {
        // elevate the quadratic to a cubic
        let (x1, y1) = (x1 as f64 * self.scale, y1 as f64 * self.scale);
        let (x, y) = (x as f64 * self.scale, y as f64 * self.scale);
        let (px, py) = self.path.current_point().unwrap_or((x1, y1));
        let c1 = (px + 2.0 / 3.0 * (x1 - px), py + 2.0 / 3.0 * (y1 - py));
        let c2 = (x + 2.0 / 3.0 * (x1 - x), y + 2.0 / 3.0 * (y1 - y));
        self.path.curve_to(c1.0, c1.1, c2.0, c2.1, x, y);
    }
    fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        let s = self.scale;
        self.path.curve_to(
            x1 as f64 * s,
            y1 as f64 * s,
            x2 as f64 * s,
            y2 as f64 * s,
            x as f64 * s,
            y as f64 * s,
        );
    }
    fn close(&mut self) {
        self.path.close();
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::Storage;
    use crate::parser::{parse, NoResolve};

    fn storage() -> Storage<Vec<u8>> {
        let pdf = b"%PDF-1.4\n1 0 obj\n<</Type/Catalog>>\nendobj\nxref\n0 2\n0000000000 65535 f \n0000000009 00000 n \ntrailer\n<</Size 2/Root 1 0 R>>\nstartxref\n42\n%%EOF".to_vec();
        Storage::load(pdf, b"").unwrap()
    }

    #[test]
    fn widths_table_advances() {
        let storage = storage();
        let dict = parse(
            b"<</Type/Font/Subtype/Type1/BaseFont/Helvetica/FirstChar 65/Widths[600 700]>>",
            &NoResolve,
        )
        .unwrap()
        .into_dictionary()
        .unwrap();
        let font = Font::load(&dict, &storage);
        assert_eq!(font.kind, FontKind::Type1);
        assert!((font.advance(b'A') - 0.6).abs() < 1e-9);
        assert!((font.advance(b'B') - 0.7).abs() < 1e-9);
        // outside the table: default
        assert!((font.advance(b'z') - 0.5).abs() < 1e-9);
        assert!(!font.is_renderable());
    }

    #[test]
    fn type3_flagged_unsupported() {
        let storage = storage();
        let dict = parse(b"<</Type/Font/Subtype/Type3>>", &NoResolve)
            .unwrap()
            .into_dictionary()
            .unwrap();
        let font = Font::load(&dict, &storage);
        assert_eq!(font.kind, FontKind::Type3);
        assert!(!storage.warnings.is_empty());
    }
}
