//! Glyph cache: rendered coverage bitmaps keyed by glyph and transform.

use std::collections::HashMap;
use std::rc::Rc;

use super::raster::fill_path;
use super::{FillRule, IRect, Matrix, Path};

/// Transform components quantized to 1e-4, so near-identical text matrices
/// share cache entries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GlyphKey {
    pub glyph: u32,
    pub m: [i64; 4],
    pub anti_alias: bool,
}

impl GlyphKey {
    pub fn new(glyph: u32, m: &Matrix, anti_alias: bool) -> GlyphKey {
        let q = |v: f64| (v * 1e4).round() as i64;
        GlyphKey {
            glyph,
            m: [q(m.a), q(m.b), q(m.c), q(m.d)],
            anti_alias,
        }
    }
}

/// A rendered glyph: coverage bytes and the offset of the bitmap's top-left
/// corner relative to the glyph origin.
pub struct GlyphBitmap {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub rows: u32,
    pub coverage: Vec<u8>,
}

/// Unbounded per-document cache; entries are immutable once inserted.
#[derive(Default)]
pub struct GlyphCache {
    map: HashMap<GlyphKey, Option<Rc<GlyphBitmap>>>,
}

impl GlyphCache {
    pub fn new() -> GlyphCache {
        GlyphCache::default()
    }
    pub fn len(&self) -> usize {
        self.map.len()
    }
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Fetches or renders the glyph. `outline` supplies the path in em units
    /// (y up); the key's linear transform maps it to device pixels.
    pub fn get(
        &mut self,
        key: GlyphKey,
        m: &Matrix,
        outline: impl FnOnce() -> Option<Path>,
    ) -> Option<Rc<GlyphBitmap>> {
        if let Some(cached) = self.map.get(&key) {
            return cached.clone();
        }
        let rendered = outline().and_then(|path| render_outline(&path, m, key.anti_alias)).map(Rc::new);
        self.map.insert(key, rendered.clone());
        rendered
    }
}

/// Rasterizes an outline with the translation-free transform `m`.
fn render_outline(path: &Path, m: &Matrix, anti_alias: bool) -> Option<GlyphBitmap> {
    let m = Matrix { e: 0.0, f: 0.0, ..*m };

    // device-space bounds
    let polys = path.flatten(&m);
    let mut min_x = f64::MAX;
    let mut min_y = f64::MAX;
    let mut max_x = f64::MIN;
    let mut max_y = f64::MIN;
    for poly in &polys {
        for &(x, y) in poly {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    if min_x > max_x {
        return None;
    }

    let left = min_x.floor() as i32;
    let top = min_y.floor() as i32;
    let width = (max_x.ceil() as i32 - left).max(1) as u32;
    let rows = (max_y.ceil() as i32 - top).max(1) as u32;
    if width > 4096 || rows > 4096 {
        return None;
    }

    let mut coverage = vec![0u8; (width * rows) as usize];
    let bounds = IRect::new(left, top, left + width as i32, top + rows as i32);
    fill_path(path, &m, FillRule::NonZero, bounds, anti_alias, |y, x0, covers| {
        let row = (y - top) as usize * width as usize;
        for (i, &c) in covers.iter().enumerate() {
            coverage[row + (x0 - left) as usize + i] = c;
        }
    });

    Some(GlyphBitmap { left, top, width, rows, coverage })
}
