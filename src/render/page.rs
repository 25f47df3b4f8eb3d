//! Page orchestration: page-tree lookup with inherited attributes, content
//! concatenation, the device CTM, and the render entry point.

use bitflags::bitflags;
use std::collections::HashSet;

use crate::backend::Backend;
use crate::content::Content;
use crate::error::*;
use crate::file::Storage;
use crate::primitive::{Dictionary, ObjNr, Primitive};
use crate::render::bitmap::{Bitmap, BitmapFormat, Color};
use crate::render::glyph::GlyphCache;
use crate::render::interp::Interpreter;
use crate::render::Matrix;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RenderFlags: u32 {
        const ANNOTATIONS = 1 << 0;
        const LCD_TEXT = 1 << 1;
        const NO_NATIVE_TEXT = 1 << 2;
        const GRAYSCALE = 1 << 3;
        const LIMIT_IMAGE_CACHE = 1 << 4;
        const FORCE_HALFTONE = 1 << 5;
        const PRINTING = 1 << 6;
        const NO_SMOOTH_TEXT = 1 << 7;
        const NO_SMOOTH_IMAGE = 1 << 8;
        const NO_SMOOTH_PATH = 1 << 9;
    }
}

const MAX_TREE_DEPTH: usize = 512;

/// A located page with its inherited attributes resolved.
pub struct PageInfo {
    pub dict: Dictionary,
    pub media_box: [f64; 4],
    pub crop_box: [f64; 4],
    pub rotate: i64,
    pub resources: Dictionary,
}

impl PageInfo {
    pub fn width_points(&self) -> f64 {
        (self.crop_box[2] - self.crop_box[0]).abs()
    }
    pub fn height_points(&self) -> f64 {
        (self.crop_box[3] - self.crop_box[1]).abs()
    }
}

fn rect_from(p: Option<Primitive>) -> Option<[f64; 4]> {
    let arr = match p {
        Some(Primitive::Array(a)) if a.len() == 4 => a,
        _ => return None,
    };
    let mut v = [0f64; 4];
    for (slot, p) in v.iter_mut().zip(&arr) {
        *slot = p.as_number().ok()?;
    }
    // normalize so (x0, y0) is the lower-left corner
    Some([v[0].min(v[2]), v[1].min(v[3]), v[0].max(v[2]), v[1].max(v[3])])
}

#[derive(Clone, Default)]
struct Inherited {
    media_box: Option<[f64; 4]>,
    crop_box: Option<[f64; 4]>,
    resources: Option<Dictionary>,
    rotate: Option<i64>,
}

impl Inherited {
    fn update<B: Backend>(&self, storage: &Storage<B>, dict: &Dictionary) -> Inherited {
        Inherited {
            media_box: rect_from(storage.get_entry(dict, "MediaBox")).or(self.media_box),
            crop_box: rect_from(storage.get_entry(dict, "CropBox")).or(self.crop_box),
            resources: storage
                .get_entry(dict, "Resources")
                .and_then(|p| p.into_dictionary().ok())
                .or_else(|| self.resources.clone()),
            rotate: storage
                .get_entry(dict, "Rotate")
                .and_then(|p| p.as_int().ok())
                .or(self.rotate),
        }
    }
}

/// Number of pages, per the root node's /Count (falling back to a tree walk).
pub fn page_count<B: Backend>(storage: &Storage<B>) -> u32 {
    let root = pages_root(storage);
    if let Some(dict) = &root {
        if let Some(n) = storage.get_entry(dict, "Count").and_then(|p| p.as_int().ok()) {
            if n >= 0 {
                return n as u32;
            }
        }
    }
    // damaged /Count: count leaves
    match root {
        Some(dict) => {
            let mut n = 0;
            let mut visited = HashSet::new();
            count_leaves(storage, &dict, &mut n, &mut visited, 0);
            n
        }
        None => 0,
    }
}

fn pages_root<B: Backend>(storage: &Storage<B>) -> Option<Dictionary> {
    let root = storage.get_entry(storage.trailer(), "Root")?;
    let catalog = root.as_dictionary().ok()?.clone();
    let pages = storage.get_entry(&catalog, "Pages")?;
    pages.into_dictionary().ok()
}

fn count_leaves<B: Backend>(
    storage: &Storage<B>,
    node: &Dictionary,
    n: &mut u32,
    visited: &mut HashSet<ObjNr>,
    depth: usize,
) {
    if depth > MAX_TREE_DEPTH {
        return;
    }
    let kids = match storage.get_entry(node, "Kids") {
        Some(Primitive::Array(kids)) => kids,
        _ => {
            *n += 1; // a leaf
            return;
        }
    };
    for kid in kids {
        if let Primitive::Reference(r) = kid {
            if !visited.insert(r.id) {
                continue; // cycle
            }
        }
        if let Ok(Primitive::Dictionary(dict)) = storage.deref(&kid) {
            count_leaves(storage, &dict, n, visited, depth + 1);
        }
    }
}

/// Walks the page tree to the `index`-th leaf, accumulating inheritable
/// attributes on the way down.
pub fn find_page<B: Backend>(storage: &Storage<B>, index: u32) -> Result<PageInfo> {
    let root = pages_root(storage).ok_or(PdfError::PageNotFound { page_nr: index })?;
    let mut remaining = index;
    let mut visited = HashSet::new();
    let inherited = Inherited::default().update(storage, &root);
    let found = descend(storage, &root, inherited, &mut remaining, &mut visited, 0)?;
    let (dict, inherited) = found.ok_or(PdfError::PageNotFound { page_nr: index })?;

    let media_box = inherited.media_box.unwrap_or_else(|| {
        storage.warnings.push("page missing MediaBox; using Letter".into());
        [0.0, 0.0, 612.0, 792.0]
    });
    Ok(PageInfo {
        crop_box: clip_box(inherited.crop_box.unwrap_or(media_box), media_box),
        media_box,
        rotate: inherited.rotate.unwrap_or(0).rem_euclid(360),
        resources: inherited.resources.unwrap_or_default(),
        dict,
    })
}

fn clip_box(crop: [f64; 4], media: [f64; 4]) -> [f64; 4] {
    let c = [
        crop[0].max(media[0]),
        crop[1].max(media[1]),
        crop[2].min(media[2]),
        crop[3].min(media[3]),
    ];
    if c[0] >= c[2] || c[1] >= c[3] {
        media
    } else {
        c
    }
}

type Found = Option<(Dictionary, Inherited)>;

fn descend<B: Backend>(
    storage: &Storage<B>,
    node: &Dictionary,
    inherited: Inherited,
    remaining: &mut u32,
    visited: &mut HashSet<ObjNr>,
    depth: usize,
) -> Result<Found> {
    if depth > MAX_TREE_DEPTH {
        err!(PdfError::ResourceLimit { msg: "page tree depth".into() });
    }
    let node_type = node.get("Type").and_then(|p| p.as_name().ok());
    let is_leaf = match node_type {
        Some(n) if *n == "Pages" => false,
        Some(n) if *n == "Page" => true,
        // missing /Type: treat nodes with /Kids as interior
        _ => !node.contains_key("Kids"),
    };

    if is_leaf {
        if *remaining == 0 {
            return Ok(Some((node.clone(), inherited)));
        }
        *remaining -= 1;
        return Ok(None);
    }

    let kids = match storage.get_entry(node, "Kids") {
        Some(Primitive::Array(kids)) => kids,
        _ => return Ok(None),
    };
    for kid in kids {
        if let Primitive::Reference(r) = kid {
            if !visited.insert(r.id) {
                storage.warnings.push(format!("page tree cycle at object {}", r.id));
                continue;
            }
        }
        let dict = match storage.deref(&kid) {
            Ok(Primitive::Dictionary(d)) => d,
            _ => continue,
        };
        let child_inherited = inherited.update(storage, &dict);
        if let Some(found) = descend(storage, &dict, child_inherited, remaining, visited, depth + 1)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

/// The page's content streams, concatenated into one logical stream.
pub fn page_contents<B: Backend>(storage: &Storage<B>, page: &Dictionary) -> Vec<u8> {
    let mut out = Vec::new();
    match storage.get_entry(page, "Contents") {
        Some(Primitive::Array(parts)) => {
            for part in parts {
                match storage.stream_data(&part) {
                    Ok(data) => {
                        out.extend_from_slice(&data);
                        out.push(b'\n');
                    }
                    Err(e) => storage.warnings.push(format!("unreadable content stream: {}", e)),
                }
            }
        }
        Some(p @ Primitive::Stream(_)) | Some(p @ Primitive::Reference(_)) => {
            match storage.stream_data(&p) {
                Ok(data) => out = data,
                Err(e) => storage.warnings.push(format!("unreadable content stream: {}", e)),
            }
        }
        Some(other) => storage
            .warnings
            .push(format!("page /Contents is {}", other.get_debug_name())),
        None => {}
    }
    out
}

/// CTM mapping the (rotated) crop box onto a `w x h` pixel grid, with the
/// PDF's upward y axis flipped to the bitmap's downward rows.
pub fn base_ctm(crop_box: [f64; 4], rotate: i64, w: u32, h: u32) -> Matrix {
    let bw = crop_box[2] - crop_box[0];
    let bh = crop_box[3] - crop_box[1];

    let to_origin = Matrix::translate(-crop_box[0], -crop_box[1]);
    // /Rotate turns the page clockwise when displayed; in the page's y-up
    // frame that is (x,y)->(y, bw-x) for 90 and (x,y)->(bh-y, x) for 270
    let (rot, ew, eh) = match rotate {
        90 => (Matrix::new(0.0, -1.0, 1.0, 0.0, 0.0, bw), bh, bw),
        180 => (Matrix::new(-1.0, 0.0, 0.0, -1.0, bw, bh), bw, bh),
        270 => (Matrix::new(0.0, 1.0, -1.0, 0.0, bh, 0.0), bh, bw),
        _ => (Matrix::IDENTITY, bw, bh),
    };
    let scale = Matrix::scale(w as f64 / ew.max(1e-9), -(h as f64) / eh.max(1e-9));
    let flip = Matrix::translate(0.0, h as f64);
    to_origin.concat(rot).concat(scale).concat(flip)
}

/// Renders one located page into a fresh bitmap.
pub fn render_page<B: Backend>(
    storage: &Storage<B>,
    glyphs: &mut GlyphCache,
    page: &PageInfo,
    width: u32,
    height: u32,
    background: Color,
    flags: RenderFlags,
) -> Result<Bitmap> {
    let format = if flags.contains(RenderFlags::GRAYSCALE) {
        BitmapFormat::Gray
    } else {
        BitmapFormat::Bgra
    };
    let mut bitmap = Bitmap::new(width, height, format)?;
    bitmap.fill(background);

    let data = page_contents(storage, &page.dict);
    let content = match Content::parse_from(&data) {
        Ok(c) => c,
        Err(e) => {
            storage.warnings.push(format!("content stream unparseable: {}", e));
            Content::default()
        }
    };

    let ctm = base_ctm(page.crop_box, page.rotate, width, height);
    let mut interp = Interpreter::new(storage, &mut bitmap, glyphs, flags, ctm);
    interp.run(&content, &page.resources)?;
    Ok(bitmap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctm_maps_corners() {
        let m = base_ctm([0.0, 0.0, 612.0, 792.0], 0, 612, 792);
        // bottom-left of the page lands at the bottom-left pixel
        assert_eq!(m.apply(0.0, 0.0), (0.0, 792.0));
        assert_eq!(m.apply(612.0, 792.0), (612.0, 0.0));
    }

    #[test]
    fn ctm_rotate_90_is_clockwise() {
        // 100x200 portrait page, /Rotate 90, shown on a 200x100 bitmap.
        // Working the clockwise rotation (x,y)->(y, bw-x) through the device
        // scale and y flip by hand gives device = (y, x): the page's bottom
        // edge becomes the left bitmap column and its right edge the bottom
        // row.
        let m = base_ctm([0.0, 0.0, 100.0, 200.0], 90, 200, 100);
        let (x, y) = m.apply(0.0, 0.0);
        assert!(x.abs() < 1e-9 && y.abs() < 1e-9, "({}, {})", x, y);
        let (x, y) = m.apply(100.0, 200.0);
        assert!((x - 200.0).abs() < 1e-9 && (y - 100.0).abs() < 1e-9, "({}, {})", x, y);
        // midpoint of the page's right edge lands mid-bottom
        let (x, y) = m.apply(100.0, 100.0);
        assert!((x - 100.0).abs() < 1e-9 && (y - 100.0).abs() < 1e-9, "({}, {})", x, y);
    }

    #[test]
    fn ctm_rotate_270_is_counterclockwise_of_90() {
        // same page, /Rotate 270: (x,y)->(bh-y, x), so the page's bottom edge
        // becomes the right bitmap column
        let m = base_ctm([0.0, 0.0, 100.0, 200.0], 270, 200, 100);
        let (x, y) = m.apply(0.0, 0.0);
        assert!((x - 200.0).abs() < 1e-9 && (y - 100.0).abs() < 1e-9, "({}, {})", x, y);
        let (x, y) = m.apply(100.0, 200.0);
        assert!(x.abs() < 1e-9 && y.abs() < 1e-9, "({}, {})", x, y);
    }

    #[test]
    fn ctm_scales_to_pixels() {
        let m = base_ctm([0.0, 0.0, 612.0, 792.0], 0, 100, 130);
        let (x, y) = m.apply(612.0, 0.0);
        assert!((x - 100.0).abs() < 1e-9);
        assert!((y - 130.0).abs() < 1e-9);
    }
}
