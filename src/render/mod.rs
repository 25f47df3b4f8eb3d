//! Software rendering: geometry, rasterization, glyphs, compositing and the
//! content-stream interpreter.

pub mod bitmap;
pub mod raster;
pub mod stroke;
pub mod glyph;
pub mod interp;
pub mod page;

pub use bitmap::{Bitmap, BitmapFormat, Color};
pub use page::{render_page, RenderFlags};

/// 2x3 affine transform: maps (x, y) to (a x + c y + e, b x + d y + f).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl Matrix {
    pub const IDENTITY: Matrix = Matrix { a: 1.0, b: 0.0, c: 0.0, d: 1.0, e: 0.0, f: 0.0 };

    pub fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Matrix {
        Matrix { a, b, c, d, e, f }
    }
    pub fn translate(tx: f64, ty: f64) -> Matrix {
        Matrix::new(1.0, 0.0, 0.0, 1.0, tx, ty)
    }
    pub fn scale(sx: f64, sy: f64) -> Matrix {
        Matrix::new(sx, 0.0, 0.0, sy, 0.0, 0.0)
    }

    /// `self` applied first, then `rhs`.
    pub fn concat(self, rhs: Matrix) -> Matrix {
        Matrix {
            a: self.a * rhs.a + self.b * rhs.c,
            b: self.a * rhs.b + self.b * rhs.d,
            c: self.c * rhs.a + self.d * rhs.c,
            d: self.c * rhs.b + self.d * rhs.d,
            e: self.e * rhs.a + self.f * rhs.c + rhs.e,
            f: self.e * rhs.b + self.f * rhs.d + rhs.f,
        }
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (self.a * x + self.c * y + self.e, self.b * x + self.d * y + self.f)
    }

    /// Transform without the translation part.
    pub fn apply_vector(&self, x: f64, y: f64) -> (f64, f64) {
        (self.a * x + self.c * y, self.b * x + self.d * y)
    }

    pub fn determinant(&self) -> f64 {
        self.a * self.d - self.b * self.c
    }

    pub fn invert(&self) -> Option<Matrix> {
        let det = self.determinant();
        if det.abs() < 1e-12 {
            return None;
        }
        let inv = 1.0 / det;
        Some(Matrix {
            a: self.d * inv,
            b: -self.b * inv,
            c: -self.c * inv,
            d: self.a * inv,
            e: (self.c * self.f - self.d * self.e) * inv,
            f: (self.b * self.e - self.a * self.f) * inv,
        })
    }

    /// Average absolute scale, used for flattening tolerance and line widths.
    pub fn mean_scale(&self) -> f64 {
        let sx = (self.a * self.a + self.b * self.b).sqrt();
        let sy = (self.c * self.c + self.d * self.d).sqrt();
        (sx + sy) / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillRule {
    NonZero,
    EvenOdd,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PathCmd {
    MoveTo(f64, f64),
    LineTo(f64, f64),
    CurveTo(f64, f64, f64, f64, f64, f64),
    Close,
}

/// A path in user space; transformed and flattened at rasterization time.
#[derive(Debug, Clone, Default)]
pub struct Path {
    pub cmds: Vec<PathCmd>,
}

impl Path {
    pub fn new() -> Path {
        Path::default()
    }
    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }
    pub fn move_to(&mut self, x: f64, y: f64) {
        self.cmds.push(PathCmd::MoveTo(x, y));
    }
    pub fn line_to(&mut self, x: f64, y: f64) {
        self.cmds.push(PathCmd::LineTo(x, y));
    }
    pub fn curve_to(&mut self, x1: f64, y1: f64, x2: f64, y2: f64, x3: f64, y3: f64) {
        self.cmds.push(PathCmd::CurveTo(x1, y1, x2, y2, x3, y3));
    }
    pub fn close(&mut self) {
        self.cmds.push(PathCmd::Close);
    }
    pub fn rect(&mut self, x: f64, y: f64, w: f64, h: f64) {
        self.move_to(x, y);
        self.line_to(x + w, y);
        self.line_to(x + w, y + h);
        self.line_to(x, y + h);
        self.close();
    }

    pub fn current_point(&self) -> Option<(f64, f64)> {
        for cmd in self.cmds.iter().rev() {
            match *cmd {
                PathCmd::MoveTo(x, y) | PathCmd::LineTo(x, y) => return Some((x, y)),
                PathCmd::CurveTo(_, _, _, _, x, y) => return Some((x, y)),
                PathCmd::Close => {}
            }
        }
        None
    }

    /// Transforms into device space and flattens curves; returns closed
    /// polylines.
    pub fn flatten(&self, m: &Matrix) -> Vec<Vec<(f64, f64)>> {
        let mut polys: Vec<Vec<(f64, f64)>> = Vec::new();
        let mut current: Vec<(f64, f64)> = Vec::new();
        let mut start: Option<(f64, f64)> = None;

        let tolerance = 0.2;
        for cmd in &self.cmds {
            match *cmd {
                PathCmd::MoveTo(x, y) => {
                    if current.len() > 1 {
                        polys.push(std::mem::take(&mut current));
                    } else {
                        current.clear();
                    }
                    let p = m.apply(x, y);
                    start = Some(p);
                    current.push(p);
                }
                PathCmd::LineTo(x, y) => {
                    current.push(m.apply(x, y));
                }
                PathCmd::CurveTo(x1, y1, x2, y2, x3, y3) => {
                    let p0 = *current.last().unwrap_or(&m.apply(x1, y1));
                    let p1 = m.apply(x1, y1);
                    let p2 = m.apply(x2, y2);
                    let p3 = m.apply(x3, y3);
                    flatten_cubic(p0, p1, p2, p3, tolerance, 0, &mut current);
                }
                PathCmd::Close => {
                    if let Some(s) = start {
                        if current.last() != Some(&s) {
                            current.push(s);
                        }
                    }
                    if current.len() > 1 {
                        polys.push(std::mem::take(&mut current));
                    } else {
                        current.clear();
                    }
                    if let Some(s) = start {
                        current.push(s);
                    }
                }
            }
        }
        if current.len() > 1 {
            polys.push(current);
        }
        polys
    }
}

fn flatten_cubic(
    p0: (f64, f64),
    p1: (f64, f64),
    p2: (f64, f64),
    p3: (f64, f64),
    tolerance: f64,
    depth: u32,
    out: &mut Vec<(f64, f64)>,
) {
    // flat enough when control points sit near the chord
    let d1 = point_line_dist(p1, p0, p3);
    let d2 = point_line_dist(p2, p0, p3);
    if depth >= 16 || d1.max(d2) <= tolerance {
        out.push(p3);
        return;
    }
    let mid = |a: (f64, f64), b: (f64, f64)| ((a.0 + b.0) / 2.0, (a.1 + b.1) / 2.0);
    let p01 = mid(p0, p1);
    let p12 = mid(p1, p2);
    let p23 = mid(p2, p3);
    let p012 = mid(p01, p12);
    let p123 = mid(p12, p23);
    let p0123 = mid(p012, p123);
    flatten_cubic(p0, p01, p012, p0123, tolerance, depth + 1, out);
    flatten_cubic(p0123, p123, p23, p3, tolerance, depth + 1, out);
}

fn point_line_dist(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len = (dx * dx + dy * dy).sqrt();
    if len < 1e-9 {
        let (ex, ey) = (p.0 - a.0, p.1 - a.1);
        return (ex * ex + ey * ey).sqrt();
    }
    ((p.0 - a.0) * dy - (p.1 - a.1) * dx).abs() / len
}

/// Integer device-space rectangle, half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IRect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl IRect {
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> IRect {
        IRect { x0, y0, x1, y1 }
    }
    pub fn empty() -> IRect {
        IRect { x0: 0, y0: 0, x1: 0, y1: 0 }
    }
    pub fn is_empty(&self) -> bool {
        self.x1 <= self.x0 || self.y1 <= self.y0
    }
    pub fn width(&self) -> i32 {
        (self.x1 - self.x0).max(0)
    }
    pub fn height(&self) -> i32 {
        (self.y1 - self.y0).max(0)
    }
    pub fn intersect(&self, other: &IRect) -> IRect {
        let r = IRect {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        };
        if r.is_empty() {
            IRect::empty()
        } else {
            r
        }
    }
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }
}

/// Clip region: a rectangle, optionally refined by an 8-bit coverage mask.
#[derive(Clone)]
pub enum ClipRegion {
    Rect(IRect),
    Mask { rect: IRect, mask: Vec<u8> },
}

impl ClipRegion {
    pub fn full(width: u32, height: u32) -> ClipRegion {
        ClipRegion::Rect(IRect::new(0, 0, width as i32, height as i32))
    }

    pub fn rect(&self) -> IRect {
        match self {
            ClipRegion::Rect(r) => *r,
            ClipRegion::Mask { rect, .. } => *rect,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rect().is_empty()
    }

    pub fn coverage_at(&self, x: i32, y: i32) -> u8 {
        match self {
            ClipRegion::Rect(r) => {
                if r.contains(x, y) {
                    255
                } else {
                    0
                }
            }
            ClipRegion::Mask { rect, mask } => {
                if !rect.contains(x, y) {
                    return 0;
                }
                let w = rect.width() as usize;
                mask[(y - rect.y0) as usize * w + (x - rect.x0) as usize]
            }
        }
    }

    /// Intersection. Rect x Rect stays a rect; anything involving a mask
    /// multiplies coverages.
    pub fn intersect(&self, other: &ClipRegion) -> ClipRegion {
        let rect = self.rect().intersect(&other.rect());
        if rect.is_empty() {
            return ClipRegion::Rect(IRect::empty());
        }
        match (self, other) {
            (ClipRegion::Rect(_), ClipRegion::Rect(_)) => ClipRegion::Rect(rect),
            _ => {
                let w = rect.width() as usize;
                let h = rect.height() as usize;
                let mut mask = vec![0u8; w * h];
                for y in 0..h as i32 {
                    for x in 0..w as i32 {
                        let gx = rect.x0 + x;
                        let gy = rect.y0 + y;
                        let a = self.coverage_at(gx, gy) as u32;
                        let b = other.coverage_at(gx, gy) as u32;
                        mask[y as usize * w + x as usize] = (a * b / 255) as u8;
                    }
                }
                ClipRegion::Mask { rect, mask }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_is_premultiplication() {
        let translate = Matrix::translate(10.0, 0.0);
        let scale = Matrix::scale(2.0, 2.0);
        // translate applied first, then scale
        let m = translate.concat(scale);
        assert_eq!(m.apply(1.0, 1.0), (22.0, 2.0));
    }

    #[test]
    fn invert_roundtrip() {
        let m = Matrix::new(2.0, 1.0, -1.0, 3.0, 5.0, -2.0);
        let inv = m.invert().unwrap();
        let (x, y) = m.apply(3.5, -1.25);
        let (bx, by) = inv.apply(x, y);
        assert!((bx - 3.5).abs() < 1e-9 && (by + 1.25).abs() < 1e-9);
    }

    #[test]
    fn clip_idempotent_under_self_intersection() {
        let clip = ClipRegion::Rect(IRect::new(2, 3, 20, 30));
        let again = clip.intersect(&ClipRegion::Rect(clip.rect()));
        assert_eq!(again.rect(), clip.rect());

        let mask = ClipRegion::Mask {
            rect: IRect::new(0, 0, 4, 1),
            mask: vec![0, 128, 255, 64],
        };
        let self_rect = ClipRegion::Rect(mask.rect());
        let out = mask.intersect(&self_rect);
        for x in 0..4 {
            assert_eq!(out.coverage_at(x, 0), mask.coverage_at(x, 0));
        }
    }

    #[test]
    fn mask_intersection_multiplies() {
        let a = ClipRegion::Mask {
            rect: IRect::new(0, 0, 2, 1),
            mask: vec![255, 128],
        };
        let b = ClipRegion::Mask {
            rect: IRect::new(0, 0, 2, 1),
            mask: vec![128, 128],
        };
        let out = a.intersect(&b);
        assert_eq!(out.coverage_at(0, 0), 128);
        assert_eq!(out.coverage_at(1, 0), 64);
    }

    #[test]
    fn empty_intersection_collapses() {
        let a = ClipRegion::Rect(IRect::new(0, 0, 5, 5));
        let b = ClipRegion::Rect(IRect::new(10, 10, 20, 20));
        assert!(a.intersect(&b).is_empty());
    }

    #[test]
    fn flatten_rect() {
        let mut p = Path::new();
        p.rect(0.0, 0.0, 10.0, 5.0);
        let polys = p.flatten(&Matrix::IDENTITY);
        assert_eq!(polys.len(), 1);
        assert_eq!(polys[0].first(), polys[0].last());
        assert_eq!(polys[0].len(), 5);
    }

    #[test]
    fn flatten_curve_is_dense() {
        let mut p = Path::new();
        p.move_to(0.0, 0.0);
        p.curve_to(0.0, 50.0, 100.0, 50.0, 100.0, 0.0);
        let polys = p.flatten(&Matrix::IDENTITY);
        assert!(polys[0].len() > 8);
    }
}
