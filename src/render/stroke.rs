//! Stroke-to-fill conversion: offset outlines with explicit caps and joins,
//! filled with the non-zero rule.

use super::{Matrix, Path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineCap {
    Butt,
    Round,
    Square,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineJoin {
    Miter,
    Round,
    Bevel,
}

#[derive(Debug, Clone)]
pub struct StrokeStyle {
    pub width: f64,
    pub cap: LineCap,
    pub join: LineJoin,
    pub miter_limit: f64,
    pub dash: Vec<f64>,
    pub dash_phase: f64,
}

impl Default for StrokeStyle {
    fn default() -> StrokeStyle {
        StrokeStyle {
            width: 1.0,
            cap: LineCap::Butt,
            join: LineJoin::Miter,
            miter_limit: 10.0,
            dash: Vec::new(),
            dash_phase: 0.0,
        }
    }
}

type Pt = (f64, f64);

#[inline]
fn sub(a: Pt, b: Pt) -> Pt {
    (a.0 - b.0, a.1 - b.1)
}
#[inline]
fn add(a: Pt, b: Pt) -> Pt {
    (a.0 + b.0, a.1 + b.1)
}
#[inline]
fn mul(a: Pt, s: f64) -> Pt {
    (a.0 * s, a.1 * s)
}
#[inline]
fn dot(a: Pt, b: Pt) -> f64 {
    a.0 * b.0 + a.1 * b.1
}
#[inline]
fn cross(a: Pt, b: Pt) -> f64 {
    a.0 * b.1 - a.1 * b.0
}
#[inline]
fn norm(a: Pt) -> f64 {
    dot(a, a).sqrt()
}
fn normalize(a: Pt) -> Option<Pt> {
    let n = norm(a);
    if n < 1e-12 {
        None
    } else {
        Some(mul(a, 1.0 / n))
    }
}
#[inline]
fn perp(a: Pt) -> Pt {
    (-a.1, a.0)
}

/// Converts a stroked path into a fillable outline (non-zero rule).
pub fn stroke_path(path: &Path, style: &StrokeStyle) -> Path {
    let radius = (style.width / 2.0).max(1e-4);
    let polys = path.flatten(&Matrix::IDENTITY);
    let mut out = Path::new();

    for poly in polys {
        let mut pts = dedup(&poly);
        let closed = pts.len() > 2 && pts.first() == pts.last();
        if closed {
            pts.pop();
        }
        if pts.len() < 2 {
            // a degenerate subpath still draws a dot with round caps
            if pts.len() == 1 && style.cap == LineCap::Round {
                circle(&mut out, pts[0], radius);
            }
            continue;
        }

        for (run, run_closed) in apply_dash(&pts, closed, style) {
            if run.len() < 2 {
                continue;
            }
            if run_closed {
                // outer boundary forward, inner boundary reversed so the two
                // rings wind oppositely and non-zero fill leaves the hole
                ring(&mut out, &run, radius, style);
                let rev: Vec<Pt> = run.iter().rev().cloned().collect();
                ring(&mut out, &rev, radius, style);
            } else {
                open_outline(&mut out, &run, radius, style);
            }
        }
    }
    out
}

fn dedup(poly: &[Pt]) -> Vec<Pt> {
    let mut pts: Vec<Pt> = Vec::with_capacity(poly.len());
    for &p in poly {
        if pts.last().map(|&q| norm(sub(p, q)) > 1e-9).unwrap_or(true) {
            pts.push(p);
        }
    }
    pts
}

/// Splits a polyline into on-segments per the dash pattern.
fn apply_dash(pts: &[Pt], closed: bool, style: &StrokeStyle) -> Vec<(Vec<Pt>, bool)> {
    let pattern: Vec<f64> = style.dash.iter().cloned().filter(|&d| d >= 0.0).collect();
    let total: f64 = pattern.iter().sum();
    if pattern.is_empty() || total <= 0.0 {
        return vec![(pts.to_vec(), closed)];
    }

    let mut segments: Vec<Pt> = pts.to_vec();
    if closed {
        segments.push(pts[0]);
    }

    // position inside the pattern
    let mut idx = 0usize;
    let mut remaining = pattern[0];
    let mut on = true;
    let mut phase = style.dash_phase % total;
    while phase > 0.0 {
        if phase >= remaining {
            phase -= remaining;
            idx = (idx + 1) % pattern.len();
            remaining = pattern[idx];
            on = !on;
        } else {
            remaining -= phase;
            phase = 0.0;
        }
    }

    let mut runs = Vec::new();
    let mut current: Vec<Pt> = Vec::new();
    if on {
        current.push(segments[0]);
    }
    for w in segments.windows(2) {
        let (mut p, q) = (w[0], w[1]);
        let mut seg_len = norm(sub(q, p));
        let dir = match normalize(sub(q, p)) {
            Some(d) => d,
            None => continue,
        };
        while seg_len > remaining {
            let cut = add(p, mul(dir, remaining));
            seg_len -= remaining;
            p = cut;
            if on {
                current.push(cut);
                runs.push((std::mem::take(&mut current), false));
            } else {
                current.clear();
                current.push(cut);
            }
            on = !on;
            idx = (idx + 1) % pattern.len();
            remaining = pattern[idx];
        }
        remaining -= seg_len;
        if on {
            current.push(q);
        }
    }
    if on && current.len() > 1 {
        runs.push((current, false));
    }
    runs
}

/// The left-offset boundary of a closed polyline, traversed in input order.
fn ring(out: &mut Path, pts: &[Pt], radius: f64, style: &StrokeStyle) {
    let n = pts.len();
    let mut first = true;
    for i in 0..n {
        let prev = pts[(i + n - 1) % n];
        let here = pts[i];
        let next = pts[(i + 1) % n];
        let d1 = match normalize(sub(here, prev)) {
            Some(d) => d,
            None => continue,
        };
        let d2 = match normalize(sub(next, here)) {
            Some(d) => d,
            None => continue,
        };
        for p in join_points(here, d1, d2, radius, style) {
            if first {
                out.move_to(p.0, p.1);
                first = false;
            } else {
                out.line_to(p.0, p.1);
            }
        }
    }
    if !first {
        out.close();
    }
}

/// Full outline of an open run: left side forward, end cap, right side
/// backward, start cap.
fn open_outline(out: &mut Path, pts: &[Pt], radius: f64, style: &StrokeStyle) {
    let n = pts.len();
    let mut boundary: Vec<Pt> = Vec::new();

    // forward (left side)
    for i in 0..n {
        let d_in = if i > 0 { normalize(sub(pts[i], pts[i - 1])) } else { None };
        let d_out = if i + 1 < n { normalize(sub(pts[i + 1], pts[i])) } else { None };
        match (d_in, d_out) {
            (None, Some(d)) => boundary.push(add(pts[i], mul(perp(d), radius))),
            (Some(d), None) => boundary.push(add(pts[i], mul(perp(d), radius))),
            (Some(a), Some(b)) => boundary.extend(join_points(pts[i], a, b, radius, style)),
            (None, None) => {}
        }
    }
    // end cap
    if let Some(d) = normalize(sub(pts[n - 1], pts[n - 2])) {
        cap_points(&mut boundary, pts[n - 1], d, radius, style.cap);
    }
    // backward (right side)
    for i in (0..n).rev() {
        let d_in = if i + 1 < n { normalize(sub(pts[i], pts[i + 1])) } else { None };
        let d_out = if i > 0 { normalize(sub(pts[i - 1], pts[i])) } else { None };
        match (d_in, d_out) {
            (None, Some(d)) | (Some(d), None) => boundary.push(add(pts[i], mul(perp(d), radius))),
            (Some(a), Some(b)) => boundary.extend(join_points(pts[i], a, b, radius, style)),
            (None, None) => {}
        }
    }
    // start cap
    if let Some(d) = normalize(sub(pts[0], pts[1])) {
        cap_points(&mut boundary, pts[0], d, radius, style.cap);
    }

    if boundary.len() >= 3 {
        out.move_to(boundary[0].0, boundary[0].1);
        for p in &boundary[1..] {
            out.line_to(p.0, p.1);
        }
        out.close();
    }
}

/// Join geometry at `v` between incoming direction `d1` and outgoing `d2`,
/// on the +perp side.
fn join_points(v: Pt, d1: Pt, d2: Pt, radius: f64, style: &StrokeStyle) -> Vec<Pt> {
    let n1 = perp(d1);
    let n2 = perp(d2);
    let p1 = add(v, mul(n1, radius));
    let p2 = add(v, mul(n2, radius));
    if norm(sub(p1, p2)) < 1e-9 {
        return vec![p1];
    }

    // the turn away from this side needs no join geometry; the straight
    // connection is inside the stroke
    let turning_toward = cross(d1, d2) < 0.0;
    if !turning_toward {
        return vec![p1, p2];
    }

    match style.join {
        LineJoin::Bevel => vec![p1, p2],
        LineJoin::Miter => {
            // miter ratio 1/cos(theta/2)
            let cos_half_sq = (1.0 + dot(d1, d2)) / 2.0;
            if cos_half_sq <= 1e-12 {
                return vec![p1, p2];
            }
            let ratio = 1.0 / cos_half_sq.sqrt();
            if ratio > style.miter_limit {
                return vec![p1, p2];
            }
            let bisect = add(n1, n2);
            let scale = radius / (1.0 + dot(n1, n2)).max(1e-12);
            let m = add(v, mul(bisect, scale));
            vec![p1, m, p2]
        }
        LineJoin::Round => arc_points(v, n1, n2, radius),
    }
}

fn cap_points(boundary: &mut Vec<Pt>, p: Pt, d: Pt, radius: f64, cap: LineCap) {
    let n = perp(d);
    let a = add(p, mul(n, radius));
    let b = add(p, mul(n, -radius));
    match cap {
        LineCap::Butt => {
            boundary.push(a);
            boundary.push(b);
        }
        LineCap::Square => {
            let e = mul(d, radius);
            boundary.push(add(a, e));
            boundary.push(add(b, e));
        }
        LineCap::Round => {
            boundary.extend(arc_points(p, n, mul(n, -1.0), radius));
        }
    }
}

/// Points along the arc from direction `from` to `to` around `c` (short way
/// through the `from`->`to` rotation).
fn arc_points(c: Pt, from: Pt, to: Pt, radius: f64) -> Vec<Pt> {
    let a0 = from.1.atan2(from.0);
    let mut a1 = to.1.atan2(to.0);
    // rotate in the direction that crosses the outside of the join
    if cross(from, to) < 0.0 {
        while a1 > a0 {
            a1 -= std::f64::consts::TAU;
        }
    } else {
        while a1 < a0 {
            a1 += std::f64::consts::TAU;
        }
    }
    let sweep = a1 - a0;
    let steps = ((sweep.abs() / 0.35).ceil() as usize).max(1);
    (0..=steps)
        .map(|i| {
            let t = a0 + sweep * i as f64 / steps as f64;
            add(c, (radius * t.cos(), radius * t.sin()))
        })
        .collect()
}

fn circle(out: &mut Path, c: Pt, radius: f64) {
    let steps = 16;
    out.move_to(c.0 + radius, c.1);
    for i in 1..=steps {
        let t = std::f64::consts::TAU * i as f64 / steps as f64;
        out.line_to(c.0 + radius * t.cos(), c.1 + radius * t.sin());
    }
    out.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::raster::fill_path;
    use crate::render::{FillRule, IRect, Matrix, Path};

    fn stroke_area(path: &Path, style: &StrokeStyle) -> f64 {
        let outline = stroke_path(path, style);
        let mut total = 0f64;
        fill_path(
            &outline,
            &Matrix::IDENTITY,
            FillRule::NonZero,
            IRect::new(-100, -100, 300, 300),
            true,
            |_y, _x, covers| total += covers.iter().map(|&c| c as f64).sum::<f64>(),
        );
        total / 255.0
    }

    #[test]
    fn horizontal_line_butt() {
        let mut p = Path::new();
        p.move_to(10.0, 50.0);
        p.line_to(110.0, 50.0);
        let style = StrokeStyle { width: 10.0, ..Default::default() };
        let area = stroke_area(&p, &style);
        let expect = 100.0 * 10.0;
        assert!((area - expect).abs() / expect < 0.02, "area {}", area);
    }

    #[test]
    fn square_cap_extends() {
        let mut p = Path::new();
        p.move_to(10.0, 50.0);
        p.line_to(110.0, 50.0);
        let style = StrokeStyle { width: 10.0, cap: LineCap::Square, ..Default::default() };
        let area = stroke_area(&p, &style);
        let expect = 110.0 * 10.0; // 5 extra on each end
        assert!((area - expect).abs() / expect < 0.02, "area {}", area);
    }

    #[test]
    fn right_angle_miter() {
        let mut p = Path::new();
        p.move_to(10.0, 10.0);
        p.line_to(110.0, 10.0);
        p.line_to(110.0, 110.0);
        let style = StrokeStyle { width: 10.0, ..Default::default() };
        let area = stroke_area(&p, &style);
        // two 100x10 arms overlapping in a 5x5 corner, plus the 5x5 square
        // the miter adds outside the turn
        let expect = 100.0 * 10.0 + 100.0 * 10.0 - 25.0 + 25.0;
        assert!((area - expect).abs() / expect < 0.02, "area {}", area);
    }

    #[test]
    fn closed_rect_is_annulus() {
        let mut p = Path::new();
        p.rect(20.0, 20.0, 60.0, 60.0);
        let style = StrokeStyle { width: 4.0, ..Default::default() };
        let area = stroke_area(&p, &style);
        // 64x64 outer minus 56x56 inner
        let expect = 64.0 * 64.0 - 56.0 * 56.0;
        assert!((area - expect).abs() / expect < 0.03, "area {}", area);
    }

    #[test]
    fn dashes_reduce_area() {
        let mut p = Path::new();
        p.move_to(0.0, 50.0);
        p.line_to(100.0, 50.0);
        let style = StrokeStyle {
            width: 2.0,
            dash: vec![5.0, 5.0],
            ..Default::default()
        };
        let area = stroke_area(&p, &style);
        let expect = 50.0 * 2.0;
        assert!((area - expect).abs() / expect < 0.05, "area {}", area);
    }
}
