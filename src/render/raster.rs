//! Scanline rasterizer: anti-aliased coverage spans from polygon edges,
//! 26.6-style subpixel precision via four sub-scanlines per row.

use super::{ClipRegion, FillRule, IRect, Matrix, Path};

/// One polygon edge, in device space. `dir` is +1 downward, -1 upward.
#[derive(Debug, Clone, Copy)]
struct Edge {
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
    dir: i32,
    id: u32,
}

fn edges_from_polys(polys: &[Vec<(f64, f64)>]) -> Vec<Edge> {
    let mut edges = Vec::new();
    let mut id = 0;
    for poly in polys {
        for w in poly.windows(2) {
            let (p0, p1) = (w[0], w[1]);
            if p0.1 == p1.1 {
                continue; // horizontal edges never cross a sub-scanline
            }
            if !(p0.0.is_finite() && p0.1.is_finite() && p1.0.is_finite() && p1.1.is_finite()) {
                continue;
            }
            let (a, b, dir) = if p0.1 < p1.1 { (p0, p1, 1) } else { (p1, p0, -1) };
            edges.push(Edge { x0: a.0, y0: a.1, x1: b.0, y1: b.1, dir, id });
            id += 1;
        }
        // implicit closing edge
        if poly.first() != poly.last() {
            let (p0, p1) = (*poly.last().unwrap(), *poly.first().unwrap());
            if p0.1 != p1.1 && p0.0.is_finite() && p0.1.is_finite() && p1.0.is_finite() && p1.1.is_finite() {
                let (a, b, dir) = if p0.1 < p1.1 { (p0, p1, 1) } else { (p1, p0, -1) };
                edges.push(Edge { x0: a.0, y0: a.1, x1: b.0, y1: b.1, dir, id });
            }
        }
    }
    edges
}

const SUB_SAMPLES: usize = 4;
const SUB_WEIGHT: u32 = 64; // 4 * 64 saturates just past 255

/// Rasterizes `path` transformed by `m`, confined to `bounds`, and hands each
/// touched scanline's coverage to `emit(y, x_start, covers)`.
pub fn fill_path(
    path: &Path,
    m: &Matrix,
    rule: FillRule,
    bounds: IRect,
    anti_alias: bool,
    mut emit: impl FnMut(i32, i32, &[u8]),
) {
    let polys = path.flatten(m);
    let edges = edges_from_polys(&polys);
    if edges.is_empty() || bounds.is_empty() {
        return;
    }

    // vertical range actually touched
    let mut y_min = f64::MAX;
    let mut y_max = f64::MIN;
    for e in &edges {
        y_min = y_min.min(e.y0);
        y_max = y_max.max(e.y1);
    }
    let y_start = (y_min.floor() as i32).max(bounds.y0);
    let y_end = (y_max.ceil() as i32).min(bounds.y1);
    if y_start >= y_end {
        return;
    }

    let width = bounds.width() as usize;
    let mut accum = vec![0u32; width];
    let mut crossings: Vec<(f64, i32, u32)> = Vec::new();

    let sub_offsets: &[f64] = if anti_alias {
        &[0.125, 0.375, 0.625, 0.875]
    } else {
        &[0.5]
    };
    let weight = if anti_alias { SUB_WEIGHT } else { 255 };

    for y in y_start..y_end {
        accum.iter_mut().for_each(|a| *a = 0);
        let mut touched = false;

        for &dy in sub_offsets.iter().take(if anti_alias { SUB_SAMPLES } else { 1 }) {
            let ys = y as f64 + dy;
            crossings.clear();
            for e in &edges {
                if ys >= e.y0 && ys < e.y1 {
                    let t = (ys - e.y0) / (e.y1 - e.y0);
                    let x = e.x0 + t * (e.x1 - e.x0);
                    crossings.push((x, e.dir, e.id));
                }
            }
            if crossings.is_empty() {
                continue;
            }
            // active edges sorted by x; ties broken by edge id, stable
            crossings.sort_by(|a, b| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.2.cmp(&b.2))
            });

            let mut winding = 0i32;
            let mut span_start: Option<f64> = None;
            for &(x, dir, _) in &crossings {
                let was_inside = match rule {
                    FillRule::NonZero => winding != 0,
                    FillRule::EvenOdd => winding % 2 != 0,
                };
                winding += dir;
                let is_inside = match rule {
                    FillRule::NonZero => winding != 0,
                    FillRule::EvenOdd => winding % 2 != 0,
                };
                match (was_inside, is_inside) {
                    (false, true) => span_start = Some(x),
                    (true, false) => {
                        if let Some(xa) = span_start.take() {
                            touched |= add_interval(&mut accum, bounds, xa, x, weight);
                        }
                    }
                    _ => {}
                }
            }
        }

        if touched {
            let covers: Vec<u8> = accum.iter().map(|&a| a.min(255) as u8).collect();
            // trim to the touched extent
            if let (Some(first), Some(last)) = (
                covers.iter().position(|&c| c != 0),
                covers.iter().rposition(|&c| c != 0),
            ) {
                emit(y, bounds.x0 + first as i32, &covers[first..=last]);
            }
        }
    }
}

/// Adds `weight`-scaled coverage of the interval [xa, xb) to the row
/// accumulator. Returns whether anything landed inside bounds.
fn add_interval(accum: &mut [u32], bounds: IRect, xa: f64, xb: f64, weight: u32) -> bool {
    let xa = xa.max(bounds.x0 as f64);
    let xb = xb.min(bounds.x1 as f64);
    if xb <= xa {
        return false;
    }
    let px0 = xa.floor() as i32;
    let px1 = (xb.ceil() as i32).min(bounds.x1);
    let mut any = false;
    for px in px0..px1 {
        let overlap = (xb.min(px as f64 + 1.0) - xa.max(px as f64)).max(0.0);
        if overlap <= 0.0 {
            continue;
        }
        let idx = (px - bounds.x0) as usize;
        if idx < accum.len() {
            accum[idx] += (overlap * weight as f64 + 0.5) as u32;
            any = true;
        }
    }
    any
}

/// Builds a coverage-mask clip region from a path.
pub fn clip_from_path(
    path: &Path,
    m: &Matrix,
    rule: FillRule,
    bounds: IRect,
    anti_alias: bool,
) -> ClipRegion {
    if bounds.is_empty() {
        return ClipRegion::Rect(IRect::empty());
    }
    let w = bounds.width() as usize;
    let h = bounds.height() as usize;
    let mut mask = vec![0u8; w * h];
    fill_path(path, m, rule, bounds, anti_alias, |y, x0, covers| {
        let row = (y - bounds.y0) as usize * w;
        for (i, &c) in covers.iter().enumerate() {
            let idx = row + (x0 - bounds.x0) as usize + i;
            mask[idx] = c;
        }
    });
    ClipRegion::Mask { rect: bounds, mask }
}
