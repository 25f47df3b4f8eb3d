//! Tile decoding: packet iteration over the progression order, T1 per
//! code-block, dequantization, subband assembly, inverse DWT, component
//! transform and level shift.

use super::codestream::{Codestream, CodingStyle, Progression, QuantStyle, TileData, MARKER_EPH, MARKER_SOP};
use super::t1;
use super::t2::{self, PrecinctBand};
use crate::error::*;

fn malformed(msg: impl Into<String>) -> PdfError {
    PdfError::MalformedImage { msg: msg.into() }
}

#[inline]
fn ceil_div(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}
#[inline]
fn ceil_div_pow2(a: u32, exp: u32) -> u32 {
    let d = 1u64 << exp;
    ((a as u64 + d - 1) >> exp) as u32
}
#[inline]
fn ceil_div_pow2_signed(a: i64, exp: u32) -> i64 {
    let d = 1i64 << exp;
    (a + d - 1).div_euclid(d)
}

#[derive(Copy, Clone, Debug)]
struct Rect {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}
impl Rect {
    fn w(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }
    fn h(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }
    fn is_empty(&self) -> bool {
        self.x1 <= self.x0 || self.y1 <= self.y0
    }
}

/// LL=0, HL=1, LH=2, HH=3; doubles as (xob, yob) via bits 0 and 1.
#[derive(Copy, Clone)]
struct Band {
    orient: u8,
    rect: Rect,
    /// quadrant origin inside the tile-component buffer
    off_x: u32,
    off_y: u32,
    /// magnitude bit-planes coded in this band
    mb: u32,
    /// irreversible step size
    delta: f32,
}

struct Precinct {
    /// code-block rectangles per band, aligned with `t2[band].states`
    cblk_rects: Vec<Vec<Rect>>,
    t2: Vec<PrecinctBand>,
}

struct ResLevel {
    rect: Rect,
    prev_rect: Rect,
    bands: Vec<Band>,
    num_px: u32,
    num_py: u32,
    precincts: Vec<Precinct>,
}

enum Samples {
    Int(Vec<i32>),
    Real(Vec<f32>),
}

struct TileComp {
    rect: Rect,
    levels: u32,
    reversible: bool,
    resolutions: Vec<ResLevel>,
    buf: Samples,
}

fn band_rect(tc: Rect, levels: u32, r: u32, orient: u8) -> Rect {
    if r == 0 {
        let nb = levels;
        return Rect {
            x0: ceil_div_pow2(tc.x0, nb),
            y0: ceil_div_pow2(tc.y0, nb),
            x1: ceil_div_pow2(tc.x1, nb),
            y1: ceil_div_pow2(tc.y1, nb),
        };
    }
    let nb = levels - r + 1;
    let xob = (orient & 1) as i64;
    let yob = ((orient >> 1) & 1) as i64;
    let half = 1i64 << (nb - 1);
    let f = |v: u32, ob: i64| ceil_div_pow2_signed(v as i64 - half * ob, nb).max(0) as u32;
    Rect {
        x0: f(tc.x0, xob),
        y0: f(tc.y0, yob),
        x1: f(tc.x1, xob),
        y1: f(tc.y1, yob),
    }
}

fn res_rect(tc: Rect, levels: u32, r: u32) -> Rect {
    let nb = levels - r;
    Rect {
        x0: ceil_div_pow2(tc.x0, nb),
        y0: ceil_div_pow2(tc.y0, nb),
        x1: ceil_div_pow2(tc.x1, nb),
        y1: ceil_div_pow2(tc.y1, nb),
    }
}

/// Maps a precinct rect from resolution coordinates into a band's domain.
fn precinct_in_band(orient: u8, r: u32, p: Rect) -> Rect {
    if r == 0 {
        return p;
    }
    let high_x = orient & 1 != 0;
    let high_y = orient & 2 != 0;
    let fx = |v: u32| if high_x { v / 2 } else { ceil_div(v, 2) };
    let fy = |v: u32| if high_y { v / 2 } else { ceil_div(v, 2) };
    Rect { x0: fx(p.x0), y0: fy(p.y0), x1: fx(p.x1), y1: fy(p.y1) }
}

/// Quantization parameters of one band: (exponent, mantissa).
fn band_quant(quant: &QuantStyle, levels: u32, r: u32, orient: u8) -> Result<(u32, u32)> {
    let band_index = if r == 0 { 0 } else { (3 * (r - 1) + orient as u32) as usize };
    match quant {
        QuantStyle::None { exps, .. } => {
            let e = *exps
                .get(band_index)
                .ok_or_else(|| malformed("missing quantization exponent"))?;
            Ok((e, 0))
        }
        QuantStyle::Derived { mant, exp, .. } => {
            // derived from the LL values by decomposition depth
            let nb = if r == 0 { levels } else { levels - r + 1 };
            let e = (*exp + nb).saturating_sub(levels);
            Ok((e, *mant))
        }
        QuantStyle::Expounded { steps, .. } => {
            let &(mant, exp) = steps
                .get(band_index)
                .ok_or_else(|| malformed("missing quantization step"))?;
            Ok((exp, mant))
        }
    }
}

fn build_tile_comp(
    tc_rect: Rect,
    style: &CodingStyle,
    quant: &QuantStyle,
    precision: u8,
) -> Result<TileComp> {
    let levels = style.levels;
    let guard = quant.guard_bits();
    let mut resolutions = Vec::with_capacity(levels as usize + 1);

    for r in 0..=levels {
        let rect = res_rect(tc_rect, levels, r);
        let prev_rect = if r == 0 { rect } else { res_rect(tc_rect, levels, r - 1) };
        let (ppx, ppy) = style.precinct_exp(r);
        if r > 0 && (ppx == 0 || ppy == 0) {
            return Err(malformed("zero precinct size"));
        }

        let orients: &[u8] = if r == 0 { &[0] } else { &[1, 2, 3] };
        let mut bands = Vec::with_capacity(orients.len());
        for &orient in orients {
            let brect = band_rect(tc_rect, levels, r, orient);
            let (exp, mant) = band_quant(quant, levels, r, orient)?;
            let gain = [0u32, 1, 1, 2][orient as usize];
            let mb = (guard + exp).saturating_sub(1);
            // delta = 2^(R_b - exp) * (1 + mant / 2^11)
            let rb = precision as i32 + gain as i32;
            let delta = (1.0 + mant as f32 / 2048.0) * 2f32.powi(rb - exp as i32);
            let (off_x, off_y) = match orient {
                0 => (0, 0),
                1 => (prev_rect.w(), 0),
                2 => (0, prev_rect.h()),
                _ => (prev_rect.w(), prev_rect.h()),
            };
            bands.push(Band { orient, rect: brect, off_x, off_y, mb, delta });
        }

        let (num_px, num_py) = if rect.is_empty() {
            (0, 0)
        } else {
            (
                ceil_div_pow2(rect.x1, ppx) - (rect.x0 >> ppx),
                ceil_div_pow2(rect.y1, ppy) - (rect.y0 >> ppy),
            )
        };

        // code-block exponents, halved inside precincts above resolution 0
        let cbw = style.xcb.min(if r == 0 { ppx } else { ppx - 1 });
        let cbh = style.ycb.min(if r == 0 { ppy } else { ppy - 1 });

        let mut precincts = Vec::with_capacity((num_px * num_py) as usize);
        for p in 0..num_px * num_py {
            let px = p % num_px.max(1);
            let py = p / num_px.max(1);
            let prx0 = ((rect.x0 >> ppx) + px) << ppx;
            let pry0 = ((rect.y0 >> ppy) + py) << ppy;
            let prect = Rect {
                x0: prx0.max(rect.x0),
                y0: pry0.max(rect.y0),
                x1: (prx0 + (1 << ppx)).min(rect.x1),
                y1: (pry0 + (1 << ppy)).min(rect.y1),
            };

            let mut cblk_rects = Vec::with_capacity(bands.len());
            let mut t2bands = Vec::with_capacity(bands.len());
            for band in &bands {
                let pband = precinct_in_band(band.orient, r, prect);
                let pband = Rect {
                    x0: pband.x0.max(band.rect.x0),
                    y0: pband.y0.max(band.rect.y0),
                    x1: pband.x1.min(band.rect.x1),
                    y1: pband.y1.min(band.rect.y1),
                };
                let (mut rects, mut w, mut h) = (Vec::new(), 0usize, 0usize);
                if !pband.is_empty() {
                    let cb_w = 1u32 << cbw;
                    let cb_h = 1u32 << cbh;
                    let kx0 = pband.x0 / cb_w;
                    let kx1 = ceil_div(pband.x1, cb_w);
                    let ky0 = pband.y0 / cb_h;
                    let ky1 = ceil_div(pband.y1, cb_h);
                    w = (kx1 - kx0) as usize;
                    h = (ky1 - ky0) as usize;
                    for ky in ky0..ky1 {
                        for kx in kx0..kx1 {
                            rects.push(Rect {
                                x0: (kx * cb_w).max(pband.x0),
                                y0: (ky * cb_h).max(pband.y0),
                                x1: ((kx + 1) * cb_w).min(pband.x1),
                                y1: ((ky + 1) * cb_h).min(pband.y1),
                            });
                        }
                    }
                }
                cblk_rects.push(rects);
                t2bands.push(PrecinctBand::new(w, h));
            }
            precincts.push(Precinct { cblk_rects, t2: t2bands });
        }

        resolutions.push(ResLevel { rect, prev_rect, bands, num_px, num_py, precincts });
    }

    let n = (tc_rect.w() * tc_rect.h()) as usize;
    let buf = if style.reversible {
        Samples::Int(vec![0; n])
    } else {
        Samples::Real(vec![0.0; n])
    };
    Ok(TileComp {
        rect: tc_rect,
        levels,
        reversible: style.reversible,
        resolutions,
        buf,
    })
}

/// Runs the packet stream of one tile through its precinct structures.
fn read_packets(tile_data: &[u8], comps: &mut [TileComp], style: &CodingStyle) -> Result<()> {
    let max_res = comps.iter().map(|c| c.levels).max().unwrap_or(0) + 1;
    let layers = style.layers;

    // packet sequence per progression; (layer, res, comp, precinct)
    let mut sequence: Vec<(u32, u32, usize, u32)> = Vec::new();
    let nprec = |c: &TileComp, r: u32| -> u32 {
        c.resolutions
            .get(r as usize)
            .map(|res| res.num_px * res.num_py)
            .unwrap_or(0)
    };
    let max_prec = |r: u32| -> u32 { comps.iter().map(|c| nprec(c, r)).max().unwrap_or(0) };
    let global_max_prec = (0..max_res).map(max_prec).max().unwrap_or(0);

    match style.progression {
        Progression::Lrcp => {
            for l in 0..layers {
                for r in 0..max_res {
                    for c in 0..comps.len() {
                        for p in 0..nprec(&comps[c], r) {
                            sequence.push((l, r, c, p));
                        }
                    }
                }
            }
        }
        Progression::Rlcp => {
            for r in 0..max_res {
                for l in 0..layers {
                    for c in 0..comps.len() {
                        for p in 0..nprec(&comps[c], r) {
                            sequence.push((l, r, c, p));
                        }
                    }
                }
            }
        }
        Progression::Rpcl => {
            for r in 0..max_res {
                for p in 0..max_prec(r) {
                    for c in 0..comps.len() {
                        if p < nprec(&comps[c], r) {
                            for l in 0..layers {
                                sequence.push((l, r, c, p));
                            }
                        }
                    }
                }
            }
        }
        Progression::Pcrl => {
            for p in 0..global_max_prec {
                for c in 0..comps.len() {
                    for r in 0..max_res {
                        if p < nprec(&comps[c], r) {
                            for l in 0..layers {
                                sequence.push((l, r, c, p));
                            }
                        }
                    }
                }
            }
        }
        Progression::Cprl => {
            for c in 0..comps.len() {
                for p in 0..global_max_prec {
                    for r in 0..max_res {
                        if p < nprec(&comps[c], r) {
                            for l in 0..layers {
                                sequence.push((l, r, c, p));
                            }
                        }
                    }
                }
            }
        }
    }

    let mut pos = 0usize;
    for (layer, r, c, p) in sequence {
        if pos >= tile_data.len() {
            // truncated streams decode what they have
            break;
        }
        // SOP marker segments delimit packets only when COD says so
        if style.use_sop && tile_data.len() - pos >= 2 {
            let m = (tile_data[pos] as u16) << 8 | tile_data[pos + 1] as u16;
            if m == MARKER_SOP {
                pos += 6;
            }
        }
        let precinct = &mut comps[c].resolutions[r as usize].precincts[p as usize];
        let (contribs, header_len) =
            t2::parse_packet_header(&tile_data[pos.min(tile_data.len())..], &mut precinct.t2, layer)?;
        pos += header_len;

        if style.use_eph && tile_data.len().saturating_sub(pos) >= 2 {
            let m = (tile_data[pos] as u16) << 8 | tile_data[pos + 1] as u16;
            if m == MARKER_EPH {
                pos += 2;
            }
        }

        for contrib in contribs {
            let end = pos + contrib.len;
            if end > tile_data.len() {
                warn!("packet body truncated");
                pos = tile_data.len();
                break;
            }
            precinct.t2[contrib.band].states[contrib.cblk]
                .data
                .extend_from_slice(&tile_data[pos..end]);
            pos = end;
        }
    }
    Ok(())
}

/// T1-decodes every code-block and writes dequantized coefficients into the
/// tile-component buffer quadrants.
fn decode_coefficients(comp: &mut TileComp) -> Result<()> {
    let tc_w = comp.rect.w() as usize;
    for res in &mut comp.resolutions {
        for precinct in &mut res.precincts {
            for (band_idx, band) in res.bands.iter().enumerate() {
                let rects = &precinct.cblk_rects[band_idx];
                let states = &precinct.t2[band_idx].states;
                for (rect, state) in rects.iter().zip(states) {
                    if state.num_passes == 0 || rect.is_empty() {
                        continue;
                    }
                    let w = rect.w() as usize;
                    let h = rect.h() as usize;
                    let numbps = band.mb.saturating_sub(state.missing_msbs);
                    let coeffs =
                        t1::decode_cblk(&state.data, w, h, numbps, band.orient, state.num_passes)?;

                    // place into the quadrant
                    let ox = (band.off_x + (rect.x0 - band.rect.x0)) as usize;
                    let oy = (band.off_y + (rect.y0 - band.rect.y0)) as usize;
                    match &mut comp.buf {
                        Samples::Int(buf) => {
                            for y in 0..h {
                                for x in 0..w {
                                    buf[(oy + y) * tc_w + ox + x] = coeffs[y * w + x];
                                }
                            }
                        }
                        Samples::Real(buf) => {
                            for y in 0..h {
                                for x in 0..w {
                                    let v = coeffs[y * w + x];
                                    // midpoint reconstruction
                                    let f = if v > 0 {
                                        (v as f32 + 0.5) * band.delta
                                    } else if v < 0 {
                                        (v as f32 - 0.5) * band.delta
                                    } else {
                                        0.0
                                    };
                                    buf[(oy + y) * tc_w + ox + x] = f;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Inverse DWT across all resolution levels, in place.
fn synthesize(comp: &mut TileComp) {
    let tc_w = comp.rect.w() as usize;
    for r in 1..=comp.levels {
        let res = &comp.resolutions[r as usize];
        let (w, h) = (res.rect.w() as usize, res.rect.h() as usize);
        let (lw, lh) = (res.prev_rect.w() as usize, res.prev_rect.h() as usize);
        if w == 0 || h == 0 {
            continue;
        }
        match &mut comp.buf {
            Samples::Int(buf) => {
                let mut scratch = vec![0i32; w * h];
                for y in 0..h {
                    scratch[y * w..y * w + w].copy_from_slice(&buf[y * tc_w..y * tc_w + w]);
                }
                super::dwt::synthesize_53(&mut scratch, w, h, lw, lh, res.rect.x0, res.rect.y0);
                for y in 0..h {
                    buf[y * tc_w..y * tc_w + w].copy_from_slice(&scratch[y * w..y * w + w]);
                }
            }
            Samples::Real(buf) => {
                let mut scratch = vec![0f32; w * h];
                for y in 0..h {
                    scratch[y * w..y * w + w].copy_from_slice(&buf[y * tc_w..y * tc_w + w]);
                }
                super::dwt::synthesize_97(&mut scratch, w, h, lw, lh, res.rect.x0, res.rect.y0);
                for y in 0..h {
                    buf[y * tc_w..y * tc_w + w].copy_from_slice(&scratch[y * w..y * w + w]);
                }
            }
        }
    }
}

/// Inverse multiple-component transform over the first three components.
fn inverse_mct(comps: &mut [TileComp], reversible: bool) {
    if comps.len() < 3 {
        return;
    }
    let same_dims = comps[0].rect.w() == comps[1].rect.w()
        && comps[1].rect.w() == comps[2].rect.w()
        && comps[0].rect.h() == comps[1].rect.h()
        && comps[1].rect.h() == comps[2].rect.h();
    if !same_dims {
        warn!("component transform skipped: mismatched component sizes");
        return;
    }

    let n = (comps[0].rect.w() * comps[0].rect.h()) as usize;
    if reversible {
        for i in 0..n {
            let (y, u, v) = match (&comps[0].buf, &comps[1].buf, &comps[2].buf) {
                (Samples::Int(a), Samples::Int(b), Samples::Int(c)) => (a[i], b[i], c[i]),
                _ => return,
            };
            let g = y - ((u + v) >> 2);
            let r = v + g;
            let b = u + g;
            set_int(&mut comps[0].buf, i, r);
            set_int(&mut comps[1].buf, i, g);
            set_int(&mut comps[2].buf, i, b);
        }
    } else {
        for i in 0..n {
            let (y, cb, cr) = match (&comps[0].buf, &comps[1].buf, &comps[2].buf) {
                (Samples::Real(a), Samples::Real(b), Samples::Real(c)) => (a[i], b[i], c[i]),
                _ => return,
            };
            let r = y + 1.402 * cr;
            let g = y - 0.344136 * cb - 0.714136 * cr;
            let b = y + 1.772 * cb;
            set_real(&mut comps[0].buf, i, r);
            set_real(&mut comps[1].buf, i, g);
            set_real(&mut comps[2].buf, i, b);
        }
    }
}

fn set_int(buf: &mut Samples, i: usize, v: i32) {
    if let Samples::Int(b) = buf {
        b[i] = v;
    }
}
fn set_real(buf: &mut Samples, i: usize, v: f32) {
    if let Samples::Real(b) = buf {
        b[i] = v;
    }
}

/// Decodes one tile of the codestream into the full-image component planes.
pub fn decode_tile(
    cs: &Codestream,
    tile_index: u32,
    tile: &TileData,
    planes: &mut [Vec<i32>],
    plane_dims: &[(u32, u32)],
) -> Result<()> {
    let siz = &cs.siz;
    let tiles_across = siz.tiles_across();
    let (ti, tj) = (tile_index % tiles_across, tile_index / tiles_across);

    let tx0 = (siz.tx0 + ti * siz.tw).max(siz.x0);
    let ty0 = (siz.ty0 + tj * siz.th).max(siz.y0);
    let tx1 = (siz.tx0 + (ti + 1) * siz.tw).min(siz.x1);
    let ty1 = (siz.ty0 + (tj + 1) * siz.th).min(siz.y1);

    // tile-level style governs progression and layer count
    let tile_style = cs.style_for(tile, 0);

    let mut comps = Vec::with_capacity(siz.comps.len());
    for (c, sc) in siz.comps.iter().enumerate() {
        let rect = Rect {
            x0: ceil_div(tx0, sc.dx),
            y0: ceil_div(ty0, sc.dy),
            x1: ceil_div(tx1, sc.dx),
            y1: ceil_div(ty1, sc.dy),
        };
        let style = cs.style_for(tile, c);
        let quant = cs.quant_for(tile, c);
        comps.push(build_tile_comp(rect, &style, &quant, sc.prec)?);
    }

    read_packets(&tile.data, &mut comps, &tile_style)?;

    for comp in comps.iter_mut() {
        decode_coefficients(comp)?;
        synthesize(comp);
    }

    if tile_style.mct {
        let reversible = comps[0].reversible;
        inverse_mct(&mut comps, reversible);
    }

    // level shift, clamp, and copy into the image planes
    for ((comp, sc), (plane, &(pw, _ph))) in comps
        .iter()
        .zip(&siz.comps)
        .zip(planes.iter_mut().zip(plane_dims))
    {
        let shift = if sc.signed { 0 } else { 1i32 << (sc.prec - 1) };
        let (lo, hi) = if sc.signed {
            (-(1i32 << (sc.prec - 1)), (1i32 << (sc.prec - 1)) - 1)
        } else {
            (0, (1i32 << sc.prec) - 1)
        };

        // origin of this component's plane on the reference grid
        let px0 = ceil_div(siz.x0, sc.dx);
        let py0 = ceil_div(siz.y0, sc.dy);

        let w = comp.rect.w() as usize;
        for y in 0..comp.rect.h() as usize {
            for x in 0..w {
                let v = match &comp.buf {
                    Samples::Int(b) => b[y * w + x],
                    Samples::Real(b) => b[y * w + x].round() as i32,
                };
                let v = (v + shift).clamp(lo, hi);
                let gx = comp.rect.x0 as usize + x - px0 as usize;
                let gy = comp.rect.y0 as usize + y - py0 as usize;
                plane[gy * pw as usize + gx] = v;
            }
        }
    }
    Ok(())
}
