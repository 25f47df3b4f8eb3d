//! Tier-1: code-block decoding. Three coding passes per bit-plane over the
//! MQ coder - significance propagation, magnitude refinement, cleanup with
//! its four-sample run mode.

use super::mq::{MqContext, MqDecoder};
use crate::error::*;

// context indices
const CTX_ZC: usize = 0; // 0..=8
const CTX_SC: usize = 9; // 9..=13
const CTX_MR: usize = 14; // 14..=16
const CTX_RL: usize = 17;
const CTX_UNI: usize = 18;
pub const NUM_CTX: usize = 19;

pub const BAND_LL: u8 = 0;
pub const BAND_HL: u8 = 1;
pub const BAND_LH: u8 = 2;
pub const BAND_HH: u8 = 3;

pub fn initial_contexts() -> [MqContext; NUM_CTX] {
    let mut ctx = [MqContext::default(); NUM_CTX];
    ctx[CTX_ZC] = MqContext::with_state(4);
    ctx[CTX_RL] = MqContext::with_state(3);
    ctx[CTX_UNI] = MqContext::with_state(46);
    ctx
}

/// Per-sample decoding state shared by the passes.
struct Grid {
    w: usize,
    h: usize,
    sig: Vec<bool>,
    visited: Vec<bool>,
    refined: Vec<bool>,
    negative: Vec<bool>,
    mag: Vec<u32>,
    band: u8,
}

impl Grid {
    fn new(w: usize, h: usize, band: u8) -> Grid {
        let n = w * h;
        Grid {
            w,
            h,
            sig: vec![false; n],
            visited: vec![false; n],
            refined: vec![false; n],
            negative: vec![false; n],
            mag: vec![0; n],
            band,
        }
    }

    #[inline]
    fn sig_at(&self, x: isize, y: isize) -> bool {
        if x < 0 || y < 0 || x >= self.w as isize || y >= self.h as isize {
            return false;
        }
        self.sig[y as usize * self.w + x as usize]
    }

    /// (horizontal, vertical, diagonal) significant-neighbor counts.
    fn neighbor_counts(&self, x: usize, y: usize) -> (u32, u32, u32) {
        let (x, y) = (x as isize, y as isize);
        let h = self.sig_at(x - 1, y) as u32 + self.sig_at(x + 1, y) as u32;
        let v = self.sig_at(x, y - 1) as u32 + self.sig_at(x, y + 1) as u32;
        let d = self.sig_at(x - 1, y - 1) as u32
            + self.sig_at(x + 1, y - 1) as u32
            + self.sig_at(x - 1, y + 1) as u32
            + self.sig_at(x + 1, y + 1) as u32;
        (h, v, d)
    }

    /// Zero-coding context, 0..=8, by band orientation.
    fn zc_context(&self, x: usize, y: usize) -> usize {
        let (mut h, mut v, d) = self.neighbor_counts(x, y);
        match self.band {
            BAND_HL => std::mem::swap(&mut h, &mut v),
            BAND_HH => {
                let hv = h + v;
                return CTX_ZC
                    + match d {
                        0 => match hv {
                            0 => 0,
                            1 => 1,
                            _ => 2,
                        },
                        1 => match hv {
                            0 => 3,
                            1 => 4,
                            _ => 5,
                        },
                        2 => {
                            if hv >= 1 {
                                7
                            } else {
                                6
                            }
                        }
                        _ => 8,
                    };
            }
            _ => {}
        }
        CTX_ZC
            + match h {
                2 => 8,
                1 => {
                    if v >= 1 {
                        7
                    } else if d >= 1 {
                        6
                    } else {
                        5
                    }
                }
                _ => match v {
                    2 => 4,
                    1 => 3,
                    _ => match d {
                        0 => 0,
                        1 => 1,
                        _ => 2,
                    },
                },
            }
    }

    #[inline]
    fn sign_contrib(&self, x: isize, y: isize) -> i32 {
        if x < 0 || y < 0 || x >= self.w as isize || y >= self.h as isize {
            return 0;
        }
        let i = y as usize * self.w + x as usize;
        if !self.sig[i] {
            0
        } else if self.negative[i] {
            -1
        } else {
            1
        }
    }

    /// Sign-coding context and the XOR applied to the decoded bit.
    fn sc_context(&self, x: usize, y: usize) -> (usize, u32) {
        let (x, y) = (x as isize, y as isize);
        let hc = (self.sign_contrib(x - 1, y) + self.sign_contrib(x + 1, y)).clamp(-1, 1);
        let vc = (self.sign_contrib(x, y - 1) + self.sign_contrib(x, y + 1)).clamp(-1, 1);
        match (hc, vc) {
            (1, 1) => (CTX_SC + 4, 0),
            (1, 0) => (CTX_SC + 3, 0),
            (1, -1) => (CTX_SC + 2, 0),
            (0, 1) => (CTX_SC + 1, 0),
            (0, 0) => (CTX_SC, 0),
            (0, -1) => (CTX_SC + 1, 1),
            (-1, 1) => (CTX_SC + 2, 1),
            (-1, 0) => (CTX_SC + 3, 1),
            (-1, -1) => (CTX_SC + 4, 1),
            _ => unreachable!(),
        }
    }

    fn mr_context(&self, x: usize, y: usize) -> usize {
        let i = y * self.w + x;
        if self.refined[i] {
            CTX_MR + 2
        } else {
            let (h, v, d) = self.neighbor_counts(x, y);
            if h + v + d > 0 {
                CTX_MR + 1
            } else {
                CTX_MR
            }
        }
    }
}

/// Decodes a code-block into signed integer coefficients (row major).
/// `numbps` is the number of magnitude bit-planes actually present.
pub fn decode_cblk(
    data: &[u8],
    w: usize,
    h: usize,
    numbps: u32,
    band: u8,
    num_passes: u32,
) -> Result<Vec<i32>> {
    if w == 0 || h == 0 {
        return Ok(Vec::new());
    }
    if w * h > 4096 {
        err!(PdfError::MalformedImage { msg: format!("code-block {}x{}", w, h) });
    }
    let mut grid = Grid::new(w, h, band);
    let mut mq = MqDecoder::new(data);
    let mut ctx = initial_contexts();

    if numbps == 0 || num_passes == 0 {
        return Ok(vec![0; w * h]);
    }

    let mut bp = numbps as i32 - 1;
    // the first pass of the top bit-plane is a cleanup pass
    let mut kind = 2;
    for _ in 0..num_passes {
        if bp < 0 {
            break;
        }
        match kind {
            0 => sig_pass(&mut grid, &mut mq, &mut ctx, bp as u32),
            1 => ref_pass(&mut grid, &mut mq, &mut ctx, bp as u32),
            _ => {
                cleanup_pass(&mut grid, &mut mq, &mut ctx, bp as u32);
                grid.visited.iter_mut().for_each(|v| *v = false);
                bp -= 1;
            }
        }
        kind = (kind + 1) % 3;
    }

    Ok(grid
        .mag
        .iter()
        .zip(&grid.negative)
        .map(|(&m, &neg)| if neg { -(m as i32) } else { m as i32 })
        .collect())
}

fn decode_sign(grid: &mut Grid, mq: &mut MqDecoder, ctx: &mut [MqContext], x: usize, y: usize) {
    let (sc, xor) = grid.sc_context(x, y);
    let bit = mq.decode(&mut ctx[sc]) ^ xor;
    grid.negative[y * grid.w + x] = bit == 1;
}

fn sig_pass(grid: &mut Grid, mq: &mut MqDecoder, ctx: &mut [MqContext], bp: u32) {
    for y0 in (0..grid.h).step_by(4) {
        for x in 0..grid.w {
            for y in y0..(y0 + 4).min(grid.h) {
                let i = y * grid.w + x;
                if grid.sig[i] {
                    continue;
                }
                let zc = grid.zc_context(x, y);
                if zc == CTX_ZC {
                    continue; // no significant neighbor: left for cleanup
                }
                grid.visited[i] = true;
                if mq.decode(&mut ctx[zc]) == 1 {
                    grid.sig[i] = true;
                    grid.mag[i] = 1 << bp;
                    decode_sign(grid, mq, ctx, x, y);
                }
            }
        }
    }
}

fn ref_pass(grid: &mut Grid, mq: &mut MqDecoder, ctx: &mut [MqContext], bp: u32) {
    for y0 in (0..grid.h).step_by(4) {
        for x in 0..grid.w {
            for y in y0..(y0 + 4).min(grid.h) {
                let i = y * grid.w + x;
                if !grid.sig[i] || grid.visited[i] {
                    continue;
                }
                let mr = grid.mr_context(x, y);
                let bit = mq.decode(&mut ctx[mr]);
                grid.mag[i] |= bit << bp;
                grid.refined[i] = true;
            }
        }
    }
}

fn cleanup_pass(grid: &mut Grid, mq: &mut MqDecoder, ctx: &mut [MqContext], bp: u32) {
    for y0 in (0..grid.h).step_by(4) {
        for x in 0..grid.w {
            let mut y = y0;
            let y_end = (y0 + 4).min(grid.h);

            // run mode: a full stripe column, nothing visited or significant,
            // and every context zero
            if y_end - y0 == 4
                && (y0..y_end).all(|yy| {
                    let i = yy * grid.w + x;
                    !grid.sig[i] && !grid.visited[i] && grid.zc_context(x, yy) == CTX_ZC
                })
            {
                if mq.decode(&mut ctx[CTX_RL]) == 0 {
                    continue; // all four stay insignificant
                }
                let r = (mq.decode(&mut ctx[CTX_UNI]) << 1 | mq.decode(&mut ctx[CTX_UNI])) as usize;
                // samples before the run break stay zero
                let yy = y0 + r;
                let i = yy * grid.w + x;
                grid.sig[i] = true;
                grid.mag[i] = 1 << bp;
                decode_sign(grid, mq, ctx, x, yy);
                y = yy + 1;
            }

            for yy in y..y_end {
                let i = yy * grid.w + x;
                if grid.sig[i] || grid.visited[i] {
                    continue;
                }
                let zc = grid.zc_context(x, yy);
                if mq.decode(&mut ctx[zc]) == 1 {
                    grid.sig[i] = true;
                    grid.mag[i] = 1 << bp;
                    decode_sign(grid, mq, ctx, x, yy);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod enc {
    //! Mirror-image encoder used by the tests to fabricate valid bitstreams.

    use super::*;
    use crate::jpx::mq::MqEncoder;

    fn encode_sign(grid: &mut Grid, mq: &mut MqEncoder, ctx: &mut [MqContext], x: usize, y: usize) {
        let (sc, xor) = grid.sc_context(x, y);
        let bit = grid.negative[y * grid.w + x] as u32;
        mq.encode(bit ^ xor, &mut ctx[sc]);
    }

    /// Encodes the full pass sequence for `coeffs`; returns (data, numbps,
    /// num_passes).
    pub fn encode_cblk(coeffs: &[i32], w: usize, h: usize, band: u8) -> (Vec<u8>, u32, u32) {
        assert_eq!(coeffs.len(), w * h);
        let max_mag = coeffs.iter().map(|&c| c.unsigned_abs()).max().unwrap_or(0);
        let numbps = 32 - max_mag.leading_zeros();
        if numbps == 0 {
            return (Vec::new(), 0, 0);
        }

        // the true values, consulted by the passes
        let mags: Vec<u32> = coeffs.iter().map(|&c| c.unsigned_abs()).collect();
        let negs: Vec<bool> = coeffs.iter().map(|&c| c < 0).collect();

        let mut grid = Grid::new(w, h, band);
        grid.negative = negs;
        let mut mq = MqEncoder::new();
        let mut ctx = initial_contexts();

        let num_passes = 3 * numbps - 2;
        let mut bp = numbps as i32 - 1;
        let mut kind = 2;
        for _ in 0..num_passes {
            match kind {
                0 => enc_sig_pass(&mut grid, &mags, &mut mq, &mut ctx, bp as u32),
                1 => enc_ref_pass(&mut grid, &mags, &mut mq, &mut ctx, bp as u32),
                _ => {
                    enc_cleanup_pass(&mut grid, &mags, &mut mq, &mut ctx, bp as u32);
                    grid.visited.iter_mut().for_each(|v| *v = false);
                    bp -= 1;
                }
            }
            kind = (kind + 1) % 3;
        }

        (mq.finish(), numbps, num_passes)
    }

    fn becomes_sig(mags: &[u32], i: usize, bp: u32) -> bool {
        mags[i] >> bp == 1 // this bit-plane holds the most significant 1
    }

    fn enc_sig_pass(grid: &mut Grid, mags: &[u32], mq: &mut MqEncoder, ctx: &mut [MqContext], bp: u32) {
        for y0 in (0..grid.h).step_by(4) {
            for x in 0..grid.w {
                for y in y0..(y0 + 4).min(grid.h) {
                    let i = y * grid.w + x;
                    if grid.sig[i] {
                        continue;
                    }
                    let zc = grid.zc_context(x, y);
                    if zc == CTX_ZC {
                        continue;
                    }
                    grid.visited[i] = true;
                    let sig_now = becomes_sig(mags, i, bp);
                    mq.encode(sig_now as u32, &mut ctx[zc]);
                    if sig_now {
                        grid.sig[i] = true;
                        grid.mag[i] = 1 << bp;
                        encode_sign(grid, mq, ctx, x, y);
                    }
                }
            }
        }
    }

    fn enc_ref_pass(grid: &mut Grid, mags: &[u32], mq: &mut MqEncoder, ctx: &mut [MqContext], bp: u32) {
        for y0 in (0..grid.h).step_by(4) {
            for x in 0..grid.w {
                for y in y0..(y0 + 4).min(grid.h) {
                    let i = y * grid.w + x;
                    if !grid.sig[i] || grid.visited[i] {
                        continue;
                    }
                    let mr = grid.mr_context(x, y);
                    mq.encode(mags[i] >> bp & 1, &mut ctx[mr]);
                    grid.refined[i] = true;
                }
            }
        }
    }

    fn enc_cleanup_pass(grid: &mut Grid, mags: &[u32], mq: &mut MqEncoder, ctx: &mut [MqContext], bp: u32) {
        for y0 in (0..grid.h).step_by(4) {
            for x in 0..grid.w {
                let mut y = y0;
                let y_end = (y0 + 4).min(grid.h);

                if y_end - y0 == 4
                    && (y0..y_end).all(|yy| {
                        let i = yy * grid.w + x;
                        !grid.sig[i] && !grid.visited[i] && grid.zc_context(x, yy) == CTX_ZC
                    })
                {
                    let first = (y0..y_end).find(|&yy| becomes_sig(mags, yy * grid.w + x, bp));
                    match first {
                        None => {
                            mq.encode(0, &mut ctx[CTX_RL]);
                            continue;
                        }
                        Some(yy) => {
                            mq.encode(1, &mut ctx[CTX_RL]);
                            let r = (yy - y0) as u32;
                            mq.encode(r >> 1, &mut ctx[CTX_UNI]);
                            mq.encode(r & 1, &mut ctx[CTX_UNI]);
                            let i = yy * grid.w + x;
                            grid.sig[i] = true;
                            grid.mag[i] = 1 << bp;
                            encode_sign(grid, mq, ctx, x, yy);
                            y = yy + 1;
                        }
                    }
                }

                for yy in y..y_end {
                    let i = yy * grid.w + x;
                    if grid.sig[i] || grid.visited[i] {
                        continue;
                    }
                    let zc = grid.zc_context(x, yy);
                    let sig_now = becomes_sig(mags, i, bp);
                    mq.encode(sig_now as u32, &mut ctx[zc]);
                    if sig_now {
                        grid.sig[i] = true;
                        grid.mag[i] = 1 << bp;
                        encode_sign(grid, mq, ctx, x, yy);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(coeffs: &[i32], w: usize, h: usize, band: u8) {
        let (data, numbps, passes) = enc::encode_cblk(coeffs, w, h, band);
        let decoded = decode_cblk(&data, w, h, numbps, band, passes).unwrap();
        assert_eq!(decoded, coeffs);
    }

    #[test]
    fn all_zero_block() {
        let coeffs = vec![0i32; 16];
        roundtrip(&coeffs, 4, 4, BAND_LL);
    }

    #[test]
    fn single_coefficient() {
        let mut coeffs = vec![0i32; 64];
        coeffs[27] = -5;
        roundtrip(&coeffs, 8, 8, BAND_LL);
    }

    #[test]
    fn dense_blocks_all_bands() {
        let mut state = 0xabcdef01u32;
        let mut coeffs = Vec::with_capacity(32 * 32);
        for _ in 0..32 * 32 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            coeffs.push((state % 255) as i32 - 127);
        }
        for band in [BAND_LL, BAND_HL, BAND_LH, BAND_HH] {
            roundtrip(&coeffs, 32, 32, band);
        }
    }

    #[test]
    fn sparse_block() {
        let mut coeffs = vec![0i32; 16 * 12];
        coeffs[0] = 1000;
        coeffs[100] = -3;
        coeffs[191] = 7;
        roundtrip(&coeffs, 16, 12, BAND_LH);
    }

    #[test]
    fn ragged_height() {
        // stripe of height 3 never enters run mode
        let coeffs: Vec<i32> = (0..21).map(|i| (i % 5) - 2).collect();
        roundtrip(&coeffs, 7, 3, BAND_HH);
    }
}
