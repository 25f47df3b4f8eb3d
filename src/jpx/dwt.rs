//! Inverse discrete wavelet transform: reversible 5-3 integer lifting and
//! irreversible 9-7 float lifting, one resolution level at a time.

// 9-7 synthesis constants
const ALPHA: f32 = 1.586_134_3;
const BETA: f32 = 0.052_980_118;
const GAMMA: f32 = 0.882_911_07;
const DELTA: f32 = 0.443_506_85;
const K: f32 = 1.230_174_1;
const TWO_INV_K: f32 = 1.625_732_4;

/// One interleaved line: `sn` low coefficients at even positions, `dn` high
/// at odd (swapped when `cas` is 1).
///
/// Index clamping implements symmetric extension at the borders.
struct Line<'a, T> {
    a: &'a mut [T],
    sn: isize,
    dn: isize,
}

impl<'a, T: Copy> Line<'a, T> {
    #[inline]
    fn s(&self, i: isize) -> T {
        self.a[(2 * i.clamp(0, self.sn - 1)) as usize]
    }
    #[inline]
    fn d(&self, i: isize) -> T {
        self.a[(1 + 2 * i.clamp(0, self.dn - 1)) as usize]
    }
    #[inline]
    fn set_s(&mut self, i: isize, v: T) {
        self.a[(2 * i) as usize] = v;
    }
    #[inline]
    fn set_d(&mut self, i: isize, v: T) {
        self.a[(1 + 2 * i) as usize] = v;
    }
}

/// In-place 1D inverse 5-3 over an interleaved line.
pub fn inverse_53(a: &mut [i32], dn: usize, sn: usize, cas: usize) {
    let (dn, sn) = (dn as isize, sn as isize);
    if cas == 0 {
        if dn > 0 || sn > 1 {
            let mut line = Line { a, sn, dn };
            for i in 0..sn {
                let v = line.s(i) - ((line.d(i - 1) + line.d(i) + 2) >> 2);
                line.set_s(i, v);
            }
            for i in 0..dn {
                let v = line.d(i) + ((line.s(i) + line.s(i + 1)) >> 1);
                line.set_d(i, v);
            }
        }
    } else if sn == 0 && dn == 1 {
        // a lone high coefficient carries the sample doubled
        a[0] /= 2;
    } else {
        // roles swap: even positions hold high, odd hold low
        let mut line = Line { a, sn: dn, dn: sn };
        for i in 0..sn {
            let v = line.d(i) - ((line.s(i) + line.s(i + 1) + 2) >> 2);
            line.set_d(i, v);
        }
        for i in 0..dn {
            let v = line.s(i) + ((line.d(i) + line.d(i - 1)) >> 1);
            line.set_s(i, v);
        }
    }
}

/// In-place 1D inverse 9-7 over an interleaved line.
pub fn inverse_97(a: &mut [f32], dn: usize, sn: usize, cas: usize) {
    let (dn, sn) = (dn as isize, sn as isize);
    if cas == 0 {
        if !(dn > 0 || sn > 1) {
            return;
        }
        let mut line = Line { a, sn, dn };
        for i in 0..sn {
            let v = line.s(i) * K;
            line.set_s(i, v);
        }
        for i in 0..dn {
            let v = line.d(i) * TWO_INV_K;
            line.set_d(i, v);
        }
        for i in 0..sn {
            let v = line.s(i) - DELTA * (line.d(i - 1) + line.d(i));
            line.set_s(i, v);
        }
        for i in 0..dn {
            let v = line.d(i) - GAMMA * (line.s(i) + line.s(i + 1));
            line.set_d(i, v);
        }
        for i in 0..sn {
            let v = line.s(i) - BETA * (line.d(i - 1) + line.d(i));
            line.set_s(i, v);
        }
        for i in 0..dn {
            let v = line.d(i) - ALPHA * (line.s(i) + line.s(i + 1));
            line.set_d(i, v);
        }
    } else {
        if sn == 0 && dn <= 1 {
            return;
        }
        // even slots hold the high coefficients, odd slots the low
        let mut line = Line { a, sn: dn, dn: sn };
        for i in 0..sn {
            let v = line.d(i) * K;
            line.set_d(i, v);
        }
        for i in 0..dn {
            let v = line.s(i) * TWO_INV_K;
            line.set_s(i, v);
        }
        for i in 0..sn {
            let v = line.d(i) - DELTA * (line.s(i) + line.s(i + 1));
            line.set_d(i, v);
        }
        for i in 0..dn {
            let v = line.s(i) - GAMMA * (line.d(i) + line.d(i - 1));
            line.set_s(i, v);
        }
        for i in 0..sn {
            let v = line.d(i) - BETA * (line.s(i) + line.s(i + 1));
            line.set_d(i, v);
        }
        for i in 0..dn {
            let v = line.s(i) - ALPHA * (line.d(i) + line.d(i - 1));
            line.set_s(i, v);
        }
    }
}

/// Interleaves a split buffer (low part then high part) into lifting order.
fn interleave<T: Copy>(src_low: &[T], src_high: &[T], dst: &mut [T], cas: usize) {
    let mut i = cas;
    for &v in src_low {
        dst[i] = v;
        i += 2;
    }
    let mut i = 1 - cas;
    for &v in src_high {
        dst[i] = v;
        i += 2;
    }
}

/// One 2D synthesis level: `data` is `w x h` with the low-pass image in the
/// top-left `lw x lh` corner and the three band quadrants around it; the
/// result is the full `w x h` image at the next resolution.
///
/// `x0`/`y0` are the absolute grid origins of the target resolution; their
/// parity picks the lifting phase.
pub fn synthesize_53(data: &mut [i32], w: usize, h: usize, lw: usize, lh: usize, x0: u32, y0: u32) {
    let cas_h = (x0 % 2) as usize;
    let cas_v = (y0 % 2) as usize;
    let (hw, hh) = (w - lw, h - lh);

    // horizontal: each row interleaves lw low + hw high
    let mut row = vec![0i32; w.max(h)];
    for y in 0..h {
        let line = &data[y * w..y * w + w];
        interleave(&line[..lw], &line[lw..], &mut row[..w], cas_h);
        inverse_53(&mut row[..w], hw, lw, cas_h);
        data[y * w..y * w + w].copy_from_slice(&row[..w]);
    }

    // vertical: each column interleaves lh low + hh high
    let mut col_low = vec![0i32; lh];
    let mut col_high = vec![0i32; hh];
    for x in 0..w {
        for y in 0..lh {
            col_low[y] = data[y * w + x];
        }
        for y in 0..hh {
            col_high[y] = data[(lh + y) * w + x];
        }
        interleave(&col_low, &col_high, &mut row[..h], cas_v);
        inverse_53(&mut row[..h], hh, lh, cas_v);
        for y in 0..h {
            data[y * w + x] = row[y];
        }
    }
}

pub fn synthesize_97(data: &mut [f32], w: usize, h: usize, lw: usize, lh: usize, x0: u32, y0: u32) {
    let cas_h = (x0 % 2) as usize;
    let cas_v = (y0 % 2) as usize;
    let (hw, hh) = (w - lw, h - lh);

    let mut row = vec![0f32; w.max(h)];
    for y in 0..h {
        let line = &data[y * w..y * w + w];
        interleave(&line[..lw], &line[lw..], &mut row[..w], cas_h);
        inverse_97(&mut row[..w], hw, lw, cas_h);
        data[y * w..y * w + w].copy_from_slice(&row[..w]);
    }

    let mut col_low = vec![0f32; lh];
    let mut col_high = vec![0f32; hh];
    for x in 0..w {
        for y in 0..lh {
            col_low[y] = data[y * w + x];
        }
        for y in 0..hh {
            col_high[y] = data[(lh + y) * w + x];
        }
        interleave(&col_low, &col_high, &mut row[..h], cas_v);
        inverse_97(&mut row[..h], hh, lh, cas_v);
        for y in 0..h {
            data[y * w + x] = row[y];
        }
    }
}
