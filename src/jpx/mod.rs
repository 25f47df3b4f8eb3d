//! JPEG 2000 decoder (Part-1 codestreams, optionally in JP2 wrapping).

mod codestream;
mod dwt;
mod mq;
mod t1;
mod t2;
mod tile;

pub use codestream::Progression;

use crate::error::*;
use crate::scan::ByteReader;
use codestream::Codestream;

fn malformed(msg: impl Into<String>) -> PdfError {
    PdfError::MalformedImage { msg: msg.into() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JpxColor {
    Unknown,
    Gray,
    Srgb,
    Sycc,
}

pub struct JpxComponent {
    pub dx: u32,
    pub dy: u32,
    pub prec: u8,
    pub signed: bool,
    pub w: u32,
    pub h: u32,
    pub data: Vec<i32>,
}

/// A decoded image on its reference grid.
pub struct JpxImage {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
    pub color: JpxColor,
    pub components: Vec<JpxComponent>,
}

impl JpxImage {
    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }
    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    pub fn decode(data: &[u8]) -> Result<JpxImage> {
        if data.starts_with(&[0xff, 0x4f, 0xff, 0x51]) {
            return Self::decode_codestream(data, JpxColor::Unknown);
        }
        if data.len() >= 12 && &data[4..8] == b"jP  " {
            return Self::decode_jp2(data);
        }
        Err(PdfError::NotFormat)
    }

    fn decode_jp2(data: &[u8]) -> Result<JpxImage> {
        let mut color = JpxColor::Unknown;
        let mut codestream: Option<&[u8]> = None;

        let mut r = ByteReader::new(data);
        while r.remaining() >= 8 {
            let (tbox, payload) = read_box(&mut r)?;
            match &tbox {
                b"jP  " => {
                    if payload != &[0x0d, 0x0a, 0x87, 0x0a][..] {
                        return Err(malformed("bad JP2 signature box"));
                    }
                }
                b"ftyp" => {}
                b"jp2h" => {
                    let mut h = ByteReader::new(payload);
                    while h.remaining() >= 8 {
                        let (sub, sub_payload) = read_box(&mut h)?;
                        match &sub {
                            b"colr" => {
                                let mut c = ByteReader::new(sub_payload);
                                let meth = c.u8()?;
                                let _prec = c.u8()?;
                                let _approx = c.u8()?;
                                if meth == 1 {
                                    color = match c.u32()? {
                                        16 => JpxColor::Srgb,
                                        17 => JpxColor::Gray,
                                        18 => JpxColor::Sycc,
                                        cs => {
                                            warn!("unknown enumerated colorspace {}", cs);
                                            JpxColor::Unknown
                                        }
                                    };
                                } else {
                                    warn!("ICC colorspace profiles not supported, ignoring");
                                }
                            }
                            b"pclr" | b"cmap" => {
                                return Err(PdfError::UnsupportedImage {
                                    msg: "palette-based JP2 color".into(),
                                });
                            }
                            b"ihdr" | b"cdef" | b"res " => {}
                            _ => {}
                        }
                    }
                }
                b"jp2c" => {
                    codestream = Some(payload);
                    break;
                }
                _ => {}
            }
        }

        let codestream = codestream.ok_or_else(|| malformed("no jp2c box"))?;
        Self::decode_codestream(codestream, color)
    }

    fn decode_codestream(data: &[u8], color_hint: JpxColor) -> Result<JpxImage> {
        let cs = Codestream::parse(data)?;
        let siz = &cs.siz;

        let mut components = Vec::with_capacity(siz.comps.len());
        let mut planes = Vec::with_capacity(siz.comps.len());
        let mut plane_dims = Vec::with_capacity(siz.comps.len());
        for sc in &siz.comps {
            let w = ceil_div(siz.x1, sc.dx) - ceil_div(siz.x0, sc.dx);
            let h = ceil_div(siz.y1, sc.dy) - ceil_div(siz.y0, sc.dy);
            planes.push(vec![0i32; (w * h) as usize]);
            plane_dims.push((w, h));
            components.push(JpxComponent {
                dx: sc.dx,
                dy: sc.dy,
                prec: sc.prec,
                signed: sc.signed,
                w,
                h,
                data: Vec::new(),
            });
        }

        for (i, tiledata) in cs.tiles.iter().enumerate() {
            tile::decode_tile(&cs, i as u32, tiledata, &mut planes, &plane_dims)?;
        }

        for (comp, plane) in components.iter_mut().zip(planes) {
            comp.data = plane;
        }

        let color = if color_hint != JpxColor::Unknown {
            color_hint
        } else {
            match components.len() {
                1 | 2 => JpxColor::Gray,
                _ => JpxColor::Srgb,
            }
        };

        Ok(JpxImage {
            x0: siz.x0,
            y0: siz.y0,
            x1: siz.x1,
            y1: siz.y1,
            color,
            components,
        })
    }

    /// Sample of component `c` at image pixel (x, y), scaled to 8 bits.
    fn sample8(&self, c: usize, x: u32, y: u32) -> u8 {
        let comp = &self.components[c];
        let sx = (x * comp.w / self.width().max(1)).min(comp.w.saturating_sub(1));
        let sy = (y * comp.h / self.height().max(1)).min(comp.h.saturating_sub(1));
        let mut v = comp.data[(sy * comp.w + sx) as usize];
        if comp.signed {
            v += 1 << (comp.prec - 1);
        }
        let v = match comp.prec.cmp(&8) {
            std::cmp::Ordering::Greater => v >> (comp.prec - 8),
            std::cmp::Ordering::Less => v << (8 - comp.prec),
            std::cmp::Ordering::Equal => v,
        };
        v.clamp(0, 255) as u8
    }

    fn pixel_rgb(&self, x: u32, y: u32) -> [u8; 3] {
        match (self.color, self.components.len()) {
            (_, 0) => [0, 0, 0],
            (JpxColor::Gray, _) | (_, 1) | (_, 2) => {
                let g = self.sample8(0, x, y);
                [g, g, g]
            }
            (JpxColor::Sycc, _) => {
                let y8 = self.sample8(0, x, y);
                let cb = self.sample8(1, x, y);
                let cr = self.sample8(2, x, y);
                crate::jpeg::ycbcr_to_rgb(y8, cb, cr)
            }
            _ => [self.sample8(0, x, y), self.sample8(1, x, y), self.sample8(2, x, y)],
        }
    }

    /// Packed RGB, w*h*3 bytes.
    pub fn to_rgb(&self) -> Vec<u8> {
        let (w, h) = (self.width(), self.height());
        let mut out = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                out.extend_from_slice(&self.pixel_rgb(x, y));
            }
        }
        out
    }

    /// Packed RGBA with opaque alpha, w*h*4 bytes.
    pub fn to_rgba(&self) -> Vec<u8> {
        let (w, h) = (self.width(), self.height());
        let mut out = Vec::with_capacity((w * h * 4) as usize);
        for y in 0..h {
            for x in 0..w {
                out.extend_from_slice(&self.pixel_rgb(x, y));
                out.push(0xff);
            }
        }
        out
    }
}

#[inline]
fn ceil_div(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// Reads one box; handles the 64-bit extended length form.
fn read_box<'a>(r: &mut ByteReader<'a>) -> Result<([u8; 4], &'a [u8])> {
    let start = r.pos();
    let lbox = r.u32()? as u64;
    let mut tbox = [0u8; 4];
    tbox.copy_from_slice(r.take(4)?);
    let payload_len = match lbox {
        0 => r.remaining() as u64,
        1 => {
            let xl = (r.u32()? as u64) << 32 | r.u32()? as u64;
            if xl < 16 {
                return Err(malformed("bad XLBox length"));
            }
            xl - 16
        }
        l if l < 8 => return Err(malformed("bad box length")),
        l => l - (r.pos() - start) as u64,
    };
    if payload_len > r.remaining() as u64 {
        return Err(malformed("box length past end of data"));
    }
    Ok((tbox, r.take(payload_len as usize)?))
}

#[cfg(test)]
pub(crate) mod testenc {
    //! A tiny reversible J2K encoder: one tile, one layer, LRCP, used to
    //! fabricate conformant codestreams for the decoder tests.

    use super::t1;
    use super::t2::BioWriter;

    const GUARD_BITS: u32 = 2;
    const LL_EXP: u32 = 8;

    pub struct Plane<'a> {
        pub w: u32,
        pub h: u32,
        /// absolute band origin parity handling assumes (0, 0)
        pub coeffs: &'a [i32],
        pub orient: u8,
    }

    /// Encodes one packet containing the given code-blocks (one per band in
    /// order), all freshly included in layer 0.
    pub fn encode_packet(blocks: &[Plane]) -> Vec<u8> {
        let mut w = BioWriter::new();
        w.write_bit(1); // packet present

        let mut bodies = Vec::new();
        for b in blocks {
            let (data, numbps, passes) = t1::enc::encode_cblk(b.coeffs, b.w as usize, b.h as usize, b.orient);
            let mb = GUARD_BITS + band_exp(b.orient) - 1;
            assert!(numbps <= mb, "samples exceed the coded dynamic range");
            let zbp = mb - numbps;

            // inclusion tag tree, single leaf with value 0: one 1-bit
            w.write_bit(1);
            // zero bit-planes: unary zeros, then a 1
            for _ in 0..zbp {
                w.write_bit(0);
            }
            w.write_bit(1);
            // pass count
            write_numpasses(&mut w, passes);
            // Lblock increments so the length fits
            let lbits = if data.is_empty() { 1 } else { 32 - (data.len() as u32).leading_zeros() };
            let base = 3 + floor_log2(passes);
            let incr = lbits.saturating_sub(base);
            for _ in 0..incr {
                w.write_bit(1);
            }
            w.write_bit(0);
            w.write_bits(data.len() as u32, base + incr);
            bodies.push(data);
        }

        let mut out = w.finish();
        for body in bodies {
            out.extend_from_slice(&body);
        }
        out
    }

    pub fn empty_packet() -> Vec<u8> {
        let mut w = BioWriter::new();
        w.write_bit(0);
        w.finish()
    }

    fn floor_log2(n: u32) -> u32 {
        31 - n.leading_zeros()
    }

    fn band_exp(orient: u8) -> u32 {
        // matches the QCD written by codestream(): LL_EXP + band gain
        LL_EXP + [0u32, 1, 1, 2][orient as usize]
    }

    fn write_numpasses(w: &mut BioWriter, n: u32) {
        match n {
            1 => w.write_bit(0),
            2 => w.write_bits(0b10, 2),
            3..=5 => {
                w.write_bits(0b11, 2);
                w.write_bits(n - 3, 2);
            }
            6..=36 => {
                w.write_bits(0b1111, 4);
                w.write_bits(n - 6, 5);
            }
            _ => {
                w.write_bits(0b1111_11111, 9);
                w.write_bits(n - 37, 7);
            }
        }
    }

    /// Wraps packets into a complete single-tile reversible codestream.
    pub fn codestream(size: u32, levels: u8, packets: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![0xff, 0x4f]; // SOC

        // SIZ
        let mut siz = Vec::new();
        siz.extend_from_slice(&0u16.to_be_bytes()); // Rsiz
        for v in [size, size, 0, 0, size, size, 0, 0] {
            siz.extend_from_slice(&v.to_be_bytes());
        }
        siz.extend_from_slice(&1u16.to_be_bytes());
        siz.extend_from_slice(&[7, 1, 1]); // 8-bit unsigned, 1x1
        push_segment(&mut out, 0xff51, &siz);

        // COD: LRCP, 1 layer, no MCT, 64x64 code-blocks, 5-3
        push_segment(&mut out, 0xff52, &[0, 0, 0, 1, 0, levels, 4, 4, 0, 1]);

        // QCD: reversible, 2 guard bits, exponents per subband
        let mut qcd = vec![(GUARD_BITS as u8) << 5];
        qcd.push((LL_EXP as u8) << 3);
        for _ in 0..levels {
            for orient in [1u8, 2, 3] {
                qcd.push((band_exp(orient) as u8) << 3);
            }
        }
        push_segment(&mut out, 0xff5c, &qcd);

        // SOT + SOD + packets
        let body_len: usize = packets.iter().map(|p| p.len()).sum();
        let psot = 12 + 2 + body_len as u32;
        out.extend_from_slice(&[0xff, 0x90]);
        out.extend_from_slice(&10u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&psot.to_be_bytes());
        out.extend_from_slice(&[0, 1]);
        out.extend_from_slice(&[0xff, 0x93]);
        for p in packets {
            out.extend_from_slice(p);
        }
        out.extend_from_slice(&[0xff, 0xd9]); // EOC
        out
    }

    fn push_segment(out: &mut Vec<u8>, marker: u16, payload: &[u8]) {
        out.extend_from_slice(&marker.to_be_bytes());
        out.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
        out.extend_from_slice(payload);
    }

    /// Minimal JP2 wrapping around a codestream.
    pub fn wrap_jp2(codestream: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let push_box = |out: &mut Vec<u8>, t: &[u8; 4], payload: &[u8]| {
            out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
            out.extend_from_slice(t);
            out.extend_from_slice(payload);
        };
        push_box(&mut out, b"jP  ", &[0x0d, 0x0a, 0x87, 0x0a]);
        let mut ftyp = Vec::new();
        ftyp.extend_from_slice(b"jp2 ");
        ftyp.extend_from_slice(&0u32.to_be_bytes());
        ftyp.extend_from_slice(b"jp2 ");
        push_box(&mut out, b"ftyp", &ftyp);
        let mut jp2h = Vec::new();
        // ihdr: h, w, nc, bpc, compression 7, unk colorspace, no ipr
        let mut ihdr = Vec::new();
        ihdr.extend_from_slice(&32u32.to_be_bytes());
        ihdr.extend_from_slice(&32u32.to_be_bytes());
        ihdr.extend_from_slice(&1u16.to_be_bytes());
        ihdr.extend_from_slice(&[7, 7, 0, 0]);
        push_box(&mut jp2h, b"ihdr", &ihdr);
        let mut colr = vec![1, 0, 0];
        colr.extend_from_slice(&17u32.to_be_bytes());
        push_box(&mut jp2h, b"colr", &colr);
        push_box(&mut out, b"jp2h", &jp2h);
        push_box(&mut out, b"jp2c", codestream);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 32x32 grayscale ramp, value = x + y, through the reversible path.
    fn ramp_codestream() -> (Vec<u8>, Vec<i32>) {
        let mut samples = Vec::with_capacity(32 * 32);
        for y in 0..32i32 {
            for x in 0..32i32 {
                samples.push(x + y);
            }
        }
        // the T1 coefficients are the level-shifted samples
        let coeffs: Vec<i32> = samples.iter().map(|&s| s - 128).collect();
        let packet = testenc::encode_packet(&[testenc::Plane {
            w: 32,
            h: 32,
            coeffs: &coeffs,
            orient: 0,
        }]);
        (testenc::codestream(32, 0, &[packet]), samples)
    }

    #[test]
    fn reversible_ramp_bit_exact() {
        let (data, samples) = ramp_codestream();
        let img = JpxImage::decode(&data).unwrap();
        assert_eq!((img.width(), img.height()), (32, 32));
        assert_eq!(img.components.len(), 1);
        assert_eq!(img.components[0].prec, 8);
        assert_eq!(img.components[0].data, samples);
    }

    #[test]
    fn jp2_wrapped_ramp() {
        let (data, samples) = ramp_codestream();
        let jp2 = testenc::wrap_jp2(&data);
        let img = JpxImage::decode(&jp2).unwrap();
        assert_eq!(img.color, JpxColor::Gray);
        assert_eq!(img.components[0].data, samples);
        let rgb = img.to_rgb();
        assert_eq!(rgb.len(), 32 * 32 * 3);
        assert_eq!(&rgb[..3], &[0, 0, 0]);
        assert_eq!(rgb[3], 1);
    }

    #[test]
    fn one_level_synthesis_constant() {
        // levels=1: a constant LL and empty detail packet must synthesize a
        // constant image
        let coeffs = vec![42i32; 16 * 16];
        let p0 = testenc::encode_packet(&[testenc::Plane {
            w: 16,
            h: 16,
            coeffs: &coeffs,
            orient: 0,
        }]);
        let p1 = testenc::empty_packet();
        let data = testenc::codestream(32, 1, &[p0, p1]);
        let img = JpxImage::decode(&data).unwrap();
        assert!(img.components[0].data.iter().all(|&v| v == 42 + 128));
    }

    #[test]
    fn rejects_garbage() {
        assert!(JpxImage::decode(b"not jpeg 2000 at all").is_err());
    }

    #[test]
    fn to_rgba_has_alpha() {
        let (data, _) = ramp_codestream();
        let img = JpxImage::decode(&data).unwrap();
        let rgba = img.to_rgba();
        assert_eq!(rgba.len(), 32 * 32 * 4);
        assert!(rgba.chunks(4).all(|px| px[3] == 0xff));
    }
}
