//! Baseline JPEG decoder: Huffman entropy decode, dequantization, IDCT,
//! chroma upsampling and color conversion.
//!
//! Only sequential DCT with 8-bit precision (SOF0/SOF1) is in scope;
//! progressive and lossless scans are rejected as unsupported.

mod bits;
mod color;
mod huffman;
mod idct;

pub use color::{cmyk_to_rgb, ycbcr_to_rgb, ycck_to_rgb};

use self::bits::BitReader;
use self::huffman::HuffmanTable;
use self::idct::{dequantize_and_idct, ZIGZAG};
use crate::error::*;
use crate::scan::ByteReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JpegColor {
    Gray,
    Rgb,
    YCbCr,
    Cmyk,
    Ycck,
}

/// A fully decoded image: one u8 plane per component, all at full resolution.
pub struct JpegImage {
    pub width: u32,
    pub height: u32,
    pub color: JpegColor,
    pub planes: Vec<Vec<u8>>,
}

impl JpegImage {
    pub fn components(&self) -> usize {
        self.planes.len()
    }

    pub fn decode(data: &[u8]) -> Result<JpegImage> {
        Decoder::new(data).decode()
    }

    /// Packed RGB, w*h*3 bytes.
    pub fn to_rgb(&self) -> Vec<u8> {
        let n = (self.width * self.height) as usize;
        let mut out = Vec::with_capacity(n * 3);
        for i in 0..n {
            out.extend_from_slice(&self.pixel_rgb(i));
        }
        out
    }

    /// Packed RGBA with opaque alpha, w*h*4 bytes.
    pub fn to_rgba(&self) -> Vec<u8> {
        let n = (self.width * self.height) as usize;
        let mut out = Vec::with_capacity(n * 4);
        for i in 0..n {
            out.extend_from_slice(&self.pixel_rgb(i));
            out.push(0xff);
        }
        out
    }

    #[inline]
    fn pixel_rgb(&self, i: usize) -> [u8; 3] {
        match self.color {
            JpegColor::Gray => {
                let g = self.planes[0][i];
                [g, g, g]
            }
            JpegColor::Rgb => [self.planes[0][i], self.planes[1][i], self.planes[2][i]],
            JpegColor::YCbCr => ycbcr_to_rgb(self.planes[0][i], self.planes[1][i], self.planes[2][i]),
            JpegColor::Cmyk => cmyk_to_rgb(
                self.planes[0][i],
                self.planes[1][i],
                self.planes[2][i],
                self.planes[3][i],
            ),
            JpegColor::Ycck => ycck_to_rgb(
                self.planes[0][i],
                self.planes[1][i],
                self.planes[2][i],
                self.planes[3][i],
            ),
        }
    }
}

fn malformed(msg: impl Into<String>) -> PdfError {
    PdfError::MalformedImage { msg: msg.into() }
}

struct Component {
    id: u8,
    h: u32,
    v: u32,
    tq: usize,
    dc_table: usize,
    ac_table: usize,
    // subsampled plane, padded out to whole MCUs
    plane: Vec<u8>,
    plane_w: usize,
}

struct Decoder<'a> {
    data: &'a [u8],
    quant: [Option<[u16; 64]>; 4],
    dc_tables: [Option<HuffmanTable>; 4],
    ac_tables: [Option<HuffmanTable>; 4],
    components: Vec<Component>,
    width: u32,
    height: u32,
    restart_interval: u32,
    adobe_transform: Option<u8>,
    saw_jfif: bool,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Decoder<'a> {
        Decoder {
            data,
            quant: [None, None, None, None],
            dc_tables: [None, None, None, None],
            ac_tables: [None, None, None, None],
            components: Vec::new(),
            width: 0,
            height: 0,
            restart_interval: 0,
            adobe_transform: None,
            saw_jfif: false,
        }
    }

    fn decode(mut self) -> Result<JpegImage> {
        let mut r = ByteReader::new(self.data);
        if r.u16()? != 0xffd8 {
            return Err(malformed("missing SOI"));
        }

        let mut frame_seen = false;
        loop {
            let marker = self.next_marker(&mut r)?;
            match marker {
                0xc0 | 0xc1 => {
                    // SOF0 baseline / SOF1 extended sequential
                    let seg = self.segment(&mut r)?;
                    self.parse_sof(seg)?;
                    frame_seen = true;
                }
                0xc2 => {
                    return Err(PdfError::UnsupportedImage { msg: "progressive JPEG".into() })
                }
                0xc3 | 0xc5..=0xc7 | 0xc9..=0xcb | 0xcd..=0xcf => {
                    return Err(PdfError::UnsupportedImage {
                        msg: format!("JPEG frame type FF{:02X}", marker),
                    })
                }
                0xc4 => {
                    let seg = self.segment(&mut r)?;
                    self.parse_dht(seg)?;
                }
                0xdb => {
                    let seg = self.segment(&mut r)?;
                    self.parse_dqt(seg)?;
                }
                0xdd => {
                    let seg = self.segment(&mut r)?;
                    if seg.len() < 2 {
                        return Err(malformed("short DRI"));
                    }
                    self.restart_interval = ((seg[0] as u32) << 8) | seg[1] as u32;
                }
                0xe0 => {
                    let seg = self.segment(&mut r)?;
                    if seg.starts_with(b"JFIF\0") {
                        self.saw_jfif = true;
                    }
                }
                0xee => {
                    let seg = self.segment(&mut r)?;
                    if seg.starts_with(b"Adobe") && seg.len() >= 12 {
                        self.adobe_transform = Some(seg[11]);
                    }
                }
                0xe1..=0xed | 0xef | 0xfe => {
                    self.segment(&mut r)?;
                }
                0xda => {
                    if !frame_seen {
                        return Err(malformed("SOS before SOF"));
                    }
                    let seg = self.segment(&mut r)?;
                    self.parse_sos(seg)?;
                    let data = self.data;
                    self.decode_scan(&data[r.pos()..])?;
                    break;
                }
                0xd9 => return Err(malformed("EOI before scan data")),
                other => {
                    return Err(malformed(format!("unexpected marker FF{:02X}", other)));
                }
            }
        }

        self.finish()
    }

    /// Skips fill bytes and returns the next marker code.
    fn next_marker(&self, r: &mut ByteReader) -> Result<u8> {
        loop {
            let b = r.u8()?;
            if b != 0xff {
                // tolerate stray bytes between segments
                continue;
            }
            let mut m = r.u8()?;
            while m == 0xff {
                m = r.u8()?;
            }
            if m != 0 {
                return Ok(m);
            }
        }
    }

    fn segment<'r>(&self, r: &mut ByteReader<'r>) -> Result<&'r [u8]> {
        let len = r.u16()? as usize;
        if len < 2 {
            return Err(malformed("segment length < 2"));
        }
        r.take(len - 2)
    }

    fn parse_sof(&mut self, seg: &[u8]) -> Result<()> {
        let mut r = ByteReader::new(seg);
        let precision = r.u8()?;
        if precision != 8 {
            return Err(PdfError::UnsupportedImage {
                msg: format!("{}-bit JPEG precision", precision),
            });
        }
        self.height = r.u16()? as u32;
        self.width = r.u16()? as u32;
        if self.width == 0 || self.height == 0 {
            return Err(malformed("zero image dimension"));
        }
        let ncomp = r.u8()? as usize;
        if !(1..=4).contains(&ncomp) {
            return Err(malformed(format!("{} components", ncomp)));
        }
        for _ in 0..ncomp {
            let id = r.u8()?;
            let hv = r.u8()?;
            let (h, v) = ((hv >> 4) as u32, (hv & 0xf) as u32);
            if !(1..=4).contains(&h) || !(1..=4).contains(&v) {
                return Err(malformed(format!("sampling {}x{}", h, v)));
            }
            let tq = r.u8()? as usize;
            if tq > 3 {
                return Err(malformed("quant table id > 3"));
            }
            self.components.push(Component {
                id,
                h,
                v,
                tq,
                dc_table: 0,
                ac_table: 0,
                plane: Vec::new(),
                plane_w: 0,
            });
        }
        Ok(())
    }

    fn parse_dqt(&mut self, seg: &[u8]) -> Result<()> {
        let mut r = ByteReader::new(seg);
        while !r.at_end() {
            let pq_tq = r.u8()?;
            let (pq, tq) = (pq_tq >> 4, (pq_tq & 0xf) as usize);
            if tq > 3 || pq > 1 {
                return Err(malformed("bad DQT header"));
            }
            let mut table = [0u16; 64];
            for zz in 0..64 {
                let val = if pq == 1 { r.u16()? } else { r.u8()? as u16 };
                table[ZIGZAG[zz] as usize] = val;
            }
            self.quant[tq] = Some(table);
        }
        Ok(())
    }

    fn parse_dht(&mut self, seg: &[u8]) -> Result<()> {
        let mut r = ByteReader::new(seg);
        while !r.at_end() {
            let tc_th = r.u8()?;
            let (tc, th) = (tc_th >> 4, (tc_th & 0xf) as usize);
            if tc > 1 || th > 3 {
                return Err(malformed("bad DHT header"));
            }
            let mut counts = [0u8; 16];
            counts.copy_from_slice(r.take(16)?);
            let total: usize = counts.iter().map(|&c| c as usize).sum();
            let values = r.take(total)?.to_vec();
            let table = HuffmanTable::build(&counts, values)?;
            if tc == 0 {
                self.dc_tables[th] = Some(table);
            } else {
                self.ac_tables[th] = Some(table);
            }
        }
        Ok(())
    }

    fn parse_sos(&mut self, seg: &[u8]) -> Result<()> {
        let mut r = ByteReader::new(seg);
        let ns = r.u8()? as usize;
        if ns != self.components.len() {
            // non-interleaved multi-scan baseline is rare; out of scope
            return Err(PdfError::UnsupportedImage { msg: "multi-scan baseline JPEG".into() });
        }
        for _ in 0..ns {
            let cs = r.u8()?;
            let tables = r.u8()?;
            let comp = self
                .components
                .iter_mut()
                .find(|c| c.id == cs)
                .ok_or_else(|| malformed(format!("scan names unknown component {}", cs)))?;
            comp.dc_table = (tables >> 4) as usize;
            comp.ac_table = (tables & 0xf) as usize;
        }
        // Ss, Se, Ah/Al: fixed for baseline, ignored
        Ok(())
    }

    fn decode_scan(&mut self, data: &[u8]) -> Result<()> {
        let hmax = self.components.iter().map(|c| c.h).max().unwrap();
        let vmax = self.components.iter().map(|c| c.v).max().unwrap();
        let mcu_w = 8 * hmax;
        let mcu_h = 8 * vmax;
        let mcus_x = (self.width + mcu_w - 1) / mcu_w;
        let mcus_y = (self.height + mcu_h - 1) / mcu_h;

        for comp in &mut self.components {
            comp.plane_w = (mcus_x * comp.h * 8) as usize;
            let plane_h = (mcus_y * comp.v * 8) as usize;
            comp.plane = vec![0; comp.plane_w * plane_h];
        }

        let mut reader = BitReader::new(data);
        let mut predictors = vec![0i32; self.components.len()];
        let mut restarts_seen = 0u8;

        for mcu in 0..mcus_x * mcus_y {
            if self.restart_interval > 0 && mcu > 0 && mcu % self.restart_interval == 0 {
                let marker = reader.consume_restart()?;
                if marker != 0xd0 + (restarts_seen & 7) {
                    return Err(malformed(format!(
                        "restart marker FF{:02X} out of sequence",
                        marker
                    )));
                }
                restarts_seen = restarts_seen.wrapping_add(1);
                for p in predictors.iter_mut() {
                    *p = 0;
                }
            }

            let (mcu_x, mcu_y) = (mcu % mcus_x, mcu / mcus_x);
            for (ci, comp) in self.components.iter_mut().enumerate() {
                let dc = self.dc_tables[comp.dc_table]
                    .as_ref()
                    .ok_or_else(|| malformed("missing DC table"))?;
                let ac = self.ac_tables[comp.ac_table]
                    .as_ref()
                    .ok_or_else(|| malformed("missing AC table"))?;
                let quant = self.quant[comp.tq]
                    .as_ref()
                    .ok_or_else(|| malformed("missing quant table"))?;

                for by in 0..comp.v {
                    for bx in 0..comp.h {
                        let mut coeffs = [0i16; 64];
                        decode_block(&mut reader, dc, ac, &mut predictors[ci], &mut coeffs)?;

                        let mut samples = [0u8; 64];
                        dequantize_and_idct(&coeffs, quant, &mut samples);

                        let px = ((mcu_x * comp.h + bx) * 8) as usize;
                        let py = ((mcu_y * comp.v + by) * 8) as usize;
                        for row in 0..8 {
                            let dst = (py + row) * comp.plane_w + px;
                            comp.plane[dst..dst + 8].copy_from_slice(&samples[row * 8..row * 8 + 8]);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Upsample to full resolution by replication and pick the colorspace.
    fn finish(self) -> Result<JpegImage> {
        let hmax = self.components.iter().map(|c| c.h).max().unwrap();
        let vmax = self.components.iter().map(|c| c.v).max().unwrap();
        let (w, h) = (self.width as usize, self.height as usize);

        let mut planes = Vec::with_capacity(self.components.len());
        for comp in &self.components {
            // nominal subsampled size before MCU padding
            let sub_w = ((self.width * comp.h + hmax - 1) / hmax) as usize;
            let sub_h = ((self.height * comp.v + vmax - 1) / vmax) as usize;
            let mut full = vec![0u8; w * h];
            for y in 0..h {
                let sy = (y * comp.v as usize / vmax as usize).min(sub_h - 1);
                let src_row = sy * comp.plane_w;
                for (x, dst) in full[y * w..y * w + w].iter_mut().enumerate() {
                    let sx = (x * comp.h as usize / hmax as usize).min(sub_w - 1);
                    *dst = comp.plane[src_row + sx];
                }
            }
            planes.push(full);
        }

        let color = match self.components.len() {
            1 => JpegColor::Gray,
            3 => match self.adobe_transform {
                Some(0) => JpegColor::Rgb,
                Some(_) => JpegColor::YCbCr,
                // JFIF mandates YCbCr; otherwise component ids may say RGB
                None if self.saw_jfif => JpegColor::YCbCr,
                None => {
                    let ids: Vec<u8> = self.components.iter().map(|c| c.id).collect();
                    if ids == [b'R', b'G', b'B'] {
                        JpegColor::Rgb
                    } else {
                        JpegColor::YCbCr
                    }
                }
            },
            4 => match self.adobe_transform {
                Some(2) => JpegColor::Ycck,
                _ => JpegColor::Cmyk,
            },
            n => return Err(malformed(format!("{} components", n))),
        };

        Ok(JpegImage {
            width: self.width,
            height: self.height,
            color,
            planes,
        })
    }
}

fn decode_block(
    reader: &mut BitReader,
    dc: &HuffmanTable,
    ac: &HuffmanTable,
    predictor: &mut i32,
    coeffs: &mut [i16; 64],
) -> Result<()> {
    // DC: category + difference against the predictor
    let s = dc.decode(reader)?;
    if s > 11 {
        return Err(malformed("DC category > 11"));
    }
    let diff = reader.receive_extend(s);
    *predictor += diff;
    coeffs[0] = *predictor as i16;

    // AC: (run, size) pairs with EOB and ZRL escapes
    let mut k = 1;
    while k < 64 {
        let rs = ac.decode(reader)?;
        let r = rs >> 4;
        let s = rs & 0xf;
        if s == 0 {
            if r == 15 {
                k += 16; // ZRL
                continue;
            }
            break; // EOB
        }
        k += r as usize;
        if k > 63 {
            return Err(malformed("AC run past end of block"));
        }
        coeffs[ZIGZAG[k] as usize] = reader.receive_extend(s) as i16;
        k += 1;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testenc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_progressive() {
        // SOI + SOF2 header stub
        let data = [0xff, 0xd8, 0xff, 0xc2, 0x00, 0x0b, 8, 0, 16, 0, 16, 1, 1, 0x11, 0];
        match JpegImage::decode(&data) {
            Err(PdfError::UnsupportedImage { .. }) => {}
            other => panic!("{:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(JpegImage::decode(b"not a jpeg").is_err());
        // SOS without SOF
        let data = [0xff, 0xd8, 0xff, 0xda, 0x00, 0x02];
        assert!(JpegImage::decode(&data).is_err());
    }

    #[test]
    fn solid_gray_roundtrip() {
        let jpeg = testenc::encode_gray8(16, 16, &[200u8; 256]);
        let img = JpegImage::decode(&jpeg).unwrap();
        assert_eq!((img.width, img.height), (16, 16));
        assert_eq!(img.color, JpegColor::Gray);
        let rgb = img.to_rgb();
        assert_eq!(rgb.len(), 16 * 16 * 3);
        for px in rgb.chunks(3) {
            assert!((px[0] as i32 - 200).abs() <= 2, "{:?}", px);
            assert_eq!(px[0], px[1]);
            assert_eq!(px[1], px[2]);
        }
    }

    #[test]
    fn gradient_gray_roundtrip() {
        let mut samples = Vec::with_capacity(64 * 64);
        for y in 0..64u32 {
            for x in 0..64u32 {
                samples.push(((x * 2 + y * 2) & 0xff) as u8);
            }
        }
        let jpeg = testenc::encode_gray8(64, 64, &samples);
        let img = JpegImage::decode(&jpeg).unwrap();
        let rgb = img.to_rgb();
        // quant table is flat 1s, so decode should be within IDCT error
        for (i, px) in rgb.chunks(3).enumerate() {
            let want = samples[i] as i32;
            assert!((px[0] as i32 - want).abs() <= 2, "pixel {}: {} vs {}", i, px[0], want);
        }
    }

    #[test]
    fn solid_red_ycbcr() {
        // red in YCbCr: Y=76, Cb=85, Cr=255
        let jpeg = testenc::encode_ycbcr_solid(16, 16, [76, 85, 255]);
        let img = JpegImage::decode(&jpeg).unwrap();
        assert_eq!(img.color, JpegColor::YCbCr);
        let rgb = img.to_rgb();
        assert_eq!(rgb.len(), 16 * 16 * 3);
        for px in rgb.chunks(3) {
            assert!(px[0] >= 253, "{:?}", px);
            assert!(px[1] <= 2, "{:?}", px);
            assert!(px[2] <= 2, "{:?}", px);
        }
    }

    #[test]
    fn restart_markers() {
        let samples = [128u8; 16 * 16];
        let jpeg = testenc::encode_gray8_with_dri(16, 16, &samples, 1);
        let img = JpegImage::decode(&jpeg).unwrap();
        for &s in &img.planes[0] {
            assert!((s as i32 - 128).abs() <= 1);
        }
    }
}
