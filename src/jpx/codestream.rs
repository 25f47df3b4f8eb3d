//! J2K codestream markers: main header, tile-part headers, and the raw
//! per-tile packet data.

use crate::error::*;
use crate::scan::ByteReader;
use std::collections::HashMap;

pub const MARKER_SOC: u16 = 0xff4f;
pub const MARKER_SOT: u16 = 0xff90;
pub const MARKER_SOD: u16 = 0xff93;
pub const MARKER_EOC: u16 = 0xffd9;
pub const MARKER_SIZ: u16 = 0xff51;
pub const MARKER_COD: u16 = 0xff52;
pub const MARKER_COC: u16 = 0xff53;
pub const MARKER_QCD: u16 = 0xff5c;
pub const MARKER_QCC: u16 = 0xff5d;
pub const MARKER_RGN: u16 = 0xff5e;
pub const MARKER_POC: u16 = 0xff5f;
pub const MARKER_PPM: u16 = 0xff60;
pub const MARKER_PPT: u16 = 0xff61;
pub const MARKER_TLM: u16 = 0xff55;
pub const MARKER_PLM: u16 = 0xff57;
pub const MARKER_PLT: u16 = 0xff58;
pub const MARKER_CRG: u16 = 0xff63;
pub const MARKER_COM: u16 = 0xff64;
pub const MARKER_SOP: u16 = 0xff91;
pub const MARKER_EPH: u16 = 0xff92;

fn malformed(msg: impl Into<String>) -> PdfError {
    PdfError::MalformedImage { msg: msg.into() }
}
fn unsupported(msg: impl Into<String>) -> PdfError {
    PdfError::UnsupportedImage { msg: msg.into() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progression {
    Lrcp,
    Rlcp,
    Rpcl,
    Pcrl,
    Cprl,
}

impl Progression {
    fn from_u8(v: u8) -> Result<Progression> {
        Ok(match v {
            0 => Progression::Lrcp,
            1 => Progression::Rlcp,
            2 => Progression::Rpcl,
            3 => Progression::Pcrl,
            4 => Progression::Cprl,
            v => return Err(malformed(format!("progression order {}", v))),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SizComp {
    pub prec: u8,
    pub signed: bool,
    pub dx: u32,
    pub dy: u32,
}

#[derive(Debug, Clone)]
pub struct SizInfo {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
    pub tx0: u32,
    pub ty0: u32,
    pub tw: u32,
    pub th: u32,
    pub comps: Vec<SizComp>,
}

impl SizInfo {
    pub fn tiles_across(&self) -> u32 {
        (self.x1 - self.tx0 + self.tw - 1) / self.tw
    }
    pub fn tiles_down(&self) -> u32 {
        (self.y1 - self.ty0 + self.th - 1) / self.th
    }
}

#[derive(Debug, Clone)]
pub struct CodingStyle {
    pub progression: Progression,
    pub layers: u32,
    pub mct: bool,
    pub levels: u32,
    /// log2 code-block width/height
    pub xcb: u32,
    pub ycb: u32,
    pub cb_style: u8,
    pub reversible: bool,
    pub use_sop: bool,
    pub use_eph: bool,
    /// log2 precinct (w, h) per resolution, lowest first
    pub precincts: Vec<(u32, u32)>,
}

impl CodingStyle {
    /// Precinct exponents for resolution `r`, defaulting to maximal.
    pub fn precinct_exp(&self, r: u32) -> (u32, u32) {
        self.precincts.get(r as usize).copied().unwrap_or((15, 15))
    }
}

#[derive(Debug, Clone)]
pub enum QuantStyle {
    /// Reversible: exponents only, one per subband.
    None { guard: u32, exps: Vec<u32> },
    /// One (mantissa, exponent) pair, others derived from it.
    Derived { guard: u32, mant: u32, exp: u32 },
    /// One (mantissa, exponent) pair per subband.
    Expounded { guard: u32, steps: Vec<(u32, u32)> },
}

impl QuantStyle {
    pub fn guard_bits(&self) -> u32 {
        match *self {
            QuantStyle::None { guard, .. }
            | QuantStyle::Derived { guard, .. }
            | QuantStyle::Expounded { guard, .. } => guard,
        }
    }
}

#[derive(Default)]
pub struct TileData {
    pub data: Vec<u8>,
    pub cod: Option<CodingStyle>,
    pub qcd: Option<QuantStyle>,
    pub coc: HashMap<usize, CodingStyle>,
    pub qcc: HashMap<usize, QuantStyle>,
}

pub struct Codestream {
    pub siz: SizInfo,
    pub cod: CodingStyle,
    pub qcd: QuantStyle,
    pub coc: HashMap<usize, CodingStyle>,
    pub qcc: HashMap<usize, QuantStyle>,
    pub tiles: Vec<TileData>,
}

impl Codestream {
    pub fn style_for(&self, tile: &TileData, comp: usize) -> CodingStyle {
        tile.coc
            .get(&comp)
            .or(tile.cod.as_ref())
            .or_else(|| self.coc.get(&comp))
            .unwrap_or(&self.cod)
            .clone()
    }
    pub fn quant_for(&self, tile: &TileData, comp: usize) -> QuantStyle {
        tile.qcc
            .get(&comp)
            .or(tile.qcd.as_ref())
            .or_else(|| self.qcc.get(&comp))
            .unwrap_or(&self.qcd)
            .clone()
    }

    pub fn parse(data: &[u8]) -> Result<Codestream> {
        let mut r = ByteReader::new(data);
        if r.u16()? != MARKER_SOC {
            return Err(malformed("missing SOC"));
        }

        let mut siz = None;
        let mut cod = None;
        let mut qcd = None;
        let mut coc = HashMap::new();
        let mut qcc = HashMap::new();

        // main header runs to the first SOT
        loop {
            let marker = r.u16()?;
            match marker {
                MARKER_SIZ => siz = Some(parse_siz(segment(&mut r)?)?),
                MARKER_COD => cod = Some(parse_cod(segment(&mut r)?)?),
                MARKER_QCD => qcd = Some(parse_qcd(segment(&mut r)?)?),
                MARKER_COC => {
                    let siz_ref = siz.as_ref().ok_or_else(|| malformed("COC before SIZ"))?;
                    let (idx, style) = parse_coc(segment(&mut r)?, siz_ref.comps.len())?;
                    coc.insert(idx, style);
                }
                MARKER_QCC => {
                    let siz_ref = siz.as_ref().ok_or_else(|| malformed("QCC before SIZ"))?;
                    let (idx, style) = parse_qcc(segment(&mut r)?, siz_ref.comps.len())?;
                    qcc.insert(idx, style);
                }
                MARKER_PPM => return Err(unsupported("packed packet headers (PPM)")),
                MARKER_POC => {
                    warn!("POC progression changes ignored");
                    segment(&mut r)?;
                }
                MARKER_TLM | MARKER_PLM | MARKER_CRG | MARKER_COM | MARKER_RGN => {
                    segment(&mut r)?;
                }
                MARKER_SOT => break,
                m => return Err(malformed(format!("marker {:04X} in main header", m))),
            }
        }

        let siz = siz.ok_or_else(|| malformed("missing SIZ"))?;
        let cod = cod.ok_or_else(|| malformed("missing COD"))?;
        let qcd = qcd.ok_or_else(|| malformed("missing QCD"))?;

        let num_tiles = (siz.tiles_across() * siz.tiles_down()) as usize;
        if num_tiles == 0 || num_tiles > 65535 {
            return Err(malformed(format!("{} tiles", num_tiles)));
        }
        let mut tiles: Vec<TileData> = (0..num_tiles).map(|_| TileData::default()).collect();

        // r currently sits right after an SOT marker
        loop {
            let sot_start = r.pos() - 2;
            let lsot = r.u16()? as usize;
            if lsot != 10 {
                return Err(malformed("bad Lsot"));
            }
            let isot = r.u16()? as usize;
            let psot = r.u32()? as usize;
            let _tpsot = r.u8()?;
            let _tnsot = r.u8()?;
            if isot >= num_tiles {
                return Err(malformed(format!("tile index {}", isot)));
            }

            // tile-part header up to SOD
            loop {
                let marker = r.u16()?;
                match marker {
                    MARKER_SOD => break,
                    MARKER_COD => tiles[isot].cod = Some(parse_cod(segment(&mut r)?)?),
                    MARKER_QCD => tiles[isot].qcd = Some(parse_qcd(segment(&mut r)?)?),
                    MARKER_COC => {
                        let (idx, style) = parse_coc(segment(&mut r)?, siz.comps.len())?;
                        tiles[isot].coc.insert(idx, style);
                    }
                    MARKER_QCC => {
                        let (idx, style) = parse_qcc(segment(&mut r)?, siz.comps.len())?;
                        tiles[isot].qcc.insert(idx, style);
                    }
                    MARKER_PPT => return Err(unsupported("packed packet headers (PPT)")),
                    MARKER_POC | MARKER_PLT | MARKER_COM => {
                        segment(&mut r)?;
                    }
                    m => return Err(malformed(format!("marker {:04X} in tile-part header", m))),
                }
            }

            // Psot covers SOT through the end of the tile-part data;
            // zero means "to EOC or next SOT"
            let data_end = if psot == 0 {
                find_tile_end(data, r.pos())
            } else {
                sot_start + psot
            };
            if data_end < r.pos() || data_end > data.len() {
                return Err(malformed("tile-part length out of range"));
            }
            tiles[isot].data.extend_from_slice(&data[r.pos()..data_end]);
            r.seek(data_end)?;

            match r.u16() {
                Ok(MARKER_SOT) => continue,
                Ok(MARKER_EOC) | Err(_) => break,
                Ok(m) => return Err(malformed(format!("marker {:04X} after tile-part", m))),
            }
        }

        Ok(Codestream { siz, cod, qcd, coc, qcc, tiles })
    }
}

fn find_tile_end(data: &[u8], from: usize) -> usize {
    let mut i = from;
    while i + 1 < data.len() {
        if data[i] == 0xff && (data[i + 1] == 0x90 || data[i + 1] == 0xd9) {
            return i;
        }
        i += 1;
    }
    data.len()
}

fn segment<'a>(r: &mut ByteReader<'a>) -> Result<&'a [u8]> {
    let len = r.u16()? as usize;
    if len < 2 {
        return Err(malformed("segment length < 2"));
    }
    r.take(len - 2)
}

fn parse_siz(seg: &[u8]) -> Result<SizInfo> {
    let mut r = ByteReader::new(seg);
    let _rsiz = r.u16()?;
    let x1 = r.u32()?;
    let y1 = r.u32()?;
    let x0 = r.u32()?;
    let y0 = r.u32()?;
    let tw = r.u32()?;
    let th = r.u32()?;
    let tx0 = r.u32()?;
    let ty0 = r.u32()?;
    let ncomp = r.u16()? as usize;
    if x1 <= x0 || y1 <= y0 || tw == 0 || th == 0 {
        return Err(malformed("degenerate SIZ geometry"));
    }
    if tx0 > x0 || ty0 > y0 {
        return Err(malformed("tile origin beyond image origin"));
    }
    if ncomp == 0 || ncomp > 16384 {
        return Err(malformed(format!("{} components", ncomp)));
    }
    let mut comps = Vec::with_capacity(ncomp);
    for _ in 0..ncomp {
        let ssiz = r.u8()?;
        let dx = r.u8()? as u32;
        let dy = r.u8()? as u32;
        if dx == 0 || dy == 0 {
            return Err(malformed("zero subsampling factor"));
        }
        let prec = (ssiz & 0x7f) + 1;
        if prec > 31 {
            return Err(unsupported(format!("{}-bit samples", prec)));
        }
        comps.push(SizComp { prec, signed: ssiz & 0x80 != 0, dx, dy });
    }
    Ok(SizInfo { x0, y0, x1, y1, tx0, ty0, tw, th, comps })
}

fn parse_cod(seg: &[u8]) -> Result<CodingStyle> {
    let mut r = ByteReader::new(seg);
    let scod = r.u8()?;
    let progression = Progression::from_u8(r.u8()?)?;
    let layers = r.u16()? as u32;
    if layers == 0 {
        return Err(malformed("zero layers"));
    }
    let mct = r.u8()? != 0;
    let style = parse_spcod(&mut r, scod)?;
    Ok(CodingStyle { progression, layers, mct, ..style })
}

fn parse_coc(seg: &[u8], ncomp: usize) -> Result<(usize, CodingStyle)> {
    let mut r = ByteReader::new(seg);
    let idx = if ncomp < 257 { r.u8()? as usize } else { r.u16()? as usize };
    if idx >= ncomp {
        return Err(malformed(format!("COC component {}", idx)));
    }
    let scoc = r.u8()?;
    let style = parse_spcod(&mut r, scoc)?;
    Ok((idx, style))
}

/// The SPcod/SPcoc tail shared by COD and COC.
fn parse_spcod(r: &mut ByteReader, scod: u8) -> Result<CodingStyle> {
    let levels = r.u8()? as u32;
    if levels > 32 {
        return Err(malformed(format!("{} decomposition levels", levels)));
    }
    let xcb = (r.u8()? & 0xf) as u32 + 2;
    let ycb = (r.u8()? & 0xf) as u32 + 2;
    if xcb > 10 || ycb > 10 || xcb + ycb > 12 {
        return Err(malformed(format!("code-block 2^{}x2^{}", xcb, ycb)));
    }
    let cb_style = r.u8()?;
    if cb_style != 0 {
        return Err(unsupported(format!("code-block style {:02X}", cb_style)));
    }
    let transform = r.u8()?;
    let reversible = match transform {
        0 => false,
        1 => true,
        t => return Err(malformed(format!("wavelet transform {}", t))),
    };
    let mut precincts = Vec::new();
    if scod & 0x01 != 0 {
        for _ in 0..=levels {
            let b = r.u8()?;
            precincts.push(((b & 0xf) as u32, (b >> 4) as u32));
        }
    }
    Ok(CodingStyle {
        progression: Progression::Lrcp,
        layers: 1,
        mct: false,
        levels,
        xcb,
        ycb,
        cb_style,
        reversible,
        use_sop: scod & 0x02 != 0,
        use_eph: scod & 0x04 != 0,
        precincts,
    })
}

fn parse_qcd(seg: &[u8]) -> Result<QuantStyle> {
    let mut r = ByteReader::new(seg);
    let sqcd = r.u8()?;
    let guard = (sqcd >> 5) as u32;
    match sqcd & 0x1f {
        0 => {
            let mut exps = Vec::new();
            while !r.at_end() {
                exps.push((r.u8()? >> 3) as u32);
            }
            Ok(QuantStyle::None { guard, exps })
        }
        1 => {
            let v = r.u16()? as u32;
            Ok(QuantStyle::Derived { guard, mant: v & 0x7ff, exp: v >> 11 })
        }
        2 => {
            let mut steps = Vec::new();
            while !r.at_end() {
                let v = r.u16()? as u32;
                steps.push((v & 0x7ff, v >> 11));
            }
            Ok(QuantStyle::Expounded { guard, steps })
        }
        s => Err(malformed(format!("quantization style {}", s))),
    }
}

fn parse_qcc(seg: &[u8], ncomp: usize) -> Result<(usize, QuantStyle)> {
    let mut r = ByteReader::new(seg);
    let idx = if ncomp < 257 { r.u8()? as usize } else { r.u16()? as usize };
    if idx >= ncomp {
        return Err(malformed(format!("QCC component {}", idx)));
    }
    let rest = r.rest();
    parse_qcd(rest).map(|q| (idx, q))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_soc() {
        assert!(Codestream::parse(b"\x00\x00").is_err());
    }

    #[test]
    fn parses_minimal_main_header() {
        let mut data = vec![0xff, 0x4f]; // SOC
        // SIZ: len 41, rsiz 0, 8x8 image, 8x8 tile, 1 comp 8-bit 1x1
        data.extend_from_slice(&[0xff, 0x51, 0, 41, 0, 0]);
        for v in [8u32, 8, 0, 0, 8, 8, 0, 0] {
            data.extend_from_slice(&v.to_be_bytes());
        }
        data.extend_from_slice(&[0, 1, 7, 1, 1]);
        // COD: len 12, scod 0, LRCP, 1 layer, no mct, 0 levels, cb 64x64, style 0, 5-3
        data.extend_from_slice(&[0xff, 0x52, 0, 12, 0, 0, 0, 1, 0, 0, 4, 4, 0, 1]);
        // QCD: len 4, sqcd 0x40 (2 guard bits, no quant), one exponent
        data.extend_from_slice(&[0xff, 0x5c, 0, 4, 0x40, 8 << 3]);
        // SOT + empty-ish tile: Lsot 10, tile 0, psot = 14 (header+SOD+0 data)
        data.extend_from_slice(&[0xff, 0x90, 0, 10, 0, 0, 0, 0, 0, 14, 0, 1]);
        data.extend_from_slice(&[0xff, 0x93]); // SOD
        data.extend_from_slice(&[0xff, 0xd9]); // EOC

        let cs = Codestream::parse(&data).unwrap();
        assert_eq!(cs.siz.x1, 8);
        assert_eq!(cs.siz.comps.len(), 1);
        assert_eq!(cs.siz.comps[0].prec, 8);
        assert_eq!(cs.cod.levels, 0);
        assert!(cs.cod.reversible);
        assert_eq!(cs.cod.xcb, 6);
        assert!(matches!(cs.qcd, QuantStyle::None { guard: 2, .. }));
        assert_eq!(cs.tiles.len(), 1);
        assert!(cs.tiles[0].data.is_empty());
    }
}
