#![allow(clippy::many_single_char_names)]

use itertools::Itertools;
use std::borrow::Cow;
use std::io::Read;

use crate::error::*;
use crate::primitive::{Dictionary, PdfStream, Primitive};

/// Decode parameters shared by LZW and Flate.
#[derive(Debug, Clone)]
pub struct LzwFlateParams {
    pub predictor: i32,
    pub n_components: i32,
    pub bits_per_component: i32,
    pub columns: i32,
    pub early_change: i32,
}
impl Default for LzwFlateParams {
    fn default() -> LzwFlateParams {
        LzwFlateParams {
            predictor: 1,
            n_components: 1,
            bits_per_component: 8,
            columns: 1,
            early_change: 1,
        }
    }
}
impl LzwFlateParams {
    fn from_dict(dict: &Dictionary) -> LzwFlateParams {
        let mut params = LzwFlateParams::default();
        let mut get = |key: &str, out: &mut i32| {
            if let Some(Ok(v)) = dict.get(key).map(|p| p.as_int()) {
                *out = v as i32;
            }
        };
        get("Predictor", &mut params.predictor);
        get("Colors", &mut params.n_components);
        get("BitsPerComponent", &mut params.bits_per_component);
        get("Columns", &mut params.columns);
        get("EarlyChange", &mut params.early_change);
        params
    }
}

#[derive(Debug, Clone)]
pub enum StreamFilter {
    AsciiHex,
    Ascii85,
    Lzw(LzwFlateParams),
    Flate(LzwFlateParams),
    RunLength,
    /// Baseline JPEG; decoded by the image layer, passed through here.
    Dct,
    /// JPEG 2000; decoded by the image layer, passed through here.
    Jpx,
    Crypt,
}

impl StreamFilter {
    pub fn from_kind_and_params(kind: &[u8], params: &Dictionary) -> Result<StreamFilter> {
        Ok(match kind {
            b"ASCIIHexDecode" | b"AHx" => StreamFilter::AsciiHex,
            b"ASCII85Decode" | b"A85" => StreamFilter::Ascii85,
            b"LZWDecode" | b"LZW" => StreamFilter::Lzw(LzwFlateParams::from_dict(params)),
            b"FlateDecode" | b"Fl" => StreamFilter::Flate(LzwFlateParams::from_dict(params)),
            b"RunLengthDecode" | b"RL" => StreamFilter::RunLength,
            b"DCTDecode" | b"DCT" => StreamFilter::Dct,
            b"JPXDecode" => StreamFilter::Jpx,
            b"Crypt" => StreamFilter::Crypt,
            ty => {
                return Err(PdfError::UnsupportedFilter {
                    name: String::from_utf8_lossy(ty).into(),
                })
            }
        })
    }

    /// `true` for the image codecs, whose output is pixels rather than bytes.
    pub fn is_image_codec(&self) -> bool {
        matches!(self, StreamFilter::Dct | StreamFilter::Jpx)
    }
}

/// The `/Filter` chain of a stream together with per-filter `/DecodeParms`.
pub fn stream_filters(info: &Dictionary) -> Result<Vec<StreamFilter>> {
    let filters = match info.get("Filter").or_else(|| info.get("F")) {
        None => return Ok(vec![]),
        Some(Primitive::Name(name)) => vec![name.clone()],
        Some(Primitive::Array(arr)) => arr
            .iter()
            .map(|p| p.as_name().cloned())
            .collect::<Result<Vec<_>>>()?,
        Some(p) => {
            return Err(PdfError::UnexpectedPrimitive {
                expected: "Name or Array",
                found: p.get_debug_name(),
            })
        }
    };

    let empty = Dictionary::new();
    let parms_of = |i: usize| -> &Dictionary {
        match info.get("DecodeParms").or_else(|| info.get("DP")) {
            Some(Primitive::Dictionary(d)) if i == 0 => d,
            Some(Primitive::Array(arr)) => match arr.get(i) {
                Some(Primitive::Dictionary(d)) => d,
                _ => &empty,
            },
            _ => &empty,
        }
    };

    filters
        .iter()
        .enumerate()
        .map(|(i, name)| StreamFilter::from_kind_and_params(name.as_bytes(), parms_of(i)))
        .collect()
}

/// Runs the full filter chain of `stream` over its raw bytes. Image codec
/// filters terminate the chain: their payload is returned as-is for the image
/// layer to decode.
pub fn decode_stream(stream: &PdfStream) -> Result<Cow<[u8]>> {
    let filters = t!(stream_filters(&stream.info));
    let mut data = Cow::Borrowed(&stream.raw[..]);
    for filter in &filters {
        if filter.is_image_codec() {
            break;
        }
        data = Cow::Owned(t!(decode(&data, filter)));
    }
    Ok(data)
}

pub fn decode(data: &[u8], filter: &StreamFilter) -> Result<Vec<u8>> {
    match filter {
        StreamFilter::AsciiHex => decode_hex(data),
        StreamFilter::Ascii85 => decode_85(data),
        StreamFilter::Lzw(params) => lzw_decode(data, params),
        StreamFilter::Flate(params) => flate_decode(data, params),
        StreamFilter::RunLength => run_length_decode(data),
        StreamFilter::Dct | StreamFilter::Jpx => Ok(data.to_vec()),
        StreamFilter::Crypt => Ok(data.to_vec()),
    }
}

#[inline]
pub fn decode_nibble(c: u8) -> Option<u8> {
    match c {
        n @ b'0'..=b'9' => Some(n - b'0'),
        a @ b'a'..=b'f' => Some(a - b'a' + 0xa),
        a @ b'A'..=b'F' => Some(a - b'A' + 0xA),
        _ => None,
    }
}

pub fn decode_hex(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2);
    let mut digits = data
        .iter()
        .cloned()
        .take_while(|&b| b != b'>')
        .filter(|&b| !matches!(b, 0 | 9 | 10 | 12 | 13 | 32));
    let mut pos = 0;
    loop {
        let (high, low) = match (digits.next(), digits.next()) {
            (Some(h), Some(l)) => (h, l),
            (Some(h), None) => (h, b'0'), // odd nibble pads with 0
            (None, _) => break,
        };
        match (decode_nibble(high), decode_nibble(low)) {
            (Some(h), Some(l)) => out.push(h << 4 | l),
            _ => return Err(PdfError::HexDecode { pos, bytes: [high, low] }),
        }
        pos += 2;
    }
    Ok(out)
}

#[inline]
fn sym_85(byte: u8) -> Option<u32> {
    match byte {
        b @ 0x21..=0x75 => Some((b - 0x21) as u32),
        _ => None,
    }
}

fn word_85([a, b, c, d, e]: [u8; 5]) -> Option<[u8; 4]> {
    let (a, b, c, d, e) = (sym_85(a)?, sym_85(b)?, sym_85(c)?, sym_85(d)?, sym_85(e)?);
    let q = (((a * 85 + b) * 85 + c) * 85 + d)
        .checked_mul(85)?
        .checked_add(e)?;
    Some(q.to_be_bytes())
}

pub fn decode_85(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity((data.len() + 4) / 5 * 4);

    let mut stream = data
        .iter()
        .cloned()
        .filter(|&b| !matches!(b, b' ' | b'\n' | b'\r' | b'\t' | b'\x0c' | 0));

    let mut symbols = stream.by_ref().take_while(|&b| b != b'~');

    let (tail_len, tail) = loop {
        match symbols.next() {
            Some(b'z') => out.extend_from_slice(&[0; 4]),
            Some(a) => {
                let (b, c, d, e) = match (symbols.next(), symbols.next(), symbols.next(), symbols.next()) {
                    (Some(b), Some(c), Some(d), Some(e)) => (b, c, d, e),
                    (None, _, _, _) => break (1, [a, b'u', b'u', b'u', b'u']),
                    (Some(b), None, _, _) => break (2, [a, b, b'u', b'u', b'u']),
                    (Some(b), Some(c), None, _) => break (3, [a, b, c, b'u', b'u']),
                    (Some(b), Some(c), Some(d), None) => break (4, [a, b, c, d, b'u']),
                };
                out.extend_from_slice(&word_85([a, b, c, d, e]).ok_or(PdfError::Ascii85TailError)?);
            }
            None => break (0, [b'u'; 5]),
        }
    };

    if tail_len == 1 {
        // a single leftover digit has no encoding
        return Err(PdfError::Ascii85TailError);
    }
    if tail_len > 0 {
        let last = word_85(tail).ok_or(PdfError::Ascii85TailError)?;
        out.extend_from_slice(&last[..tail_len - 1]);
    }

    match stream.next() {
        Some(b'>') | None => Ok(out),
        _ => Err(PdfError::Ascii85TailError),
    }
}

pub fn flate_decode(data: &[u8], params: &LzwFlateParams) -> Result<Vec<u8>> {
    let decoded = inflate(data)?;
    unpredict(decoded, params)
}

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match libflate::zlib::Decoder::new(data) {
        Ok(mut decoder) => match decoder.read_to_end(&mut out) {
            Ok(_) => return Ok(out),
            Err(e) => info!("zlib stream error ({}), retrying as raw deflate", e),
        },
        Err(e) => info!("invalid zlib header ({}), retrying as raw deflate", e),
    }
    let mut out = Vec::new();
    let mut decoder = libflate::deflate::Decoder::new(data);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

pub fn lzw_decode(data: &[u8], params: &LzwFlateParams) -> Result<Vec<u8>> {
    use weezl::{decode::Decoder, BitOrder};
    let mut out = vec![];
    let mut decoder = if params.early_change != 0 {
        Decoder::with_tiff_size_switch(BitOrder::Msb, 8)
    } else {
        Decoder::new(BitOrder::Msb, 8)
    };
    decoder
        .into_stream(&mut out)
        .decode_all(data)
        .status
        .map_err(|e| PdfError::Other { msg: format!("lzw: {}", e) })?;
    unpredict(out, params)
}

fn unpredict(data: Vec<u8>, params: &LzwFlateParams) -> Result<Vec<u8>> {
    match params.predictor {
        1 => Ok(data),
        2 => tiff_unpredict(data, params),
        10..=15 => png_unpredict(data, params),
        n => Err(PdfError::IncorrectPredictorType { n: n as u8 }),
    }
}

/// TIFF predictor 2: horizontal differencing, component against the one a
/// pixel to its left.
fn tiff_unpredict(mut data: Vec<u8>, params: &LzwFlateParams) -> Result<Vec<u8>> {
    if params.bits_per_component != 8 {
        return Err(PdfError::UnsupportedFilter {
            name: format!("TIFF predictor with {} bits per component", params.bits_per_component),
        });
    }
    let bpp = params.n_components.max(1) as usize;
    let stride = params.columns.max(1) as usize * bpp;
    for row in data.chunks_mut(stride) {
        for i in bpp..row.len() {
            row[i] = row[i].wrapping_add(row[i - bpp]);
        }
    }
    Ok(data)
}

fn png_unpredict(inp: Vec<u8>, params: &LzwFlateParams) -> Result<Vec<u8>> {
    let bits_per_pixel = (params.n_components.max(1) * params.bits_per_component.max(1)) as usize;
    let bpp = (bits_per_pixel + 7) / 8;
    let stride = (params.columns.max(1) as usize * bits_per_pixel + 7) / 8;

    let rows = inp.len() / (stride + 1);
    let mut out = vec![0; rows * stride];

    let null_row = vec![0; stride];
    let mut in_off = 0;
    let mut out_off = 0;
    let mut last_out_off = 0;

    while in_off + stride < inp.len() {
        let predictor = PredictorType::from_u8(inp[in_off])?;
        in_off += 1; // first byte of each row is the filter type

        let row_in = &inp[in_off..in_off + stride];
        let (prev_row, row_out) = if out_off == 0 {
            (&null_row[..], &mut out[..stride])
        } else {
            let (prev, curr) = out.split_at_mut(out_off);
            (&prev[last_out_off..], &mut curr[..stride])
        };
        unfilter(predictor, bpp, prev_row, row_in, row_out);

        last_out_off = out_off;
        in_off += stride;
        out_off += stride;
    }
    Ok(out)
}

pub fn run_length_decode(data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut c = 0;
    while c < data.len() {
        let length = data[c];
        if length == 128 {
            break; // EOD
        } else if length < 128 {
            // copy the following length+1 bytes literally
            let start = c + 1;
            let end = start + length as usize + 1;
            if end > data.len() {
                return Err(PdfError::EOF);
            }
            buf.extend_from_slice(&data[start..end]);
            c = end;
        } else {
            // repeat the next byte 257-length times
            let b = *data.get(c + 1).ok_or(PdfError::EOF)?;
            buf.extend(std::iter::repeat(b).take(257 - length as usize));
            c += 2;
        }
    }
    Ok(buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PredictorType {
    NoFilter = 0,
    Sub = 1,
    Up = 2,
    Avg = 3,
    Paeth = 4,
}

impl PredictorType {
    pub fn from_u8(n: u8) -> Result<PredictorType> {
        match n {
            0 => Ok(PredictorType::NoFilter),
            1 => Ok(PredictorType::Sub),
            2 => Ok(PredictorType::Up),
            3 => Ok(PredictorType::Avg),
            4 => Ok(PredictorType::Paeth),
            n => Err(PdfError::IncorrectPredictorType { n }),
        }
    }
}

fn filter_paeth(a: u8, b: u8, c: u8) -> u8 {
    let ia = a as i16;
    let ib = b as i16;
    let ic = c as i16;

    let p = ia + ib - ic;
    let pa = (p - ia).abs();
    let pb = (p - ib).abs();
    let pc = (p - ic).abs();

    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

pub fn unfilter(filter: PredictorType, bpp: usize, prev: &[u8], inp: &[u8], out: &mut [u8]) {
    use self::PredictorType::*;
    let len = inp.len();
    debug_assert_eq!(len, out.len());
    debug_assert_eq!(len, prev.len());

    match filter {
        NoFilter => {
            out[..len].copy_from_slice(&inp[..len]);
        }
        Sub => {
            out[..bpp].copy_from_slice(&inp[..bpp]);
            for i in bpp..len {
                out[i] = inp[i].wrapping_add(out[i - bpp]);
            }
        }
        Up => {
            for i in 0..len {
                out[i] = inp[i].wrapping_add(prev[i]);
            }
        }
        Avg => {
            for i in 0..bpp {
                out[i] = inp[i].wrapping_add(prev[i] / 2);
            }
            for i in bpp..len {
                out[i] = inp[i].wrapping_add(((out[i - bpp] as i16 + prev[i] as i16) / 2) as u8);
            }
        }
        Paeth => {
            for i in 0..bpp {
                out[i] = inp[i].wrapping_add(filter_paeth(0, prev[i], 0));
            }
            for i in bpp..len {
                out[i] = inp[i].wrapping_add(filter_paeth(out[i - bpp], prev[i], prev[i - bpp]));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_hex(data: &[u8]) -> Vec<u8> {
        let mut out: Vec<u8> = data.iter().flat_map(|b| format!("{:02x}", b).into_bytes()).collect();
        out.push(b'>');
        out
    }

    fn encode_85(data: &[u8]) -> Vec<u8> {
        fn divmod(n: u32, m: u32) -> (u32, u32) {
            (n / m, n % m)
        }
        let mut buf = Vec::new();
        let mut chunks = data.chunks_exact(4);
        for chunk in chunks.by_ref() {
            let c: [u8; 4] = chunk.try_into().unwrap();
            if c == [0; 4] {
                buf.push(b'z');
                continue;
            }
            let n = u32::from_be_bytes(c);
            let (n, e) = divmod(n, 85);
            let (n, d) = divmod(n, 85);
            let (n, c2) = divmod(n, 85);
            let (a, b) = divmod(n, 85);
            buf.extend([a, b, c2, d, e].map(|v| v as u8 + 0x21));
        }
        let r = chunks.remainder();
        if !r.is_empty() {
            let mut c = [0; 4];
            c[..r.len()].copy_from_slice(r);
            let n = u32::from_be_bytes(c);
            let (n, e) = divmod(n, 85);
            let (n, d) = divmod(n, 85);
            let (n, c2) = divmod(n, 85);
            let (a, b) = divmod(n, 85);
            let full = [a, b, c2, d, e].map(|v| v as u8 + 0x21);
            buf.extend_from_slice(&full[..r.len() + 1]);
        }
        buf.extend_from_slice(b"~>");
        buf
    }

    fn rle_encode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < data.len() {
            let b = data[i];
            let mut run = 1;
            while run < 128 && i + run < data.len() && data[i + run] == b {
                run += 1;
            }
            if run >= 2 {
                out.push((257 - run) as u8);
                out.push(b);
                i += run;
            } else {
                let start = i;
                while i < data.len()
                    && i - start < 128
                    && !(i + 1 < data.len() && data[i + 1] == data[i] && i + 2 < data.len() && data[i + 2] == data[i])
                {
                    i += 1;
                }
                out.push((i - start - 1) as u8);
                out.extend_from_slice(&data[start..i]);
            }
        }
        out.push(128);
        out
    }

    fn pseudo_random(len: usize) -> Vec<u8> {
        let mut state = 0x2545f491u32;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    #[test]
    fn hex_roundtrip() {
        let data = pseudo_random(257);
        assert_eq!(decode_hex(&encode_hex(&data)).unwrap(), data);
    }

    #[test]
    fn hex_odd_nibble() {
        assert_eq!(decode_hex(b"414>").unwrap(), b"A@");
    }

    #[test]
    fn base85_roundtrip() {
        for len in [0usize, 1, 3, 4, 5, 12, 255] {
            let data = pseudo_random(len);
            assert_eq!(decode_85(&encode_85(&data)).unwrap(), data, "len {}", len);
        }
        assert_eq!(
            std::str::from_utf8(&encode_85(b"hello world!")).unwrap(),
            "BOu!rD]j7BEbo80~>"
        );
    }

    #[test]
    fn run_length() {
        let x = run_length_decode(&[254, b'a', 255, b'b', 2, b'c', b'b', b'c', 254, b'a', 128]).unwrap();
        assert_eq!(b"aaabbcbcaaa", x.as_slice());
    }

    #[test]
    fn run_length_roundtrip() {
        let data = b"aaaaaabcdddddddddefffg";
        assert_eq!(run_length_decode(&rle_encode(data)).unwrap(), data);
    }

    #[test]
    fn flate_roundtrip() {
        let data = pseudo_random(4096);
        let compressed = deflate::deflate_bytes_zlib(&data);
        assert_eq!(
            flate_decode(&compressed, &LzwFlateParams::default()).unwrap(),
            data
        );
    }

    #[test]
    fn png_predictor_up() {
        // two rows of 4 bytes, row filter Up
        let raw: Vec<u8> = vec![0, 1, 2, 3, 4, 2, 10, 10, 10, 10];
        let params = LzwFlateParams {
            predictor: 12,
            columns: 4,
            ..Default::default()
        };
        let compressed = deflate::deflate_bytes_zlib(&raw);
        let out = flate_decode(&compressed, &params).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 11, 12, 13, 14]);
    }

    #[test]
    fn tiff_predictor() {
        let raw = vec![10u8, 1, 1, 1];
        let params = LzwFlateParams {
            predictor: 2,
            columns: 4,
            ..Default::default()
        };
        assert_eq!(tiff_unpredict(raw, &params).unwrap(), vec![10, 11, 12, 13]);
    }
}
