//! Canonical Huffman tables from DHT segments, with an 8-bit lookahead table
//! for the common case.

use super::bits::BitReader;
use crate::error::*;

pub const LOOKUP_BITS: u8 = 8;

pub struct HuffmanTable {
    /// lookahead: index by the next 8 bits, get (symbol, code length); length
    /// 0 marks a code longer than 8 bits.
    lookup: Vec<(u8, u8)>,
    /// for the slow path: smallest code of each length, 16-bit left-aligned
    maxcode: [i32; 18],
    /// value index offset per code length
    val_offset: [i32; 17],
    values: Vec<u8>,
}

impl HuffmanTable {
    /// `counts`: number of codes of length 1..=16. `values` in code order.
    pub fn build(counts: &[u8; 16], values: Vec<u8>) -> Result<HuffmanTable> {
        let total: usize = counts.iter().map(|&c| c as usize).sum();
        if total != values.len() || total > 256 {
            return Err(PdfError::MalformedImage { msg: "bad Huffman table".into() });
        }

        // generate canonical code for each symbol
        let mut codes = Vec::with_capacity(total);
        let mut code: u32 = 0;
        for (i, &count) in counts.iter().enumerate() {
            let len = i as u8 + 1;
            for _ in 0..count {
                codes.push((code, len));
                code += 1;
            }
            code <<= 1;
        }

        let mut lookup = vec![(0u8, 0u8); 1 << LOOKUP_BITS];
        for (&(code, len), &value) in codes.iter().zip(&values) {
            if len <= LOOKUP_BITS {
                // every padding of this code up to LOOKUP_BITS hits it
                let shift = LOOKUP_BITS - len;
                let base = (code << shift) as usize;
                for slot in &mut lookup[base..base + (1 << shift)] {
                    *slot = (value, len);
                }
            }
        }

        // slow path tables in the stb_image style: maxcode[l] holds one past
        // the largest code of length l, left-aligned to 16 bits
        let mut maxcode = [0i32; 18];
        let mut val_offset = [0i32; 17];
        let mut code: i32 = 0;
        let mut k: i32 = 0;
        for len in 1..=16usize {
            val_offset[len] = k - code;
            code += counts[len - 1] as i32;
            k += counts[len - 1] as i32;
            maxcode[len] = code << (16 - len);
            code <<= 1;
        }
        maxcode[17] = i32::MAX;

        Ok(HuffmanTable { lookup, maxcode, val_offset, values })
    }

    pub fn decode(&self, reader: &mut BitReader) -> Result<u8> {
        let peek = reader.peek(LOOKUP_BITS) as usize;
        let (value, len) = self.lookup[peek];
        if len != 0 {
            reader.consume(len);
            return Ok(value);
        }
        // longer than 8 bits: compare against maxcode per length
        let bits = reader.peek(16) as i32;
        let mut len = LOOKUP_BITS as usize + 1;
        while len <= 16 {
            if bits < self.maxcode[len] {
                break;
            }
            len += 1;
        }
        if len > 16 {
            return Err(PdfError::MalformedImage { msg: "bad Huffman code".into() });
        }
        let code = bits >> (16 - len);
        let index = code + self.val_offset[len];
        let value = *self
            .values
            .get(index as usize)
            .ok_or(PdfError::MalformedImage { msg: "Huffman index out of range".into() })?;
        reader.consume(len as u8);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jpeg::bits::BitReader;

    #[test]
    fn canonical_codes() {
        // codes: a=0, b=10, c=110, d=111
        let mut counts = [0u8; 16];
        counts[0] = 1;
        counts[1] = 1;
        counts[2] = 2;
        let table = HuffmanTable::build(&counts, vec![b'a', b'b', b'c', b'd']).unwrap();

        // a b c d a -> 0 10 110 111 0, packed: 01011011 10......
        let mut r = BitReader::new(&[0b0101_1011, 0b1000_0000]);
        assert_eq!(table.decode(&mut r).unwrap(), b'a');
        assert_eq!(table.decode(&mut r).unwrap(), b'b');
        assert_eq!(table.decode(&mut r).unwrap(), b'c');
        assert_eq!(table.decode(&mut r).unwrap(), b'd');
        assert_eq!(table.decode(&mut r).unwrap(), b'a');
    }

    #[test]
    fn long_codes_use_slow_path() {
        // one code of every length 1..=12; symbols 0..12
        let mut counts = [0u8; 16];
        for c in counts.iter_mut().take(11) {
            *c = 1;
        }
        counts[11] = 2; // lengths: 1..=11 single, two of length 12
        let values: Vec<u8> = (0..13).collect();
        let table = HuffmanTable::build(&counts, values).unwrap();

        // the length-12 codes are all-ones-but-last patterns; decode the
        // first: 1111_1111_1110
        let mut r = BitReader::new(&[0b1111_1111, 0b1110_0000]);
        assert_eq!(table.decode(&mut r).unwrap(), 11);
    }

    #[test]
    fn count_mismatch_rejected() {
        let counts = [1u8; 16];
        assert!(HuffmanTable::build(&counts, vec![0; 3]).is_err());
    }
}
