use crate::error::*;
use std::ops::Range;

/// The storage a document reads from. Everything is in memory; this trait is
/// the seam that lets `Storage` stay generic over owned and borrowed buffers.
pub trait Backend {
    fn read(&self, range: Range<usize>) -> Result<&[u8]>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset of the `%PDF-` header. Some files carry leading junk; the
    /// header must sit within the first 1024 bytes.
    fn locate_start_offset(&self) -> Result<usize> {
        const HEADER: &[u8] = b"%PDF-";
        let prefix = self.read(0..self.len().min(1024))?;
        prefix
            .windows(HEADER.len())
            .position(|w| w == HEADER)
            .ok_or(PdfError::NotFormat)
    }

    /// The offset stored after the last `startxref` keyword, which itself
    /// must sit within the final 1024 bytes.
    fn locate_xref_offset(&self) -> Result<usize> {
        const STARTXREF: &[u8] = b"startxref";
        let len = self.len();
        let tail_start = len.saturating_sub(1024);
        let tail = self.read(tail_start..len)?;
        let pos = tail
            .windows(STARTXREF.len())
            .rposition(|w| w == STARTXREF)
            .ok_or(PdfError::NotFound { word: "startxref".into() })?;
        let mut lexer = crate::parser::Lexer::new(&tail[pos..]);
        lexer.next_expect("startxref")?;
        lexer.next_as::<usize>()
    }
}

impl Backend for [u8] {
    fn read(&self, range: Range<usize>) -> Result<&[u8]> {
        self.get(range).ok_or(PdfError::EOF)
    }
    fn len(&self) -> usize {
        (*self).len()
    }
}

impl Backend for Vec<u8> {
    fn read(&self, range: Range<usize>) -> Result<&[u8]> {
        self.get(range).ok_or(PdfError::EOF)
    }
    fn len(&self) -> usize {
        (*self).len()
    }
}
