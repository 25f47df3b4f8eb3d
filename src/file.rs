//! Document storage: the xref chain, the lazy object cache, and `resolve`.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use crate::backend::Backend;
use crate::crypt::{self, Decoder};
use crate::error::*;
use crate::parser::{parse, parse_indirect_object, parse_xref_and_trailer_at, Lexer, NoResolve, ResolveRef};
use crate::primitive::{Dictionary, ObjNr, PdfStream, PlainRef, Primitive};
use crate::xref::{XRef, XRefTable};

/// Longest `/Prev` chain walked before giving up.
const MAX_XREF_CHAIN: usize = 1024;
/// Longest Ref -> Ref chain chased during resolution.
pub const MAX_REF_CHAIN: usize = 16;

/// Sink for the lenient-recovery notes the object layer produces. Mirrored to
/// the `log` facade as warnings.
#[derive(Default)]
pub struct Warnings {
    entries: RefCell<Vec<String>>,
}
impl Warnings {
    pub fn push(&self, msg: String) {
        warn!("{}", msg);
        self.entries.borrow_mut().push(msg);
    }
    pub fn entries(&self) -> Vec<String> {
        self.entries.borrow().clone()
    }
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

pub struct Storage<B: Backend> {
    backend: B,
    refs: XRefTable,
    trailer: Dictionary,
    decoder: Option<Decoder>,
    cache: RefCell<HashMap<ObjNr, Primitive>>,
    pub warnings: Warnings,
    // position of the %PDF header; xref offsets are relative to it
    start_offset: usize,
}

impl<B: Backend> Storage<B> {
    pub fn load(backend: B, password: &[u8]) -> Result<Storage<B>> {
        let start_offset = t!(backend.locate_start_offset());
        let mut storage = Storage {
            backend,
            refs: XRefTable::new(),
            trailer: Dictionary::new(),
            decoder: None,
            cache: RefCell::new(HashMap::new()),
            warnings: Warnings::default(),
            start_offset,
        };
        t!(storage.read_xref_chain());
        t!(storage.setup_decoder(password));
        Ok(storage)
    }

    pub fn trailer(&self) -> &Dictionary {
        &self.trailer
    }
    pub fn xref_table(&self) -> &XRefTable {
        &self.refs
    }
    pub fn is_encrypted(&self) -> bool {
        self.decoder.is_some()
    }

    fn read_xref_chain(&mut self) -> Result<()> {
        let mut offset = t!(self.backend.locate_xref_offset());
        let mut seen = HashSet::new();

        for _ in 0..MAX_XREF_CHAIN {
            if offset == 0 || !seen.insert(offset) {
                break;
            }
            let data = self.backend.read(self.start_offset..self.backend.len())?;
            let mut lexer = Lexer::new(data);
            if lexer.len() <= offset {
                self.warnings.push(format!("xref offset {} outside file", offset));
                break;
            }
            lexer.set_pos(offset);

            let (sections, trailer) = t!(parse_xref_and_trailer_at(&mut lexer));

            // hybrid files: the xref stream named by /XRefStm is consulted
            // before the classic table entries of the same revision
            if let Some(Ok(stm_offset)) = trailer.get("XRefStm").map(|p| p.as_usize()) {
                if stm_offset < lexer.len() {
                    let mut stm_lexer = Lexer::new(data);
                    stm_lexer.set_pos(stm_offset);
                    match parse_xref_and_trailer_at(&mut stm_lexer) {
                        Ok((stm_sections, _)) => {
                            for section in stm_sections {
                                self.refs.add_section(section);
                            }
                        }
                        Err(e) => self.warnings.push(format!("broken /XRefStm: {}", e)),
                    }
                }
            }

            for section in sections {
                self.refs.add_section(section);
            }
            if let Some(Ok(size)) = trailer.get("Size").map(|p| p.as_u32()) {
                self.refs.observe_size(size);
            }

            let prev = trailer.get("Prev").and_then(|p| p.as_usize().ok());

            // the newest trailer governs Root/Info/Encrypt/ID
            if self.trailer.is_empty() {
                self.trailer = trailer;
            }

            match prev {
                Some(p) => offset = p,
                None => break,
            }
        }

        if self.trailer.is_empty() {
            bail!("no trailer found");
        }
        Ok(())
    }

    fn setup_decoder(&mut self, password: &[u8]) -> Result<()> {
        let encrypt = match self.trailer.get("Encrypt") {
            None => return Ok(()),
            Some(p) => p.clone(),
        };
        // the /Encrypt dictionary itself is parsed without decryption
        let resolved = match encrypt {
            Primitive::Reference(r) => t!(self.resolve_raw(r)),
            p => p,
        };
        self.decoder = t!(crypt::decoder_from_trailer(&self.trailer, &resolved, password));
        // drop anything cached before the decoder existed
        self.cache.borrow_mut().clear();
        Ok(())
    }

    /// Parses the object at a `Raw` xref position, without consulting or
    /// filling the cache.
    fn resolve_raw(&self, r: PlainRef) -> Result<Primitive> {
        match self.refs.get(r.id) {
            Some(XRef::Raw { pos, gen_nr }) => {
                if gen_nr != r.gen {
                    self.warnings
                        .push(format!("object {}: generation {} requested, {} stored", r.id, r.gen, gen_nr));
                }
                let data = self.backend.read(self.start_offset..self.backend.len())?;
                let mut lexer = Lexer::new(data);
                if pos >= lexer.len() {
                    self.warnings.push(format!("object {} offset {} outside file", r.id, pos));
                    return Ok(Primitive::Null);
                }
                lexer.set_pos(pos);
                let (id, obj) = t!(parse_indirect_object(&mut lexer, self, self.decoder.as_ref()));
                if id.id != r.id {
                    self.warnings
                        .push(format!("object {} found where {} was expected", id.id, r.id));
                }
                Ok(obj)
            }
            Some(XRef::Stream { stream_id, index }) => self.resolve_in_object_stream(stream_id, index),
            Some(XRef::Free { .. }) => Ok(Primitive::Null),
            None => {
                self.warnings.push(format!("reference to non-existent object {}", r.id));
                Ok(Primitive::Null)
            }
        }
    }

    /// Objects inside object streams were decrypted together with their
    /// containing stream; they parse without a decoder.
    fn resolve_in_object_stream(&self, stream_id: ObjNr, index: usize) -> Result<Primitive> {
        let container = t!(self.resolve(PlainRef { id: stream_id, gen: 0 }));
        let stream = t!(container.as_stream());
        let data = t!(stream.decoded_data());

        let n = t!(stream.info.require("ObjStm", "N")).as_usize()?;
        let first = t!(stream.info.require("ObjStm", "First")).as_usize()?;
        if index >= n {
            err!(PdfError::ObjStmOutOfBounds { index, max: n });
        }

        // the header is N pairs of (obj_nr, offset)
        let mut header = Lexer::new(data);
        let mut entry = None;
        for i in 0..n {
            let obj_nr = t!(header.next_as::<ObjNr>());
            let offset = t!(header.next_as::<usize>());
            if i == index {
                entry = Some((obj_nr, offset));
                break;
            }
        }
        let (_, offset) = entry.ok_or(PdfError::ObjStmOutOfBounds { index, max: n })?;

        let start = first.checked_add(offset).ok_or(PdfError::EOF)?;
        if start > data.len() {
            return Err(PdfError::EOF);
        }
        parse(&data[start..], &NoResolve)
    }

    /// Resolves a reference through the cache. Every resolvable Ref yields a
    /// clone of the same parsed value for the life of the document.
    pub fn resolve(&self, r: PlainRef) -> Result<Primitive> {
        if let Some(cached) = self.cache.borrow().get(&r.id) {
            return Ok(cached.clone());
        }
        let obj = t!(self.resolve_raw(r));
        self.cache.borrow_mut().insert(r.id, obj.clone());
        Ok(obj)
    }

    /// Like `resolve`, but also chases Ref -> Ref chains (depth-capped) and
    /// passes non-reference primitives through.
    pub fn deref(&self, p: &Primitive) -> Result<Primitive> {
        let mut current = p.clone();
        for _ in 0..MAX_REF_CHAIN {
            match current {
                Primitive::Reference(r) => current = t!(self.resolve(r)),
                other => return Ok(other),
            }
        }
        self.warnings.push(format!("reference chain longer than {} links", MAX_REF_CHAIN));
        Ok(Primitive::Null)
    }

    /// Dictionary lookup + deref in one step; `None` when the key is missing
    /// or resolves to Null.
    pub fn get_entry(&self, dict: &Dictionary, key: &str) -> Option<Primitive> {
        let p = dict.get(key)?;
        match self.deref(p) {
            Ok(Primitive::Null) => None,
            Ok(p) => Some(p),
            Err(e) => {
                self.warnings.push(format!("failed to resolve /{}: {}", key, e));
                None
            }
        }
    }

    /// Decoded bytes of a stream-valued entry, following references.
    pub fn stream_data(&self, p: &Primitive) -> Result<Vec<u8>> {
        let resolved = t!(self.deref(p));
        let stream = t!(resolved.as_stream());
        Ok(t!(stream.decoded_data()).to_vec())
    }
}

impl<B: Backend> ResolveRef for Storage<B> {
    fn resolve_ref(&self, r: PlainRef) -> Result<Primitive> {
        self.resolve(r)
    }
}

impl PdfStream {
    /// The decoded payload; runs the filter chain once and caches the result
    /// in the stream's decode slot.
    pub fn decoded_data(&self) -> Result<&[u8]> {
        self.decoded
            .get_or_try_init(|| crate::enc::decode_stream(self).map(|cow| cow.into_owned()))
            .map(|v| &v[..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::Primitive;

    /// Builds a tiny but complete PDF around the given numbered bodies.
    pub fn build_pdf(bodies: &[(u32, &[u8])], trailer_extra: &str) -> Vec<u8> {
        let mut data = b"%PDF-1.5\n".to_vec();
        let mut offsets = Vec::new();
        for &(nr, body) in bodies {
            offsets.push((nr, data.len()));
            data.extend_from_slice(format!("{} 0 obj\n", nr).as_bytes());
            data.extend_from_slice(body);
            data.extend_from_slice(b"\nendobj\n");
        }
        let xref_pos = data.len();
        let max_nr = bodies.iter().map(|&(nr, _)| nr).max().unwrap_or(0);
        data.extend_from_slice(format!("xref\n0 {}\n", max_nr + 1).as_bytes());
        data.extend_from_slice(b"0000000000 65535 f \n");
        for nr in 1..=max_nr {
            match offsets.iter().find(|&&(n, _)| n == nr) {
                Some(&(_, off)) => data.extend_from_slice(format!("{:010} 00000 n \n", off).as_bytes()),
                None => data.extend_from_slice(b"0000000000 65535 f \n"),
            }
        }
        data.extend_from_slice(
            format!(
                "trailer\n<</Size {} {}>>\nstartxref\n{}\n%%EOF",
                max_nr + 1,
                trailer_extra,
                xref_pos
            )
            .as_bytes(),
        );
        data
    }

    #[test]
    fn resolve_simple_chain() {
        let pdf = build_pdf(
            &[
                (1, b"<</Type/Catalog>>"),
                (2, b"42"),
                (3, b"2 0 R"),
            ],
            "/Root 1 0 R",
        );
        let storage = Storage::load(pdf, b"").unwrap();
        let p = storage.resolve(PlainRef { id: 3, gen: 0 }).unwrap();
        assert_eq!(p, Primitive::Reference(PlainRef { id: 2, gen: 0 }));
        assert_eq!(storage.deref(&p).unwrap(), Primitive::Int(42));
    }

    #[test]
    fn circular_reference_yields_null() {
        let pdf = build_pdf(
            &[(1, b"<</Type/Catalog>>"), (2, b"3 0 R"), (3, b"2 0 R")],
            "/Root 1 0 R",
        );
        let storage = Storage::load(pdf, b"").unwrap();
        let p = storage.resolve(PlainRef { id: 2, gen: 0 }).unwrap();
        // bounded work, ends in Null
        assert_eq!(storage.deref(&p).unwrap(), Primitive::Null);
        assert!(!storage.warnings.is_empty());
    }

    #[test]
    fn free_and_absent_objects_resolve_to_null() {
        let pdf = build_pdf(&[(2, b"7")], "/Root 2 0 R");
        let storage = Storage::load(pdf, b"").unwrap();
        assert_eq!(storage.resolve(PlainRef { id: 1, gen: 0 }).unwrap(), Primitive::Null);
        assert_eq!(storage.resolve(PlainRef { id: 99, gen: 0 }).unwrap(), Primitive::Null);
    }

    #[test]
    fn object_stream_objects() {
        // object 4 and 5 live inside object stream 2
        let contained = b"<</Inside true>> 99";
        let header = b"4 0 5 17 ";
        let mut payload = header.to_vec();
        payload.extend_from_slice(contained);
        let stm_body = format!(
            "<</Type/ObjStm/N 2/First {}/Length {}>>\nstream\n{}\nendstream",
            header.len(),
            payload.len(),
            String::from_utf8(payload).unwrap()
        );

        let mut data = b"%PDF-1.5\n".to_vec();
        let catalog_pos = data.len();
        data.extend_from_slice(b"1 0 obj\n<</Type/Catalog>>\nendobj\n");
        let objstm_pos = data.len();
        data.extend_from_slice(b"2 0 obj\n");
        data.extend_from_slice(stm_body.as_bytes());
        data.extend_from_slice(b"\nendobj\n");

        // xref stream indexing objects 0-5
        let xref_pos = data.len();
        let entries: &[[u8; 4]] = &[
            [0, 0, 0, 0],
            [1, (catalog_pos >> 8) as u8, catalog_pos as u8, 0],
            [1, (objstm_pos >> 8) as u8, objstm_pos as u8, 0],
            [1, (xref_pos >> 8) as u8, xref_pos as u8, 0],
            [2, 0, 2, 0],
            [2, 0, 2, 1],
        ];
        let flat: Vec<u8> = entries.iter().flatten().copied().collect();
        data.extend_from_slice(
            format!(
                "3 0 obj\n<</Type/XRef/Size 6/W[1 2 1]/Root 1 0 R/Length {}>>\nstream\n",
                flat.len()
            )
            .as_bytes(),
        );
        data.extend_from_slice(&flat);
        data.extend_from_slice(b"\nendstream\nendobj\n");
        data.extend_from_slice(format!("startxref\n{}\n%%EOF", xref_pos).as_bytes());

        let storage = Storage::load(data, b"").unwrap();
        let four = storage.resolve(PlainRef { id: 4, gen: 0 }).unwrap();
        let dict = four.as_dictionary().unwrap();
        assert_eq!(dict.get("Inside").unwrap().as_bool().unwrap(), true);
        let five = storage.resolve(PlainRef { id: 5, gen: 0 }).unwrap();
        assert_eq!(five, Primitive::Int(99));
    }

    #[test]
    fn prev_chain_merges_newest_wins() {
        // rev 1: object 2 = 1; rev 2 redefines object 2 = 2
        let mut data = b"%PDF-1.5\n".to_vec();
        let o1 = data.len();
        data.extend_from_slice(b"1 0 obj\n<</Type/Catalog>>\nendobj\n");
        let o2a = data.len();
        data.extend_from_slice(b"2 0 obj\n1\nendobj\n");
        let xref1 = data.len();
        data.extend_from_slice(
            format!(
                "xref\n0 3\n0000000000 65535 f \n{:010} 00000 n \n{:010} 00000 n \ntrailer\n<</Size 3/Root 1 0 R>>\n",
                o1, o2a
            )
            .as_bytes(),
        );
        let o2b = data.len();
        data.extend_from_slice(b"2 0 obj\n2\nendobj\n");
        let xref2 = data.len();
        data.extend_from_slice(
            format!(
                "xref\n2 1\n{:010} 00000 n \ntrailer\n<</Size 3/Root 1 0 R/Prev {}>>\nstartxref\n{}\n%%EOF",
                o2b, xref1, xref2
            )
            .as_bytes(),
        );

        let storage = Storage::load(data, b"").unwrap();
        let p = storage.resolve(PlainRef { id: 2, gen: 0 }).unwrap();
        assert_eq!(p, Primitive::Int(2));
    }
}
