use crate::error::*;

use indexmap::IndexMap;
use itertools::Itertools;
use once_cell::sync::OnceCell;
use std::borrow::Cow;
use std::fmt;
use std::io;
use std::str;

pub type ObjNr = u32;
pub type GenNr = u16;

/// An object identifier: number and generation. Never owns the object it
/// names; resolution goes through the document's `Resolve` impl.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PlainRef {
    pub id: ObjNr,
    pub gen: GenNr,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Primitive {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Name(Name),
    String(PdfString),
    Array(Vec<Primitive>),
    Dictionary(Dictionary),
    Stream(PdfStream),
    Reference(PlainRef),
}

/// A name after `#xx` decoding. Raw bytes; most names are ASCII but any
/// byte other than NUL can appear.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Name(pub Vec<u8>);

impl Name {
    pub fn from(s: &str) -> Name {
        Name(s.as_bytes().to_vec())
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
    pub fn as_str(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.0)
    }
    pub fn serialize(&self, out: &mut impl io::Write) -> Result<()> {
        out.write_all(b"/")?;
        for &b in &self.0 {
            match b {
                b'\x21'..=b'\x7e' if !b"()<>[]{}/%#".contains(&b) => out.write_all(&[b])?,
                _ => write!(out, "#{:02x}", b)?,
            }
        }
        Ok(())
    }
}
impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "/{}", self.as_str())
    }
}
impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "/{}", self.as_str())
    }
}
impl PartialEq<str> for Name {
    fn eq(&self, rhs: &str) -> bool {
        self.0 == rhs.as_bytes()
    }
}
impl PartialEq<&str> for Name {
    fn eq(&self, rhs: &&str) -> bool {
        self.0 == rhs.as_bytes()
    }
}
impl From<&str> for Name {
    fn from(s: &str) -> Name {
        Name::from(s)
    }
}

/// A string value. `hex` records whether the source wrote it in `<...>` form;
/// the decoded bytes are the canonical value and the only thing compared.
#[derive(Clone, Default)]
pub struct PdfString {
    pub data: Vec<u8>,
    pub hex: bool,
}
impl PartialEq for PdfString {
    fn eq(&self, rhs: &PdfString) -> bool {
        self.data == rhs.data
    }
}
impl PdfString {
    pub fn new(data: Vec<u8>) -> PdfString {
        PdfString { data, hex: false }
    }
    pub fn new_hex(data: Vec<u8>) -> PdfString {
        PdfString { data, hex: true }
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
    /// UTF-16BE with BOM, otherwise PDFDocEncoding treated as latin-1-ish.
    pub fn to_string_lossy(&self) -> String {
        if self.data.starts_with(&[0xfe, 0xff]) {
            let utf16: Vec<u16> = self.data[2..]
                .chunks(2)
                .map(|c| (c[0] as u16) << 8 | c.get(1).cloned().unwrap_or(0) as u16)
                .collect();
            String::from_utf16_lossy(&utf16)
        } else {
            self.data.iter().map(|&b| b as char).collect()
        }
    }
    pub fn serialize(&self, out: &mut impl io::Write) -> Result<()> {
        if self.hex {
            out.write_all(b"<")?;
            for &b in &self.data {
                write!(out, "{:02x}", b)?;
            }
            out.write_all(b">")?;
        } else {
            out.write_all(b"(")?;
            for &b in &self.data {
                match b {
                    b'\\' | b'(' | b')' => {
                        out.write_all(&[b'\\', b])?;
                    }
                    b'\n' => out.write_all(b"\\n")?,
                    b'\r' => out.write_all(b"\\r")?,
                    _ => out.write_all(&[b])?,
                }
            }
            out.write_all(b")")?;
        }
        Ok(())
    }
}
impl fmt::Debug for PdfString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"")?;
        for &b in &self.data {
            match b {
                b'"' => write!(f, "\\\"")?,
                b' '..=b'~' => write!(f, "{}", b as char)?,
                x => write!(f, "\\x{:02x}", x)?,
            }
        }
        write!(f, "\"")
    }
}
impl AsRef<[u8]> for PdfString {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Dictionary with insertion order preserved (needed for deterministic
/// serialization); lookup is by key bytes.
#[derive(Default, Clone, PartialEq)]
pub struct Dictionary {
    dict: IndexMap<Name, Primitive>,
}
impl Dictionary {
    pub fn new() -> Dictionary {
        Dictionary::default()
    }
    pub fn len(&self) -> usize {
        self.dict.len()
    }
    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }
    pub fn get(&self, key: &str) -> Option<&Primitive> {
        self.dict.get(key.as_bytes())
    }
    pub fn get_name(&self, key: &Name) -> Option<&Primitive> {
        self.dict.get(key.as_bytes())
    }
    pub fn insert(&mut self, key: impl Into<Name>, val: Primitive) -> Option<Primitive> {
        self.dict.insert(key.into(), val)
    }
    pub fn remove(&mut self, key: &str) -> Option<Primitive> {
        self.dict.shift_remove(key.as_bytes())
    }
    pub fn contains_key(&self, key: &str) -> bool {
        self.dict.contains_key(key.as_bytes())
    }
    pub fn iter(&self) -> impl Iterator<Item = (&Name, &Primitive)> {
        self.dict.iter()
    }
    /// Like get, but returns `PdfError::MissingEntry` naming the caller's type.
    pub fn require(&self, typ: &'static str, key: &str) -> Result<&Primitive> {
        self.get(key).ok_or(PdfError::MissingEntry { typ, field: key.into() })
    }
    pub fn serialize(&self, out: &mut impl io::Write) -> Result<()> {
        out.write_all(b"<<")?;
        for (key, val) in self.iter() {
            key.serialize(out)?;
            out.write_all(b" ")?;
            val.serialize(out)?;
        }
        out.write_all(b">>")?;
        Ok(())
    }
}
impl indexmap::Equivalent<Name> for [u8] {
    fn equivalent(&self, key: &Name) -> bool {
        self == &key.0[..]
    }
}
impl fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<{}>",
            self.iter()
                .format_with(", ", |(k, v), f| f(&format_args!("{}={:?}", k, v)))
        )
    }
}
impl IntoIterator for Dictionary {
    type Item = (Name, Primitive);
    type IntoIter = indexmap::map::IntoIter<Name, Primitive>;
    fn into_iter(self) -> Self::IntoIter {
        self.dict.into_iter()
    }
}

/// A stream: dictionary, the raw (filtered, already decrypted) payload, and a
/// slot for the decoded bytes filled on first use.
#[derive(Clone, Debug, Default)]
pub struct PdfStream {
    pub info: Dictionary,
    pub raw: Vec<u8>,
    pub(crate) decoded: OnceCell<Vec<u8>>,
}
impl PartialEq for PdfStream {
    fn eq(&self, rhs: &PdfStream) -> bool {
        self.info == rhs.info && self.raw == rhs.raw
    }
}
impl PdfStream {
    pub fn new(info: Dictionary, raw: Vec<u8>) -> PdfStream {
        PdfStream { info, raw, decoded: OnceCell::new() }
    }
}

macro_rules! unexpected_primitive {
    ($expected:ident, $found:expr) => {
        Err(PdfError::UnexpectedPrimitive {
            expected: stringify!($expected),
            found: $found,
        })
    };
}

impl Primitive {
    /// For debugging / error messages: get the name of the variant
    pub fn get_debug_name(&self) -> &'static str {
        match *self {
            Primitive::Null => "Null",
            Primitive::Bool(..) => "Bool",
            Primitive::Int(..) => "Int",
            Primitive::Real(..) => "Real",
            Primitive::Name(..) => "Name",
            Primitive::String(..) => "String",
            Primitive::Array(..) => "Array",
            Primitive::Dictionary(..) => "Dictionary",
            Primitive::Stream(..) => "Stream",
            Primitive::Reference(..) => "Reference",
        }
    }
    pub fn is_null(&self) -> bool {
        matches!(self, Primitive::Null)
    }
    pub fn as_int(&self) -> Result<i64> {
        match *self {
            Primitive::Int(n) => Ok(n),
            ref p => unexpected_primitive!(Int, p.get_debug_name()),
        }
    }
    pub fn as_u32(&self) -> Result<u32> {
        match *self {
            Primitive::Int(n) if n >= 0 && n <= u32::MAX as i64 => Ok(n as u32),
            Primitive::Int(_) => bail!("integer out of u32 range"),
            ref p => unexpected_primitive!(Int, p.get_debug_name()),
        }
    }
    pub fn as_usize(&self) -> Result<usize> {
        match *self {
            Primitive::Int(n) if n >= 0 => Ok(n as usize),
            Primitive::Int(_) => bail!("negative integer"),
            ref p => unexpected_primitive!(Int, p.get_debug_name()),
        }
    }
    pub fn as_number(&self) -> Result<f64> {
        match *self {
            Primitive::Int(n) => Ok(n as f64),
            Primitive::Real(f) => Ok(f),
            ref p => unexpected_primitive!(Real, p.get_debug_name()),
        }
    }
    pub fn as_bool(&self) -> Result<bool> {
        match *self {
            Primitive::Bool(b) => Ok(b),
            ref p => unexpected_primitive!(Bool, p.get_debug_name()),
        }
    }
    pub fn as_name(&self) -> Result<&Name> {
        match self {
            Primitive::Name(name) => Ok(name),
            p => unexpected_primitive!(Name, p.get_debug_name()),
        }
    }
    pub fn as_string(&self) -> Result<&PdfString> {
        match self {
            Primitive::String(s) => Ok(s),
            p => unexpected_primitive!(String, p.get_debug_name()),
        }
    }
    pub fn as_array(&self) -> Result<&[Primitive]> {
        match self {
            Primitive::Array(v) => Ok(v),
            p => unexpected_primitive!(Array, p.get_debug_name()),
        }
    }
    pub fn as_dictionary(&self) -> Result<&Dictionary> {
        match self {
            Primitive::Dictionary(d) => Ok(d),
            Primitive::Stream(s) => Ok(&s.info),
            p => unexpected_primitive!(Dictionary, p.get_debug_name()),
        }
    }
    pub fn as_stream(&self) -> Result<&PdfStream> {
        match self {
            Primitive::Stream(s) => Ok(s),
            p => unexpected_primitive!(Stream, p.get_debug_name()),
        }
    }
    pub fn as_reference(&self) -> Result<PlainRef> {
        match *self {
            Primitive::Reference(r) => Ok(r),
            ref p => unexpected_primitive!(Reference, p.get_debug_name()),
        }
    }
    pub fn into_array(self) -> Result<Vec<Primitive>> {
        match self {
            Primitive::Array(v) => Ok(v),
            p => unexpected_primitive!(Array, p.get_debug_name()),
        }
    }
    pub fn into_dictionary(self) -> Result<Dictionary> {
        match self {
            Primitive::Dictionary(d) => Ok(d),
            Primitive::Stream(s) => Ok(s.info),
            p => unexpected_primitive!(Dictionary, p.get_debug_name()),
        }
    }
    pub fn into_stream(self) -> Result<PdfStream> {
        match self {
            Primitive::Stream(s) => Ok(s),
            p => unexpected_primitive!(Stream, p.get_debug_name()),
        }
    }
    pub fn into_string(self) -> Result<PdfString> {
        match self {
            Primitive::String(s) => Ok(s),
            p => unexpected_primitive!(String, p.get_debug_name()),
        }
    }

    pub fn serialize(&self, out: &mut impl io::Write) -> Result<()> {
        match self {
            Primitive::Null => out.write_all(b"null")?,
            Primitive::Bool(b) => write!(out, "{}", b)?,
            Primitive::Int(i) => write!(out, "{}", i)?,
            Primitive::Real(r) => {
                if r.fract() == 0.0 {
                    write!(out, "{:.1}", r)?
                } else {
                    write!(out, "{}", r)?
                }
            }
            Primitive::Name(n) => n.serialize(out)?,
            Primitive::String(s) => s.serialize(out)?,
            Primitive::Array(arr) => {
                out.write_all(b"[")?;
                let mut first = true;
                for p in arr {
                    if !first {
                        out.write_all(b" ")?;
                    }
                    first = false;
                    p.serialize(out)?;
                }
                out.write_all(b"]")?;
            }
            Primitive::Dictionary(d) => d.serialize(out)?,
            Primitive::Stream(s) => {
                s.info.serialize(out)?;
                out.write_all(b"\nstream\n")?;
                out.write_all(&s.raw)?;
                out.write_all(b"\nendstream")?;
            }
            Primitive::Reference(r) => write!(out, "{} {} R", r.id, r.gen)?,
        }
        Ok(())
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Primitive::Null => write!(f, "null"),
            Primitive::Bool(b) => b.fmt(f),
            Primitive::Int(i) => i.fmt(f),
            Primitive::Real(n) => n.fmt(f),
            Primitive::Name(n) => n.fmt(f),
            Primitive::String(s) => write!(f, "{:?}", s),
            Primitive::Array(arr) => write!(f, "[{}]", arr.iter().format(", ")),
            Primitive::Dictionary(d) => write!(f, "{:?}", d),
            Primitive::Stream(_) => write!(f, "stream"),
            Primitive::Reference(r) => write!(f, "{} {} R", r.id, r.gen),
        }
    }
}

impl From<i64> for Primitive {
    fn from(x: i64) -> Primitive {
        Primitive::Int(x)
    }
}
impl From<f64> for Primitive {
    fn from(x: f64) -> Primitive {
        Primitive::Real(x)
    }
}
impl From<bool> for Primitive {
    fn from(x: bool) -> Primitive {
        Primitive::Bool(x)
    }
}
impl From<Name> for Primitive {
    fn from(x: Name) -> Primitive {
        Primitive::Name(x)
    }
}
impl From<PdfString> for Primitive {
    fn from(x: PdfString) -> Primitive {
        Primitive::String(x)
    }
}
impl From<Dictionary> for Primitive {
    fn from(x: Dictionary) -> Primitive {
        Primitive::Dictionary(x)
    }
}
impl From<PdfStream> for Primitive {
    fn from(x: PdfStream) -> Primitive {
        Primitive::Stream(x)
    }
}
impl From<Vec<Primitive>> for Primitive {
    fn from(x: Vec<Primitive>) -> Primitive {
        Primitive::Array(x)
    }
}
impl From<PlainRef> for Primitive {
    fn from(x: PlainRef) -> Primitive {
        Primitive::Reference(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_escaping() {
        let mut out = Vec::new();
        Name(b"A B#1".to_vec()).serialize(&mut out).unwrap();
        assert_eq!(out, b"/A#20B#231");
    }

    #[test]
    fn string_compares_by_bytes_only() {
        assert_eq!(PdfString::new(b"abc".to_vec()), PdfString::new_hex(b"abc".to_vec()));
    }

    #[test]
    fn dictionary_keeps_insertion_order() {
        let mut dict = Dictionary::new();
        dict.insert("Zebra", Primitive::Int(1));
        dict.insert("Alpha", Primitive::Int(2));
        let keys: Vec<_> = dict.iter().map(|(k, _)| k.as_str().into_owned()).collect();
        assert_eq!(keys, ["Zebra", "Alpha"]);
        assert_eq!(dict.get("Alpha").unwrap().as_int().unwrap(), 2);
    }
}
