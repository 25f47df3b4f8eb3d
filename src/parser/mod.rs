//! Tokenizer plus recursive-descent parsing of PDF objects.

mod lexer;
mod parse_xref;

pub use self::lexer::*;
pub use self::parse_xref::*;

use crate::crypt::Decoder;
use crate::error::*;
use crate::primitive::{Dictionary, Name, ObjNr, GenNr, PdfStream, PdfString, PlainRef, Primitive};
use bitflags::bitflags;

/// Nesting ceiling for arrays/dictionaries. Past this the input is treated as
/// malformed rather than recursed into.
pub const MAX_DEPTH: usize = 512;

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ParseFlags: u16 {
        const INT = 1 << 0;
        const STREAM = 1 << 1;
        const DICT = 1 << 2;
        const NUMBER = 1 << 3;
        const NAME = 1 << 4;
        const ARRAY = 1 << 5;
        const STRING = 1 << 6;
        const BOOL = 1 << 7;
        const NULL = 1 << 8;
        const REF = 1 << 9;
        const ANY = (1 << 10) - 1;
    }
}

/// Decryption context for strings and stream payloads: which object we are
/// inside of, and the document's decoder if any.
#[derive(Copy, Clone)]
pub struct Context<'a> {
    pub decoder: Option<&'a Decoder>,
    pub id: PlainRef,
}
impl<'a> Context<'a> {
    pub fn plain(id: PlainRef) -> Self {
        Context { decoder: None, id }
    }
    pub fn decrypt(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        match self.decoder {
            Some(decoder) => decoder.decrypt(self.id, data),
            None => Ok(data),
        }
    }
}

/// `/Length` may be an indirect reference; the parser needs a way to chase it.
/// `NoResolve` is for contexts where that cannot happen (object streams,
/// content streams).
pub trait ResolveRef {
    fn resolve_ref(&self, r: PlainRef) -> Result<Primitive>;
}
pub struct NoResolve;
impl ResolveRef for NoResolve {
    fn resolve_ref(&self, _: PlainRef) -> Result<Primitive> {
        Err(PdfError::NotFound { word: "reference in direct-only context".into() })
    }
}

pub fn parse(data: &[u8], r: &impl ResolveRef) -> Result<Primitive> {
    parse_with_lexer(&mut Lexer::new(data), r, ParseFlags::ANY)
}

pub fn parse_with_lexer(lexer: &mut Lexer, r: &impl ResolveRef, flags: ParseFlags) -> Result<Primitive> {
    parse_with_lexer_ctx(lexer, r, None, flags, MAX_DEPTH)
}

#[inline]
fn check(flags: ParseFlags, allowed: ParseFlags) -> Result<()> {
    if !flags.intersects(allowed) {
        bail!("primitive not allowed here");
    }
    Ok(())
}

/// Recursive object parser. On error the lexer is rewound to where the object
/// started so the caller can try something else (operators, keywords).
pub fn parse_with_lexer_ctx(
    lexer: &mut Lexer,
    r: &impl ResolveRef,
    ctx: Option<&Context>,
    flags: ParseFlags,
    max_depth: usize,
) -> Result<Primitive> {
    let pos = lexer.get_pos();
    match parse_inner(lexer, r, ctx, flags, max_depth) {
        Ok(p) => Ok(p),
        Err(e) => {
            lexer.set_pos(pos);
            Err(e)
        }
    }
}

fn parse_dictionary(
    lexer: &mut Lexer,
    r: &impl ResolveRef,
    ctx: Option<&Context>,
    max_depth: usize,
) -> Result<Dictionary> {
    let mut dict = Dictionary::new();
    loop {
        // a Name key, or the closing >>
        let token = t!(lexer.next());
        if token.starts_with(b"/") {
            let key = t!(decode_name(&token));
            let obj = t!(parse_with_lexer_ctx(lexer, r, ctx, ParseFlags::ANY, max_depth));
            dict.insert(key, obj);
        } else if token.equals(b">>") {
            break;
        } else {
            err!(PdfError::UnexpectedLexeme {
                pos: lexer.get_pos(),
                lexeme: token.to_string(),
                expected: "/ or >>"
            });
        }
    }
    Ok(dict)
}

/// `/`-prefixed lexeme to name bytes, decoding `#xx` escapes in place.
pub fn decode_name(token: &Substr) -> Result<Name> {
    let rest = &token.as_slice()[1..];
    if !rest.contains(&b'#') {
        return Ok(Name(rest.to_vec()));
    }
    let mut out = Vec::with_capacity(rest.len());
    let mut i = 0;
    while i < rest.len() {
        if rest[i] == b'#' {
            let hex = rest.get(i + 1..i + 3).ok_or(PdfError::EOF)?;
            let hi = hex_nibble(hex[0]).ok_or(PdfError::HexDecode { pos: i, bytes: [hex[0], hex[1]] })?;
            let lo = hex_nibble(hex[1]).ok_or(PdfError::HexDecode { pos: i, bytes: [hex[0], hex[1]] })?;
            out.push(hi << 4 | lo);
            i += 3;
        } else {
            out.push(rest[i]);
            i += 1;
        }
    }
    Ok(Name(out))
}
#[inline]
fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn parse_inner(
    lexer: &mut Lexer,
    r: &impl ResolveRef,
    ctx: Option<&Context>,
    flags: ParseFlags,
    max_depth: usize,
) -> Result<Primitive> {
    let first_lexeme = t!(lexer.next());

    let obj = if first_lexeme.equals(b"<<") {
        check(flags, ParseFlags::DICT | ParseFlags::STREAM)?;
        if max_depth == 0 {
            return Err(PdfError::MaxDepth);
        }
        let dict = t!(parse_dictionary(lexer, r, ctx, max_depth - 1));
        // might be the dictionary in front of a stream
        if t!(lexer.peek()).equals(b"stream") {
            check(flags, ParseFlags::STREAM)?;
            Primitive::Stream(t!(parse_stream_body(dict, lexer, r, ctx)))
        } else {
            Primitive::Dictionary(dict)
        }
    } else if first_lexeme.is_integer() {
        // may be Int or the start of `int int R`
        check(flags, ParseFlags::INT | ParseFlags::REF)?;
        let pos_bk = lexer.get_pos();

        let second = lexer.peek();
        let mut reference = None;
        if let Ok(second_lexeme) = second {
            if second_lexeme.is_integer() {
                lexer.next()?;
                let third_lexeme = t!(lexer.next());
                if third_lexeme.equals(b"R") {
                    let id = first_lexeme.to::<ObjNr>();
                    let gen = second_lexeme.to::<GenNr>();
                    if let (Ok(id), Ok(gen)) = (id, gen) {
                        reference = Some(PlainRef { id, gen });
                    }
                }
            }
        }
        match reference {
            Some(id) => {
                check(flags, ParseFlags::REF)?;
                Primitive::Reference(id)
            }
            None => {
                check(flags, ParseFlags::INT)?;
                lexer.set_pos(pos_bk);
                Primitive::Int(t!(first_lexeme.to::<i64>()))
            }
        }
    } else if first_lexeme.is_number() {
        check(flags, ParseFlags::NUMBER)?;
        Primitive::Real(t!(first_lexeme.to_f64()))
    } else if first_lexeme.starts_with(b"/") {
        check(flags, ParseFlags::NAME)?;
        Primitive::Name(t!(decode_name(&first_lexeme)))
    } else if first_lexeme.equals(b"[") {
        check(flags, ParseFlags::ARRAY)?;
        if max_depth == 0 {
            return Err(PdfError::MaxDepth);
        }
        let mut array = Vec::new();
        loop {
            if t!(lexer.peek()).equals(b"]") {
                break;
            }
            array.push(t!(parse_with_lexer_ctx(lexer, r, ctx, ParseFlags::ANY, max_depth - 1)));
        }
        t!(lexer.next()); // the ]
        Primitive::Array(array)
    } else if first_lexeme.equals(b"(") {
        check(flags, ParseFlags::STRING)?;
        let mut data = Vec::new();
        let bytes_traversed = {
            let mut string_lexer = StringLexer::new(lexer.get_remaining_slice());
            for byte in string_lexer.iter() {
                data.push(t!(byte));
            }
            string_lexer.get_offset()
        };
        lexer.offset_pos(bytes_traversed);
        if let Some(ctx) = ctx {
            data = t!(ctx.decrypt(data));
        }
        Primitive::String(PdfString::new(data))
    } else if first_lexeme.equals(b"<") {
        check(flags, ParseFlags::STRING)?;
        let mut data = Vec::new();
        let bytes_traversed = {
            let mut hex_lexer = HexStringLexer::new(lexer.get_remaining_slice());
            for byte in hex_lexer.iter() {
                data.push(t!(byte));
            }
            hex_lexer.get_offset()
        };
        lexer.offset_pos(bytes_traversed);
        if let Some(ctx) = ctx {
            data = t!(ctx.decrypt(data));
        }
        Primitive::String(PdfString::new_hex(data))
    } else if first_lexeme.equals(b"true") {
        check(flags, ParseFlags::BOOL)?;
        Primitive::Bool(true)
    } else if first_lexeme.equals(b"false") {
        check(flags, ParseFlags::BOOL)?;
        Primitive::Bool(false)
    } else if first_lexeme.equals(b"null") {
        check(flags, ParseFlags::NULL)?;
        Primitive::Null
    } else {
        err!(PdfError::UnknownType {
            pos: lexer.get_pos(),
            first_lexeme: first_lexeme.to_string()
        });
    };

    Ok(obj)
}

/// Reads `stream ... endstream` following `dict`. The payload length comes
/// from `/Length` when it is a usable non-negative integer (following a
/// reference if needed); otherwise the data is scanned for the `endstream`
/// keyword and a single trailing EOL (or space) is stripped.
fn parse_stream_body(
    dict: Dictionary,
    lexer: &mut Lexer,
    r: &impl ResolveRef,
    ctx: Option<&Context>,
) -> Result<PdfStream> {
    let start = t!(lexer.next_stream());

    let length = match dict.get("Length") {
        Some(&Primitive::Int(n)) if n >= 0 => Some(n as usize),
        Some(&Primitive::Reference(reference)) => match r.resolve_ref(reference) {
            Ok(Primitive::Int(n)) if n >= 0 => Some(n as usize),
            _ => None,
        },
        _ => None,
    };

    // verify the keyword actually follows; a bad /Length falls back to scanning
    let length = match length {
        Some(n) if stream_end_plausible(lexer, start + n) => Some(n),
        _ => None,
    };

    let data = match length {
        Some(n) => {
            lexer.set_pos(start + n);
            t!(lexer.slice(start..start + n)).to_vec()
        }
        None => {
            warn!("stream without usable /Length - scanning for endstream");
            let end = lexer
                .find_substr(b"endstream")
                .ok_or(PdfError::NotFound { word: "endstream".into() })?;
            let mut data = t!(lexer.slice(start..end)).to_vec();
            // the EOL before `endstream` belongs to the keyword, not the data
            match data.last() {
                Some(b'\n') => {
                    data.pop();
                    if data.last() == Some(&b'\r') {
                        data.pop();
                    }
                }
                Some(b'\r') | Some(b' ') => {
                    data.pop();
                }
                _ => {}
            }
            lexer.set_pos(end);
            data
        }
    };

    t!(lexer.next_expect("endstream"));

    let data = match ctx {
        Some(ctx) => t!(ctx.decrypt(data)),
        None => data,
    };
    Ok(PdfStream::new(dict, data))
}

fn stream_end_plausible(lexer: &Lexer, end: usize) -> bool {
    let mut probe = *lexer;
    if end > probe.len() {
        return false;
    }
    probe.set_pos(end);
    matches!(probe.next(), Ok(word) if word.equals(b"endstream"))
}

/// Parses `<n> <gen> obj <object> endobj` at the lexer position.
pub fn parse_indirect_object(
    lexer: &mut Lexer,
    r: &impl ResolveRef,
    decoder: Option<&Decoder>,
) -> Result<(PlainRef, Primitive)> {
    let obj_nr = t!(lexer.next_as::<ObjNr>());
    let gen_nr = t!(lexer.next_as::<GenNr>());
    t!(lexer.next_expect("obj"));

    let id = PlainRef { id: obj_nr, gen: gen_nr };
    let ctx = Context { decoder, id };
    let obj = t!(parse_with_lexer_ctx(lexer, r, Some(&ctx), ParseFlags::ANY, MAX_DEPTH));

    t!(lexer.next_expect("endobj"));

    Ok((id, obj))
}

/// Like `parse_indirect_object` but insists on a stream (xref streams).
pub fn parse_indirect_stream(lexer: &mut Lexer, r: &impl ResolveRef) -> Result<(PlainRef, PdfStream)> {
    let (id, obj) = t!(parse_indirect_object(lexer, r, None));
    match obj {
        Primitive::Stream(s) => Ok((id, s)),
        p => Err(PdfError::UnexpectedPrimitive { expected: "Stream", found: p.get_debug_name() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::Primitive;

    fn parse_one(data: &[u8]) -> Primitive {
        parse(data, &NoResolve).unwrap()
    }

    #[test]
    fn primitives() {
        assert_eq!(parse_one(b"42"), Primitive::Int(42));
        assert_eq!(parse_one(b"-3"), Primitive::Int(-3));
        assert_eq!(parse_one(b"3.14"), Primitive::Real(3.14));
        assert_eq!(parse_one(b"-.5"), Primitive::Real(-0.5));
        assert_eq!(parse_one(b"true"), Primitive::Bool(true));
        assert_eq!(parse_one(b"null"), Primitive::Null);
    }

    #[test]
    fn name_with_escape() {
        match parse_one(b"/A#20name") {
            Primitive::Name(n) => assert_eq!(n.as_bytes(), b"A name"),
            p => panic!("{:?}", p),
        }
    }

    #[test]
    fn reference_vs_int_array() {
        let arr = parse_one(b"[1 2 R 3]").into_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0], Primitive::Reference(PlainRef { id: 1, gen: 2 }));
        assert_eq!(arr[1], Primitive::Int(3));

        let arr = parse_one(b"[1 2 3]").into_array().unwrap();
        assert_eq!(arr, vec![Primitive::Int(1), Primitive::Int(2), Primitive::Int(3)]);
    }

    #[test]
    fn dict_with_empty_name() {
        let dict = parse_one(b"<</App<</Name/>>>>").into_dictionary().unwrap();
        let app = dict.get("App").unwrap().as_dictionary().unwrap();
        assert_eq!(app.get("Name").unwrap().as_name().unwrap().as_bytes(), b"");
    }

    #[test]
    fn stream_with_length() {
        let mut lexer = Lexer::new(b"1 0 obj <</Length 5>> stream\nHELLO\nendstream endobj");
        let (id, obj) = parse_indirect_object(&mut lexer, &NoResolve, None).unwrap();
        assert_eq!(id, PlainRef { id: 1, gen: 0 });
        let stream = obj.into_stream().unwrap();
        assert_eq!(stream.raw, b"HELLO");
    }

    #[test]
    fn stream_without_length_scans() {
        let mut lexer = Lexer::new(b"7 0 obj <<>> stream\nBODY BYTES\nendstream endobj");
        let (_, obj) = parse_indirect_object(&mut lexer, &NoResolve, None).unwrap();
        let stream = obj.into_stream().unwrap();
        assert_eq!(stream.raw, b"BODY BYTES");
    }

    #[test]
    fn stream_with_lying_length_scans() {
        let mut lexer = Lexer::new(b"7 0 obj <</Length 3>> stream\nBODY BYTES\nendstream endobj");
        let (_, obj) = parse_indirect_object(&mut lexer, &NoResolve, None).unwrap();
        let stream = obj.into_stream().unwrap();
        assert_eq!(stream.raw, b"BODY BYTES");
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let mut data = Vec::new();
        for _ in 0..MAX_DEPTH + 8 {
            data.extend_from_slice(b"[");
        }
        assert!(matches!(parse(&data, &NoResolve), Err(PdfError::MaxDepth)));
    }

    #[test]
    fn roundtrip() {
        let source = b"<</Kind/Test#2fCase/Nums[1 2.5 -3]/S(par(en)s)/H<0a1b2c>/Flag false>>";
        let v = parse_one(source);
        let mut out = Vec::new();
        v.serialize(&mut out).unwrap();
        assert_eq!(parse_one(&out), v);
    }
}
