use crate::enc;
use crate::error::*;
use crate::parser::lexer::Lexer;
use crate::parser::{parse_indirect_stream, parse_with_lexer, NoResolve, ParseFlags};
use crate::primitive::{Dictionary, GenNr, ObjNr, Primitive};
use crate::xref::{XRef, XRefSection};

/// One packed entry out of an xref stream. Missing type field defaults to 1
/// (in use), missing gen/index to 0.
fn parse_xref_stream_entry(width: [usize; 3], data: &mut &[u8]) -> Result<XRef> {
    let typ = if width[0] == 0 { 1 } else { read_uint(width[0], data)? };
    let field1 = read_uint(width[1], data)?;
    let field2 = read_uint(width[2], data)?;
    match typ {
        0 => Ok(XRef::Free { next_obj_nr: field1 as ObjNr, gen_nr: field2 as GenNr }),
        1 => Ok(XRef::Raw { pos: field1 as usize, gen_nr: field2 as GenNr }),
        2 => Ok(XRef::Stream { stream_id: field1 as ObjNr, index: field2 as usize }),
        found => Err(PdfError::XRefStreamType { found }),
    }
}

fn read_uint(width: usize, data: &mut &[u8]) -> Result<u64> {
    if width > 8 {
        bail!("xref stream entry has invalid width {}", width);
    }
    if width > data.len() {
        return Err(PdfError::EOF);
    }
    let mut result = 0;
    for &b in &data[..width] {
        result = result << 8 | b as u64;
    }
    *data = &data[width..];
    Ok(result)
}

/// Xref stream: an indirect stream object with `/Type /XRef`, entries packed
/// per `/W` over the `/Index` subsections. The stream dictionary doubles as
/// the trailer.
pub fn parse_xref_stream_and_trailer(lexer: &mut Lexer) -> Result<(Vec<XRefSection>, Dictionary)> {
    let (_, stream) = t!(parse_indirect_stream(lexer, &NoResolve));
    let trailer = stream.info.clone();

    let data = t!(enc::decode_stream(&stream)).into_owned();
    let mut data_left = &data[..];

    let width_arr = t!(trailer.require("XRef", "W")).as_array()?;
    if width_arr.len() != 3 {
        bail!("xref stream /W has {} elements", width_arr.len());
    }
    let mut width = [0usize; 3];
    for (w, p) in width.iter_mut().zip(width_arr) {
        *w = p.as_usize()?;
    }

    let size = t!(trailer.require("XRef", "Size")).as_u32()?;
    let index: Vec<u32> = match trailer.get("Index") {
        Some(p) => {
            let arr = p.as_array()?;
            if arr.len() % 2 != 0 {
                bail!("xref stream /Index has odd length {}", arr.len());
            }
            arr.iter().map(|p| p.as_u32()).collect::<Result<_>>()?
        }
        None => vec![0, size],
    };

    let mut sections = Vec::new();
    for chunk in index.chunks_exact(2) {
        let (first_id, num_entries) = (chunk[0], chunk[1]);
        let mut section = XRefSection::new(first_id);
        for _ in 0..num_entries {
            if data_left.is_empty() {
                warn!("xref stream data ends short of /Index - truncating");
                break;
            }
            section.entries.push(t!(parse_xref_stream_entry(width, &mut data_left)));
        }
        sections.push(section);
    }

    Ok((sections, trailer))
}

/// Classic ASCII xref table: subsections of `first count` followed by 20-byte
/// entries, then the `trailer` dictionary.
pub fn parse_xref_table_and_trailer(lexer: &mut Lexer) -> Result<(Vec<XRefSection>, Dictionary)> {
    let mut sections = Vec::new();

    while t!(lexer.peek()) != "trailer" {
        let start_id = t!(lexer.next_as::<ObjNr>());
        let num_ids = t!(lexer.next_as::<u32>());

        let mut section = XRefSection::new(start_id);
        for i in 0..num_ids {
            let w1 = t!(lexer.next());
            if w1 == "trailer" {
                bail!("xref table declares {} entries, but only {} follow", num_ids, i);
            }
            let w2 = t!(lexer.next());
            let w3 = t!(lexer.next());
            if w3 == "f" {
                section.add_free_entry(t!(w1.to::<ObjNr>()), t!(w2.to::<GenNr>()));
            } else if w3 == "n" {
                section.add_inuse_entry(t!(w1.to::<usize>()), t!(w2.to::<GenNr>()));
            } else {
                err!(PdfError::UnexpectedLexeme {
                    pos: lexer.get_pos(),
                    lexeme: w3.to_string(),
                    expected: "f or n"
                });
            }
        }
        sections.push(section);
    }

    t!(lexer.next_expect("trailer"));
    let trailer = t!(parse_with_lexer(lexer, &NoResolve, ParseFlags::DICT)).into_dictionary()?;
    Ok((sections, trailer))
}

/// Dispatches on what sits at the lexer position: the `xref` keyword or an
/// xref stream object.
pub fn parse_xref_and_trailer_at(lexer: &mut Lexer) -> Result<(Vec<XRefSection>, Dictionary)> {
    if t!(lexer.peek()) == "xref" {
        t!(lexer.next());
        parse_xref_table_and_trailer(lexer)
    } else {
        parse_xref_stream_and_trailer(lexer)
    }
}
