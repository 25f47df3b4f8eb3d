//! Content streams: a flat sequence of (operands..., operator) groups.

use itertools::Itertools;
use std::fmt::{Display, Formatter};
use std::mem::take;

use crate::error::*;
use crate::parser::{is_delimiter, is_whitespace, parse_with_lexer, Lexer, NoResolve, ParseFlags};
use crate::primitive::{Dictionary, PdfString, Primitive};

/// One operation in a content stream.
#[derive(Debug, Clone)]
pub struct Operation {
    pub operator: String,
    pub operands: Vec<Primitive>,
}

impl Operation {
    pub fn new(operator: impl Into<String>, operands: Vec<Primitive>) -> Operation {
        Operation { operator: operator.into(), operands }
    }
}

/// A parsed content stream.
#[derive(Debug, Default)]
pub struct Content {
    pub operations: Vec<Operation>,
}

impl Content {
    pub fn parse_from(data: &[u8]) -> Result<Content> {
        let mut lexer = Lexer::new(data);
        let mut content = Content { operations: Vec::new() };
        let mut buffer = Vec::new();

        loop {
            if lexer.get_pos() >= data.len() {
                break;
            }
            let backup_pos = lexer.get_pos();
            match parse_with_lexer(&mut lexer, &NoResolve, ParseFlags::ANY) {
                Ok(obj) => buffer.push(obj),
                Err(e) if e.is_eof() => break,
                Err(_) => {
                    // not an operand - an operator
                    lexer.set_pos(backup_pos);
                    let operator = match lexer.next() {
                        Ok(op) => op.to_string(),
                        Err(e) if e.is_eof() => break,
                        Err(e) => return Err(e),
                    };
                    if operator == "BI" {
                        let op = t!(parse_inline_image(&mut lexer));
                        buffer.clear();
                        content.operations.push(op);
                    } else {
                        content.operations.push(Operation::new(operator, take(&mut buffer)));
                    }
                }
            }
            if lexer.get_pos() > data.len() {
                err!(PdfError::ContentReadPastBoundary);
            }
        }
        Ok(content)
    }
}

/// `BI <pairs> ID <binary> EI`, surfaced as a `BI` operation whose operands
/// are the parameter dictionary and the raw (still filtered) bytes.
fn parse_inline_image(lexer: &mut Lexer) -> Result<Operation> {
    let mut dict = Dictionary::new();
    loop {
        let token = t!(lexer.next());
        if token.equals(b"ID") {
            break;
        }
        if !token.starts_with(b"/") {
            err!(PdfError::UnexpectedLexeme {
                pos: lexer.get_pos(),
                lexeme: token.to_string(),
                expected: "/ or ID",
            });
        }
        let key = t!(crate::parser::decode_name(&token));
        let value = t!(parse_with_lexer(lexer, &NoResolve, ParseFlags::ANY));
        dict.insert(key, value);
    }

    // exactly one whitespace byte separates ID from the sample data
    let rest = lexer.get_remaining_slice();
    let mut start = 0;
    if rest.first().map(|&b| is_whitespace(b)).unwrap_or(false) {
        start = 1;
    }

    // find `EI` followed by whitespace, a delimiter or EOF; image bytes may
    // contain anything else
    let mut i = start;
    let end = loop {
        match rest[i..].windows(2).position(|w| w == b"EI") {
            Some(off) => {
                let at = i + off;
                let right_ok = rest
                    .get(at + 2)
                    .map(|&b| is_whitespace(b) || is_delimiter(b))
                    .unwrap_or(true);
                if right_ok {
                    break at;
                }
                i = at + 1;
            }
            None => err!(PdfError::NotFound { word: "EI".into() }),
        }
    };

    let mut data = rest[start..end].to_vec();
    if data.last().map(|&b| is_whitespace(b)).unwrap_or(false) {
        data.pop();
    }
    lexer.offset_pos(end + 2);

    Ok(Operation::new(
        "BI",
        vec![Primitive::Dictionary(dict), Primitive::String(PdfString::new(data))],
    ))
}

impl Display for Content {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        for operation in &self.operations {
            writeln!(f, "  {}", operation)?;
        }
        Ok(())
    }
}
impl Display for Operation {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{} : {}", self.operator, self.operands.iter().format(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operands_group_under_operator() {
        let content = Content::parse_from(b"1 0 0 1 50 50 cm BT /F1 12 Tf (Hi) Tj ET").unwrap();
        let ops: Vec<&str> = content.operations.iter().map(|o| o.operator.as_str()).collect();
        assert_eq!(ops, ["cm", "BT", "Tf", "Tj", "ET"]);
        assert_eq!(content.operations[0].operands.len(), 6);
        assert_eq!(content.operations[2].operands.len(), 2);
    }

    #[test]
    fn quote_operators() {
        let content = Content::parse_from(b"(a) ' 1 2 (b) \"").unwrap();
        assert_eq!(content.operations[0].operator, "'");
        assert_eq!(content.operations[1].operator, "\"");
        assert_eq!(content.operations[1].operands.len(), 3);
    }

    #[test]
    fn inline_image() {
        let content = Content::parse_from(b"BI /W 2 /H 2 /BPC 8 /CS /G ID \x00\x11\x22EI Q").unwrap();
        assert_eq!(content.operations[0].operator, "BI");
        let dict = content.operations[0].operands[0].as_dictionary().unwrap();
        assert_eq!(dict.get("W").unwrap().as_int().unwrap(), 2);
        let data = content.operations[0].operands[1].as_string().unwrap();
        assert_eq!(data.as_bytes(), [0x00, 0x11, 0x22]);
        assert_eq!(content.operations[1].operator, "Q");
    }

    #[test]
    fn tj_array() {
        let content = Content::parse_from(b"[(Complete L)20(egend)]TJ").unwrap();
        assert_eq!(content.operations[0].operator, "TJ");
        let arr = content.operations[0].operands[0].as_array().unwrap();
        assert_eq!(arr.len(), 3);
    }
}
