use std::error::Error;
use std::io;

#[derive(Debug, Snafu)]
pub enum PdfError {
    // Lexing and object syntax
    #[snafu(display("unexpected end of input"))]
    EOF,

    #[snafu(display("unrecognized file format"))]
    NotFormat,

    #[snafu(display("number conversion failed: {}", source))]
    Parse { source: Box<dyn Error + Send + Sync> },

    #[snafu(display("found '{}' at offset {} where '{}' was required", lexeme, pos, expected))]
    UnexpectedLexeme { pos: usize, lexeme: String, expected: &'static str },

    #[snafu(display("no object can start with '{}' (offset {})", first_lexeme, pos))]
    UnknownType { pos: usize, first_lexeme: String },

    #[snafu(display("could not locate '{}'", word))]
    NotFound { word: String },

    #[snafu(display("nesting deeper than the recursion ceiling"))]
    MaxDepth,

    #[snafu(display("xref stream entry has type {}; only 0, 1 and 2 exist", found))]
    XRefStreamType { found: u64 },

    #[snafu(display("content parsing ran past the end of the stream"))]
    ContentReadPastBoundary,

    // Filters
    #[snafu(display("bytes {:?} near offset {} are not hex digits", bytes, pos))]
    HexDecode { pos: usize, bytes: [u8; 2] },

    #[snafu(display("truncated or out-of-range ascii85 group"))]
    Ascii85TailError,

    #[snafu(display("predictor {} is not defined", n))]
    IncorrectPredictorType { n: u8 },

    #[snafu(display("no decoder for filter /{}", name))]
    UnsupportedFilter { name: String },

    // Image codecs
    #[snafu(display("broken image data: {}", msg))]
    MalformedImage { msg: String },

    #[snafu(display("image feature outside the supported profile: {}", msg))]
    UnsupportedImage { msg: String },

    // Dictionaries and object access
    #[snafu(display("{} dictionary lacks the required /{} entry", typ, field))]
    MissingEntry { typ: &'static str, field: String },

    #[snafu(display("wanted a {} here, got a {}", expected, found))]
    UnexpectedPrimitive { expected: &'static str, found: &'static str },

    #[snafu(display("gave up chasing references after {} links", depth))]
    RefChainDepth { depth: usize },

    #[snafu(display("object stream holds {} objects; index {} requested", max, index))]
    ObjStmOutOfBounds { index: usize, max: usize },

    #[snafu(display("page index {} is past the last page ({})", page_nr, max))]
    PageOutOfBounds { page_nr: u32, max: u32 },

    #[snafu(display("the page tree has no leaf for index {}", page_nr))]
    PageNotFound { page_nr: u32 },

    // Encryption
    #[snafu(display("neither the user nor the owner password matched"))]
    Unauthorized,

    #[snafu(display("security handler not supported: {}", msg))]
    UnsupportedEncryption { msg: String },

    #[snafu(display("ciphertext would not decrypt"))]
    DecryptionFailure,

    // Limits and plumbing
    #[snafu(display("bounded resource exhausted: {}", msg))]
    ResourceLimit { msg: String },

    #[snafu(display("I/O failure"))]
    Io { source: io::Error },

    #[snafu(display("{}", msg))]
    Other { msg: String },

    #[snafu(display("nothing where a value was required, at {}:{}:{}", file, line, column))]
    NoneError { file: &'static str, line: u32, column: u32 },
}

impl PdfError {
    pub fn is_eof(&self) -> bool {
        matches!(self, PdfError::EOF)
    }
}

pub type Result<T, E = PdfError> = std::result::Result<T, E>;

impl From<io::Error> for PdfError {
    fn from(source: io::Error) -> PdfError {
        PdfError::Io { source }
    }
}
impl From<String> for PdfError {
    fn from(msg: String) -> PdfError {
        PdfError::Other { msg }
    }
}

// the string-to-number conversions the lexer leans on all funnel into Parse
macro_rules! parse_error_from {
    ($($source:ty),+) => {
        $(impl From<$source> for PdfError {
            fn from(e: $source) -> PdfError {
                PdfError::Parse { source: Box::new(e) }
            }
        })+
    };
}
parse_error_from!(
    std::str::Utf8Error,
    std::string::FromUtf8Error,
    std::num::ParseIntError,
    std::num::ParseFloatError
);

/// Unwraps an `Option`, converting `None` into a located `NoneError`.
#[macro_export]
macro_rules! try_opt {
    ($opt:expr) => {
        if let Some(value) = $opt {
            value
        } else {
            return Err($crate::PdfError::NoneError {
                file: file!(),
                line: line!(),
                column: column!(),
            });
        }
    };
}

macro_rules! t {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => {
                debug!("{}:{}: {}", file!(), line!(), e);
                return Err(e.into());
            }
        }
    };
}

macro_rules! err {
    ($e:expr) => {
        return Err($e)
    };
}
macro_rules! bail {
    ($($fmt:tt)*) => {
        return Err($crate::PdfError::Other { msg: format!($($fmt)*) })
    };
}
