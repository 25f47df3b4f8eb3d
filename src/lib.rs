#![allow(clippy::len_zero, clippy::should_implement_trait, clippy::manual_map, clippy::too_many_arguments)]

#[macro_use] extern crate snafu;
#[macro_use] extern crate log;

#[macro_use]
pub mod error;
pub mod scan;
pub mod primitive;
pub mod parser;
pub mod xref;
pub mod enc;
pub mod crypt;
pub mod backend;
pub mod file;
pub mod content;
pub mod font;
pub mod jpeg;
pub mod jpx;
pub mod render;
pub mod document;

pub use crate::document::{open, DecodedImage, Document, FileKind};
pub use crate::error::PdfError;
pub use crate::render::page::RenderFlags;
pub use crate::render::{Bitmap, BitmapFormat, Color};
