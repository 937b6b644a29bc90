pub mod archive;
pub mod book_index;
pub mod config;
pub mod document;
pub mod epub;
pub mod error;
pub mod page;
pub mod parsers;
pub mod path;
pub mod position;
pub mod progress;
pub mod section;
pub mod serialization;
pub mod xml;

#[cfg(test)]
mod fixtures;

pub mod prelude {
    pub use crate::document::*;
    pub use crate::epub::Epub;
    pub use crate::error::*;
    pub use crate::page::{PageRecord, Paginator, PlainTextPaginator, TextPage};
    pub use crate::position::ReadingPosition;
    pub use crate::section::{RenderParams, SectionCache};
}
