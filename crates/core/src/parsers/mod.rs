//! Streaming parsers for the EPUB package documents.
//!
//! Each parser implements `std::io::Write`, so an archive entry can be
//! streamed straight into it. `write` reports the bytes consumed: the full
//! chunk, or 0 once the parser has torn itself down after a syntax error.

pub mod container;
pub mod nav;
pub mod ncx;
pub mod opf;

pub use container::ContainerParser;
pub use nav::TocNavParser;
pub use ncx::TocNcxParser;
pub use opf::ContentOpfParser;

/// Destination for the records produced while parsing. Implemented by the
/// book index builder; spine entries must all arrive before the first TOC entry.
pub trait IndexSink {
    fn create_spine_entry(&mut self, href: &str);
    fn create_toc_entry(&mut self, title: &str, href: &str, anchor: &str, level: u8);
}

/// Split a resolved TOC target into `(href, anchor)` and normalise the path.
pub(crate) fn resolve_toc_target(base_path: &str, raw_href: &str) -> (String, String) {
    let joined = crate::path::normalise_path(&format!("{base_path}{raw_href}"));
    let (href, anchor) = crate::path::split_fragment(&joined);
    (href.to_string(), anchor.to_string())
}
