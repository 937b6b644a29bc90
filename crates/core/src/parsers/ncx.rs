//! EPUB 2 NCX table of contents.
//!
//! A navPoint's `<navLabel>` has to come before its `<content>`: the entry is
//! emitted when `</content>` closes, using whatever label has been seen. A
//! navPoint that nests children before its own label loses its entry.

use std::io;

use crate::error::ParseError;
use crate::parsers::{resolve_toc_target, IndexSink};
use crate::xml::{Attrs, SaxHandler, XmlPushParser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NcxState {
    Start,
    InNcx,
    InNavMap,
    InNavPoint,
    InNavLabel,
    InNavLabelText,
}

struct NcxHandler<'a> {
    state: NcxState,
    base_content_path: String,
    sink: Option<&'a mut dyn IndexSink>,
    current_depth: u8,
    current_label: String,
    current_src: String,
    emitted: usize,
}

impl SaxHandler for NcxHandler<'_> {
    fn start_element(&mut self, name: &str, attrs: &Attrs) {
        match (self.state, name) {
            (NcxState::Start, "ncx") => self.state = NcxState::InNcx,
            (NcxState::InNcx, "navMap") => self.state = NcxState::InNavMap,
            (NcxState::InNavMap | NcxState::InNavPoint, "navPoint") => {
                self.state = NcxState::InNavPoint;
                self.current_depth = self.current_depth.saturating_add(1);
                self.current_label.clear();
                self.current_src.clear();
            }
            (NcxState::InNavPoint, "navLabel") => self.state = NcxState::InNavLabel,
            (NcxState::InNavLabel, "text") => self.state = NcxState::InNavLabelText,
            (NcxState::InNavPoint, "content") => {
                if let Some(src) = attrs.get("src") {
                    self.current_src = src.to_string();
                }
            }
            _ => {}
        }
    }

    fn end_element(&mut self, name: &str) {
        match (self.state, name) {
            (NcxState::InNavLabelText, "text") => self.state = NcxState::InNavLabel,
            (NcxState::InNavLabel, "navLabel") => self.state = NcxState::InNavPoint,
            (NcxState::InNavPoint, "navPoint") => {
                self.current_depth = self.current_depth.saturating_sub(1);
                if self.current_depth == 0 {
                    self.state = NcxState::InNavMap;
                }
            }
            (NcxState::InNavPoint, "content") => {
                let label = self.current_label.trim();
                if label.is_empty() || self.current_src.is_empty() {
                    tracing::debug!("Skipping navPoint without label or content src");
                    return;
                }
                let (href, anchor) = resolve_toc_target(&self.base_content_path, &self.current_src);
                if let Some(sink) = self.sink.as_mut() {
                    sink.create_toc_entry(label, &href, &anchor, self.current_depth);
                    self.emitted += 1;
                }
                self.current_label.clear();
                self.current_src.clear();
            }
            _ => {}
        }
    }

    fn characters(&mut self, text: &str) {
        if self.state == NcxState::InNavLabelText {
            self.current_label.push_str(text);
        }
    }
}

/// Streams an NCX document; entry level is the navPoint nesting depth.
pub struct TocNcxParser<'a> {
    inner: XmlPushParser<NcxHandler<'a>>,
}

impl<'a> TocNcxParser<'a> {
    /// `base_content_path` is the OPF's directory; `content src` values are
    /// relative to it.
    pub fn new(base_content_path: &str, total_size: usize, sink: Option<&'a mut dyn IndexSink>) -> Self {
        let handler = NcxHandler {
            state: NcxState::Start,
            base_content_path: base_content_path.to_string(),
            sink,
            current_depth: 0,
            current_label: String::new(),
            current_src: String::new(),
            emitted: 0,
        };
        Self {
            inner: XmlPushParser::new("toc.ncx", handler, total_size),
        }
    }

    pub fn setup(&mut self) -> Result<(), ParseError> {
        self.inner.setup()
    }

    pub fn entry_count(&self) -> usize {
        self.inner.handler().emitted
    }

    pub fn is_failed(&self) -> bool {
        self.inner.is_failed()
    }
}

impl io::Write for TocNcxParser<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.inner.feed(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
