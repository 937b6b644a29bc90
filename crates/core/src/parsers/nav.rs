//! EPUB 3 navigation document (`<nav epub:type="toc">`).

use std::io;

use crate::error::ParseError;
use crate::parsers::{resolve_toc_target, IndexSink};
use crate::xml::{Attrs, SaxHandler, XmlPushParser};

/// Ordered: everything at or past `InNavToc` is inside the TOC nav.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum NavState {
    Start,
    InHtml,
    InBody,
    InNavToc,
    InOl,
    InLi,
    InAnchor,
}

struct NavHandler<'a> {
    state: NavState,
    base_content_path: String,
    sink: Option<&'a mut dyn IndexSink>,
    ol_depth: u8,
    current_label: String,
    current_href: String,
    emitted: usize,
}

impl SaxHandler for NavHandler<'_> {
    fn start_element(&mut self, name: &str, attrs: &Attrs) {
        if name == "html" {
            self.state = NavState::InHtml;
            return;
        }
        if self.state == NavState::InHtml && name == "body" {
            self.state = NavState::InBody;
            return;
        }
        if self.state >= NavState::InBody && name == "nav" {
            let is_toc = attrs
                .iter()
                .any(|(k, v)| (k == "epub:type" || k == "type") && v == "toc");
            if is_toc {
                tracing::debug!("Found nav toc element");
                self.state = NavState::InNavToc;
            }
            return;
        }
        if self.state < NavState::InNavToc {
            return;
        }

        match name {
            "ol" => {
                self.ol_depth = self.ol_depth.saturating_add(1);
                self.state = NavState::InOl;
            }
            "li" if self.state == NavState::InOl => {
                self.state = NavState::InLi;
                self.current_label.clear();
                self.current_href.clear();
            }
            "a" if self.state == NavState::InLi => {
                self.state = NavState::InAnchor;
                if let Some(href) = attrs.get("href") {
                    self.current_href = href.to_string();
                }
            }
            _ => {}
        }
    }

    fn end_element(&mut self, name: &str) {
        match name {
            "a" if self.state == NavState::InAnchor => {
                let label = self.current_label.trim();
                if !label.is_empty() && !self.current_href.is_empty() {
                    let (href, anchor) = resolve_toc_target(&self.base_content_path, &self.current_href);
                    if let Some(sink) = self.sink.as_mut() {
                        sink.create_toc_entry(label, &href, &anchor, self.ol_depth);
                        self.emitted += 1;
                    }
                    self.current_label.clear();
                    self.current_href.clear();
                }
                self.state = NavState::InLi;
            }
            "li" if matches!(self.state, NavState::InLi | NavState::InOl) => {
                self.state = NavState::InOl;
            }
            "ol" if self.state >= NavState::InNavToc => {
                self.ol_depth = self.ol_depth.saturating_sub(1);
                self.state = if self.ol_depth == 0 {
                    NavState::InNavToc
                } else {
                    NavState::InLi
                };
            }
            "nav" if self.state >= NavState::InNavToc => {
                tracing::debug!("Finished parsing nav toc");
                self.state = NavState::InBody;
            }
            _ => {}
        }
    }

    fn characters(&mut self, text: &str) {
        if self.state == NavState::InAnchor {
            self.current_label.push_str(text);
        }
    }
}

/// Streams a nav document and emits one TOC entry per `<a>` inside the toc
/// nav. The entry level is the `<ol>` nesting depth.
pub struct TocNavParser<'a> {
    inner: XmlPushParser<NavHandler<'a>>,
}

impl<'a> TocNavParser<'a> {
    /// `base_content_path` is the nav document's own directory.
    pub fn new(base_content_path: &str, total_size: usize, sink: Option<&'a mut dyn IndexSink>) -> Self {
        let handler = NavHandler {
            state: NavState::Start,
            base_content_path: base_content_path.to_string(),
            sink,
            ol_depth: 0,
            current_label: String::new(),
            current_href: String::new(),
            emitted: 0,
        };
        Self {
            inner: XmlPushParser::new("nav", handler, total_size),
        }
    }

    pub fn setup(&mut self) -> Result<(), ParseError> {
        self.inner.setup()
    }

    /// Number of TOC entries handed to the sink so far.
    pub fn entry_count(&self) -> usize {
        self.inner.handler().emitted
    }

    pub fn is_failed(&self) -> bool {
        self.inner.is_failed()
    }
}

impl io::Write for TocNavParser<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.inner.feed(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
