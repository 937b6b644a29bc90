//! Push-style streaming XML driver.
//!
//! Bytes arrive in arbitrary chunks through `feed`. Complete markup is parsed
//! with `quick_xml` and dispatched to a [`SaxHandler`] as element and
//! character events; a tag or text run cut by a chunk boundary is held back
//! until the next chunk completes it. Only the unparsed tail is kept in
//! memory, never the whole document. Any other syntax error, including an end
//! tag that does not close the innermost open element, fails the parser at
//! the chunk that contains it.

use std::borrow::Cow;

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader as XmlReader;

use crate::error::ParseError;

/// Attributes of a start tag, in document order, as qualified names.
#[derive(Debug, Default)]
pub struct Attrs(Vec<(String, String)>);

impl Attrs {
    fn from_start(e: &BytesStart<'_>) -> Self {
        let attrs = e
            .attributes()
            .flatten()
            .map(|attr| {
                let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                let value = match attr.unescape_value() {
                    Ok(v) => v.into_owned(),
                    Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
                };
                (key, value)
            })
            .collect();
        Attrs(attrs)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Receiver of element events. Names are qualified (`dc:title`, `opf:item`).
pub trait SaxHandler {
    fn start_element(&mut self, name: &str, attrs: &Attrs);
    fn end_element(&mut self, name: &str);
    fn characters(&mut self, text: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Ready,
    Finished,
    Failed,
}

/// Incremental parser wrapping a handler. `setup` must be called before the
/// first `feed`; after a syntax error the parser is inert and every further
/// `feed` consumes nothing.
pub struct XmlPushParser<H> {
    document: &'static str,
    handler: H,
    pending: Vec<u8>,
    /// Names of the elements opened so far and not yet closed.
    open: Vec<String>,
    remaining: usize,
    phase: Phase,
}

impl<H: SaxHandler> XmlPushParser<H> {
    /// `total_size` is the full document length; the chunk that brings the
    /// fed byte count to it is treated as the end of input.
    pub fn new(document: &'static str, handler: H, total_size: usize) -> Self {
        Self {
            document,
            handler,
            pending: Vec::new(),
            open: Vec::new(),
            remaining: total_size,
            phase: Phase::Idle,
        }
    }

    pub fn setup(&mut self) -> Result<(), ParseError> {
        match self.phase {
            Phase::Idle | Phase::Ready => {
                self.phase = Phase::Ready;
                Ok(())
            }
            Phase::Finished | Phase::Failed => Err(ParseError::Inactive {
                document: self.document,
            }),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    pub fn is_failed(&self) -> bool {
        self.phase == Phase::Failed
    }

    /// Feed the next chunk. Returns the number of bytes consumed: all of them,
    /// or 0 once the parser is torn down.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        if self.phase != Phase::Ready {
            tracing::warn!("{} parser is not ready, dropping {} bytes", self.document, data.len());
            return 0;
        }

        self.pending.extend_from_slice(data);
        self.remaining = self.remaining.saturating_sub(data.len());
        let is_final = self.remaining == 0;

        match self.drain(is_final) {
            Ok(()) => {
                if is_final {
                    self.phase = Phase::Finished;
                }
                data.len()
            }
            Err(e) => {
                tracing::warn!("{}", e);
                self.phase = Phase::Failed;
                self.pending = Vec::new();
                0
            }
        }
    }

    fn drain(&mut self, is_final: bool) -> Result<(), ParseError> {
        let mut pending = std::mem::take(&mut self.pending);
        let mut consumed = 0usize;
        {
            let mut reader = XmlReader::from_reader(pending.as_slice());
            let config = reader.config_mut();
            config.expand_empty_elements = true;
            // Elements opened in an earlier chunk close in a later one, so
            // end names are matched against `self.open` instead.
            config.check_end_names = false;
            config.allow_unmatched_ends = true;

            loop {
                let event = match reader.read_event() {
                    Ok(event) => event,
                    // Markup cut by the chunk boundary; wait for more input.
                    Err(quick_xml::Error::Syntax(ref err))
                        if !is_final && cut_by_boundary(err, &pending[consumed..]) =>
                    {
                        break
                    }
                    Err(e) => {
                        return Err(ParseError::Syntax {
                            document: self.document,
                            detail: format!("at byte {}: {e}", reader.buffer_position()),
                        })
                    }
                };
                let end = reader.buffer_position() as usize;

                match event {
                    Event::Eof => {
                        consumed = pending.len();
                        break;
                    }
                    Event::Text(_) if !is_final && end >= pending.len() => break,
                    Event::Start(ref e) => {
                        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                        self.handler.start_element(&name, &Attrs::from_start(e));
                        self.open.push(name);
                    }
                    Event::End(ref e) => {
                        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                        match self.open.pop() {
                            Some(open) if open == name => {}
                            Some(open) => {
                                return Err(ParseError::Syntax {
                                    document: self.document,
                                    detail: format!("</{name}> closes <{open}>"),
                                })
                            }
                            None => {
                                return Err(ParseError::Syntax {
                                    document: self.document,
                                    detail: format!("</{name}> without a matching start tag"),
                                })
                            }
                        }
                        self.handler.end_element(&name);
                    }
                    Event::Text(ref t) => {
                        let text = match t.unescape() {
                            Ok(s) => s,
                            Err(_) => Cow::Owned(String::from_utf8_lossy(t).into_owned()),
                        };
                        self.handler.characters(&text);
                    }
                    Event::CData(ref t) => {
                        self.handler.characters(&String::from_utf8_lossy(t));
                    }
                    _ => {}
                }
                consumed = end;
            }
        }

        pending.drain(..consumed);
        if is_final && !pending.is_empty() {
            return Err(ParseError::Syntax {
                document: self.document,
                detail: "unexpected end of document".to_string(),
            });
        }
        if is_final {
            if let Some(open) = self.open.last() {
                return Err(ParseError::Syntax {
                    document: self.document,
                    detail: format!("<{open}> is never closed"),
                });
            }
        }
        self.pending = pending;
        Ok(())
    }
}

/// Whether a syntax error at `tail` only means the construct has not been
/// fully received yet.
fn cut_by_boundary(err: &SyntaxError, tail: &[u8]) -> bool {
    let lacks = |terminator: &[u8]| !tail.windows(terminator.len()).any(|w| w == terminator);
    match err {
        SyntaxError::UnclosedComment => lacks(b"-->"),
        SyntaxError::UnclosedCData => lacks(b"]]>"),
        SyntaxError::UnclosedPIOrXmlDecl => lacks(b"?>"),
        // `<!` arrived without the byte that says what follows.
        SyntaxError::InvalidBangMarkup => tail == b"<!",
        // A quoted attribute value may hold `>`; the reader already scanned to the end.
        SyntaxError::UnclosedTag | SyntaxError::UnclosedDoctype => true,
    }
}
