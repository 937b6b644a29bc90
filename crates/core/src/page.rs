//! Page records and the paginator seam used by the section cache.
//!
//! The section cache only needs two things from a layout engine: a lazy
//! stream of pages for a chapter, and a way to read one page back from its
//! serialized bytes. [`PlainTextPaginator`] is a minimal engine that wraps
//! extracted text on a fixed character grid.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use serde::Serialize;

use crate::error::SectionError;
use crate::section::{ParagraphAlignment, RenderParams};
use crate::serialization::{read_string, write_string};

/// One laid-out page as stored in a section file.
pub trait PageRecord: Sized {
    fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()>;
    fn read_from<R: Read>(input: &mut R) -> io::Result<Self>;
}

pub type PageStream<'a, P> = Box<dyn Iterator<Item = Result<P, SectionError>> + 'a>;

/// Turns a chapter document on disk into pages for the given render parameters.
pub trait Paginator {
    type Page: PageRecord;

    fn paginate(&self, source: &Path, params: &RenderParams) -> Result<PageStream<'_, Self::Page>, SectionError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TextPage {
    pub lines: Vec<String>,
}

impl TextPage {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

impl PageRecord for TextPage {
    fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let count = u16::try_from(self.lines.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many lines on page"))?;
        out.write_u16::<LittleEndian>(count)?;
        for line in &self.lines {
            write_string(out, line)?;
        }
        Ok(())
    }

    fn read_from<R: Read>(input: &mut R) -> io::Result<Self> {
        let count = input.read_u16::<LittleEndian>()?;
        let lines = (0..count)
            .map(|_| read_string(input))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self { lines })
    }
}

const CHAR_WIDTH: u16 = 8;
const BOLD_CHAR_WIDTH: u16 = 9;
const LINE_HEIGHT: f32 = 16.0;

const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "h1", "h2", "h3", "h4", "h5", "h6", "li", "blockquote", "section", "tr", "dt", "dd", "pre",
];
const SKIPPED_ELEMENTS: &[&str] = &["head", "style", "script", "title"];

/// Fixed-grid text layout: one character cell is 8 px wide (9 px bold), one
/// line is 16 px scaled by the line compression.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextPaginator;

impl PlainTextPaginator {
    pub fn grid(params: &RenderParams) -> (usize, usize) {
        let cell = if params.force_bold { BOLD_CHAR_WIDTH } else { CHAR_WIDTH };
        let columns = usize::from(params.viewport_width / cell).max(1);
        let line_height = LINE_HEIGHT * params.line_compression.max(0.1);
        let rows = (f32::from(params.viewport_height) / line_height) as usize;
        (columns, rows.max(1))
    }
}

impl Paginator for PlainTextPaginator {
    type Page = TextPage;

    fn paginate(&self, source: &Path, params: &RenderParams) -> Result<PageStream<'_, TextPage>, SectionError> {
        let paragraphs = extract_paragraphs(source)?;
        let (columns, rows) = Self::grid(params);

        let mut lines = Vec::new();
        for (i, paragraph) in paragraphs.iter().enumerate() {
            if i > 0 && params.extra_paragraph_spacing {
                lines.push(String::new());
            }
            for line in wrap(paragraph, columns) {
                lines.push(align(line, columns, params.paragraph_alignment));
            }
        }
        tracing::debug!("Laid out {} lines at {columns}x{rows}", lines.len());

        let mut pending = lines.into_iter().peekable();
        Ok(Box::new(std::iter::from_fn(move || {
            pending.peek()?;
            let page: Vec<String> = pending.by_ref().take(rows).collect();
            Some(Ok(TextPage { lines: page }))
        })))
    }
}

fn extract_paragraphs(source: &Path) -> Result<Vec<String>, SectionError> {
    let file = File::open(source)?;
    let mut reader = XmlReader::from_reader(BufReader::new(file));
    let config = reader.config_mut();
    config.check_end_names = false;
    config.allow_unmatched_ends = true;

    let mut buf = Vec::new();
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut skip_depth = 0usize;

    let flush = |current: &mut String, paragraphs: &mut Vec<String>| {
        let text = current.split_whitespace().collect::<Vec<_>>().join(" ");
        if !text.is_empty() {
            paragraphs.push(text);
        }
        current.clear();
    };

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| SectionError::Pagination(format!("{}: {e}", source.display())))?;
        match event {
            Event::Start(ref e) => {
                let name = e.local_name();
                let name = String::from_utf8_lossy(name.as_ref()).into_owned();
                if SKIPPED_ELEMENTS.contains(&name.as_str()) {
                    skip_depth += 1;
                } else if BLOCK_ELEMENTS.contains(&name.as_str()) {
                    flush(&mut current, &mut paragraphs);
                }
            }
            Event::End(ref e) => {
                let name = e.local_name();
                let name = String::from_utf8_lossy(name.as_ref()).into_owned();
                if SKIPPED_ELEMENTS.contains(&name.as_str()) {
                    skip_depth = skip_depth.saturating_sub(1);
                } else if BLOCK_ELEMENTS.contains(&name.as_str()) {
                    flush(&mut current, &mut paragraphs);
                }
            }
            Event::Empty(ref e) if e.local_name().as_ref() == b"br" => {
                flush(&mut current, &mut paragraphs);
            }
            Event::Text(ref t) if skip_depth == 0 => {
                let text = t
                    .unescape()
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(t).into_owned());
                current.push_str(&text);
                current.push(' ');
            }
            Event::CData(ref t) if skip_depth == 0 => {
                current.push_str(&String::from_utf8_lossy(t));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    flush(&mut current, &mut paragraphs);
    Ok(paragraphs)
}

/// Greedy word wrap; words longer than a line are split.
fn wrap(paragraph: &str, columns: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut line = String::new();
    let mut line_len = 0usize;

    for word in paragraph.split_whitespace() {
        let mut chars: Vec<char> = word.chars().collect();
        while chars.len() > columns {
            if line_len > 0 {
                lines.push(std::mem::take(&mut line));
                line_len = 0;
            }
            lines.push(chars.drain(..columns).collect());
        }
        let word_len = chars.len();
        if word_len == 0 {
            continue;
        }
        let needed = if line_len == 0 { word_len } else { line_len + 1 + word_len };
        if needed > columns {
            lines.push(std::mem::take(&mut line));
            line_len = 0;
        }
        if line_len > 0 {
            line.push(' ');
            line_len += 1;
        }
        line.extend(chars);
        line_len += word_len;
    }
    if line_len > 0 {
        lines.push(line);
    }
    lines
}

fn align(line: String, columns: usize, alignment: ParagraphAlignment) -> String {
    let len = line.chars().count();
    let pad = columns.saturating_sub(len);
    match alignment {
        ParagraphAlignment::Center => format!("{}{line}", " ".repeat(pad / 2)),
        ParagraphAlignment::Right => format!("{}{line}", " ".repeat(pad)),
        ParagraphAlignment::Justified | ParagraphAlignment::Left | ParagraphAlignment::Book => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::chapter_xhtml;
    use pretty_assertions::assert_eq;

    fn params(width: u16, height: u16) -> RenderParams {
        RenderParams {
            viewport_width: width,
            viewport_height: height,
            extra_paragraph_spacing: false,
            ..RenderParams::default()
        }
    }

    #[test]
    fn test_wrap_splits_long_words() {
        assert_eq!(wrap("aa bbb c", 4), vec!["aa", "bbb", "c"]);
        assert_eq!(wrap("abcdefghij k", 4), vec!["abcd", "efgh", "ij k"]);
        assert!(wrap("   ", 4).is_empty());
    }

    #[test]
    fn test_paginate_skips_head_and_splits_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ch.html");
        std::fs::write(
            &path,
            chapter_xhtml("<h1>Title</h1><p>one two three four</p><p>five<br/>six &amp; seven</p>"),
        )
        .unwrap();

        // 10 columns, 2 rows
        let pages: Vec<TextPage> = PlainTextPaginator
            .paginate(&path, &params(80, 32))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let all: Vec<String> = pages.iter().flat_map(|p| p.lines.clone()).collect();
        assert_eq!(all, vec!["Title", "one two", "three four", "five", "six &", "seven"]);
        assert_eq!(pages.len(), 3);
        assert!(pages.iter().all(|p| p.lines.len() <= 2));
    }

    #[test]
    fn test_text_page_survives_serialization() {
        let page = TextPage {
            lines: vec!["first".into(), String::new(), "третья".into()],
        };
        let mut buf = Vec::new();
        page.write_to(&mut buf).unwrap();
        assert_eq!(TextPage::read_from(&mut buf.as_slice()).unwrap(), page);
    }

    #[test]
    fn test_grid_follows_params() {
        let mut p = params(464, 760);
        assert_eq!(PlainTextPaginator::grid(&p), (58, 47));
        p.force_bold = true;
        p.line_compression = 1.1;
        assert_eq!(PlainTextPaginator::grid(&p), (51, 43));
    }
}
