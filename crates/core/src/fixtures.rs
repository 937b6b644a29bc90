//! EPUB files assembled on the fly for tests.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use zip::write::SimpleFileOptions;

use crate::progress::{ProgressEvent, ProgressHandler};

pub struct FixtureChapter {
    pub id: &'static str,
    /// Relative to the OPF directory (`OEBPS/`).
    pub href: &'static str,
    pub body: String,
}

pub struct FixtureBook {
    pub title: &'static str,
    pub author: &'static str,
    pub chapters: Vec<FixtureChapter>,
    /// Chapters (by position) that get a TOC entry, with their labels.
    pub toc: Vec<(usize, &'static str)>,
    pub with_nav: bool,
    pub with_ncx: bool,
    /// Write a nav document that is not well-formed XML.
    pub broken_nav: bool,
}

fn paragraphs(label: &str, count: usize) -> String {
    (0..count)
        .map(|i| {
            format!(
                "<p>{label} paragraph {i}. The quick brown fox jumps over the lazy dog while \
                 the reader keeps turning pages &amp; counting words.</p>"
            )
        })
        .collect()
}

impl Default for FixtureBook {
    fn default() -> Self {
        Self {
            title: "Fixture Book",
            author: "Test Author",
            chapters: vec![
                FixtureChapter {
                    id: "cover",
                    href: "cover.xhtml",
                    body: "<p>Cover</p>".to_string(),
                },
                FixtureChapter {
                    id: "c1",
                    href: "text/ch1.xhtml",
                    body: format!("<h1>Chapter One</h1>{}", paragraphs("First", 12)),
                },
                FixtureChapter {
                    id: "c2",
                    href: "text/ch2.xhtml",
                    body: format!("<h1>Chapter Two</h1>{}", paragraphs("Second", 20)),
                },
                FixtureChapter {
                    id: "c3",
                    href: "text/ch3.xhtml",
                    body: paragraphs("Third", 4),
                },
            ],
            toc: vec![(1, "Chapter One"), (2, "Chapter Two")],
            with_nav: true,
            with_ncx: true,
            broken_nav: false,
        }
    }
}

impl FixtureBook {
    fn opf(&self) -> String {
        let mut manifest = String::new();
        let mut spine = String::new();
        for ch in &self.chapters {
            manifest.push_str(&format!(
                r#"<item id="{}" href="{}" media-type="application/xhtml+xml"/>"#,
                ch.id, ch.href
            ));
            spine.push_str(&format!(r#"<itemref idref="{}"/>"#, ch.id));
        }
        if self.with_nav {
            manifest.push_str(
                r#"<item id="nav" href="nav/nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>"#,
            );
        }
        if self.with_ncx {
            manifest.push_str(r#"<item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>"#);
        }
        let text_ref = self
            .chapters
            .get(1)
            .map(|c| format!(r#"<guide><reference type="text" href="{}"/></guide>"#, c.href))
            .unwrap_or_default();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>{}</dc:title><dc:creator>{}</dc:creator><dc:language>en</dc:language>
  </metadata>
  <manifest>{manifest}</manifest>
  <spine toc="ncx">{spine}</spine>
  {text_ref}
</package>"#,
            self.title, self.author
        )
    }

    fn nav(&self) -> String {
        let items: String = self
            .toc
            .iter()
            .map(|(i, label)| format!(r#"<li><a href="../{}">{label}</a></li>"#, self.chapters[*i].href))
            .collect();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head><title>Contents</title></head>
<body><nav epub:type="toc"><ol>{items}</ol></nav></body>
</html>"#
        )
    }

    fn ncx(&self) -> String {
        let points: String = self
            .toc
            .iter()
            .enumerate()
            .map(|(n, (i, label))| {
                format!(
                    r#"<navPoint id="np{n}"><navLabel><text>{label}</text></navLabel><content src="{}"/></navPoint>"#,
                    self.chapters[*i].href
                )
            })
            .collect();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1"><navMap>{points}</navMap></ncx>"#
        )
    }
}

pub fn chapter_xhtml(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>t</title><style>p {{ margin: 0 }}</style></head>
<body>{body}</body></html>"#
    )
}

pub fn write_epub(path: &Path, book: &FixtureBook) {
    let file = File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let stored = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    let deflated = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file("mimetype", stored).unwrap();
    zip.write_all(b"application/epub+zip").unwrap();

    zip.start_file("META-INF/container.xml", deflated).unwrap();
    zip.write_all(
        br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#,
    )
    .unwrap();

    zip.start_file("OEBPS/content.opf", deflated).unwrap();
    zip.write_all(book.opf().as_bytes()).unwrap();

    if book.with_nav {
        zip.start_file("OEBPS/nav/nav.xhtml", deflated).unwrap();
        if book.broken_nav {
            zip.write_all(b"<html><body><nav epub:type=\"toc\"><ol><li><a href=").unwrap();
        } else {
            zip.write_all(book.nav().as_bytes()).unwrap();
        }
    }
    if book.with_ncx {
        zip.start_file("OEBPS/toc.ncx", deflated).unwrap();
        zip.write_all(book.ncx().as_bytes()).unwrap();
    }

    for ch in &book.chapters {
        zip.start_file(format!("OEBPS/{}", ch.href), deflated).unwrap();
        zip.write_all(chapter_xhtml(&ch.body).as_bytes()).unwrap();
    }

    zip.finish().unwrap();
}

/// Keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ProgressHandler for RecordingProgress {
    fn on_progress(&self, event: ProgressEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
