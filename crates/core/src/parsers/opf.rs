//! OPF package document: metadata, manifest, spine and guide.
//!
//! Manifest items are spilled to a temporary store on disk as they are
//! scanned, so memory stays flat for books with thousands of items. Spine
//! `itemref`s are resolved against that store and handed to the index sink in
//! spine order.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::document::BookMetadata;
use crate::error::ParseError;
use crate::parsers::IndexSink;
use crate::path::normalise_path;
use crate::serialization::{read_string, string_size, write_string};
use crate::xml::{Attrs, SaxHandler, XmlPushParser};

const MEDIA_TYPE_NCX: &str = "application/x-dtbncx+xml";
const MEDIA_TYPE_CSS: &str = "text/css";
const ITEM_STORE_FILE: &str = ".items.bin";

/// Manifest sizes at or above this get a sorted hash index for idref lookups.
pub const DEFAULT_MANIFEST_INDEX_THRESHOLD: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpfState {
    Start,
    InPackage,
    InMetadata,
    InBookTitle,
    InBookAuthor,
    InBookLanguage,
    InManifest,
    InSpine,
    InGuide,
}

/// Locator for one manifest item in the temporary store.
#[derive(Debug, Clone, Copy)]
struct ManifestItemIndexEntry {
    id_hash: u32,
    id_len: u16,
    file_offset: u32,
}

/// 32-bit FNV-1a.
fn fnv_hash(s: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in s.bytes() {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn is_opf(name: &str, local: &str) -> bool {
    name == local || name.strip_prefix("opf:") == Some(local)
}

fn has_property(properties: &str, token: &str) -> bool {
    properties.split_ascii_whitespace().any(|p| p == token)
}

struct OpfHandler<'a> {
    state: OpfState,
    store_path: PathBuf,
    base_content_path: String,
    index_threshold: usize,
    sink: Option<&'a mut dyn IndexSink>,

    store_writer: Option<BufWriter<File>>,
    store_reader: Option<BufReader<File>>,
    store_len: u32,
    item_index: Vec<ManifestItemIndexEntry>,
    use_item_index: bool,

    title: String,
    authors: Vec<String>,
    language: String,
    cover_item_id: String,
    cover_item_href: String,
    text_reference_href: String,
    toc_ncx_path: String,
    toc_nav_path: String,
    css_files: Vec<String>,
}

impl OpfHandler<'_> {
    fn open_store_for_write(&mut self) {
        match File::create(&self.store_path) {
            Ok(f) => {
                self.store_writer = Some(BufWriter::new(f));
                self.store_len = 0;
            }
            Err(e) => tracing::warn!(
                "Couldn't open manifest item store {} for writing: {e}",
                self.store_path.display()
            ),
        }
    }

    fn close_store_writer(&mut self) {
        if let Some(mut w) = self.store_writer.take() {
            if let Err(e) = w.flush() {
                tracing::warn!("Couldn't flush manifest item store: {e}");
            }
        }
    }

    fn open_store_for_read(&mut self) {
        self.close_store_writer();
        match File::open(&self.store_path) {
            Ok(f) => self.store_reader = Some(BufReader::new(f)),
            Err(e) => tracing::warn!(
                "Couldn't open manifest item store {} for reading: {e}",
                self.store_path.display()
            ),
        }
    }

    fn on_manifest_item(&mut self, attrs: &Attrs) {
        let item_id = attrs.get("id").unwrap_or_default().to_string();
        let href = attrs
            .get("href")
            .map(|h| normalise_path(&format!("{}{}", self.base_content_path, h)))
            .unwrap_or_default();
        let media_type = attrs.get("media-type").unwrap_or_default();
        let properties = attrs.get("properties").unwrap_or_default();

        if let Some(w) = self.store_writer.as_mut() {
            let entry = ManifestItemIndexEntry {
                id_hash: fnv_hash(&item_id),
                id_len: item_id.len().min(usize::from(u16::MAX)) as u16,
                file_offset: self.store_len,
            };
            let written = write_string(w, &item_id).and_then(|_| write_string(w, &href));
            match written {
                Ok(()) => {
                    self.item_index.push(entry);
                    self.store_len += string_size(&item_id) + string_size(&href);
                }
                Err(e) => tracing::warn!("Couldn't record manifest item {item_id}: {e}"),
            }
        }

        if !self.cover_item_id.is_empty() && item_id == self.cover_item_id {
            self.cover_item_href = href.clone();
        }

        if media_type == MEDIA_TYPE_NCX {
            if self.toc_ncx_path.is_empty() {
                self.toc_ncx_path = href.clone();
            } else {
                tracing::warn!("Multiple NCX files found in manifest, ignoring duplicate: {href}");
            }
        }

        if media_type == MEDIA_TYPE_CSS {
            self.css_files.push(href.clone());
        }

        if self.toc_nav_path.is_empty() && has_property(properties, "nav") {
            tracing::debug!("Found EPUB 3 nav document: {href}");
            self.toc_nav_path = href.clone();
        }

        if self.cover_item_href.is_empty() && has_property(properties, "cover-image") {
            self.cover_item_href = href;
        }
    }

    fn enter_spine(&mut self) {
        self.open_store_for_read();
        if self.item_index.len() >= self.index_threshold {
            self.item_index
                .sort_unstable_by_key(|e| (e.id_hash, e.id_len));
            self.use_item_index = true;
            tracing::debug!("Using hash index for {} manifest items", self.item_index.len());
        }
    }

    fn resolve_idref(&mut self, idref: &str) -> io::Result<Option<String>> {
        let Some(reader) = self.store_reader.as_mut() else {
            return Ok(None);
        };

        if self.use_item_index {
            let target = (fnv_hash(idref), idref.len().min(usize::from(u16::MAX)) as u16);
            let start = self
                .item_index
                .partition_point(|e| (e.id_hash, e.id_len) < target);
            for entry in self.item_index[start..]
                .iter()
                .take_while(|e| (e.id_hash, e.id_len) == target)
            {
                reader.seek(SeekFrom::Start(u64::from(entry.file_offset)))?;
                if read_string(reader)? == idref {
                    return read_string(reader).map(Some);
                }
            }
            return Ok(None);
        }

        reader.seek(SeekFrom::Start(0))?;
        let mut pos = 0u32;
        while pos < self.store_len {
            let item_id = read_string(reader)?;
            let href = read_string(reader)?;
            if item_id == idref {
                return Ok(Some(href));
            }
            pos += string_size(&item_id) + string_size(&href);
        }
        Ok(None)
    }

    fn on_itemref(&mut self, attrs: &Attrs) {
        if self.sink.is_none() {
            return;
        }
        let Some(idref) = attrs.get("idref") else {
            return;
        };
        match self.resolve_idref(idref) {
            Ok(Some(href)) => {
                if let Some(sink) = self.sink.as_mut() {
                    sink.create_spine_entry(&href);
                }
            }
            Ok(None) => tracing::warn!("Spine itemref {idref} not found in manifest"),
            Err(e) => tracing::warn!("Couldn't read manifest item store for {idref}: {e}"),
        }
    }

    fn on_guide_reference(&mut self, attrs: &Attrs) {
        let ref_type = attrs.get("type").unwrap_or_default();
        if ref_type != "text" && ref_type != "start" {
            tracing::debug!("Skipping non-text reference in guide: {ref_type}");
            return;
        }
        let href = attrs
            .get("href")
            .map(|h| normalise_path(&format!("{}{}", self.base_content_path, h)))
            .unwrap_or_default();
        if href.is_empty() {
            return;
        }
        if ref_type == "text" || !self.text_reference_href.is_empty() {
            tracing::debug!("Found {ref_type} reference in guide: {href}");
            self.text_reference_href = href;
        }
    }
}

impl SaxHandler for OpfHandler<'_> {
    fn start_element(&mut self, name: &str, attrs: &Attrs) {
        match self.state {
            OpfState::Start if is_opf(name, "package") => self.state = OpfState::InPackage,
            OpfState::InPackage if is_opf(name, "metadata") => self.state = OpfState::InMetadata,
            OpfState::InPackage if is_opf(name, "manifest") => {
                self.state = OpfState::InManifest;
                self.open_store_for_write();
            }
            OpfState::InPackage if is_opf(name, "spine") => {
                self.state = OpfState::InSpine;
                self.enter_spine();
            }
            OpfState::InPackage if is_opf(name, "guide") => self.state = OpfState::InGuide,
            OpfState::InMetadata => match name {
                "dc:title" => self.state = OpfState::InBookTitle,
                "dc:creator" => {
                    self.authors.push(String::new());
                    self.state = OpfState::InBookAuthor;
                }
                "dc:language" => self.state = OpfState::InBookLanguage,
                _ if is_opf(name, "meta") => {
                    if attrs.get("name") == Some("cover") {
                        self.cover_item_id = attrs.get("content").unwrap_or_default().to_string();
                    }
                }
                _ => {}
            },
            OpfState::InManifest if is_opf(name, "item") => self.on_manifest_item(attrs),
            OpfState::InSpine if is_opf(name, "itemref") => self.on_itemref(attrs),
            OpfState::InGuide if is_opf(name, "reference") => self.on_guide_reference(attrs),
            _ => {}
        }
    }

    fn end_element(&mut self, name: &str) {
        match self.state {
            OpfState::InSpine if is_opf(name, "spine") => {
                self.state = OpfState::InPackage;
                self.store_reader = None;
            }
            OpfState::InGuide if is_opf(name, "guide") => self.state = OpfState::InPackage,
            OpfState::InManifest if is_opf(name, "manifest") => {
                self.state = OpfState::InPackage;
                self.close_store_writer();
            }
            OpfState::InBookTitle if name == "dc:title" => self.state = OpfState::InMetadata,
            OpfState::InBookAuthor if name == "dc:creator" => self.state = OpfState::InMetadata,
            OpfState::InBookLanguage if name == "dc:language" => self.state = OpfState::InMetadata,
            OpfState::InMetadata if is_opf(name, "metadata") => self.state = OpfState::InPackage,
            OpfState::InPackage if is_opf(name, "package") => self.state = OpfState::Start,
            _ => {}
        }
    }

    fn characters(&mut self, text: &str) {
        match self.state {
            OpfState::InBookTitle => self.title.push_str(text),
            OpfState::InBookAuthor => {
                if let Some(author) = self.authors.last_mut() {
                    author.push_str(text);
                }
            }
            OpfState::InBookLanguage => self.language.push_str(text),
            _ => {}
        }
    }
}

impl Drop for OpfHandler<'_> {
    fn drop(&mut self) {
        self.store_writer = None;
        self.store_reader = None;
        if self.store_path.exists() {
            if let Err(e) = fs::remove_file(&self.store_path) {
                tracing::warn!("Couldn't remove manifest item store: {e}");
            }
        }
    }
}

/// Streaming OPF parser. Spine entries go to the sink as they are resolved;
/// everything else is read back from the accessors after the last chunk.
pub struct ContentOpfParser<'a> {
    inner: XmlPushParser<OpfHandler<'a>>,
}

impl<'a> ContentOpfParser<'a> {
    /// `base_content_path` is the OPF's directory (with trailing `/`), used to
    /// turn manifest hrefs into archive paths. The manifest item store is
    /// created inside `cache_path`.
    pub fn new(
        cache_path: &Path,
        base_content_path: &str,
        total_size: usize,
        sink: Option<&'a mut dyn IndexSink>,
    ) -> Self {
        let handler = OpfHandler {
            state: OpfState::Start,
            store_path: cache_path.join(ITEM_STORE_FILE),
            base_content_path: base_content_path.to_string(),
            index_threshold: DEFAULT_MANIFEST_INDEX_THRESHOLD,
            sink,
            store_writer: None,
            store_reader: None,
            store_len: 0,
            item_index: Vec::new(),
            use_item_index: false,
            title: String::new(),
            authors: Vec::new(),
            language: String::new(),
            cover_item_id: String::new(),
            cover_item_href: String::new(),
            text_reference_href: String::new(),
            toc_ncx_path: String::new(),
            toc_nav_path: String::new(),
            css_files: Vec::new(),
        };
        Self {
            inner: XmlPushParser::new("content.opf", handler, total_size),
        }
    }

    /// Override the manifest size at which idref lookups switch to the hash index.
    pub fn with_index_threshold(mut self, threshold: usize) -> Self {
        self.inner.handler_mut().index_threshold = threshold;
        self
    }

    pub fn setup(&mut self) -> Result<(), ParseError> {
        self.inner.setup()
    }

    pub fn is_failed(&self) -> bool {
        self.inner.is_failed()
    }

    pub fn title(&self) -> &str {
        self.inner.handler().title.trim()
    }

    pub fn author(&self) -> String {
        let authors: Vec<&str> = self
            .inner
            .handler()
            .authors
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .collect();
        authors.join(", ")
    }

    pub fn language(&self) -> &str {
        self.inner.handler().language.trim()
    }

    pub fn cover_item_href(&self) -> &str {
        &self.inner.handler().cover_item_href
    }

    pub fn text_reference_href(&self) -> &str {
        &self.inner.handler().text_reference_href
    }

    pub fn toc_ncx_path(&self) -> &str {
        &self.inner.handler().toc_ncx_path
    }

    pub fn toc_nav_path(&self) -> &str {
        &self.inner.handler().toc_nav_path
    }

    pub fn css_files(&self) -> &[String] {
        &self.inner.handler().css_files
    }

    /// True when idref lookups went through the sorted hash index.
    pub fn used_item_index(&self) -> bool {
        self.inner.handler().use_item_index
    }

    pub fn metadata(&self) -> BookMetadata {
        BookMetadata {
            title: self.title().to_string(),
            author: self.author(),
            cover_item_href: self.cover_item_href().to_string(),
            text_reference_href: self.text_reference_href().to_string(),
        }
    }
}

impl io::Write for ContentOpfParser<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.inner.feed(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
