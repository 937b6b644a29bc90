//! The book: builds its index from the archive once, then answers spine,
//! TOC and progress queries from `book.bin`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::archive::EpubArchive;
use crate::book_index::BookIndexCache;
use crate::config::IndexConfig;
use crate::document::{BookMetadata, SpineEntry, TocEntry};
use crate::error::{ArchiveError, CacheError, EpubError, ParseError};
use crate::parsers::{ContainerParser, ContentOpfParser, TocNavParser, TocNcxParser};
use crate::path::{base_dir, normalise_path};
use crate::position::ReadingPosition;
use crate::progress::{emit_progress, ProgressHandler};
use crate::section::SectionCache;

const CONTAINER_PATH: &str = "META-INF/container.xml";
const BUILD_STAGES: u64 = 4;

/// Cache directory name for the book at `path`: stable across runs, distinct
/// per path.
pub fn cache_dir_name(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("epub_{hex}")
}

pub struct Epub {
    filepath: PathBuf,
    cache_path: PathBuf,
    config: IndexConfig,
    content_base_path: String,
    language: Option<String>,
    css_files: Vec<String>,
    book_index: BookIndexCache,
}

impl Epub {
    /// The book's cache lives in its own directory under `cache_root`.
    pub fn new(filepath: impl Into<PathBuf>, cache_root: &Path) -> Self {
        let filepath = filepath.into();
        let cache_path = cache_root.join(cache_dir_name(&filepath));
        Self {
            book_index: BookIndexCache::new(&cache_path),
            filepath,
            cache_path,
            config: IndexConfig::default(),
            content_base_path: String::new(),
            language: None,
            css_files: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: IndexConfig) -> Self {
        self.config = config;
        self
    }

    /// Load `book.bin`, or build it from the archive when it is missing or
    /// stale and `build_if_missing` is set.
    pub fn load(
        &mut self,
        build_if_missing: bool,
        progress: Option<&dyn ProgressHandler>,
    ) -> Result<(), EpubError> {
        tracing::debug!("Loading EPUB: {}", self.filepath.display());

        self.book_index = BookIndexCache::new(&self.cache_path);
        match self.book_index.load() {
            Ok(()) => {
                tracing::debug!("Loaded book index from cache for {}", self.filepath.display());
                return Ok(());
            }
            Err(e) if !build_if_missing => return Err(e.into()),
            Err(e) => tracing::info!("Book index unavailable, building: {e}"),
        }

        self.setup_cache_dir()?;
        if let Err(e) = self.build_book_index(progress) {
            tracing::warn!("Failed to build book index for {}: {e}", self.filepath.display());
            self.book_index.cleanup_tmp_files();
            let book_bin = self.book_index.book_bin_path();
            if book_bin.exists() {
                let _ = fs::remove_file(book_bin);
            }
            return Err(e);
        }

        self.book_index = BookIndexCache::new(&self.cache_path);
        self.book_index.load()?;
        tracing::debug!("Loaded EPUB: {}", self.filepath.display());
        Ok(())
    }

    fn build_book_index(&mut self, progress: Option<&dyn ProgressHandler>) -> Result<(), EpubError> {
        let mut archive = EpubArchive::open(&self.filepath)?;

        emit_progress(progress, "Indexing book", 0, Some(BUILD_STAGES), Some("Parsing container"));
        let opf_path = self.find_content_opf_file(&mut archive)?;
        self.content_base_path = base_dir(&opf_path).to_string();

        emit_progress(progress, "Indexing book", 1, Some(BUILD_STAGES), Some("Parsing package"));
        self.book_index.begin_write()?;
        self.book_index.begin_content_opf_pass()?;
        let package = self.parse_content_opf(&mut archive, &opf_path)?;
        self.book_index.end_content_opf_pass()?;

        emit_progress(progress, "Indexing book", 2, Some(BUILD_STAGES), Some("Parsing table of contents"));
        self.book_index.begin_toc_pass()?;
        self.parse_toc(&mut archive, &package);
        self.book_index.end_toc_pass()?;
        self.book_index.end_write()?;

        emit_progress(progress, "Indexing book", 3, Some(BUILD_STAGES), Some("Writing book index"));
        self.book_index.build_book_bin(&self.filepath, &package.metadata)?;
        self.book_index.cleanup_tmp_files();
        emit_progress(progress, "Indexing book", BUILD_STAGES, Some(BUILD_STAGES), None);
        Ok(())
    }

    fn find_content_opf_file(&self, archive: &mut EpubArchive) -> Result<String, EpubError> {
        let size = archive.inflated_size(CONTAINER_PATH)?;
        let mut parser = ContainerParser::new(size as usize);
        parser.setup()?;
        let streamed = archive.stream_to(CONTAINER_PATH, &mut parser, self.config.stream_chunk_size);
        check_parse("container.xml", streamed, parser.is_failed())?;

        let full_path = parser.into_full_path();
        if full_path.is_empty() {
            return Err(ParseError::MissingContent("rootfile in container.xml".into()).into());
        }
        tracing::debug!("Found content.opf at {full_path}");
        Ok(normalise_path(&full_path))
    }

    fn parse_content_opf(
        &mut self,
        archive: &mut EpubArchive,
        opf_path: &str,
    ) -> Result<PackageInfo, EpubError> {
        let size = archive.inflated_size(opf_path)?;
        let mut parser = ContentOpfParser::new(
            &self.cache_path,
            &self.content_base_path,
            size as usize,
            Some(&mut self.book_index),
        )
        .with_index_threshold(self.config.manifest_index_threshold);
        parser.setup()?;
        let streamed = archive.stream_to(opf_path, &mut parser, self.config.stream_chunk_size);
        check_parse("content.opf", streamed, parser.is_failed())?;

        let language = parser.language().trim();
        self.language = (!language.is_empty()).then(|| language.to_string());
        self.css_files = parser.css_files().to_vec();

        tracing::debug!("Successfully parsed content.opf");
        Ok(PackageInfo {
            metadata: parser.metadata(),
            toc_nav_path: parser.toc_nav_path().to_string(),
            toc_ncx_path: parser.toc_ncx_path().to_string(),
        })
    }

    /// Nav first, then NCX. A book without a usable TOC still builds.
    fn parse_toc(&mut self, archive: &mut EpubArchive, package: &PackageInfo) {
        if !package.toc_nav_path.is_empty() {
            match self.parse_toc_nav_file(archive, &package.toc_nav_path) {
                Ok(count) => {
                    tracing::debug!("Parsed {count} TOC entries from nav document");
                    return;
                }
                Err(e) => tracing::warn!("Couldn't parse nav document, trying NCX: {e}"),
            }
        }
        if !package.toc_ncx_path.is_empty() {
            match self.parse_toc_ncx_file(archive, &package.toc_ncx_path) {
                Ok(count) => {
                    tracing::debug!("Parsed {count} TOC entries from NCX");
                    return;
                }
                Err(e) => tracing::warn!("Couldn't parse NCX: {e}"),
            }
        }
        tracing::warn!("No usable table of contents in {}", self.filepath.display());
    }

    fn parse_toc_nav_file(&mut self, archive: &mut EpubArchive, nav_path: &str) -> Result<usize, EpubError> {
        let size = archive.inflated_size(nav_path)?;
        let nav_base = base_dir(nav_path).to_string();
        let mut parser = TocNavParser::new(&nav_base, size as usize, Some(&mut self.book_index));
        parser.setup()?;
        let streamed = archive.stream_to(nav_path, &mut parser, self.config.stream_chunk_size);
        check_parse("nav document", streamed, parser.is_failed())?;
        Ok(parser.entry_count())
    }

    fn parse_toc_ncx_file(&mut self, archive: &mut EpubArchive, ncx_path: &str) -> Result<usize, EpubError> {
        let size = archive.inflated_size(ncx_path)?;
        let mut parser = TocNcxParser::new(&self.content_base_path, size as usize, Some(&mut self.book_index));
        parser.setup()?;
        let streamed = archive.stream_to(ncx_path, &mut parser, self.config.stream_chunk_size);
        check_parse("toc.ncx", streamed, parser.is_failed())?;
        Ok(parser.entry_count())
    }

    // --- cache directory ---

    pub fn setup_cache_dir(&self) -> Result<(), EpubError> {
        fs::create_dir_all(&self.cache_path)?;
        Ok(())
    }

    pub fn clear_cache(&mut self) -> Result<(), EpubError> {
        if !self.cache_path.exists() {
            tracing::debug!("Cache does not exist, no action needed");
            return Ok(());
        }
        self.book_index = BookIndexCache::new(&self.cache_path);
        fs::remove_dir_all(&self.cache_path)?;
        tracing::debug!("Cache cleared: {}", self.cache_path.display());
        Ok(())
    }

    // --- metadata ---

    pub fn path(&self) -> &Path {
        &self.filepath
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn is_loaded(&self) -> bool {
        self.book_index.is_loaded()
    }

    pub fn metadata(&self) -> &BookMetadata {
        self.book_index.core_metadata()
    }

    pub fn title(&self) -> &str {
        &self.metadata().title
    }

    pub fn author(&self) -> &str {
        &self.metadata().author
    }

    pub fn cover_item_href(&self) -> &str {
        &self.metadata().cover_item_href
    }

    pub fn text_reference_href(&self) -> &str {
        &self.metadata().text_reference_href
    }

    /// Only known when the index was built in this session; `book.bin` does
    /// not store it.
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// Stylesheets from the manifest. Empty when the index came from cache.
    pub fn css_files(&self) -> &[String] {
        &self.css_files
    }

    // --- spine and TOC ---

    pub fn spine_items_count(&self) -> usize {
        self.book_index.spine_count() as usize
    }

    pub fn toc_items_count(&self) -> usize {
        self.book_index.toc_count() as usize
    }

    /// Out-of-range indexes fall back to the first spine item.
    pub fn spine_item(&mut self, spine_index: usize) -> Result<SpineEntry, EpubError> {
        if !self.book_index.is_loaded() {
            return Err(CacheError::NotLoaded.into());
        }
        let count = self.spine_items_count();
        if spine_index >= count {
            tracing::warn!("Spine index {spine_index} out of range (count {count}), using 0");
            return Ok(self.book_index.get_spine_entry(0)?);
        }
        Ok(self.book_index.get_spine_entry(spine_index)?)
    }

    pub fn toc_item(&mut self, toc_index: usize) -> Result<TocEntry, EpubError> {
        Ok(self.book_index.get_toc_entry(toc_index)?)
    }

    pub fn spine_items(&mut self) -> Result<Vec<SpineEntry>, EpubError> {
        (0..self.spine_items_count()).map(|i| self.spine_item(i)).collect()
    }

    pub fn toc_items(&mut self) -> Result<Vec<TocEntry>, EpubError> {
        (0..self.toc_items_count()).map(|i| self.toc_item(i)).collect()
    }

    /// Spine item a TOC entry points into; 0 when the index is out of range or
    /// the entry did not resolve.
    pub fn spine_index_for_toc_index(&mut self, toc_index: usize) -> Result<usize, EpubError> {
        if toc_index >= self.toc_items_count() {
            tracing::warn!("TOC index {toc_index} out of range");
            return Ok(0);
        }
        let entry = self.toc_item(toc_index)?;
        Ok(usize::try_from(entry.spine_index).unwrap_or(0))
    }

    /// TOC entry covering a spine item, if any.
    pub fn toc_index_for_spine_index(&mut self, spine_index: usize) -> Result<Option<usize>, EpubError> {
        let entry = self.spine_item(spine_index)?;
        Ok(usize::try_from(entry.toc_index).ok())
    }

    /// Inflated size of all spine items together.
    pub fn book_size(&mut self) -> Result<u64, EpubError> {
        let count = self.spine_items_count();
        if count == 0 {
            return Ok(0);
        }
        self.cumulative_spine_item_size(count - 1)
    }

    pub fn cumulative_spine_item_size(&mut self, spine_index: usize) -> Result<u64, EpubError> {
        Ok(u64::from(self.spine_item(spine_index)?.cumulative_size))
    }

    /// Spine position of the guide's text reference; 0 when there is none or
    /// it isn't in the spine.
    pub fn spine_index_for_text_reference(&mut self) -> Result<usize, EpubError> {
        let text_ref = self.text_reference_href().to_string();
        if text_ref.is_empty() {
            return Ok(0);
        }
        for i in 0..self.spine_items_count() {
            if self.spine_item(i)?.href == text_ref {
                tracing::debug!("Text reference {text_ref} found at spine index {i}");
                return Ok(i);
            }
        }
        tracing::debug!("Text reference {text_ref} not in spine");
        Ok(0)
    }

    /// Percentage through the book, weighted by inflated chapter size.
    /// `spine_read` is the fraction of the current chapter already read.
    pub fn calculate_progress(&mut self, spine_index: usize, spine_read: f32) -> Result<u8, EpubError> {
        let book_size = self.book_size()?;
        if book_size == 0 {
            return Ok(0);
        }
        let prev = if spine_index > 0 {
            self.cumulative_spine_item_size(spine_index - 1)?
        } else {
            0
        };
        let current = self.cumulative_spine_item_size(spine_index)?.saturating_sub(prev);
        let read = (current as f64 * f64::from(spine_read.clamp(0.0, 1.0))) as u64;
        let percent = ((prev + read) as f64 / book_size as f64 * 100.0).round();
        Ok(percent.clamp(0.0, 100.0) as u8)
    }

    // --- item access ---

    fn item_path(href: &str) -> Result<String, ArchiveError> {
        if href.is_empty() {
            tracing::warn!("Can't read an item with an empty href");
            return Err(ArchiveError::MissingEntry(String::new()));
        }
        Ok(normalise_path(href))
    }

    pub fn item_size(&self, href: &str) -> Result<u64, ArchiveError> {
        let path = Self::item_path(href)?;
        EpubArchive::open(&self.filepath)?.inflated_size(&path)
    }

    pub fn read_item_contents(&self, href: &str) -> Result<Vec<u8>, ArchiveError> {
        let path = Self::item_path(href)?;
        EpubArchive::open(&self.filepath)?.read_bytes(&path)
    }

    /// Inflate an item into `out`; returns the bytes written.
    pub fn read_item_contents_to_stream<W: Write>(
        &self,
        href: &str,
        out: &mut W,
        chunk_size: usize,
    ) -> Result<u64, ArchiveError> {
        let path = Self::item_path(href)?;
        EpubArchive::open(&self.filepath)?.stream_to(&path, out, chunk_size)
    }

    // --- sections and reading position ---

    /// Page cache handle for one spine item. Unlike `spine_item`, an
    /// out-of-range index is an error.
    pub fn section(&mut self, spine_index: usize) -> Result<SectionCache, EpubError> {
        let entry = self.book_index.get_spine_entry(spine_index)?;
        Ok(SectionCache::new(&self.cache_path, spine_index, entry.href))
    }

    pub fn reading_position(&self) -> Result<Option<ReadingPosition>, EpubError> {
        Ok(ReadingPosition::load(&self.cache_path)?)
    }

    pub fn save_reading_position(&self, position: &ReadingPosition) -> Result<(), EpubError> {
        Ok(position.save(&self.cache_path)?)
    }
}

struct PackageInfo {
    metadata: BookMetadata,
    toc_nav_path: String,
    toc_ncx_path: String,
}

/// A parser that tore itself down turns the stream error into a syntax error.
fn check_parse(document: &'static str, streamed: Result<u64, ArchiveError>, failed: bool) -> Result<(), EpubError> {
    match streamed {
        Ok(_) if !failed => Ok(()),
        Ok(_) => Err(ParseError::Syntax {
            document,
            detail: "parser stopped before the end of the document".into(),
        }
        .into()),
        Err(e) if failed => Err(ParseError::Syntax {
            document,
            detail: e.to_string(),
        }
        .into()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{write_epub, FixtureBook};
    use crate::fixtures::RecordingProgress;
    use pretty_assertions::assert_eq;

    fn build(dir: &Path, book: &FixtureBook) -> Epub {
        let path = dir.join("book.epub");
        write_epub(&path, book);
        let mut epub = Epub::new(&path, &dir.join("cache"));
        epub.load(true, None).unwrap();
        epub
    }

    fn toc_titles(epub: &mut Epub) -> Vec<String> {
        epub.toc_items().unwrap().into_iter().map(|t| t.title).collect()
    }

    #[test]
    fn test_build_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let progress = RecordingProgress::default();
        let path = dir.path().join("book.epub");
        write_epub(&path, &FixtureBook::default());
        let mut epub = Epub::new(&path, &dir.path().join("cache"));
        epub.load(true, Some(&progress)).unwrap();

        assert_eq!(epub.title(), "Fixture Book");
        assert_eq!(epub.author(), "Test Author");
        assert_eq!(epub.language(), Some("en"));
        assert_eq!(epub.text_reference_href(), "OEBPS/text/ch1.xhtml");
        assert_eq!(epub.spine_items_count(), 4);
        assert_eq!(epub.toc_items_count(), 2);
        assert_eq!(toc_titles(&mut epub), vec!["Chapter One", "Chapter Two"]);
        assert_eq!(epub.spine_item(2).unwrap().href, "OEBPS/text/ch2.xhtml");

        assert_eq!(epub.spine_index_for_toc_index(1).unwrap(), 2);
        assert_eq!(epub.spine_index_for_toc_index(7).unwrap(), 0);
        assert_eq!(epub.toc_index_for_spine_index(0).unwrap(), None);
        assert_eq!(epub.toc_index_for_spine_index(3).unwrap(), Some(1));
        assert_eq!(epub.spine_index_for_text_reference().unwrap(), 1);

        let events = progress.events();
        assert_eq!(events.len() as u64, BUILD_STAGES + 1);
        assert_eq!(events.last().unwrap().current, BUILD_STAGES);

        let leftovers: Vec<String> = fs::read_dir(epub.cache_path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["book.bin".to_string()]);
    }

    #[test]
    fn test_sizes_and_progress() {
        let dir = tempfile::tempdir().unwrap();
        let mut epub = build(dir.path(), &FixtureBook::default());

        let mut expected = 0u64;
        for i in 0..epub.spine_items_count() {
            let href = epub.spine_item(i).unwrap().href;
            expected += epub.item_size(&href).unwrap();
            assert_eq!(epub.cumulative_spine_item_size(i).unwrap(), expected);
        }
        assert_eq!(epub.book_size().unwrap(), expected);

        assert_eq!(epub.calculate_progress(0, 0.0).unwrap(), 0);
        assert_eq!(epub.calculate_progress(3, 1.0).unwrap(), 100);
        let mid = epub.calculate_progress(2, 0.5).unwrap();
        let before = epub.calculate_progress(2, 0.0).unwrap();
        let after = epub.calculate_progress(2, 1.0).unwrap();
        assert!(before < mid && mid < after);
    }

    #[test]
    fn test_reuses_cached_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.epub");
        {
            let _ = build(dir.path(), &FixtureBook::default());
        }

        let mut cached = Epub::new(&path, &dir.path().join("cache"));
        cached.load(false, None).unwrap();
        assert_eq!(cached.title(), "Fixture Book");
        assert_eq!(cached.spine_items_count(), 4);
        assert_eq!(cached.language(), None);
    }

    #[test]
    fn test_load_without_build_fails_when_uncached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.epub");
        write_epub(&path, &FixtureBook::default());
        let mut epub = Epub::new(&path, &dir.path().join("cache"));
        assert!(epub.load(false, None).is_err());
        assert!(!epub.is_loaded());
    }

    #[test]
    fn test_ncx_only_book() {
        let dir = tempfile::tempdir().unwrap();
        let book = FixtureBook {
            with_nav: false,
            ..FixtureBook::default()
        };
        let mut epub = build(dir.path(), &book);
        assert_eq!(toc_titles(&mut epub), vec!["Chapter One", "Chapter Two"]);
        assert_eq!(epub.toc_item(0).unwrap().spine_index, 1);
    }

    #[test]
    fn test_broken_nav_falls_back_to_ncx() {
        let dir = tempfile::tempdir().unwrap();
        let book = FixtureBook {
            broken_nav: true,
            ..FixtureBook::default()
        };
        let mut epub = build(dir.path(), &book);
        assert_eq!(toc_titles(&mut epub), vec!["Chapter One", "Chapter Two"]);
    }

    #[test]
    fn test_book_without_toc_still_builds() {
        let dir = tempfile::tempdir().unwrap();
        let book = FixtureBook {
            with_nav: false,
            with_ncx: false,
            ..FixtureBook::default()
        };
        let mut epub = build(dir.path(), &book);
        assert_eq!(epub.spine_items_count(), 4);
        assert_eq!(epub.toc_items_count(), 0);
        assert_eq!(epub.toc_index_for_spine_index(2).unwrap(), None);
    }

    #[test]
    fn test_out_of_range_spine_item_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut epub = build(dir.path(), &FixtureBook::default());
        assert_eq!(epub.spine_item(99).unwrap().href, "OEBPS/cover.xhtml");
        assert!(epub.section(99).is_err());
    }

    #[test]
    fn test_missing_container_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.epub");
        {
            let mut zip = zip::ZipWriter::new(fs::File::create(&path).unwrap());
            zip.start_file("mimetype", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"application/epub+zip").unwrap();
            zip.finish().unwrap();
        }
        let mut epub = Epub::new(&path, &dir.path().join("cache"));
        let err = epub.load(true, None).unwrap_err();
        assert!(matches!(err, EpubError::Archive(ArchiveError::MissingEntry(_))));
        assert!(!epub.cache_path().join("book.bin").exists());
    }

    #[test]
    fn test_item_access() {
        let dir = tempfile::tempdir().unwrap();
        let epub = build(dir.path(), &FixtureBook::default());

        let bytes = epub.read_item_contents("OEBPS/text/../cover.xhtml").unwrap();
        assert!(String::from_utf8(bytes).unwrap().contains("Cover"));
        let mut out = Vec::new();
        let n = epub
            .read_item_contents_to_stream("OEBPS/cover.xhtml", &mut out, 16)
            .unwrap();
        assert_eq!(n as usize, out.len());
        assert!(epub.item_size("").is_err());
    }

    #[test]
    fn test_clear_cache_and_reading_position() {
        let dir = tempfile::tempdir().unwrap();
        let mut epub = build(dir.path(), &FixtureBook::default());
        let pos = ReadingPosition {
            spine_index: 2,
            page: 3,
            page_count: 9,
        };
        epub.save_reading_position(&pos).unwrap();
        assert_eq!(epub.reading_position().unwrap(), Some(pos));

        epub.clear_cache().unwrap();
        assert!(!epub.cache_path().exists());
        assert!(!epub.is_loaded());
        epub.clear_cache().unwrap();
        assert_eq!(epub.reading_position().unwrap(), None);
    }

    #[test]
    fn test_cache_dir_name_is_stable() {
        let a = cache_dir_name(Path::new("/books/a.epub"));
        assert_eq!(a, cache_dir_name(Path::new("/books/a.epub")));
        assert_ne!(a, cache_dir_name(Path::new("/books/b.epub")));
        assert!(a.starts_with("epub_"));
        assert_eq!(a.len(), "epub_".len() + 16);
    }
}
