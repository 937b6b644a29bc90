//! `book.bin`: the per-book index of spine and TOC records.
//!
//! Layout, little-endian:
//!
//! ```text
//! u8  version
//! u32 lut_offset
//! u32 spine_count
//! u32 toc_count
//! string title, author, cover_item_href, text_reference_href
//! u32[spine_count] spine record offsets     (at lut_offset)
//! u32[toc_count]   toc record offsets
//! SpineEntry[spine_count]
//! TocEntry[toc_count]
//! ```
//!
//! The file is assembled from two scratch files filled while the OPF and TOC
//! documents are streamed, so the full spine never has to sit in memory.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::archive::EpubArchive;
use crate::document::{BookMetadata, SpineEntry, TocEntry};
use crate::error::CacheError;
use crate::parsers::IndexSink;
use crate::path::normalise_path;

pub const BOOK_CACHE_VERSION: u8 = 4;
pub const BOOK_BIN_FILE: &str = "book.bin";
const SPINE_TMP_FILE: &str = "spine.bin.tmp";
const TOC_TMP_FILE: &str = "toc.bin.tmp";

/// version + lut_offset + spine_count + toc_count
const HEADER_SIZE: u32 = 1 + 4 + 4 + 4;

#[derive(Default)]
struct BuildState {
    spine_writer: Option<BufWriter<File>>,
    toc_writer: Option<BufWriter<File>>,
    /// First spine position of each href, filled when the TOC pass begins.
    spine_lookup: Option<HashMap<String, i32>>,
}

pub struct BookIndexCache {
    cache_path: PathBuf,
    build: Option<BuildState>,
    spine_count: u32,
    toc_count: u32,
    lut_offset: u32,
    core_metadata: BookMetadata,
    book_file: Option<BufReader<File>>,
}

impl BookIndexCache {
    pub fn new(cache_path: impl Into<PathBuf>) -> Self {
        Self {
            cache_path: cache_path.into(),
            build: None,
            spine_count: 0,
            toc_count: 0,
            lut_offset: 0,
            core_metadata: BookMetadata::default(),
            book_file: None,
        }
    }

    pub fn book_bin_path(&self) -> PathBuf {
        self.cache_path.join(BOOK_BIN_FILE)
    }

    fn tmp_path(&self, name: &str) -> PathBuf {
        self.cache_path.join(name)
    }

    fn build_state(&mut self) -> Result<&mut BuildState, CacheError> {
        self.build.as_mut().ok_or(CacheError::NotBuilding)
    }

    // --- build ---

    pub fn begin_write(&mut self) -> Result<(), CacheError> {
        self.build = Some(BuildState::default());
        self.spine_count = 0;
        self.toc_count = 0;
        self.book_file = None;
        tracing::debug!("Book index entering write mode");
        Ok(())
    }

    pub fn begin_content_opf_pass(&mut self) -> Result<(), CacheError> {
        tracing::debug!("Beginning content opf pass");
        let path = self.tmp_path(SPINE_TMP_FILE);
        let state = self.build_state()?;
        state.spine_writer = Some(BufWriter::new(File::create(path)?));
        Ok(())
    }

    pub fn end_content_opf_pass(&mut self) -> Result<(), CacheError> {
        let state = self.build_state()?;
        if let Some(mut writer) = state.spine_writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Opens the spine scratch file for lookups and the TOC scratch file for
    /// writing. Either both succeed or neither is kept.
    pub fn begin_toc_pass(&mut self) -> Result<(), CacheError> {
        tracing::debug!("Beginning toc pass");
        let spine_path = self.tmp_path(SPINE_TMP_FILE);
        let toc_path = self.tmp_path(TOC_TMP_FILE);
        let spine_count = self.spine_count;
        if self.build.is_none() {
            return Err(CacheError::NotBuilding);
        }

        let mut spine_reader = BufReader::new(File::open(spine_path)?);
        let mut lookup = HashMap::with_capacity(spine_count as usize);
        for i in 0..spine_count {
            let entry = SpineEntry::read_from(&mut spine_reader)?;
            lookup.entry(entry.href).or_insert(i as i32);
        }
        let toc_writer = BufWriter::new(File::create(toc_path)?);

        let state = self.build_state()?;
        state.spine_lookup = Some(lookup);
        state.toc_writer = Some(toc_writer);
        Ok(())
    }

    pub fn end_toc_pass(&mut self) -> Result<(), CacheError> {
        let state = self.build_state()?;
        state.spine_lookup = None;
        if let Some(mut writer) = state.toc_writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    pub fn end_write(&mut self) -> Result<(), CacheError> {
        if self.build.take().is_none() {
            tracing::warn!("end_write called but book index is not in build mode");
            return Err(CacheError::NotBuilding);
        }
        tracing::debug!(
            "Wrote {} spine, {} TOC entries",
            self.spine_count,
            self.toc_count
        );
        Ok(())
    }

    /// Merge the scratch files into `book.bin`. Spine entries get their TOC
    /// index and cumulative inflated size here; sizes come from the archive at
    /// `epub_path`.
    pub fn build_book_bin(&mut self, epub_path: &Path, metadata: &BookMetadata) -> Result<(), CacheError> {
        let mut book = BufWriter::new(File::create(self.book_bin_path())?);
        let mut spine_tmp = BufReader::new(File::open(self.tmp_path(SPINE_TMP_FILE))?);
        let mut toc_tmp = BufReader::new(File::open(self.tmp_path(TOC_TMP_FILE))?);

        let spine_count = self.spine_count;
        let toc_count = self.toc_count;
        let lut_size = 4 * spine_count + 4 * toc_count;
        let lut_offset = HEADER_SIZE + metadata.serialized_size();
        let records_start = lut_offset + lut_size;

        book.write_u8(BOOK_CACHE_VERSION)?;
        book.write_u32::<LittleEndian>(lut_offset)?;
        book.write_u32::<LittleEndian>(spine_count)?;
        book.write_u32::<LittleEndian>(toc_count)?;
        metadata.write_to(&mut book)?;

        let mut pos = 0u32;
        for _ in 0..spine_count {
            let entry = SpineEntry::read_from(&mut spine_tmp)?;
            book.write_u32::<LittleEndian>(records_start + pos)?;
            pos += entry.serialized_size();
        }
        let spine_blob_size = pos;

        // The first TOC entry pointing at each spine item, gathered in the same scan.
        let mut first_toc = vec![-1i32; spine_count as usize];
        let mut pos = 0u32;
        for j in 0..toc_count {
            let entry = TocEntry::read_from(&mut toc_tmp)?;
            book.write_u32::<LittleEndian>(records_start + spine_blob_size + pos)?;
            pos += entry.serialized_size();
            if let Some(slot) = usize::try_from(entry.spine_index)
                .ok()
                .and_then(|i| first_toc.get_mut(i))
            {
                if *slot == -1 {
                    *slot = j as i32;
                }
            }
        }

        let mut archive = EpubArchive::open(epub_path)?;
        let sizes = archive.entry_sizes()?;

        let mut cumulative: u32 = 0;
        let mut last_toc_index = -1;
        spine_tmp.seek(SeekFrom::Start(0))?;
        for i in 0..spine_count as usize {
            let mut entry = SpineEntry::read_from(&mut spine_tmp)?;

            entry.toc_index = first_toc[i];
            if entry.toc_index == -1 {
                tracing::debug!(
                    "No TOC entry for spine item {i}: {}, using the previous section's",
                    entry.href
                );
                entry.toc_index = last_toc_index;
            }
            last_toc_index = entry.toc_index;

            let path = normalise_path(&entry.href);
            match sizes.get(&path) {
                Some(&size) => {
                    cumulative = cumulative.saturating_add(u32::try_from(size).unwrap_or(u32::MAX));
                }
                None => tracing::warn!("Could not get size for spine item: {path}"),
            }
            entry.cumulative_size = cumulative;

            entry.write_to(&mut book)?;
        }

        toc_tmp.seek(SeekFrom::Start(0))?;
        for _ in 0..toc_count {
            TocEntry::read_from(&mut toc_tmp)?.write_to(&mut book)?;
        }

        book.flush()?;
        tracing::debug!("Built {}", self.book_bin_path().display());
        Ok(())
    }

    pub fn cleanup_tmp_files(&self) {
        for name in [SPINE_TMP_FILE, TOC_TMP_FILE] {
            let path = self.tmp_path(name);
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!("Couldn't remove {}: {e}", path.display());
                }
            }
        }
    }

    // --- read ---

    pub fn load(&mut self) -> Result<(), CacheError> {
        // A failed load leaves the cache unloaded, never half-populated.
        self.book_file = None;
        let mut file = BufReader::new(File::open(self.book_bin_path())?);

        let version = file.read_u8()?;
        if version != BOOK_CACHE_VERSION {
            tracing::info!(
                "Book index version mismatch: expected {BOOK_CACHE_VERSION}, got {version}"
            );
            return Err(CacheError::VersionMismatch {
                expected: BOOK_CACHE_VERSION,
                found: version,
            });
        }

        let lut_offset = file.read_u32::<LittleEndian>()?;
        let spine_count = file.read_u32::<LittleEndian>()?;
        let toc_count = file.read_u32::<LittleEndian>()?;
        let core_metadata = BookMetadata::read_from(&mut file)?;

        self.lut_offset = lut_offset;
        self.spine_count = spine_count;
        self.toc_count = toc_count;
        self.core_metadata = core_metadata;
        self.book_file = Some(file);

        tracing::debug!(
            "Loaded book index: {} spine, {} TOC entries",
            self.spine_count,
            self.toc_count
        );
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.book_file.is_some()
    }

    pub fn spine_count(&self) -> u32 {
        self.spine_count
    }

    pub fn toc_count(&self) -> u32 {
        self.toc_count
    }

    pub fn core_metadata(&self) -> &BookMetadata {
        &self.core_metadata
    }

    fn read_lut_slot(&mut self, slot: u32) -> Result<&mut BufReader<File>, CacheError> {
        let lut_offset = self.lut_offset;
        let file = self.book_file.as_mut().ok_or(CacheError::NotLoaded)?;
        file.seek(SeekFrom::Start(u64::from(lut_offset) + 4 * u64::from(slot)))?;
        let record_pos = file.read_u32::<LittleEndian>()?;
        file.seek(SeekFrom::Start(u64::from(record_pos)))?;
        Ok(file)
    }

    pub fn get_spine_entry(&mut self, index: usize) -> Result<SpineEntry, CacheError> {
        if !self.is_loaded() {
            return Err(CacheError::NotLoaded);
        }
        if index >= self.spine_count as usize {
            return Err(CacheError::OutOfRange {
                kind: "spine",
                index,
                count: self.spine_count,
            });
        }
        let file = self.read_lut_slot(index as u32)?;
        Ok(SpineEntry::read_from(file)?)
    }

    pub fn get_toc_entry(&mut self, index: usize) -> Result<TocEntry, CacheError> {
        if !self.is_loaded() {
            return Err(CacheError::NotLoaded);
        }
        if index >= self.toc_count as usize {
            return Err(CacheError::OutOfRange {
                kind: "toc",
                index,
                count: self.toc_count,
            });
        }
        let file = self.read_lut_slot(self.spine_count + index as u32)?;
        Ok(TocEntry::read_from(file)?)
    }
}

impl IndexSink for BookIndexCache {
    // Every spine entry has to be written before the first TOC entry, or the
    // TOC pass can't resolve spine positions.
    fn create_spine_entry(&mut self, href: &str) {
        let Some(writer) = self.build.as_mut().and_then(|b| b.spine_writer.as_mut()) else {
            tracing::warn!("create_spine_entry called but book index is not in build mode");
            return;
        };
        if let Err(e) = SpineEntry::new(href).write_to(writer) {
            tracing::warn!("Couldn't write spine entry {href}: {e}");
            return;
        }
        self.spine_count += 1;
    }

    fn create_toc_entry(&mut self, title: &str, href: &str, anchor: &str, level: u8) {
        let Some(state) = self.build.as_mut() else {
            tracing::warn!("create_toc_entry called but book index is not in build mode");
            return;
        };
        let (Some(writer), Some(lookup)) = (state.toc_writer.as_mut(), state.spine_lookup.as_ref()) else {
            tracing::warn!("create_toc_entry called outside the TOC pass");
            return;
        };

        let spine_index = lookup.get(href).copied().unwrap_or(-1);
        if spine_index == -1 {
            tracing::warn!("Could not find spine item for TOC href {href}");
        }

        let entry = TocEntry {
            title: title.to_string(),
            href: href.to_string(),
            anchor: anchor.to_string(),
            level,
            spine_index,
        };
        if let Err(e) = entry.write_to(writer) {
            tracing::warn!("Couldn't write TOC entry {title}: {e}");
            return;
        }
        self.toc_count += 1;
    }
}
