//! Per-chapter page cache (`sections/<spine index>.bin`).
//!
//! Layout, little-endian:
//!
//! ```text
//! u8   version
//! i32  font_id
//! f32  line_compression
//! bool extra_paragraph_spacing
//! u8   paragraph_alignment
//! u16  viewport_width
//! u16  viewport_height
//! bool hyphenation
//! bool embedded_style
//! bool force_bold
//! u16  page_count          (patched after pagination)
//! u32  lut_offset          (patched after pagination)
//! page records
//! u32[page_count] page offsets
//! ```
//!
//! Every header field before `page_count` is part of the cache key: a file
//! written with any other value is deleted on load and rebuilt.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::archive::DEFAULT_CHUNK_SIZE;
use crate::config::LayoutConfig;
use crate::epub::Epub;
use crate::error::SectionError;
use crate::page::{PageRecord, Paginator};
use crate::progress::{emit_progress, ProgressHandler};
use crate::serialization::{read_bool, write_bool};

pub const SECTION_FILE_VERSION: u8 = 13;
pub const SECTION_HEADER_SIZE: u64 = 24;
const PAGE_COUNT_OFFSET: u64 = SECTION_HEADER_SIZE - 4 - 2;
const LUT_OFFSET_OFFSET: u64 = SECTION_HEADER_SIZE - 4;

const STREAM_ATTEMPTS: u32 = 3;
const STREAM_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParagraphAlignment {
    #[default]
    Justified,
    Left,
    Center,
    Right,
    Book,
}

impl ParagraphAlignment {
    pub fn as_u8(self) -> u8 {
        match self {
            ParagraphAlignment::Justified => 0,
            ParagraphAlignment::Left => 1,
            ParagraphAlignment::Center => 2,
            ParagraphAlignment::Right => 3,
            ParagraphAlignment::Book => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ParagraphAlignment::Justified),
            1 => Some(ParagraphAlignment::Left),
            2 => Some(ParagraphAlignment::Center),
            3 => Some(ParagraphAlignment::Right),
            4 => Some(ParagraphAlignment::Book),
            _ => None,
        }
    }
}

/// Everything that affects layout. Two section files are interchangeable only
/// when all of these match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderParams {
    pub font_id: i32,
    pub line_compression: f32,
    pub extra_paragraph_spacing: bool,
    pub paragraph_alignment: ParagraphAlignment,
    pub viewport_width: u16,
    pub viewport_height: u16,
    pub hyphenation: bool,
    pub embedded_style: bool,
    pub force_bold: bool,
}

impl Default for RenderParams {
    fn default() -> Self {
        LayoutConfig::default().render_params()
    }
}

impl RenderParams {
    fn write_key<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_i32::<LittleEndian>(self.font_id)?;
        out.write_f32::<LittleEndian>(self.line_compression)?;
        write_bool(out, self.extra_paragraph_spacing)?;
        out.write_u8(self.paragraph_alignment.as_u8())?;
        out.write_u16::<LittleEndian>(self.viewport_width)?;
        out.write_u16::<LittleEndian>(self.viewport_height)?;
        write_bool(out, self.hyphenation)?;
        write_bool(out, self.embedded_style)?;
        write_bool(out, self.force_bold)
    }

    /// `None` when the stored alignment byte is not one we know.
    fn read_key<R: Read>(input: &mut R) -> io::Result<Option<Self>> {
        let font_id = input.read_i32::<LittleEndian>()?;
        let line_compression = input.read_f32::<LittleEndian>()?;
        let extra_paragraph_spacing = read_bool(input)?;
        let alignment = input.read_u8()?;
        let viewport_width = input.read_u16::<LittleEndian>()?;
        let viewport_height = input.read_u16::<LittleEndian>()?;
        let hyphenation = read_bool(input)?;
        let embedded_style = read_bool(input)?;
        let force_bold = read_bool(input)?;
        Ok(ParagraphAlignment::from_u8(alignment).map(|paragraph_alignment| Self {
            font_id,
            line_compression,
            extra_paragraph_spacing,
            paragraph_alignment,
            viewport_width,
            viewport_height,
            hyphenation,
            embedded_style,
            force_bold,
        }))
    }
}

/// The page cache of one spine item.
pub struct SectionCache {
    spine_index: usize,
    href: String,
    cache_dir: PathBuf,
    file_path: PathBuf,
    pub page_count: u16,
    pub current_page: usize,
}

impl SectionCache {
    /// `cache_dir` is the book's cache directory; `href` the spine item's
    /// archive path.
    pub fn new(cache_dir: &Path, spine_index: usize, href: impl Into<String>) -> Self {
        Self {
            spine_index,
            href: href.into(),
            cache_dir: cache_dir.to_path_buf(),
            file_path: cache_dir.join("sections").join(format!("{spine_index}.bin")),
            page_count: 0,
            current_page: 0,
        }
    }

    pub fn spine_index(&self) -> usize {
        self.spine_index
    }

    pub fn href(&self) -> &str {
        &self.href
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Validate an existing section file against `params`. A version or
    /// parameter mismatch deletes the file.
    pub fn load_section_file(&mut self, params: &RenderParams) -> Result<(), SectionError> {
        let file = match File::open(&self.file_path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(SectionError::NotCached),
            Err(e) => return Err(e.into()),
        };
        let mut file = BufReader::new(file);

        let version = file.read_u8()?;
        if version != SECTION_FILE_VERSION {
            drop(file);
            tracing::info!("Section cache {} has unknown version {version}", self.spine_index);
            self.clear_cache()?;
            return Err(SectionError::VersionMismatch {
                expected: SECTION_FILE_VERSION,
                found: version,
            });
        }

        let stored = RenderParams::read_key(&mut file)?;
        if stored.as_ref() != Some(params) {
            drop(file);
            tracing::info!("Section cache {} parameters do not match", self.spine_index);
            self.clear_cache()?;
            return Err(SectionError::ParamsMismatch);
        }

        self.page_count = file.read_u16::<LittleEndian>()?;
        tracing::debug!("Section {} loaded: {} pages", self.spine_index, self.page_count);
        Ok(())
    }

    pub fn clear_cache(&self) -> Result<(), SectionError> {
        if !self.file_path.exists() {
            tracing::debug!("Section cache does not exist, no action needed");
            return Ok(());
        }
        fs::remove_file(&self.file_path)?;
        tracing::debug!("Section cache {} cleared", self.spine_index);
        Ok(())
    }

    fn tmp_html_path(&self) -> PathBuf {
        self.cache_dir.join(format!(".tmp_{}.html", self.spine_index))
    }

    /// Inflate the chapter into a scratch file, retrying transient failures.
    fn stream_chapter(&self, epub: &Epub) -> Result<PathBuf, SectionError> {
        let tmp_path = self.tmp_html_path();
        for attempt in 0..STREAM_ATTEMPTS {
            if attempt > 0 {
                tracing::warn!("Retrying stream of {} (attempt {})", self.href, attempt + 1);
                thread::sleep(STREAM_RETRY_DELAY);
            }
            if tmp_path.exists() {
                let _ = fs::remove_file(&tmp_path);
            }

            let result = File::create(&tmp_path)
                .map_err(|e| e.to_string())
                .and_then(|f| {
                    let mut out = BufWriter::new(f);
                    let written = epub
                        .read_item_contents_to_stream(&self.href, &mut out, DEFAULT_CHUNK_SIZE)
                        .map_err(|e| e.to_string())?;
                    out.flush().map_err(|e| e.to_string())?;
                    Ok(written)
                });

            match result {
                Ok(size) => {
                    tracing::debug!("Streamed {} to {} ({size} bytes)", self.href, tmp_path.display());
                    return Ok(tmp_path);
                }
                Err(e) => {
                    tracing::warn!("Streaming {} failed: {e}", self.href);
                    if tmp_path.exists() {
                        let _ = fs::remove_file(&tmp_path);
                    }
                }
            }
        }
        Err(SectionError::StreamFailed {
            href: self.href.clone(),
            attempts: STREAM_ATTEMPTS,
        })
    }

    /// Paginate the chapter and persist every page. On any failure the
    /// section file is removed; a partially written cache never survives.
    pub fn create_section_file<P: Paginator>(
        &mut self,
        epub: &Epub,
        paginator: &P,
        params: &RenderParams,
        progress: Option<&dyn ProgressHandler>,
    ) -> Result<(), SectionError> {
        let tmp_html = self.stream_chapter(epub)?;
        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let result = self.write_section_file(&tmp_html, paginator, params, progress);
        if let Err(e) = fs::remove_file(&tmp_html) {
            tracing::warn!("Couldn't remove {}: {e}", tmp_html.display());
        }

        match result {
            Ok(page_count) => {
                self.page_count = page_count;
                tracing::debug!("Section {} built: {page_count} pages", self.spine_index);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to build section {}: {e}", self.spine_index);
                if self.file_path.exists() {
                    let _ = fs::remove_file(&self.file_path);
                }
                Err(e)
            }
        }
    }

    fn write_section_file<P: Paginator>(
        &self,
        source: &Path,
        paginator: &P,
        params: &RenderParams,
        progress: Option<&dyn ProgressHandler>,
    ) -> Result<u16, SectionError> {
        let mut file = BufWriter::new(File::create(&self.file_path)?);
        file.write_u8(SECTION_FILE_VERSION)?;
        params.write_key(&mut file)?;
        file.write_u16::<LittleEndian>(0)?;
        file.write_u32::<LittleEndian>(0)?;

        let mut position = SECTION_HEADER_SIZE;
        let mut lut: Vec<u32> = Vec::new();
        let mut record = Vec::new();

        for page in paginator.paginate(source, params)? {
            let page = page?;
            record.clear();
            let offset = match page.write_to(&mut record) {
                Ok(()) => {
                    let offset = u32::try_from(position).unwrap_or(0);
                    file.write_all(&record)?;
                    position += record.len() as u64;
                    offset
                }
                Err(e) => {
                    tracing::warn!("Failed to serialize page {} of section {}: {e}", lut.len(), self.spine_index);
                    0
                }
            };
            lut.push(offset);
            tracing::debug!("Page {} processed", lut.len() - 1);
            emit_progress(progress, "Indexing", lut.len() as u64, None, Some(&self.href));
        }

        if let Some(page) = lut.iter().position(|&offset| offset == 0) {
            return Err(SectionError::InvalidPageOffset { page });
        }
        let page_count = u16::try_from(lut.len()).map_err(|_| SectionError::TooManyPages { count: lut.len() })?;
        let lut_offset = u32::try_from(position).map_err(|_| SectionError::TooManyPages { count: lut.len() })?;

        for offset in &lut {
            file.write_u32::<LittleEndian>(*offset)?;
        }

        file.seek(SeekFrom::Start(PAGE_COUNT_OFFSET))?;
        file.write_u16::<LittleEndian>(page_count)?;
        file.write_u32::<LittleEndian>(lut_offset)?;
        file.flush()?;
        Ok(page_count)
    }

    /// Read one page through the trailing lookup table.
    pub fn load_page<P: PageRecord>(&self, page: usize) -> Result<P, SectionError> {
        if page >= usize::from(self.page_count) {
            return Err(SectionError::PageOutOfRange {
                page,
                count: self.page_count,
            });
        }
        let mut file = BufReader::new(File::open(&self.file_path)?);
        file.seek(SeekFrom::Start(LUT_OFFSET_OFFSET))?;
        let lut_offset = file.read_u32::<LittleEndian>()?;
        file.seek(SeekFrom::Start(u64::from(lut_offset) + 4 * page as u64))?;
        let page_pos = file.read_u32::<LittleEndian>()?;
        file.seek(SeekFrom::Start(u64::from(page_pos)))?;
        Ok(P::read_from(&mut file)?)
    }

    pub fn load_page_from_section_file<P: PageRecord>(&self) -> Result<P, SectionError> {
        self.load_page(self.current_page)
    }

    /// Load the cached section, building it when missing, stale or unreadable.
    /// Returns `true` when a build happened.
    pub fn open_or_build<P: Paginator>(
        &mut self,
        epub: &Epub,
        paginator: &P,
        params: &RenderParams,
        progress: Option<&dyn ProgressHandler>,
    ) -> Result<bool, SectionError> {
        match self.load_section_file(params) {
            Ok(()) => return Ok(false),
            Err(e) if e.is_invalidation() => {
                tracing::debug!("Section {} needs building: {e}", self.spine_index);
            }
            Err(SectionError::Io(e)) => {
                tracing::warn!("Section {} unreadable, rebuilding: {e}", self.spine_index);
                self.clear_cache()?;
            }
            Err(e) => return Err(e),
        }
        self.create_section_file(epub, paginator, params, progress)?;
        Ok(true)
    }
}
