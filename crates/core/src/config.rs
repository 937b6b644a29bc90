//! Config file parsing for `~/.config/epub-index/config.toml`.
//!
//! The layout section is the reader's view of a chapter; use
//! [`LayoutConfig::render_params`] to get the cache key a section file is
//! validated against.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::archive::DEFAULT_CHUNK_SIZE;
use crate::parsers::opf::DEFAULT_MANIFEST_INDEX_THRESHOLD;
use crate::section::{ParagraphAlignment, RenderParams};

const APP_DIR: &str = "epub-index";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub index: IndexConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root for per-book cache directories. Defaults to the platform cache dir.
    pub dir: Option<String>,
}

impl CacheConfig {
    pub fn root(&self) -> PathBuf {
        match &self.dir {
            Some(dir) => PathBuf::from(dir),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(APP_DIR),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineSpacing {
    Tight,
    #[default]
    Normal,
    Wide,
}

impl LineSpacing {
    pub fn compression(self) -> f32 {
        match self {
            LineSpacing::Tight => 0.95,
            LineSpacing::Normal => 1.0,
            LineSpacing::Wide => 1.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub font_id: i32,
    pub line_spacing: LineSpacing,
    pub extra_paragraph_spacing: bool,
    pub paragraph_alignment: ParagraphAlignment,
    pub viewport_width: u16,
    pub viewport_height: u16,
    pub hyphenation: bool,
    pub embedded_style: bool,
    pub force_bold: bool,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            font_id: 0,
            line_spacing: LineSpacing::Normal,
            extra_paragraph_spacing: true,
            paragraph_alignment: ParagraphAlignment::Justified,
            viewport_width: 464,
            viewport_height: 760,
            hyphenation: false,
            embedded_style: true,
            force_bold: false,
        }
    }
}

impl LayoutConfig {
    pub fn render_params(&self) -> RenderParams {
        RenderParams {
            font_id: self.font_id,
            line_compression: self.line_spacing.compression(),
            extra_paragraph_spacing: self.extra_paragraph_spacing,
            paragraph_alignment: self.paragraph_alignment,
            viewport_width: self.viewport_width,
            viewport_height: self.viewport_height,
            hyphenation: self.hyphenation,
            embedded_style: self.embedded_style,
            force_bold: self.force_bold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Manifest size at which spine lookups switch to a sorted hash index.
    pub manifest_index_threshold: usize,
    /// Chunk size used when streaming archive entries into parsers.
    pub stream_chunk_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            manifest_index_threshold: DEFAULT_MANIFEST_INDEX_THRESHOLD,
            stream_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Load config from the default path. Missing or unreadable files give defaults.
pub fn load_config() -> AppConfig {
    match config_path() {
        Some(path) => load_config_from(&path),
        None => AppConfig::default(),
    }
}

pub fn load_config_from(path: &Path) -> AppConfig {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return AppConfig::default(),
    };

    match toml::from_str::<AppConfig>(&content) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("Ignoring invalid config {}: {e}", path.display());
            AppConfig::default()
        }
    }
}

/// Return the default config file path (for init and show).
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut p| {
        p.push(APP_DIR);
        p.push("config.toml");
        p
    })
}
