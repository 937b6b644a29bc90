use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};

use epub_index_core::config::{config_path, load_config, AppConfig, LineSpacing};
use epub_index_core::epub::Epub;
use epub_index_core::page::{PlainTextPaginator, TextPage};
use epub_index_core::position::ReadingPosition;
use epub_index_core::progress::{ProgressEvent, ProgressHandler};
use epub_index_core::section::ParagraphAlignment;

type CliResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "epub-index")]
#[command(about = "Build and inspect EPUB book indexes and chapter page caches")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Cache root (overrides cache.dir from the config file)
    #[arg(long, global = true)]
    cache_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or load the book index and show metadata
    Index {
        /// Input file
        #[arg(required = true)]
        input: String,

        /// Discard any cached index first
        #[arg(long)]
        rebuild: bool,
    },

    /// List the spine in reading order
    Spine {
        /// Input file
        #[arg(required = true)]
        input: String,
    },

    /// List the table of contents
    Toc {
        /// Input file
        #[arg(required = true)]
        input: String,
    },

    /// Load or build the page cache of one chapter
    Paginate {
        /// Input file
        #[arg(required = true)]
        input: String,

        /// Spine index of the chapter
        #[arg(long)]
        spine: usize,
    },

    /// Print one page; without --spine, resume from the saved position
    Page {
        /// Input file
        #[arg(required = true)]
        input: String,

        /// Spine index of the chapter
        #[arg(long)]
        spine: Option<usize>,

        /// Page within the chapter
        #[arg(long)]
        page: Option<usize>,
    },

    /// Remove the book's cache directory
    Clear {
        /// Input file
        #[arg(required = true)]
        input: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Initialize default config file
    Init,
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Key (dot-separated path)
        key: String,
        /// Value
        value: String,
    },
}

/// Drives a terminal progress bar from library progress events.
struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new(json: bool) -> Self {
        let bar = if json {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        if let Ok(style) = ProgressStyle::with_template("{spinner} {prefix}: {msg} [{pos}]") {
            bar.set_style(style);
        }
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressHandler for BarProgress {
    fn on_progress(&self, event: ProgressEvent) {
        if let Some(total) = event.total {
            self.bar.set_length(total);
        }
        self.bar.set_prefix(event.operation);
        self.bar.set_position(event.current);
        if let Some(message) = event.message {
            self.bar.set_message(message);
        }
    }
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = load_config();
    let cache_root = cli
        .cache_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| cfg.cache.root());

    let result = match &cli.command {
        Commands::Index { input, rebuild } => run_index(input, *rebuild, &cache_root, &cfg, cli.json),
        Commands::Spine { input } => run_spine(input, &cache_root, &cfg, cli.json),
        Commands::Toc { input } => run_toc(input, &cache_root, &cfg, cli.json),
        Commands::Paginate { input, spine } => run_paginate(input, *spine, &cache_root, &cfg, cli.json),
        Commands::Page { input, spine, page } => run_page(input, *spine, *page, &cache_root, &cfg, cli.json),
        Commands::Clear { input } => run_clear(input, &cache_root, cli.json),
        Commands::Config { action } => run_config(action, cli.json),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn open_book(input: &str, cache_root: &Path, cfg: &AppConfig, json: bool) -> Result<Epub, Box<dyn std::error::Error + Send + Sync>> {
    let path = Path::new(input);
    if !path.exists() {
        return Err(format!("Input file not found: {}", path.display()).into());
    }
    let mut epub = Epub::new(path, cache_root).with_config(cfg.index.clone());
    let progress = BarProgress::new(json);
    let loaded = epub.load(true, Some(&progress));
    progress.finish();
    loaded?;
    Ok(epub)
}

fn run_index(input: &str, rebuild: bool, cache_root: &Path, cfg: &AppConfig, json: bool) -> CliResult {
    if rebuild {
        let mut stale = Epub::new(input, cache_root);
        tracing::info!("Rebuilding index in {}", stale.cache_path().display());
        stale.clear_cache()?;
    }
    let mut epub = open_book(input, cache_root, cfg, json)?;
    let book_size = epub.book_size()?;
    let text_start = epub.spine_index_for_text_reference()?;
    let position = epub.reading_position()?;

    if json {
        let info = serde_json::json!({
            "metadata": epub.metadata(),
            "language": epub.language(),
            "spine_count": epub.spine_items_count(),
            "toc_count": epub.toc_items_count(),
            "book_size": book_size,
            "text_start_spine_index": text_start,
            "position": position,
            "cache_path": epub.cache_path(),
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("Title: {}", epub.title());
        if !epub.author().is_empty() {
            println!("Author: {}", epub.author());
        }
        if let Some(language) = epub.language() {
            println!("Language: {}", language);
        }
        if !epub.cover_item_href().is_empty() {
            println!("Cover: {}", epub.cover_item_href());
        }
        println!("Spine items: {}", epub.spine_items_count());
        println!("TOC entries: {}", epub.toc_items_count());
        println!("Book size: {} bytes", book_size);
        println!("Text starts at spine item {}", text_start);
        if let Some(p) = position {
            println!("Saved position: spine {} page {}", p.spine_index, p.page);
        }
        println!("Cache: {}", epub.cache_path().display());
    }
    Ok(())
}

fn run_spine(input: &str, cache_root: &Path, cfg: &AppConfig, json: bool) -> CliResult {
    let mut epub = open_book(input, cache_root, cfg, json)?;
    let spine = epub.spine_items()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&spine)?);
    } else {
        for (i, item) in spine.iter().enumerate() {
            let toc = if item.toc_index >= 0 {
                format!("toc {}", item.toc_index)
            } else {
                "-".to_string()
            };
            println!("{:>4}  {:>10}  {:<8}  {}", i, item.cumulative_size, toc, item.href);
        }
    }
    Ok(())
}

fn run_toc(input: &str, cache_root: &Path, cfg: &AppConfig, json: bool) -> CliResult {
    let mut epub = open_book(input, cache_root, cfg, json)?;
    let toc = epub.toc_items()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&toc)?);
    } else if toc.is_empty() {
        println!("No table of contents");
    } else {
        for entry in &toc {
            let indent = "  ".repeat(usize::from(entry.level.saturating_sub(1)));
            let target = if entry.anchor.is_empty() {
                entry.href.clone()
            } else {
                format!("{}#{}", entry.href, entry.anchor)
            };
            println!("{}{} -> {} (spine {})", indent, entry.title, target, entry.spine_index);
        }
    }
    Ok(())
}

fn run_paginate(input: &str, spine: usize, cache_root: &Path, cfg: &AppConfig, json: bool) -> CliResult {
    let mut epub = open_book(input, cache_root, cfg, json)?;
    let mut section = epub.section(spine)?;
    let params = cfg.layout.render_params();

    let progress = BarProgress::new(json);
    let built = section.open_or_build(&epub, &PlainTextPaginator, &params, Some(&progress));
    progress.finish();
    let built = built?;

    if json {
        let info = serde_json::json!({
            "spine_index": spine,
            "href": section.href(),
            "page_count": section.page_count,
            "built": built,
            "file": section.file_path(),
            "params": params,
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        let how = if built { "Built" } else { "Loaded" };
        println!("{} {} ({} pages)", how, section.href(), section.page_count);
    }
    Ok(())
}

fn run_page(
    input: &str,
    spine: Option<usize>,
    page: Option<usize>,
    cache_root: &Path,
    cfg: &AppConfig,
    json: bool,
) -> CliResult {
    let mut epub = open_book(input, cache_root, cfg, json)?;
    let saved = epub.reading_position()?;
    let spine = match (spine, saved) {
        (Some(s), _) => s,
        (None, Some(p)) => usize::from(p.spine_index),
        (None, None) => epub.spine_index_for_text_reference()?,
    };
    tracing::debug!("Opening spine {spine} (saved position: {saved:?})");

    let mut section = epub.section(spine)?;
    let params = cfg.layout.render_params();
    section.open_or_build(&epub, &PlainTextPaginator, &params, None)?;

    section.current_page = match (page, saved) {
        (Some(p), _) => p,
        (None, Some(p)) if usize::from(p.spine_index) == spine => usize::from(p.page_for(section.page_count)),
        _ => 0,
    };
    let text: TextPage = section.load_page_from_section_file()?;

    let read = if section.page_count > 0 {
        (section.current_page + 1) as f32 / f32::from(section.page_count)
    } else {
        0.0
    };
    let percent = epub.calculate_progress(spine, read)?;

    let position = ReadingPosition {
        spine_index: u16::try_from(spine)?,
        page: u16::try_from(section.current_page)?,
        page_count: section.page_count,
    };
    epub.save_reading_position(&position)?;

    if json {
        let info = serde_json::json!({
            "spine_index": spine,
            "page": section.current_page,
            "page_count": section.page_count,
            "progress_percent": percent,
            "lines": text.lines,
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("{}", text.text());
        println!();
        println!(
            "-- spine {} page {}/{} ({}%) --",
            spine,
            section.current_page + 1,
            section.page_count,
            percent
        );
    }
    Ok(())
}

fn run_clear(input: &str, cache_root: &Path, json: bool) -> CliResult {
    let mut epub = Epub::new(input, cache_root);
    epub.clear_cache()?;
    if json {
        let info = serde_json::json!({ "cleared": epub.cache_path() });
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("Cleared {}", epub.cache_path().display());
    }
    Ok(())
}

fn run_config(
    action: &ConfigAction,
    json: bool,
) -> CliResult {
    match action {
        ConfigAction::Init => {
            let path = config_path().ok_or("Could not determine config directory")?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let default_cfg = AppConfig::default();
            let toml = toml::to_string_pretty(&default_cfg)?;
            std::fs::write(&path, toml)?;
            println!("Wrote default config to {}", path.display());
        }
        ConfigAction::Show => {
            let cfg = load_config();
            if json {
                println!("{}", serde_json::to_string_pretty(&cfg)?);
            } else {
                println!("{}", toml::to_string_pretty(&cfg)?);
            }
        }
        ConfigAction::Set { key, value } => {
            let path = config_path().ok_or("Could not determine config directory")?;
            let mut cfg: AppConfig = if path.exists() {
                let s = std::fs::read_to_string(&path)?;
                toml::from_str(&s).unwrap_or_else(|_| AppConfig::default())
            } else {
                AppConfig::default()
            };

            set_config_key(&mut cfg, key, value)?;

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let toml = toml::to_string_pretty(&cfg)?;
            std::fs::write(&path, toml)?;
            if !json {
                println!("Updated {}", key);
            }
        }
    }
    Ok(())
}

fn parse_line_spacing(value: &str) -> Result<LineSpacing, Box<dyn std::error::Error + Send + Sync>> {
    match value {
        "tight" => Ok(LineSpacing::Tight),
        "normal" => Ok(LineSpacing::Normal),
        "wide" => Ok(LineSpacing::Wide),
        _ => Err(format!("Unknown line spacing: {} (expected tight, normal or wide)", value).into()),
    }
}

fn parse_alignment(value: &str) -> Result<ParagraphAlignment, Box<dyn std::error::Error + Send + Sync>> {
    match value {
        "justified" => Ok(ParagraphAlignment::Justified),
        "left" => Ok(ParagraphAlignment::Left),
        "center" => Ok(ParagraphAlignment::Center),
        "right" => Ok(ParagraphAlignment::Right),
        "book" => Ok(ParagraphAlignment::Book),
        _ => Err(format!("Unknown paragraph alignment: {}", value).into()),
    }
}

fn set_config_key(cfg: &mut AppConfig, key: &str, value: &str) -> CliResult {
    let parts: Vec<&str> = key.splitn(2, '.').collect();
    match parts.as_slice() {
        ["cache", "dir"] => cfg.cache.dir = Some(value.to_string()),
        ["layout", sub] => match *sub {
            "font_id" => cfg.layout.font_id = value.parse()?,
            "line_spacing" => cfg.layout.line_spacing = parse_line_spacing(value)?,
            "extra_paragraph_spacing" => cfg.layout.extra_paragraph_spacing = value.parse()?,
            "paragraph_alignment" => cfg.layout.paragraph_alignment = parse_alignment(value)?,
            "viewport_width" => cfg.layout.viewport_width = value.parse()?,
            "viewport_height" => cfg.layout.viewport_height = value.parse()?,
            "hyphenation" => cfg.layout.hyphenation = value.parse()?,
            "embedded_style" => cfg.layout.embedded_style = value.parse()?,
            "force_bold" => cfg.layout.force_bold = value.parse()?,
            _ => return Err(format!("Unknown key: {}", key).into()),
        },
        ["index", sub] => match *sub {
            "manifest_index_threshold" => cfg.index.manifest_index_threshold = value.parse()?,
            "stream_chunk_size" => cfg.index.stream_chunk_size = value.parse()?,
            _ => return Err(format!("Unknown key: {}", key).into()),
        },
        _ => return Err(format!("Unknown key: {}", key).into()),
    }
    Ok(())
}
