/// Top-level error type. All public `Epub` operations return this.
#[derive(Debug, thiserror::Error)]
pub enum EpubError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Book index error: {0}")]
    Cache(#[from] CacheError),

    #[error("Section error: {0}")]
    Section(#[from] SectionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Malformed {document}: {detail}")]
    Syntax {
        document: &'static str,
        detail: String,
    },

    #[error("{document} parser is not active")]
    Inactive { document: &'static str },

    #[error("Missing required content: {0}")]
    MissingContent(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Could not open EPUB archive {path}: {detail}")]
    Open { path: String, detail: String },

    #[error("Missing archive entry: {0}")]
    MissingEntry(String),

    #[error("Failed to read {path}: {detail}")]
    Read { path: String, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Book index is not in build mode")]
    NotBuilding,

    #[error("Book index is not loaded")]
    NotLoaded,

    #[error("Book index version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("{kind} index {index} out of range (count {count})")]
    OutOfRange {
        kind: &'static str,
        index: usize,
        count: u32,
    },

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SectionError {
    #[error("No section cache on disk")]
    NotCached,

    #[error("Section cache version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("Section cache was built with different render parameters")]
    ParamsMismatch,

    #[error("Failed to stream chapter {href} after {attempts} attempts")]
    StreamFailed { href: String, attempts: u32 },

    #[error("Pagination failed: {0}")]
    Pagination(String),

    #[error("Page {page} failed to serialize; section discarded")]
    InvalidPageOffset { page: usize },

    #[error("Section has {count} pages, more than the format can index")]
    TooManyPages { count: usize },

    #[error("Page {page} out of range (page count {count})")]
    PageOutOfRange { page: usize, count: u16 },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SectionError {
    /// True when the error means "the cached file is unusable, rebuild it"
    /// rather than a hard failure.
    pub fn is_invalidation(&self) -> bool {
        matches!(
            self,
            SectionError::NotCached | SectionError::VersionMismatch { .. } | SectionError::ParamsMismatch
        )
    }
}
