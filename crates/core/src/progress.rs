//! Progress reporting for index builds and pagination.

/// Event emitted during long-running operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub operation: String,
    pub current: u64,
    pub total: Option<u64>,
    pub message: Option<String>,
}

/// Receives progress updates: one per build stage while indexing a book,
/// one per persisted page while paginating a chapter.
pub trait ProgressHandler: Send {
    fn on_progress(&self, event: ProgressEvent);
}

/// Helper to emit a progress event if a handler is provided.
pub fn emit_progress(
    handler: Option<&dyn ProgressHandler>,
    operation: &str,
    current: u64,
    total: Option<u64>,
    message: Option<&str>,
) {
    if let Some(h) = handler {
        h.on_progress(ProgressEvent {
            operation: operation.to_string(),
            current,
            total,
            message: message.map(|s| s.to_string()),
        });
    }
}
