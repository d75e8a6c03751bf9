use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

/// The engine-wide error taxonomy.
///
/// `Concurrency` and `SyncConflict` are internal signals: the synchronizer
/// always consumes them (merge attempt or conflict rename) and they never
/// reach a path-based API caller.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("not available: {0}")]
    NotAvailable(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("corrupted data: {0}")]
    Corrupt(String),

    /// The server holds a version >= the one we tried to upload.
    #[error("concurrent remote update")]
    Concurrency,

    /// File-level conflict that cannot be auto-merged; resolved by the
    /// parent folder's sync via a conflict rename.
    #[error("file sync conflict")]
    SyncConflict,

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FsError {
    /// True for the internal signals that must never surface from the
    /// path-based API.
    pub fn is_internal(&self) -> bool {
        matches!(self, FsError::Concurrency | FsError::SyncConflict)
    }
}
