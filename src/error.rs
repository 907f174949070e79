use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Out of space: not enough free segments to admit bundle")]
    OutOfSpace,

    #[error("Bundle not fully read prior to removal")]
    BundleNotFullyRead,

    #[error("Invalid segment id: {0}")]
    InvalidSegmentId(u64),

    #[error("Segment {0} could not be read back from disk")]
    SegmentReadFailed(u64),

    #[error("Bundle priority uses the reserved encoding")]
    UnsupportedPriority,

    #[error("Invalid storage configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
