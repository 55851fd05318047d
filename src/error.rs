use thiserror::Error;

/// Domain-specific error types for dvrcore
#[derive(Error, Debug)]
pub enum DvrError {
    #[error("Seek position out of range: {0}")]
    SeekRange(f64),

    #[error("Failed to fetch ad manifest: {0}")]
    AdFetch(#[from] reqwest::Error),

    #[error("Ad manifest fetch returned HTTP {0}")]
    AdHttpStatus(u16),

    #[error("Failed to parse ad manifest: {0}")]
    ManifestParse(String),

    #[error("Invalid ad manifest URL: {0}")]
    InvalidAdUrl(String),
}

// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, DvrError>;
