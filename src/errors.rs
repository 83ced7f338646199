use thiserror::Error;

/// A single source attempt failed. The fetcher recovers by moving on to the
/// next candidate source; these never reach the user directly.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("bad status: {0}")]
    Status(u16),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("implausible value {value} (allowed {min}..={max})")]
    Implausible { value: f64, min: f64, max: f64 },

    #[error("no sources configured")]
    NoSources,
}

/// A backup document was rejected as a whole. Nothing was written.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("backup is not valid JSON: {0}")]
    Malformed(String),

    #[error("backup top level must be an object")]
    NotAnObject,

    #[error("backup has no version tag")]
    MissingVersion,

    #[error("unsupported backup version {0}")]
    UnsupportedVersion(u64),

    #[error("backup contains no recognised sections")]
    Empty,
}

/// Rejected user configuration. Raised before any state change.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("select at least one asset to track")]
    EmptySelection,

    #[error("unknown asset: {0}")]
    UnknownAsset(String),

    #[error("refresh interval must be at least {min} ms (got {got})")]
    InvalidRefreshInterval { got: u64, min: u64 },

    #[error("alert threshold must be a positive number (got {0})")]
    InvalidThreshold(f64),

    #[error("unknown alert kind: {0}")]
    UnknownAlertKind(String),
}
