//! Error types for the session guard.
//!
//! Most of the engine never surfaces errors to its caller: probe failures
//! degrade to sentinels, corrupt state resets to defaults and reporting
//! failures are swallowed. These types exist for the seams where a host
//! implementation can fail and for configuration loading.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A single environment probe could not produce a value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("capability not supported by host")]
    Unsupported,

    #[error("probe timed out")]
    Timeout,

    #[error("probe failed: {0}")]
    Failed(String),
}

/// Errors from a key-value store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store contents are not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Errors from a reporting sink. Always discarded by the reporter.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report sink unavailable")]
    Unavailable,

    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("report delivery failed: {0}")]
    Delivery(String),
}
