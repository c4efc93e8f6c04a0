//! Error handling for the teslausb daemon.

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types, grouped by origin. Leaf components report; the
/// orchestrator decides policy per origin.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Backing image or local mount failure
    #[error("disk: {0}")]
    Disk(String),

    /// USB gadget / configfs failure
    #[error("gadget: {0}")]
    Gadget(String),

    /// Archive share or rsync failure
    #[error("archive: {0}")]
    Archive(String),

    /// BLE command failure
    #[error("ble: {0}")]
    Ble(String),

    /// Configuration error
    #[error("config: {0}")]
    Config(String),

    /// Timed out waiting on an external condition
    #[error("timeout: {0}")]
    Timeout(String),

    /// Operation aborted by shutdown
    #[error("cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
