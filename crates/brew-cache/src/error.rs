pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache persistence and hydration.
///
/// Corrupt payloads are never reported through this type on the read path: reads
/// degrade to a miss and delete the offending file instead.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode cached payload: {message}")]
    Decode { message: String },

    #[error("failed to encode value for caching: {message}")]
    Encode { message: String },

    #[error("fetch failed: {message}")]
    Network { message: String },

    #[error("unsupported fetch URL {url}")]
    UnsupportedFetchUrl { url: String },

    #[error("invalid cache configuration: {message}")]
    Config { message: String },

    #[error("cache worker is no longer running")]
    WorkerUnavailable,

    #[error("operation was cancelled")]
    Cancelled,
}

impl CacheError {
    pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
        Self::Decode {
            message: err.to_string(),
        }
    }

    pub(crate) fn encode(err: impl std::fmt::Display) -> Self {
        Self::Encode {
            message: err.to_string(),
        }
    }

    /// Returns `true` for failures caused by the remote side rather than local storage.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::UnsupportedFetchUrl { .. })
    }
}

impl From<toml::de::Error> for CacheError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config {
            message: err.message().to_string(),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        // Persisted state only holds flags and version strings, but keep the message to the
        // error category and position so nothing user-provided is echoed back.
        Self::Decode {
            message: format!(
                "json {:?} error at line {} column {}",
                err.classify(),
                err.line(),
                err.column()
            ),
        }
    }
}
