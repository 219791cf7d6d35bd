use kvpin_core::KvpinError;

#[derive(Debug, thiserror::Error)]
pub enum DriverLoadError {
    #[error("failed to load {what} library (tried {tried:?}): {last_error}")]
    LibraryNotFound {
        what: &'static str,
        tried: Vec<String>,
        last_error: String,
    },

    #[error("failed to resolve {symbol}: {reason}")]
    MissingSymbol { symbol: &'static str, reason: String },

    #[error("{call} failed with status {status}")]
    InitFailed { call: &'static str, status: i32 },
}

impl From<DriverLoadError> for KvpinError {
    fn from(e: DriverLoadError) -> Self {
        KvpinError::DriverUnavailable(e.to_string())
    }
}
