/// The four ways a call into this crate can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PreconditionViolation,
    DriverFailure,
    CapacityExceeded,
    NotImplemented,
}

#[derive(Debug, thiserror::Error)]
pub enum KvpinError {
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),

    #[error("{op} failed with driver status {status}")]
    Driver { op: &'static str, status: i32 },

    #[error("driver library unavailable: {0}")]
    DriverUnavailable(String),

    #[error("host memory {op} failed: {source}")]
    HostMemory {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "{what} size {required} bytes exceeds on-chip scratch budget {available} bytes; \
         lower the number of tokens or the head dimensions"
    )]
    CapacityExceeded {
        what: &'static str,
        required: u64,
        available: u64,
    },

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("configuration error: {0}")]
    Config(String),
}

impl KvpinError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KvpinError::Precondition(_)
            | KvpinError::UnsupportedLayout(_)
            | KvpinError::Config(_) => ErrorKind::PreconditionViolation,
            KvpinError::Driver { .. }
            | KvpinError::DriverUnavailable(_)
            | KvpinError::HostMemory { .. } => ErrorKind::DriverFailure,
            KvpinError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            KvpinError::NotImplemented(_) => ErrorKind::NotImplemented,
        }
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        KvpinError::Precondition(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, KvpinError>;
