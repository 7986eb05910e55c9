use std::backtrace::Backtrace;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the tablet engine.
///
/// Input errors and concurrency conflicts (`AlreadyPresent`, `NotFound`,
/// `InvalidArgument`) are returned to the caller after the transaction is
/// aborted and its row locks released. I/O and corruption errors are fatal to
/// the operation that hit them, never to the process. Invariant violations are
/// not represented here at all: they are programming errors and panic.
#[derive(Error, Debug)]
pub enum TabletError {
    #[error("entry already present: {0}")]
    AlreadyPresent(String),
    #[error("{0}({1}) not found")]
    NotFound(&'static str, String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("invalid checksum: found {0:#x}, expected {1:#x}")]
    Checksum(u64, u64),
    #[error("tablet is shutting down")]
    Aborted,
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),
    #[error("JSON decode error: {0}")]
    JsonDecode(#[from] serde_json::Error),
    #[error("protobuf encode error: {0}")]
    ProstEncode(prost::EncodeError),
    #[error("protobuf decode error: {0}")]
    ProstDecode(prost::DecodeError),
    #[error("{0}")]
    Nested(#[from] Arc<TracedTabletError>),
}

impl From<std::io::Error> for TracedTabletError {
    #[inline]
    fn from(e: std::io::Error) -> TracedTabletError {
        TabletError::Io(e.into()).into()
    }
}

impl From<serde_json::Error> for TracedTabletError {
    #[inline]
    fn from(e: serde_json::Error) -> TracedTabletError {
        TabletError::JsonDecode(e).into()
    }
}

impl From<prost::EncodeError> for TracedTabletError {
    #[inline]
    fn from(e: prost::EncodeError) -> TracedTabletError {
        TabletError::ProstEncode(e).into()
    }
}

impl From<prost::DecodeError> for TracedTabletError {
    #[inline]
    fn from(e: prost::DecodeError) -> TracedTabletError {
        TabletError::ProstDecode(e).into()
    }
}

impl From<Arc<TracedTabletError>> for TracedTabletError {
    #[inline]
    fn from(e: Arc<TracedTabletError>) -> TracedTabletError {
        TabletError::Nested(e).into()
    }
}

/// [`TabletError`] with a captured backtrace.
#[derive(Error)]
#[error("{source}")]
pub struct TracedTabletError {
    #[from]
    source: TabletError,
    backtrace: Backtrace,
}

impl std::fmt::Debug for TracedTabletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n{}", self.source, self.backtrace)
    }
}

impl TracedTabletError {
    pub fn already_present(item: impl ToString) -> Self {
        TabletError::AlreadyPresent(item.to_string()).into()
    }

    pub fn not_found(ty: &'static str, item: impl ToString) -> Self {
        TabletError::NotFound(ty, item.to_string()).into()
    }

    pub fn invalid_argument(message: impl ToString) -> Self {
        TabletError::InvalidArgument(message.to_string()).into()
    }

    pub fn corruption(message: impl ToString) -> Self {
        TabletError::Corruption(message.to_string()).into()
    }

    pub fn checksum(found: u64, expected: u64) -> Self {
        TabletError::Checksum(found, expected).into()
    }

    pub fn aborted() -> Self {
        TabletError::Aborted.into()
    }

    /// The underlying error kind.
    pub fn kind(&self) -> &TabletError {
        &self.source
    }

    /// True for the conflict errors a write path reports after releasing row
    /// locks.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self.source,
            TabletError::AlreadyPresent(_) | TabletError::NotFound(..)
        )
    }
}

pub type TabletResult<T> = std::result::Result<T, TracedTabletError>;
