//! Sync error types.

use thiserror::Error;

/// Inbound envelope could not be routed or applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown operation code {code}")]
    UnknownOp { code: i64 },

    #[error("operation {op} is not supported by widget {widget}")]
    UnsupportedOp { widget: String, op: &'static str },

    #[error("message received for unregistered widget: {0}")]
    UnknownWidget(String),

    #[error("invalid static operation: {0}")]
    InvalidStaticOp(String),

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("generic operation {0} is not enabled on this channel")]
    GenericOpDisabled(&'static str),

    #[error("fragment rejected: {0}")]
    FragmentRejected(String),
}

/// Identity map misuse. Always a no-op; the caller may resubmit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryConflict {
    #[error("key already exists: {0}")]
    DuplicateKey(String),

    #[error("key does not exist: {0}")]
    MissingKey(String),
}

/// Sync error type.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("registry conflict: {0}")]
    Registry(#[from] RegistryConflict),

    #[error("render target missing: {0}")]
    RenderTargetMissing(String),

    #[error("transfer interrupted at {progress:.1}% progress")]
    TransferInterrupted { progress: f64 },

    #[error("channel is not open")]
    NotOpen,

    #[error("control already bound: {0}")]
    AlreadyBound(String),

    #[error("cannot {action} while {state}")]
    InvalidTransition { state: &'static str, action: &'static str },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Sync result type.
pub type Result<T> = std::result::Result<T, SyncError>;
