//! Error types for mixtrail-core.

use bitcoin::Txid;

// ==============================================================================
// Explorer Errors
// ==============================================================================

/// Structured errors from the block-explorer HTTP layer.
///
/// Each variant captures a specific failure mode rather than collapsing
/// everything into a single `String`, which makes programmatic error
/// handling (retries on transient errors vs. permanent ones) possible.
#[derive(Debug, thiserror::Error)]
pub enum ExplorerError {
    /// The explorer answered 429; the request may be retried after a delay.
    #[error("explorer rate limited the request")]
    RateLimited,

    /// The explorer answered with a server-side error status.
    #[error("explorer unavailable: HTTP {0}")]
    Unavailable(u16),

    #[error("HTTP transport: {0}")]
    Transport(#[source] reqwest::Error),

    /// The requested resource does not exist. Not retried.
    #[error("resource not found")]
    NotFound,

    /// The explorer returned a body that does not match the documented
    /// wire format. Fatal for the call, never retried.
    #[error("malformed explorer response: {0}")]
    Malformed(String),
}

impl ExplorerError {
    /// Transient errors are retried with backoff inside the client;
    /// permanent ones surface immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Unavailable(_) | Self::Transport(_)
        )
    }
}

// ==============================================================================
// Store Errors
// ==============================================================================

/// Errors from the property-graph store HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("HTTP transport: {0}")]
    Transport(#[source] reqwest::Error),

    /// The store rejected a statement. `code` is the store's own error
    /// classification string.
    #[error("store error [{code}]: {message}")]
    Server { code: String, message: String },

    #[error("invalid store response: {0}")]
    InvalidResponse(String),
}

// ==============================================================================
// Core Errors
// ==============================================================================

/// Top-level error type for the mixtrail-core crate.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The explorer stayed unreachable after the client's retry budget.
    #[error("upstream explorer unavailable: {0}")]
    UpstreamUnavailable(#[source] ExplorerError),

    #[error("transaction not found: {0}")]
    TxNotFound(Txid),

    /// A write against the graph store failed.
    #[error("graph store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    /// The engine is at its concurrent-investigation cap and the
    /// configuration says to reject rather than queue.
    #[error("engine is at its concurrent investigation cap")]
    Busy,

    #[error("investigation deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        Self::StoreUnavailable(err)
    }
}

impl CoreError {
    /// Map an explorer failure while fetching `txid` into the caller-facing
    /// taxonomy: missing transactions stay strongly typed, everything else
    /// is an upstream availability problem.
    pub fn from_fetch(txid: Txid, err: ExplorerError) -> Self {
        match err {
            ExplorerError::NotFound => Self::TxNotFound(txid),
            other => Self::UpstreamUnavailable(other),
        }
    }
}
