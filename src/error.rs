//! Internal error types.
//!
//! None of these ever escape [`crate::host::GraphicsHost::parse_command`] —
//! the dispatcher downgrades every variant into a response frame (see
//! `response.rs`). They exist so the components below the dispatcher can
//! propagate failures with `?` instead of threading status codes by hand.

use thiserror::Error;

/// Failure decoding pixel data (§4.B).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("pixel budget exceeded")]
    OverBudget,
    #[error("zlib inflate failed: {0}")]
    Inflate(String),
    #[error("image decode backend failed: {0}")]
    Backend(String),
    #[error("truncated pixel stream")]
    Truncated,
}

/// Failure looking something up in the image/placement store (§4.C).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown image id {0}")]
    UnknownImage(u32),
    #[error("unknown placement id {0} for image {1}")]
    UnknownPlacement(u32, u32),
    #[error("could not allocate a non-colliding id")]
    IdExhausted,
}

/// Top-level internal error, used by components beneath the dispatcher.
#[derive(Debug, Error)]
pub enum GraphicsError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
