//! Error taxonomy for the matching engine.

use thiserror::Error;

/// Errors surfaced by book operations and the submission pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookError {
    /// Bad size or out-of-range price; rejected before admission.
    #[error("invalid order: {0}")]
    InvalidOrder(&'static str),

    /// A market order exhausted the book with size left over. Fills that
    /// already happened are honored and their callbacks precede this error.
    #[error("insufficient liquidity: filled {filled} of {requested}")]
    Liquidity { filled: u64, requested: u64 },

    /// An extrema-cache adjustment observed a tick outside its cached
    /// bounds. Indicates a programming bug, fatal to the operation.
    #[error("extrema cache violation: {0}")]
    CacheValue(&'static str),

    /// Grid construction refused: empty range or more ticks than allowed.
    #[error("grid allocation refused: {0}")]
    Allocation(String),

    /// An internal invariant that should be unreachable was violated.
    #[error("internal logic error: {0}")]
    Logic(&'static str),

    /// The engine is shutting down; the submission's promise was dropped.
    #[error("engine shut down before the order completed")]
    Shutdown,
}
