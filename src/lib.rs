//! # Gridbook
//!
//! A single-instrument limit order book over a dense, preallocated tick grid.
//!
//! ## Design Principles
//!
//! - **Single-Writer**: one dispatcher thread owns all book mutation
//! - **Dense Grid**: every tick in `[min, max]` has a preallocated cell
//! - **Cached Extrema**: best bid/ask and the outer populated bounds are
//!   tracked incrementally so matching and depth queries never walk the
//!   whole grid
//! - **Deferred Callbacks**: execution notifications are queued inside the
//!   critical section and delivered after the lock is released, so user
//!   callbacks may submit further orders
//!
//! ## Architecture
//!
//! ```text
//! [Caller Threads] --> [Ticket Queue] --> [Dispatcher Thread]
//!                                               |
//!                                        [Book (master lock)]
//!                                               |
//!                                    [Deferred Callback Queue]
//!                                               |
//!                              [Drained on caller / waker thread]
//! ```
//!
//! Stop orders rest in per-cell stop chains and are re-injected through the
//! ticket queue when the last trade price crosses them, preserving their
//! original order IDs.

pub mod chain;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod extrema;
pub mod grid;
pub mod ladder;
pub mod matching;

// Re-exports for convenience
pub use chain::{Chain, LimitBundle, StopBundle};
pub use command::{AdminCallback, CallbackMsg, ExecCallback, OrderId, OrderInfo, Tick, TradePrint};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::BookError;
pub use extrema::ExtremaCache;
pub use grid::PriceGrid;
pub use ladder::TickLadder;
pub use matching::Book;
