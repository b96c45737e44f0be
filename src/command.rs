//! Callback and notification types shared across the engine.
//!
//! Callbacks are how order owners learn about fills, cancels, stop
//! promotions, and heartbeats. They are recorded inside the critical
//! section and invoked only after the master lock is released.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// External order identifier, assigned by the dispatcher on admission.
pub type OrderId = u64;

/// Index into the price grid. Cell 0 is a sentinel; valid ticks are
/// `1..=N` and `N + 1` is the past-end sentinel.
pub type Tick = usize;

/// What a callback invocation is reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum CallbackMsg {
    /// A partial or full execution. One per counterparty per sub-trade.
    Fill = 0,
    /// The order was pulled from the book.
    Cancel = 1,
    /// A stop-limit's stop price was crossed; it is being re-injected as a
    /// limit order under the same ID.
    StopToLimit = 2,
    /// Periodic heartbeat from the waker thread, carrying the last trade
    /// price.
    Wake = 3,
}

/// Execution callback: `(msg, order_id, price, size)`.
///
/// Runs on whichever thread drains the deferred queue, so it must be
/// `Send + Sync` and reentrancy-safe. It may submit further orders.
pub type ExecCallback = Arc<dyn Fn(CallbackMsg, OrderId, Decimal, u64) + Send + Sync>;

/// Admission callback, invoked once with the final order ID even when the
/// order filled immediately.
pub type AdminCallback = Box<dyn FnOnce(OrderId) + Send>;

/// Resting-order lookup result.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum OrderInfo {
    /// No resting order with that ID.
    NotFound,
    Limit {
        is_buy: bool,
        price: Decimal,
        size: u64,
    },
    Stop {
        is_buy: bool,
        stop_price: Decimal,
        size: u64,
    },
    StopLimit {
        is_buy: bool,
        stop_price: Decimal,
        limit_price: Decimal,
        size: u64,
    },
}

/// One entry of the time-and-sales tape.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TradePrint {
    pub at: DateTime<Utc>,
    pub price: Decimal,
    pub size: u64,
}

/// A notification queued under the master lock, delivered after release.
pub struct Deferred {
    pub msg: CallbackMsg,
    pub cb: ExecCallback,
    pub id: OrderId,
    pub price: Decimal,
    pub size: u64,
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("msg", &self.msg)
            .field("id", &self.id)
            .field("price", &self.price)
            .field("size", &self.size)
            .finish()
    }
}

/// A triggered stop waiting to re-enter the pipeline as a limit or market
/// order under its original ID.
pub struct Reinjection {
    pub id: OrderId,
    pub is_buy: bool,
    /// `Some` re-injects as a limit order at that tick, `None` as a market
    /// order.
    pub limit: Option<Tick>,
    pub size: u64,
    pub exec_cb: Option<ExecCallback>,
}

impl std::fmt::Debug for Reinjection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reinjection")
            .field("id", &self.id)
            .field("is_buy", &self.is_buy)
            .field("limit", &self.limit)
            .field("size", &self.size)
            .finish()
    }
}
