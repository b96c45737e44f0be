//! Engine configuration.

use rust_decimal::Decimal;
use serde::Deserialize;

/// Construction parameters for an [`Engine`](crate::Engine).
///
/// The price range and tick ratio are fixed for the engine's lifetime; the
/// grid is preallocated across the whole range at startup.
#[derive(Clone, Debug, Deserialize)]
pub struct EngineConfig {
    /// Starting price; also the initial `last` for wake heartbeats.
    pub reference_price: Decimal,
    /// Lowest representable price (tick 1).
    pub min_price: Decimal,
    /// Highest representable price (tick N).
    pub max_price: Decimal,
    /// Tick increment as a rational `num / den`.
    pub tick_num: u32,
    pub tick_den: u32,
    /// Heartbeat interval for registered wake subscribers. `None` disables
    /// the waker thread.
    #[serde(default)]
    pub waker_sleep_ms: Option<u64>,
    /// Ring capacity of the time-and-sales tape.
    #[serde(default = "default_tape_capacity")]
    pub time_and_sales_capacity: usize,
    /// Hard ceiling on the grid size; construction refuses wider ranges.
    #[serde(default = "default_max_ticks")]
    pub max_ticks: usize,
    /// Pin the dispatcher thread to the last available core.
    #[serde(default)]
    pub pin_dispatcher: bool,
}

fn default_tape_capacity() -> usize {
    1000
}

fn default_max_ticks() -> usize {
    1_000_000
}

impl EngineConfig {
    /// Config with default tape capacity, tick guard, no waker, no pinning.
    pub fn new(
        reference_price: Decimal,
        min_price: Decimal,
        max_price: Decimal,
        tick_ratio: (u32, u32),
    ) -> Self {
        Self {
            reference_price,
            min_price,
            max_price,
            tick_num: tick_ratio.0,
            tick_den: tick_ratio.1,
            waker_sleep_ms: None,
            time_and_sales_capacity: default_tape_capacity(),
            max_ticks: default_max_ticks(),
            pin_dispatcher: false,
        }
    }

    /// Enable the waker thread with the given heartbeat interval.
    pub fn with_waker(mut self, sleep_ms: u64) -> Self {
        self.waker_sleep_ms = Some(sleep_ms);
        self
    }

    /// Override the time-and-sales ring capacity.
    pub fn with_tape_capacity(mut self, capacity: usize) -> Self {
        self.time_and_sales_capacity = capacity;
        self
    }
}
