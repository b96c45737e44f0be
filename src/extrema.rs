//! Extrema Cache - cached bounds of the populated grid regions.
//!
//! Six region bounds (limit and stop, per side) plus the inside prices and
//! their chain totals. The cache is a hint over the grid, which stays the
//! ground truth: updates on insert are eager, updates on pull are lazy
//! one-tick nudges, and the match loop re-synchronizes the inside as it
//! walks. Bounds may be wider than the populated set, never narrower.
//!
//! Sentinels: `0` below the grid, `past_end` above it. An empty side parks
//! its "low" bound at `past_end` and its "high" bound at `0`, so `min`/`max`
//! updates need no empty-case branches.

use crate::command::Tick;
use crate::error::BookError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtremaCache {
    /// Best buy-limit tick; `0` when there are no bids.
    pub bid: Tick,
    /// Best sell-limit tick; `past_end` when there are no asks.
    pub ask: Tick,
    /// Aggregate chain size at `bid`.
    pub bid_size: u64,
    /// Aggregate chain size at `ask`.
    pub ask_size: u64,
    /// Lowest tick holding a buy-limit chain; `past_end` when none.
    pub low_buy_limit: Tick,
    /// Highest tick holding a sell-limit chain; `0` when none.
    pub high_sell_limit: Tick,
    pub low_buy_stop: Tick,
    pub high_buy_stop: Tick,
    pub low_sell_stop: Tick,
    pub high_sell_stop: Tick,
    past_end: Tick,
}

impl ExtremaCache {
    pub fn new(past_end: Tick) -> Self {
        Self {
            bid: 0,
            ask: past_end,
            bid_size: 0,
            ask_size: 0,
            low_buy_limit: past_end,
            high_sell_limit: 0,
            low_buy_stop: past_end,
            high_buy_stop: 0,
            low_sell_stop: past_end,
            high_sell_stop: 0,
            past_end,
        }
    }

    #[inline]
    pub fn past_end(&self) -> Tick {
        self.past_end
    }

    #[inline]
    pub fn has_bids(&self) -> bool {
        self.bid != 0
    }

    #[inline]
    pub fn has_asks(&self) -> bool {
        self.ask != self.past_end
    }

    // ========================================================================
    // Inserts (eager)
    // ========================================================================

    /// Account for a limit order resting at `tick`; `chain_total` is the
    /// chain's aggregate size after the insert.
    pub fn note_limit_insert(&mut self, is_buy: bool, tick: Tick, chain_total: u64) {
        if is_buy {
            if tick >= self.bid {
                self.bid = tick;
                self.bid_size = chain_total;
            }
            if tick < self.low_buy_limit {
                self.low_buy_limit = tick;
            }
        } else {
            if tick <= self.ask {
                self.ask = tick;
                self.ask_size = chain_total;
            }
            if tick > self.high_sell_limit {
                self.high_sell_limit = tick;
            }
        }
    }

    /// Account for a stop order resting at `tick`.
    pub fn note_stop_insert(&mut self, is_buy: bool, tick: Tick) {
        if is_buy {
            self.low_buy_stop = self.low_buy_stop.min(tick);
            self.high_buy_stop = self.high_buy_stop.max(tick);
        } else {
            self.low_sell_stop = self.low_sell_stop.min(tick);
            self.high_sell_stop = self.high_sell_stop.max(tick);
        }
    }

    // ========================================================================
    // Pulls (lazy)
    // ========================================================================

    /// Verify a limit pull at `tick` lies inside the cached region.
    pub fn check_limit_pull(&self, is_buy: bool, tick: Tick) -> Result<(), BookError> {
        let ok = if is_buy {
            tick >= self.low_buy_limit && tick <= self.bid
        } else {
            tick >= self.ask && tick <= self.high_sell_limit
        };
        if ok {
            Ok(())
        } else {
            Err(BookError::CacheValue("limit pull outside cached bounds"))
        }
    }

    /// A pull emptied the non-inside chain at `tick`: nudge the outer bound
    /// one tick inward. The next inside re-seek resynchronizes fully.
    pub fn nudge_limit_after_pull(&mut self, is_buy: bool, tick: Tick) {
        if is_buy {
            if tick == self.low_buy_limit {
                self.low_buy_limit += 1;
            }
        } else if tick == self.high_sell_limit {
            self.high_sell_limit -= 1;
        }
    }

    /// A pull emptied a stop chain at `tick`: nudge that side's matching
    /// bound, collapsing the range when it inverts.
    pub fn nudge_stop_after_pull(&mut self, is_buy: bool, tick: Tick) {
        if is_buy {
            if tick == self.low_buy_stop {
                self.low_buy_stop += 1;
            }
            if tick == self.high_buy_stop {
                self.high_buy_stop = self.high_buy_stop.saturating_sub(1);
            }
            if self.low_buy_stop > self.high_buy_stop {
                self.collapse_buy_stops();
            }
        } else {
            if tick == self.low_sell_stop {
                self.low_sell_stop += 1;
            }
            if tick == self.high_sell_stop {
                self.high_sell_stop = self.high_sell_stop.saturating_sub(1);
            }
            if self.low_sell_stop > self.high_sell_stop {
                self.collapse_sell_stops();
            }
        }
    }

    // ========================================================================
    // Side collapse / trigger advance
    // ========================================================================

    /// No buy-limit liquidity remains.
    pub fn collapse_bids(&mut self) {
        self.bid = 0;
        self.bid_size = 0;
        self.low_buy_limit = self.past_end;
    }

    /// No sell-limit liquidity remains.
    pub fn collapse_asks(&mut self) {
        self.ask = self.past_end;
        self.ask_size = 0;
        self.high_sell_limit = 0;
    }

    pub fn collapse_buy_stops(&mut self) {
        self.low_buy_stop = self.past_end;
        self.high_buy_stop = 0;
    }

    pub fn collapse_sell_stops(&mut self) {
        self.low_sell_stop = self.past_end;
        self.high_sell_stop = 0;
    }

    /// Buy-stop cell at `tick` was triggered and cleared; the scan resumes
    /// above it.
    pub fn consume_buy_stops_through(&mut self, tick: Tick) {
        self.low_buy_stop = tick + 1;
        if self.low_buy_stop > self.high_buy_stop {
            self.collapse_buy_stops();
        }
    }

    /// Sell-stop cell at `tick` was triggered and cleared; the scan resumes
    /// below it.
    pub fn consume_sell_stops_through(&mut self, tick: Tick) {
        self.high_sell_stop = tick.saturating_sub(1);
        if self.low_sell_stop > self.high_sell_stop {
            self.collapse_sell_stops();
        }
    }
}
