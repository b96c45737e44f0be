//! Matching core - price-time priority execution over the grid.
//!
//! Implements the match loop:
//! 1. CROSS: hit the inside chain in FIFO order until the taker or the
//!    chain is exhausted
//! 2. RESEEK: advance the inside past empty cells, refreshing the cached
//!    size, until liquidity or the taker's limit runs out
//! 3. TRIGGER: after any trade, scan the stop regions toward `last` and
//!    hand triggered stops back for re-injection
//!
//! All mutation happens under the engine's master lock; notifications are
//! appended to the deferred queue and delivered after the lock is
//! released.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, VecDeque};
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::chain::{LimitBundle, StopBundle};
use crate::command::{CallbackMsg, Deferred, ExecCallback, OrderId, OrderInfo, Reinjection, Tick, TradePrint};
use crate::error::BookError;
use crate::extrema::ExtremaCache;
use crate::grid::PriceGrid;

/// The book state guarded by the engine's master lock.
///
/// Usable standalone for synchronous (single-threaded) matching; the
/// caller is then responsible for draining [`take_deferred`](Self::take_deferred)
/// and feeding [`take_reinjections`](Self::take_reinjections) back in.
pub struct Book {
    grid: PriceGrid,
    cache: ExtremaCache,
    /// Tick of the most recent trade; starts at the reference price.
    last: Tick,
    last_size: u64,
    last_at: DateTime<Utc>,
    total_volume: u64,
    tape: VecDeque<TradePrint>,
    tape_capacity: usize,
    deferred: VecDeque<Deferred>,
    reinjections: Vec<Reinjection>,
    need_check_stops: bool,
}

impl Book {
    pub fn new(
        reference: Decimal,
        min: Decimal,
        max: Decimal,
        ratio: (u32, u32),
        max_ticks: usize,
        tape_capacity: usize,
    ) -> Result<Self, BookError> {
        let grid = PriceGrid::new(reference, min, max, ratio, max_ticks)?;
        let last = grid
            .ladder()
            .price_to_tick(reference)
            .ok_or(BookError::Logic("reference price off the grid"))?;
        let past_end = grid.past_end();
        Ok(Self {
            grid,
            cache: ExtremaCache::new(past_end),
            last,
            last_size: 0,
            last_at: Utc::now(),
            total_volume: 0,
            tape: VecDeque::with_capacity(tape_capacity.min(4096)),
            tape_capacity,
            deferred: VecDeque::new(),
            reinjections: Vec::new(),
            need_check_stops: false,
        })
    }

    // ========================================================================
    // Inserts
    // ========================================================================

    /// Place a limit order. Crossing size executes immediately against the
    /// opposite side up to `tick`; any remainder rests in the limit chain.
    pub fn insert_limit(
        &mut self,
        id: OrderId,
        is_buy: bool,
        tick: Tick,
        size: u64,
        exec_cb: Option<ExecCallback>,
    ) -> Result<(), BookError> {
        if size == 0 {
            return Err(BookError::InvalidOrder("size must be positive"));
        }
        if !self.grid.contains(tick) {
            return Err(BookError::InvalidOrder("price off the grid"));
        }
        debug!(id, is_buy, tick, size, "limit order admitted");

        let mut remaining = size;
        if is_buy && tick >= self.cache.ask {
            remaining = self.trade::<true>(Some(tick), size, id, &exec_cb);
        } else if !is_buy && tick <= self.cache.bid {
            remaining = self.trade::<false>(Some(tick), size, id, &exec_cb);
        }

        if remaining > 0 {
            self.grid
                .cell_mut(tick)
                .limits
                .push_back(id, LimitBundle { remaining, exec_cb });
            let total = self.grid.cell(tick).limits.total();
            self.cache.note_limit_insert(is_buy, tick, total);
        }

        self.look_for_triggered_stops();
        Ok(())
    }

    /// Place a market order. Fails with [`BookError::Liquidity`] when the
    /// opposite side empties first; fills that happened stand and their
    /// callbacks precede the error.
    pub fn insert_market(
        &mut self,
        id: OrderId,
        is_buy: bool,
        size: u64,
        exec_cb: Option<ExecCallback>,
    ) -> Result<(), BookError> {
        if size == 0 {
            return Err(BookError::InvalidOrder("size must be positive"));
        }
        debug!(id, is_buy, size, "market order admitted");

        let remaining = if is_buy {
            self.trade::<true>(None, size, id, &exec_cb)
        } else {
            self.trade::<false>(None, size, id, &exec_cb)
        };

        self.look_for_triggered_stops();

        if remaining > 0 {
            return Err(BookError::Liquidity {
                filled: size - remaining,
                requested: size,
            });
        }
        Ok(())
    }

    /// Place a stop (`limit == None`) or stop-limit order. Stops never
    /// execute at insertion; whether the market has already crossed the
    /// stop price is the caller's contract.
    pub fn insert_stop(
        &mut self,
        id: OrderId,
        is_buy: bool,
        stop_tick: Tick,
        limit: Option<Tick>,
        size: u64,
        exec_cb: Option<ExecCallback>,
    ) -> Result<(), BookError> {
        if size == 0 {
            return Err(BookError::InvalidOrder("size must be positive"));
        }
        if !self.grid.contains(stop_tick) {
            return Err(BookError::InvalidOrder("stop price off the grid"));
        }
        if let Some(l) = limit {
            if !self.grid.contains(l) {
                return Err(BookError::InvalidOrder("limit price off the grid"));
            }
        }
        debug!(id, is_buy, stop_tick, ?limit, size, "stop order admitted");

        self.grid.cell_mut(stop_tick).stops.push_back(
            id,
            StopBundle {
                is_buy,
                limit,
                size,
                exec_cb,
            },
        );
        self.cache.note_stop_insert(is_buy, stop_tick);
        Ok(())
    }

    // ========================================================================
    // Pull / lookup
    // ========================================================================

    /// Remove a resting order by ID, scanning the chains inside the cached
    /// extrema. Returns `false` when no such order rests in the book.
    pub fn pull(&mut self, id: OrderId, search_limits_first: bool) -> Result<bool, BookError> {
        let found = if search_limits_first {
            self.pull_limit(id)? || self.pull_stop(id)
        } else {
            self.pull_stop(id) || self.pull_limit(id)?
        };
        if found {
            debug!(id, "order pulled");
        }
        Ok(found)
    }

    fn pull_limit(&mut self, id: OrderId) -> Result<bool, BookError> {
        if self.cache.has_bids() {
            for t in self.cache.low_buy_limit..=self.cache.bid {
                if let Some(bundle) = self.grid.cell_mut(t).limits.remove(id) {
                    self.settle_limit_pull(id, true, t, bundle)?;
                    return Ok(true);
                }
            }
        }
        if self.cache.has_asks() {
            for t in self.cache.ask..=self.cache.high_sell_limit {
                if let Some(bundle) = self.grid.cell_mut(t).limits.remove(id) {
                    self.settle_limit_pull(id, false, t, bundle)?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn settle_limit_pull(
        &mut self,
        id: OrderId,
        is_buy: bool,
        tick: Tick,
        bundle: LimitBundle,
    ) -> Result<(), BookError> {
        self.cache.check_limit_pull(is_buy, tick)?;

        let now_empty = self.grid.cell(tick).limits.is_empty();
        let inside = if is_buy { self.cache.bid } else { self.cache.ask };
        if now_empty {
            if tick == inside {
                if is_buy {
                    self.find_new_best_inside::<false>();
                } else {
                    self.find_new_best_inside::<true>();
                }
            } else {
                self.cache.nudge_limit_after_pull(is_buy, tick);
            }
        } else if tick == inside {
            let total = self.grid.cell(tick).limits.total();
            if is_buy {
                self.cache.bid_size = total;
            } else {
                self.cache.ask_size = total;
            }
        }

        if let Some(cb) = bundle.exec_cb {
            let price = self.grid.ladder().tick_to_price(tick);
            self.deferred.push_back(Deferred {
                msg: CallbackMsg::Cancel,
                cb,
                id,
                price,
                size: bundle.remaining,
            });
        }
        Ok(())
    }

    fn pull_stop(&mut self, id: OrderId) -> bool {
        let lo = self.cache.low_buy_stop.min(self.cache.low_sell_stop);
        let hi = self.cache.high_buy_stop.max(self.cache.high_sell_stop);
        if lo > hi {
            return false;
        }
        for t in lo..=hi {
            if let Some(bundle) = self.grid.cell_mut(t).stops.remove(id) {
                if self.grid.cell(t).stops.is_empty() {
                    self.cache.nudge_stop_after_pull(bundle.is_buy, t);
                }
                if let Some(cb) = bundle.exec_cb {
                    let price = self.grid.ladder().tick_to_price(t);
                    self.deferred.push_back(Deferred {
                        msg: CallbackMsg::Cancel,
                        cb,
                        id,
                        price,
                        size: bundle.size,
                    });
                }
                return true;
            }
        }
        false
    }

    /// Describe a resting order without touching it.
    pub fn order_info(&self, id: OrderId, search_limits_first: bool) -> OrderInfo {
        if search_limits_first {
            match self.limit_info(id) {
                OrderInfo::NotFound => self.stop_info(id),
                found => found,
            }
        } else {
            match self.stop_info(id) {
                OrderInfo::NotFound => self.limit_info(id),
                found => found,
            }
        }
    }

    fn limit_info(&self, id: OrderId) -> OrderInfo {
        let ladder = self.grid.ladder();
        if self.cache.has_bids() {
            for t in self.cache.low_buy_limit..=self.cache.bid {
                if let Some(bundle) = self.grid.cell(t).limits.get(id) {
                    return OrderInfo::Limit {
                        is_buy: true,
                        price: ladder.tick_to_price(t),
                        size: bundle.remaining,
                    };
                }
            }
        }
        if self.cache.has_asks() {
            for t in self.cache.ask..=self.cache.high_sell_limit {
                if let Some(bundle) = self.grid.cell(t).limits.get(id) {
                    return OrderInfo::Limit {
                        is_buy: false,
                        price: ladder.tick_to_price(t),
                        size: bundle.remaining,
                    };
                }
            }
        }
        OrderInfo::NotFound
    }

    fn stop_info(&self, id: OrderId) -> OrderInfo {
        let lo = self.cache.low_buy_stop.min(self.cache.low_sell_stop);
        let hi = self.cache.high_buy_stop.max(self.cache.high_sell_stop);
        if lo > hi {
            return OrderInfo::NotFound;
        }
        let ladder = self.grid.ladder();
        for t in lo..=hi {
            if let Some(bundle) = self.grid.cell(t).stops.get(id) {
                return match bundle.limit {
                    Some(l) => OrderInfo::StopLimit {
                        is_buy: bundle.is_buy,
                        stop_price: ladder.tick_to_price(t),
                        limit_price: ladder.tick_to_price(l),
                        size: bundle.size,
                    },
                    None => OrderInfo::Stop {
                        is_buy: bundle.is_buy,
                        stop_price: ladder.tick_to_price(t),
                        size: bundle.size,
                    },
                };
            }
        }
        OrderInfo::NotFound
    }

    // ========================================================================
    // Match loop
    // ========================================================================

    /// Execute up to `size` against the opposite side, bounded by `limit`
    /// (`None` for a market order). Returns the unfilled remainder.
    fn trade<const BUY: bool>(
        &mut self,
        limit: Option<Tick>,
        mut size: u64,
        taker_id: OrderId,
        taker_cb: &Option<ExecCallback>,
    ) -> u64 {
        while size > 0 {
            let inside = if BUY { self.cache.ask } else { self.cache.bid };
            if !self.is_executable::<BUY>(inside, limit) {
                break;
            }
            size = self.hit_chain::<BUY>(inside, size, taker_id, taker_cb);
            if !self.find_new_best_inside::<BUY>() {
                break;
            }
        }
        size
    }

    /// Whether the inside chain can trade against a taker bounded by
    /// `limit`.
    #[inline]
    fn is_executable<const BUY: bool>(&self, inside: Tick, limit: Option<Tick>) -> bool {
        if BUY {
            inside < self.grid.past_end()
                && !self.grid.cell(inside).limits.is_empty()
                && limit.map_or(true, |l| inside <= l)
        } else {
            inside >= self.grid.min_tick()
                && !self.grid.cell(inside).limits.is_empty()
                && limit.map_or(true, |l| inside >= l)
        }
    }

    /// Trade against the chain at `tick` in FIFO order. Returns the
    /// taker's remainder.
    fn hit_chain<const BUY: bool>(
        &mut self,
        tick: Tick,
        size: u64,
        taker_id: OrderId,
        taker_cb: &Option<ExecCallback>,
    ) -> u64 {
        let fills = self.grid.cell_mut(tick).limits.consume(size);
        let mut remaining = size;
        for (maker_id, maker_cb, traded) in fills {
            remaining -= traded;
            if BUY {
                self.trade_occurred(tick, traded, taker_id, maker_id, taker_cb.clone(), maker_cb);
            } else {
                self.trade_occurred(tick, traded, maker_id, taker_id, maker_cb, taker_cb.clone());
            }
        }
        remaining
    }

    /// Record one sub-trade: print, last, volume, two fill notifications
    /// (buyer first), and the stop-check flag.
    fn trade_occurred(
        &mut self,
        tick: Tick,
        size: u64,
        buy_id: OrderId,
        sell_id: OrderId,
        buy_cb: Option<ExecCallback>,
        sell_cb: Option<ExecCallback>,
    ) {
        let price = self.grid.ladder().tick_to_price(tick);
        let at = Utc::now();

        if self.tape.len() == self.tape_capacity {
            self.tape.pop_front();
        }
        self.tape.push_back(TradePrint { at, price, size });

        self.last = tick;
        self.last_size = size;
        self.last_at = at;
        self.total_volume += size;
        self.need_check_stops = true;

        debug!(tick, size, buy = buy_id, sell = sell_id, "trade");

        if let Some(cb) = buy_cb {
            self.deferred.push_back(Deferred {
                msg: CallbackMsg::Fill,
                cb,
                id: buy_id,
                price,
                size,
            });
        }
        if let Some(cb) = sell_cb {
            self.deferred.push_back(Deferred {
                msg: CallbackMsg::Fill,
                cb,
                id: sell_id,
                price,
                size,
            });
        }
    }

    /// Advance the inside past empty chains, refreshing its cached size.
    /// Returns `false` and collapses the side when no liquidity remains.
    fn find_new_best_inside<const BUY: bool>(&mut self) -> bool {
        if BUY {
            let mut t = self.cache.ask;
            while t <= self.grid.max_tick() && self.grid.cell(t).limits.is_empty() {
                t += 1;
            }
            if t > self.grid.max_tick() {
                self.cache.collapse_asks();
                return false;
            }
            self.cache.ask = t;
            self.cache.ask_size = self.grid.cell(t).limits.total();
            if t > self.cache.high_sell_limit {
                self.cache.high_sell_limit = t;
            }
        } else {
            let mut t = self.cache.bid;
            while t >= self.grid.min_tick() && self.grid.cell(t).limits.is_empty() {
                t -= 1;
            }
            if t < self.grid.min_tick() {
                self.cache.collapse_bids();
                return false;
            }
            self.cache.bid = t;
            self.cache.bid_size = self.grid.cell(t).limits.total();
            if t < self.cache.low_buy_limit {
                self.cache.low_buy_limit = t;
            }
        }
        true
    }

    // ========================================================================
    // Stop triggers
    // ========================================================================

    /// Scan the stop regions toward `last` and queue triggered stops for
    /// re-injection. Runs at the end of every trade-inducing operation,
    /// including failing ones; it cannot itself fail.
    fn look_for_triggered_stops(&mut self) {
        while std::mem::take(&mut self.need_check_stops) {
            let last = self.last;

            // Buy stops trigger on upward moves: low tick first.
            let mut t = self.cache.low_buy_stop;
            while t <= last {
                if !self.grid.cell(t).stops.is_empty() {
                    self.trigger_stop_cell(t, true);
                }
                t += 1;
            }

            // Sell stops trigger on downward moves: high tick first.
            let mut t = self.cache.high_sell_stop;
            while t >= last && t >= self.grid.min_tick() {
                if !self.grid.cell(t).stops.is_empty() {
                    self.trigger_stop_cell(t, false);
                }
                t -= 1;
            }
        }
    }

    /// Copy the stop chain at `tick` out, clear the cell, advance the
    /// scanned side's bounds, and queue every bundle for re-injection.
    /// Clearing before queuing keeps a cascade from re-entering this cell.
    fn trigger_stop_cell(&mut self, tick: Tick, buy_scan: bool) {
        let entries = self.grid.cell_mut(tick).stops.drain_all();
        if buy_scan {
            self.cache.consume_buy_stops_through(tick);
        } else {
            self.cache.consume_sell_stops_through(tick);
        }

        for entry in entries {
            let bundle = entry.bundle;
            debug!(id = entry.id, tick, is_buy = bundle.is_buy, "stop triggered");
            if let Some(l) = bundle.limit {
                if let Some(cb) = &bundle.exec_cb {
                    let price = self.grid.ladder().tick_to_price(l);
                    self.deferred.push_back(Deferred {
                        msg: CallbackMsg::StopToLimit,
                        cb: cb.clone(),
                        id: entry.id,
                        price,
                        size: bundle.size,
                    });
                }
            }
            self.reinjections.push(Reinjection {
                id: entry.id,
                is_buy: bundle.is_buy,
                limit: bundle.limit,
                size: bundle.size,
                exec_cb: bundle.exec_cb,
            });
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Aggregate chain sizes from the inside outward, at most `max_depth`
    /// populated ticks.
    pub fn depth(&self, is_buy: bool, max_depth: usize) -> BTreeMap<Tick, u64> {
        let mut out = BTreeMap::new();
        if is_buy {
            let mut t = self.cache.bid;
            while t >= self.cache.low_buy_limit && t >= 1 && out.len() < max_depth {
                let total = self.grid.cell(t).limits.total();
                if total > 0 {
                    out.insert(t, total);
                }
                t -= 1;
            }
        } else {
            let mut t = self.cache.ask;
            while t <= self.cache.high_sell_limit && out.len() < max_depth {
                let total = self.grid.cell(t).limits.total();
                if total > 0 {
                    out.insert(t, total);
                }
                t += 1;
            }
        }
        out
    }

    #[inline]
    pub fn best_bid(&self) -> Option<(Tick, u64)> {
        self.cache.has_bids().then_some((self.cache.bid, self.cache.bid_size))
    }

    #[inline]
    pub fn best_ask(&self) -> Option<(Tick, u64)> {
        self.cache.has_asks().then_some((self.cache.ask, self.cache.ask_size))
    }

    /// Most recent trade `(tick, size, timestamp)`. Before the first trade
    /// the tick is the reference price and the size is zero.
    #[inline]
    pub fn last(&self) -> (Tick, u64, DateTime<Utc>) {
        (self.last, self.last_size, self.last_at)
    }

    #[inline]
    pub fn total_volume(&self) -> u64 {
        self.total_volume
    }

    #[inline]
    pub fn time_and_sales(&self) -> &VecDeque<TradePrint> {
        &self.tape
    }

    #[inline]
    pub fn ladder(&self) -> &crate::ladder::TickLadder {
        self.grid.ladder()
    }

    #[inline]
    pub fn extrema(&self) -> &ExtremaCache {
        &self.cache
    }

    /// Move the queued notifications out. Called after the master lock is
    /// released; the queue refills on the next operation.
    pub fn take_deferred(&mut self) -> VecDeque<Deferred> {
        std::mem::take(&mut self.deferred)
    }

    /// Move the triggered-stop records out for the dispatcher to re-queue.
    pub fn take_reinjections(&mut self) -> Vec<Reinjection> {
        std::mem::take(&mut self.reinjections)
    }

    /// Queue a heartbeat notification carrying the last trade price.
    pub fn enqueue_wake(&mut self, cb: ExecCallback) {
        let price = self.grid.ladder().tick_to_price(self.last);
        self.deferred.push_back(Deferred {
            msg: CallbackMsg::Wake,
            cb,
            id: 0,
            price,
            size: 0,
        });
    }

    /// Hash of the resting state, for determinism checks.
    pub fn state_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.cache.bid.hash(&mut hasher);
        self.cache.ask.hash(&mut hasher);
        self.cache.bid_size.hash(&mut hasher);
        self.cache.ask_size.hash(&mut hasher);
        self.last.hash(&mut hasher);
        self.total_volume.hash(&mut hasher);
        for t in self.grid.min_tick()..=self.grid.max_tick() {
            let cell = self.grid.cell(t);
            if !cell.limits.is_empty() {
                t.hash(&mut hasher);
                for entry in cell.limits.iter() {
                    entry.id.hash(&mut hasher);
                    entry.bundle.remaining.hash(&mut hasher);
                }
            }
            if !cell.stops.is_empty() {
                t.hash(&mut hasher);
                for entry in cell.stops.iter() {
                    entry.id.hash(&mut hasher);
                    entry.bundle.is_buy.hash(&mut hasher);
                    entry.bundle.limit.hash(&mut hasher);
                    entry.bundle.size.hash(&mut hasher);
                }
            }
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Event = (CallbackMsg, OrderId, Decimal, u64);

    fn recorder() -> (ExecCallback, Arc<Mutex<Vec<Event>>>) {
        let log: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let cb: ExecCallback = Arc::new(move |msg, id, price, size| {
            sink.lock().push((msg, id, price, size));
        });
        (cb, log)
    }

    fn px(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    /// Grid 0.01..100.00 around 50.00 with one-cent ticks: tick 5010 is
    /// 50.10.
    fn book() -> Book {
        Book::new(px("50.00"), px("0.01"), px("100.00"), (1, 100), 1_000_000, 1000).unwrap()
    }

    fn drain(book: &mut Book) -> Vec<Event> {
        book.take_deferred()
            .into_iter()
            .map(|d| {
                (d.cb)(d.msg, d.id, d.price, d.size);
                (d.msg, d.id, d.price, d.size)
            })
            .collect()
    }

    /// Play triggered stops back into the book the way the dispatcher
    /// would, until the cascade settles.
    fn settle_reinjections(book: &mut Book) {
        loop {
            let pending = book.take_reinjections();
            if pending.is_empty() {
                break;
            }
            for r in pending {
                let result = match r.limit {
                    Some(l) => book.insert_limit(r.id, r.is_buy, l, r.size, r.exec_cb),
                    None => book.insert_market(r.id, r.is_buy, r.size, r.exec_cb),
                };
                let _ = result;
            }
        }
    }

    #[test]
    fn test_cross_at_insert() {
        let mut book = book();
        let (sell_cb, _) = recorder();
        let (buy_cb, buy_log) = recorder();

        book.insert_limit(1, false, 5010, 10, Some(sell_cb)).unwrap();
        book.insert_limit(2, true, 5010, 7, Some(buy_cb)).unwrap();

        let events = drain(&mut book);
        let fills: Vec<_> = events
            .iter()
            .filter(|e| e.0 == CallbackMsg::Fill)
            .collect();
        assert_eq!(fills.len(), 2);
        for fill in &fills {
            assert_eq!(fill.2, px("50.10"));
            assert_eq!(fill.3, 7);
        }
        assert_eq!(buy_log.lock().len(), 1);

        assert_eq!(book.best_ask(), Some((5010, 3)));
        assert_eq!(book.best_bid(), None);
        assert_eq!(book.total_volume(), 7);
    }

    #[test]
    fn test_market_exhaustion_reports_liquidity() {
        let mut book = book();
        let (cb, log) = recorder();

        let err = book.insert_market(1, true, 5, Some(cb)).unwrap_err();
        assert_eq!(
            err,
            BookError::Liquidity {
                filled: 0,
                requested: 5
            }
        );
        drain(&mut book);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_partial_market_fill_precedes_liquidity_error() {
        let mut book = book();
        let (cb, log) = recorder();

        book.insert_limit(1, false, 5005, 3, None).unwrap();
        let err = book.insert_market(2, true, 5, Some(cb)).unwrap_err();
        assert_eq!(
            err,
            BookError::Liquidity {
                filled: 3,
                requested: 5
            }
        );

        drain(&mut book);
        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], (CallbackMsg::Fill, 2, px("50.05"), 3));
    }

    #[test]
    fn test_stop_limit_triggers_after_crossing() {
        let mut book = book();
        let (stop_cb, stop_log) = recorder();

        // Buy stop-limit: stop 50.20, limit 50.30.
        book.insert_stop(10, true, 5020, Some(5030), 4, Some(stop_cb))
            .unwrap();

        // Trade at 50.15: below the stop, no trigger.
        book.insert_limit(1, false, 5015, 4, None).unwrap();
        book.insert_market(2, true, 4, None).unwrap();
        assert!(book.take_reinjections().is_empty());
        assert!(matches!(
            book.order_info(10, false),
            OrderInfo::StopLimit { .. }
        ));

        // Trade at 50.25: at or above the stop, triggers.
        book.insert_limit(3, false, 5025, 4, None).unwrap();
        book.insert_market(4, true, 4, None).unwrap();
        settle_reinjections(&mut book);

        drain(&mut book);
        let promotions: Vec<_> = stop_log
            .lock()
            .iter()
            .filter(|e| e.0 == CallbackMsg::StopToLimit)
            .cloned()
            .collect();
        assert_eq!(promotions, vec![(CallbackMsg::StopToLimit, 10, px("50.30"), 4)]);

        // No asks at or below 50.30 remain: the limit rests under its
        // original ID.
        assert_eq!(book.best_bid(), Some((5030, 4)));
        assert_eq!(
            book.order_info(10, true),
            OrderInfo::Limit {
                is_buy: true,
                price: px("50.30"),
                size: 4
            }
        );
    }

    #[test]
    fn test_fifo_within_chain() {
        let mut book = book();

        book.insert_limit(1, false, 5050, 2, None).unwrap(); // A
        book.insert_limit(2, false, 5050, 3, None).unwrap(); // B
        book.insert_limit(3, false, 5050, 5, None).unwrap(); // C

        let (cb, log) = recorder();
        book.insert_market(4, true, 4, Some(cb)).unwrap();

        drain(&mut book);
        let log = log.lock();
        // Taker saw two fills: 2 against A, 2 against B.
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].3, 2);
        assert_eq!(log[1].3, 2);

        // B is at the front with 1 left; C untouched behind it.
        assert_eq!(
            book.order_info(2, true),
            OrderInfo::Limit {
                is_buy: false,
                price: px("50.50"),
                size: 1
            }
        );
        assert_eq!(book.order_info(1, true), OrderInfo::NotFound);
        assert_eq!(book.best_ask(), Some((5050, 6)));
    }

    #[test]
    fn test_pull_collapses_bid() {
        let mut book = book();
        let (cb, log) = recorder();

        book.insert_limit(7, true, 4990, 10, Some(cb)).unwrap();
        assert_eq!(book.best_bid(), Some((4990, 10)));

        assert!(book.pull(7, true).unwrap());
        assert_eq!(book.best_bid(), None);
        assert_eq!(book.extrema().bid_size, 0);

        drain(&mut book);
        assert_eq!(log.lock()[0].0, CallbackMsg::Cancel);

        let err = book.insert_market(8, false, 1, None).unwrap_err();
        assert!(matches!(err, BookError::Liquidity { .. }));
    }

    #[test]
    fn test_pull_is_idempotent() {
        let mut book = book();
        book.insert_limit(1, true, 4990, 10, None).unwrap();
        assert!(book.pull(1, true).unwrap());
        assert!(!book.pull(1, true).unwrap());
        assert!(!book.pull(1, false).unwrap());
    }

    #[test]
    fn test_pull_refreshes_inside_size() {
        let mut book = book();
        book.insert_limit(1, true, 4990, 10, None).unwrap();
        book.insert_limit(2, true, 4990, 4, None).unwrap();

        assert!(book.pull(1, true).unwrap());
        assert_eq!(book.best_bid(), Some((4990, 4)));
    }

    #[test]
    fn test_pull_reseeks_bid_below() {
        let mut book = book();
        book.insert_limit(1, true, 4980, 5, None).unwrap();
        book.insert_limit(2, true, 4990, 7, None).unwrap();

        assert!(book.pull(2, true).unwrap());
        assert_eq!(book.best_bid(), Some((4980, 5)));
        assert_eq!(book.extrema().low_buy_limit, 4980);
    }

    #[test]
    fn test_stop_cascade_ascending() {
        let mut book = book();
        let (cb, log) = recorder();

        // Stop-market buys at 50.10, 50.20, 50.30.
        book.insert_stop(1, true, 5010, None, 1, Some(cb.clone())).unwrap();
        book.insert_stop(2, true, 5020, None, 1, Some(cb.clone())).unwrap();
        book.insert_stop(3, true, 5030, None, 1, Some(cb)).unwrap();

        // Liquidity for the triggered markets to hit.
        book.insert_limit(4, false, 5030, 1, None).unwrap();
        book.insert_limit(5, false, 5040, 3, None).unwrap();

        // One large market buy drives last to 50.30.
        book.insert_market(6, true, 1, None).unwrap();
        assert_eq!(book.last().0, 5030);

        settle_reinjections(&mut book);
        drain(&mut book);

        let fills: Vec<_> = log
            .lock()
            .iter()
            .filter(|e| e.0 == CallbackMsg::Fill)
            .map(|e| e.1)
            .collect();
        assert_eq!(fills, vec![1, 2, 3]);

        assert_eq!(book.extrema().low_buy_stop, book.extrema().past_end());
        assert_eq!(book.extrema().high_buy_stop, 0);
    }

    #[test]
    fn test_sell_stops_trigger_downward() {
        let mut book = book();
        let (cb, log) = recorder();

        book.insert_stop(1, false, 4990, None, 2, Some(cb.clone())).unwrap();
        book.insert_stop(2, false, 4980, None, 2, Some(cb)).unwrap();

        // Bids to absorb the triggered sells.
        book.insert_limit(3, true, 4980, 2, None).unwrap();
        book.insert_limit(4, true, 4970, 4, None).unwrap();

        // Sell into the 49.80 bid: last moves to 49.80, both stops fire,
        // high tick first.
        book.insert_market(5, false, 2, None).unwrap();
        assert_eq!(book.last().0, 4980);

        settle_reinjections(&mut book);
        drain(&mut book);

        let fills: Vec<_> = log
            .lock()
            .iter()
            .filter(|e| e.0 == CallbackMsg::Fill)
            .map(|e| e.1)
            .collect();
        assert_eq!(fills, vec![1, 2]);
    }

    #[test]
    fn test_stop_reinjection_preserves_id() {
        let mut book = book();
        book.insert_stop(42, true, 5010, Some(5020), 3, None).unwrap();

        book.insert_limit(1, false, 5010, 1, None).unwrap();
        book.insert_market(2, true, 1, None).unwrap();

        let pending = book.take_reinjections();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, 42);
        assert_eq!(pending[0].limit, Some(5020));
    }

    #[test]
    fn test_depth_inside_outward() {
        let mut book = book();
        book.insert_limit(1, true, 4990, 10, None).unwrap();
        book.insert_limit(2, true, 4985, 5, None).unwrap();
        book.insert_limit(3, true, 4980, 2, None).unwrap();
        book.insert_limit(4, false, 5010, 7, None).unwrap();

        let bids = book.depth(true, 10);
        assert_eq!(
            bids.into_iter().collect::<Vec<_>>(),
            vec![(4980, 2), (4985, 5), (4990, 10)]
        );

        let bids = book.depth(true, 2);
        assert_eq!(
            bids.into_iter().collect::<Vec<_>>(),
            vec![(4985, 5), (4990, 10)]
        );

        let asks = book.depth(false, 10);
        assert_eq!(asks.into_iter().collect::<Vec<_>>(), vec![(5010, 7)]);
    }

    #[test]
    fn test_invalid_orders_rejected() {
        let mut book = book();
        assert!(matches!(
            book.insert_limit(1, true, 5000, 0, None),
            Err(BookError::InvalidOrder(_))
        ));
        assert!(matches!(
            book.insert_limit(1, true, 0, 5, None),
            Err(BookError::InvalidOrder(_))
        ));
        assert!(matches!(
            book.insert_limit(1, true, 10_001, 5, None),
            Err(BookError::InvalidOrder(_))
        ));
        assert!(matches!(
            book.insert_stop(1, true, 5000, Some(10_001), 5, None),
            Err(BookError::InvalidOrder(_))
        ));
        assert!(matches!(
            book.insert_market(1, true, 0, None),
            Err(BookError::InvalidOrder(_))
        ));
    }

    #[test]
    fn test_limit_sweeps_multiple_levels() {
        let mut book = book();
        book.insert_limit(1, false, 5000, 5, None).unwrap();
        book.insert_limit(2, false, 5005, 5, None).unwrap();
        book.insert_limit(3, false, 5010, 5, None).unwrap();

        let (cb, log) = recorder();
        book.insert_limit(4, true, 5005, 12, Some(cb)).unwrap();

        drain(&mut book);
        let log = log.lock();
        let fills: Vec<_> = log.iter().map(|e| (e.2, e.3)).collect();
        assert_eq!(fills, vec![(px("50.00"), 5), (px("50.05"), 5)]);

        // Remainder rests at the taker's limit.
        assert_eq!(book.best_bid(), Some((5005, 2)));
        assert_eq!(book.best_ask(), Some((5010, 5)));
    }

    #[test]
    fn test_volume_matches_tape() {
        let mut book = book();
        book.insert_limit(1, false, 5000, 5, None).unwrap();
        book.insert_limit(2, false, 5005, 7, None).unwrap();
        book.insert_market(3, true, 9, None).unwrap();

        let tape_total: u64 = book.time_and_sales().iter().map(|p| p.size).sum();
        assert_eq!(book.total_volume(), tape_total);
        assert_eq!(tape_total, 9);
    }

    #[test]
    fn test_tape_ring_drops_oldest() {
        let mut book = Book::new(px("50.00"), px("0.01"), px("100.00"), (1, 100), 1_000_000, 2)
            .unwrap();
        for i in 0..3u64 {
            book.insert_limit(i * 2 + 1, false, 5000, 1, None).unwrap();
            book.insert_market(i * 2 + 2, true, 1, None).unwrap();
        }
        assert_eq!(book.time_and_sales().len(), 2);
        assert_eq!(book.total_volume(), 3);
    }

    #[test]
    fn test_state_hash_tracks_content() {
        let mut a = book();
        let mut b = book();
        assert_eq!(a.state_hash(), b.state_hash());

        a.insert_limit(1, true, 4990, 10, None).unwrap();
        assert_ne!(a.state_hash(), b.state_hash());

        b.insert_limit(1, true, 4990, 10, None).unwrap();
        assert_eq!(a.state_hash(), b.state_hash());
    }
}
