//! Engine - the submission pipeline around the matching core.
//!
//! One dispatcher thread is the sole mutator of the book. Producers append
//! tickets to a FIFO queue and block on a one-shot result channel; the
//! dispatcher executes under the master lock, re-queues triggered stops,
//! and fulfills the promise. Deferred callbacks drain on the caller's
//! thread after its submission settles (or on the waker thread), never
//! inside the critical section.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Sender};
use parking_lot::{Condvar, Mutex};
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::command::{AdminCallback, ExecCallback, OrderId, OrderInfo, Tick, TradePrint};
use crate::config::EngineConfig;
use crate::error::BookError;
use crate::ladder::TickLadder;
use crate::matching::Book;

/// What a ticket asks the dispatcher to do.
enum OrderSpec {
    Limit {
        is_buy: bool,
        tick: Tick,
        size: u64,
    },
    Market {
        is_buy: bool,
        size: u64,
    },
    Stop {
        is_buy: bool,
        stop_tick: Tick,
        limit_tick: Option<Tick>,
        size: u64,
    },
    Pull {
        target: OrderId,
        search_limits_first: bool,
    },
}

/// One queued submission. `explicit_id` is set only for stop re-injection;
/// `done` is absent for non-blocking tickets.
enum Ticket {
    Order {
        spec: OrderSpec,
        explicit_id: Option<OrderId>,
        exec_cb: Option<ExecCallback>,
        admin_cb: Option<AdminCallback>,
        done: Option<Sender<Result<u64, BookError>>>,
    },
    Shutdown,
}

#[derive(Default)]
struct SubmitQueue {
    tickets: VecDeque<Ticket>,
    /// Tickets queued or executing. Blocking submitters wait for zero so
    /// their drain covers any cascade their order set off.
    outstanding: usize,
}

struct WakeRegistry {
    next_token: u64,
    subs: FxHashMap<u64, ExecCallback>,
}

impl Default for WakeRegistry {
    fn default() -> Self {
        Self {
            next_token: 1,
            subs: FxHashMap::default(),
        }
    }
}

struct Shared {
    /// Master lock: grid, extrema, tape, and the deferred queue's append
    /// side all live behind it.
    book: Mutex<Book>,
    queue: Mutex<SubmitQueue>,
    queue_cv: Condvar,
    idle_cv: Condvar,
    /// Gates callback drains; concurrent drainers back off and trust the
    /// holder to re-check until the queue is empty.
    draining: AtomicBool,
    running: AtomicBool,
    next_id: AtomicU64,
    wake_subscribers: Mutex<WakeRegistry>,
    waker_mu: Mutex<()>,
    waker_cv: Condvar,
}

/// Thread-safe front end of the order book.
///
/// All insert and pull methods are blocking: they return once the
/// dispatcher has processed the order (and any stop cascade it triggered)
/// and every pending notification has been delivered on this thread.
pub struct Engine {
    shared: Arc<Shared>,
    ladder: TickLadder,
    dispatcher: Option<JoinHandle<()>>,
    waker: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, BookError> {
        let book = Book::new(
            config.reference_price,
            config.min_price,
            config.max_price,
            (config.tick_num, config.tick_den),
            config.max_ticks,
            config.time_and_sales_capacity,
        )?;
        let ladder = book.ladder().clone();

        let shared = Arc::new(Shared {
            book: Mutex::new(book),
            queue: Mutex::new(SubmitQueue::default()),
            queue_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            draining: AtomicBool::new(false),
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            wake_subscribers: Mutex::new(WakeRegistry::default()),
            waker_mu: Mutex::new(()),
            waker_cv: Condvar::new(),
        });

        let dispatcher = {
            let shared = shared.clone();
            let pin = config.pin_dispatcher;
            thread::spawn(move || dispatcher_loop(shared, pin))
        };
        let waker = config.waker_sleep_ms.map(|ms| {
            let shared = shared.clone();
            thread::spawn(move || waker_loop(shared, Duration::from_millis(ms)))
        });

        info!(ticks = ladder.count(), "engine started");
        Ok(Self {
            shared,
            ladder,
            dispatcher: Some(dispatcher),
            waker,
        })
    }

    // ========================================================================
    // Order entry
    // ========================================================================

    pub fn insert_limit(
        &self,
        is_buy: bool,
        price: Decimal,
        size: u64,
        exec_cb: Option<ExecCallback>,
        admin_cb: Option<AdminCallback>,
    ) -> Result<OrderId, BookError> {
        let tick = self.tick_for(price)?;
        Self::check_size(size)?;
        self.submit_blocking(OrderSpec::Limit { is_buy, tick, size }, exec_cb, admin_cb)
    }

    pub fn insert_market(
        &self,
        is_buy: bool,
        size: u64,
        exec_cb: Option<ExecCallback>,
        admin_cb: Option<AdminCallback>,
    ) -> Result<OrderId, BookError> {
        Self::check_size(size)?;
        self.submit_blocking(OrderSpec::Market { is_buy, size }, exec_cb, admin_cb)
    }

    pub fn insert_stop(
        &self,
        is_buy: bool,
        stop_price: Decimal,
        size: u64,
        exec_cb: Option<ExecCallback>,
        admin_cb: Option<AdminCallback>,
    ) -> Result<OrderId, BookError> {
        let stop_tick = self.tick_for(stop_price)?;
        Self::check_size(size)?;
        self.submit_blocking(
            OrderSpec::Stop {
                is_buy,
                stop_tick,
                limit_tick: None,
                size,
            },
            exec_cb,
            admin_cb,
        )
    }

    pub fn insert_stop_limit(
        &self,
        is_buy: bool,
        stop_price: Decimal,
        limit_price: Decimal,
        size: u64,
        exec_cb: Option<ExecCallback>,
        admin_cb: Option<AdminCallback>,
    ) -> Result<OrderId, BookError> {
        let stop_tick = self.tick_for(stop_price)?;
        let limit_tick = self.tick_for(limit_price)?;
        Self::check_size(size)?;
        self.submit_blocking(
            OrderSpec::Stop {
                is_buy,
                stop_tick,
                limit_tick: Some(limit_tick),
                size,
            },
            exec_cb,
            admin_cb,
        )
    }

    /// Remove a resting order. Returns `false` when the ID is not resting
    /// (already filled, pulled, or never existed).
    pub fn pull_order(&self, id: OrderId, search_limits_first: bool) -> Result<bool, BookError> {
        self.submit_blocking(
            OrderSpec::Pull {
                target: id,
                search_limits_first,
            },
            None,
            None,
        )
        .map(|v| v != 0)
    }

    // ========================================================================
    // Replace
    // ========================================================================

    /// Pull `id` and insert a limit order in its place. `None` when the
    /// original was not found; the insert is then not attempted.
    pub fn replace_with_limit(
        &self,
        id: OrderId,
        is_buy: bool,
        price: Decimal,
        size: u64,
        exec_cb: Option<ExecCallback>,
        admin_cb: Option<AdminCallback>,
    ) -> Result<Option<OrderId>, BookError> {
        if !self.pull_order(id, true)? {
            return Ok(None);
        }
        self.insert_limit(is_buy, price, size, exec_cb, admin_cb)
            .map(Some)
    }

    pub fn replace_with_market(
        &self,
        id: OrderId,
        is_buy: bool,
        size: u64,
        exec_cb: Option<ExecCallback>,
        admin_cb: Option<AdminCallback>,
    ) -> Result<Option<OrderId>, BookError> {
        if !self.pull_order(id, true)? {
            return Ok(None);
        }
        self.insert_market(is_buy, size, exec_cb, admin_cb).map(Some)
    }

    pub fn replace_with_stop(
        &self,
        id: OrderId,
        is_buy: bool,
        stop_price: Decimal,
        size: u64,
        exec_cb: Option<ExecCallback>,
        admin_cb: Option<AdminCallback>,
    ) -> Result<Option<OrderId>, BookError> {
        if !self.pull_order(id, false)? {
            return Ok(None);
        }
        self.insert_stop(is_buy, stop_price, size, exec_cb, admin_cb)
            .map(Some)
    }

    pub fn replace_with_stop_limit(
        &self,
        id: OrderId,
        is_buy: bool,
        stop_price: Decimal,
        limit_price: Decimal,
        size: u64,
        exec_cb: Option<ExecCallback>,
        admin_cb: Option<AdminCallback>,
    ) -> Result<Option<OrderId>, BookError> {
        if !self.pull_order(id, false)? {
            return Ok(None);
        }
        self.insert_stop_limit(is_buy, stop_price, limit_price, size, exec_cb, admin_cb)
            .map(Some)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_order_info(&self, id: OrderId, search_limits_first: bool) -> OrderInfo {
        self.shared.book.lock().order_info(id, search_limits_first)
    }

    /// Aggregate depth per price, inside outward, at most `max_depth`
    /// populated levels.
    pub fn market_depth(&self, is_buy: bool, max_depth: usize) -> BTreeMap<Decimal, u64> {
        let book = self.shared.book.lock();
        book.depth(is_buy, max_depth)
            .into_iter()
            .map(|(tick, size)| (book.ladder().tick_to_price(tick), size))
            .collect()
    }

    pub fn best_bid(&self) -> Option<(Decimal, u64)> {
        let book = self.shared.book.lock();
        book.best_bid()
            .map(|(tick, size)| (book.ladder().tick_to_price(tick), size))
    }

    pub fn best_ask(&self) -> Option<(Decimal, u64)> {
        let book = self.shared.book.lock();
        book.best_ask()
            .map(|(tick, size)| (book.ladder().tick_to_price(tick), size))
    }

    pub fn total_volume(&self) -> u64 {
        self.shared.book.lock().total_volume()
    }

    /// Most recent trade `(price, size, timestamp)`; the reference price
    /// with size zero before any trade.
    pub fn last_trade(&self) -> (Decimal, u64, DateTime<Utc>) {
        let book = self.shared.book.lock();
        let (tick, size, at) = book.last();
        (book.ladder().tick_to_price(tick), size, at)
    }

    pub fn time_and_sales(&self) -> Vec<TradePrint> {
        self.shared
            .book
            .lock()
            .time_and_sales()
            .iter()
            .cloned()
            .collect()
    }

    #[inline]
    pub fn tick_size(&self) -> Decimal {
        self.ladder.increment()
    }

    // ========================================================================
    // Wake subscribers
    // ========================================================================

    /// Register a callback for periodic `Wake` heartbeats. Requires the
    /// engine to have been configured with a waker interval.
    pub fn register_wake_subscriber(&self, cb: ExecCallback) -> u64 {
        let mut registry = self.shared.wake_subscribers.lock();
        let token = registry.next_token;
        registry.next_token += 1;
        registry.subs.insert(token, cb);
        token
    }

    pub fn unregister_wake_subscriber(&self, token: u64) -> bool {
        self.shared.wake_subscribers.lock().subs.remove(&token).is_some()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    #[inline]
    fn check_size(size: u64) -> Result<(), BookError> {
        if size == 0 {
            return Err(BookError::InvalidOrder("size must be positive"));
        }
        Ok(())
    }

    fn tick_for(&self, price: Decimal) -> Result<Tick, BookError> {
        self.ladder
            .price_to_tick(price)
            .ok_or(BookError::InvalidOrder("price off the grid"))
    }

    /// Queue a ticket, await its promise, await pipeline idle, then drain
    /// callbacks on this thread. The drain runs on the error path too.
    fn submit_blocking(
        &self,
        spec: OrderSpec,
        exec_cb: Option<ExecCallback>,
        admin_cb: Option<AdminCallback>,
    ) -> Result<u64, BookError> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(BookError::Shutdown);
        }
        let (tx, rx) = bounded(1);
        {
            let mut q = self.shared.queue.lock();
            q.tickets.push_back(Ticket::Order {
                spec,
                explicit_id: None,
                exec_cb,
                admin_cb,
                done: Some(tx),
            });
            q.outstanding += 1;
        }
        self.shared.queue_cv.notify_one();

        let result = rx.recv().unwrap_or(Err(BookError::Shutdown));

        {
            let mut q = self.shared.queue.lock();
            while q.outstanding > 0 {
                self.shared.idle_cv.wait(&mut q);
            }
        }
        drain_callbacks(&self.shared);
        result
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        {
            let mut q = self.shared.queue.lock();
            q.tickets.push_back(Ticket::Shutdown);
        }
        self.shared.queue_cv.notify_all();
        self.shared.waker_cv.notify_all();
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.waker.take() {
            let _ = handle.join();
        }
        info!("engine stopped");
    }
}

/// Sole mutator of the book. Pops tickets, executes under the master lock,
/// re-queues triggered stops, then settles the promise and the outstanding
/// counter.
fn dispatcher_loop(shared: Arc<Shared>, pin_to_core: bool) {
    if pin_to_core {
        if let Some(core_ids) = core_affinity::get_core_ids() {
            if let Some(last_core) = core_ids.last() {
                core_affinity::set_for_current(*last_core);
            }
        }
    }

    loop {
        let ticket = {
            let mut q = shared.queue.lock();
            loop {
                if let Some(ticket) = q.tickets.pop_front() {
                    break ticket;
                }
                shared.queue_cv.wait(&mut q);
            }
        };
        let (spec, explicit_id, exec_cb, admin_cb, done) = match ticket {
            Ticket::Shutdown => break,
            Ticket::Order {
                spec,
                explicit_id,
                exec_cb,
                admin_cb,
                done,
            } => (spec, explicit_id, exec_cb, admin_cb, done),
        };

        let id = explicit_id.unwrap_or_else(|| shared.next_id.fetch_add(1, Ordering::Relaxed));

        let (result, reinjections) = {
            let mut book = shared.book.lock();
            let result = match spec {
                OrderSpec::Limit { is_buy, tick, size } => {
                    book.insert_limit(id, is_buy, tick, size, exec_cb).map(|_| id)
                }
                OrderSpec::Market { is_buy, size } => {
                    book.insert_market(id, is_buy, size, exec_cb).map(|_| id)
                }
                OrderSpec::Stop {
                    is_buy,
                    stop_tick,
                    limit_tick,
                    size,
                } => book
                    .insert_stop(id, is_buy, stop_tick, limit_tick, size, exec_cb)
                    .map(|_| id),
                OrderSpec::Pull {
                    target,
                    search_limits_first,
                } => book.pull(target, search_limits_first).map(u64::from),
            };
            (result, book.take_reinjections())
        };

        // Triggered stops go to the back of the queue and count toward
        // outstanding before this ticket's own decrement, so a blocking
        // caller's idle-wait covers the whole cascade.
        if !reinjections.is_empty() {
            let mut q = shared.queue.lock();
            for r in reinjections {
                let spec = match r.limit {
                    Some(tick) => OrderSpec::Limit {
                        is_buy: r.is_buy,
                        tick,
                        size: r.size,
                    },
                    None => OrderSpec::Market {
                        is_buy: r.is_buy,
                        size: r.size,
                    },
                };
                q.tickets.push_back(Ticket::Order {
                    spec,
                    explicit_id: Some(r.id),
                    exec_cb: r.exec_cb,
                    admin_cb: None,
                    done: None,
                });
                q.outstanding += 1;
            }
        }

        if result.is_ok() {
            if let Some(admin) = admin_cb {
                admin(id);
            }
        }
        match done {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                if let Err(err) = result {
                    warn!(id, error = %err, "re-injected order failed");
                }
            }
        }

        {
            let mut q = shared.queue.lock();
            debug_assert!(q.outstanding > 0, "outstanding counter underflow");
            q.outstanding = q.outstanding.saturating_sub(1);
            if q.outstanding == 0 {
                shared.idle_cv.notify_all();
            }
        }
    }

    // Cancel pending work: promises drop, producers observe Shutdown.
    {
        let mut q = shared.queue.lock();
        q.tickets.clear();
        q.outstanding = 0;
        shared.idle_cv.notify_all();
    }
    info!("dispatcher stopped");
}

/// Deliver queued notifications. The first caller through the gate owns
/// the drain and re-checks until the queue stays empty; callbacks may
/// submit further orders, whose own drain cycle picks up anything they
/// enqueue.
fn drain_callbacks(shared: &Shared) {
    if shared
        .draining
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        return;
    }
    loop {
        let batch = { shared.book.lock().take_deferred() };
        if batch.is_empty() {
            break;
        }
        for d in batch {
            (d.cb)(d.msg, d.id, d.price, d.size);
        }
    }
    shared.draining.store(false, Ordering::Release);
}

/// Periodic heartbeat: snapshot the subscriber list, enqueue one `Wake`
/// per subscriber under the master lock, drain outside it. The registry
/// lock is released before any callback runs, so subscribers may register
/// from inside their callbacks.
fn waker_loop(shared: Arc<Shared>, interval: Duration) {
    let mut guard = shared.waker_mu.lock();
    while shared.running.load(Ordering::Acquire) {
        shared.waker_cv.wait_for(&mut guard, interval);
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        let subs: Vec<ExecCallback> = shared
            .wake_subscribers
            .lock()
            .subs
            .values()
            .cloned()
            .collect();
        if subs.is_empty() {
            continue;
        }
        {
            let mut book = shared.book.lock();
            for cb in subs {
                book.enqueue_wake(cb);
            }
        }
        drain_callbacks(&shared);
    }
}
