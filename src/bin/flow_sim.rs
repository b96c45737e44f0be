//! Random-flow driver for the engine.
//!
//! Spawns a few submitter threads that trade a seeded mixed flow around
//! the reference price, plus a wake subscriber that counts heartbeats,
//! then prints a summary of the resulting book.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use gridbook::{BookError, CallbackMsg, Engine, EngineConfig, ExecCallback};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rust_decimal::Decimal;

const WORKERS: u64 = 4;
const ORDERS_PER_WORKER: u64 = 5_000;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::new(
        "50.00".parse().unwrap(),
        "0.01".parse().unwrap(),
        "100.00".parse().unwrap(),
        (1, 100),
    )
    .with_waker(50)
    .with_tape_capacity(10_000);

    let engine = Arc::new(Engine::new(config).expect("engine construction"));

    let heartbeats = Arc::new(AtomicU64::new(0));
    let counter = heartbeats.clone();
    let wake_cb: ExecCallback = Arc::new(move |msg, _id, _price, _size| {
        if msg == CallbackMsg::Wake {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    });
    engine.register_wake_subscriber(wake_cb);

    let fills = Arc::new(AtomicU64::new(0));
    let started = std::time::Instant::now();

    let mut handles = Vec::new();
    for worker in 0..WORKERS {
        let engine = engine.clone();
        let fills = fills.clone();
        handles.push(thread::spawn(move || {
            let mut rng = ChaCha8Rng::seed_from_u64(0x5EED ^ worker);
            let fill_counter = fills.clone();
            let cb: ExecCallback = Arc::new(move |msg, _id, _price, _size| {
                if msg == CallbackMsg::Fill {
                    fill_counter.fetch_add(1, Ordering::Relaxed);
                }
            });

            for _ in 0..ORDERS_PER_WORKER {
                let is_buy = rng.gen_bool(0.5);
                let size = rng.gen_range(1..100);
                let result = if rng.gen_bool(0.85) {
                    let cents = rng.gen_range(4950..=5050);
                    engine
                        .insert_limit(is_buy, Decimal::new(cents, 2), size, Some(cb.clone()), None)
                        .map(|_| ())
                } else {
                    engine
                        .insert_market(is_buy, size, Some(cb.clone()), None)
                        .map(|_| ())
                };
                match result {
                    Ok(()) | Err(BookError::Liquidity { .. }) => {}
                    Err(err) => panic!("submission failed: {err}"),
                }
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    let elapsed = started.elapsed();
    let submitted = WORKERS * ORDERS_PER_WORKER;

    println!("Flow complete:");
    println!("  Orders submitted:  {submitted}");
    println!(
        "  Throughput:        {:.0} orders/s",
        submitted as f64 / elapsed.as_secs_f64()
    );
    println!("  Total volume:      {}", engine.total_volume());
    println!("  Fill callbacks:    {}", fills.load(Ordering::Relaxed));
    println!("  Heartbeats:        {}", heartbeats.load(Ordering::Relaxed));
    let (last_price, last_size, _) = engine.last_trade();
    println!("  Last trade:        {last_size} @ {last_price}");
    match (engine.best_bid(), engine.best_ask()) {
        (Some((bid, bid_size)), Some((ask, ask_size))) => {
            println!("  Inside market:     {bid_size} @ {bid} / {ask_size} @ {ask}");
        }
        (bid, ask) => println!("  Inside market:     {bid:?} / {ask:?}"),
    }
    println!("  Bid levels:        {}", engine.market_depth(true, 32).len());
    println!("  Ask levels:        {}", engine.market_depth(false, 32).len());
}
