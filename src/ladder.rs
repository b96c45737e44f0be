//! Tick ladder - maps external decimal prices onto grid ticks.
//!
//! The increment is a rational constant (`num / den`). Conversion rounds to
//! the nearest tick; tick 1 sits at `min` and tick `N` at `max`.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::command::Tick;
use crate::error::BookError;

/// Fixed price↔tick mapping for the lifetime of a grid.
#[derive(Clone, Debug, Serialize)]
pub struct TickLadder {
    min: Decimal,
    max: Decimal,
    increment: Decimal,
    /// Number of valid ticks; valid indices are `1..=count`.
    count: usize,
}

impl TickLadder {
    /// Build a ladder spanning `[min, max]` around a reference price.
    ///
    /// Tick counts below and above the reference are computed separately so
    /// the reference always lands exactly on a tick. Refuses degenerate
    /// ranges and ranges wider than `max_ticks`.
    pub fn new(
        reference: Decimal,
        min: Decimal,
        max: Decimal,
        ratio: (u32, u32),
        max_ticks: usize,
    ) -> Result<Self, BookError> {
        let (num, den) = ratio;
        if num == 0 || den == 0 {
            return Err(BookError::Allocation("tick ratio must be positive".to_string()));
        }
        let increment = Decimal::from(num) / Decimal::from(den);
        if min <= Decimal::ZERO || reference < min || max < reference {
            return Err(BookError::Allocation(format!(
                "price range [{min}, {max}] does not enclose reference {reference}"
            )));
        }

        let below = ((reference - min) / increment).round();
        let above = ((max - reference) / increment).round();
        let count = match (below.to_u64(), above.to_u64()) {
            (Some(b), Some(a)) => (b + a + 1) as usize,
            _ => return Err(BookError::Allocation("tick count overflow".to_string())),
        };
        if count < 2 {
            return Err(BookError::Allocation(format!(
                "range [{min}, {max}] holds fewer than two ticks at {increment}"
            )));
        }
        if count > max_ticks {
            return Err(BookError::Allocation(format!(
                "{count} ticks exceeds limit {max_ticks}"
            )));
        }

        Ok(Self {
            min,
            max,
            increment,
            count,
        })
    }

    /// Number of valid ticks. Valid indices are `1..=count()`.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// First sentinel index past the top of the grid.
    #[inline]
    pub fn past_end(&self) -> Tick {
        self.count + 1
    }

    #[inline]
    pub fn min_price(&self) -> Decimal {
        self.min
    }

    #[inline]
    pub fn max_price(&self) -> Decimal {
        self.max
    }

    #[inline]
    pub fn increment(&self) -> Decimal {
        self.increment
    }

    /// Round a price to its nearest tick. `None` when the rounded tick
    /// falls outside the grid.
    pub fn price_to_tick(&self, price: Decimal) -> Option<Tick> {
        let steps = ((price - self.min) / self.increment).round();
        let steps = steps.to_i64()?;
        if steps < 0 {
            return None;
        }
        let tick = steps as usize + 1;
        (tick <= self.count).then_some(tick)
    }

    /// Exact price of a valid tick.
    ///
    /// # Panics
    /// Debug-asserts that `tick` is within `1..=count`.
    #[inline]
    pub fn tick_to_price(&self, tick: Tick) -> Decimal {
        debug_assert!(tick >= 1 && tick <= self.count, "tick out of range");
        self.min + self.increment * Decimal::from((tick - 1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn px(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn penny_ladder() -> TickLadder {
        // 0.01 .. 100.00 around 50.00, one-cent ticks
        TickLadder::new(px("50.00"), px("0.01"), px("100.00"), (1, 100), 1_000_000).unwrap()
    }

    #[test]
    fn test_count_and_bounds() {
        let ladder = penny_ladder();
        assert_eq!(ladder.count(), 10_000);
        assert_eq!(ladder.past_end(), 10_001);
        assert_eq!(ladder.tick_to_price(1), px("0.01"));
        assert_eq!(ladder.tick_to_price(10_000), px("100.00"));
    }

    #[test]
    fn test_price_to_tick_exact() {
        let ladder = penny_ladder();
        assert_eq!(ladder.price_to_tick(px("0.01")), Some(1));
        assert_eq!(ladder.price_to_tick(px("50.00")), Some(5000));
        assert_eq!(ladder.price_to_tick(px("50.10")), Some(5010));
        assert_eq!(ladder.price_to_tick(px("100.00")), Some(10_000));
    }

    #[test]
    fn test_price_to_tick_rounds_to_nearest() {
        let ladder = penny_ladder();
        assert_eq!(ladder.price_to_tick(px("50.101")), Some(5010));
        assert_eq!(ladder.price_to_tick(px("50.109")), Some(5011));
    }

    #[test]
    fn test_price_out_of_range() {
        let ladder = penny_ladder();
        assert_eq!(ladder.price_to_tick(px("100.02")), None);
        assert_eq!(ladder.price_to_tick(px("-1.00")), None);
    }

    #[test]
    fn test_roundtrip() {
        let ladder = penny_ladder();
        for tick in [1usize, 2, 4999, 5000, 5001, 10_000] {
            let price = ladder.tick_to_price(tick);
            assert_eq!(ladder.price_to_tick(price), Some(tick));
        }
    }

    #[test]
    fn test_refuses_oversized_grid() {
        let err =
            TickLadder::new(px("50.00"), px("0.01"), px("100.00"), (1, 100), 5_000).unwrap_err();
        assert!(matches!(err, BookError::Allocation(_)));
    }

    #[test]
    fn test_refuses_degenerate_range() {
        let err =
            TickLadder::new(px("1.00"), px("1.00"), px("1.00"), (1, 100), 1_000).unwrap_err();
        assert!(matches!(err, BookError::Allocation(_)));

        let err =
            TickLadder::new(px("5.00"), px("6.00"), px("4.00"), (1, 100), 1_000).unwrap_err();
        assert!(matches!(err, BookError::Allocation(_)));
    }

    #[test]
    fn test_refuses_zero_ratio() {
        let err =
            TickLadder::new(px("5.00"), px("1.00"), px("9.00"), (0, 100), 1_000).unwrap_err();
        assert!(matches!(err, BookError::Allocation(_)));
    }
}
