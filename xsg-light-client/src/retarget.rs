//! Difficulty retargeting: the damped moving average used for most heights
//! and the Zawy LWMA-3 weighted average active from `LWMA_FORK_BLOCK`.
//!
//! Both algorithms are written over a header-lookup closure so the same code
//! serves headers from the file store and headers still in flight during
//! chunk verification. Integer divisions deliberately truncate in the same
//! order the network's consensus code does; `bits` is derived from the
//! result on the verify path, so the rounding is part of the protocol.

use std::collections::BTreeMap;

use xsg_types::network::{
    Target, AVERAGING_WINDOW_TIMESPAN, MAX_ACTUAL_TIMESPAN, MAX_TARGET, MIN_ACTUAL_TIMESPAN,
    POW_AVERAGING_WINDOW, POW_DAMPING_FACTOR, POW_MEDIAN_BLOCK_SPAN, POW_TARGET_SPACING,
    ZAWY_LWMA3_AVERAGING_WINDOW,
};
use xsg_types::utils::target_from_bits;
use xsg_types::{Header, U256};

use crate::error::{ChainError, Result};

/// Headers decoded from a chunk that have not reached the store yet, keyed
/// by height. The target function consults these before falling back to the
/// file.
#[derive(Debug, Default)]
pub struct ChunkHeaders {
    headers: BTreeMap<i64, Header>,
}

impl ChunkHeaders {
    #[must_use]
    pub fn new() -> Self {
        ChunkHeaders::default()
    }

    pub fn insert(&mut self, header: Header) {
        self.headers.insert(header.block_height, header);
    }

    #[must_use]
    pub fn get(&self, height: i64) -> Option<&Header> {
        self.headers.get(&height)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    #[must_use]
    pub fn min_height(&self) -> Option<i64> {
        self.headers.keys().next().copied()
    }

    #[must_use]
    pub fn max_height(&self) -> Option<i64> {
        self.headers.keys().next_back().copied()
    }
}

/// Median of the timestamps in the `POW_MEDIAN_BLOCK_SPAN` blocks below
/// `height`.
pub(crate) fn median_time<F>(lookup: &F, height: i64) -> Result<i64>
where
    F: Fn(i64) -> Result<Header>,
{
    let mut timestamps = Vec::with_capacity(POW_MEDIAN_BLOCK_SPAN as usize);
    for h in (height - POW_MEDIAN_BLOCK_SPAN).max(0)..height.max(1) {
        timestamps.push(lookup(h)?.time);
    }
    timestamps.sort_unstable();
    Ok(i64::from(timestamps[timestamps.len() / 2]))
}

/// The damped moving-average rule: mean target over the averaging window,
/// scaled by the damped and clamped span between the median times at the
/// window's edges.
pub(crate) fn digishield_target<F>(lookup: &F, height: i64) -> Result<Target>
where
    F: Fn(i64) -> Result<Header>,
{
    let mut total = U256::ZERO;
    for h in (height - POW_AVERAGING_WINDOW).max(0)..height.max(1) {
        let header = lookup(h)?;
        let (sum, overflow) = total.overflowing_add(target_from_bits(header.bits)?);
        if overflow {
            return Err(ChainError::InvalidHeader(
                "target sum overflowed".to_string(),
            ));
        }
        total = sum;
    }
    let mean_target = total / (POW_AVERAGING_WINDOW as u64);

    let mut actual_timespan =
        median_time(lookup, height)? - median_time(lookup, height - POW_AVERAGING_WINDOW)?;
    actual_timespan = AVERAGING_WINDOW_TIMESPAN
        + (actual_timespan - AVERAGING_WINDOW_TIMESPAN) / POW_DAMPING_FACTOR;
    actual_timespan = actual_timespan.clamp(MIN_ACTUAL_TIMESPAN, MAX_ACTUAL_TIMESPAN);

    let (next_target, overflow) =
        (mean_target / (AVERAGING_WINDOW_TIMESPAN as u64)).overflowing_mul(actual_timespan as u64);
    if overflow {
        return Err(ChainError::InvalidHeader("target overflowed".to_string()));
    }

    Ok(next_target.min(MAX_TARGET))
}

/// Zawy's LWMA-3: solvetimes weighted linearly by recency over a 60-block
/// window, with per-step truncating division in the target accumulator and
/// a [67%, 150%] clamp against the previous difficulty.
pub(crate) fn lwma3_target<F>(lookup: &F, height: i64) -> Result<Target>
where
    F: Fn(i64) -> Result<Header>,
{
    let t = POW_TARGET_SPACING;
    let n = ZAWY_LWMA3_AVERAGING_WINDOW;
    let k = n * (n + 1) * t / 2;

    if height < n {
        return Ok(MAX_TARGET);
    }

    let mut previous_timestamp = i64::from(lookup(height - n - 1)?.time);
    let mut weighted_solvetimes: i64 = 0;
    let mut sum_target = U256::ZERO;
    let mut previous_diff = U256::ZERO;

    for j in 1..=n {
        let h = height - n - 1 + j;
        let header = lookup(h)?;

        let this_timestamp = i64::from(header.time).max(previous_timestamp + 1);
        let solvetime = (this_timestamp - previous_timestamp).min(6 * t);
        previous_timestamp = this_timestamp;
        weighted_solvetimes += solvetime * j;

        let target = target_from_bits(header.bits)?;
        let (sum, overflow) = sum_target.overflowing_add(target / ((k * n) as u64));
        if overflow {
            return Err(ChainError::InvalidHeader(
                "target sum overflowed".to_string(),
            ));
        }
        sum_target = sum;

        if h == height - 1 {
            previous_diff = target;
        }
    }

    let (mut next_target, overflow) = sum_target.overflowing_mul(weighted_solvetimes as u64);
    if overflow {
        return Err(ChainError::InvalidHeader("target overflowed".to_string()));
    }

    // Clamp against the previous difficulty, multiplying before dividing so
    // the 150/100 and 67/100 factors stay exact in 256-bit integer math.
    let upper = mul_div(previous_diff, 150, 100)?;
    let lower = mul_div(previous_diff, 67, 100)?;
    if next_target > upper {
        next_target = upper;
    }
    if next_target < lower {
        next_target = lower;
    }

    Ok(next_target.min(MAX_TARGET))
}

fn mul_div(value: U256, mul: u64, div: u64) -> Result<U256> {
    let (product, overflow) = value.overflowing_mul(mul);
    if overflow {
        return Err(ChainError::InvalidHeader("target overflowed".to_string()));
    }
    Ok(product / div)
}
