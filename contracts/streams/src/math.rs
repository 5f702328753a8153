//! Fixed-point rate arithmetic and cycle bookkeeping.
//!
//! Rates are amounts per second with 64 fractional bits. Streamed amounts are
//! always derived from cycle-local offsets, so every receiver accrues the same
//! whole units at the same second of every cycle no matter when its stream
//! started.

/// Number of fractional bits carried by `amt_per_sec`.
pub const AMT_PER_SEC_EXTRA_BITS: u32 = 64;

/// `amt_per_sec` value of a stream paying exactly one unit per second.
pub const AMT_PER_SEC_MULTIPLIER: u128 = 1 << AMT_PER_SEC_EXTRA_BITS;

const FRACTION_MASK: u128 = AMT_PER_SEC_MULTIPLIER - 1;

/// Smallest rate that pays at least one whole unit over a full cycle.
pub fn min_amt_per_sec(cycle_secs: u32) -> u128 {
    let cycle_secs = cycle_secs as u128;
    (AMT_PER_SEC_MULTIPLIER + cycle_secs - 1) / cycle_secs
}

/// `floor(amt_per_sec * secs / 2^64)`, computed without a wide intermediate.
///
/// The integer and fractional halves of the rate are scaled separately, so the
/// result is exact for the whole `u128` rate range and stays below `2^97`.
pub fn mul_secs(amt_per_sec: u128, secs: u32) -> u128 {
    let secs = secs as u128;
    let whole = (amt_per_sec >> AMT_PER_SEC_EXTRA_BITS) * secs;
    let fraction = ((amt_per_sec & FRACTION_MASK) * secs) >> AMT_PER_SEC_EXTRA_BITS;
    whole + fraction
}

/// Cycle index containing `timestamp`. Index 0 is never produced.
pub fn cycle_of(timestamp: u32, cycle_secs: u32) -> u32 {
    timestamp / cycle_secs + 1
}

/// First second of the cycle containing `timestamp`.
pub fn cycle_start(timestamp: u32, cycle_secs: u32) -> u32 {
    timestamp - timestamp % cycle_secs
}

/// Amount streamed at `amt_per_sec` over `[start, end)`.
///
/// Whole cycles contribute `floor(cycle_secs * rate)` each, the partial cycles
/// at both ends contribute the floored cycle-local accrual. A cycle pays less
/// than `2^64 * cycle_secs` and fewer than `2^32 / cycle_secs` cycles fit in
/// the timestamp range, so the result stays below `2^97`.
pub fn streamed_amt(amt_per_sec: u128, start: u32, end: u32, cycle_secs: u32) -> u128 {
    if end <= start {
        return 0;
    }
    let ended_cycles = (end / cycle_secs - start / cycle_secs) as u128;
    let amt_per_cycle = mul_secs(amt_per_sec, cycle_secs);
    amt_per_cycle * ended_cycles + mul_secs(amt_per_sec, end % cycle_secs)
        - mul_secs(amt_per_sec, start % cycle_secs)
}
