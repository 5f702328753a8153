use soroban_sdk::Vec;

use crate::math::streamed_amt;
use crate::receivers::StreamReceiver;

/// Balance left at `timestamp` out of `balance` held at `update_time`, with
/// `receivers` streaming until `max_end`. Floored at zero.
pub(crate) fn balance_at(
    balance: i128,
    update_time: u32,
    max_end: u32,
    receivers: &Vec<StreamReceiver>,
    timestamp: u32,
    cycle_secs: u32,
) -> i128 {
    let mut remaining = balance.max(0) as u128;
    for receiver in receivers.iter() {
        let (start, end) = receiver
            .config
            .range(update_time, max_end, update_time, timestamp);
        let spent = streamed_amt(receiver.config.amt_per_sec, start, end, cycle_secs);
        remaining = remaining.saturating_sub(spent);
    }
    remaining as i128
}
