//! Cycle-bucketed delta ledger and the receive engine.
//!
//! A receiver's incoming rate is stored as changes per cycle rather than as a
//! running total. A stream touches exactly two cycles, the one it starts in
//! and the one it ends in, so configuring a stream costs the same no matter
//! how long it runs. Each touched cycle holds two deltas because a stream
//! starting mid-cycle pays only part of its per-cycle amount in that cycle
//! and the remainder from the next one on.

use soroban_sdk::{Address, Env, Vec};

use crate::math::{cycle_of, mul_secs};
use crate::receivers::{AccountId, StreamReceiver};
use crate::{
    load_amt_delta, load_streams_state, remove_amt_delta, save_amt_delta, save_streams_state,
    ContractError,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Flow {
    Credit,
    Debit,
}

impl Flow {
    fn signed(self, amt: u128) -> Result<i128, ContractError> {
        let amt = i128::try_from(amt).map_err(|_| ContractError::ArithmeticOverflow)?;
        Ok(match self {
            Flow::Credit => amt,
            Flow::Debit => -amt,
        })
    }

    fn reversed(self) -> Self {
        match self {
            Flow::Credit => Flow::Debit,
            Flow::Debit => Flow::Credit,
        }
    }
}

/// Outcome of walking a receiver's finished cycles.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ReceiveResult {
    pub received_amt: i128,
    /// Finished cycles left for a later receive.
    pub receivable_cycles: u32,
    pub from_cycle: u32,
    pub to_cycle: u32,
    /// Rate per cycle in effect after `to_cycle - 1`.
    pub amt_per_cycle: i128,
}

/// Delta ledger of one asset, evaluated at `now`.
pub(crate) struct DeltaLedger<'a> {
    pub env: &'a Env,
    pub asset: &'a Address,
    pub cycle_secs: u32,
    pub now: u32,
}

impl DeltaLedger<'_> {
    /// Records `amt_per_sec` flowing to `account_id` over `[start, end)`.
    pub fn add_delta_range(
        &self,
        account_id: AccountId,
        start: u32,
        end: u32,
        amt_per_sec: u128,
        flow: Flow,
    ) -> Result<(), ContractError> {
        if start == end {
            return Ok(());
        }
        self.add_delta(account_id, start, amt_per_sec, flow)?;
        self.add_delta(account_id, end, amt_per_sec, flow.reversed())
    }

    fn add_delta(
        &self,
        account_id: AccountId,
        timestamp: u32,
        amt_per_sec: u128,
        flow: Flow,
    ) -> Result<(), ContractError> {
        // Both deltas follow `streamed_amt`: the cycle of `timestamp` pays only
        // the part of the cycle amount not yet accrued at its local offset.
        let full_cycle = flow.signed(mul_secs(amt_per_sec, self.cycle_secs))?;
        let next_cycle = flow.signed(mul_secs(amt_per_sec, timestamp % self.cycle_secs))?;
        let cycle = cycle_of(timestamp, self.cycle_secs);
        let mut delta = load_amt_delta(self.env, account_id, self.asset, cycle);
        delta.this_cycle = delta
            .this_cycle
            .checked_add(full_cycle - next_cycle)
            .ok_or(ContractError::ArithmeticOverflow)?;
        delta.next_cycle = delta
            .next_cycle
            .checked_add(next_cycle)
            .ok_or(ContractError::ArithmeticOverflow)?;
        save_amt_delta(self.env, account_id, self.asset, cycle, &delta);
        Ok(())
    }

    /// Takes `amt` out of the current cycle of `account_id`, leaving the
    /// following cycles unchanged.
    pub fn remove_from_current_cycle(
        &self,
        account_id: AccountId,
        amt: i128,
    ) -> Result<(), ContractError> {
        let cycle = cycle_of(self.now, self.cycle_secs);
        let mut delta = load_amt_delta(self.env, account_id, self.asset, cycle);
        delta.this_cycle = delta
            .this_cycle
            .checked_sub(amt)
            .ok_or(ContractError::ArithmeticOverflow)?;
        delta.next_cycle = delta
            .next_cycle
            .checked_add(amt)
            .ok_or(ContractError::ArithmeticOverflow)?;
        save_amt_delta(self.env, account_id, self.asset, cycle, &delta);
        Ok(())
    }

    /// Moves every receiver from the streams of `curr_receivers`, configured
    /// at `last_update` and funded until `curr_max_end`, to the streams of
    /// `new_receivers` funded from now until `new_max_end`.
    ///
    /// Both lists are canonical, so a single merge pass pairs up streams that
    /// differ only in their timing and shifts them instead of removing and
    /// re-adding them.
    pub fn update_receiver_states(
        &self,
        curr_receivers: &Vec<StreamReceiver>,
        last_update: u32,
        curr_max_end: u32,
        new_receivers: &Vec<StreamReceiver>,
        new_max_end: u32,
    ) -> Result<(), ContractError> {
        let mut curr_idx = 0;
        let mut new_idx = 0;
        loop {
            match (curr_receivers.get(curr_idx), new_receivers.get(new_idx)) {
                (Some(curr), Some(new))
                    if curr.account_id == new.account_id
                        && curr.config.amt_per_sec == new.config.amt_per_sec =>
                {
                    self.shift_stream(&curr, last_update, curr_max_end, &new, new_max_end)?;
                    curr_idx += 1;
                    new_idx += 1;
                }
                (Some(curr), Some(new)) if curr < new => {
                    self.remove_stream(&curr, last_update, curr_max_end)?;
                    curr_idx += 1;
                }
                (Some(curr), None) => {
                    self.remove_stream(&curr, last_update, curr_max_end)?;
                    curr_idx += 1;
                }
                (_, Some(new)) => {
                    self.add_stream(&new, new_max_end)?;
                    new_idx += 1;
                }
                (None, None) => return Ok(()),
            }
        }
    }

    fn shift_stream(
        &self,
        curr: &StreamReceiver,
        last_update: u32,
        curr_max_end: u32,
        new: &StreamReceiver,
        new_max_end: u32,
    ) -> Result<(), ContractError> {
        let (curr_start, curr_end) = curr
            .config
            .range(last_update, curr_max_end, self.now, u32::MAX);
        let (new_start, new_end) = new.config.range(self.now, new_max_end, self.now, u32::MAX);
        let amt_per_sec = curr.config.amt_per_sec;
        self.add_delta_range(curr.account_id, curr_start, new_start, amt_per_sec, Flow::Debit)?;
        self.add_delta_range(curr.account_id, curr_end, new_end, amt_per_sec, Flow::Credit)?;

        let curr_start_cycle = cycle_of(curr_start, self.cycle_secs);
        let new_start_cycle = cycle_of(new_start, self.cycle_secs);
        if curr_start_cycle > new_start_cycle {
            let mut state = load_streams_state(self.env, curr.account_id, self.asset);
            if state.next_receivable_cycle > new_start_cycle {
                state.next_receivable_cycle = new_start_cycle;
                save_streams_state(self.env, curr.account_id, self.asset, &state);
            }
        }
        Ok(())
    }

    fn remove_stream(
        &self,
        curr: &StreamReceiver,
        last_update: u32,
        curr_max_end: u32,
    ) -> Result<(), ContractError> {
        let (start, end) = curr
            .config
            .range(last_update, curr_max_end, self.now, u32::MAX);
        self.add_delta_range(curr.account_id, start, end, curr.config.amt_per_sec, Flow::Debit)
    }

    fn add_stream(&self, new: &StreamReceiver, new_max_end: u32) -> Result<(), ContractError> {
        let (start, end) = new.config.range(self.now, new_max_end, self.now, u32::MAX);
        self.add_delta_range(new.account_id, start, end, new.config.amt_per_sec, Flow::Credit)?;

        let start_cycle = cycle_of(start, self.cycle_secs);
        let mut state = load_streams_state(self.env, new.account_id, self.asset);
        if state.next_receivable_cycle == 0 || state.next_receivable_cycle > start_cycle {
            state.next_receivable_cycle = start_cycle;
            save_streams_state(self.env, new.account_id, self.asset, &state);
        }
        Ok(())
    }

    /// Finished cycles of `account_id` not yet received, as `[from, to)`.
    pub fn receivable_cycles_range(&self, account_id: AccountId) -> (u32, u32) {
        let state = load_streams_state(self.env, account_id, self.asset);
        let from_cycle = state.next_receivable_cycle;
        let to_cycle = cycle_of(self.now, self.cycle_secs);
        if from_cycle == 0 || to_cycle < from_cycle {
            (from_cycle, from_cycle)
        } else {
            (from_cycle, to_cycle)
        }
    }

    /// Sums up at most `max_cycles` finished cycles without touching storage.
    pub fn receive_result(
        &self,
        account_id: AccountId,
        max_cycles: u32,
    ) -> Result<ReceiveResult, ContractError> {
        let (from_cycle, mut to_cycle) = self.receivable_cycles_range(account_id);
        let mut receivable_cycles = 0;
        if to_cycle - from_cycle > max_cycles {
            receivable_cycles = to_cycle - from_cycle - max_cycles;
            to_cycle -= receivable_cycles;
        }

        let mut received_amt: i128 = 0;
        let mut amt_per_cycle: i128 = 0;
        for cycle in from_cycle..to_cycle {
            let delta = load_amt_delta(self.env, account_id, self.asset, cycle);
            amt_per_cycle = amt_per_cycle
                .checked_add(delta.this_cycle)
                .ok_or(ContractError::ArithmeticOverflow)?;
            received_amt = received_amt
                .checked_add(amt_per_cycle)
                .ok_or(ContractError::ArithmeticOverflow)?;
            amt_per_cycle = amt_per_cycle
                .checked_add(delta.next_cycle)
                .ok_or(ContractError::ArithmeticOverflow)?;
        }

        Ok(ReceiveResult {
            received_amt,
            receivable_cycles,
            from_cycle,
            to_cycle,
            amt_per_cycle,
        })
    }

    /// Finalizes at most `max_cycles` finished cycles of `account_id`.
    ///
    /// Received cycles are dropped from the ledger and the rate reached at
    /// their end is folded into the first unreceived cycle, which keeps the
    /// remaining deltas relative to zero.
    pub fn receive(
        &self,
        account_id: AccountId,
        max_cycles: u32,
    ) -> Result<ReceiveResult, ContractError> {
        let result = self.receive_result(account_id, max_cycles)?;
        if result.from_cycle == result.to_cycle {
            return Ok(result);
        }

        let mut state = load_streams_state(self.env, account_id, self.asset);
        state.next_receivable_cycle = result.to_cycle;
        save_streams_state(self.env, account_id, self.asset, &state);

        for cycle in result.from_cycle..result.to_cycle {
            remove_amt_delta(self.env, account_id, self.asset, cycle);
        }
        if result.amt_per_cycle != 0 {
            let mut delta = load_amt_delta(self.env, account_id, self.asset, result.to_cycle);
            delta.this_cycle = delta
                .this_cycle
                .checked_add(result.amt_per_cycle)
                .ok_or(ContractError::ArithmeticOverflow)?;
            save_amt_delta(self.env, account_id, self.asset, result.to_cycle, &delta);
        }
        Ok(result)
    }
}
