//! Streams history hash chain and the squeeze engine.
//!
//! Only the head of each sender's history chain is stored. Squeezing takes
//! the entries from the caller, checks that they fold into the stored head and
//! pays out what the disclosed entries streamed to the receiver within the
//! sender's current cycle.

use soroban_sdk::{contracttype, Address, Bytes, BytesN, Env, Map, Vec};

use crate::cycles::DeltaLedger;
use crate::math::{cycle_of, cycle_start, streamed_amt};
use crate::receivers::{hash_streams, zero_hash, AccountId, StreamReceiver};
use crate::{load_squeeze_cursor, load_streams_state, save_squeeze_cursor, ContractError};

/// One configuration of a sender, as supplied when squeezing.
///
/// Either `receivers` is disclosed and `streams_hash` is zero, or only the
/// `streams_hash` of the list is given.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamsHistory {
    pub streams_hash: BytesN<32>,
    pub receivers: Vec<StreamReceiver>,
    pub update_time: u32,
    pub max_end: u32,
}

/// Per receiver, asset and sender: how far each configuration of the sender's
/// current cycle has been squeezed, keyed by its index within the cycle.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SqueezeCursor {
    pub cycle: u32,
    pub squeezed_until: Map<u32, u32>,
}

/// Next link of the history chain.
pub fn hash_streams_history(
    env: &Env,
    prev_history_hash: &BytesN<32>,
    streams_hash: &BytesN<32>,
    update_time: u32,
    max_end: u32,
) -> BytesN<32> {
    let mut data = Bytes::new(env);
    data.extend_from_array(&prev_history_hash.to_array());
    data.extend_from_array(&streams_hash.to_array());
    data.extend_from_array(&update_time.to_be_bytes());
    data.extend_from_array(&max_end.to_be_bytes());
    env.crypto().keccak256(&data).to_bytes()
}

/// Folds `history` onto `history_hash` and checks it ends at `final_hash`.
pub(crate) fn verify_history(
    env: &Env,
    history_hash: &BytesN<32>,
    history: &Vec<StreamsHistory>,
    final_hash: &BytesN<32>,
) -> Result<(), ContractError> {
    let zero = zero_hash(env);
    let mut history_hash = history_hash.clone();
    for entry in history.iter() {
        let streams_hash = if entry.receivers.is_empty() {
            entry.streams_hash
        } else if entry.streams_hash != zero {
            return Err(ContractError::EntryWithHashAndReceivers);
        } else {
            hash_streams(env, &entry.receivers)
        };
        history_hash = hash_streams_history(
            env,
            &history_hash,
            &streams_hash,
            entry.update_time,
            entry.max_end,
        );
    }
    if &history_hash != final_hash {
        return Err(ContractError::InvalidHistory);
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub(crate) struct SqueezeResult {
    pub amt: i128,
    /// Indices within the sender's current cycle of the squeezed entries.
    pub squeezed: Vec<u32>,
}

fn current_cursor(
    env: &Env,
    account_id: AccountId,
    asset: &Address,
    sender_id: AccountId,
    cycle: u32,
) -> SqueezeCursor {
    match load_squeeze_cursor(env, account_id, asset, sender_id) {
        Some(cursor) if cursor.cycle == cycle => cursor,
        _ => SqueezeCursor {
            cycle,
            squeezed_until: Map::new(env),
        },
    }
}

/// Computes what `account_id` can squeeze from `sender_id` without touching
/// storage.
///
/// Walks `history` from the newest entry back, over at most the entries that
/// touched the sender's current cycle. Each entry covers the time until the
/// next one was applied, and only the part after its cursor position counts.
pub(crate) fn squeeze_result(
    ledger: &DeltaLedger,
    account_id: AccountId,
    sender_id: AccountId,
    history_hash: &BytesN<32>,
    history: &Vec<StreamsHistory>,
) -> Result<SqueezeResult, ContractError> {
    let env = ledger.env;
    let sender = load_streams_state(env, sender_id, ledger.asset);
    verify_history(env, history_hash, history, &sender.history_hash)?;

    let curr_cycle_start = cycle_start(ledger.now, ledger.cycle_secs);
    // A configuration set before this cycle is the only one active in it.
    let curr_cycle_configs = if sender.update_time >= curr_cycle_start {
        sender.curr_cycle_configs
    } else {
        1
    };
    let cursor = current_cursor(
        env,
        account_id,
        ledger.asset,
        sender_id,
        cycle_of(ledger.now, ledger.cycle_secs),
    );

    let mut amt: i128 = 0;
    let mut squeezed = Vec::new(env);
    let mut squeeze_end_cap = ledger.now;
    let len = history.len();
    let mut rev_idx = 1;
    while rev_idx <= len && rev_idx <= curr_cycle_configs {
        let entry = history.get_unchecked(len - rev_idx);
        if !entry.receivers.is_empty() {
            let config_idx = curr_cycle_configs - rev_idx;
            let squeeze_start_cap = cursor
                .squeezed_until
                .get(config_idx)
                .unwrap_or(0)
                .max(curr_cycle_start)
                .max(entry.update_time);
            if squeeze_start_cap < squeeze_end_cap {
                squeezed.push_back(config_idx);
                let entry_amt = squeezed_amt(
                    account_id,
                    &entry,
                    squeeze_start_cap,
                    squeeze_end_cap,
                    ledger.cycle_secs,
                )?;
                amt = amt
                    .checked_add(entry_amt)
                    .ok_or(ContractError::ArithmeticOverflow)?;
            }
        }
        squeeze_end_cap = entry.update_time;
        rev_idx += 1;
    }
    Ok(SqueezeResult { amt, squeezed })
}

/// Squeezes and records the squeezed window so it is never paid twice.
///
/// The amount is taken out of the receiver's current cycle in the delta
/// ledger, so a later receive of that cycle only pays the rest.
pub(crate) fn squeeze(
    ledger: &DeltaLedger,
    account_id: AccountId,
    sender_id: AccountId,
    history_hash: &BytesN<32>,
    history: &Vec<StreamsHistory>,
) -> Result<i128, ContractError> {
    let result = squeeze_result(ledger, account_id, sender_id, history_hash, history)?;
    if !result.squeezed.is_empty() {
        let mut cursor = current_cursor(
            ledger.env,
            account_id,
            ledger.asset,
            sender_id,
            cycle_of(ledger.now, ledger.cycle_secs),
        );
        for config_idx in result.squeezed.iter() {
            cursor.squeezed_until.set(config_idx, ledger.now);
        }
        save_squeeze_cursor(ledger.env, account_id, ledger.asset, sender_id, &cursor);
    }
    if result.amt != 0 {
        ledger.remove_from_current_cycle(account_id, result.amt)?;
    }
    Ok(result.amt)
}

/// Amount the streams of `entry` pay `account_id` within
/// `[squeeze_start_cap, squeeze_end_cap)`.
fn squeezed_amt(
    account_id: AccountId,
    entry: &StreamsHistory,
    squeeze_start_cap: u32,
    squeeze_end_cap: u32,
    cycle_secs: u32,
) -> Result<i128, ContractError> {
    let receivers = &entry.receivers;
    // first receiver entry of `account_id`, the list is sorted
    let mut idx = 0;
    let mut idx_cap = receivers.len();
    while idx < idx_cap {
        let idx_mid = (idx + idx_cap) / 2;
        if receivers.get_unchecked(idx_mid).account_id < account_id {
            idx = idx_mid + 1;
        } else {
            idx_cap = idx_mid;
        }
    }

    let mut amt: u128 = 0;
    while idx < receivers.len() {
        let receiver = receivers.get_unchecked(idx);
        if receiver.account_id != account_id {
            break;
        }
        let (start, end) = receiver.config.range(
            entry.update_time,
            entry.max_end,
            squeeze_start_cap,
            squeeze_end_cap,
        );
        amt = amt
            .checked_add(streamed_amt(receiver.config.amt_per_sec, start, end, cycle_secs))
            .ok_or(ContractError::ArithmeticOverflow)?;
        idx += 1;
    }
    i128::try_from(amt).map_err(|_| ContractError::ArithmeticOverflow)
}
