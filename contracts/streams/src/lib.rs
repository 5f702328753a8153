#![no_std]

#[cfg(test)]
extern crate std;

mod balance;
mod cycles;
mod history;
mod math;
mod max_end;
mod receivers;

use soroban_sdk::{
    contract, contracterror, contractimpl, contracttype, symbol_short, Address, BytesN, Env,
    IntoVal, Val, Vec,
};

use crate::cycles::DeltaLedger;

pub use crate::history::{hash_streams_history, SqueezeCursor, StreamsHistory};
pub use crate::math::{AMT_PER_SEC_EXTRA_BITS, AMT_PER_SEC_MULTIPLIER};
pub use crate::receivers::{
    hash_streams, AccountId, StreamConfig, StreamReceiver, MAX_STREAMS_RECEIVERS,
    STREAM_CONFIG_BYTES,
};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Global configuration of the ledger.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Address allowed to configure streams and collect received funds.
    pub driver: Address,
    /// Length of an accounting cycle in seconds.
    pub cycle_secs: u32,
}

#[contracterror]
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ContractError {
    NotInitialised = 1,
    AlreadyInitialised = 2,
    CycleSecsTooLow = 3,
    TooManyReceivers = 4,
    ReceiversNotSorted = 5,
    AmtPerSecTooLow = 6,
    InvalidReceiversList = 7,
    EntryWithHashAndReceivers = 8,
    InvalidHistory = 9,
    TimestampBeforeUpdate = 10,
    TimestampOverflow = 11,
    ArithmeticOverflow = 12,
}

/// Streaming state of an account for a single asset.
///
/// The sender side describes the account's own outgoing streams, the
/// receiver side only tracks which of its incoming cycles are received.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamsState {
    /// Hash of the current receiver list, zero when there are no receivers.
    pub streams_hash: BytesN<32>,
    /// Head of the history chain of all configurations.
    pub history_hash: BytesN<32>,
    /// Time of the last configuration.
    pub update_time: u32,
    /// Balance at `update_time`.
    pub balance: i128,
    /// Time at which the balance runs out.
    pub max_end: u32,
    /// Configurations active within the cycle of `update_time`.
    pub curr_cycle_configs: u32,
    /// First cycle not received yet, 0 if nothing was ever streamed in.
    pub next_receivable_cycle: u32,
}

impl StreamsState {
    fn new(env: &Env) -> Self {
        StreamsState {
            streams_hash: receivers::zero_hash(env),
            history_hash: receivers::zero_hash(env),
            update_time: 0,
            balance: 0,
            max_end: 0,
            curr_cycle_configs: 0,
            next_receivable_cycle: 0,
        }
    }
}

/// Changes of a receiver's rate per cycle, applied in and after one cycle.
#[contracttype]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AmtDelta {
    pub this_cycle: i128,
    pub next_cycle: i128,
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamsKey {
    pub account_id: AccountId,
    pub asset: Address,
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CycleKey {
    pub account_id: AccountId,
    pub asset: Address,
    pub cycle: u32,
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SqueezeKey {
    pub account_id: AccountId,
    pub asset: Address,
    pub sender_id: AccountId,
}

/// Namespace for all contract storage keys.
#[contracttype]
pub enum DataKey {
    Config,                    // Instance storage for the driver and cycle length.
    StreamsState(StreamsKey),  // Persistent, one per account and asset.
    AmtDelta(CycleKey),        // Persistent, absent when both deltas are zero.
    SqueezeCursor(SqueezeKey), // Persistent, overwritten on every squeeze.
    Collectable(StreamsKey),   // Persistent, received but not collected funds.
}

// ---------------------------------------------------------------------------
// Storage helpers
// ---------------------------------------------------------------------------

const TTL_THRESHOLD: u32 = 17280;
const TTL_EXTEND_TO: u32 = 120960;

fn get_config(env: &Env) -> Result<Config, ContractError> {
    env.storage()
        .instance()
        .get(&DataKey::Config)
        .ok_or(ContractError::NotInitialised)
}

fn current_timestamp(env: &Env) -> Result<u32, ContractError> {
    u32::try_from(env.ledger().timestamp()).map_err(|_| ContractError::TimestampOverflow)
}

fn persist<V: IntoVal<Env, Val>>(env: &Env, key: &DataKey, value: &V) {
    env.storage().persistent().set(key, value);
    env.storage()
        .persistent()
        .extend_ttl(key, TTL_THRESHOLD, TTL_EXTEND_TO);
}

fn streams_key(account_id: AccountId, asset: &Address) -> StreamsKey {
    StreamsKey {
        account_id,
        asset: asset.clone(),
    }
}

pub(crate) fn load_streams_state(
    env: &Env,
    account_id: AccountId,
    asset: &Address,
) -> StreamsState {
    env.storage()
        .persistent()
        .get(&DataKey::StreamsState(streams_key(account_id, asset)))
        .unwrap_or_else(|| StreamsState::new(env))
}

pub(crate) fn save_streams_state(
    env: &Env,
    account_id: AccountId,
    asset: &Address,
    state: &StreamsState,
) {
    persist(
        env,
        &DataKey::StreamsState(streams_key(account_id, asset)),
        state,
    );
}

fn cycle_key(account_id: AccountId, asset: &Address, cycle: u32) -> DataKey {
    DataKey::AmtDelta(CycleKey {
        account_id,
        asset: asset.clone(),
        cycle,
    })
}

pub(crate) fn load_amt_delta(
    env: &Env,
    account_id: AccountId,
    asset: &Address,
    cycle: u32,
) -> AmtDelta {
    env.storage()
        .persistent()
        .get(&cycle_key(account_id, asset, cycle))
        .unwrap_or_default()
}

pub(crate) fn save_amt_delta(
    env: &Env,
    account_id: AccountId,
    asset: &Address,
    cycle: u32,
    delta: &AmtDelta,
) {
    if delta == &AmtDelta::default() {
        remove_amt_delta(env, account_id, asset, cycle);
    } else {
        persist(env, &cycle_key(account_id, asset, cycle), delta);
    }
}

pub(crate) fn remove_amt_delta(env: &Env, account_id: AccountId, asset: &Address, cycle: u32) {
    env.storage()
        .persistent()
        .remove(&cycle_key(account_id, asset, cycle));
}

fn squeeze_key(account_id: AccountId, asset: &Address, sender_id: AccountId) -> DataKey {
    DataKey::SqueezeCursor(SqueezeKey {
        account_id,
        asset: asset.clone(),
        sender_id,
    })
}

pub(crate) fn load_squeeze_cursor(
    env: &Env,
    account_id: AccountId,
    asset: &Address,
    sender_id: AccountId,
) -> Option<SqueezeCursor> {
    env.storage()
        .persistent()
        .get(&squeeze_key(account_id, asset, sender_id))
}

pub(crate) fn save_squeeze_cursor(
    env: &Env,
    account_id: AccountId,
    asset: &Address,
    sender_id: AccountId,
    cursor: &SqueezeCursor,
) {
    persist(env, &squeeze_key(account_id, asset, sender_id), cursor);
}

fn load_collectable(env: &Env, account_id: AccountId, asset: &Address) -> i128 {
    env.storage()
        .persistent()
        .get(&DataKey::Collectable(streams_key(account_id, asset)))
        .unwrap_or(0)
}

fn save_collectable(env: &Env, account_id: AccountId, asset: &Address, amt: i128) {
    let key = DataKey::Collectable(streams_key(account_id, asset));
    if amt == 0 {
        env.storage().persistent().remove(&key);
    } else {
        persist(env, &key, &amt);
    }
}

// ---------------------------------------------------------------------------
// Internal Helpers
// ---------------------------------------------------------------------------

impl StreamsLedger {
    fn require_driver(env: &Env) -> Result<Config, ContractError> {
        let config = get_config(env)?;
        config.driver.require_auth();
        Ok(config)
    }

    fn add_collectable(
        env: &Env,
        account_id: AccountId,
        asset: &Address,
        amt: i128,
    ) -> Result<(), ContractError> {
        if amt == 0 {
            return Ok(());
        }
        let collectable = load_collectable(env, account_id, asset)
            .checked_add(amt)
            .ok_or(ContractError::ArithmeticOverflow)?;
        save_collectable(env, account_id, asset, collectable);
        Ok(())
    }

    fn check_receivers(
        env: &Env,
        state: &StreamsState,
        receivers: &Vec<StreamReceiver>,
    ) -> Result<(), ContractError> {
        if hash_streams(env, receivers) != state.streams_hash {
            return Err(ContractError::InvalidReceiversList);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Contract Implementation
// ---------------------------------------------------------------------------

#[contract]
pub struct StreamsLedger;

#[contractimpl]
impl StreamsLedger {
    /// Initialise the ledger with its driver and cycle length.
    ///
    /// Must be called exactly once before any other operation.
    ///
    /// # Parameters
    /// - `driver`: Address authorised to configure streams and collect funds
    /// - `cycle_secs`: Length of an accounting cycle in seconds, at least 2
    ///
    /// # Errors
    /// - `AlreadyInitialised` if called more than once
    /// - `CycleSecsTooLow` if `cycle_secs <= 1`
    ///
    /// # Events
    /// - Publishes `init(driver, cycle_secs)`
    pub fn init(env: Env, driver: Address, cycle_secs: u32) -> Result<(), ContractError> {
        if env.storage().instance().has(&DataKey::Config) {
            return Err(ContractError::AlreadyInitialised);
        }
        if cycle_secs <= 1 {
            return Err(ContractError::CycleSecsTooLow);
        }
        let config = Config {
            driver: driver.clone(),
            cycle_secs,
        };
        env.storage().instance().set(&DataKey::Config, &config);
        env.storage()
            .instance()
            .extend_ttl(TTL_THRESHOLD, TTL_EXTEND_TO);

        env.events()
            .publish((symbol_short!("init"),), (driver, cycle_secs));
        Ok(())
    }

    /// Retrieve the ledger configuration.
    pub fn get_config(env: Env) -> Result<Config, ContractError> {
        get_config(&env)
    }

    /// Minimum `amt_per_sec` a receiver may stream at: the smallest rate
    /// paying at least one whole unit per cycle.
    pub fn min_amt_per_sec(env: Env) -> Result<u128, ContractError> {
        Ok(math::min_amt_per_sec(get_config(&env)?.cycle_secs))
    }

    /// Replace the receiver list of `account_id` and change its balance.
    ///
    /// The balance left at the current time is computed from `curr_receivers`,
    /// adjusted by `balance_delta` and then streamed to `new_receivers` until
    /// it runs out. Every receiver's delta ledger is updated in
    /// `O(|curr_receivers| + |new_receivers|)`, independent of how long the
    /// streams run.
    ///
    /// # Parameters
    /// - `curr_receivers`: The receiver list last set for the account
    /// - `balance_delta`: Amount to add (positive) or withdraw (negative)
    /// - `new_receivers`: The new canonical receiver list
    /// - `max_end_hint1`, `max_end_hint2`: Optional guesses of the new
    ///   `max_end`, 0 when unknown. They only affect the cost of the call.
    ///
    /// # Returns
    /// - `i128`: The balance change actually applied. Withdrawals are capped
    ///   at the whole remaining balance.
    ///
    /// # Authorization
    /// - Requires authorization from the driver
    ///
    /// # Errors
    /// - `InvalidReceiversList` if `curr_receivers` is not the stored list
    /// - `ReceiversNotSorted`, `AmtPerSecTooLow`, `TooManyReceivers` if
    ///   `new_receivers` is malformed
    /// - `TimestampBeforeUpdate` if the clock is behind the last update
    /// - `ArithmeticOverflow` if the new balance does not fit
    ///
    /// # Events
    /// - Publishes `streams(account_id)` with the asset, new streams hash,
    ///   history hash, balance and max end
    #[allow(clippy::too_many_arguments)]
    pub fn set_streams(
        env: Env,
        account_id: AccountId,
        asset: Address,
        curr_receivers: Vec<StreamReceiver>,
        balance_delta: i128,
        new_receivers: Vec<StreamReceiver>,
        max_end_hint1: u32,
        max_end_hint2: u32,
    ) -> Result<i128, ContractError> {
        let config = Self::require_driver(&env)?;
        let now = current_timestamp(&env)?;

        let state = load_streams_state(&env, account_id, &asset);
        Self::check_receivers(&env, &state, &curr_receivers)?;
        if now < state.update_time {
            return Err(ContractError::TimestampBeforeUpdate);
        }
        let last_update = state.update_time;
        let curr_max_end = state.max_end;

        let curr_balance = balance::balance_at(
            state.balance,
            last_update,
            curr_max_end,
            &curr_receivers,
            now,
            config.cycle_secs,
        );
        let real_balance_delta = balance_delta.max(-curr_balance);
        let new_balance = curr_balance
            .checked_add(real_balance_delta)
            .ok_or(ContractError::ArithmeticOverflow)?;

        let new_streams = receivers::build_active_streams(&new_receivers, config.cycle_secs, now)?;
        let new_max_end = max_end::calc_max_end(
            new_balance as u128,
            &new_streams,
            now,
            config.cycle_secs,
            max_end_hint1,
            max_end_hint2,
        );

        let ledger = DeltaLedger {
            env: &env,
            asset: &asset,
            cycle_secs: config.cycle_secs,
            now,
        };
        ledger.update_receiver_states(
            &curr_receivers,
            last_update,
            curr_max_end,
            &new_receivers,
            new_max_end,
        )?;

        // Reload: the account may stream to itself and its receiver side
        // could have just changed.
        let mut state = load_streams_state(&env, account_id, &asset);
        let prev_history_hash = state.history_hash.clone();
        if prev_history_hash != receivers::zero_hash(&env)
            && math::cycle_of(last_update, config.cycle_secs)
                != math::cycle_of(now, config.cycle_secs)
        {
            // the previous configuration still covers the start of this cycle
            state.curr_cycle_configs = 2;
        } else {
            state.curr_cycle_configs = state
                .curr_cycle_configs
                .checked_add(1)
                .ok_or(ContractError::ArithmeticOverflow)?;
        }
        let new_streams_hash = hash_streams(&env, &new_receivers);
        state.history_hash =
            hash_streams_history(&env, &prev_history_hash, &new_streams_hash, now, new_max_end);
        state.streams_hash = new_streams_hash.clone();
        state.update_time = now;
        state.balance = new_balance;
        state.max_end = new_max_end;
        save_streams_state(&env, account_id, &asset, &state);

        env.events().publish(
            (symbol_short!("streams"), account_id),
            (
                asset,
                new_streams_hash,
                state.history_hash,
                new_balance,
                new_max_end,
            ),
        );
        Ok(real_balance_delta)
    }

    /// Receive the finished cycles streamed to `account_id`.
    ///
    /// Walks at most `max_cycles` finished cycles starting from the first one
    /// not received yet and adds their total to the account's collectable
    /// balance. The current cycle is never received, use `squeeze_streams`
    /// for it. Calling with a small `max_cycles` and again later yields the
    /// same total as a single call.
    ///
    /// # Returns
    /// - `i128`: The amount received (0 if nothing to receive)
    ///
    /// # Events
    /// - Publishes `received(account_id)` with the asset, amount and the
    ///   number of finished cycles still left to receive
    pub fn receive_streams(
        env: Env,
        account_id: AccountId,
        asset: Address,
        max_cycles: u32,
    ) -> Result<i128, ContractError> {
        let config = get_config(&env)?;
        let ledger = DeltaLedger {
            env: &env,
            asset: &asset,
            cycle_secs: config.cycle_secs,
            now: current_timestamp(&env)?,
        };
        let result = ledger.receive(account_id, max_cycles)?;
        Self::add_collectable(&env, account_id, &asset, result.received_amt)?;

        env.events().publish(
            (symbol_short!("received"), account_id),
            (asset, result.received_amt, result.receivable_cycles),
        );
        Ok(result.received_amt)
    }

    /// Amount `receive_streams` would return with the same arguments.
    pub fn receive_streams_result(
        env: Env,
        account_id: AccountId,
        asset: Address,
        max_cycles: u32,
    ) -> Result<i128, ContractError> {
        let config = get_config(&env)?;
        let ledger = DeltaLedger {
            env: &env,
            asset: &asset,
            cycle_secs: config.cycle_secs,
            now: current_timestamp(&env)?,
        };
        Ok(ledger.receive_result(account_id, max_cycles)?.received_amt)
    }

    /// Number of finished cycles of `account_id` that can be received.
    pub fn receivable_cycles(
        env: Env,
        account_id: AccountId,
        asset: Address,
    ) -> Result<u32, ContractError> {
        let config = get_config(&env)?;
        let ledger = DeltaLedger {
            env: &env,
            asset: &asset,
            cycle_secs: config.cycle_secs,
            now: current_timestamp(&env)?,
        };
        let (from_cycle, to_cycle) = ledger.receivable_cycles_range(account_id);
        Ok(to_cycle - from_cycle)
    }

    /// Claim early what `sender_id` streamed to `account_id` within the
    /// current, unfinished cycle.
    ///
    /// `history` lists the sender's configurations following the one whose
    /// history hash is `history_hash` (zero to start from the first ever),
    /// up to the latest one. Entries may disclose their receivers or carry
    /// only the streams hash, only disclosed entries are squeezed. Squeezing
    /// the same window again yields 0.
    ///
    /// # Returns
    /// - `i128`: The amount squeezed, added to the collectable balance
    ///
    /// # Errors
    /// - `EntryWithHashAndReceivers` if an entry carries both
    /// - `InvalidHistory` if the entries do not lead to the sender's stored
    ///   history hash
    ///
    /// # Events
    /// - Publishes `squeezed(account_id)` with the asset, sender and amount
    pub fn squeeze_streams(
        env: Env,
        account_id: AccountId,
        asset: Address,
        sender_id: AccountId,
        history_hash: BytesN<32>,
        history: Vec<StreamsHistory>,
    ) -> Result<i128, ContractError> {
        let config = get_config(&env)?;
        let ledger = DeltaLedger {
            env: &env,
            asset: &asset,
            cycle_secs: config.cycle_secs,
            now: current_timestamp(&env)?,
        };
        let amt = history::squeeze(&ledger, account_id, sender_id, &history_hash, &history)?;
        Self::add_collectable(&env, account_id, &asset, amt)?;

        env.events().publish(
            (symbol_short!("squeezed"), account_id),
            (asset, sender_id, amt),
        );
        Ok(amt)
    }

    /// Amount `squeeze_streams` would return with the same arguments.
    pub fn squeeze_streams_result(
        env: Env,
        account_id: AccountId,
        asset: Address,
        sender_id: AccountId,
        history_hash: BytesN<32>,
        history: Vec<StreamsHistory>,
    ) -> Result<i128, ContractError> {
        let config = get_config(&env)?;
        let ledger = DeltaLedger {
            env: &env,
            asset: &asset,
            cycle_secs: config.cycle_secs,
            now: current_timestamp(&env)?,
        };
        let result =
            history::squeeze_result(&ledger, account_id, sender_id, &history_hash, &history)?;
        Ok(result.amt)
    }

    /// Balance of `account_id` left at `timestamp` given its current receivers.
    ///
    /// # Errors
    /// - `TimestampBeforeUpdate` if `timestamp` precedes the last update
    /// - `InvalidReceiversList` if `receivers` is not the stored list
    pub fn balance_at(
        env: Env,
        account_id: AccountId,
        asset: Address,
        receivers: Vec<StreamReceiver>,
        timestamp: u32,
    ) -> Result<i128, ContractError> {
        let config = get_config(&env)?;
        let state = load_streams_state(&env, account_id, &asset);
        if timestamp < state.update_time {
            return Err(ContractError::TimestampBeforeUpdate);
        }
        Self::check_receivers(&env, &state, &receivers)?;
        Ok(balance::balance_at(
            state.balance,
            state.update_time,
            state.max_end,
            &receivers,
            timestamp,
            config.cycle_secs,
        ))
    }

    /// Hash of a receiver list as stored in `StreamsState::streams_hash`.
    pub fn hash_streams(env: Env, receivers: Vec<StreamReceiver>) -> BytesN<32> {
        hash_streams(&env, &receivers)
    }

    /// Next history hash after appending a configuration.
    pub fn hash_streams_history(
        env: Env,
        prev_history_hash: BytesN<32>,
        streams_hash: BytesN<32>,
        update_time: u32,
        max_end: u32,
    ) -> BytesN<32> {
        hash_streams_history(&env, &prev_history_hash, &streams_hash, update_time, max_end)
    }

    /// Retrieve the streaming state of `account_id` for `asset`.
    pub fn streams_state(env: Env, account_id: AccountId, asset: Address) -> StreamsState {
        load_streams_state(&env, account_id, &asset)
    }

    /// Received funds of `account_id` not collected yet.
    pub fn collectable(env: Env, account_id: AccountId, asset: Address) -> i128 {
        load_collectable(&env, account_id, &asset)
    }

    /// Hand the collectable balance of `account_id` over to the driver.
    ///
    /// # Returns
    /// - `i128`: The amount collected, the collectable balance becomes 0
    ///
    /// # Authorization
    /// - Requires authorization from the driver
    ///
    /// # Events
    /// - Publishes `collected(account_id)` with the asset and amount
    pub fn collect(env: Env, account_id: AccountId, asset: Address) -> Result<i128, ContractError> {
        Self::require_driver(&env)?;
        let amt = load_collectable(&env, account_id, &asset);
        save_collectable(&env, account_id, &asset, 0);

        env.events()
            .publish((symbol_short!("collected"), account_id), (asset, amt));
        Ok(amt)
    }
}
