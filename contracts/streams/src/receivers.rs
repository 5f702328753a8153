use soroban_sdk::{contracttype, Bytes, BytesN, Env, Vec};

use crate::math::min_amt_per_sec;
use crate::ContractError;

/// Identifier of a streaming account. Namespacing is left to the driver.
pub type AccountId = u64;

/// Upper bound on the length of a receiver list.
pub const MAX_STREAMS_RECEIVERS: u32 = 100;

/// Length of [`StreamConfig::to_bytes`] output.
pub const STREAM_CONFIG_BYTES: usize = 28;

/// Parameters of a single stream.
///
/// Field order is the canonical order: configurations compare by `stream_id`,
/// then `amt_per_sec`, then `start`, then `duration`.
#[contracttype]
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct StreamConfig {
    /// Caller-chosen tag distinguishing otherwise equal streams.
    pub stream_id: u32,
    /// Amount per second with 64 fractional bits.
    pub amt_per_sec: u128,
    /// Start timestamp, 0 means the time of the configuration update.
    pub start: u32,
    /// Duration in seconds, 0 means until the balance runs out.
    pub duration: u32,
}

impl StreamConfig {
    /// Big-endian packing in field order, the form hashed into `streams_hash`.
    pub fn to_bytes(&self) -> [u8; STREAM_CONFIG_BYTES] {
        let mut out = [0u8; STREAM_CONFIG_BYTES];
        out[0..4].copy_from_slice(&self.stream_id.to_be_bytes());
        out[4..20].copy_from_slice(&self.amt_per_sec.to_be_bytes());
        out[20..24].copy_from_slice(&self.start.to_be_bytes());
        out[24..28].copy_from_slice(&self.duration.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; STREAM_CONFIG_BYTES]) -> Self {
        let mut stream_id = [0u8; 4];
        let mut amt_per_sec = [0u8; 16];
        let mut start = [0u8; 4];
        let mut duration = [0u8; 4];
        stream_id.copy_from_slice(&bytes[0..4]);
        amt_per_sec.copy_from_slice(&bytes[4..20]);
        start.copy_from_slice(&bytes[20..24]);
        duration.copy_from_slice(&bytes[24..28]);
        StreamConfig {
            stream_id: u32::from_be_bytes(stream_id),
            amt_per_sec: u128::from_be_bytes(amt_per_sec),
            start: u32::from_be_bytes(start),
            duration: u32::from_be_bytes(duration),
        }
    }

    /// Time range `[start, end)` the stream is active in.
    ///
    /// `update_time` stands in for an unset start, `max_end` ends unbounded
    /// streams and caps bounded ones. The result is clipped to
    /// `[start_cap, end_cap]` and never has `end < start`.
    pub fn range(
        &self,
        update_time: u32,
        max_end: u32,
        start_cap: u32,
        end_cap: u32,
    ) -> (u32, u32) {
        let start = if self.start == 0 {
            update_time
        } else {
            self.start
        };
        let natural_end = start as u64 + self.duration as u64;
        let end = if self.duration == 0 || natural_end > max_end as u64 {
            max_end
        } else {
            natural_end as u32
        };
        let start = start.max(start_cap);
        let end = end.min(end_cap).max(start);
        (start, end)
    }
}

/// A stream from the configuring account to `account_id`.
///
/// Derived ordering compares `account_id` first, then the configuration.
#[contracttype]
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct StreamReceiver {
    pub account_id: AccountId,
    pub config: StreamConfig,
}

/// Hash of a receiver list, zero for the empty list.
///
/// The hash is a keccak256 over the concatenated account ids and packed
/// configurations, so it depends on the order of the list.
pub fn hash_streams(env: &Env, receivers: &Vec<StreamReceiver>) -> BytesN<32> {
    if receivers.is_empty() {
        return zero_hash(env);
    }
    let mut data = Bytes::new(env);
    for receiver in receivers.iter() {
        data.extend_from_array(&receiver.account_id.to_be_bytes());
        data.extend_from_array(&receiver.config.to_bytes());
    }
    env.crypto().keccak256(&data).to_bytes()
}

pub fn zero_hash(env: &Env) -> BytesN<32> {
    BytesN::from_array(env, &[0u8; 32])
}

/// Range of a validated receiver clipped to the future.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ActiveStream {
    pub amt_per_sec: u128,
    pub start: u32,
    pub end: u32,
}

impl ActiveStream {
    const EMPTY: ActiveStream = ActiveStream {
        amt_per_sec: 0,
        start: 0,
        end: 0,
    };
}

/// The non-empty future ranges of a receiver list, in list order.
pub(crate) struct ActiveStreams {
    items: [ActiveStream; MAX_STREAMS_RECEIVERS as usize],
    len: usize,
}

impl ActiveStreams {
    pub fn new() -> Self {
        ActiveStreams {
            items: [ActiveStream::EMPTY; MAX_STREAMS_RECEIVERS as usize],
            len: 0,
        }
    }

    /// Panics when more than `MAX_STREAMS_RECEIVERS` streams are pushed.
    pub fn push(&mut self, stream: ActiveStream) {
        self.items[self.len] = stream;
        self.len += 1;
    }

    pub fn as_slice(&self) -> &[ActiveStream] {
        &self.items[..self.len]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Checks that `receivers` is a canonical list and collects the ranges its
/// streams will be active in when configured at `now`.
pub(crate) fn build_active_streams(
    receivers: &Vec<StreamReceiver>,
    cycle_secs: u32,
    now: u32,
) -> Result<ActiveStreams, ContractError> {
    if receivers.len() > MAX_STREAMS_RECEIVERS {
        return Err(ContractError::TooManyReceivers);
    }
    let min_amt_per_sec = min_amt_per_sec(cycle_secs);
    let mut streams = ActiveStreams::new();
    let mut prev: Option<StreamReceiver> = None;
    for receiver in receivers.iter() {
        if let Some(prev) = prev {
            if prev >= receiver {
                return Err(ContractError::ReceiversNotSorted);
            }
        }
        if receiver.config.amt_per_sec < min_amt_per_sec {
            return Err(ContractError::AmtPerSecTooLow);
        }
        let (start, end) = receiver.config.range(now, u32::MAX, now, u32::MAX);
        if start != end {
            streams.push(ActiveStream {
                amt_per_sec: receiver.config.amt_per_sec,
                start,
                end,
            });
        }
        prev = Some(receiver);
    }
    Ok(streams)
}
