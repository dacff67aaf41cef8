use std::cmp::Ordering;

use sha2::{Digest, Sha256};

use super::codec::{Reader, encode_varint};
use super::error::{Nip77Error, Result};
use crate::nip01::Filter;

/// Negentropy Protocol Version 1
pub const PROTOCOL_VERSION_1: u8 = 0x61;

/// Special infinity timestamp value
pub const TIMESTAMP_INFINITY: u64 = u64::MAX;

/// A 256-bit record id
pub type RecordId = [u8; 32];

/// A 128-bit range fingerprint
pub type Fingerprint = [u8; 16];

/// A (created_at, id) pair held by one side of a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Item {
    pub timestamp: u32,
    pub id: RecordId,
}

impl Item {
    pub fn new(timestamp: u32, id: RecordId) -> Self {
        Self { timestamp, id }
    }
}

impl Ord for Item {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Item {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A timestamp and id prefix separating two ranges.
///
/// Missing prefix bytes compare as zero, so a bound with an empty prefix
/// sits before every item sharing its timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound {
    pub timestamp: u64,
    pub id_prefix: Vec<u8>,
}

impl Bound {
    pub fn new(timestamp: u64, id_prefix: Vec<u8>) -> Result<Self> {
        if id_prefix.len() > 32 {
            return Err(Nip77Error::InvalidBound(format!(
                "id prefix too long: {} bytes (max 32)",
                id_prefix.len()
            )));
        }
        Ok(Self {
            timestamp,
            id_prefix,
        })
    }

    pub fn zero() -> Self {
        Self {
            timestamp: 0,
            id_prefix: Vec::new(),
        }
    }

    pub fn infinity() -> Self {
        Self {
            timestamp: TIMESTAMP_INFINITY,
            id_prefix: Vec::new(),
        }
    }

    pub fn is_infinity(&self) -> bool {
        self.timestamp == TIMESTAMP_INFINITY
    }

    /// Bound that sits exactly at `item`.
    pub fn at(item: &Item) -> Self {
        Self {
            timestamp: u64::from(item.timestamp),
            id_prefix: item.id.to_vec(),
        }
    }

    /// Shortest bound `b` with `prev < b <= curr`.
    pub fn between(prev: &Item, curr: &Item) -> Self {
        if curr.timestamp != prev.timestamp {
            return Self {
                timestamp: u64::from(curr.timestamp),
                id_prefix: Vec::new(),
            };
        }
        let shared = prev
            .id
            .iter()
            .zip(curr.id.iter())
            .take_while(|(a, b)| a == b)
            .count();
        Self {
            timestamp: u64::from(curr.timestamp),
            id_prefix: curr.id[..(shared + 1).min(32)].to_vec(),
        }
    }

    fn padded_id(&self) -> RecordId {
        let mut id = [0u8; 32];
        id[..self.id_prefix.len()].copy_from_slice(&self.id_prefix);
        id
    }

    /// Order of `item` relative to this bound.
    pub fn cmp_item(&self, item: &Item) -> Ordering {
        if self.is_infinity() {
            return Ordering::Greater;
        }
        self.timestamp
            .cmp(&u64::from(item.timestamp))
            .then_with(|| self.padded_id().cmp(&item.id))
    }

    fn cmp_bound(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.padded_id().cmp(&other.padded_id()))
    }

    fn encode(&self, out: &mut Vec<u8>, prev_timestamp: &mut u64) {
        if self.is_infinity() {
            encode_varint(out, 0);
        } else {
            encode_varint(out, 1 + self.timestamp.saturating_sub(*prev_timestamp));
        }
        *prev_timestamp = self.timestamp;
        encode_varint(out, self.id_prefix.len() as u64);
        out.extend_from_slice(&self.id_prefix);
    }

    fn decode(reader: &mut Reader<'_>, prev_timestamp: &mut u64) -> Result<Self> {
        let encoded = reader.varint("bound timestamp")?;
        let timestamp = if encoded == 0 {
            TIMESTAMP_INFINITY
        } else {
            prev_timestamp
                .checked_add(encoded - 1)
                .ok_or_else(|| Nip77Error::InvalidBound("timestamp overflow".to_string()))?
        };
        *prev_timestamp = timestamp;

        let prefix_len = reader.varint("bound prefix length")?;
        if prefix_len > 32 {
            return Err(Nip77Error::InvalidBound(format!(
                "id prefix length too long: {prefix_len}"
            )));
        }
        let id_prefix = reader.take(prefix_len as usize, "bound prefix")?.to_vec();
        Ok(Self {
            timestamp,
            id_prefix,
        })
    }
}

/// Mode and payload of a single range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangePayload {
    /// Mode 0: nothing to reconcile here.
    Skip,
    /// Mode 1: digest of every item in the range.
    Fingerprint(Fingerprint),
    /// Mode 2: every id in the range.
    IdList(Vec<RecordId>),
}

impl RangePayload {
    fn mode(&self) -> u64 {
        match self {
            Self::Skip => 0,
            Self::Fingerprint(_) => 1,
            Self::IdList(_) => 2,
        }
    }
}

/// A range in the Negentropy protocol
///
/// Its lower bound is the previous range's upper bound, or zero for the
/// first range of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    /// Exclusive upper bound of this range
    pub upper_bound: Bound,
    pub payload: RangePayload,
}

impl Range {
    pub fn skip(upper_bound: Bound) -> Self {
        Self {
            upper_bound,
            payload: RangePayload::Skip,
        }
    }

    pub fn fingerprint(upper_bound: Bound, fingerprint: Fingerprint) -> Self {
        Self {
            upper_bound,
            payload: RangePayload::Fingerprint(fingerprint),
        }
    }

    pub fn id_list(upper_bound: Bound, ids: Vec<RecordId>) -> Self {
        Self {
            upper_bound,
            payload: RangePayload::IdList(ids),
        }
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>, prev_timestamp: &mut u64) {
        self.upper_bound.encode(out, prev_timestamp);
        encode_varint(out, self.payload.mode());
        match &self.payload {
            RangePayload::Skip => {}
            RangePayload::Fingerprint(fingerprint) => out.extend_from_slice(fingerprint),
            RangePayload::IdList(ids) => {
                encode_varint(out, ids.len() as u64);
                for id in ids {
                    out.extend_from_slice(id);
                }
            }
        }
    }

    fn decode(reader: &mut Reader<'_>, prev_timestamp: &mut u64) -> Result<Self> {
        let upper_bound = Bound::decode(reader, prev_timestamp)?;
        let payload = match reader.varint("range mode")? {
            0 => RangePayload::Skip,
            1 => RangePayload::Fingerprint(reader.array("fingerprint")?),
            2 => {
                let count = reader.varint("id count")?;
                let needed = count.checked_mul(32).and_then(|n| usize::try_from(n).ok());
                if needed.is_none_or(|needed| needed > reader.remaining()) {
                    return Err(Nip77Error::UnexpectedEnd("id list"));
                }
                let mut ids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    ids.push(reader.array("id")?);
                }
                RangePayload::IdList(ids)
            }
            other => return Err(Nip77Error::InvalidMode(other)),
        };
        Ok(Self {
            upper_bound,
            payload,
        })
    }
}

/// A full negentropy message: version byte followed by ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegentropyMessage {
    pub version: u8,
    pub ranges: Vec<Range>,
}

impl NegentropyMessage {
    pub fn new(ranges: Vec<Range>) -> Self {
        Self {
            version: PROTOCOL_VERSION_1,
            ranges,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.version];
        let mut prev_timestamp = 0;
        for range in &self.ranges {
            range.encode(&mut out, &mut prev_timestamp);
        }
        out
    }

    pub fn encode_hex(&self) -> String {
        hex::encode(self.encode())
    }

    /// Decode and validate a whole message.
    ///
    /// Ranges must be strictly ascending; anything after an infinity bound
    /// is rejected.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let version = reader.byte("protocol version")?;
        if version != PROTOCOL_VERSION_1 {
            return Err(Nip77Error::InvalidProtocolVersion(version));
        }

        let mut ranges: Vec<Range> = Vec::new();
        let mut prev_timestamp = 0;
        while !reader.is_empty() {
            if ranges.last().is_some_and(|last| last.upper_bound.is_infinity()) {
                return Err(Nip77Error::InvalidRange(
                    "range after infinity bound".to_string(),
                ));
            }
            let range = Range::decode(&mut reader, &mut prev_timestamp)?;
            if let Some(last) = ranges.last()
                && range.upper_bound.cmp_bound(&last.upper_bound) != Ordering::Greater
            {
                return Err(Nip77Error::InvalidRange(
                    "range bounds are not ascending".to_string(),
                ));
            }
            ranges.push(range);
        }

        Ok(Self { version, ranges })
    }

    pub fn decode_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str).map_err(|e| Nip77Error::InvalidHex(e.to_string()))?;
        Self::decode(&bytes)
    }
}

/// Fingerprint of a run of items.
///
/// Ids are summed as little-endian 256-bit integers (mod 2^256), the
/// varint item count is appended, and the SHA-256 digest is truncated to
/// 16 bytes.
pub fn calculate_fingerprint(items: &[Item]) -> Fingerprint {
    let mut sum = [0u8; 32];
    for item in items {
        let mut carry = 0u16;
        for (acc, byte) in sum.iter_mut().zip(item.id.iter()) {
            let total = u16::from(*acc) + u16::from(*byte) + carry;
            *acc = total as u8;
            carry = total >> 8;
        }
    }

    let mut input = sum.to_vec();
    encode_varint(&mut input, items.len() as u64);
    let digest = Sha256::digest(&input);

    let mut fingerprint = [0u8; 16];
    fingerprint.copy_from_slice(&digest[..16]);
    fingerprint
}

/// NIP-77 JSON envelopes exchanged with a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum NegEnvelope {
    Open {
        subscription_id: String,
        filter: Filter,
        message: String,
    },
    Msg {
        subscription_id: String,
        message: String,
    },
    Close {
        subscription_id: String,
    },
    Err {
        subscription_id: String,
        reason: String,
    },
}

impl NegEnvelope {
    pub fn subscription_id(&self) -> &str {
        match self {
            Self::Open {
                subscription_id, ..
            }
            | Self::Msg {
                subscription_id, ..
            }
            | Self::Close { subscription_id }
            | Self::Err {
                subscription_id, ..
            } => subscription_id,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Open {
                subscription_id,
                filter,
                message,
            } => serde_json::json!(["NEG-OPEN", subscription_id, filter, message]),
            Self::Msg {
                subscription_id,
                message,
            } => serde_json::json!(["NEG-MSG", subscription_id, message]),
            Self::Close { subscription_id } => serde_json::json!(["NEG-CLOSE", subscription_id]),
            Self::Err {
                subscription_id,
                reason,
            } => serde_json::json!(["NEG-ERR", subscription_id, reason]),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let invalid = |kind: &'static str, reason: &str| Nip77Error::InvalidEnvelope {
            kind,
            reason: reason.to_string(),
        };
        let arr = value
            .as_array()
            .ok_or_else(|| invalid("NEG", "not an array"))?;
        let kind = arr
            .first()
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| invalid("NEG", "missing message type"))?;
        let text = |index: usize, kind: &'static str, what: &str| {
            arr.get(index)
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| invalid(kind, &format!("missing {what}")))
        };

        match kind {
            "NEG-OPEN" => {
                let filter = arr
                    .get(2)
                    .cloned()
                    .ok_or_else(|| invalid("NEG-OPEN", "missing filter"))?;
                Ok(Self::Open {
                    subscription_id: text(1, "NEG-OPEN", "subscription id")?,
                    filter: serde_json::from_value(filter)
                        .map_err(|error| invalid("NEG-OPEN", &error.to_string()))?,
                    message: text(3, "NEG-OPEN", "initial message")?,
                })
            }
            "NEG-MSG" => Ok(Self::Msg {
                subscription_id: text(1, "NEG-MSG", "subscription id")?,
                message: text(2, "NEG-MSG", "message")?,
            }),
            "NEG-CLOSE" => Ok(Self::Close {
                subscription_id: text(1, "NEG-CLOSE", "subscription id")?,
            }),
            "NEG-ERR" => Ok(Self::Err {
                subscription_id: text(1, "NEG-ERR", "subscription id")?,
                reason: text(2, "NEG-ERR", "reason")?,
            }),
            _ => Err(invalid("NEG", &format!("unknown message type {kind}"))),
        }
    }
}
