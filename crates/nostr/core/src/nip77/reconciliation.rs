use std::collections::HashSet;

use super::codec::varint_len;
use super::error::{Nip77Error, Result};
use super::model::{Bound, Item, NegentropyMessage, Range, RangePayload, RecordId};
use super::storage::NegentropyStorage;

/// Bytes kept free below the frame size limit for the closing range.
const FRAME_HEADROOM: usize = 200;

/// Upper bound on one encoded fingerprint range: bound, mode and digest.
const MAX_FINGERPRINT_RANGE_LEN: usize = 64;

/// Smallest non-zero frame size limit a session accepts.
pub const MIN_FRAME_SIZE_LIMIT: usize = 4096;

/// Tuning knobs for a reconciliation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegentropyConfig {
    /// Maximum encoded message size in bytes, 0 for unlimited.
    pub frame_size_limit: usize,
    /// Ranges with fewer items than this are sent as id lists.
    pub idlist_threshold: usize,
    /// Number of sub-ranges a mismatched range is split into.
    pub split_count: usize,
}

impl Default for NegentropyConfig {
    fn default() -> Self {
        Self {
            frame_size_limit: 0,
            idlist_threshold: 16,
            split_count: 16,
        }
    }
}

impl NegentropyConfig {
    fn validate(&self) -> Result<()> {
        if self.frame_size_limit != 0 && self.frame_size_limit < MIN_FRAME_SIZE_LIMIT {
            return Err(Nip77Error::InvalidConfig(format!(
                "frame size limit {} is below {MIN_FRAME_SIZE_LIMIT}",
                self.frame_size_limit
            )));
        }
        if self.idlist_threshold < 2 {
            return Err(Nip77Error::InvalidConfig(
                "idlist threshold must be at least 2".to_string(),
            ));
        }
        if self.split_count < 2 {
            return Err(Nip77Error::InvalidConfig(
                "split count must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outgoing message under construction.
struct Output {
    message: NegentropyMessage,
    encoded_len: usize,
    prev_timestamp: u64,
}

impl Output {
    fn new() -> Self {
        Self {
            message: NegentropyMessage::new(Vec::new()),
            encoded_len: 1,
            prev_timestamp: 0,
        }
    }

    fn push(&mut self, range: Range) {
        let mut scratch = Vec::new();
        range.encode(&mut scratch, &mut self.prev_timestamp);
        self.encoded_len += scratch.len();
        self.message.ranges.push(range);
    }

    fn mark(&self) -> (usize, usize, u64) {
        (self.message.ranges.len(), self.encoded_len, self.prev_timestamp)
    }

    fn rollback(&mut self, (ranges, encoded_len, prev_timestamp): (usize, usize, u64)) {
        self.message.ranges.truncate(ranges);
        self.encoded_len = encoded_len;
        self.prev_timestamp = prev_timestamp;
    }
}

/// One side of a negentropy exchange.
///
/// The side that calls [`initiate`](Self::initiate) is the initiator; the
/// other side only ever calls [`reconcile`](Self::reconcile). Both sides
/// accumulate the ids they learned about.
pub struct Negentropy<'a> {
    storage: &'a NegentropyStorage,
    config: NegentropyConfig,
    is_initiator: bool,
    complete: bool,
    have_ids: Vec<RecordId>,
    need_ids: Vec<RecordId>,
    seen_have: HashSet<RecordId>,
    seen_need: HashSet<RecordId>,
}

impl<'a> Negentropy<'a> {
    pub fn new(storage: &'a NegentropyStorage, config: NegentropyConfig) -> Result<Self> {
        if !storage.is_sealed() {
            return Err(Nip77Error::StorageNotSealed);
        }
        config.validate()?;
        Ok(Self {
            storage,
            config,
            is_initiator: false,
            complete: false,
            have_ids: Vec::new(),
            need_ids: Vec::new(),
            seen_have: HashSet::new(),
            seen_need: HashSet::new(),
        })
    }

    /// First message of an exchange: one fingerprint over everything.
    pub fn initiate(&mut self) -> Vec<u8> {
        self.is_initiator = true;
        self.complete = false;
        let mut output = Output::new();
        output.push(Range::fingerprint(
            Bound::infinity(),
            self.storage.fingerprint(0, self.storage.len()),
        ));
        output.message.encode()
    }

    pub fn initiate_hex(&mut self) -> String {
        hex::encode(self.initiate())
    }

    /// Process a peer message and produce the reply.
    ///
    /// A reply holding only the version byte means the exchange is done
    /// and [`is_complete`](Self::is_complete) turns true. On error nothing
    /// recorded so far is touched.
    pub fn reconcile(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let incoming = NegentropyMessage::decode(message)?;

        let storage = self.storage;
        let mut output = Output::new();
        let mut learned_have = Vec::new();
        let mut learned_need = Vec::new();
        let mut prev_index = 0;
        let mut prev_bound = Bound::zero();
        let mut pending_skip = false;

        for range in &incoming.ranges {
            let mark = output.mark();
            let skip_before = pending_skip;
            let mut upper_index = storage.find_lower_bound(prev_index, &range.upper_bound);
            let mut upper_bound = range.upper_bound.clone();
            let mut truncated = false;

            match &range.payload {
                RangePayload::Skip => pending_skip = true,
                RangePayload::Fingerprint(theirs) => {
                    if storage.fingerprint(prev_index, upper_index) == *theirs {
                        pending_skip = true;
                    } else {
                        flush_skip(&mut output, &mut pending_skip, &prev_bound);
                        self.split_range(&mut output, prev_index, upper_index, &upper_bound);
                    }
                }
                RangePayload::IdList(their_ids) => {
                    let ours = storage.slice(prev_index, upper_index);
                    let theirs: HashSet<&RecordId> = their_ids.iter().collect();
                    let our_ids: HashSet<&RecordId> = ours.iter().map(|item| &item.id).collect();
                    learned_have.extend(
                        ours.iter()
                            .map(|item| item.id)
                            .filter(|id| !theirs.contains(id)),
                    );
                    learned_need.extend(
                        their_ids
                            .iter()
                            .copied()
                            .filter(|id| !our_ids.contains(id)),
                    );

                    if self.is_initiator {
                        pending_skip = true;
                    } else {
                        flush_skip(&mut output, &mut pending_skip, &prev_bound);
                        let (ids, taken) = self.bounded_id_list(output.encoded_len, ours);
                        if let Some(first_left_out) = ours.get(taken) {
                            upper_index = prev_index + taken;
                            upper_bound = Bound::at(first_left_out);
                            truncated = true;
                        }
                        output.push(Range::id_list(upper_bound.clone(), ids));
                    }
                }
            }

            if truncated {
                // The id list was cut short; the rest goes out as one fingerprint.
                output.push(Range::fingerprint(
                    Bound::infinity(),
                    storage.fingerprint(upper_index, storage.len()),
                ));
                break;
            }
            if self.exceeds_frame(output.encoded_len) && mark.0 > 0 {
                output.rollback(mark);
                pending_skip = skip_before;
                flush_skip(&mut output, &mut pending_skip, &prev_bound);
                output.push(Range::fingerprint(
                    Bound::infinity(),
                    storage.fingerprint(prev_index, storage.len()),
                ));
                break;
            }

            prev_index = upper_index;
            prev_bound = upper_bound;
        }

        self.record(learned_have, learned_need);
        self.complete = output.message.ranges.is_empty();
        Ok(output.message.encode())
    }

    pub fn reconcile_hex(&mut self, message: &str) -> Result<String> {
        let bytes = hex::decode(message).map_err(|e| Nip77Error::InvalidHex(e.to_string()))?;
        self.reconcile(&bytes).map(hex::encode)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// Ids this side holds that the peer lacks.
    pub fn have_ids(&self) -> &[RecordId] {
        &self.have_ids
    }

    /// Ids the peer holds that this side lacks.
    pub fn need_ids(&self) -> &[RecordId] {
        &self.need_ids
    }

    fn record(&mut self, have: Vec<RecordId>, need: Vec<RecordId>) {
        for id in have {
            if self.seen_have.insert(id) {
                self.have_ids.push(id);
            }
        }
        for id in need {
            if self.seen_need.insert(id) {
                self.need_ids.push(id);
            }
        }
    }

    fn exceeds_frame(&self, len: usize) -> bool {
        self.config.frame_size_limit != 0
            && len > self.config.frame_size_limit.saturating_sub(FRAME_HEADROOM)
    }

    /// Ids of `items` that fit in the current frame, and how many were taken.
    fn bounded_id_list(&self, current_len: usize, items: &[Item]) -> (Vec<RecordId>, usize) {
        let mut ids = Vec::with_capacity(items.len());
        let mut len = current_len + 2 * varint_len(u64::MAX) + 32 + varint_len(items.len() as u64);
        for item in items {
            if self.exceeds_frame(len) && !ids.is_empty() {
                break;
            }
            ids.push(item.id);
            len += item.id.len();
        }
        let taken = ids.len();
        (ids, taken)
    }

    fn split_range(&self, output: &mut Output, lower: usize, upper: usize, upper_bound: &Bound) {
        let items = self.storage.slice(lower, upper);
        let count = items.len();
        if count < self.config.idlist_threshold {
            output.push(Range::id_list(
                upper_bound.clone(),
                items.iter().map(|item| item.id).collect(),
            ));
            return;
        }

        let buckets = self.config.split_count.min(count);
        let per_bucket = count / buckets;
        let extra = count % buckets;
        let mut cursor = 0;
        for bucket in 0..buckets {
            let size = per_bucket + usize::from(bucket < extra);
            let end = cursor + size;
            let bound = if end == count {
                upper_bound.clone()
            } else {
                Bound::between(&items[end - 1], &items[end])
            };
            let chunk = &items[cursor..end];
            let reserved = (buckets - bucket) * MAX_FINGERPRINT_RANGE_LEN + size * 32;
            let range = if size < self.config.idlist_threshold
                && !self.exceeds_frame(output.encoded_len + reserved)
            {
                Range::id_list(bound, chunk.iter().map(|item| item.id).collect())
            } else {
                Range::fingerprint(bound, self.storage.fingerprint(lower + cursor, lower + end))
            };
            output.push(range);
            cursor = end;
        }
    }
}

fn flush_skip(output: &mut Output, pending_skip: &mut bool, bound: &Bound) {
    if std::mem::take(pending_skip) {
        output.push(Range::skip(bound.clone()));
    }
}

impl std::fmt::Debug for Negentropy<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negentropy")
            .field("items", &self.storage.len())
            .field("config", &self.config)
            .field("is_initiator", &self.is_initiator)
            .field("complete", &self.complete)
            .field("have", &self.have_ids.len())
            .field("need", &self.need_ids.len())
            .finish()
    }
}
