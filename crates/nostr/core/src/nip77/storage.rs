use std::cmp::Ordering;
use std::fmt::Display;

use super::error::{Nip77Error, Result};
use super::model::{Bound, Fingerprint, Item, RecordId, calculate_fingerprint};
use crate::nip01::Filter;

/// Query limit used by [`NegentropyStorage::populate`] when none is given.
pub const DEFAULT_POPULATE_LIMIT: usize = 10_000;

/// Something that can list `(created_at, id)` pairs for a filter,
/// typically a local event database.
pub trait NegentropySource {
    type Error: Display;

    fn negentropy_items(
        &self,
        filter: &Filter,
        limit: usize,
    ) -> std::result::Result<Vec<Item>, Self::Error>;
}

/// Sorted item set one side reconciles from.
///
/// Items can be added in any order until [`seal`](Self::seal) sorts them;
/// after that the storage is read-only.
#[derive(Debug, Clone, Default)]
pub struct NegentropyStorage {
    items: Vec<Item>,
    sealed: bool,
}

impl NegentropyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, timestamp: u32, id: RecordId) -> Result<()> {
        if self.sealed {
            return Err(Nip77Error::StorageSealed);
        }
        self.items.push(Item::new(timestamp, id));
        Ok(())
    }

    /// Add every item `source` returns for `filter`.
    ///
    /// A `limit` of zero means [`DEFAULT_POPULATE_LIMIT`]. The storage is
    /// left unsealed.
    pub fn populate<S>(&mut self, source: &S, filter: &Filter, limit: usize) -> Result<usize>
    where
        S: NegentropySource + ?Sized,
    {
        if self.sealed {
            return Err(Nip77Error::StorageSealed);
        }
        let limit = if limit == 0 { DEFAULT_POPULATE_LIMIT } else { limit };
        let items = source
            .negentropy_items(filter, limit)
            .map_err(|error| Nip77Error::Source(error.to_string()))?;
        let added = items.len();
        self.items.extend(items);
        Ok(added)
    }

    /// Sort, drop duplicate items and freeze the storage.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Err(Nip77Error::StorageSealed);
        }
        self.items.sort_unstable();
        self.items.dedup();
        self.sealed = true;
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Index of the first item at or after `bound`, searching from `begin`.
    pub fn find_lower_bound(&self, begin: usize, bound: &Bound) -> usize {
        let begin = begin.min(self.items.len());
        let offset = self.items[begin..]
            .partition_point(|item| bound.cmp_item(item) == Ordering::Greater);
        begin + offset
    }

    pub fn fingerprint(&self, begin: usize, end: usize) -> Fingerprint {
        calculate_fingerprint(self.slice(begin, end))
    }

    pub(crate) fn slice(&self, begin: usize, end: usize) -> &[Item] {
        let end = end.min(self.items.len());
        let begin = begin.min(end);
        &self.items[begin..end]
    }
}
