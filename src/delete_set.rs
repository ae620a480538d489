// model = "claude-opus-4-5"
// created = "2026-08-02"
// modified = "2026-08-02"
// driver = "Isaac Clayton"

//! The delete set: tombstone ranges per client.
//!
//! Deletions travel as `(client, clock, len)` ranges rather than as
//! structs of their own. A transaction accumulates ranges unsorted while
//! the body runs, then sorts and coalesces them once at close. Applying a
//! delete range twice is harmless, which is what makes update messages
//! idempotent.

use rustc_hash::FxHashMap;

use crate::block::Slot;
use crate::encoding::DecodeError;
use crate::encoding::Decoder;
use crate::encoding::Encoder;
use crate::id::ClientId;
use crate::id::Id;
use crate::id::IdRange;
use crate::store::StructStore;

/// Map from client to tombstoned clock ranges.
///
/// Ranges are unsorted while a transaction is open; `sort_and_merge`
/// establishes the canonical form: sorted by clock, disjoint, and with no
/// two ranges touching.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeleteSet {
    clients: FxHashMap<ClientId, Vec<IdRange>>,
}

impl DeleteSet {
    /// An empty delete set.
    pub fn new() -> DeleteSet {
        return DeleteSet {
            clients: FxHashMap::default(),
        };
    }

    /// Check whether any range is recorded.
    pub fn is_empty(&self) -> bool {
        return self.clients.is_empty();
    }

    /// Record a deleted range. No ordering is maintained here.
    pub fn add(&mut self, client: ClientId, clock: u32, len: u32) {
        if len == 0 {
            return;
        }
        self.clients
            .entry(client)
            .or_default()
            .push(IdRange::new(clock, len));
    }

    /// Iterate over `(client, ranges)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (ClientId, &[IdRange])> + '_ {
        return self
            .clients
            .iter()
            .map(|(client, ranges)| (*client, ranges.as_slice()));
    }

    /// Sort each client's ranges and coalesce overlap and adjacency:
    /// `[a, b)` and `[b, c)` collapse into `[a, c)`.
    pub fn sort_and_merge(&mut self) {
        for ranges in self.clients.values_mut() {
            ranges.sort_unstable_by_key(|range| range.clock);
            let mut write = 0usize;
            for read in 1..ranges.len() {
                let range = ranges[read];
                let prev = &mut ranges[write];
                if range.clock <= prev.end() {
                    let end = prev.end().max(range.end());
                    prev.len = end - prev.clock;
                } else {
                    write += 1;
                    ranges[write] = range;
                }
            }
            ranges.truncate(write + 1);
        }
    }

    /// Binary search the client's ranges for a single clock.
    ///
    /// Precondition: `sort_and_merge` has run.
    pub fn is_deleted(&self, id: Id) -> bool {
        let Some(ranges) = self.clients.get(&id.client) else {
            return false;
        };
        let mut left = 0usize;
        let mut right = ranges.len();
        while left < right {
            let mid = (left + right) / 2;
            let range = &ranges[mid];
            if range.contains(id.clock) {
                return true;
            }
            if range.clock > id.clock {
                right = mid;
            } else {
                left = mid + 1;
            }
        }
        return false;
    }

    /// Scan the store and coalesce runs of deleted structs into ranges.
    pub fn from_store(store: &StructStore) -> DeleteSet {
        let mut ds = DeleteSet::new();
        for (client, structs) in &store.clients {
            let mut run: Option<IdRange> = None;
            for slot in structs {
                if slot.is_deleted() {
                    match &mut run {
                        Some(range) if range.end() == slot.id().clock => {
                            range.len += slot.len();
                        }
                        _ => {
                            if let Some(range) = run.take() {
                                ds.add(*client, range.clock, range.len);
                            }
                            run = Some(IdRange::new(slot.id().clock, slot.len()));
                        }
                    }
                } else if let Some(range) = run.take() {
                    ds.add(*client, range.clock, range.len);
                }
            }
            if let Some(range) = run {
                ds.add(*client, range.clock, range.len);
            }
        }
        ds.sort_and_merge();
        return ds;
    }

    /// Merge another delete set into this one. The result needs a fresh
    /// `sort_and_merge` before queries.
    pub fn merge(&mut self, other: DeleteSet) {
        for (client, ranges) in other.clients {
            self.clients.entry(client).or_default().extend(ranges);
        }
    }

    /// Write as `numClients`, then per client `client`, `numRanges`, and
    /// the `(clock, len)` pairs. Clients ascending for canonical bytes.
    pub fn encode(&self, enc: &mut Encoder) {
        let mut clients: Vec<ClientId> = self.clients.keys().copied().collect();
        clients.sort_unstable();
        enc.write_var(clients.len() as u64);
        for client in clients {
            let ranges = &self.clients[&client];
            enc.write_var(client);
            enc.write_var(ranges.len() as u64);
            for range in ranges {
                enc.write_var(range.clock as u64);
                enc.write_var(range.len as u64);
            }
        }
    }

    /// Read a delete set written by `encode`.
    pub fn decode(dec: &mut Decoder<'_>) -> Result<DeleteSet, DecodeError> {
        let mut ds = DeleteSet::new();
        let num_clients = dec.read_var()?;
        for _ in 0..num_clients {
            let client = dec.read_var()?;
            let num_ranges = dec.read_var()?;
            for _ in 0..num_ranges {
                let clock = dec.read_var_u32()?;
                let len = dec.read_var_u32()?;
                if clock.checked_add(len).is_none() {
                    return Err(DecodeError::RangeOverflow(Id::new(client, clock)));
                }
                ds.add(client, clock, len);
            }
        }
        return Ok(ds);
    }
}

/// Walk the structs covered by a range, yielding their indices.
///
/// The caller supplies the client's array; the walk starts at the struct
/// containing `range.clock` (clamped into the known state) and ends before
/// `range.end()`.
pub(crate) fn range_indices(structs: &[Slot], range: IdRange) -> std::ops::Range<usize> {
    if structs.is_empty() {
        return 0..0;
    }
    let state = structs.last().map(|s| s.end()).unwrap_or(0);
    if range.clock >= state {
        return 0..0;
    }
    let start = StructStore::find_index(structs, range.clock);
    let mut end = start;
    while end < structs.len() && structs[end].id().clock < range.end() {
        end += 1;
    }
    return start..end;
}
