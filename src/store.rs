// model = "claude-opus-4-5"
// created = "2026-08-02"
// modified = "2026-08-02"
// driver = "Isaac Clayton"

//! The struct store: per-client sorted arrays of contiguous structs.
//!
//! Every struct a client ever produced lives in that client's array,
//! ordered by clock with no gaps: `structs[i].end() == structs[i+1].clock`,
//! starting at clock zero. The invariant makes binary search by clock
//! valid forever, even after splits and merges, because those operations
//! preserve the covered intervals exactly.
//!
//! `DocStore` bundles the struct arrays with the branch arena and the
//! parked remote input. It is the single mutable owner of all structs;
//! branches and items reference each other only through ids.
//!
//! Violating contiguity or resolving a clock outside the known state is a
//! programmer error and panics. Nothing here returns `Result`: remote
//! input is validated at the decode layer before it reaches the store.

use rustc_hash::FxHashMap;

use crate::block::GcSlot;
use crate::block::Item;
use crate::block::Slot;
use crate::branch::Branch;
use crate::branch::TypeRef;
use crate::delete_set::DeleteSet;
use crate::encoding::DecodeError;
use crate::encoding::Decoder;
use crate::encoding::Encoder;
use crate::id::ClientId;
use crate::id::Id;
use crate::txn::TxnState;
use crate::update::RefQueue;

// =============================================================================
// State vector
// =============================================================================

/// Map from client to the next clock expected from that client.
///
/// A derived view over the struct store: `get(c)` equals the end of the
/// last struct in `c`'s array. Comparing two state vectors tells a pair of
/// replicas exactly which struct ranges the other is missing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateVector(FxHashMap<ClientId, u32>);

impl StateVector {
    /// An empty vector: nothing known from anyone.
    pub fn new() -> StateVector {
        return StateVector(FxHashMap::default());
    }

    /// Next expected clock for a client, zero when unknown.
    pub fn get(&self, client: ClientId) -> u32 {
        return self.0.get(&client).copied().unwrap_or(0);
    }

    /// Record a client's next expected clock.
    pub fn set(&mut self, client: ClientId, clock: u32) {
        if clock > 0 {
            self.0.insert(client, clock);
        }
    }

    /// Iterate over `(client, next clock)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (ClientId, u32)> + '_ {
        return self.0.iter().map(|(c, clock)| (*c, *clock));
    }

    /// Number of clients tracked.
    pub fn len(&self) -> usize {
        return self.0.len();
    }

    /// Check whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        return self.0.is_empty();
    }

    /// Encode as `numClients` then `(client, clock)` pairs, clients in
    /// ascending order so equal vectors encode to equal bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut entries: Vec<(ClientId, u32)> = self.iter().collect();
        entries.sort_unstable_by_key(|(client, _)| *client);
        let mut enc = Encoder::new();
        enc.write_var(entries.len() as u64);
        for (client, clock) in entries {
            enc.write_var(client);
            enc.write_var(clock as u64);
        }
        return enc.finish();
    }

    /// Decode an encoded state vector.
    pub fn decode(bytes: &[u8]) -> Result<StateVector, DecodeError> {
        let mut dec = Decoder::new(bytes);
        let count = dec.read_var()?;
        let mut sv = StateVector::new();
        for _ in 0..count {
            let client = dec.read_var()?;
            let clock = dec.read_var_u32()?;
            sv.set(client, clock);
        }
        return Ok(sv);
    }
}

// =============================================================================
// Struct store
// =============================================================================

/// Per-client sorted arrays of contiguous structs.
#[derive(Debug, Default)]
pub(crate) struct StructStore {
    pub clients: FxHashMap<ClientId, Vec<Slot>>,
}

impl StructStore {
    pub fn new() -> StructStore {
        return StructStore {
            clients: FxHashMap::default(),
        };
    }

    /// Next expected clock for a client.
    pub fn get_state(&self, client: ClientId) -> u32 {
        match self.clients.get(&client) {
            Some(structs) => return structs.last().map(|s| s.end()).unwrap_or(0),
            None => return 0,
        }
    }

    /// Snapshot the next expected clock of every client.
    pub fn state_vector(&self) -> StateVector {
        let mut sv = StateVector::new();
        for (client, structs) in &self.clients {
            if let Some(last) = structs.last() {
                sv.set(*client, last.end());
            }
        }
        return sv;
    }

    /// Append a struct to its client's array.
    ///
    /// The struct must start exactly at the client's current state; a gap
    /// or overlap is a programmer error.
    pub fn push(&mut self, slot: Slot) {
        let id = slot.id();
        let expected = self.get_state(id.client);
        assert!(
            id.clock == expected,
            "struct {} breaks contiguity: expected clock {}",
            id,
            expected
        );
        self.clients.entry(id.client).or_default().push(slot);
    }

    /// Binary search for the struct containing `clock`.
    ///
    /// Each struct covers the half-open interval `[clock, end)`; the search
    /// returns the index whose interval contains the requested clock.
    /// Precondition: the clock is below the client's state.
    pub fn find_index(structs: &[Slot], clock: u32) -> usize {
        let mut left = 0usize;
        let mut right = structs.len();
        while left < right {
            let mid = (left + right) / 2;
            let slot = &structs[mid];
            let midclock = slot.id().clock;
            if midclock <= clock {
                if clock < midclock + slot.len() {
                    return mid;
                }
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        panic!("clock {} outside the known state", clock);
    }

    /// Verify per-client contiguity and clock monotonicity.
    pub fn integrity_check(&self) {
        for (client, structs) in &self.clients {
            if let Some(first) = structs.first() {
                assert!(
                    first.id().clock == 0,
                    "client {} does not start at clock 0",
                    client
                );
            }
            for pair in structs.windows(2) {
                assert!(
                    pair[0].end() == pair[1].id().clock,
                    "client {} has a gap at clock {}",
                    client,
                    pair[0].end()
                );
            }
        }
    }
}

// =============================================================================
// Document store
// =============================================================================

/// The mutable heart of a document: struct arrays, the branch arena, and
/// remote input parked for missing dependencies.
pub(crate) struct DocStore {
    pub client_id: ClientId,
    pub structs: StructStore,
    pub branches: Vec<Branch>,
    pub roots: FxHashMap<String, TypeRef>,
    /// Remote struct refs waiting on missing dependencies, per client,
    /// consumed through an index cursor.
    pub pending_refs: FxHashMap<ClientId, RefQueue>,
    /// Remote delete ranges beyond our state, applied once the structs
    /// arrive.
    pub pending_ds: DeleteSet,
}

impl DocStore {
    pub fn new(client_id: ClientId) -> DocStore {
        return DocStore {
            client_id,
            structs: StructStore::new(),
            branches: Vec::new(),
            roots: FxHashMap::default(),
            pending_refs: FxHashMap::default(),
            pending_ds: DeleteSet::new(),
        };
    }

    /// The id the next locally produced struct will start at.
    pub fn next_id(&self) -> Id {
        return Id::new(self.client_id, self.structs.get_state(self.client_id));
    }

    // -- branches -------------------------------------------------------------

    pub fn branch(&self, r: TypeRef) -> &Branch {
        return &self.branches[r.0 as usize];
    }

    pub fn branch_mut(&mut self, r: TypeRef) -> &mut Branch {
        return &mut self.branches[r.0 as usize];
    }

    pub fn alloc_branch(&mut self, branch: Branch) -> TypeRef {
        let r = TypeRef(self.branches.len() as u32);
        self.branches.push(branch);
        return r;
    }

    /// Fetch or create the root type registered under `name`.
    pub fn root(&mut self, name: &str) -> TypeRef {
        if let Some(r) = self.roots.get(name) {
            return *r;
        }
        let r = self.alloc_branch(Branch::root(name));
        self.roots.insert(name.to_string(), r);
        return r;
    }

    // -- struct access --------------------------------------------------------

    /// The struct containing `id.clock`.
    pub fn slot(&self, id: Id) -> &Slot {
        let structs = self
            .structs
            .clients
            .get(&id.client)
            .unwrap_or_else(|| panic!("unknown client {}", id.client));
        let index = StructStore::find_index(structs, id.clock);
        return &structs[index];
    }

    pub fn slot_mut(&mut self, id: Id) -> &mut Slot {
        let structs = self
            .structs
            .clients
            .get_mut(&id.client)
            .unwrap_or_else(|| panic!("unknown client {}", id.client));
        let index = StructStore::find_index(structs, id.clock);
        return &mut structs[index];
    }

    /// The item starting at `id`. Panics on a placeholder: callers reach
    /// items through live linked-list neighbors, which are never gc'd.
    pub fn item(&self, id: Id) -> &Item {
        return self
            .slot(id)
            .as_item()
            .unwrap_or_else(|| panic!("struct {} is a gc placeholder", id));
    }

    pub fn item_mut(&mut self, id: Id) -> &mut Item {
        return self
            .slot_mut(id)
            .as_item_mut()
            .unwrap_or_else(|| panic!("struct {} is a gc placeholder", id));
    }

    /// Start id of the struct containing `id.clock`, without splitting.
    pub fn find_containing_start(&self, id: Id) -> Id {
        return self.slot(id).id();
    }

    pub fn push(&mut self, slot: Slot) {
        self.structs.push(slot);
    }

    // -- splitting ------------------------------------------------------------

    /// Split the item at `index` of `client`'s array, `diff` units in.
    ///
    /// The left half keeps its id; the right half starts at
    /// `clock + diff`, anchored to the left half by origin and link. Both
    /// neighbors' links and the parent map entry are patched so the list
    /// stays consistent. The fresh boundary is recorded as a merge
    /// candidate for the transaction's cleanup pass.
    pub fn split_at(&mut self, txn: &mut TxnState, client: ClientId, index: usize, diff: u32) {
        let structs = self.structs.clients.get_mut(&client).expect("known client");
        let item = structs[index]
            .as_item_mut()
            .expect("gc placeholders never split");
        debug_assert!(diff > 0 && diff < item.len);

        let right_content = item.content.split_off(diff);
        let right = Item {
            id: Id::new(client, item.id.clock + diff),
            len: item.len - diff,
            origin: Some(Id::new(client, item.id.clock + diff - 1)),
            right_origin: item.right_origin,
            left: Some(item.id),
            right: item.right,
            parent: item.parent,
            parent_sub: item.parent_sub.clone(),
            deleted: item.deleted,
            content: right_content,
        };
        item.len = diff;
        item.right = Some(right.id);

        let left_id = item.id;
        let right_id = right.id;
        let old_right = right.right;
        let parent = right.parent;
        let sub = right.parent_sub.clone();
        structs.insert(index + 1, Slot::Item(right));

        if let Some(orid) = old_right {
            self.item_mut(orid).left = Some(right_id);
        }
        if let Some(sub) = sub {
            // The map names the struct whose last unit carries the value,
            // which is now the right half.
            let branch = self.branch_mut(parent);
            if branch.map.get(&sub) == Some(&left_id) {
                branch.map.insert(sub, right_id);
            }
        }
        txn.merge_structs.push(right_id);
    }

    /// Return the struct starting exactly at `id.clock`, splitting the
    /// containing item if necessary. Placeholders are returned whole.
    pub fn get_clean_start(&mut self, txn: &mut TxnState, id: Id) -> Id {
        let structs = self.structs.clients.get(&id.client).expect("known client");
        let index = StructStore::find_index(structs, id.clock);
        let slot = &structs[index];
        let start = slot.id().clock;
        if start == id.clock || slot.is_gc() {
            return slot.id();
        }
        self.split_at(txn, id.client, index, id.clock - start);
        return id;
    }

    /// Return the struct ending exactly at `id.clock + 1`, splitting the
    /// containing item if necessary. Placeholders are returned whole.
    pub fn get_clean_end(&mut self, txn: &mut TxnState, id: Id) -> Id {
        let structs = self.structs.clients.get(&id.client).expect("known client");
        let index = StructStore::find_index(structs, id.clock);
        let slot = &structs[index];
        let start = slot.id().clock;
        if id.clock == start + slot.len() - 1 || slot.is_gc() {
            return slot.id();
        }
        self.split_at(txn, id.client, index, id.clock - start + 1);
        return Id::new(id.client, start);
    }

    /// Replace the struct starting at `id` with a placeholder covering the
    /// same interval.
    pub fn replace_with_gc(&mut self, id: Id) {
        let slot = self.slot_mut(id);
        debug_assert!(slot.id() == id, "replacement must name a struct start");
        let len = slot.len();
        *slot = Slot::Gc(GcSlot { id, len });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gc(client: ClientId, clock: u32, len: u32) -> Slot {
        return Slot::Gc(GcSlot {
            id: Id::new(client, clock),
            len,
        });
    }

    #[test]
    fn state_starts_at_zero() {
        let store = StructStore::new();
        assert_eq!(store.get_state(7), 0);
        assert!(store.state_vector().is_empty());
    }

    #[test]
    fn push_advances_state() {
        let mut store = StructStore::new();
        store.push(gc(1, 0, 5));
        store.push(gc(1, 5, 3));
        assert_eq!(store.get_state(1), 8);
        store.integrity_check();
    }

    #[test]
    #[should_panic(expected = "breaks contiguity")]
    fn push_with_gap_panics() {
        let mut store = StructStore::new();
        store.push(gc(1, 0, 5));
        store.push(gc(1, 6, 1));
    }

    #[test]
    #[should_panic(expected = "breaks contiguity")]
    fn push_with_overlap_panics() {
        let mut store = StructStore::new();
        store.push(gc(1, 0, 5));
        store.push(gc(1, 4, 2));
    }

    #[test]
    fn find_index_hits_half_open_intervals() {
        let structs = vec![gc(1, 0, 5), gc(1, 5, 1), gc(1, 6, 4)];
        assert_eq!(StructStore::find_index(&structs, 0), 0);
        assert_eq!(StructStore::find_index(&structs, 4), 0);
        assert_eq!(StructStore::find_index(&structs, 5), 1);
        assert_eq!(StructStore::find_index(&structs, 6), 2);
        assert_eq!(StructStore::find_index(&structs, 9), 2);
    }

    #[test]
    #[should_panic(expected = "outside the known state")]
    fn find_index_past_state_panics() {
        let structs = vec![gc(1, 0, 5)];
        StructStore::find_index(&structs, 5);
    }

    #[test]
    fn state_vector_encode_decode_round_trip() {
        let mut sv = StateVector::new();
        sv.set(1, 10);
        sv.set(42, 7);
        sv.set(9000, 123456);

        let decoded = StateVector::decode(&sv.encode()).expect("decode should succeed");
        assert_eq!(decoded, sv);
    }

    #[test]
    fn state_vector_encoding_is_canonical() {
        let mut a = StateVector::new();
        a.set(5, 1);
        a.set(2, 9);
        let mut b = StateVector::new();
        b.set(2, 9);
        b.set(5, 1);
        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn empty_state_vector_round_trip() {
        let sv = StateVector::new();
        let decoded = StateVector::decode(&sv.encode()).unwrap();
        assert!(decoded.is_empty());
    }
}
