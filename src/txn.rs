// model = "claude-opus-4-5"
// created = "2026-08-02"
// modified = "2026-08-02"
// driver = "Isaac Clayton"

//! Transactions: the unit of atomicity.
//!
//! Every mutation happens inside a transaction. The transaction records
//! the state vector at open, accumulates tombstone ranges and changed
//! types while the body runs, and at close drives the cleanup passes:
//! sort the delete set, deliver observers, collapse tombstones toward
//! placeholders, and merge adjacent structs back together so the log does
//! not fragment under editing.
//!
//! The document processes closed transactions from a FIFO queue. An
//! observer that mutates the document enqueues a fresh transaction rather
//! than recursing, so observers always run with no transaction open.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::block::delete_item;
use crate::block::gc_item;
use crate::block::integrate_item;
use crate::block::Content;
use crate::block::Item;
use crate::block::Slot;
use crate::branch::TypeRef;
use crate::delete_set::range_indices;
use crate::delete_set::DeleteSet;
use crate::id::ClientId;
use crate::id::Id;
use crate::store::DocStore;
use crate::store::StateVector;
use crate::store::StructStore;

// =============================================================================
// Transaction state
// =============================================================================

/// The bookkeeping a transaction accumulates between open and close.
///
/// This is plain data so the document can queue closed transactions and
/// process them strictly in order.
#[derive(Debug)]
pub(crate) struct TxnState {
    /// Caller-supplied tag forwarded to observers.
    pub origin: Option<String>,
    /// State vector snapshot taken at open.
    pub before_state: StateVector,
    /// State vector at close. Filled during cleanup.
    pub after_state: StateVector,
    /// Tombstone ranges recorded by this transaction.
    pub delete_set: DeleteSet,
    /// Changed types, with the sub-keys that changed. `None` marks a
    /// sequence-position change.
    pub changed: FxHashMap<TypeRef, BTreeSet<Option<String>>>,
    /// Struct boundaries created by splits, rechecked for merging at
    /// close.
    pub merge_structs: Vec<Id>,
}

impl TxnState {
    pub fn new(origin: Option<String>, before_state: StateVector) -> TxnState {
        return TxnState {
            origin,
            before_state,
            after_state: StateVector::new(),
            delete_set: DeleteSet::new(),
            changed: FxHashMap::default(),
            merge_structs: Vec::new(),
        };
    }

    /// Record that a type changed under `sub`.
    ///
    /// Types created inside this very transaction are skipped: their
    /// parent's change entry already covers them, and no observer can have
    /// been registered on them before the transaction opened.
    pub fn add_changed(&mut self, store: &DocStore, parent: TypeRef, sub: Option<String>) {
        let branch = store.branch(parent);
        let preexisting = match branch.item {
            None => true,
            Some(bid) => {
                bid.clock < self.before_state.get(bid.client) && !store.slot(bid).is_deleted()
            }
        };
        if preexisting {
            self.changed.entry(parent).or_default().insert(sub);
        }
    }
}

// =============================================================================
// Transaction handle
// =============================================================================

/// A live transaction: exclusive access to the document state plus the
/// accumulated bookkeeping.
///
/// Front-end types thread a `&mut Transaction` through their mutating
/// methods. Dropping back to the document closes the transaction and
/// queues it for cleanup.
pub struct Transaction<'doc> {
    pub(crate) store: &'doc mut DocStore,
    pub(crate) state: TxnState,
}

impl<'doc> Transaction<'doc> {
    /// The origin tag this transaction was opened with.
    pub fn origin(&self) -> Option<&str> {
        return self.state.origin.as_deref();
    }

    /// The id the next locally produced struct will start at.
    pub fn next_id(&self) -> Id {
        return self.store.next_id();
    }

    /// Create a local item and integrate it.
    pub(crate) fn create_item(
        &mut self,
        parent: TypeRef,
        parent_sub: Option<String>,
        origin: Option<Id>,
        right_origin: Option<Id>,
        content: Content,
    ) -> Id {
        let len = content.len();
        assert!(len > 0, "cannot insert empty content");
        let id = self.store.next_id();
        let item = Item {
            id,
            len,
            origin,
            right_origin,
            left: None,
            right: None,
            parent,
            parent_sub,
            deleted: false,
            content,
        };
        integrate_item(self.store, &mut self.state, item);
        return id;
    }

    /// Tombstone the struct starting at `id`.
    pub(crate) fn delete(&mut self, id: Id) {
        delete_item(self.store, &mut self.state, id);
    }
}

// =============================================================================
// Cleanup passes
// =============================================================================

/// Collapse this transaction's tombstones toward placeholders.
///
/// Walks the delete set right to left and demotes the content of every
/// deleted item. Nested types collapse their whole subtree into `GcSlot`s;
/// plain items keep their linked-list cell so concurrent origins still
/// resolve.
pub(crate) fn run_gc_pass(store: &mut DocStore, ds: &DeleteSet) {
    let mut clients: Vec<ClientId> = ds.iter().map(|(client, _)| client).collect();
    clients.sort_unstable();
    for client in clients {
        let ranges: Vec<crate::id::IdRange> = ds
            .iter()
            .find(|(c, _)| *c == client)
            .map(|(_, ranges)| ranges.to_vec())
            .unwrap_or_default();
        for range in ranges.iter().rev() {
            let indices = {
                let structs = match store.structs.clients.get(&client) {
                    Some(structs) => structs,
                    None => continue,
                };
                range_indices(structs, *range)
            };
            for i in indices.rev() {
                let slot = &store.structs.clients[&client][i];
                let id = slot.id();
                let deleted_item = matches!(slot, Slot::Item(item) if item.deleted);
                if deleted_item {
                    gc_item(store, id, false);
                }
            }
        }
    }
}

/// Merge adjacent structs back together after a transaction.
///
/// Three sweeps: over this transaction's delete-set ranges, over every
/// client whose clock advanced, and over the split boundaries recorded in
/// `merge_structs`. All sweeps run right to left so removals never shift
/// an index that is still pending.
pub(crate) fn run_merge_passes(store: &mut DocStore, txn: &TxnState) {
    // Sweep 1: freshly deleted ranges.
    let mut clients: Vec<ClientId> = txn.delete_set.iter().map(|(client, _)| client).collect();
    clients.sort_unstable();
    for client in clients {
        let ranges: Vec<crate::id::IdRange> = txn
            .delete_set
            .iter()
            .find(|(c, _)| *c == client)
            .map(|(_, ranges)| ranges.to_vec())
            .unwrap_or_default();
        for range in ranges.iter().rev() {
            let indices = {
                let structs = match store.structs.clients.get(&client) {
                    Some(structs) => structs,
                    None => continue,
                };
                range_indices(structs, *range)
            };
            for i in indices.rev() {
                try_merge_left(store, client, i);
            }
        }
    }

    // Sweep 2: structs appended since the transaction opened.
    let mut advanced: Vec<(ClientId, u32)> = txn
        .after_state
        .iter()
        .filter(|(client, after)| *after > txn.before_state.get(*client))
        .collect();
    advanced.sort_unstable_by_key(|(client, _)| *client);
    for (client, _) in advanced {
        let before = txn.before_state.get(client);
        let (first_change, len) = {
            let structs = &store.structs.clients[&client];
            let first = if before == 0 {
                1
            } else {
                StructStore::find_index(structs, before).max(1)
            };
            (first, structs.len())
        };
        for i in (first_change..len).rev() {
            try_merge_left(store, client, i);
        }
    }

    // Sweep 3: boundaries introduced by splits.
    for id in &txn.merge_structs {
        let Some(structs) = store.structs.clients.get(&id.client) else {
            continue;
        };
        if id.clock >= structs.last().map(|s| s.end()).unwrap_or(0) {
            continue;
        }
        let i = StructStore::find_index(structs, id.clock);
        let len = structs.len();
        if i + 1 < len {
            try_merge_left(store, id.client, i + 1);
        }
        if i > 0 {
            try_merge_left(store, id.client, i);
        }
    }
}

/// Try to merge the struct at `i` into its left neighbor.
///
/// Items merge when they are contiguous halves of one logical run: same
/// client and deleted flag, same parent and sub-key, the right one
/// anchored to the left one by both origin and link, matching right
/// origins, and content of the same variant. Placeholders merge whenever
/// contiguous.
pub(crate) fn try_merge_left(store: &mut DocStore, client: ClientId, i: usize) -> bool {
    let structs = match store.structs.clients.get(&client) {
        Some(structs) => structs,
        None => return false,
    };
    if i == 0 || i >= structs.len() {
        return false;
    }

    let ok = match (&structs[i - 1], &structs[i]) {
        (Slot::Gc(l), Slot::Gc(r)) => l.id.clock + l.len == r.id.clock,
        (Slot::Item(l), Slot::Item(r)) => {
            l.id.clock + l.len == r.id.clock
                && l.deleted == r.deleted
                && l.parent == r.parent
                && l.parent_sub == r.parent_sub
                && r.origin == Some(l.last_id())
                && r.left == Some(l.id)
                && l.right == Some(r.id)
                && l.right_origin == r.right_origin
                && l.content.mergeable_with(&r.content)
        }
        _ => false,
    };
    if !ok {
        return false;
    }

    let structs = store.structs.clients.get_mut(&client).expect("known client");
    let removed = structs.remove(i);
    match removed {
        Slot::Gc(r) => {
            let Slot::Gc(l) = &mut structs[i - 1] else {
                unreachable!();
            };
            l.len += r.len;
            return true;
        }
        Slot::Item(r) => {
            let l = structs[i - 1].as_item_mut().expect("checked above");
            l.content.merge(r.content);
            l.len += r.len;
            l.right = r.right;
            let l_id = l.id;

            if let Some(rr) = r.right {
                store.item_mut(rr).left = Some(l_id);
            }
            if let Some(sub) = r.parent_sub {
                // The merged-away struct may have been the visible value.
                let branch = store.branch_mut(r.parent);
                if branch.map.get(&sub) == Some(&r.id) {
                    branch.map.insert(sub, l_id);
                }
            }
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::Branch;

    fn setup() -> (DocStore, TxnState, TypeRef) {
        let mut store = DocStore::new(1);
        let root = store.alloc_branch(Branch::root("text"));
        let txn = TxnState::new(None, store.structs.state_vector());
        return (store, txn, root);
    }

    fn insert_str(
        store: &mut DocStore,
        txn: &mut TxnState,
        root: TypeRef,
        origin: Option<Id>,
        s: &str,
    ) -> Id {
        let content = Content::Str(s.to_string());
        let item = Item {
            id: store.next_id(),
            len: content.len(),
            origin,
            right_origin: None,
            left: None,
            right: None,
            parent: root,
            parent_sub: None,
            deleted: false,
            content,
        };
        let id = item.id;
        integrate_item(store, txn, item);
        return id;
    }

    fn read(store: &DocStore, root: TypeRef) -> String {
        let mut out = String::new();
        let mut cur = store.branch(root).start;
        while let Some(c) = cur {
            let item = store.item(c);
            if !item.deleted {
                if let Content::Str(s) = &item.content {
                    out.push_str(s);
                }
            }
            cur = item.right;
        }
        return out;
    }

    #[test]
    fn sequential_inserts_merge_into_one_struct() {
        let (mut store, mut txn, root) = setup();
        let a = insert_str(&mut store, &mut txn, root, None, "a");
        insert_str(&mut store, &mut txn, root, Some(a), "b");
        assert_eq!(store.structs.clients[&1].len(), 2);

        txn.after_state = store.structs.state_vector();
        run_merge_passes(&mut store, &txn);

        let structs = &store.structs.clients[&1];
        assert_eq!(structs.len(), 1);
        assert_eq!(structs[0].len(), 2);
        assert_eq!(read(&store, root), "ab");
        store.structs.integrity_check();
    }

    #[test]
    fn merge_refuses_differing_deleted_flags() {
        let (mut store, mut txn, root) = setup();
        let a = insert_str(&mut store, &mut txn, root, None, "a");
        let b = insert_str(&mut store, &mut txn, root, Some(a), "b");
        delete_item(&mut store, &mut txn, b);

        txn.after_state = store.structs.state_vector();
        run_merge_passes(&mut store, &txn);

        assert_eq!(store.structs.clients[&1].len(), 2);
        assert_eq!(read(&store, root), "a");
    }

    #[test]
    fn gc_pass_demotes_deleted_content() {
        let (mut store, mut txn, root) = setup();
        let a = insert_str(&mut store, &mut txn, root, None, "abc");
        delete_item(&mut store, &mut txn, a);
        txn.delete_set.sort_and_merge();

        run_gc_pass(&mut store, &txn.delete_set);

        let slot = store.slot(Id::new(1, 0));
        let item = slot.as_item().expect("tombstone keeps its cell");
        assert!(item.deleted);
        assert_eq!(item.content, Content::Deleted(3));
        store.structs.integrity_check();
    }

    #[test]
    fn deleted_neighbors_merge_after_gc() {
        let (mut store, mut txn, root) = setup();
        let a = insert_str(&mut store, &mut txn, root, None, "a");
        let b = insert_str(&mut store, &mut txn, root, Some(a), "b");
        delete_item(&mut store, &mut txn, a);
        delete_item(&mut store, &mut txn, b);
        txn.delete_set.sort_and_merge();

        run_gc_pass(&mut store, &txn.delete_set);
        txn.after_state = store.structs.state_vector();
        run_merge_passes(&mut store, &txn);

        let structs = &store.structs.clients[&1];
        assert_eq!(structs.len(), 1);
        assert_eq!(structs[0].len(), 2);
        assert!(structs[0].is_deleted());
    }

    #[test]
    fn concurrent_inserts_order_by_client_id() {
        let (mut store, mut txn, root) = setup();
        // Client 1 inserts "a" at the head.
        insert_str(&mut store, &mut txn, root, None, "a");
        // Client 2 concurrently inserts "b" at the head.
        let item = Item {
            id: Id::new(2, 0),
            len: 1,
            origin: None,
            right_origin: None,
            left: None,
            right: None,
            parent: root,
            parent_sub: None,
            deleted: false,
            content: Content::Str("b".to_string()),
        };
        integrate_item(&mut store, &mut txn, item);

        // The smaller client keeps the leftward position.
        assert_eq!(read(&store, root), "ab");
    }

    #[test]
    fn change_tracking_skips_types_created_in_txn() {
        let (mut store, mut txn, root) = setup();
        insert_str(&mut store, &mut txn, root, None, "a");
        // The root type existed before the transaction, so the change is
        // recorded against it.
        assert!(txn.changed.contains_key(&root));
        assert!(txn.changed[&root].contains(&None));
    }
}
