// model = "claude-opus-4-5"
// created = "2026-08-02"
// modified = "2026-08-02"
// driver = "Isaac Clayton"

//! Structs: the units of the per-client log.
//!
//! A struct is a contiguous run of units owned by one client. There are two
//! concrete variants:
//!
//! - `Item`: a logically inserted element carrying content plus the linked
//!   list and origin bookkeeping that positions it inside its parent type.
//! - `GcSlot`: a collapsed placeholder. The content is gone but the clock
//!   interval survives so binary search over the client's log stays valid.
//!
//! A deleted `Item` whose content has been demoted to `Content::Deleted` is
//! the tombstone state: the linked-list cell is still there because
//! concurrently produced items may name it as an origin.
//!
//! The integration routine at the bottom of this file is the conflict
//! resolution core. Given an item's dual origins it scans the parent's
//! sequence between them and deterministically picks the insert position,
//! so every replica interleaves concurrent runs identically.

use log::trace;
use rustc_hash::FxHashSet;
use serde_json::Value;

use crate::branch::TypeRef;
use crate::encoding::Encoder;
use crate::id::Id;
use crate::store::DocStore;
use crate::txn::TxnState;

// =============================================================================
// Content
// =============================================================================

/// Wire tag for a collapsed placeholder.
pub(crate) const TAG_GC: u8 = 0;
/// Wire tag for tombstoned content of a known length.
pub(crate) const TAG_DELETED: u8 = 1;
/// Wire tag for a string chunk.
pub(crate) const TAG_STR: u8 = 2;
/// Wire tag for embedded values.
pub(crate) const TAG_EMBED: u8 = 3;
/// Wire tag for a nested shared type.
pub(crate) const TAG_TYPE: u8 = 4;

/// The content carried by an item.
///
/// Lengths are counted in units: characters for strings, values for embeds,
/// one for a nested type. Split and merge delegate here so the surrounding
/// item does not care what it carries.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Content {
    /// A chunk of text. Length is the number of characters.
    Str(String),
    /// A run of embedded values.
    Embed(Vec<Value>),
    /// A nested shared type. Always length one, never splits.
    Type(TypeRef),
    /// Tombstoned content. Only the unit count remains.
    Deleted(u32),
}

impl Content {
    /// The number of units this content occupies.
    pub fn len(&self) -> u32 {
        match self {
            Content::Str(s) => return s.chars().count() as u32,
            Content::Embed(values) => return values.len() as u32,
            Content::Type(_) => return 1,
            Content::Deleted(len) => return *len,
        }
    }

    /// The wire tag of this content variant.
    pub fn tag(&self) -> u8 {
        match self {
            Content::Str(_) => return TAG_STR,
            Content::Embed(_) => return TAG_EMBED,
            Content::Type(_) => return TAG_TYPE,
            Content::Deleted(_) => return TAG_DELETED,
        }
    }

    /// Split off everything from `diff` units onward, keeping the prefix.
    pub fn split_off(&mut self, diff: u32) -> Content {
        match self {
            Content::Str(s) => {
                let at = s
                    .char_indices()
                    .nth(diff as usize)
                    .map(|(i, _)| i)
                    .unwrap_or(s.len());
                return Content::Str(s.split_off(at));
            }
            Content::Embed(values) => {
                return Content::Embed(values.split_off(diff as usize));
            }
            Content::Deleted(len) => {
                let right = *len - diff;
                *len = diff;
                return Content::Deleted(right);
            }
            Content::Type(_) => panic!("a nested type occupies a single unit"),
        }
    }

    /// Append another content of the same variant.
    pub fn merge(&mut self, other: Content) {
        match (self, other) {
            (Content::Str(a), Content::Str(b)) => a.push_str(&b),
            (Content::Embed(a), Content::Embed(mut b)) => a.append(&mut b),
            (Content::Deleted(a), Content::Deleted(b)) => *a += b,
            _ => panic!("content variants do not merge"),
        }
    }

    /// Whether this variant can merge with another.
    pub fn mergeable_with(&self, other: &Content) -> bool {
        match (self, other) {
            (Content::Str(_), Content::Str(_)) => return true,
            (Content::Embed(_), Content::Embed(_)) => return true,
            (Content::Deleted(_), Content::Deleted(_)) => return true,
            _ => return false,
        }
    }

    /// Write the wire payload for this content, starting at `offset` units.
    pub fn write(&self, enc: &mut Encoder, offset: u32) {
        match self {
            Content::Str(s) => {
                let chunk: String = s.chars().skip(offset as usize).collect();
                enc.write_string(&chunk);
            }
            Content::Embed(values) => {
                let rest = &values[offset as usize..];
                enc.write_var(rest.len() as u64);
                for value in rest {
                    let json = serde_json::to_string(value)
                        .expect("json values serialize without error");
                    enc.write_string(&json);
                }
            }
            Content::Type(_) => {}
            Content::Deleted(len) => enc.write_var((*len - offset) as u64),
        }
    }
}

// =============================================================================
// Structs
// =============================================================================

/// A collapsed placeholder: an interval whose content was discarded.
#[derive(Clone, Debug)]
pub(crate) struct GcSlot {
    pub id: Id,
    pub len: u32,
}

/// A logically inserted element.
#[derive(Clone, Debug)]
pub(crate) struct Item {
    /// Id of the first unit.
    pub id: Id,
    /// Number of units, kept in sync with the content.
    pub len: u32,
    /// Id of the unit this item was inserted after, at insertion time.
    pub origin: Option<Id>,
    /// Id of the unit immediately to the right, at insertion time.
    pub right_origin: Option<Id>,
    /// Start id of the current left neighbor struct.
    pub left: Option<Id>,
    /// Start id of the current right neighbor struct.
    pub right: Option<Id>,
    /// The shared type this item lives in.
    pub parent: TypeRef,
    /// The map key this item is filed under, if any.
    pub parent_sub: Option<String>,
    /// Tombstone flag. Content survives until the gc pass demotes it.
    pub deleted: bool,
    pub content: Content,
}

impl Item {
    /// Id of the last unit of this item.
    pub fn last_id(&self) -> Id {
        return Id::new(self.id.client, self.id.clock + self.len - 1);
    }

    /// Check whether a clock falls inside this item.
    pub fn contains(&self, id: Id) -> bool {
        return self.id.client == id.client
            && id.clock >= self.id.clock
            && id.clock < self.id.clock + self.len;
    }
}

/// The tagged sum of struct variants stored in the per-client arrays.
#[derive(Clone, Debug)]
pub(crate) enum Slot {
    Item(Item),
    Gc(GcSlot),
}

impl Slot {
    pub fn id(&self) -> Id {
        match self {
            Slot::Item(item) => return item.id,
            Slot::Gc(gc) => return gc.id,
        }
    }

    pub fn len(&self) -> u32 {
        match self {
            Slot::Item(item) => return item.len,
            Slot::Gc(gc) => return gc.len,
        }
    }

    /// One past the last clock covered by this struct.
    pub fn end(&self) -> u32 {
        return self.id().clock + self.len();
    }

    pub fn is_gc(&self) -> bool {
        return matches!(self, Slot::Gc(_));
    }

    /// Deleted items and collapsed placeholders are both invisible.
    pub fn is_deleted(&self) -> bool {
        match self {
            Slot::Item(item) => return item.deleted,
            Slot::Gc(_) => return true,
        }
    }

    pub fn as_item(&self) -> Option<&Item> {
        match self {
            Slot::Item(item) => return Some(item),
            Slot::Gc(_) => return None,
        }
    }

    pub fn as_item_mut(&mut self) -> Option<&mut Item> {
        match self {
            Slot::Item(item) => return Some(item),
            Slot::Gc(_) => return None,
        }
    }

    /// Write this struct to the wire, starting at `offset` units in.
    ///
    /// Layout per struct: one info byte carrying the content tag and the
    /// presence bits for origin, right origin, and parent sub; then the
    /// optional ids; then the parent reference when both origins are
    /// absent (the receiver derives it from a neighbor otherwise); then
    /// the content payload.
    pub fn write(&self, enc: &mut Encoder, offset: u32, store: &DocStore) {
        match self {
            Slot::Gc(gc) => {
                enc.write_u8(TAG_GC);
                enc.write_var((gc.len - offset) as u64);
            }
            Slot::Item(item) => {
                // A partial write re-anchors the origin to the unit just
                // before the cut.
                let origin = if offset > 0 {
                    Some(Id::new(item.id.client, item.id.clock + offset - 1))
                } else {
                    item.origin
                };
                let mut info = item.content.tag();
                if origin.is_some() {
                    info |= 0x80;
                }
                if item.right_origin.is_some() {
                    info |= 0x40;
                }
                if item.parent_sub.is_some() {
                    info |= 0x20;
                }
                enc.write_u8(info);
                if let Some(o) = origin {
                    enc.write_id(o);
                }
                if let Some(ro) = item.right_origin {
                    enc.write_id(ro);
                }
                if origin.is_none() && item.right_origin.is_none() {
                    let branch = store.branch(item.parent);
                    match branch.item {
                        None => {
                            enc.write_var(1);
                            enc.write_string(branch.name.as_deref().unwrap_or(""));
                        }
                        Some(bid) => {
                            enc.write_var(0);
                            enc.write_id(bid);
                        }
                    }
                    if let Some(sub) = &item.parent_sub {
                        enc.write_string(sub);
                    }
                }
                item.content.write(enc, offset);
            }
        }
    }
}

// =============================================================================
// Lifecycle: delete and gc
// =============================================================================

/// Tombstone the struct starting at `id`, recursing into nested types.
///
/// Precondition: `id` names the start of a struct. The content stays in
/// place until the transaction's gc pass demotes it; only the flag flips
/// here so concurrent references keep resolving.
pub(crate) fn delete_item(store: &mut DocStore, txn: &mut TxnState, id: Id) {
    let mut queue = vec![id];
    while let Some(id) = queue.pop() {
        let Some(item) = store.slot_mut(id).as_item_mut() else {
            continue;
        };
        if item.deleted {
            continue;
        }
        item.deleted = true;
        let len = item.len;
        let parent = item.parent;
        let sub = item.parent_sub.clone();
        let nested = match item.content {
            Content::Type(t) => Some(t),
            _ => None,
        };
        txn.delete_set.add(id.client, id.clock, len);
        txn.add_changed(store, parent, sub);
        if let Some(t) = nested {
            // Deleting a type deletes everything it contains.
            let mut cur = store.branch(t).start;
            while let Some(c) = cur {
                queue.push(c);
                cur = store.item(c).right;
            }
            for entry in store.branch(t).map.values() {
                queue.push(*entry);
            }
        }
    }
}

/// Collapse the tombstone starting at `id` toward a placeholder.
///
/// With `parent_gced` the whole struct is replaced by a `GcSlot`; otherwise
/// only the content is demoted and the linked-list cell survives. Nested
/// types always collapse their subtree fully: once the type itself is
/// unreachable no concurrent operation can need its children's positions.
pub(crate) fn gc_item(store: &mut DocStore, id: Id, parent_gced: bool) {
    let mut queue = vec![(id, parent_gced)];
    while let Some((id, parent_gced)) = queue.pop() {
        let item = match store.slot(id) {
            Slot::Item(item) => item,
            Slot::Gc(_) => continue,
        };
        assert!(item.deleted, "cannot gc a live item {}", id);
        let len = item.len;
        if let Content::Type(t) = item.content {
            let mut cur = store.branch(t).start;
            while let Some(c) = cur {
                queue.push((c, true));
                cur = store.item(c).right;
            }
            let entries: Vec<Id> = store.branch(t).map.values().copied().collect();
            for entry in entries {
                // Older values for the same key hang off the left chain.
                let mut cur = Some(entry);
                while let Some(c) = cur {
                    queue.push((c, true));
                    cur = store.item(c).left;
                }
            }
            let branch = store.branch_mut(t);
            branch.start = None;
            branch.map.clear();
        }
        if parent_gced {
            store.replace_with_gc(id);
        } else if let Some(item) = store.slot_mut(id).as_item_mut() {
            item.content = Content::Deleted(len);
        }
    }
}

// =============================================================================
// Integration
// =============================================================================

/// Insert an item into its parent's sequence at the position determined by
/// its origins, then commit it to the struct store.
///
/// This is the conflict resolution core. The scan walks the candidates
/// between the item's effective left neighbor and its right origin:
///
/// 1. A candidate sharing our origin is ordered by client id; the smaller
///    client keeps the leftward position.
/// 2. A candidate whose origin lies left of ours was inserted into an
///    enclosing run; we skip past it.
/// 3. Anything else ends the scan; we sit before it.
///
/// Every replica runs the same scan over the same candidates, so all
/// replicas agree on the final interleaving.
pub(crate) fn integrate_item(store: &mut DocStore, txn: &mut TxnState, mut item: Item) {
    trace!("integrate {} len {} into {:?}", item.id, item.len, item.parent);

    // Resolve the effective neighbors from the origins, splitting the
    // containing structs so the boundaries are clean.
    let mut left: Option<Id> = match item.origin {
        Some(o) => Some(store.get_clean_end(txn, o)),
        None => None,
    };
    let right_bound: Option<Id> = match item.right_origin {
        Some(ro) => Some(store.get_clean_start(txn, ro)),
        None => None,
    };

    // First conflict candidate: whatever currently follows the left
    // neighbor, or the head of the relevant chain.
    let mut o: Option<Id> = match left {
        Some(l) => store.item(l).right,
        None => match &item.parent_sub {
            Some(sub) => leftmost_map_entry(store, item.parent, sub),
            None => store.branch(item.parent).start,
        },
    };

    let mut conflicting: FxHashSet<Id> = FxHashSet::default();
    let mut items_before_origin: FxHashSet<Id> = FxHashSet::default();

    while let Some(oid) = o {
        if Some(oid) == right_bound {
            break;
        }
        items_before_origin.insert(oid);
        conflicting.insert(oid);
        let other = store.item(oid);
        let other_client = other.id.client;
        let other_origin = other.origin;
        let other_right_origin = other.right_origin;
        let next = other.right;

        if item.origin == other_origin {
            if other_client < item.id.client {
                left = Some(oid);
                conflicting.clear();
            } else if item.right_origin == other_right_origin {
                // Same origin, same right origin: one client cannot have
                // produced both, and between clients the scan is done.
                assert!(
                    item.id.client != other_client,
                    "two items from client {} with identical origins",
                    other_client
                );
                break;
            }
        } else if let Some(oo) = other_origin {
            let oo_struct = store.find_containing_start(oo);
            if items_before_origin.contains(&oo_struct) {
                if !conflicting.contains(&oo_struct) {
                    left = Some(oid);
                    conflicting.clear();
                }
            } else {
                break;
            }
        } else {
            break;
        }
        o = next;
    }

    // Splice into the linked list.
    item.left = left;
    match left {
        Some(l) => {
            let l_item = store.item_mut(l);
            item.right = l_item.right;
            l_item.right = Some(item.id);
        }
        None => {
            let r = match &item.parent_sub {
                Some(sub) => leftmost_map_entry(store, item.parent, sub),
                None => {
                    let branch = store.branch_mut(item.parent);
                    let r = branch.start;
                    branch.start = Some(item.id);
                    r
                }
            };
            item.right = r;
        }
    }

    let mut stale_map_entry: Option<Id> = None;
    match item.right {
        Some(r) => {
            store.item_mut(r).left = Some(item.id);
        }
        None => {
            if let Some(sub) = &item.parent_sub {
                // The rightmost entry is the visible value for its key.
                store
                    .branch_mut(item.parent)
                    .map
                    .insert(sub.clone(), item.id);
                stale_map_entry = item.left;
            }
        }
    }

    txn.add_changed(store, item.parent, item.parent_sub.clone());

    // Tombstoned content from the wire arrives dead on integration.
    if let Content::Deleted(_) = item.content {
        item.deleted = true;
        txn.delete_set.add(item.id.client, item.id.clock, item.len);
    }

    let parent_item = store.branch(item.parent).item;
    let parent_deleted = match parent_item {
        Some(bid) => store.slot(store.find_containing_start(bid)).is_deleted(),
        None => false,
    };
    let shadowed = item.parent_sub.is_some() && item.right.is_some();
    let id = item.id;

    store.push(Slot::Item(item));

    if let Some(old) = stale_map_entry {
        delete_item(store, txn, old);
    }
    if parent_deleted || shadowed {
        // An insert under a deleted parent, or a keyed entry that lost the
        // race, arrives already tombstoned.
        delete_item(store, txn, id);
    }
}

/// Walk a key's chain to its leftmost entry.
fn leftmost_map_entry(store: &DocStore, parent: TypeRef, sub: &str) -> Option<Id> {
    let mut cur = store.branch(parent).map.get(sub).copied();
    while let Some(c) = cur {
        match store.item(c).left {
            Some(l) => cur = Some(l),
            None => break,
        }
    }
    return cur;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_str_len_counts_chars() {
        let content = Content::Str("héllo".to_string());
        assert_eq!(content.len(), 5);
    }

    #[test]
    fn content_str_split_respects_char_boundaries() {
        let mut content = Content::Str("héllo".to_string());
        let right = content.split_off(2);
        assert_eq!(content, Content::Str("hé".to_string()));
        assert_eq!(right, Content::Str("llo".to_string()));
    }

    #[test]
    fn content_embed_split() {
        let mut content = Content::Embed(vec![Value::from(1), Value::from(2), Value::from(3)]);
        let right = content.split_off(1);
        assert_eq!(content.len(), 1);
        assert_eq!(right.len(), 2);
    }

    #[test]
    fn content_deleted_split_and_merge() {
        let mut content = Content::Deleted(10);
        let right = content.split_off(4);
        assert_eq!(content, Content::Deleted(4));
        assert_eq!(right, Content::Deleted(6));

        let mut left = content;
        left.merge(right);
        assert_eq!(left, Content::Deleted(10));
    }

    #[test]
    fn content_str_merge() {
        let mut left = Content::Str("ab".to_string());
        left.merge(Content::Str("cd".to_string()));
        assert_eq!(left, Content::Str("abcd".to_string()));
    }

    #[test]
    fn mergeable_only_within_variant() {
        let s = Content::Str("a".to_string());
        let e = Content::Embed(vec![Value::from(1)]);
        let d = Content::Deleted(1);

        assert!(s.mergeable_with(&Content::Str("b".to_string())));
        assert!(!s.mergeable_with(&e));
        assert!(!e.mergeable_with(&d));
        assert!(d.mergeable_with(&Content::Deleted(2)));
    }

    #[test]
    fn item_last_id() {
        let item = Item {
            id: Id::new(1, 10),
            len: 5,
            origin: None,
            right_origin: None,
            left: None,
            right: None,
            parent: TypeRef(0),
            parent_sub: None,
            deleted: false,
            content: Content::Deleted(5),
        };
        assert_eq!(item.last_id(), Id::new(1, 14));
        assert!(item.contains(Id::new(1, 10)));
        assert!(item.contains(Id::new(1, 14)));
        assert!(!item.contains(Id::new(1, 15)));
        assert!(!item.contains(Id::new(2, 12)));
    }

    #[test]
    fn slot_end_is_exclusive() {
        let slot = Slot::Gc(GcSlot {
            id: Id::new(3, 4),
            len: 6,
        });
        assert_eq!(slot.end(), 10);
        assert!(slot.is_gc());
        assert!(slot.is_deleted());
    }
}
