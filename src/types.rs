// model = "claude-opus-4-5"
// created = "2026-08-02"
// modified = "2026-08-02"
// driver = "Isaac Clayton"

//! Reference front ends over the engine core.
//!
//! `TextRef` is a sequence of string chunks; `MapRef` is a keyed map of
//! JSON values where the highest `(client, clock)` writer wins. They are
//! deliberately small: enough surface to drive the engine end to end and
//! to show front-end authors the intended contract. Mutations thread a
//! `&mut Transaction`; reads borrow the document and happen between
//! transactions.
//!
//! `RelativePosition` is the stable-cursor boundary format: a position
//! anchored to a unit id rather than an index, so it survives concurrent
//! editing and can be resolved back to an index on any replica.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;

use crate::block::Content;
use crate::branch::Branch;
use crate::branch::Event;
use crate::branch::Subscription;
use crate::branch::TypeRef;
use crate::doc::Doc;
use crate::encoding::DecodeError;
use crate::encoding::Decoder;
use crate::encoding::Encoder;
use crate::id::Id;
use crate::store::DocStore;
use crate::txn::Transaction;

// =============================================================================
// Text
// =============================================================================

/// A collaborative sequence of string chunks.
#[derive(Clone)]
pub struct TextRef {
    doc: Doc,
    branch: TypeRef,
}

impl Doc {
    /// Fetch or create the root text registered under `name`.
    pub fn get_text(&self, name: &str) -> TextRef {
        let branch = self.inner.borrow_mut().store.root(name);
        return TextRef {
            doc: self.clone(),
            branch,
        };
    }

    /// Fetch or create the root map registered under `name`.
    pub fn get_map(&self, name: &str) -> MapRef {
        let branch = self.inner.borrow_mut().store.root(name);
        return MapRef {
            doc: self.clone(),
            branch,
        };
    }
}

impl TextRef {
    /// Insert `text` at the visible character `index`.
    pub fn insert(&self, txn: &mut Transaction, index: u32, text: &str) {
        if text.is_empty() {
            return;
        }
        let (origin, right_origin) = find_position(txn.store, self.branch, index);
        txn.create_item(
            self.branch,
            None,
            origin,
            right_origin,
            Content::Str(text.to_string()),
        );
    }

    /// Append at the end.
    pub fn push(&self, txn: &mut Transaction, text: &str) {
        let index = text_len(txn.store, self.branch);
        self.insert(txn, index, text);
    }

    /// Delete `len` visible characters starting at `index`.
    pub fn remove_range(&self, txn: &mut Transaction, index: u32, len: u32) {
        if len == 0 {
            return;
        }
        let mut remaining = len;
        let mut skip = index;
        let mut cur = txn.store.branch(self.branch).start;
        while let Some(c) = cur {
            if remaining == 0 {
                break;
            }
            let (deleted, ilen, right) = {
                let item = txn.store.item(c);
                (item.deleted, item.len, item.right)
            };
            if deleted {
                cur = right;
                continue;
            }
            if skip >= ilen {
                skip -= ilen;
                cur = right;
                continue;
            }

            // This struct holds the next character to delete.
            let start_unit = Id::new(c.client, c.clock + skip);
            let target = if skip > 0 {
                txn.store.get_clean_start(&mut txn.state, start_unit)
            } else {
                c
            };
            let tail = txn.store.item(target).len;
            if tail > remaining {
                // Keep the surviving suffix.
                txn.store.get_clean_start(
                    &mut txn.state,
                    Id::new(start_unit.client, start_unit.clock + remaining),
                );
            }
            let (dlen, next) = {
                let item = txn.store.item(target);
                (item.len, item.right)
            };
            txn.delete(target);
            remaining -= dlen;
            skip = 0;
            cur = next;
        }
        assert!(remaining == 0, "delete range exceeds the text length");
    }

    /// The number of visible characters.
    pub fn len(&self) -> u32 {
        let inner = self.doc.inner.borrow();
        return text_len(&inner.store, self.branch);
    }

    /// Check whether no visible characters remain.
    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }

    /// Collect the visible characters into a string.
    pub fn get_string(&self) -> String {
        let inner = self.doc.inner.borrow();
        let store = &inner.store;
        let mut out = String::new();
        let mut cur = store.branch(self.branch).start;
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

    /// Register an observer called once per transaction that changed this
    /// type.
    pub fn observe(&self, f: impl FnMut(&Event) + 'static) -> Subscription {
        let id = self.doc.fresh_sub_id();
        let mut inner = self.doc.inner.borrow_mut();
        inner
            .store
            .branch_mut(self.branch)
            .observers
            .push((id, Rc::new(RefCell::new(f))));
        return Subscription(id);
    }

    /// Register an observer over this type and all nested types.
    pub fn observe_deep(&self, f: impl FnMut(&[Event]) + 'static) -> Subscription {
        let id = self.doc.fresh_sub_id();
        let mut inner = self.doc.inner.borrow_mut();
        inner
            .store
            .branch_mut(self.branch)
            .deep_observers
            .push((id, Rc::new(RefCell::new(f))));
        return Subscription(id);
    }

    /// Remove an observer registered on this type.
    pub fn unobserve(&self, sub: Subscription) -> bool {
        let mut inner = self.doc.inner.borrow_mut();
        let branch = inner.store.branch_mut(self.branch);
        let before = branch.observers.len() + branch.deep_observers.len();
        branch.observers.retain(|(id, _)| *id != sub.0);
        branch.deep_observers.retain(|(id, _)| *id != sub.0);
        return branch.observers.len() + branch.deep_observers.len() != before;
    }

    /// Create a stable position anchored at `index`.
    pub fn position_at(&self, index: u32, assoc: Assoc) -> RelativePosition {
        let inner = self.doc.inner.borrow();
        let store = &inner.store;
        let scope = scope_of(store, self.branch);
        let item = match assoc {
            Assoc::After => unit_at(store, self.branch, index),
            Assoc::Before => {
                if index == 0 {
                    None
                } else {
                    unit_at(store, self.branch, index - 1)
                }
            }
        };
        return RelativePosition { scope, item, assoc };
    }
}

impl std::fmt::Debug for TextRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "TextRef({:?})", self.branch);
    }
}

/// Total visible length of a sequence branch.
fn text_len(store: &DocStore, branch: TypeRef) -> u32 {
    let mut len = 0;
    let mut cur = store.branch(branch).start;
    while let Some(c) = cur {
        let item = store.item(c);
        if !item.deleted {
            len += item.len;
        }
        cur = item.right;
    }
    return len;
}

/// Origins for an insert at a visible index: the unit just before it and
/// the unit currently at it.
fn find_position(store: &DocStore, branch: TypeRef, index: u32) -> (Option<Id>, Option<Id>) {
    let mut remaining = index;
    let mut last_visible: Option<Id> = None;
    let mut cur = store.branch(branch).start;
    while let Some(c) = cur {
        let item = store.item(c);
        if !item.deleted {
            if remaining < item.len {
                if remaining == 0 {
                    return (last_visible, Some(item.id));
                }
                return (
                    Some(Id::new(item.id.client, item.id.clock + remaining - 1)),
                    Some(Id::new(item.id.client, item.id.clock + remaining)),
                );
            }
            remaining -= item.len;
            last_visible = Some(item.last_id());
        }
        cur = item.right;
    }
    assert!(remaining == 0, "insert index out of bounds");
    return (last_visible, None);
}

/// The id of the visible unit at `index`, or None past the end.
fn unit_at(store: &DocStore, branch: TypeRef, index: u32) -> Option<Id> {
    let mut remaining = index;
    let mut cur = store.branch(branch).start;
    while let Some(c) = cur {
        let item = store.item(c);
        if !item.deleted {
            if remaining < item.len {
                return Some(Id::new(item.id.client, item.id.clock + remaining));
            }
            remaining -= item.len;
        }
        cur = item.right;
    }
    return None;
}

// =============================================================================
// Map
// =============================================================================

/// A collaborative map of JSON values. Concurrent writes to one key keep
/// the entry of the writer with the higher `(client, clock)`; the loser
/// stays tombstoned in the log.
#[derive(Clone)]
pub struct MapRef {
    doc: Doc,
    branch: TypeRef,
}

impl MapRef {
    /// Set `key` to a JSON value.
    pub fn set(&self, txn: &mut Transaction, key: &str, value: Value) {
        let origin = current_entry_origin(txn.store, self.branch, key);
        txn.create_item(
            self.branch,
            Some(key.to_string()),
            origin,
            None,
            Content::Embed(vec![value]),
        );
    }

    /// Create a nested text under `key`, replacing any current value.
    pub fn set_text(&self, txn: &mut Transaction, key: &str) -> TextRef {
        let origin = current_entry_origin(txn.store, self.branch, key);
        let id = txn.store.next_id();
        let nested = txn.store.alloc_branch(Branch::nested(id));
        txn.create_item(
            self.branch,
            Some(key.to_string()),
            origin,
            None,
            Content::Type(nested),
        );
        return TextRef {
            doc: self.doc.clone(),
            branch: nested,
        };
    }

    /// The current value under `key`, if any.
    pub fn get(&self, key: &str) -> Option<Value> {
        let inner = self.doc.inner.borrow();
        let store = &inner.store;
        let entry = store.branch(self.branch).map.get(key).copied()?;
        let item = store.item(entry);
        if item.deleted {
            return None;
        }
        match &item.content {
            Content::Embed(values) => return values.last().cloned(),
            _ => return None,
        }
    }

    /// The nested text under `key`, if the current value is one.
    pub fn get_text(&self, key: &str) -> Option<TextRef> {
        let inner = self.doc.inner.borrow();
        let store = &inner.store;
        let entry = store.branch(self.branch).map.get(key).copied()?;
        let item = store.item(entry);
        if item.deleted {
            return None;
        }
        match item.content {
            Content::Type(nested) => {
                return Some(TextRef {
                    doc: self.doc.clone(),
                    branch: nested,
                })
            }
            _ => return None,
        }
    }

    /// Remove `key`. Returns whether an entry was live.
    pub fn remove(&self, txn: &mut Transaction, key: &str) -> bool {
        let entry = {
            let branch = txn.store.branch(self.branch);
            branch.map.get(key).copied()
        };
        match entry {
            Some(entry) if !txn.store.item(entry).deleted => {
                txn.delete(entry);
                return true;
            }
            _ => return false,
        }
    }

    /// Check whether `key` has a live entry.
    pub fn contains_key(&self, key: &str) -> bool {
        let inner = self.doc.inner.borrow();
        let store = &inner.store;
        return store
            .branch(self.branch)
            .map
            .get(key)
            .map(|entry| !store.item(*entry).deleted)
            .unwrap_or(false);
    }

    /// Number of live entries.
    pub fn len(&self) -> u32 {
        let inner = self.doc.inner.borrow();
        let store = &inner.store;
        return store
            .branch(self.branch)
            .map
            .values()
            .filter(|entry| !store.item(**entry).deleted)
            .count() as u32;
    }

    /// Check whether no live entries remain.
    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }

    /// Live keys, sorted for deterministic iteration.
    pub fn keys(&self) -> Vec<String> {
        let inner = self.doc.inner.borrow();
        let store = &inner.store;
        let mut keys: Vec<String> = store
            .branch(self.branch)
            .map
            .iter()
            .filter(|(_, entry)| !store.item(**entry).deleted)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort_unstable();
        return keys;
    }

    /// Snapshot the live entries as a JSON object. Nested texts render as
    /// strings.
    pub fn to_json(&self) -> Value {
        let mut object = serde_json::Map::new();
        for key in self.keys() {
            if let Some(value) = self.get(&key) {
                object.insert(key, value);
            } else if let Some(text) = self.get_text(&key) {
                object.insert(key, Value::String(text.get_string()));
            }
        }
        return Value::Object(object);
    }

    /// Register an observer called once per transaction that changed this
    /// type.
    pub fn observe(&self, f: impl FnMut(&Event) + 'static) -> Subscription {
        let id = self.doc.fresh_sub_id();
        let mut inner = self.doc.inner.borrow_mut();
        inner
            .store
            .branch_mut(self.branch)
            .observers
            .push((id, Rc::new(RefCell::new(f))));
        return Subscription(id);
    }

    /// Register an observer over this type and all nested types.
    pub fn observe_deep(&self, f: impl FnMut(&[Event]) + 'static) -> Subscription {
        let id = self.doc.fresh_sub_id();
        let mut inner = self.doc.inner.borrow_mut();
        inner
            .store
            .branch_mut(self.branch)
            .deep_observers
            .push((id, Rc::new(RefCell::new(f))));
        return Subscription(id);
    }

    /// Remove an observer registered on this type.
    pub fn unobserve(&self, sub: Subscription) -> bool {
        let mut inner = self.doc.inner.borrow_mut();
        let branch = inner.store.branch_mut(self.branch);
        let before = branch.observers.len() + branch.deep_observers.len();
        branch.observers.retain(|(id, _)| *id != sub.0);
        branch.deep_observers.retain(|(id, _)| *id != sub.0);
        return branch.observers.len() + branch.deep_observers.len() != before;
    }
}

impl std::fmt::Debug for MapRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "MapRef({:?})", self.branch);
    }
}

/// Origin anchoring a new map entry to the key's current entry.
fn current_entry_origin(store: &DocStore, branch: TypeRef, key: &str) -> Option<Id> {
    return store
        .branch(branch)
        .map
        .get(key)
        .map(|entry| store.item(*entry).last_id());
}

// =============================================================================
// Relative positions
// =============================================================================

/// Which side of the anchor a position sticks to across concurrent
/// inserts at the same spot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Assoc {
    Before,
    After,
}

/// The shared type a relative position lives in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PositionScope {
    /// A root type, by its registered name.
    Root(String),
    /// A nested type, by the id of its defining item.
    Nested(Id),
}

/// A position anchored to a unit id instead of an index.
///
/// Indices shift under concurrent editing; unit ids never do. A relative
/// position created on one replica resolves to the equivalent index on
/// any replica that has the anchor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelativePosition {
    pub scope: PositionScope,
    /// The anchor unit. None anchors to the start (`Before`) or the end
    /// (`After`) of the sequence.
    pub item: Option<Id>,
    pub assoc: Assoc,
}

impl RelativePosition {
    /// Resolve to the current visible index on this document, or None if
    /// the scope is unknown here.
    pub fn resolve(&self, doc: &Doc) -> Option<u32> {
        let inner = doc.inner.borrow();
        let store = &inner.store;
        let branch = match &self.scope {
            PositionScope::Root(name) => *store.roots.get(name)?,
            PositionScope::Nested(id) => {
                if id.clock >= store.structs.get_state(id.client) {
                    return None;
                }
                match store.slot(*id).as_item()?.content {
                    Content::Type(t) => t,
                    _ => return None,
                }
            }
        };
        let anchor = match self.item {
            None => match self.assoc {
                Assoc::Before => return Some(0),
                Assoc::After => return Some(text_len(store, branch)),
            },
            Some(anchor) => anchor,
        };

        // Count visible units strictly before the anchor unit.
        let mut base = 0u32;
        let mut anchor_visible = 0u32;
        let mut cur = store.branch(branch).start;
        while let Some(c) = cur {
            let item = store.item(c);
            if item.contains(anchor) {
                if !item.deleted {
                    base += anchor.clock - item.id.clock;
                    anchor_visible = 1;
                }
                let index = match self.assoc {
                    Assoc::After => base,
                    Assoc::Before => base + anchor_visible,
                };
                return Some(index);
            }
            if !item.deleted {
                base += item.len;
            }
            cur = item.right;
        }
        return None;
    }

    /// Encode for transport or persistence.
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match &self.scope {
            PositionScope::Root(name) => {
                enc.write_var(0);
                enc.write_string(name);
            }
            PositionScope::Nested(id) => {
                enc.write_var(1);
                enc.write_id(*id);
            }
        }
        match self.item {
            Some(id) => {
                enc.write_u8(1);
                enc.write_id(id);
            }
            None => enc.write_u8(0),
        }
        enc.write_u8(match self.assoc {
            Assoc::Before => 0,
            Assoc::After => 1,
        });
        return enc.finish();
    }

    /// Decode a position written by `encode`.
    pub fn decode(bytes: &[u8]) -> Result<RelativePosition, DecodeError> {
        let mut dec = Decoder::new(bytes);
        let scope = match dec.read_var()? {
            0 => PositionScope::Root(dec.read_string()?),
            1 => PositionScope::Nested(dec.read_id()?),
            other => return Err(DecodeError::UnknownParentKind(other)),
        };
        let item = match dec.read_u8()? {
            0 => None,
            _ => Some(dec.read_id()?),
        };
        let assoc = match dec.read_u8()? {
            0 => Assoc::Before,
            _ => Assoc::After,
        };
        return Ok(RelativePosition { scope, item, assoc });
    }
}

/// The scope describing `branch` for a relative position.
fn scope_of(store: &DocStore, branch: TypeRef) -> PositionScope {
    let b = store.branch(branch);
    if b.is_root() {
        return PositionScope::Root(b.name.clone().unwrap_or_default());
    }
    return PositionScope::Nested(b.item.expect("nested branches keep their item"));
}
