// model = "claude-opus-4-5"
// created = "2026-08-02"
// modified = "2026-08-02"
// driver = "Isaac Clayton"

//! Update messages: the wire format and the integration driver.
//!
//! An update message is a struct section followed by a delete-set section.
//! The struct section lists, per client, a contiguous run of structs
//! starting at some clock; receivers that already hold a prefix trim it
//! off, receivers that are missing earlier structs park the refs until
//! those arrive. Applying the same message any number of times, in any
//! order relative to other messages, converges to the same state.
//!
//! Decoding is a separate phase from integration: a malformed message
//! fails before the store is touched. Integration commits struct by
//! struct; refs whose dependencies are absent are parked per client
//! behind an index cursor and resumed when a later update fills the gap.

use log::debug;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::block::integrate_item;
use crate::block::Content;
use crate::block::GcSlot;
use crate::block::Item;
use crate::block::Slot;
use crate::block::TAG_DELETED;
use crate::block::TAG_EMBED;
use crate::block::TAG_GC;
use crate::block::TAG_STR;
use crate::block::TAG_TYPE;
use crate::branch::Branch;
use crate::delete_set::DeleteSet;
use crate::encoding::DecodeError;
use crate::encoding::Decoder;
use crate::encoding::Encoder;
use crate::id::ClientId;
use crate::id::Id;
use crate::store::DocStore;
use crate::store::StateVector;
use crate::store::StructStore;
use crate::txn::TxnState;

// =============================================================================
// Struct references
// =============================================================================

/// A decoded struct that has not been integrated yet.
#[derive(Clone, Debug)]
pub(crate) enum StructRef {
    Gc { id: Id, len: u32 },
    Item(Box<ItemRef>),
}

impl StructRef {
    pub fn id(&self) -> Id {
        match self {
            StructRef::Gc { id, .. } => return *id,
            StructRef::Item(item) => return item.id,
        }
    }

    pub fn len(&self) -> u32 {
        match self {
            StructRef::Gc { len, .. } => return *len,
            StructRef::Item(item) => return item.len,
        }
    }
}

/// A decoded item awaiting integration.
#[derive(Clone, Debug)]
pub(crate) struct ItemRef {
    pub id: Id,
    pub len: u32,
    pub origin: Option<Id>,
    pub right_origin: Option<Id>,
    /// Absent when both origins are present; the receiver derives the
    /// parent from a neighbor.
    pub parent: Option<ParentRef>,
    pub parent_sub: Option<String>,
    pub content: RefContent,
}

/// A parent reference as written on the wire.
#[derive(Clone, Debug)]
pub(crate) enum ParentRef {
    /// A root type registered by name on the document.
    Root(String),
    /// The id of the item whose content defines the parent type.
    Item(Id),
}

/// Content as decoded from the wire, before branch allocation.
#[derive(Clone, Debug)]
pub(crate) enum RefContent {
    Str(String),
    Embed(Vec<Value>),
    Type,
    Deleted(u32),
}

impl RefContent {
    fn len(&self) -> u32 {
        match self {
            RefContent::Str(s) => return s.chars().count() as u32,
            RefContent::Embed(values) => return values.len() as u32,
            RefContent::Type => return 1,
            RefContent::Deleted(len) => return *len,
        }
    }
}

/// Pending refs of one client, consumed through an index cursor so the
/// front of the array is never shifted.
#[derive(Debug, Default)]
pub(crate) struct RefQueue {
    pub i: usize,
    pub refs: Vec<StructRef>,
}

/// A fully decoded update message.
#[derive(Debug)]
pub(crate) struct UpdateMessage {
    pub refs: FxHashMap<ClientId, RefQueue>,
    pub delete_set: DeleteSet,
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode everything at or above `from`, plus the given delete set.
pub(crate) fn encode_update(store: &DocStore, from: &StateVector, ds: &DeleteSet) -> Vec<u8> {
    let mut enc = Encoder::new();
    write_structs(&mut enc, store, from);
    ds.encode(&mut enc);
    return enc.finish();
}

/// Write the struct section: for every client with structs the remote has
/// not seen, the count, the starting clock, and the structs themselves.
/// Clients ascend so any two replicas with equal state emit equal bytes.
fn write_structs(enc: &mut Encoder, store: &DocStore, from: &StateVector) {
    let mut clients: Vec<(ClientId, u32)> = store
        .structs
        .clients
        .keys()
        .map(|client| (*client, from.get(*client)))
        .filter(|(client, clock)| store.structs.get_state(*client) > *clock)
        .collect();
    clients.sort_unstable_by_key(|(client, _)| *client);

    enc.write_var(clients.len() as u64);
    for (client, clock) in clients {
        let structs = &store.structs.clients[&client];
        let start = StructStore::find_index(structs, clock);
        enc.write_var(client);
        enc.write_var((structs.len() - start) as u64);
        enc.write_var(clock as u64);
        let first_offset = clock - structs[start].id().clock;
        for (i, slot) in structs[start..].iter().enumerate() {
            let offset = if i == 0 { first_offset } else { 0 };
            slot.write(enc, offset, store);
        }
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a full update message. The store is untouched; integration is a
/// separate step.
pub(crate) fn decode_update(bytes: &[u8]) -> Result<UpdateMessage, DecodeError> {
    let mut dec = Decoder::new(bytes);
    let refs = read_structs(&mut dec)?;
    let delete_set = DeleteSet::decode(&mut dec)?;
    return Ok(UpdateMessage { refs, delete_set });
}

fn read_structs(dec: &mut Decoder<'_>) -> Result<FxHashMap<ClientId, RefQueue>, DecodeError> {
    let mut queues: FxHashMap<ClientId, RefQueue> = FxHashMap::default();
    let num_clients = dec.read_var()?;
    for _ in 0..num_clients {
        let client = dec.read_var()?;
        let num_structs = dec.read_var()?;
        let start_clock = dec.read_var_u32()?;

        let mut clock = start_clock;
        let queue = queues.entry(client).or_default();
        queue.refs.reserve(num_structs as usize);
        for _ in 0..num_structs {
            let id = Id::new(client, clock);
            let sref = read_struct(dec, id)?;
            if sref.len() == 0 {
                return Err(DecodeError::EmptyStruct(id));
            }
            clock = clock
                .checked_add(sref.len())
                .ok_or(DecodeError::RangeOverflow(id))?;
            queue.refs.push(sref);
        }
    }
    return Ok(queues);
}

fn read_struct(dec: &mut Decoder<'_>, id: Id) -> Result<StructRef, DecodeError> {
    let info = dec.read_u8()?;
    let tag = info & 0x1F;
    if tag == TAG_GC {
        let len = dec.read_var_u32()?;
        return Ok(StructRef::Gc { id, len });
    }

    let origin = if info & 0x80 != 0 {
        Some(dec.read_id()?)
    } else {
        None
    };
    let right_origin = if info & 0x40 != 0 {
        Some(dec.read_id()?)
    } else {
        None
    };
    let (parent, parent_sub) = if origin.is_none() && right_origin.is_none() {
        let parent = match dec.read_var()? {
            1 => ParentRef::Root(dec.read_string()?),
            0 => ParentRef::Item(dec.read_id()?),
            other => return Err(DecodeError::UnknownParentKind(other)),
        };
        let sub = if info & 0x20 != 0 {
            Some(dec.read_string()?)
        } else {
            None
        };
        (Some(parent), sub)
    } else {
        (None, None)
    };

    let content = match tag {
        TAG_DELETED => RefContent::Deleted(dec.read_var_u32()?),
        TAG_STR => RefContent::Str(dec.read_string()?),
        TAG_EMBED => {
            let count = dec.read_var()?;
            let mut values = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let json = dec.read_string()?;
                values.push(serde_json::from_str(&json)?);
            }
            RefContent::Embed(values)
        }
        TAG_TYPE => RefContent::Type,
        other => return Err(DecodeError::UnknownStructTag(other)),
    };

    let len = content.len();
    return Ok(StructRef::Item(Box::new(ItemRef {
        id,
        len,
        origin,
        right_origin,
        parent,
        parent_sub,
        content,
    })));
}

// =============================================================================
// Integration driver
// =============================================================================

/// Integrate a decoded update into the store.
///
/// Struct refs commit one at a time, in dependency order, with duplicates
/// skipped against the local state. Anything that cannot commit yet is
/// parked on the document and resumed by the next call. The delete set
/// applies last; ranges beyond the local state park as well.
pub(crate) fn integrate_update(
    store: &mut DocStore,
    txn: &mut TxnState,
    msg: UpdateMessage,
) -> Result<(), DecodeError> {
    integrate_refs(store, txn, msg.refs)?;
    apply_delete_set(store, txn, &msg.delete_set);

    // Structs that just arrived may unlock parked delete ranges.
    let parked = std::mem::take(&mut store.pending_ds);
    if !parked.is_empty() {
        apply_delete_set(store, txn, &parked);
    }
    return Ok(());
}

fn integrate_refs(
    store: &mut DocStore,
    txn: &mut TxnState,
    new_refs: FxHashMap<ClientId, RefQueue>,
) -> Result<(), DecodeError> {
    // Fold previously parked refs back in; the union is retried as one.
    let mut queues = std::mem::take(&mut store.pending_refs);
    for (client, queue) in new_refs {
        match queues.entry(client) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                entry.get_mut().refs.extend(queue.refs);
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(queue);
            }
        }
    }
    if queues.is_empty() {
        return Ok(());
    }
    // Consumption relies on per-client clock order; senders are not
    // required to provide it.
    for queue in queues.values_mut() {
        queue.refs.drain(..queue.i);
        queue.i = 0;
        queue.refs.sort_by_key(|sref| sref.id().clock);
    }

    let mut client_order: Vec<ClientId> = queues.keys().copied().collect();
    client_order.sort_unstable();

    let mut stack: Vec<StructRef> = Vec::new();
    loop {
        let sref = match stack.pop() {
            Some(sref) => sref,
            None => match take_next(&mut queues, &client_order) {
                Some(sref) => sref,
                None => break,
            },
        };
        let id = sref.id();
        let local = store.structs.get_state(id.client);

        if id.clock + sref.len() <= local {
            // Already known; duplicates are absorbed here.
            continue;
        }
        if id.clock > local {
            // A gap in the client's own sequence: everything from this
            // client waits for the missing prefix.
            park_client(store, &mut queues, id.client, sref);
            continue;
        }

        if let Some(missing) = missing_dep(store, &sref) {
            stack.push(sref);
            let pulled = queues
                .get_mut(&missing)
                .filter(|queue| queue.i < queue.refs.len())
                .map(|queue| {
                    let dep = queue.refs[queue.i].clone();
                    queue.i += 1;
                    return dep;
                });
            match pulled {
                Some(dep) => stack.push(dep),
                None => {
                    // Nothing pending from the missing client: the rest of
                    // this update cannot complete yet.
                    debug!(
                        "update incomplete: missing structs from client {}, parking {} refs",
                        missing,
                        stack.len()
                    );
                    park_all(store, stack, queues);
                    return Ok(());
                }
            }
            continue;
        }

        let offset = local - id.clock;
        integrate_ref(store, txn, sref, offset)?;
    }
    return Ok(());
}

/// Pull the next unconsumed ref, smallest client first.
fn take_next(
    queues: &mut FxHashMap<ClientId, RefQueue>,
    client_order: &[ClientId],
) -> Option<StructRef> {
    for client in client_order {
        if let Some(queue) = queues.get_mut(client) {
            if queue.i < queue.refs.len() {
                let sref = queue.refs[queue.i].clone();
                queue.i += 1;
                return Some(sref);
            }
        }
    }
    return None;
}

/// Park one client's current ref and queue tail on the document.
fn park_client(
    store: &mut DocStore,
    queues: &mut FxHashMap<ClientId, RefQueue>,
    client: ClientId,
    sref: StructRef,
) {
    let mut refs = vec![sref];
    if let Some(queue) = queues.remove(&client) {
        refs.extend(queue.refs.into_iter().skip(queue.i));
    }
    merge_into_pending(store, client, refs);
}

/// Park the dependency stack and every unconsumed ref.
fn park_all(store: &mut DocStore, stack: Vec<StructRef>, queues: FxHashMap<ClientId, RefQueue>) {
    for sref in stack {
        let client = sref.id().client;
        merge_into_pending(store, client, vec![sref]);
    }
    for (client, queue) in queues {
        let refs: Vec<StructRef> = queue.refs.into_iter().skip(queue.i).collect();
        if !refs.is_empty() {
            merge_into_pending(store, client, refs);
        }
    }
}

fn merge_into_pending(store: &mut DocStore, client: ClientId, refs: Vec<StructRef>) {
    let queue = store.pending_refs.entry(client).or_default();
    queue.refs.drain(..queue.i);
    queue.i = 0;
    queue.refs.extend(refs);
    queue.refs.sort_by_key(|sref| sref.id().clock);
}

/// First dependency whose client state is insufficient, if any.
///
/// Same-client dependencies need no check: refs of one client integrate
/// in clock order, so an earlier clock of the same client is either known
/// or the gap was caught before this point.
fn missing_dep(store: &DocStore, sref: &StructRef) -> Option<ClientId> {
    let StructRef::Item(item) = sref else {
        return None;
    };
    let deps = [
        item.origin,
        item.right_origin,
        match &item.parent {
            Some(ParentRef::Item(pid)) => Some(*pid),
            _ => None,
        },
    ];
    for dep in deps.into_iter().flatten() {
        if dep.client != item.id.client && dep.clock >= store.structs.get_state(dep.client) {
            return Some(dep.client);
        }
    }
    return None;
}

/// Commit one ref: trim the already-known prefix, resolve the parent, and
/// run the integration scan.
fn integrate_ref(
    store: &mut DocStore,
    txn: &mut TxnState,
    sref: StructRef,
    offset: u32,
) -> Result<(), DecodeError> {
    match sref {
        StructRef::Gc { id, len } => {
            store.push(Slot::Gc(GcSlot {
                id: Id::new(id.client, id.clock + offset),
                len: len - offset,
            }));
            return Ok(());
        }
        StructRef::Item(mut r) => {
            if offset > 0 {
                r.id.clock += offset;
                r.origin = Some(Id::new(r.id.client, r.id.clock - 1));
                r.len -= offset;
                match &mut r.content {
                    RefContent::Str(s) => {
                        let at = s
                            .char_indices()
                            .nth(offset as usize)
                            .map(|(i, _)| i)
                            .unwrap_or(s.len());
                        *s = s.split_off(at);
                    }
                    RefContent::Embed(values) => {
                        values.drain(..offset as usize);
                    }
                    RefContent::Deleted(len) => *len -= offset,
                    RefContent::Type => unreachable!("a type occupies a single unit"),
                }
            }

            // Corrupt input may name dependencies the sender could never
            // have had; a clean error beats a store panic.
            for dep in [r.origin, r.right_origin].into_iter().flatten() {
                if dep.clock >= store.structs.get_state(dep.client) {
                    return Err(DecodeError::DanglingDependency(r.id));
                }
            }
            if let Some(ParentRef::Item(pid)) = &r.parent {
                if pid.clock >= store.structs.get_state(pid.client) {
                    return Err(DecodeError::DanglingDependency(r.id));
                }
            }

            let (parent, parent_sub) = match r.parent.take() {
                Some(ParentRef::Root(name)) => (store.root(&name), r.parent_sub.take()),
                Some(ParentRef::Item(pid)) => match store.slot(pid) {
                    Slot::Item(item) => match item.content {
                        Content::Type(t) => (t, r.parent_sub.take()),
                        _ => {
                            // The parent type has been collapsed; only the
                            // interval survives.
                            store.push(Slot::Gc(GcSlot { id: r.id, len: r.len }));
                            return Ok(());
                        }
                    },
                    Slot::Gc(_) => {
                        store.push(Slot::Gc(GcSlot { id: r.id, len: r.len }));
                        return Ok(());
                    }
                },
                None => {
                    let probe = r
                        .origin
                        .or(r.right_origin)
                        .ok_or(DecodeError::MissingParent(r.id))?;
                    match store.slot(probe) {
                        Slot::Item(item) => (item.parent, item.parent_sub.clone()),
                        Slot::Gc(_) => {
                            store.push(Slot::Gc(GcSlot { id: r.id, len: r.len }));
                            return Ok(());
                        }
                    }
                }
            };

            let content = match r.content {
                RefContent::Str(s) => Content::Str(s),
                RefContent::Embed(values) => Content::Embed(values),
                RefContent::Deleted(len) => Content::Deleted(len),
                RefContent::Type => {
                    let tref = store.alloc_branch(Branch::nested(r.id));
                    Content::Type(tref)
                }
            };
            let item = Item {
                id: r.id,
                len: r.len,
                origin: r.origin,
                right_origin: r.right_origin,
                left: None,
                right: None,
                parent,
                parent_sub,
                deleted: false,
                content,
            };
            integrate_item(store, txn, item);
            return Ok(());
        }
    }
}

// =============================================================================
// Delete-set application
// =============================================================================

/// Apply remote delete ranges to the local structs.
///
/// Ranges below the local state split the boundary structs and tombstone
/// everything in between; the part of a range at or beyond the local
/// state parks on the document until the structs arrive.
pub(crate) fn apply_delete_set(store: &mut DocStore, txn: &mut TxnState, incoming: &DeleteSet) {
    let mut parked = 0usize;
    for (client, ranges) in incoming.iter() {
        for range in ranges {
            let state = store.structs.get_state(client);
            if range.clock >= state {
                store.pending_ds.add(client, range.clock, range.len);
                parked += 1;
                continue;
            }
            let end = range.end().min(state);

            // Clean boundary at the front of the range.
            {
                let structs = &store.structs.clients[&client];
                let i = StructStore::find_index(structs, range.clock);
                let slot = &structs[i];
                if slot.id().clock < range.clock && !slot.is_gc() {
                    let diff = range.clock - slot.id().clock;
                    store.split_at(txn, client, i, diff);
                }
            }

            let mut i = {
                let structs = &store.structs.clients[&client];
                StructStore::find_index(structs, range.clock)
            };
            loop {
                let (sid, slen, live) = {
                    let structs = &store.structs.clients[&client];
                    if i >= structs.len() {
                        break;
                    }
                    let slot = &structs[i];
                    if slot.id().clock >= end {
                        break;
                    }
                    let live = matches!(slot, Slot::Item(item) if !item.deleted);
                    (slot.id(), slot.len(), live)
                };
                if live {
                    if sid.clock + slen > end {
                        store.split_at(txn, client, i, end - sid.clock);
                    }
                    crate::block::delete_item(store, txn, sid);
                }
                i += 1;
            }

            if range.end() > state {
                store.pending_ds.add(client, state, range.end() - state);
                parked += 1;
            }
        }
    }
    if parked > 0 {
        debug!("parked {} delete ranges beyond the local state", parked);
    }
}
