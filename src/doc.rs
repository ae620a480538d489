// model = "claude-opus-4-5"
// created = "2026-08-02"
// modified = "2026-08-02"
// driver = "Isaac Clayton"

//! The document: owner of the store, the branch arena, and the observers.
//!
//! A `Doc` is a cheap cloneable handle over shared document state. All
//! mutation goes through `transact`: the body runs with exclusive access,
//! and when the outermost call returns, queued transactions are processed
//! strictly in order. Observers run only between transactions; an
//! observer that mutates the document enqueues a new transaction which
//! the outermost frame picks up next, so delivery never recurses.
//!
//! Remote updates enter through `apply_update`; local changes leave
//! through the `update` event or an explicit `encode_state_as_update`
//! diff against a remote state vector.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::panic::catch_unwind;
use std::panic::resume_unwind;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use log::debug;

use crate::branch::DeepHandler;
use crate::branch::Event;
use crate::branch::ShallowHandler;
use crate::branch::Subscription;
use crate::branch::TypeRef;
use crate::delete_set::DeleteSet;
use crate::encoding::DecodeError;
use crate::id::ClientId;
use crate::store::DocStore;
use crate::store::StateVector;
use crate::txn::run_gc_pass;
use crate::txn::run_merge_passes;
use crate::txn::Transaction;
use crate::txn::TxnState;
use crate::update::decode_update;
use crate::update::encode_update;
use crate::update::integrate_update;

// =============================================================================
// Events
// =============================================================================

/// Payload of the document-level transaction hooks.
#[derive(Clone, Debug)]
pub struct TransactionEvent {
    /// The origin tag the transaction was opened with.
    pub origin: Option<String>,
    /// State vector when the transaction opened.
    pub before_state: StateVector,
    /// State vector when the transaction closed. Empty for the
    /// `before_transaction` hook.
    pub after_state: StateVector,
}

/// Payload of the `update` event: the encoded message for this
/// transaction's changes.
#[derive(Clone, Debug)]
pub struct UpdateEvent {
    pub origin: Option<String>,
    pub update: Vec<u8>,
}

type Handler<T> = Rc<RefCell<dyn FnMut(&T)>>;

struct HandlerList<T> {
    entries: Vec<(u32, Handler<T>)>,
}

impl<T> HandlerList<T> {
    fn new() -> HandlerList<T> {
        return HandlerList {
            entries: Vec::new(),
        };
    }

    fn add(&mut self, id: u32, handler: Handler<T>) {
        self.entries.push((id, handler));
    }

    fn remove(&mut self, id: u32) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        return self.entries.len() != before;
    }

    fn snapshot(&self) -> Vec<Handler<T>> {
        return self.entries.iter().map(|(_, h)| h.clone()).collect();
    }

    fn is_empty(&self) -> bool {
        return self.entries.is_empty();
    }
}

// =============================================================================
// Document
// =============================================================================

pub(crate) struct DocInner {
    pub store: DocStore,
    cleanup_queue: VecDeque<TxnState>,
    cleanup_active: bool,
    next_sub: u32,
    on_before_transaction: HandlerList<TransactionEvent>,
    on_before_observer_calls: HandlerList<TransactionEvent>,
    on_after_transaction: HandlerList<TransactionEvent>,
    on_after_transaction_cleanup: HandlerList<TransactionEvent>,
    on_update: HandlerList<UpdateEvent>,
}

/// A shared document replica.
///
/// Clones share the same state; the handle is single-threaded. Mutations
/// happen inside `transact`; reading is always allowed between
/// transactions. Calling `transact` from inside a transaction body is a
/// programmer error (the body already has exclusive access); calling it
/// from an observer is fine and queues the work.
#[derive(Clone)]
pub struct Doc {
    pub(crate) inner: Rc<RefCell<DocInner>>,
}

impl Doc {
    /// Create a document with a random client id.
    pub fn new() -> Doc {
        let client = loop {
            let c = rand::random::<u32>();
            if c != 0 {
                break c;
            }
        };
        return Doc::with_client_id(client as ClientId);
    }

    /// Create a document with an explicit client id. Useful for tests;
    /// colliding ids across live replicas break convergence.
    pub fn with_client_id(client_id: ClientId) -> Doc {
        assert!(client_id != 0, "client id must be positive");
        return Doc {
            inner: Rc::new(RefCell::new(DocInner {
                store: DocStore::new(client_id),
                cleanup_queue: VecDeque::new(),
                cleanup_active: false,
                next_sub: 0,
                on_before_transaction: HandlerList::new(),
                on_before_observer_calls: HandlerList::new(),
                on_after_transaction: HandlerList::new(),
                on_after_transaction_cleanup: HandlerList::new(),
                on_update: HandlerList::new(),
            })),
        };
    }

    /// This replica's client id.
    pub fn client_id(&self) -> ClientId {
        return self.inner.borrow().store.client_id;
    }

    // -- transactions ---------------------------------------------------------

    /// Run `f` inside a transaction and process the cleanup queue.
    pub fn transact<R>(&self, f: impl FnOnce(&mut Transaction) -> R) -> R {
        return self.transact_impl(None, f);
    }

    /// Like `transact`, with an origin tag forwarded to observers.
    pub fn transact_with<R>(&self, origin: &str, f: impl FnOnce(&mut Transaction) -> R) -> R {
        return self.transact_impl(Some(origin.to_string()), f);
    }

    fn transact_impl<R>(&self, origin: Option<String>, f: impl FnOnce(&mut Transaction) -> R) -> R {
        let open_ev = {
            let inner = self.inner.borrow();
            TransactionEvent {
                origin: origin.clone(),
                before_state: inner.store.structs.state_vector(),
                after_state: StateVector::new(),
            }
        };
        let handlers = self.inner.borrow().on_before_transaction.snapshot();
        for handler in handlers {
            (handler.borrow_mut())(&open_ev);
        }

        // The body runs under catch_unwind so cleanup happens for the
        // mutations already committed even when the caller panics.
        let result = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            let mut txn = Transaction {
                store: &mut inner.store,
                state: TxnState::new(origin, open_ev.before_state.clone()),
            };
            let result = catch_unwind(AssertUnwindSafe(|| f(&mut txn)));
            let Transaction { state, .. } = txn;
            inner.cleanup_queue.push_back(state);
            result
        };

        // Only the outermost frame drains the queue; transactions opened
        // by observers wait their turn here.
        let outermost = !self.inner.borrow().cleanup_active;
        if outermost {
            self.process_cleanups();
        }

        match result {
            Ok(value) => return value,
            Err(panic) => resume_unwind(panic),
        }
    }

    fn process_cleanups(&self) {
        self.inner.borrow_mut().cleanup_active = true;
        loop {
            let state = self.inner.borrow_mut().cleanup_queue.pop_front();
            match state {
                Some(state) => self.cleanup_one(state),
                None => break,
            }
        }
        self.inner.borrow_mut().cleanup_active = false;
    }

    fn cleanup_one(&self, mut state: TxnState) {
        // Close the transaction: canonicalize the delete set, snapshot the
        // after state, and collect observer work while the borrow is held.
        let (shallow, deep, base_ev) = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            state.delete_set.sort_and_merge();
            state.after_state = inner.store.structs.state_vector();
            let ev = TransactionEvent {
                origin: state.origin.clone(),
                before_state: state.before_state.clone(),
                after_state: state.after_state.clone(),
            };

            let mut shallow: Vec<(ShallowHandler, Event)> = Vec::new();
            let mut deep_events: BTreeMap<TypeRef, Vec<Event>> = BTreeMap::new();
            let mut changed: Vec<(TypeRef, Vec<Option<String>>)> = state
                .changed
                .iter()
                .map(|(tref, subs)| (*tref, subs.iter().cloned().collect()))
                .collect();
            changed.sort_by_key(|(tref, _)| *tref);

            for (tref, keys) in changed {
                let branch = inner.store.branch(tref);
                let alive = match branch.item {
                    None => true,
                    Some(bid) => !inner.store.slot(bid).is_deleted(),
                };
                if !alive {
                    continue;
                }
                let event = Event {
                    target: tref,
                    keys,
                    origin: state.origin.clone(),
                };
                for (_, handler) in &branch.observers {
                    shallow.push((handler.clone(), event.clone()));
                }
                // Bubble the event up the ancestor chain for observe_deep.
                let mut cur = Some(tref);
                while let Some(t) = cur {
                    deep_events.entry(t).or_default().push(event.clone());
                    cur = match inner.store.branch(t).item {
                        Some(bid) => inner
                            .store
                            .slot(bid)
                            .as_item()
                            .map(|item| item.parent),
                        None => None,
                    };
                }
            }

            let mut deep: Vec<(DeepHandler, Vec<Event>)> = Vec::new();
            for (tref, events) in deep_events {
                for (_, handler) in &inner.store.branch(tref).deep_observers {
                    deep.push((handler.clone(), events.clone()));
                }
            }
            (shallow, deep, ev)
        };

        // Observers run with no borrow held and no open transaction; a
        // mutation here opens a fresh transaction onto the queue.
        let handlers = self.inner.borrow().on_before_observer_calls.snapshot();
        for handler in handlers {
            (handler.borrow_mut())(&base_ev);
        }
        for (handler, event) in shallow {
            (handler.borrow_mut())(&event);
        }
        for (handler, events) in deep {
            (handler.borrow_mut())(&events);
        }
        let handlers = self.inner.borrow().on_after_transaction.snapshot();
        for handler in handlers {
            (handler.borrow_mut())(&base_ev);
        }

        // Compaction: collapse tombstones, then merge adjacent structs.
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            run_gc_pass(&mut inner.store, &state.delete_set);
            run_merge_passes(&mut inner.store, &state);
        }

        let handlers = self.inner.borrow().on_after_transaction_cleanup.snapshot();
        for handler in handlers {
            (handler.borrow_mut())(&base_ev);
        }

        // Emit the encoded update, but only if something actually changed.
        let update_handlers = self.inner.borrow().on_update.snapshot();
        if !update_handlers.is_empty()
            && (state.after_state != state.before_state || !state.delete_set.is_empty())
        {
            let bytes = {
                let inner = self.inner.borrow();
                encode_update(&inner.store, &state.before_state, &state.delete_set)
            };
            debug!("emitting update of {} bytes", bytes.len());
            let event = UpdateEvent {
                origin: state.origin,
                update: bytes,
            };
            for handler in update_handlers {
                (handler.borrow_mut())(&event);
            }
        }
    }

    // -- remote updates -------------------------------------------------------

    /// Decode and apply a remote update message.
    ///
    /// Decoding happens before any mutation, so a malformed message leaves
    /// the store untouched. Structs whose dependencies are missing are
    /// parked and resumed when a later update fills the gap.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DecodeError> {
        return self.apply_update_impl(None, update);
    }

    /// Like `apply_update`, with an origin tag forwarded to observers.
    pub fn apply_update_with(&self, origin: &str, update: &[u8]) -> Result<(), DecodeError> {
        return self.apply_update_impl(Some(origin.to_string()), update);
    }

    fn apply_update_impl(&self, origin: Option<String>, update: &[u8]) -> Result<(), DecodeError> {
        debug!("applying update of {} bytes", update.len());
        let msg = decode_update(update)?;
        return self.transact_impl(origin, |txn| {
            return integrate_update(&mut *txn.store, &mut txn.state, msg);
        });
    }

    // -- state sync -----------------------------------------------------------

    /// Snapshot the state vector.
    pub fn state_vector(&self) -> StateVector {
        return self.inner.borrow().store.structs.state_vector();
    }

    /// Encode the state vector for a sync handshake.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        return self.state_vector().encode();
    }

    /// Encode everything the remote is missing, given its state vector.
    /// Pass an empty vector to encode the full document.
    pub fn encode_state_as_update(&self, remote: &StateVector) -> Vec<u8> {
        let inner = self.inner.borrow();
        let ds = DeleteSet::from_store(&inner.store.structs);
        return encode_update(&inner.store, remote, &ds);
    }

    /// Verify the struct store invariants. Panics on violation.
    pub fn check_integrity(&self) {
        self.inner.borrow().store.structs.integrity_check();
    }

    // -- document events ------------------------------------------------------

    /// Observe encoded updates produced by transactions.
    pub fn on_update(&self, f: impl FnMut(&UpdateEvent) + 'static) -> Subscription {
        let mut inner = self.inner.borrow_mut();
        let id = inner.fresh_sub();
        inner.on_update.add(id, Rc::new(RefCell::new(f)));
        return Subscription(id);
    }

    /// Observe transaction opens.
    pub fn on_before_transaction(
        &self,
        f: impl FnMut(&TransactionEvent) + 'static,
    ) -> Subscription {
        let mut inner = self.inner.borrow_mut();
        let id = inner.fresh_sub();
        inner.on_before_transaction.add(id, Rc::new(RefCell::new(f)));
        return Subscription(id);
    }

    /// Observe the moment just before observers run.
    pub fn on_before_observer_calls(
        &self,
        f: impl FnMut(&TransactionEvent) + 'static,
    ) -> Subscription {
        let mut inner = self.inner.borrow_mut();
        let id = inner.fresh_sub();
        inner
            .on_before_observer_calls
            .add(id, Rc::new(RefCell::new(f)));
        return Subscription(id);
    }

    /// Observe transaction closes, after observers and before compaction.
    pub fn on_after_transaction(&self, f: impl FnMut(&TransactionEvent) + 'static) -> Subscription {
        let mut inner = self.inner.borrow_mut();
        let id = inner.fresh_sub();
        inner.on_after_transaction.add(id, Rc::new(RefCell::new(f)));
        return Subscription(id);
    }

    /// Observe the end of cleanup, after compaction.
    pub fn on_after_transaction_cleanup(
        &self,
        f: impl FnMut(&TransactionEvent) + 'static,
    ) -> Subscription {
        let mut inner = self.inner.borrow_mut();
        let id = inner.fresh_sub();
        inner
            .on_after_transaction_cleanup
            .add(id, Rc::new(RefCell::new(f)));
        return Subscription(id);
    }

    /// Remove a document-level handler.
    pub fn unsubscribe(&self, sub: Subscription) -> bool {
        let mut inner = self.inner.borrow_mut();
        return inner.on_update.remove(sub.0)
            || inner.on_before_transaction.remove(sub.0)
            || inner.on_before_observer_calls.remove(sub.0)
            || inner.on_after_transaction.remove(sub.0)
            || inner.on_after_transaction_cleanup.remove(sub.0);
    }

    pub(crate) fn fresh_sub_id(&self) -> u32 {
        return self.inner.borrow_mut().fresh_sub();
    }
}

impl DocInner {
    fn fresh_sub(&mut self) -> u32 {
        let id = self.next_sub;
        self.next_sub += 1;
        return id;
    }
}

impl Default for Doc {
    fn default() -> Doc {
        return Doc::new();
    }
}

impl std::fmt::Debug for Doc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return f
            .debug_struct("Doc")
            .field("client_id", &self.client_id())
            .finish();
    }
}
