// model = "claude-opus-4-5"
// created = "2026-08-02"
// modified = "2026-08-02"
// driver = "Isaac Clayton"

//! Shared-type nodes.
//!
//! A `Branch` is the runtime node behind every shared type: it holds the
//! head of the sequence (for list-like reads), the latest item per sub-key
//! (for map-like reads), and the observer lists. Branches live in an arena
//! owned by the document; items refer to their parent branch by `TypeRef`
//! and branches refer back to their defining item by `Id`. Neither
//! direction owns the other, so the cyclic parent/child graph needs no
//! reference counting.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::id::Id;

/// An index into the document's branch arena.
///
/// A `TypeRef` stays valid for the lifetime of the document. Branches are
/// never removed from the arena, even when the item defining them is
/// garbage collected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeRef(pub(crate) u32);

/// A change notification delivered to observers after a transaction ends.
#[derive(Clone, Debug)]
pub struct Event {
    /// The shared type that changed.
    pub target: TypeRef,
    /// The changed sub-keys. `None` entries mean the sequence positions
    /// changed rather than a keyed entry.
    pub keys: Vec<Option<String>>,
    /// The origin tag the transaction was opened with.
    pub origin: Option<String>,
}

pub(crate) type ShallowHandler = Rc<RefCell<dyn FnMut(&Event)>>;
pub(crate) type DeepHandler = Rc<RefCell<dyn FnMut(&[Event])>>;

/// A handle returned from observer registration, used to unregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subscription(pub(crate) u32);

/// The runtime node behind a shared type.
pub(crate) struct Branch {
    /// The item whose content defines this type. None for root types.
    pub item: Option<Id>,
    /// The root name, for types registered directly on the document.
    pub name: Option<String>,
    /// First item of the sequence, in document order.
    pub start: Option<Id>,
    /// Latest item per sub-key. Older entries hang off the item's left
    /// chain, tombstoned.
    pub map: FxHashMap<String, Id>,
    /// Observers notified with one event per transaction.
    pub observers: Vec<(u32, ShallowHandler)>,
    /// Observers notified with the events of this type and all its
    /// descendants.
    pub deep_observers: Vec<(u32, DeepHandler)>,
}

impl Branch {
    /// Create a root branch registered under a document-level name.
    pub fn root(name: &str) -> Branch {
        return Branch {
            item: None,
            name: Some(name.to_string()),
            start: None,
            map: FxHashMap::default(),
            observers: Vec::new(),
            deep_observers: Vec::new(),
        };
    }

    /// Create a branch defined by a nested item.
    pub fn nested(item: Id) -> Branch {
        return Branch {
            item: Some(item),
            name: None,
            start: None,
            map: FxHashMap::default(),
            observers: Vec::new(),
            deep_observers: Vec::new(),
        };
    }

    /// Whether this branch is a document root.
    pub fn is_root(&self) -> bool {
        return self.item.is_none();
    }
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return f
            .debug_struct("Branch")
            .field("item", &self.item)
            .field("name", &self.name)
            .field("start", &self.start)
            .field("map", &self.map)
            .finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_branch_has_no_item() {
        let branch = Branch::root("text");
        assert!(branch.is_root());
        assert_eq!(branch.name.as_deref(), Some("text"));
        assert!(branch.start.is_none());
    }

    #[test]
    fn nested_branch_points_at_its_item() {
        let branch = Branch::nested(Id::new(1, 4));
        assert!(!branch.is_root());
        assert_eq!(branch.item, Some(Id::new(1, 4)));
        assert!(branch.name.is_none());
    }
}
