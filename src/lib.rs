// model = "claude-opus-4-5"
// created = "2026-08-02"
// modified = "2026-08-02"
// driver = "Isaac Clayton"

//! Weft - an operation-based CRDT engine for collaborative documents.
//!
//! Multiple clients edit local replicas of shared state; changes travel
//! as binary update messages; replicas that have received the same set of
//! updates converge to identical state, in any delivery order, with
//! duplicates absorbed.
//!
//! # Quick Start
//!
//! ```
//! use weft::Doc;
//!
//! let alice = Doc::new();
//! let bob = Doc::new();
//!
//! // Alice edits locally.
//! let text = alice.get_text("body");
//! alice.transact(|txn| text.insert(txn, 0, "Hello, World!"));
//!
//! // Bob pulls what he is missing.
//! let update = alice.encode_state_as_update(&bob.state_vector());
//! bob.apply_update(&update).unwrap();
//!
//! assert_eq!(bob.get_text("body").get_string(), "Hello, World!");
//! ```
//!
//! # Design
//!
//! Every edit appends structs to a per-client append-only log; a struct
//! covers a half-open clock interval and carries its insertion origins.
//! Concurrent inserts at one position are ordered by a deterministic
//! integration scan, so no coordination is needed. Deletions tombstone;
//! a per-transaction compaction pass collapses tombstones and merges
//! adjacent structs to bound document growth.

pub mod branch;
pub mod delete_set;
pub mod doc;
pub mod encoding;
pub mod id;
pub mod store;
pub mod txn;
pub mod types;

mod block;
mod update;

pub use branch::Event;
pub use branch::Subscription;
pub use branch::TypeRef;
pub use delete_set::DeleteSet;
pub use doc::Doc;
pub use doc::TransactionEvent;
pub use doc::UpdateEvent;
pub use encoding::DecodeError;
pub use id::ClientId;
pub use id::Id;
pub use id::IdRange;
pub use store::StateVector;
pub use txn::Transaction;
pub use types::Assoc;
pub use types::MapRef;
pub use types::PositionScope;
pub use types::RelativePosition;
pub use types::TextRef;
