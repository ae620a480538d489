// model = "claude-opus-4-5"
// created = "2026-08-02"
// modified = "2026-08-02"
// driver = "Isaac Clayton"

//! Convergence scenarios across replicas.
//!
//! These tests exchange real encoded updates between documents and verify
//! the CRDT contract: any delivery order, any number of duplicates, same
//! final state everywhere.

use std::cell::RefCell;
use std::rc::Rc;

use weft::Doc;
use weft::StateVector;

// =============================================================================
// Helpers
// =============================================================================

/// Collect every update a document emits.
fn record_updates(doc: &Doc) -> Rc<RefCell<Vec<Vec<u8>>>> {
    let updates: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = updates.clone();
    doc.on_update(move |event| sink.borrow_mut().push(event.update.clone()));
    return updates;
}

/// Full-state encoding against an empty remote.
fn full_state(doc: &Doc) -> Vec<u8> {
    return doc.encode_state_as_update(&StateVector::new());
}

/// Two-way sync via state vectors.
fn sync(a: &Doc, b: &Doc) {
    let to_b = a.encode_state_as_update(&b.state_vector());
    let to_a = b.encode_state_as_update(&a.state_vector());
    b.apply_update(&to_b).expect("apply should succeed");
    a.apply_update(&to_a).expect("apply should succeed");
}

fn assert_converged(a: &Doc, b: &Doc) {
    a.check_integrity();
    b.check_integrity();
    assert_eq!(full_state(a), full_state(b), "replicas did not converge");
}

// =============================================================================
// Concurrent inserts
// =============================================================================

#[test]
fn concurrent_head_inserts_order_by_client() {
    let a = Doc::with_client_id(1);
    let b = Doc::with_client_id(2);
    let ta = a.get_text("t");
    let tb = b.get_text("t");

    a.transact(|txn| ta.insert(txn, 0, "a"));
    b.transact(|txn| tb.insert(txn, 0, "b"));

    sync(&a, &b);

    // The author with the smaller client id keeps the leftward position.
    assert_eq!(ta.get_string(), "ab");
    assert_eq!(tb.get_string(), "ab");
    assert_converged(&a, &b);
}

#[test]
fn concurrent_middle_inserts_do_not_interleave() {
    let a = Doc::with_client_id(1);
    let b = Doc::with_client_id(2);
    let ta = a.get_text("t");
    let tb = b.get_text("t");

    a.transact(|txn| ta.insert(txn, 0, "ac"));
    sync(&a, &b);

    // Both insert between 'a' and 'c'.
    a.transact(|txn| ta.insert(txn, 1, "xxx"));
    b.transact(|txn| tb.insert(txn, 1, "yyy"));
    sync(&a, &b);

    let result = ta.get_string();
    assert_eq!(result, tb.get_string());
    assert!(result.starts_with('a') && result.ends_with('c'));
    // Runs stay contiguous: no x inside the y run and vice versa.
    assert!(result.contains("xxx"));
    assert!(result.contains("yyy"));
    assert_converged(&a, &b);
}

#[test]
fn three_replicas_converge_pairwise() {
    let a = Doc::with_client_id(1);
    let b = Doc::with_client_id(2);
    let c = Doc::with_client_id(3);
    let ta = a.get_text("t");
    let tb = b.get_text("t");
    let tc = c.get_text("t");

    a.transact(|txn| ta.insert(txn, 0, "one "));
    b.transact(|txn| tb.insert(txn, 0, "two "));
    c.transact(|txn| tc.insert(txn, 0, "three "));

    sync(&a, &b);
    sync(&b, &c);
    sync(&a, &c);
    sync(&a, &b);

    assert_eq!(ta.get_string(), tb.get_string());
    assert_eq!(tb.get_string(), tc.get_string());
    assert_converged(&a, &b);
    assert_converged(&b, &c);
}

// =============================================================================
// Deletes and delivery order
// =============================================================================

#[test]
fn delete_update_applies_before_insert_update() {
    let a = Doc::with_client_id(1);
    let ta = a.get_text("t");
    let updates = record_updates(&a);

    a.transact(|txn| ta.insert(txn, 0, "abc"));
    a.transact(|txn| ta.remove_range(txn, 1, 1));
    assert_eq!(ta.get_string(), "ac");

    // Deliver in reverse order: the delete parks until the insert lands.
    let b = Doc::with_client_id(2);
    let tb = b.get_text("t");
    let recorded = updates.borrow();
    assert_eq!(recorded.len(), 2);
    b.apply_update(&recorded[1]).expect("apply should succeed");
    assert_eq!(tb.get_string(), "");
    b.apply_update(&recorded[0]).expect("apply should succeed");

    assert_eq!(tb.get_string(), "ac");
    assert_converged(&a, &b);
}

#[test]
fn delete_range_beyond_state_parks_the_tail() {
    let a = Doc::with_client_id(1);
    let ta = a.get_text("t");
    let updates = record_updates(&a);

    // Ten characters in two bursts, then delete across the burst boundary.
    a.transact(|txn| ta.insert(txn, 0, "0123456"));
    a.transact(|txn| ta.insert(txn, 7, "789"));
    a.transact(|txn| ta.remove_range(txn, 5, 5));
    assert_eq!(ta.get_string(), "01234");

    let recorded = updates.borrow();
    assert_eq!(recorded.len(), 3);

    // The replica holds only the first seven characters when the delete
    // arrives: the known half applies, the tail parks.
    let b = Doc::with_client_id(2);
    let tb = b.get_text("t");
    b.apply_update(&recorded[0]).expect("apply should succeed");
    b.apply_update(&recorded[2]).expect("apply should succeed");
    assert_eq!(tb.get_string(), "01234");

    // The missing structs arrive; the parked tail finishes the job.
    b.apply_update(&recorded[1]).expect("apply should succeed");
    assert_eq!(tb.get_string(), "01234");
    assert_converged(&a, &b);
}

#[test]
fn concurrent_insert_into_deleted_region() {
    let a = Doc::with_client_id(1);
    let b = Doc::with_client_id(2);
    let ta = a.get_text("t");
    let tb = b.get_text("t");

    a.transact(|txn| ta.insert(txn, 0, "hello"));
    sync(&a, &b);

    // A deletes "ell" while B inserts inside it.
    a.transact(|txn| ta.remove_range(txn, 1, 3));
    b.transact(|txn| tb.insert(txn, 2, "X"));
    sync(&a, &b);

    let result = ta.get_string();
    assert_eq!(result, tb.get_string());
    assert!(result.contains('X'));
    assert!(!result.contains("ell"));
    assert_converged(&a, &b);
}

// =============================================================================
// Idempotence and commutativity
// =============================================================================

#[test]
fn applying_an_update_twice_is_a_no_op() {
    let a = Doc::with_client_id(1);
    let ta = a.get_text("t");
    a.transact(|txn| ta.insert(txn, 0, "hello world"));
    a.transact(|txn| ta.remove_range(txn, 5, 1));

    let update = full_state(&a);
    let b = Doc::with_client_id(2);
    b.apply_update(&update).expect("apply should succeed");
    let once = full_state(&b);
    b.apply_update(&update).expect("apply should succeed");
    let twice = full_state(&b);

    assert_eq!(once, twice);
    assert_eq!(b.get_text("t").get_string(), "helloworld");
}

#[test]
fn updates_commute() {
    let a = Doc::with_client_id(1);
    let b = Doc::with_client_id(2);
    let ta = a.get_text("t");
    let tb = b.get_text("t");
    a.transact(|txn| ta.insert(txn, 0, "left"));
    b.transact(|txn| tb.insert(txn, 0, "right"));

    let ua = full_state(&a);
    let ub = full_state(&b);

    let ab = Doc::with_client_id(3);
    ab.apply_update(&ua).expect("apply should succeed");
    ab.apply_update(&ub).expect("apply should succeed");

    let ba = Doc::with_client_id(4);
    ba.apply_update(&ub).expect("apply should succeed");
    ba.apply_update(&ua).expect("apply should succeed");

    assert_eq!(full_state(&ab), full_state(&ba));
    assert_eq!(ab.get_text("t").get_string(), ba.get_text("t").get_string());
}

#[test]
fn long_history_applied_twice_is_byte_identical() {
    let a = Doc::with_client_id(1);
    let text = a.get_text("t");
    for i in 0..250u32 {
        let len = text.len();
        a.transact(|txn| {
            text.insert(txn, len, "wxyz");
            if i % 7 == 0 && len > 10 {
                text.remove_range(txn, len / 2, 3);
            }
        });
    }

    let update = full_state(&a);
    let b = Doc::with_client_id(2);
    b.apply_update(&update).expect("apply should succeed");
    let sv_once = b.encode_state_vector();
    let state_once = full_state(&b);
    b.apply_update(&update).expect("apply should succeed");

    assert_eq!(b.encode_state_vector(), sv_once);
    assert_eq!(full_state(&b), state_once);
    assert_eq!(text.get_string(), b.get_text("t").get_string());
}

// =============================================================================
// Maps
// =============================================================================

#[test]
fn concurrent_map_writes_pick_one_winner() {
    let a = Doc::with_client_id(1);
    let b = Doc::with_client_id(2);
    let ma = a.get_map("m");
    let mb = b.get_map("m");

    a.transact(|txn| ma.set(txn, "k", serde_json::json!("x")));
    b.transact(|txn| mb.set(txn, "k", serde_json::json!("y")));
    sync(&a, &b);

    // The larger (client, clock) id wins; the loser stays tombstoned.
    assert_eq!(ma.get("k"), Some(serde_json::json!("y")));
    assert_eq!(mb.get("k"), Some(serde_json::json!("y")));
    assert_eq!(a.state_vector().get(1), 1);
    assert_eq!(a.state_vector().get(2), 1);
    assert_converged(&a, &b);
}

#[test]
fn map_delete_propagates() {
    let a = Doc::with_client_id(1);
    let b = Doc::with_client_id(2);
    let ma = a.get_map("m");
    let mb = b.get_map("m");

    a.transact(|txn| ma.set(txn, "k", serde_json::json!(1)));
    sync(&a, &b);
    b.transact(|txn| {
        mb.remove(txn, "k");
    });
    sync(&a, &b);

    assert_eq!(ma.get("k"), None);
    assert_eq!(mb.get("k"), None);
    assert_converged(&a, &b);
}

#[test]
fn nested_text_syncs_through_updates() {
    let a = Doc::with_client_id(1);
    let b = Doc::with_client_id(2);
    let ma = a.get_map("m");
    let mb = b.get_map("m");

    a.transact(|txn| {
        let nested = ma.set_text(txn, "body");
        nested.insert(txn, 0, "nested content");
    });
    sync(&a, &b);

    let nested_b = mb.get_text("body").expect("nested text synced");
    assert_eq!(nested_b.get_string(), "nested content");

    // Edit the nested text on the receiving side and sync back.
    b.transact(|txn| nested_b.insert(txn, 0, ">> "));
    sync(&a, &b);
    assert_eq!(
        ma.get_text("body").unwrap().get_string(),
        ">> nested content"
    );
    assert_converged(&a, &b);
}

#[test]
fn deleting_nested_type_collapses_it_everywhere() {
    let a = Doc::with_client_id(1);
    let b = Doc::with_client_id(2);
    let ma = a.get_map("m");
    let mb = b.get_map("m");

    a.transact(|txn| {
        let nested = ma.set_text(txn, "body");
        nested.insert(txn, 0, "soon gone");
    });
    sync(&a, &b);
    a.transact(|txn| {
        ma.remove(txn, "body");
    });
    sync(&a, &b);

    assert!(ma.get_text("body").is_none());
    assert!(mb.get_text("body").is_none());
    assert_converged(&a, &b);
}

// =============================================================================
// Sync protocol shapes
// =============================================================================

#[test]
fn state_vector_diff_sends_only_whats_missing() {
    let a = Doc::with_client_id(1);
    let b = Doc::with_client_id(2);
    let ta = a.get_text("t");

    a.transact(|txn| ta.insert(txn, 0, "shared"));
    sync(&a, &b);

    a.transact(|txn| ta.insert(txn, 6, " tail"));
    let full = full_state(&a);
    let diff = a.encode_state_as_update(&b.state_vector());
    assert!(diff.len() < full.len(), "diff should omit known structs");

    b.apply_update(&diff).expect("apply should succeed");
    assert_eq!(b.get_text("t").get_string(), "shared tail");
    assert_converged(&a, &b);
}

#[test]
fn state_vector_round_trips_over_the_wire() {
    let a = Doc::with_client_id(1);
    let ta = a.get_text("t");
    a.transact(|txn| ta.insert(txn, 0, "abc"));

    let encoded = a.encode_state_vector();
    let decoded = StateVector::decode(&encoded).expect("decode should succeed");
    assert_eq!(decoded.get(1), 3);
}

#[test]
fn live_update_stream_keeps_replicas_in_lockstep() {
    let a = Doc::with_client_id(1);
    let b = Doc::with_client_id(2);
    let b2 = b.clone();

    // Pipe A's updates straight into B.
    a.on_update(move |event| {
        b2.apply_update(&event.update).expect("apply should succeed");
    });

    let text = a.get_text("t");
    a.transact(|txn| text.insert(txn, 0, "hello"));
    a.transact(|txn| text.insert(txn, 5, " world"));
    a.transact(|txn| text.remove_range(txn, 0, 1));

    assert_eq!(b.get_text("t").get_string(), "ello world");
    assert_converged(&a, &b);
}

#[test]
fn malformed_update_is_rejected_without_damage() {
    let a = Doc::with_client_id(1);
    let ta = a.get_text("t");
    a.transact(|txn| ta.insert(txn, 0, "safe"));
    let before = full_state(&a);

    assert!(a.apply_update(&[0xFF, 0xFF, 0xFF]).is_err());
    assert!(a.apply_update(&[]).is_err());

    assert_eq!(full_state(&a), before);
    assert_eq!(ta.get_string(), "safe");
}
