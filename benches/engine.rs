// model = "claude-opus-4-5"
// created = "2026-08-02"
// modified = "2026-08-02"
// driver = "Isaac Clayton"

//! Micro-benchmarks for the engine hot paths: local inserts, update
//! encoding, and remote integration.

use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;

use weft::Doc;
use weft::StateVector;

/// A deterministic little position sequence, cheap to compute and spread
/// across the document.
fn position(i: u32, len: u32) -> u32 {
    if len == 0 {
        return 0;
    }
    return (i * 7919) % (len + 1);
}

fn build_doc(edits: u32) -> Doc {
    let doc = Doc::with_client_id(1);
    let text = doc.get_text("t");
    for i in 0..edits {
        let len = text.len();
        let pos = position(i, len);
        doc.transact(|txn| text.insert(txn, pos, "ab"));
    }
    return doc;
}

fn bench_sequential_insert(c: &mut Criterion) {
    c.bench_function("insert/sequential_2000", |b| {
        b.iter(|| {
            let doc = Doc::with_client_id(1);
            let text = doc.get_text("t");
            for _ in 0..1000 {
                let len = text.len();
                doc.transact(|txn| text.insert(txn, len, "ab"));
            }
            return black_box(text.len());
        });
    });
}

fn bench_random_insert(c: &mut Criterion) {
    c.bench_function("insert/random_2000", |b| {
        b.iter(|| {
            let doc = build_doc(1000);
            return black_box(doc.get_text("t").len());
        });
    });
}

fn bench_encode_full_state(c: &mut Criterion) {
    let doc = build_doc(1000);
    let empty = StateVector::new();
    c.bench_function("encode/full_state_2000", |b| {
        b.iter(|| {
            return black_box(doc.encode_state_as_update(&empty));
        });
    });
}

fn bench_apply_full_state(c: &mut Criterion) {
    let doc = build_doc(1000);
    let update = doc.encode_state_as_update(&StateVector::new());
    c.bench_function("apply/full_state_2000", |b| {
        b.iter(|| {
            let fresh = Doc::with_client_id(2);
            fresh.apply_update(black_box(&update)).expect("apply should succeed");
            return black_box(fresh.get_text("t").len());
        });
    });
}

fn bench_sync_round(c: &mut Criterion) {
    c.bench_function("sync/two_replicas_200_edits", |b| {
        b.iter(|| {
            let a = Doc::with_client_id(1);
            let b2 = Doc::with_client_id(2);
            let ta = a.get_text("t");
            let tb = b2.get_text("t");
            for i in 0..100 {
                let la = ta.len();
                a.transact(|txn| ta.insert(txn, position(i, la), "x"));
                let lb = tb.len();
                b2.transact(|txn| tb.insert(txn, position(i, lb), "y"));
            }
            let to_b = a.encode_state_as_update(&b2.state_vector());
            let to_a = b2.encode_state_as_update(&a.state_vector());
            b2.apply_update(&to_b).expect("apply should succeed");
            a.apply_update(&to_a).expect("apply should succeed");
            return black_box((ta.len(), tb.len()));
        });
    });
}

criterion_group!(
    benches,
    bench_sequential_insert,
    bench_random_insert,
    bench_encode_full_state,
    bench_apply_full_state,
    bench_sync_round,
);
criterion_main!(benches);
