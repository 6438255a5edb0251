use reef_buf::ByteRef;
use reef_engine::types::deque::Side;
use reef_engine::{Errno, Store, TxnState};

fn bytes(s: &str) -> ByteRef {
    ByteRef::from_vec(s.as_bytes().to_vec())
}

fn text(r: &ByteRef) -> String {
    String::from_utf8(r.as_slice().to_vec()).unwrap()
}

#[test]
fn number_cas_success() {
    let mut store = Store::new();
    let oid = store.create("n", "number").unwrap();

    store.number_set(None, oid, 7).unwrap();

    let mut current = 0;
    store.number_cas(None, oid, 7, 9, &mut current).unwrap();
    assert_eq!(current, 7);
    assert_eq!(store.number_get(None, oid).unwrap(), 9);
}

#[test]
fn number_cas_mismatch() {
    let mut store = Store::new();
    let oid = store.create("n", "number").unwrap();

    store.number_set(None, oid, 7).unwrap();

    let mut current = 0;
    assert_eq!(
        store.number_cas(None, oid, 6, 9, &mut current),
        Err(Errno::DataCas)
    );
    assert_eq!(current, 7);
    assert_eq!(store.number_get(None, oid).unwrap(), 7);
}

#[test]
fn deque_push_pop_with_commit() {
    let mut store = Store::new();
    let oid = store.create("q", "deque").unwrap();

    let txn = store.begin();
    store.deque_push(Some(txn), oid, Side::Front, bytes("A")).unwrap();
    store.deque_push(Some(txn), oid, Side::Front, bytes("B")).unwrap();

    // uncommitted pushes are invisible outside the transaction
    assert_eq!(store.deque_pop(None, oid, Side::Front), Err(Errno::DataNoItems));

    store.commit(txn).unwrap();

    assert_eq!(text(&store.deque_pop(None, oid, Side::Front).unwrap()), "B");
    assert_eq!(text(&store.deque_pop(None, oid, Side::Front).unwrap()), "A");
    assert_eq!(store.deque_pop(None, oid, Side::Front), Err(Errno::DataNoItems));
}

#[test]
fn deque_pop_empty() {
    let mut store = Store::new();
    let oid = store.create("q", "deque").unwrap();
    assert_eq!(store.deque_pop(None, oid, Side::Front), Err(Errno::DataNoItems));
    assert_eq!(store.deque_pop(None, oid, Side::Back), Err(Errno::DataNoItems));
}

#[test]
fn txn_contention() {
    let mut store = Store::new();
    let oid = store.create("n", "number").unwrap();

    let t1 = store.begin();
    let t2 = store.begin();

    store.number_set(Some(t1), oid, 3).unwrap();
    assert_eq!(
        store.number_set(Some(t2), oid, 4),
        Err(Errno::TxnLockedOperation)
    );

    store.rollback(t1).unwrap();
    store.number_set(Some(t2), oid, 4).unwrap();
    store.commit(t2).unwrap();
    assert_eq!(store.number_get(None, oid).unwrap(), 4);
}

#[test]
fn txn_isolation_on_number() {
    let mut store = Store::new();
    let oid = store.create("n", "number").unwrap();
    store.number_set(None, oid, 10).unwrap();

    let txn = store.begin();
    store.number_add(Some(txn), oid, 5).unwrap();

    // the owning transaction reads its own write; everyone else reads old
    assert_eq!(store.number_get(Some(txn), oid).unwrap(), 15);
    assert_eq!(store.number_get(None, oid).unwrap(), 10);

    store.commit(txn).unwrap();
    assert_eq!(store.number_get(None, oid).unwrap(), 15);
}

#[test]
fn txn_rollback_restores_number() {
    let mut store = Store::new();
    let oid = store.create("n", "number").unwrap();
    store.number_set(None, oid, 1).unwrap();

    let txn = store.begin();
    store.number_set(Some(txn), oid, 99).unwrap();
    store.rollback(txn).unwrap();

    assert_eq!(store.number_get(None, oid).unwrap(), 1);
    // the lock is released: a later write succeeds
    store.number_set(None, oid, 2).unwrap();
    assert_eq!(store.number_get(None, oid).unwrap(), 2);
}

#[test]
fn atom_registered_once_per_lock() {
    let mut store = Store::new();
    let oid = store.create("n", "number").unwrap();

    let txn = store.begin();
    store.number_set(Some(txn), oid, 1).unwrap();
    store.number_add(Some(txn), oid, 1).unwrap();
    store.number_mul(Some(txn), oid, 3).unwrap();

    let t = store.txn(txn).unwrap();
    assert_eq!(t.state(), TxnState::Open);
    assert_eq!(t.atoms().len(), 1, "one atom per object per transaction");

    store.commit(txn).unwrap();
    assert_eq!(store.number_get(None, oid).unwrap(), 6);
}

#[test]
fn deque_both_sides_and_opposite_drain() {
    let mut store = Store::new();
    let oid = store.create("q", "deque").unwrap();

    store.deque_push(None, oid, Side::Back, bytes("1")).unwrap();
    store.deque_push(None, oid, Side::Back, bytes("2")).unwrap();
    store.deque_push(None, oid, Side::Front, bytes("0")).unwrap();

    assert_eq!(store.deque_len(oid).unwrap(), 3);
    assert_eq!(text(&store.deque_pop(None, oid, Side::Front).unwrap()), "0");
    assert_eq!(text(&store.deque_pop(None, oid, Side::Back).unwrap()), "2");
    assert_eq!(text(&store.deque_pop(None, oid, Side::Front).unwrap()), "1");
    assert_eq!(store.deque_pop(None, oid, Side::Back), Err(Errno::DataNoItems));
}

#[test]
fn deque_txn_pop_rolls_back_cursor() {
    let mut store = Store::new();
    let oid = store.create("q", "deque").unwrap();

    store.deque_push(None, oid, Side::Back, bytes("keep")).unwrap();

    let txn = store.begin();
    assert_eq!(text(&store.deque_pop(Some(txn), oid, Side::Front).unwrap()), "keep");
    store.rollback(txn).unwrap();

    // the rolled-back pop never consumed the entry
    assert_eq!(text(&store.deque_pop(None, oid, Side::Front).unwrap()), "keep");
}

#[test]
fn deque_per_side_locks_are_independent() {
    let mut store = Store::new();
    let oid = store.create("q", "deque").unwrap();

    let t1 = store.begin();
    let t2 = store.begin();

    store.deque_push(Some(t1), oid, Side::Front, bytes("f")).unwrap();
    // the other side has its own lock
    store.deque_push(Some(t2), oid, Side::Back, bytes("b")).unwrap();
    // but the locked side rejects the other transaction
    assert_eq!(
        store.deque_push(Some(t2), oid, Side::Front, bytes("x")),
        Err(Errno::TxnLockedOperation)
    );

    store.commit(t1).unwrap();
    store.commit(t2).unwrap();
    assert_eq!(store.deque_len(oid).unwrap(), 2);
}

#[test]
fn flow_append_and_stubs() {
    let mut store = Store::new();
    let oid = store.create("f", "flow").unwrap();

    assert_eq!(store.flow_append(None, oid, bytes("hello ")).unwrap(), 6);
    assert_eq!(store.flow_append(None, oid, bytes("world")).unwrap(), 11);
    assert_eq!(store.flow_size(oid).unwrap(), 11);

    assert_eq!(store.flow_read(None, oid, 0, 5), Err(Errno::NotImplemented));
    assert_eq!(store.flow_inject(None, oid, 0, bytes("x")), Err(Errno::NotImplemented));
    assert_eq!(store.flow_write(None, oid, 0, bytes("x")), Err(Errno::NotImplemented));
    assert_eq!(store.flow_remove(None, oid, 0, 1), Err(Errno::NotImplemented));
    assert_eq!(store.flow_truncate(None, oid, 0), Err(Errno::NotImplemented));
}

#[test]
fn counter_semantics_match_number_minus_div() {
    let mut store = Store::new();
    let oid = store.create("c", "counter").unwrap();

    store.counter_set(None, oid, 5).unwrap();
    assert_eq!(store.counter_add(None, oid, 3).unwrap(), 8);
    assert_eq!(store.counter_mul(None, oid, 2).unwrap(), 16);

    let mut current = 0;
    assert_eq!(
        store.counter_cas(None, oid, 0, 1, &mut current),
        Err(Errno::DataCas)
    );
    assert_eq!(current, 16);
    store.counter_cas(None, oid, 16, 1, &mut current).unwrap();
    assert_eq!(store.counter_get(None, oid).unwrap(), 1);

    let txn = store.begin();
    store.counter_add(Some(txn), oid, 100).unwrap();
    assert_eq!(store.counter_get(None, oid).unwrap(), 1);
    store.commit(txn).unwrap();
    assert_eq!(store.counter_get(None, oid).unwrap(), 101);
}

#[test]
fn lifecycle_and_type_errors() {
    let mut store = Store::new();
    let oid = store.create("n", "number").unwrap();

    assert_eq!(store.create("n", "number"), Err(Errno::ObjectExists));
    assert_eq!(store.create("x", "no-such-type"), Err(Errno::ObjectNotFound));
    assert_eq!(store.open("n").unwrap(), oid);
    assert_eq!(store.open("missing"), Err(Errno::ObjectNotFound));

    // a number is not a deque
    assert_eq!(
        store.deque_pop(None, oid, Side::Front),
        Err(Errno::WrongObjectType)
    );

    store.close(oid).unwrap();
    assert_eq!(store.number_get(None, oid), Err(Errno::ObjectNotFound));
    assert_eq!(store.open("n"), Err(Errno::ObjectNotFound));
}

#[test]
fn commit_of_unknown_txn() {
    let mut store = Store::new();
    assert_eq!(store.commit(42), Err(Errno::TxnNotFound));
    assert_eq!(store.rollback(42), Err(Errno::TxnNotFound));

    // ids are monotonically increasing and never zero
    let a = store.begin();
    let b = store.begin();
    assert!(a > 0 && b > a);
}

#[test]
fn deque_pop_drains_opposite_pending() {
    let mut store = Store::new();
    let oid = store.create("q", "deque").unwrap();

    let txn = store.begin();
    store.deque_push(Some(txn), oid, Side::Front, bytes("A")).unwrap();
    store.deque_push(Some(txn), oid, Side::Front, bytes("B")).unwrap();

    // nothing committed and nothing staged on the back side: the pop
    // reaches across to the staged front pushes, oldest first
    assert_eq!(text(&store.deque_pop(Some(txn), oid, Side::Back).unwrap()), "A");
    assert_eq!(text(&store.deque_pop(Some(txn), oid, Side::Back).unwrap()), "B");
    assert_eq!(store.deque_pop(Some(txn), oid, Side::Back), Err(Errno::DataNoItems));
    store.commit(txn).unwrap();
    assert_eq!(store.deque_len(oid).unwrap(), 0);
}
