//! End-to-end scenarios exercising `Database` across multiple commits,
//! multiple threads, and multiple opens of the same file.

use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;

use pretty_assertions::assert_eq;
use rand::Rng;
use serial_test::serial;
use tempfile::tempdir;

use dobbin::database::{Database, DatabaseOptions};
use dobbin::error::{DResult, Error};
use dobbin::object::{Handle, PersistentClass, PersistentDict};
use dobbin::stream::PersistentSource;
use dobbin::value::{State, Value};

struct Doc {
    name: String,
}

impl PersistentClass for Doc {
    fn class_name() -> &'static str {
        "scenarios::Doc"
    }
    fn to_state(&self) -> State {
        let mut state = State::new();
        state.insert("name".into(), Value::Str(self.name.clone()));
        state
    }
    fn from_state(state: &State) -> DResult<Self> {
        match state.get("name") {
            Some(Value::Str(name)) => Ok(Doc { name: name.clone() }),
            _ => Err(Error::TypeError("missing name".into())),
        }
    }
}

fn seed(path: &std::path::Path, name: &str) -> (Database, Arc<dobbin::object::Entity>) {
    let db = Database::open(DatabaseOptions::new(path)).unwrap();
    let tx = db.begin();
    let handle = Handle::new(Doc { name: name.to_string() });
    db.set_root(handle.entity()).unwrap();
    db.commit(&tx).unwrap();
    let root = db.get_root().unwrap().unwrap();
    (db, root)
}

#[test]
fn single_write_grows_the_file_and_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("single.db");

    let len_before = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    let (db, root) = seed(&path, "alice");
    let len_after = std::fs::metadata(&path).unwrap().len();
    assert!(len_after > len_before, "commit should append at least one VERSION + RECORD");

    let handle: Handle<Doc> = Handle::from_entity(root);
    assert_eq!(handle.read().unwrap().name, "alice");
    drop(db);

    let db2 = Database::open(DatabaseOptions::new(&path)).unwrap();
    let root2 = db2.get_root().unwrap().expect("root persisted across reopen");
    let handle2: Handle<Doc> = Handle::from_entity(root2);
    assert_eq!(handle2.read().unwrap().name, "alice");
}

/// Two threads check out the same root, A commits first, B commits second.
/// Without a resolver B's commit must fail with a write conflict and leave
/// the committed state as A left it.
#[test]
fn two_thread_write_conflict_without_resolver_leaves_winners_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("conflict.db");
    let (db, root) = seed(&path, "seed");

    let barrier = Arc::new(Barrier::new(2));
    let (a_done_tx, a_done_rx) = mpsc::channel::<()>();

    let db_a = db.clone();
    let root_a = root.clone();
    let barrier_a = barrier.clone();
    let a = thread::spawn(move || -> DResult<()> {
        let tx = db_a.begin();
        barrier_a.wait();
        let handle: Handle<Doc> = Handle::from_entity(root_a);
        handle.write(&Doc { name: "A".into() })?;
        let result = db_a.commit(&tx);
        a_done_tx.send(()).unwrap();
        result
    });

    let db_b = db.clone();
    let root_b = root.clone();
    let barrier_b = barrier.clone();
    let b = thread::spawn(move || -> DResult<()> {
        let tx = db_b.begin();
        barrier_b.wait();
        a_done_rx.recv().unwrap();
        let handle: Handle<Doc> = Handle::from_entity(root_b);
        handle.write(&Doc { name: "B".into() })?;
        db_b.commit(&tx)
    });

    a.join().unwrap().unwrap();
    let b_result = b.join().unwrap();
    assert!(matches!(b_result, Err(Error::WriteConflict(_))), "expected B to lose the race, got {b_result:?}");

    let handle: Handle<Doc> = Handle::from_entity(root);
    assert_eq!(handle.read().unwrap().name, "A");
}

/// Same race as above, but the root carries a resolver that appends "!" to
/// the losing writer's intended name. B's commit must now succeed, and the
/// resulting serial is B's own commit timestamp, not A's.
#[test]
fn two_thread_write_conflict_with_resolver_adopts_resolved_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("resolved.db");
    let (db, root) = seed(&path, "seed");

    let handle: Handle<Doc> = Handle::from_entity(root.clone());
    handle.set_resolver(|_old, working, _incoming| {
        let Some(Value::Str(name)) = working.get("name") else { return None };
        let mut resolved = State::new();
        resolved.insert("name".into(), Value::Str(format!("{name}!")));
        Some(resolved)
    });

    let barrier = Arc::new(Barrier::new(2));
    let (a_done_tx, a_done_rx) = mpsc::channel::<()>();

    let db_a = db.clone();
    let root_a = root.clone();
    let barrier_a = barrier.clone();
    let a = thread::spawn(move || -> DResult<()> {
        let tx = db_a.begin();
        barrier_a.wait();
        let handle: Handle<Doc> = Handle::from_entity(root_a);
        handle.write(&Doc { name: "A".into() })?;
        let result = db_a.commit(&tx);
        a_done_tx.send(()).unwrap();
        result
    });

    let db_b = db.clone();
    let root_b = root.clone();
    let barrier_b = barrier.clone();
    let b = thread::spawn(move || -> DResult<()> {
        let tx = db_b.begin();
        barrier_b.wait();
        a_done_rx.recv().unwrap();
        let handle: Handle<Doc> = Handle::from_entity(root_b);
        handle.write(&Doc { name: "B".into() })?;
        db_b.commit(&tx)
    });

    a.join().unwrap().unwrap();
    b.join().unwrap().unwrap();

    let handle: Handle<Doc> = Handle::from_entity(root);
    assert_eq!(handle.read().unwrap().name, "B!");
}

#[test]
fn stream_embedding_round_trips_through_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stream.db");

    let payload: Vec<u8> = (0..100 * 1024u32).map(|i| (i % 251) as u8).collect();

    let len_before;
    {
        let db = Database::open(DatabaseOptions::new(&path)).unwrap();
        let tx = db.begin();
        let dict = PersistentDict::new();
        db.set_root(dict.entity()).unwrap();
        len_before = std::fs::metadata(&path).unwrap().len();
        db.embed_stream(dict.entity(), "blob", PersistentSource::from_bytes("blob", payload.clone())).unwrap();
        db.commit(&tx).unwrap();
    }
    let len_after = std::fs::metadata(&path).unwrap().len();
    assert!(len_after - len_before >= payload.len() as u64, "log must grow by at least the payload size");

    let db2 = Database::open(DatabaseOptions::new(&path)).unwrap();
    let root2 = db2.get_root().unwrap().unwrap();
    let dict2 = PersistentDict::from_entity(root2);
    let Some(Value::Stream(stream_ref)) = dict2.get("blob").unwrap() else {
        panic!("expected a Stream value");
    };
    let stream = db2.open_stream(stream_ref);

    let mut collected = Vec::new();
    for chunk in stream.chunks(32 * 1024).unwrap() {
        collected.extend(chunk.unwrap());
    }
    assert_eq!(collected, payload);
}

#[test]
#[serial]
fn cross_process_append_is_observed_on_new_transaction() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cross.db");
    let (p1, root) = seed(&path, "seed");

    // A second handle onto the same file models a second process: it has
    // its own object table and catches up from disk rather than sharing
    // the first handle's in-memory entities.
    let p2 = Database::open(DatabaseOptions::new(&path)).unwrap();
    let tx2 = p2.begin();
    let root2 = p2.get_root().unwrap().unwrap();
    let handle2: Handle<Doc> = Handle::from_entity(root2);
    handle2.write(&Doc { name: "from-p2".into() }).unwrap();
    p2.commit(&tx2).unwrap();

    let tx1 = p1.begin();
    let handle1: Handle<Doc> = Handle::from_entity(root);
    assert_eq!(handle1.read().unwrap().name, "from-p2", "p1 must observe p2's commit on newTransaction");
    p1.abort(&tx1).unwrap();
}

#[test]
#[serial]
fn commit_lock_held_by_another_writer_fails_non_blockingly() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lock.db");
    let (db, root) = seed(&path, "seed");

    // Grab the advisory commit lock directly, as a second writer would
    // while mid-transaction, without going through `Database`.
    let log = dobbin::log::TransactionLog::open(&path).unwrap();
    log.begin().unwrap();

    let tx = db.begin();
    let handle: Handle<Doc> = Handle::from_entity(root);
    handle.write(&Doc { name: "should-fail".into() }).unwrap();
    let result = db.commit(&tx);

    match result {
        Err(err) => assert!(err.is_retryable(), "lock contention must be reported retryable, got {err:?}"),
        Ok(()) => panic!("commit should not succeed while another writer holds the lock"),
    }
}

#[test]
fn aborted_transaction_leaves_no_trace_after_reload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("abort.db");
    let (db, root) = seed(&path, "seed");

    let tx = db.begin();
    let handle: Handle<Doc> = Handle::from_entity(root.clone());
    handle.write(&Doc { name: "doomed".into() }).unwrap();
    db.abort(&tx).unwrap();

    assert_eq!(handle.read().unwrap().name, "seed");
    drop(db);

    let db2 = Database::open(DatabaseOptions::new(&path)).unwrap();
    let root2 = db2.get_root().unwrap().unwrap();
    let handle2: Handle<Doc> = Handle::from_entity(root2);
    assert_eq!(handle2.read().unwrap().name, "seed");
}

#[test]
fn set_root_twice_on_the_same_handle_is_a_runtime_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("root-twice.db");
    let (db, _root) = seed(&path, "seed");

    let tx = db.begin();
    let other = Handle::new(Doc { name: "second".into() });
    let err = db.set_root(other.entity()).unwrap_err();
    assert!(matches!(err, Error::Runtime(_)), "expected a runtime error, got {err:?}");
    db.abort(&tx).unwrap();
}

/// Two database handles race to set the root (modeling two processes). The
/// second one observes the first's commit on catch-up and fails with a
/// runtime error rather than silently overwriting it.
#[test]
#[serial]
fn concurrent_set_root_race_leaves_one_winner() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("root-race.db");

    let p1 = Database::open(DatabaseOptions::new(&path)).unwrap();
    let p2 = Database::open(DatabaseOptions::new(&path)).unwrap();

    let tx1 = p1.begin();
    let handle1 = Handle::new(Doc { name: "p1".into() });
    p1.set_root(handle1.entity()).unwrap();
    p1.commit(&tx1).unwrap();

    let tx2 = p2.begin();
    let handle2 = Handle::new(Doc { name: "p2".into() });
    let err = p2.set_root(handle2.entity()).unwrap_err();
    assert!(matches!(err, Error::Runtime(_)), "loser of the race must see a runtime error, got {err:?}");
    p2.abort(&tx2).unwrap();

    let root = p1.get_root().unwrap().unwrap();
    let winner: Handle<Doc> = Handle::from_entity(root);
    assert_eq!(winner.read().unwrap().name, "p1");
}

#[test]
fn set_root_rejects_an_entity_already_attached_to_another_database() {
    let dir = tempdir().unwrap();
    let path_a = dir.path().join("a.db");
    let path_b = dir.path().join("b.db");

    let db_a = Database::open(DatabaseOptions::new(&path_a)).unwrap();
    let db_b = Database::open(DatabaseOptions::new(&path_b)).unwrap();

    let tx_a = db_a.begin();
    let dict = PersistentDict::new();
    dict.keys().unwrap(); // check the entity out on this thread before `add`
    db_a.add(dict.entity()).unwrap();
    db_a.commit(&tx_a).unwrap();

    let tx_b = db_b.begin();
    let err = db_b.set_root(dict.entity()).unwrap_err();
    assert!(matches!(err, Error::InvalidObjectReference), "expected InvalidObjectReference, got {err:?}");
    db_b.abort(&tx_b).unwrap();
}

/// `PersistentDict::clear()` sets the `EMPTY` marker rather than deleting
/// keys one at a time; the marker itself must survive a commit and a reopen
/// the same way an ordinary edit does.
#[test]
fn dict_clear_survives_commit_and_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("clear.db");

    let db = Database::open(DatabaseOptions::new(&path)).unwrap();
    let tx0 = db.begin();
    let dict = PersistentDict::new();
    db.set_root(dict.entity()).unwrap();
    dict.set("bar", Value::Str("foo".into())).unwrap();
    db.save(dict.entity()).unwrap();
    db.commit(&tx0).unwrap();

    let tx1 = db.begin();
    dict.clear().unwrap();
    assert_eq!(dict.get("bar").unwrap(), None);
    db.save(dict.entity()).unwrap();
    db.commit(&tx1).unwrap();

    let root2 = db.get_root().unwrap().unwrap();
    let dict2 = PersistentDict::from_entity(root2);
    assert_eq!(dict2.get("bar").unwrap(), None);
    assert!(dict2.is_empty().unwrap());

    drop(db);
    let db2 = Database::open(DatabaseOptions::new(&path)).unwrap();
    let root3 = db2.get_root().unwrap().unwrap();
    let dict3 = PersistentDict::from_entity(root3);
    assert_eq!(dict3.get("bar").unwrap(), None);

    let tx2 = db2.begin();
    dict3.set("boo", Value::Str("foo".into())).unwrap();
    db2.save(dict3.entity()).unwrap();
    db2.commit(&tx2).unwrap();
    assert_eq!(dict3.get("boo").unwrap(), Some(Value::Str("foo".into())));
}

#[test]
fn random_sequences_of_dict_operations_stay_internally_consistent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("random.db");
    let db = Database::open(DatabaseOptions::new(&path)).unwrap();
    let tx0 = db.begin();
    let dict = PersistentDict::new();
    db.set_root(dict.entity()).unwrap();
    db.commit(&tx0).unwrap();

    let mut model: std::collections::BTreeMap<String, i64> = std::collections::BTreeMap::new();
    let mut rng = rand::thread_rng();

    for _ in 0..200 {
        let tx = db.begin();
        let key = format!("k{}", rng.gen_range(0..8));
        if rng.gen_bool(0.7) {
            let value = rng.gen_range(-100..100);
            dict.set(key.clone(), Value::Int(value)).unwrap();
            model.insert(key, value);
        } else {
            dict.delete(&key).unwrap();
            model.remove(&key);
        }
        db.save(dict.entity()).unwrap();
        db.commit(&tx).unwrap();
    }

    for (key, expected) in &model {
        match dict.get(key).unwrap() {
            Some(Value::Int(actual)) => assert_eq!(actual, *expected, "mismatch on key {key}"),
            other => panic!("expected Int({expected}) for {key}, got {other:?}"),
        }
    }
    assert_eq!(dict.keys().unwrap().len(), model.len());
}
