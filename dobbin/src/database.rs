//! Database / manager (component F).
//!
//! Owns the in-memory `oid -> object` table, the transaction log, the
//! per-database `Synchronizer` (component D), and an embedded
//! `TransactionManager` (component E) that it registers itself with as both
//! a `Synchronizer` and a `ResourceManager`. This is the collaborator
//! everything else in the crate answers to.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;

use log::{debug, info, warn};

use crate::error::{DResult, Error};
use crate::log::{LogEntry, TransactionLog, TxStatus};
use crate::object::{Entity, Handle, PersistentClass};
use crate::oid::{Clock, Oid, Timestamp, ROOT_OID};
use crate::stream::{PersistentSource, PersistentStream};
use crate::synchronizer::DatabaseSynchronizer;
use crate::txn::{ResourceManager, SortKey, Synchronizer, Transaction, TransactionManager};
use crate::value::{State, StreamRef, Value};

/// Configuration for opening a database. No implicit global config; callers
/// build this explicitly — there's no notion of a shared daemon config for a
/// single-file database.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub path: PathBuf,
}

impl DatabaseOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DatabaseOptions { path: path.into() }
    }
}

/// A pending, not-yet-streamed embedded byte source queued up during the
/// current transaction. `entity`/`key` identify where the resulting
/// `file://` token belongs once the bytes have actually been appended to the
/// log and a real offset is known: the wrapper's identity is rewritten in
/// place to a persistent stream pointing at the freshly allocated range.
struct PendingStream {
    entity: Arc<Entity>,
    key: String,
    source: PersistentSource,
}

/// The in-memory `oid -> object` table and the next oid to hand out,
/// guarded by one mutex. Every path that touches either — `replay`'s log
/// catch-up, `get`/`get_root`'s lookups, and `ResourceManager::commit`'s oid
/// assignment — locks this single mutex rather than two, so there is no
/// ordering between a table lock and a counter lock left to get backwards.
#[derive(Default)]
struct ObjectTable {
    objects: HashMap<Oid, Arc<Entity>>,
    next_oid: Oid,
}

pub(crate) struct DatabaseInner {
    path: PathBuf,
    log: TransactionLog,
    clock: Clock,
    table: Mutex<ObjectTable>,
    modified: Mutex<HashMap<ThreadId, Vec<Arc<Entity>>>>,
    pending_streams: Mutex<HashMap<ThreadId, Vec<PendingStream>>>,
    synchronizer: DatabaseSynchronizer,
    last_seen: Mutex<Option<Timestamp>>,
    self_weak: Mutex<Weak<DatabaseInner>>,
}

/// The public handle to an open database. Cloning is cheap (an `Arc` bump);
/// every clone shares the same log, object table and transaction manager.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    txm: Arc<TransactionManager>,
}

impl Database {
    pub fn open(options: DatabaseOptions) -> DResult<Database> {
        let log = TransactionLog::open(&options.path)?;
        let inner = Arc::new(DatabaseInner {
            path: options.path.clone(),
            log,
            clock: Clock::new(),
            table: Mutex::new(ObjectTable { objects: HashMap::new(), next_oid: 1 }),
            modified: Mutex::new(HashMap::new()),
            pending_streams: Mutex::new(HashMap::new()),
            synchronizer: DatabaseSynchronizer::new(),
            last_seen: Mutex::new(None),
            self_weak: Mutex::new(Weak::new()),
        });
        *inner.self_weak.lock().unwrap() = Arc::downgrade(&inner);

        let txm = Arc::new(TransactionManager::new());
        txm.register_synchronizer(inner.clone() as Arc<dyn Synchronizer>);
        txm.register_resource_manager(inner.clone() as Arc<dyn ResourceManager>);

        let db = Database { inner, txm };
        db.catch_up(None)?;
        info!("opened database at {:?}", options.path);
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn weak(&self) -> Weak<DatabaseInner> {
        self.inner.self_weak.lock().unwrap().clone()
    }

    /// Replays every transaction record from the log from `after` onward
    /// into the in-memory object table. Used at startup (from the
    /// beginning), by `set_root`'s race check, and by `newTransaction`
    /// catch-up (from the last offset this process observed).
    fn catch_up(&self, after: Option<Timestamp>) -> DResult<()> {
        self.inner.replay(after)
    }

    pub fn get_root(&self) -> DResult<Option<Arc<Entity>>> {
        Ok(self.inner.table.lock().unwrap().objects.get(&ROOT_OID).cloned())
    }

    /// Assigns oid 0 to `entity`. One-shot: fails if a root already exists,
    /// including one that just appeared via a concurrent process's commit.
    pub fn set_root(&self, entity: &Arc<Entity>) -> DResult<()> {
        if entity.oid().is_some() {
            return Err(Error::Runtime("object already has an oid".into()));
        }
        if entity.has_jar() {
            return Err(Error::InvalidObjectReference);
        }
        self.catch_up(*self.inner.last_seen.lock().unwrap())?;
        {
            let table = self.inner.table.lock().unwrap();
            if table.objects.contains_key(&ROOT_OID) {
                return Err(Error::Runtime("root is already set".into()));
            }
        }
        entity.assign_oid(ROOT_OID);
        entity.set_jar(self.weak());
        self.inner.table.lock().unwrap().objects.insert(ROOT_OID, entity.clone());
        let thread = std::thread::current().id();
        self.register_modified(thread, entity.clone());
        Ok(())
    }

    /// Attaches a brand new persistent-local object to this database.
    pub fn add(&self, entity: &Arc<Entity>) -> DResult<()> {
        let thread = std::thread::current().id();
        if !entity.has_working_copy(thread) {
            return Err(Error::Runtime("object must be checked out before it can be added".into()));
        }
        if entity.has_jar() {
            let same = entity.jar().upgrade().map(|j| Arc::ptr_eq(&j, &self.inner)).unwrap_or(false);
            return if same {
                Err(Error::Runtime("object is already attached to this database".into()))
            } else {
                Err(Error::InvalidObjectReference)
            };
        }
        entity.set_jar(self.weak());
        self.register_modified(thread, entity.clone());
        Ok(())
    }

    /// Looks up an object by oid, installing a `Broken` placeholder when
    /// `class_name` is known but the object hasn't been loaded yet.
    pub fn get(&self, oid: Oid, class_name: Option<&str>) -> DResult<Option<Arc<Entity>>> {
        let mut table = self.inner.table.lock().unwrap();
        if let Some(existing) = table.objects.get(&oid) {
            return Ok(Some(existing.clone()));
        }
        match class_name {
            Some(class_name) => {
                let entity = Entity::new_broken(oid, class_name.to_string(), self.weak());
                table.objects.insert(oid, entity.clone());
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    pub fn get_typed<T: PersistentClass>(&self, oid: Oid) -> DResult<Option<Handle<T>>> {
        Ok(self.get(oid, Some(T::class_name()))?.map(Handle::from_entity))
    }

    /// Re-registers an already-attached object as modified in the current
    /// transaction.
    pub fn save(&self, entity: &Arc<Entity>) -> DResult<()> {
        if !entity.has_jar() {
            return Err(Error::InvalidObjectReference);
        }
        self.register_modified(std::thread::current().id(), entity.clone());
        Ok(())
    }

    pub(crate) fn register_modified(&self, thread: ThreadId, entity: Arc<Entity>) {
        self.inner.synchronizer.register(thread, entity.clone());
        let mut modified = self.inner.modified.lock().unwrap();
        let list = modified.entry(thread).or_default();
        if !list.iter().any(|e| Arc::ptr_eq(e, &entity)) {
            list.push(entity);
        }
    }

    /// Assigns `source` to `key` on `entity`'s working copy in the calling
    /// thread, to be streamed into the log (bypassing the version's own
    /// serialized payload) when this transaction commits. The key's value
    /// is a placeholder `Value::Stream` until commit
    /// rewrites it in place with the real `(offset, length)`.
    pub fn embed_stream(&self, entity: &Arc<Entity>, key: impl Into<String>, source: PersistentSource) -> DResult<()> {
        let key = key.into();
        let thread = std::thread::current().id();
        let length = source.length();
        entity.set(thread, key.clone(), Value::Stream(StreamRef { offset: 0, length }))?;
        self.register_modified(thread, entity.clone());
        self.inner
            .pending_streams
            .lock()
            .unwrap()
            .entry(thread)
            .or_default()
            .push(PendingStream { entity: entity.clone(), key, source });
        Ok(())
    }

    /// Opens a handle onto a previously embedded stream, given the
    /// `StreamRef` read back out of an object's state.
    pub fn open_stream(&self, stream_ref: StreamRef) -> PersistentStream {
        PersistentStream::new(self.inner.log.path(), stream_ref.offset, stream_ref.length)
    }

    pub fn begin(&self) -> Transaction {
        self.txm.begin(self.inner.clock.tick())
    }

    pub fn commit(&self, tx: &Transaction) -> DResult<()> {
        let finish_timestamp = self.inner.clock.tick();
        self.txm.commit(tx, finish_timestamp)
    }

    pub fn abort(&self, tx: &Transaction) -> DResult<()> {
        let abort_timestamp = self.inner.clock.tick();
        self.txm.abort(tx, abort_timestamp)
    }

    pub fn len(&self) -> usize {
        self.inner.table.lock().unwrap().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.inner.path).field("objects", &self.len()).finish()
    }
}

impl DatabaseInner {
    /// Replays every transaction record from the log from `after` onward
    /// into the in-memory object table: committed versions are applied
    /// (with MVCC reconciliation against any thread's working copy),
    /// aborted records are skipped entirely (their versions were orphaned
    /// on disk and never described real state).
    fn replay(&self, after: Option<Timestamp>) -> DResult<()> {
        let mut table = self.table.lock().unwrap();
        let mut last_seen = self.last_seen.lock().unwrap();
        let reader = self.log.reader(after)?;
        let thread = std::thread::current().id();
        let self_weak = self.self_weak.lock().unwrap().clone();

        for entry in reader {
            let LogEntry { record, versions } = entry?;
            if record.status == TxStatus::Aborted {
                self.clock.observe(record.timestamp);
                *last_seen = Some(record.timestamp);
                continue;
            }
            for version in versions {
                if version.oid >= table.next_oid {
                    table.next_oid = version.oid + 1;
                }
                match table.objects.get(&version.oid) {
                    Some(existing) if existing.has_working_copy(thread) => {
                        Self::reconcile(existing, &version.state, record.timestamp)?;
                    }
                    Some(existing) => {
                        existing.resolve(version.state, record.timestamp);
                    }
                    None => {
                        let entity = Entity::new_broken(version.oid, version.class_name, self_weak.clone());
                        entity.resolve(version.state, record.timestamp);
                        table.objects.insert(version.oid, entity);
                    }
                }
            }
            self.clock.observe(record.timestamp);
            *last_seen = Some(record.timestamp);
        }
        Ok(())
    }

    /// MVCC reconciliation for an object some thread has checked out while a
    /// newer committed version for it arrives.
    fn reconcile(entity: &Arc<Entity>, incoming: &State, serial: Timestamp) -> DResult<()> {
        let old = entity.committed_serial_state().unwrap_or_default();
        let thread = std::thread::current().id();
        let working = entity.read_state(thread)?;
        let resolver = entity.resolver_clone();
        match resolver.and_then(|f| f(&old, &working, incoming)) {
            Some(resolved) => {
                entity.resolve(resolved, serial);
                Ok(())
            }
            None => {
                warn!("read conflict on oid {:?}", entity.oid());
                Err(Error::ReadConflict(1))
            }
        }
    }
}

impl Synchronizer for DatabaseInner {
    /// `newTransaction`: catches this thread up on every transaction
    /// committed since it last looked (component F's duty per spec.md
    /// §4.5), then forces every connected object to re-derive its working
    /// copy from the now-current shared state (component D's duty per
    /// §4.4). Catch-up failures are logged rather than propagated since the
    /// hook signature is infallible; a genuine integrity error still
    /// surfaces the next time this thread commits or aborts, which does
    /// propagate.
    fn new_transaction(&self, tx: &Transaction) {
        let after = *self.last_seen.lock().unwrap();
        if let Err(err) = self.replay(after) {
            warn!("newTransaction catch-up failed: {err}");
        }
        self.synchronizer.new_transaction(tx.thread(), tx.begin_timestamp());
    }

    fn before_completion(&self, _tx: &Transaction) {
        // Our single embedded resource manager is always registered, so
        // there is no "join late if unconnected objects exist" step to
        // perform here; the hook exists to satisfy the protocol shape.
    }

    fn after_completion(&self, tx: &Transaction) {
        self.synchronizer.after_completion(tx.thread());
        self.modified.lock().unwrap().remove(&tx.thread());
        self.pending_streams.lock().unwrap().remove(&tx.thread());
    }

    fn sort_key(&self) -> SortKey {
        // Sorts after the resource-manager tier: the synchronizer runs last
        // within each transaction phase.
        (1, 0)
    }
}

impl ResourceManager for DatabaseInner {
    fn sort_key(&self) -> SortKey {
        (0, 0)
    }

    fn commit(&self, tx: &Transaction) -> DResult<()> {
        let thread = tx.thread();

        // Stream bodies first: each one needs a real (offset, length) before
        // we can serialize the owning object's state, since the embedded
        // `Value::Stream` placeholder set by `embed_stream` only knows the
        // length.
        if let Some(sources) = self.pending_streams.lock().unwrap().remove(&thread) {
            for pending in sources {
                let (name, length, mut reader) = pending.source.into_reader();
                debug!("streaming {length} bytes into log for key {:?}", pending.key);
                let offset = self.log.write_stream(&name, length, reader.as_mut())?;
                pending.entity.set(thread, pending.key, Value::Stream(StreamRef { offset, length }))?;
            }
        }

        let modified = self.modified.lock().unwrap().get(&thread).cloned().unwrap_or_default();
        let mut table = self.table.lock().unwrap();

        for entity in &modified {
            if let Some(jar) = entity.jar().upgrade() {
                if !Arc::ptr_eq(&jar, &self.self_weak.lock().unwrap().upgrade().unwrap()) {
                    return Err(Error::InvalidObjectReference);
                }
            } else {
                return Err(Error::ObjectGraph(entity.oid()));
            }

            if entity.oid().is_none() {
                let oid = table.next_oid;
                table.next_oid += 1;
                entity.assign_oid(oid);
                table.objects.insert(oid, entity.clone());
            }

            if let Some(committed) = entity.committed_serial() {
                if committed > tx.begin_timestamp() {
                    // A newer version landed since this transaction began.
                    // Offer the object's resolver the same three states the
                    // log catch-up path offers: the current shared state
                    // stands in for both "old" and "incoming" since nothing
                    // else has changed it since the conflicting commit.
                    let shared = entity.committed_serial_state().unwrap_or_default();
                    let working = entity.read_state(thread)?;
                    let resolver = entity.resolver_clone();
                    match resolver.and_then(|f| f(&shared, &working, &shared)) {
                        Some(resolved) => entity.write_whole_state(thread, resolved)?,
                        None => return Err(Error::WriteConflict(entity.oid().unwrap())),
                    }
                }
            }

            let state = entity.read_state(thread)?;
            let class_name = entity.class_name();
            self.log.write_version(entity.oid().unwrap(), &class_name, &state)?;
        }

        Ok(())
    }

    fn abort(&self, tx: &Transaction) {
        self.modified.lock().unwrap().remove(&tx.thread());
        self.pending_streams.lock().unwrap().remove(&tx.thread());
    }

    fn tpc_begin(&self, _tx: &Transaction) -> DResult<()> {
        self.log.begin()?;
        let after = *self.last_seen.lock().unwrap();
        self.replay(after)
    }

    fn tpc_vote(&self, tx: &Transaction) -> DResult<()> {
        self.synchronizer.vote(tx.thread()).map_err(|stuck| {
            Error::ObjectGraph(stuck.first().and_then(|e| e.oid()))
        })
    }

    fn tpc_finish(&self, tx: &Transaction, timestamp: Timestamp) -> DResult<()> {
        let offset = self.log.finish(timestamp)?;
        self.log.remember_offset(timestamp, offset);
        let thread = tx.thread();
        let modified = self.modified.lock().unwrap().remove(&thread).unwrap_or_default();
        for entity in modified {
            if let Some(state) = entity.checkin(thread) {
                entity.resolve(state, timestamp);
            }
        }
        *self.last_seen.lock().unwrap() = Some(timestamp);
        Ok(())
    }

    fn tpc_abort(&self, tx: &Transaction, timestamp: Timestamp) {
        if let Err(err) = self.log.abort(timestamp) {
            warn!("tpc_abort failed to write abort record: {err}");
        }
        let thread = tx.thread();
        if let Some(modified) = self.modified.lock().unwrap().remove(&thread) {
            for entity in modified {
                entity.checkin(thread);
            }
        }
    }
}
