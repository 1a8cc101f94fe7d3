//! The persistent object model (component C).
//!
//! A dynamically typed object model would swap an object's class between a
//! "broken" placeholder and its real type by rebinding that slot at runtime.
//! Rust has no such trick, so the identity that survives a broken -> real
//! transition here is `Arc<Entity>`, not a concrete Rust type: `Entity` is
//! the type-erased core every persistent object shares (an oid, a serial, a
//! name -> value state), and `Handle<T>`
//! is a thin typed view over it that materializes a concrete `T` on demand
//! via `PersistentClass::to_state`/`from_state`. Resolving a placeholder
//! just fills in `Entity::shared` in place; every `Handle` already pointing
//! at that `Arc<Entity>` sees the resolved state on its next read.
//!
//! The same per-thread working-copy mechanism backs both plain persistent
//! objects and `PersistentDict`: since `State` is already dict-shaped, a
//! dict only needs to expose the granular per-key `Slot` API that a plain
//! object's `to_state`/`from_state` round trip hides.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::ThreadId;

use crate::database::DatabaseInner;
use crate::error::{DResult, Error};
use crate::oid::{Oid, Timestamp};
use crate::value::{State, Value};

/// Implemented by every concrete persistent type. `to_state`/`from_state`
/// are the only place application code needs to touch the generic `Value`
/// tree; everything else operates on `Entity` directly.
pub trait PersistentClass: Sized + Send + Sync + 'static {
    /// Fully-qualified name recorded alongside `oid://` references so a
    /// forward reference can construct a `Broken` placeholder of the right
    /// shape before the real object has been loaded.
    fn class_name() -> &'static str;

    fn to_state(&self) -> State;

    fn from_state(state: &State) -> DResult<Self>;
}

/// One thread's uncommitted view of a key within an object's state.
/// `Delete` is a tombstone distinct from "absent"; the distinction is what
/// lets `checkin` tell "this transaction deleted key k" apart from "this
/// transaction never touched key k".
#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Present(Value),
    Delete,
}

/// A thread's accumulated, uncommitted edits to an object's state, taken as
/// a diff against the `base` snapshot observed at `checkout` time. A fresh
/// `WorkingCopy` is created on every `checkout` and discarded entirely at
/// `checkin`, so there's no long-lived per-thread state to reconcile across
/// many checkout/checkin cycles.
#[derive(Debug, Clone)]
struct WorkingCopy {
    base: State,
    edits: HashMap<String, Slot>,
    /// Set by `clear()`. Once set, reads through this working copy ignore
    /// `base` entirely — only keys written via `edits` since the clear are
    /// visible — matching the mapping variant's `EMPTY` marker.
    empty: bool,
}

impl WorkingCopy {
    fn new(base: State) -> Self {
        Self { base, edits: HashMap::new(), empty: false }
    }

    fn get(&self, key: &str) -> Option<Value> {
        match self.edits.get(key) {
            Some(Slot::Present(v)) => Some(v.clone()),
            Some(Slot::Delete) => None,
            None if self.empty => None,
            None => self.base.get(key).cloned(),
        }
    }

    fn set(&mut self, key: impl Into<String>, value: Value) {
        self.edits.insert(key.into(), Slot::Present(value));
    }

    fn delete(&mut self, key: &str) {
        if self.empty {
            if self.edits.contains_key(key) {
                self.edits.insert(key.to_string(), Slot::Delete);
            }
        } else if self.base.contains_key(key) || self.edits.contains_key(key) {
            self.edits.insert(key.to_string(), Slot::Delete);
        }
    }

    /// Sets the `EMPTY` marker and drops every prior edit: nothing before
    /// this point, from `base` or from earlier edits, survives it.
    fn clear(&mut self) {
        self.empty = true;
        self.edits.clear();
    }

    fn is_dirty(&self) -> bool {
        self.empty || !self.edits.is_empty()
    }

    /// Union of base keys and edited keys, with deletions applied, in a
    /// deterministic order. If `EMPTY` is set, `base` is omitted entirely:
    /// only keys written since the clear are present.
    fn materialize(&self) -> State {
        let mut out = if self.empty { State::new() } else { self.base.clone() };
        for (key, slot) in &self.edits {
            match slot {
                Slot::Present(v) => {
                    out.insert(key.clone(), v.clone());
                }
                Slot::Delete => {
                    out.remove(key);
                }
            }
        }
        out
    }
}

/// The type-erased, shared core of a persistent object. One `Entity` exists
/// per oid per process; every `Handle<T>` and every `PersistentDict` wraps
/// an `Arc<Entity>`.
pub struct Entity {
    /// `u64::MAX` until an oid is minted on first commit: an oid is
    /// nullable until then.
    oid: AtomicU64,
    pub(crate) jar: RwLock<Weak<DatabaseInner>>,
    /// Class name recorded at creation time or learned from a forward
    /// reference, used to materialize `Broken` placeholders.
    pub(crate) class_name: RwLock<String>,
    /// `None` while this entity is a `Broken` placeholder that has not yet
    /// been resolved against the log.
    pub(crate) shared: RwLock<Option<SharedState>>,
    pub(crate) local: Mutex<HashMap<ThreadId, WorkingCopy>>,
    /// User-supplied conflict resolver, consulted at commit time when this
    /// object's committed serial has moved past the transaction's view.
    pub(crate) resolver: RwLock<Option<Arc<dyn Fn(&State, &State, &State) -> Option<State> + Send + Sync>>>,
}

/// The committed, read-only state visible to new transactions once an
/// object has been resolved.
#[derive(Debug, Clone)]
pub(crate) struct SharedState {
    pub state: State,
    /// Commit timestamp of the version currently installed in `state`.
    pub serial: Timestamp,
}

/// Sentinel stored in `Entity::oid` before an oid has been minted.
const UNASSIGNED: u64 = u64::MAX;

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("oid", &self.oid())
            .field("class_name", &*self.class_name.read().unwrap())
            .field("broken", &self.shared.read().unwrap().is_none())
            .finish()
    }
}

impl Entity {
    pub fn new_local(class_name: &'static str, state: State) -> Arc<Entity> {
        Arc::new(Entity {
            oid: AtomicU64::new(UNASSIGNED),
            jar: RwLock::new(Weak::new()),
            class_name: RwLock::new(class_name.to_string()),
            shared: RwLock::new(Some(SharedState { state, serial: 0 })),
            local: Mutex::new(HashMap::new()),
            resolver: RwLock::new(None),
        })
    }

    /// Constructs a `Broken` placeholder for a forward reference: same oid,
    /// same identity going forward, but no state until `resolve` runs.
    pub(crate) fn new_broken(oid: Oid, class_name: String, jar: Weak<DatabaseInner>) -> Arc<Entity> {
        Arc::new(Entity {
            oid: AtomicU64::new(oid),
            jar: RwLock::new(jar),
            class_name: RwLock::new(class_name),
            shared: RwLock::new(None),
            local: Mutex::new(HashMap::new()),
            resolver: RwLock::new(None),
        })
    }

    /// `None` until this object has survived its first commit.
    pub fn oid(&self) -> Option<Oid> {
        match self.oid.load(Ordering::SeqCst) {
            UNASSIGNED => None,
            oid => Some(oid),
        }
    }

    /// Mints an oid for a previously new object. Panics if one is already
    /// assigned; callers (`Database::add`/`set_root`) must only call this
    /// once per entity.
    pub(crate) fn assign_oid(&self, oid: Oid) {
        let prev = self.oid.swap(oid, Ordering::SeqCst);
        debug_assert_eq!(prev, UNASSIGNED, "oid reassignment on entity {oid}");
    }

    pub fn is_broken(&self) -> bool {
        self.shared.read().unwrap().is_none()
    }

    pub fn class_name(&self) -> String {
        self.class_name.read().unwrap().clone()
    }

    pub(crate) fn has_jar(&self) -> bool {
        self.jar.read().unwrap().upgrade().is_some()
    }

    pub(crate) fn jar(&self) -> Weak<DatabaseInner> {
        self.jar.read().unwrap().clone()
    }

    /// Binds this entity to a database. An object's jar never changes once
    /// assigned; rejecting a rebind to a different jar entirely is the
    /// caller's responsibility.
    pub(crate) fn set_jar(&self, jar: Weak<DatabaseInner>) {
        *self.jar.write().unwrap() = jar;
    }

    /// Removes the calling thread's working copy without returning its
    /// contents, forcing the next access to re-snapshot from shared state.
    /// Used by the synchronizer's `new_transaction` hook.
    pub(crate) fn force_recheckout(&self, thread: ThreadId) {
        self.local.lock().unwrap().remove(&thread);
    }

    pub fn set_resolver<F>(&self, resolver: F)
    where
        F: Fn(&State, &State, &State) -> Option<State> + Send + Sync + 'static,
    {
        *self.resolver.write().unwrap() = Some(Arc::new(resolver));
    }

    /// Fills in state for a previously broken placeholder, or overwrites the
    /// committed state of a resolved one (used when catching up on log
    /// entries written by another process).
    pub(crate) fn resolve(&self, state: State, serial: Timestamp) {
        *self.shared.write().unwrap() = Some(SharedState { state, serial });
    }

    pub(crate) fn committed_serial(&self) -> Option<Timestamp> {
        self.shared.read().unwrap().as_ref().map(|s| s.serial)
    }

    /// The committed state as of the last resolve, used as the "old"
    /// (pre-transaction) shared state handed to a conflict resolver.
    pub(crate) fn committed_serial_state(&self) -> Option<State> {
        self.shared.read().unwrap().as_ref().map(|s| s.state.clone())
    }

    pub(crate) fn resolver_clone(&self) -> Option<Arc<dyn Fn(&State, &State, &State) -> Option<State> + Send + Sync>> {
        self.resolver.read().unwrap().clone()
    }

    /// Starts (or returns the existing) per-thread working copy for the
    /// calling thread, snapshotting committed state as of right now.
    fn checkout(&self, thread: ThreadId) -> DResult<()> {
        let mut local = self.local.lock().unwrap();
        if local.contains_key(&thread) {
            return Ok(());
        }
        let shared = self.shared.read().unwrap();
        let base = match shared.as_ref() {
            Some(s) => s.state.clone(),
            None => {
                return Err(Error::TypeError(format!(
                    "cannot check out broken object (oid={:?})",
                    self.oid()
                )))
            }
        };
        local.insert(thread, WorkingCopy::new(base));
        Ok(())
    }

    pub(crate) fn get(&self, thread: ThreadId, key: &str) -> DResult<Option<Value>> {
        self.checkout(thread)?;
        let local = self.local.lock().unwrap();
        Ok(local.get(&thread).unwrap().get(key))
    }

    pub(crate) fn read_state(&self, thread: ThreadId) -> DResult<State> {
        self.checkout(thread)?;
        let local = self.local.lock().unwrap();
        Ok(local.get(&thread).unwrap().materialize())
    }

    pub(crate) fn set(&self, thread: ThreadId, key: impl Into<String>, value: Value) -> DResult<()> {
        self.checkout(thread)?;
        let mut local = self.local.lock().unwrap();
        local.get_mut(&thread).unwrap().set(key, value);
        Ok(())
    }

    pub(crate) fn delete(&self, thread: ThreadId, key: &str) -> DResult<()> {
        self.checkout(thread)?;
        let mut local = self.local.lock().unwrap();
        local.get_mut(&thread).unwrap().delete(key);
        Ok(())
    }

    /// Sets the `EMPTY` marker on the calling thread's working copy, so
    /// subsequent reads on this thread ignore shared-state keys entirely.
    pub(crate) fn clear(&self, thread: ThreadId) -> DResult<()> {
        self.checkout(thread)?;
        let mut local = self.local.lock().unwrap();
        local.get_mut(&thread).unwrap().clear();
        Ok(())
    }

    pub(crate) fn write_whole_state(&self, thread: ThreadId, state: State) -> DResult<()> {
        self.checkout(thread)?;
        let mut local = self.local.lock().unwrap();
        let wc = local.get_mut(&thread).unwrap();
        let keys: Vec<String> = wc.materialize().keys().cloned().collect();
        for key in keys {
            if !state.contains_key(&key) {
                wc.delete(&key);
            }
        }
        for (key, value) in state {
            wc.set(key, value);
        }
        Ok(())
    }

    pub(crate) fn is_dirty(&self, thread: ThreadId) -> bool {
        self.local
            .lock()
            .unwrap()
            .get(&thread)
            .map(|wc| wc.is_dirty())
            .unwrap_or(false)
    }

    /// Clears the calling thread's working copy, discarding uncommitted
    /// edits (abort) or retiring them after a successful checkin (commit).
    pub(crate) fn checkin(&self, thread: ThreadId) -> Option<State> {
        self.local.lock().unwrap().remove(&thread).map(|wc| wc.materialize())
    }

    pub(crate) fn has_working_copy(&self, thread: ThreadId) -> bool {
        self.local.lock().unwrap().contains_key(&thread)
    }
}

/// A typed, cloneable handle over a persistent object's shared `Entity`.
/// Cloning a `Handle` does not clone the object; it clones the reference,
/// same as Python attribute access returning the same instance every time.
pub struct Handle<T: PersistentClass> {
    pub(crate) entity: Arc<Entity>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: PersistentClass> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Handle { entity: self.entity.clone(), _marker: std::marker::PhantomData }
    }
}

impl<T: PersistentClass> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.entity.oid()).finish()
    }
}

impl<T: PersistentClass> Handle<T> {
    pub fn new(value: T) -> Self {
        Handle { entity: Entity::new_local(T::class_name(), value.to_state()), _marker: std::marker::PhantomData }
    }

    /// Wraps an existing entity (e.g. one returned by `Database::get_root`
    /// or `Database::get`) as a typed view over it.
    pub fn from_entity(entity: Arc<Entity>) -> Self {
        Handle { entity, _marker: std::marker::PhantomData }
    }

    pub fn oid(&self) -> Option<Oid> {
        self.entity.oid()
    }

    pub fn is_broken(&self) -> bool {
        self.entity.is_broken()
    }

    /// The underlying type-erased entity, for passing to `Database`
    /// operations (`set_root`, `add`, `save`, `embed_stream`) that work at
    /// the entity level so they don't need to be generic over `T`.
    pub fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    /// Reads the current attribute set, materializing `T` from the
    /// thread-local working copy (creating one from committed state if this
    /// is the first touch this transaction). Errors if the object is still
    /// broken.
    pub fn read(&self) -> DResult<T> {
        if self.entity.is_broken() {
            return Err(Error::TypeError(format!(
                "attribute access on broken object (oid={:?})",
                self.entity.oid()
            )));
        }
        let thread = std::thread::current().id();
        let state = self.entity.read_state(thread)?;
        T::from_state(&state)
    }

    /// Replaces the whole attribute set in the calling thread's working
    /// copy. Marks the object dirty for this transaction even if the new
    /// state happens to equal the old one, matching `__setattr__` always
    /// registering with the current transaction in the original.
    pub fn write(&self, value: &T) -> DResult<()> {
        if self.entity.is_broken() {
            return Err(Error::TypeError(format!(
                "attribute write on broken object (oid={:?})",
                self.entity.oid()
            )));
        }
        let thread = std::thread::current().id();
        self.entity.write_whole_state(thread, value.to_state())
    }

    pub fn set_resolver<F>(&self, resolver: F)
    where
        F: Fn(&State, &State, &State) -> Option<State> + Send + Sync + 'static,
    {
        self.entity.set_resolver(resolver);
    }
}

/// A name -> value mapping backed directly by an object's working copy,
/// exposing a granular per-key API as the "mapping variant" of a persistent
/// object.
#[derive(Clone)]
pub struct PersistentDict {
    pub(crate) entity: Arc<Entity>,
}

impl PersistentClass for PersistentDict {
    fn class_name() -> &'static str {
        "dobbin::PersistentDict"
    }

    fn to_state(&self) -> State {
        // Only reached via `Handle::write_whole_state` bookkeeping; a
        // `PersistentDict` otherwise talks to `Entity` directly.
        self.entity.read_state(std::thread::current().id()).unwrap_or_default()
    }

    fn from_state(state: &State) -> DResult<Self> {
        Ok(PersistentDict { entity: Entity::new_local(Self::class_name(), state.clone()) })
    }
}

impl PersistentDict {
    pub fn new() -> Self {
        PersistentDict { entity: Entity::new_local(Self::class_name(), State::new()) }
    }

    /// Wraps an existing entity (e.g. one returned by `Database::get_root`
    /// or `Database::get`) as a `PersistentDict` view over it.
    pub fn from_entity(entity: Arc<Entity>) -> Self {
        PersistentDict { entity }
    }

    pub fn oid(&self) -> Option<Oid> {
        self.entity.oid()
    }

    /// The underlying type-erased entity, for passing to `Database`
    /// operations that work at the entity level (`set_root`, `add`, `save`).
    pub fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    pub fn get(&self, key: &str) -> DResult<Option<Value>> {
        self.entity.get(std::thread::current().id(), key)
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> DResult<()> {
        self.entity.set(std::thread::current().id(), key, value)
    }

    pub fn delete(&self, key: &str) -> DResult<()> {
        self.entity.delete(std::thread::current().id(), key)
    }

    pub fn contains_key(&self, key: &str) -> DResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Discards every key, including ones only present in shared state:
    /// marks the calling thread's working copy `EMPTY` rather than deleting
    /// keys one at a time, so a concurrent writer's unrelated key additions
    /// to shared state don't resurface after this thread's own checkout.
    pub fn clear(&self) -> DResult<()> {
        self.entity.clear(std::thread::current().id())
    }

    pub fn keys(&self) -> DResult<Vec<String>> {
        Ok(self.entity.read_state(std::thread::current().id())?.into_keys().collect())
    }

    pub fn values(&self) -> DResult<Vec<Value>> {
        Ok(self.entity.read_state(std::thread::current().id())?.into_values().collect())
    }

    pub fn items(&self) -> DResult<Vec<(String, Value)>> {
        Ok(self.entity.read_state(std::thread::current().id())?.into_iter().collect())
    }

    pub fn len(&self) -> DResult<usize> {
        Ok(self.entity.read_state(std::thread::current().id())?.len())
    }

    pub fn is_empty(&self) -> DResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Removes `key` and returns its previous value, or `None` if absent.
    pub fn pop(&self, key: &str) -> DResult<Option<Value>> {
        let thread = std::thread::current().id();
        let previous = self.entity.get(thread, key)?;
        if previous.is_some() {
            self.entity.delete(thread, key)?;
        }
        Ok(previous)
    }

    /// Removes and returns an arbitrary `(key, value)` pair, or `None` if
    /// the dict is empty. Ordering follows `State`'s own key order (`State`
    /// is a `BTreeMap`), so "arbitrary" here means "the first key" rather
    /// than insertion order.
    pub fn popitem(&self) -> DResult<Option<(String, Value)>> {
        let thread = std::thread::current().id();
        let state = self.entity.read_state(thread)?;
        let Some((key, value)) = state.into_iter().next() else {
            return Ok(None);
        };
        self.entity.delete(thread, &key)?;
        Ok(Some((key, value)))
    }

    /// Returns the current value for `key`, inserting `default` first if
    /// absent.
    pub fn setdefault(&self, key: impl Into<String>, default: Value) -> DResult<Value> {
        let key = key.into();
        let thread = std::thread::current().id();
        if let Some(existing) = self.entity.get(thread, &key)? {
            return Ok(existing);
        }
        self.entity.set(thread, key, default.clone())?;
        Ok(default)
    }

    /// Merges every key/value pair from `other` into this dict, overwriting
    /// any existing keys in common.
    pub fn update(&self, other: State) -> DResult<()> {
        let thread = std::thread::current().id();
        for (key, value) in other {
            self.entity.set(thread, key, value)?;
        }
        Ok(())
    }
}

impl Default for PersistentDict {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        value: i64,
    }

    impl PersistentClass for Counter {
        fn class_name() -> &'static str {
            "tests::Counter"
        }
        fn to_state(&self) -> State {
            let mut s = State::new();
            s.insert("value".into(), Value::Int(self.value));
            s
        }
        fn from_state(state: &State) -> DResult<Self> {
            match state.get("value") {
                Some(Value::Int(v)) => Ok(Counter { value: *v }),
                _ => Err(Error::TypeError("missing value".into())),
            }
        }
    }

    #[test]
    fn write_then_read_reflects_own_uncommitted_write() {
        let handle = Handle::new(Counter { value: 1 });
        handle.write(&Counter { value: 2 }).unwrap();
        assert_eq!(handle.read().unwrap().value, 2);
    }

    #[test]
    fn dict_delete_is_a_tombstone_distinct_from_absent() {
        let dict = PersistentDict::new();
        dict.set("a", Value::Int(1)).unwrap();
        assert!(dict.contains_key("a").unwrap());
        dict.delete("a").unwrap();
        assert!(!dict.contains_key("a").unwrap());
        assert_eq!(dict.keys().unwrap().len(), 0);
    }

    #[test]
    fn broken_entity_rejects_checkout() {
        let entity = Entity::new_broken(7, "tests::Counter".into(), Weak::new());
        let handle: Handle<Counter> = Handle::from_entity(entity);
        assert!(handle.read().is_err());
    }

    #[test]
    fn dict_pop_removes_and_returns_the_previous_value() {
        let dict = PersistentDict::new();
        dict.set("a", Value::Int(1)).unwrap();
        assert_eq!(dict.pop("a").unwrap(), Some(Value::Int(1)));
        assert_eq!(dict.pop("a").unwrap(), None);
        assert!(!dict.contains_key("a").unwrap());
    }

    #[test]
    fn dict_setdefault_only_inserts_when_absent() {
        let dict = PersistentDict::new();
        assert_eq!(dict.setdefault("a", Value::Int(1)).unwrap(), Value::Int(1));
        assert_eq!(dict.setdefault("a", Value::Int(2)).unwrap(), Value::Int(1));
    }

    #[test]
    fn dict_update_overwrites_existing_keys() {
        let dict = PersistentDict::new();
        dict.set("a", Value::Int(1)).unwrap();
        let mut patch = State::new();
        patch.insert("a".into(), Value::Int(2));
        patch.insert("b".into(), Value::Int(3));
        dict.update(patch).unwrap();
        assert_eq!(dict.get("a").unwrap(), Some(Value::Int(2)));
        assert_eq!(dict.get("b").unwrap(), Some(Value::Int(3)));
    }

    #[test]
    fn dict_clear_erases_shared_keys_for_this_thread() {
        let dict = PersistentDict::new();
        dict.set("a", Value::Int(1)).unwrap();
        dict.set("b", Value::Int(2)).unwrap();
        dict.clear().unwrap();
        assert!(dict.is_empty().unwrap());
        assert_eq!(dict.get("a").unwrap(), None);

        dict.set("c", Value::Int(3)).unwrap();
        assert_eq!(dict.keys().unwrap(), vec!["c".to_string()]);
    }

    #[test]
    fn dict_popitem_drains_the_dict() {
        let dict = PersistentDict::new();
        dict.set("a", Value::Int(1)).unwrap();
        dict.set("b", Value::Int(2)).unwrap();
        let mut drained = Vec::new();
        while let Some(pair) = dict.popitem().unwrap() {
            drained.push(pair);
        }
        assert_eq!(drained.len(), 2);
        assert!(dict.is_empty().unwrap());
    }
}
