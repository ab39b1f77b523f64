use std::any::{type_name, Any, TypeId};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::coordination::Coordination;
use crate::error::{fail, ProtocolViolation};
use crate::lock;
use crate::Outcome;
#[cfg(feature = "stats")]
use crate::StoreStats;

/// Number of registry entries, live or lapsed, after which a commit first sweeps
/// lapsed entries out of the store.
pub const DEFAULT_PRUNE_THRESHOLD: usize = 64;

pub(crate) type ErasedInstance = Arc<dyn Any + Send + Sync>;
type ErasedWeak = Weak<dyn Any + Send + Sync>;
type EntryMap<K> = HashMap<TypeId, HashMap<K, ErasedWeak>>;

/// The instance a construction session has staked out for commit.
pub(crate) struct Staged {
    pub(crate) instance: ErasedInstance,
    pub(crate) type_name: &'static str,
}

/// Per-store construction state. Only ever touched by the thread holding the
/// construction lock.
#[derive(Default)]
struct Session {
    building: bool,
    staged: Option<Staged>,
}

/// A store of flyweight instances, each uniquely identified by its type and a key.
///
/// The store never builds instances and never keeps them alive: it holds weak
/// references only, so an entry lapses as soon as the last `Arc` held by the
/// embedding code is dropped. What the store does is coordinate *who* builds an
/// instance, so that at most one live instance exists per `(type, key)` even when
/// many threads ask for the same key at once.
///
/// # Construction protocol
///
/// 1. [`coordinate`](Self::coordinate) opens a scope for a type and key. It takes
///    the process-wide construction lock, which is held until the scope is dropped.
/// 2. The scope's [`outcome`](Coordination::outcome) either hands back the existing
///    instance or tells the caller to build one.
/// 3. The caller builds the instance and [`register`](Self::register)s it.
/// 4. [`commit`](Coordination::commit) checks the registered instance and records
///    it under the key.
///
/// Leaving the scope any other way (an early return, `?`, a panic) rolls the
/// session back: nothing is recorded for the key.
///
/// [`get_or_build`](Self::get_or_build) and [`get_or_try_build`](Self::get_or_try_build)
/// run the whole protocol around a closure and are what most callers want.
///
/// # Type Parameters
///
/// * `K` - The key type. Keys are namespaced by instance type, so two types can
///   use the same key value without colliding.
///
/// # Examples
///
/// ```
/// use flyweight_core::InstanceStore;
/// use once_cell::sync::Lazy;
/// use std::sync::Arc;
///
/// #[derive(Debug, PartialEq)]
/// struct Fraction {
///     num: i64,
///     den: i64,
/// }
///
/// static FRACTIONS: Lazy<InstanceStore<(i64, i64)>> = Lazy::new(InstanceStore::new);
///
/// fn fraction(num: i64, den: i64) -> Result<Arc<Fraction>, String> {
///     FRACTIONS.get_or_try_build((num, den), || {
///         if den == 0 {
///             return Err("division by zero".to_string());
///         }
///         Ok(Fraction { num, den })
///     })
/// }
///
/// let half = fraction(1, 2).unwrap();
/// assert!(Arc::ptr_eq(&half, &fraction(1, 2).unwrap()));
///
/// assert!(fraction(1, 0).is_err());
/// assert!(FRACTIONS.get::<Fraction, _>(&(1, 0)).is_none());
/// ```
pub struct InstanceStore<K> {
    entries: RwLock<EntryMap<K>>,
    session: Mutex<Session>,
    prune_threshold: usize,
    next_prune: AtomicUsize,
    #[cfg(feature = "stats")]
    stats: StoreStats,
}

impl<K> InstanceStore<K> {
    /// Creates an empty store with the [default prune threshold](DEFAULT_PRUNE_THRESHOLD).
    pub fn new() -> Self {
        Self::with_prune_threshold(DEFAULT_PRUNE_THRESHOLD)
    }

    /// Creates an empty store that sweeps lapsed entries once it holds
    /// `threshold` entries.
    ///
    /// After each sweep the next one is scheduled at twice the number of live
    /// entries (never below `threshold`), so sweeping stays amortized O(1) per
    /// commit. A threshold of zero is treated as one.
    pub fn with_prune_threshold(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            entries: RwLock::new(HashMap::new()),
            session: Mutex::new(Session::default()),
            prune_threshold: threshold,
            next_prune: AtomicUsize::new(threshold),
            #[cfg(feature = "stats")]
            stats: StoreStats::new(),
        }
    }

    /// Returns the statistics of this store.
    #[cfg(feature = "stats")]
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }
}

impl<K> Default for InstanceStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> InstanceStore<K>
where
    K: Hash + Eq,
{
    /// Returns the live instance of type `T` registered under `key`, if any.
    ///
    /// Lookups do not take the construction lock and never block on a
    /// construction in progress; an instance becomes visible once its
    /// session commits.
    ///
    /// # Examples
    ///
    /// ```
    /// use flyweight_core::InstanceStore;
    /// use std::sync::Arc;
    ///
    /// let store: InstanceStore<String> = InstanceStore::new();
    /// let answer = store.get_or_build("answer".to_string(), || 42u64);
    ///
    /// // Any borrowed form of the key works.
    /// assert_eq!(store.get::<u64, str>("answer").as_deref(), Some(&42));
    /// // Keys are namespaced by type.
    /// assert!(store.get::<i32, str>("answer").is_none());
    ///
    /// drop(answer);
    /// assert!(store.get::<u64, str>("answer").is_none());
    /// ```
    pub fn get<T, Q>(&self, key: &Q) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let found = self.lookup::<T, Q>(key);

        #[cfg(feature = "stats")]
        {
            if found.is_some() {
                self.stats.record_hit();
            } else {
                self.stats.record_miss();
            }
        }

        tracing::trace!(
            type_name = type_name::<T>(),
            found = found.is_some(),
            "flyweight lookup"
        );
        found
    }

    /// Returns `true` if a live instance of type `T` is registered under `key`.
    pub fn contains<T, Q>(&self, key: &Q) -> bool
    where
        T: Any + Send + Sync,
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lookup::<T, Q>(key).is_some()
    }

    /// Opens a coordination scope for the instance of type `T` identified by `key`.
    ///
    /// Blocks while any other thread in the process is inside a coordination scope
    /// of any store. The returned scope holds the construction lock until it is
    /// dropped; its [`outcome`](Coordination::outcome) tells the caller what to do:
    ///
    /// - [`Outcome::Existing`]: the instance already exists, nothing else to do.
    /// - [`Outcome::BuildHere`]: build the instance, [`register`](Self::register) it
    ///   and [`commit`](Coordination::commit) the scope.
    /// - [`Outcome::Deferred`]: this store is already building on this thread; build
    ///   and register the instance, the outer scope commits it.
    ///
    /// # Panics
    ///
    /// Panics with [`ProtocolViolation::CoordinateAfterRegister`] if an instance has
    /// already been registered in this store's unfinished session. See
    /// [`try_coordinate`](Self::try_coordinate) for the non-panicking variant.
    ///
    /// # Examples
    ///
    /// ```
    /// use flyweight_core::{InstanceStore, Outcome};
    /// use std::sync::Arc;
    ///
    /// let store: InstanceStore<u8> = InstanceStore::new();
    ///
    /// let scope = store.coordinate::<String>(1);
    /// let built = match scope.outcome() {
    ///     Outcome::Existing(instance) => Arc::clone(instance),
    ///     Outcome::BuildHere | Outcome::Deferred => {
    ///         let instance = Arc::new("one".to_string());
    ///         store.register(Arc::clone(&instance));
    ///         instance
    ///     }
    /// };
    /// scope.commit();
    ///
    /// assert!(Arc::ptr_eq(&built, &store.get::<String, _>(&1).unwrap()));
    /// ```
    #[track_caller]
    pub fn coordinate<T>(&self, key: K) -> Coordination<'_, K, T>
    where
        T: Any + Send + Sync,
    {
        match self.try_coordinate(key) {
            Ok(scope) => scope,
            Err(violation) => fail(violation),
        }
    }

    /// Like [`coordinate`](Self::coordinate), but returns the protocol violation
    /// instead of panicking. The construction lock is released before returning
    /// an error.
    pub fn try_coordinate<T>(&self, key: K) -> Result<Coordination<'_, K, T>, ProtocolViolation>
    where
        T: Any + Send + Sync,
    {
        let guard = lock::acquire();
        let mut session = self.session.lock();

        if session.staged.is_some() {
            return Err(ProtocolViolation::CoordinateAfterRegister);
        }

        if session.building {
            #[cfg(feature = "stats")]
            self.stats.record_deferral();
            tracing::trace!(
                type_name = type_name::<T>(),
                "deferring to the construction already in progress"
            );
            return Ok(Coordination::passive(self, Outcome::Deferred, guard));
        }

        if let Some(existing) = self.lookup::<T, K>(&key) {
            #[cfg(feature = "stats")]
            self.stats.record_hit();
            return Ok(Coordination::passive(self, Outcome::Existing(existing), guard));
        }

        session.building = true;
        #[cfg(feature = "stats")]
        self.stats.record_miss();
        tracing::trace!(type_name = type_name::<T>(), "starting flyweight construction");
        Ok(Coordination::building(self, key, guard))
    }

    /// Stakes out `instance` as the one to commit in the current construction
    /// session.
    ///
    /// Returns `true` if the instance was staked out. When this store has no
    /// construction in progress the call is ignored and returns `false`; a call
    /// made from a thread other than the builder waits for the builder to finish
    /// and is then ignored as well.
    ///
    /// # Panics
    ///
    /// Panics with [`ProtocolViolation::DuplicateRegistration`] if an instance was
    /// already registered in the current session. See
    /// [`try_register`](Self::try_register) for the non-panicking variant.
    #[track_caller]
    pub fn register<U>(&self, instance: Arc<U>) -> bool
    where
        U: Any + Send + Sync,
    {
        match self.try_register(instance) {
            Ok(staked) => staked,
            Err(violation) => fail(violation),
        }
    }

    /// Like [`register`](Self::register), but returns the protocol violation
    /// instead of panicking.
    pub fn try_register<U>(&self, instance: Arc<U>) -> Result<bool, ProtocolViolation>
    where
        U: Any + Send + Sync,
    {
        let _guard = lock::acquire();
        let mut session = self.session.lock();

        if !session.building {
            tracing::warn!(
                type_name = type_name::<U>(),
                "ignoring registration outside of a construction session"
            );
            return Ok(false);
        }
        if session.staged.is_some() {
            return Err(ProtocolViolation::DuplicateRegistration);
        }

        session.staged = Some(Staged {
            instance,
            type_name: type_name::<U>(),
        });
        Ok(true)
    }

    /// Returns the instance registered under `key`, building it with `build` if no
    /// live instance exists.
    ///
    /// `build` runs at most once per live instance across all threads: concurrent
    /// callers for the same key wait and then receive the instance built by the
    /// first one. If `build` panics, nothing is recorded for the key.
    pub fn get_or_build<T, F>(&self, key: K, build: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        match self.get_or_try_build::<T, Infallible, _>(key, || Ok(build())) {
            Ok(instance) => instance,
            Err(never) => match never {},
        }
    }

    /// Returns the instance registered under `key`, building it with `build` if no
    /// live instance exists.
    ///
    /// An error returned by `build` is passed through unchanged, and nothing is
    /// recorded for the key.
    ///
    /// When called from within a construction already in progress on this store
    /// (a [`Deferred`](Outcome::Deferred) scope), the instance is built and
    /// registered here but committed by the outer scope.
    pub fn get_or_try_build<T, E, F>(&self, key: K, build: F) -> Result<Arc<T>, E>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T, E>,
    {
        let scope = self.coordinate::<T>(key);
        if let Outcome::Existing(instance) = scope.outcome() {
            return Ok(Arc::clone(instance));
        }

        let instance = Arc::new(build()?);
        self.register(Arc::clone(&instance));
        scope.commit();
        Ok(instance)
    }

    /// Returns the number of live instances in the store.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .values()
            .flat_map(HashMap::values)
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Returns `true` if the store holds no live instance.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every lapsed entry right away and returns how many were removed.
    ///
    /// Lapsed entries are invisible to lookups either way; commits also sweep them
    /// periodically. This is for callers that want the memory back now.
    pub fn prune(&self) -> usize {
        let _guard = lock::acquire();
        let mut entries = self.entries.write();
        let removed = prune_lapsed(&mut entries);
        let live: usize = entries.values().map(HashMap::len).sum();
        self.schedule_next_prune(live);
        tracing::debug!(removed, live, "pruned lapsed flyweight entries");
        removed
    }

    fn lookup<T, Q>(&self, key: &Q) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entries = self.entries.read();
        let weak = entries.get(&TypeId::of::<T>())?.get(key)?;
        weak.upgrade()?.downcast::<T>().ok()
    }

    /// Records `instance` as the type-`T` entry for `key`.
    ///
    /// Callers must hold the construction lock.
    pub(crate) fn insert_entry<T: Any>(&self, key: K, instance: &ErasedInstance) {
        let mut entries = self.entries.write();
        entries
            .entry(TypeId::of::<T>())
            .or_default()
            .insert(key, Arc::downgrade(instance));

        let total: usize = entries.values().map(HashMap::len).sum();
        if total >= self.next_prune.load(Ordering::Relaxed) {
            let removed = prune_lapsed(&mut entries);
            let live = total - removed;
            self.schedule_next_prune(live);
            tracing::debug!(removed, live, "pruned lapsed flyweight entries");
        }
    }

    /// Removes the type-`T` entry for `key`, if any.
    ///
    /// Callers must hold the construction lock.
    pub(crate) fn remove_entry<T: Any>(&self, key: &K) {
        let type_id = TypeId::of::<T>();
        let mut entries = self.entries.write();
        if let Some(by_key) = entries.get_mut(&type_id) {
            by_key.remove(key);
            if by_key.is_empty() {
                entries.remove(&type_id);
            }
        }
    }

    fn schedule_next_prune(&self, live: usize) {
        let next = live.saturating_mul(2).max(self.prune_threshold);
        self.next_prune.store(next, Ordering::Relaxed);
    }
}

impl<K> InstanceStore<K> {
    /// Takes the staked-out instance out of the session.
    pub(crate) fn take_staged(&self) -> Option<Staged> {
        self.session.lock().staged.take()
    }

    /// Ends the construction session: clears the building flag and the staked-out
    /// slot.
    pub(crate) fn end_session(&self) {
        let staged = {
            let mut session = self.session.lock();
            session.building = false;
            session.staged.take()
        };
        // Dropped outside the session lock: this may be the last owner, and the
        // instance's own drop may call back into the store.
        drop(staged);
    }

    #[cfg(feature = "stats")]
    pub(crate) fn stats_ref(&self) -> &StoreStats {
        &self.stats
    }
}

impl<K> fmt::Debug for InstanceStore<K>
where
    K: Hash + Eq,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceStore")
            .field("live", &self.len())
            .field("prune_threshold", &self.prune_threshold)
            .finish_non_exhaustive()
    }
}

fn prune_lapsed<K>(entries: &mut EntryMap<K>) -> usize {
    let mut removed = 0;
    entries.retain(|_, by_key| {
        let before = by_key.len();
        by_key.retain(|_, weak| weak.strong_count() > 0);
        removed += before - by_key.len();
        !by_key.is_empty()
    });
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::construction_in_progress;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    #[derive(Debug, PartialEq)]
    struct Fraction {
        num: i64,
        den: i64,
    }

    #[derive(Debug)]
    struct DivisionByZero;

    fn fraction(
        store: &InstanceStore<(i64, i64)>,
        num: i64,
        den: i64,
    ) -> Result<Arc<Fraction>, DivisionByZero> {
        store.get_or_try_build((num, den), || {
            if den == 0 {
                return Err(DivisionByZero);
            }
            Ok(Fraction { num, den })
        })
    }

    #[test]
    fn test_lookup_after_commit() {
        let store: InstanceStore<(i64, i64)> = InstanceStore::new();
        assert!(store.get::<Fraction, _>(&(1, 2)).is_none());

        let half = fraction(&store, 1, 2).unwrap();
        let found = store.get::<Fraction, _>(&(1, 2)).unwrap();
        assert!(Arc::ptr_eq(&half, &found));
        assert_eq!(*found, Fraction { num: 1, den: 2 });
    }

    #[test]
    fn test_idempotent_lookups() {
        let store: InstanceStore<(i64, i64)> = InstanceStore::new();
        let _third = fraction(&store, 1, 3).unwrap();

        let first = store.get::<Fraction, _>(&(1, 3)).unwrap();
        let second = store.get::<Fraction, _>(&(1, 3)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_equal_keys_share_one_instance() {
        let store: InstanceStore<(i64, i64)> = InstanceStore::new();
        let a = fraction(&store, 2, 3).unwrap();
        let b = fraction(&store, 2, 3).unwrap();
        let c = fraction(&store, 3, 2).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_entries_lapse_with_their_owners() {
        let store: InstanceStore<(i64, i64)> = InstanceStore::new();
        let half = fraction(&store, 1, 2).unwrap();
        assert_eq!(store.len(), 1);

        drop(half);
        assert!(store.get::<Fraction, _>(&(1, 2)).is_none());
        assert!(store.is_empty());

        // A lapsed key is built afresh.
        let built = AtomicUsize::new(0);
        let _half = store.get_or_build((1, 2), || {
            built.fetch_add(1, Ordering::SeqCst);
            Fraction { num: 1, den: 2 }
        });
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_same_key_different_types_do_not_collide() {
        let store: InstanceStore<u32> = InstanceStore::new();
        let number = store.get_or_build(7, || 7u64);
        let name = store.get_or_build(7, || "seven".to_string());

        assert_eq!(*number, 7);
        assert_eq!(name.as_str(), "seven");
        assert_eq!(store.len(), 2);
        assert!(store.contains::<u64, _>(&7));
        assert!(store.contains::<String, _>(&7));
        assert!(!store.contains::<i8, _>(&7));
    }

    #[test]
    fn test_error_before_register_leaves_no_entry() {
        let store: InstanceStore<(i64, i64)> = InstanceStore::new();
        assert!(fraction(&store, 1, 0).is_err());
        assert!(store.get::<Fraction, _>(&(1, 0)).is_none());
        assert!(!construction_in_progress());
    }

    #[test]
    fn test_scope_dropped_after_register_rolls_back() {
        let store: InstanceStore<(i64, i64)> = InstanceStore::new();
        {
            let scope = store.coordinate::<Fraction>((1, 4));
            assert!(matches!(scope.outcome(), Outcome::BuildHere));
            assert!(store.register(Arc::new(Fraction { num: 1, den: 4 })));
            // Validation fails after the instance was staked out: leave without commit.
        }

        assert!(store.get::<Fraction, _>(&(1, 4)).is_none());
        assert!(!construction_in_progress());

        #[cfg(feature = "stats")]
        assert_eq!(store.stats().rollbacks(), 1);

        // The session was reset: the key can be built normally.
        let quarter = fraction(&store, 1, 4).unwrap();
        assert_eq!(quarter.den, 4);
    }

    #[test]
    fn test_panic_during_build_rolls_back() {
        let store: InstanceStore<(i64, i64)> = InstanceStore::new();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            store.get_or_build::<Fraction, _>((5, 6), || panic!("constructor exploded"))
        }));

        assert!(result.is_err());
        assert!(store.get::<Fraction, _>(&(5, 6)).is_none());
        assert!(!construction_in_progress());
        assert!(fraction(&store, 5, 6).is_ok());
    }

    #[test]
    fn test_existing_scope_holds_lock_until_dropped() {
        let store: InstanceStore<(i64, i64)> = InstanceStore::new();
        let _half = fraction(&store, 1, 2).unwrap();

        let scope = store.coordinate::<Fraction>((1, 2));
        assert!(scope.outcome().is_existing());
        assert!(construction_in_progress());
        assert!(!scope.is_building());
        drop(scope);
        assert!(!construction_in_progress());
    }

    #[test]
    fn test_reentrant_coordination_defers_to_outer_scope() {
        let store: InstanceStore<(i64, i64)> = InstanceStore::new();

        let outer = store.coordinate::<Fraction>((1, 2));
        assert!(matches!(outer.outcome(), Outcome::BuildHere));

        // Same type and key from the same thread: no deadlock, no uncommitted instance.
        let inner = store.coordinate::<Fraction>((1, 2));
        assert!(matches!(inner.outcome(), Outcome::Deferred));
        let half = Arc::new(Fraction { num: 1, den: 2 });
        assert!(store.register(Arc::clone(&half)));
        assert!(inner.commit().is_none());

        // Only the outer scope commits.
        assert!(store.get::<Fraction, _>(&(1, 2)).is_none());
        let committed = outer.commit().unwrap();
        assert!(Arc::ptr_eq(&committed, &half));
        assert!(Arc::ptr_eq(&store.get::<Fraction, _>(&(1, 2)).unwrap(), &half));

        #[cfg(feature = "stats")]
        {
            assert_eq!(store.stats().deferrals(), 1);
            assert_eq!(store.stats().builds(), 1);
        }
    }

    #[test]
    fn test_nested_build_is_committed_by_outer_scope() {
        let store: InstanceStore<(i64, i64)> = InstanceStore::new();

        let outer = store.coordinate::<Fraction>((3, 4));
        assert!(outer.is_building());

        let inner = fraction(&store, 3, 4).unwrap();
        let committed = outer.commit().unwrap();
        assert!(Arc::ptr_eq(&inner, &committed));
    }

    #[test]
    fn test_nested_failure_rolls_back_outer_scope() {
        let store: InstanceStore<(i64, i64)> = InstanceStore::new();

        let result = {
            let outer = store.coordinate::<Fraction>((9, 0));
            assert!(outer.is_building());
            fraction(&store, 9, 0)
        };

        assert!(result.is_err());
        assert!(store.get::<Fraction, _>(&(9, 0)).is_none());
        assert!(fraction(&store, 9, 1).is_ok());
    }

    #[test]
    fn test_nested_construction_in_other_store() {
        let points: InstanceStore<(i32, i32)> = InstanceStore::new();
        let segments: InstanceStore<((i32, i32), (i32, i32))> = InstanceStore::new();

        struct Segment {
            start: Arc<(i32, i32)>,
            end: Arc<(i32, i32)>,
        }

        let segment = segments.get_or_build(((0, 0), (1, 1)), || Segment {
            start: points.get_or_build((0, 0), || (0, 0)),
            end: points.get_or_build((1, 1), || (1, 1)),
        });

        assert!(Arc::ptr_eq(
            &segment.start,
            &points.get::<(i32, i32), _>(&(0, 0)).unwrap()
        ));
        assert!(Arc::ptr_eq(
            &segment.end,
            &points.get::<(i32, i32), _>(&(1, 1)).unwrap()
        ));
        assert!(!construction_in_progress());
    }

    #[test]
    fn test_type_mismatch_is_not_committed() {
        let store: InstanceStore<(i64, i64)> = InstanceStore::new();

        let scope = store.coordinate::<Fraction>((1, 2));
        store.register(Arc::new("not a fraction".to_string()));
        let violation = scope.try_commit().unwrap_err();

        assert_eq!(
            violation,
            ProtocolViolation::TypeMismatch {
                expected: type_name::<Fraction>(),
                found: type_name::<String>(),
            }
        );
        assert!(store.get::<Fraction, _>(&(1, 2)).is_none());
        assert!(store.get::<String, _>(&(1, 2)).is_none());
        assert!(!construction_in_progress());
        assert!(fraction(&store, 1, 2).is_ok());
    }

    #[test]
    #[should_panic(expected = "does not conform to the expected type")]
    fn test_type_mismatch_panics_on_commit() {
        let store: InstanceStore<u8> = InstanceStore::new();
        let scope = store.coordinate::<u64>(1);
        store.register(Arc::new(1u32));
        scope.commit();
    }

    #[test]
    fn test_commit_without_register() {
        let store: InstanceStore<u8> = InstanceStore::new();
        let scope = store.coordinate::<u64>(1);
        assert_eq!(
            scope.try_commit().unwrap_err(),
            ProtocolViolation::NothingRegistered
        );
        assert!(store.is_empty());
        assert!(!construction_in_progress());
    }

    #[test]
    fn test_duplicate_registration() {
        let store: InstanceStore<u8> = InstanceStore::new();
        let scope = store.coordinate::<u64>(1);

        assert_eq!(store.try_register(Arc::new(1u64)), Ok(true));
        assert_eq!(
            store.try_register(Arc::new(2u64)),
            Err(ProtocolViolation::DuplicateRegistration)
        );

        // The first registration still stands.
        assert_eq!(*scope.commit().unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "register can be called once per instance built")]
    fn test_duplicate_registration_panics() {
        let store: InstanceStore<u8> = InstanceStore::new();
        let _scope = store.coordinate::<u64>(1);
        store.register(Arc::new(1u64));
        store.register(Arc::new(2u64));
    }

    #[test]
    fn test_register_outside_session_is_ignored() {
        let store: InstanceStore<u8> = InstanceStore::new();
        assert!(!store.register(Arc::new(1u64)));
        assert!(store.is_empty());

        // Nor does it leak into the next session.
        let scope = store.coordinate::<u64>(1);
        assert_eq!(
            scope.try_commit().unwrap_err(),
            ProtocolViolation::NothingRegistered
        );
    }

    #[test]
    fn test_register_from_other_thread_waits_and_is_ignored() {
        let store: InstanceStore<u8> = InstanceStore::new();
        let scope = store.coordinate::<u64>(1);
        assert!(scope.is_building());

        let staked = thread::scope(|s| {
            let (tx, rx) = std::sync::mpsc::channel();
            let store = &store;
            let handle = s.spawn(move || {
                let staked = store.register(Arc::new(99u64));
                tx.send(()).unwrap();
                staked
            });

            // Held off while this thread's session is open.
            assert!(rx.recv_timeout(std::time::Duration::from_millis(100)).is_err());

            assert!(store.register(Arc::new(1u64)));
            let committed = scope.commit().unwrap();
            assert_eq!(*committed, 1);

            let staked = handle.join().unwrap();
            drop(committed);
            staked
        });

        assert!(!staked);
        assert!(store.get::<u64, _>(&1).is_none());
        assert!(!construction_in_progress());
    }

    #[test]
    fn test_deferred_instance_is_checked_against_outer_type() {
        let store: InstanceStore<u8> = InstanceStore::new();

        let outer = store.coordinate::<u64>(1);
        let inner = store.coordinate::<String>(2);
        assert!(matches!(inner.outcome(), Outcome::Deferred));
        assert!(store.register(Arc::new("two".to_string())));
        assert!(inner.commit().is_none());

        assert_eq!(
            outer.try_commit().unwrap_err(),
            ProtocolViolation::TypeMismatch {
                expected: type_name::<u64>(),
                found: type_name::<String>(),
            }
        );
        assert!(store.is_empty());
        assert!(!store.contains::<String, _>(&2));
        assert!(!construction_in_progress());
    }

    #[test]
    fn test_coordinate_after_register() {
        let store: InstanceStore<u8> = InstanceStore::new();
        let outer = store.coordinate::<u64>(1);
        store.register(Arc::new(1u64));

        let again = store.try_coordinate::<u64>(2);
        assert_eq!(again.unwrap_err(), ProtocolViolation::CoordinateAfterRegister);

        // The outer session is unaffected.
        assert_eq!(*outer.commit().unwrap(), 1);
        assert!(!construction_in_progress());
    }

    #[test]
    fn test_concurrent_construction_builds_once() {
        const THREADS: usize = 16;

        let store: InstanceStore<(i64, i64)> = InstanceStore::new();
        let built = AtomicUsize::new(0);
        let barrier = Barrier::new(THREADS);
        let (store, built, barrier) = (&store, &built, &barrier);

        let results: Vec<Arc<Fraction>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(move || {
                        barrier.wait();
                        store.get_or_build((1, 2), || {
                            built.fetch_add(1, Ordering::SeqCst);
                            Fraction { num: 1, den: 2 }
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|f| Arc::ptr_eq(f, &results[0])));
    }

    #[test]
    fn test_prune_removes_lapsed_entries() {
        let store: InstanceStore<u32> = InstanceStore::new();
        let kept = store.get_or_build(1, || 1u64);
        drop(store.get_or_build(2, || 2u64));
        drop(store.get_or_build(3, || 3u64));

        assert_eq!(store.len(), 1);
        assert_eq!(store.prune(), 2);
        assert_eq!(store.prune(), 0);
        assert!(store.contains::<u64, _>(&1));
        drop(kept);
    }

    #[test]
    fn test_commits_sweep_lapsed_entries() {
        let store: InstanceStore<u32> = InstanceStore::with_prune_threshold(4);
        for n in 0..100 {
            drop(store.get_or_build(n, || u64::from(n)));
        }

        let recorded: usize = store.entries.read().values().map(HashMap::len).sum();
        assert!(recorded < 4, "{recorded} entries left behind");
    }
}
