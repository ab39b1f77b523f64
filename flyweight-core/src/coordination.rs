use std::any::{type_name, Any};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::error::{fail, ProtocolViolation};
use crate::lock::ConstructionGuard;
use crate::store::Staged;
use crate::{InstanceStore, Outcome};

enum Phase<K> {
    /// Nothing to finish: the scope found an existing instance or deferred.
    Passive,
    /// The scope owns the session for this key.
    Building(K),
    Committed,
}

/// A coordination scope opened by [`InstanceStore::coordinate`].
///
/// The scope holds one level of the process-wide construction lock for as long as
/// it lives. It is finished either by [`commit`](Self::commit) or by being dropped:
///
/// - A scope that owns a construction (outcome [`Outcome::BuildHere`]) and is
///   dropped without a successful commit rolls back: whatever is recorded for its
///   key is removed, and the staked-out instance is discarded. This is what happens
///   when the construction code returns early, propagates an error with `?`, or
///   panics.
/// - Scopes with outcome [`Outcome::Existing`] or [`Outcome::Deferred`] only
///   release the lock.
///
/// Either way the session is reset before the lock is released.
#[must_use = "dropping a coordination scope without committing it rolls the construction back"]
pub struct Coordination<'s, K, T>
where
    K: Hash + Eq,
    T: Any + Send + Sync,
{
    store: &'s InstanceStore<K>,
    outcome: Outcome<T>,
    phase: Phase<K>,
    // Released after `Drop::drop` has reset the session.
    _guard: ConstructionGuard,
}

impl<'s, K, T> Coordination<'s, K, T>
where
    K: Hash + Eq,
    T: Any + Send + Sync,
{
    pub(crate) fn passive(
        store: &'s InstanceStore<K>,
        outcome: Outcome<T>,
        guard: ConstructionGuard,
    ) -> Self {
        Self {
            store,
            outcome,
            phase: Phase::Passive,
            _guard: guard,
        }
    }

    pub(crate) fn building(store: &'s InstanceStore<K>, key: K, guard: ConstructionGuard) -> Self {
        Self {
            store,
            outcome: Outcome::BuildHere,
            phase: Phase::Building(key),
            _guard: guard,
        }
    }

    /// What the store knows about the key this scope was opened for.
    pub fn outcome(&self) -> &Outcome<T> {
        &self.outcome
    }

    /// Returns `true` if this scope owns the construction of its key.
    pub fn is_building(&self) -> bool {
        matches!(self.phase, Phase::Building(_))
    }

    /// Finishes the scope.
    ///
    /// For a scope that owns a construction, checks that exactly one instance was
    /// registered and that it is a `T`, records it under the key and returns it.
    /// For an [`Existing`](Outcome::Existing) scope, returns the existing instance.
    /// For a [`Deferred`](Outcome::Deferred) scope, returns `None`: the outer scope
    /// commits.
    ///
    /// # Panics
    ///
    /// Panics with [`ProtocolViolation::NothingRegistered`] or
    /// [`ProtocolViolation::TypeMismatch`] when the checks fail; the construction is
    /// rolled back first. See [`try_commit`](Self::try_commit) for the non-panicking
    /// variant.
    #[track_caller]
    pub fn commit(self) -> Option<Arc<T>> {
        match self.try_commit() {
            Ok(instance) => instance,
            Err(violation) => fail(violation),
        }
    }

    /// Like [`commit`](Self::commit), but returns the protocol violation instead
    /// of panicking. On error the construction has been rolled back and the lock
    /// released.
    pub fn try_commit(mut self) -> Result<Option<Arc<T>>, ProtocolViolation> {
        if !self.is_building() {
            return Ok(self.outcome.instance());
        }

        let Staged {
            instance,
            type_name: found,
        } = self
            .store
            .take_staged()
            .ok_or(ProtocolViolation::NothingRegistered)?;

        let typed = Arc::clone(&instance)
            .downcast::<T>()
            .map_err(|_| ProtocolViolation::TypeMismatch {
                expected: type_name::<T>(),
                found,
            })?;

        if let Phase::Building(key) = std::mem::replace(&mut self.phase, Phase::Committed) {
            self.store.insert_entry::<T>(key, &instance);
        }

        #[cfg(feature = "stats")]
        self.store.stats_ref().record_build();
        tracing::debug!(type_name = type_name::<T>(), "committed flyweight instance");
        Ok(Some(typed))
    }
}

impl<K, T> Drop for Coordination<'_, K, T>
where
    K: Hash + Eq,
    T: Any + Send + Sync,
{
    fn drop(&mut self) {
        match &self.phase {
            Phase::Passive => return,
            Phase::Building(key) => {
                self.store.remove_entry::<T>(key);
                #[cfg(feature = "stats")]
                self.store.stats_ref().record_rollback();
                tracing::debug!(
                    type_name = type_name::<T>(),
                    "rolled back flyweight construction"
                );
            }
            Phase::Committed => {}
        }
        self.store.end_session();
    }
}

impl<K, T> fmt::Debug for Coordination<'_, K, T>
where
    K: Hash + Eq,
    T: Any + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordination")
            .field("type_name", &type_name::<T>())
            .field("outcome", &self.outcome)
            .field("building", &self.is_building())
            .finish()
    }
}
