//! The process-wide construction lock.
//!
//! Every [`InstanceStore`](crate::InstanceStore) in the process serializes its
//! construction sessions on this one lock, not on a per-store lock. Building a
//! flyweight of one type routinely builds flyweights of other types (a segment
//! builds its end points, a polynomial its coefficients), and those nested builds
//! go through other stores. With a single lock there is exactly one builder in
//! the whole process at any time, so two threads can never both believe they own
//! the construction of a key, whichever stores their sessions touch.
//!
//! The lock is reentrant: the thread that holds it can acquire it again from a
//! nested construction without deadlocking itself.

use once_cell::sync::Lazy;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

static CONSTRUCTION_LOCK: Lazy<ReentrantMutex<()>> = Lazy::new(|| ReentrantMutex::new(()));

/// Guard for one level of the construction lock. Dropping it releases that level.
pub(crate) type ConstructionGuard = ReentrantMutexGuard<'static, ()>;

/// Acquires one level of the construction lock, blocking while another thread
/// holds it.
pub(crate) fn acquire() -> ConstructionGuard {
    CONSTRUCTION_LOCK.lock()
}

/// Returns `true` if the calling thread currently holds the construction lock,
/// i.e. it is somewhere inside a coordination scope of some store.
///
/// # Examples
///
/// ```
/// use flyweight_core::{construction_in_progress, InstanceStore, Outcome};
///
/// let store: InstanceStore<u32> = InstanceStore::new();
/// assert!(!construction_in_progress());
///
/// let scope = store.coordinate::<String>(7);
/// assert!(matches!(scope.outcome(), Outcome::BuildHere));
/// assert!(construction_in_progress());
/// drop(scope);
///
/// assert!(!construction_in_progress());
/// ```
pub fn construction_in_progress() -> bool {
    CONSTRUCTION_LOCK.is_owned_by_current_thread()
}
