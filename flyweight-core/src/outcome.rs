use std::fmt;
use std::sync::Arc;

/// What a coordination scope tells its caller about the key it was opened for.
///
/// Only [`Existing`](Outcome::Existing) determines the instance. The other two
/// variants are "undetermined": the caller has to build the instance itself and
/// [`register`](crate::InstanceStore::register) it. They differ in who finishes
/// the protocol: under `BuildHere` the scope commits the registered instance, under
/// `Deferred` an outer scope further up the call stack does.
///
/// # Examples
///
/// ```
/// use flyweight_core::{InstanceStore, Outcome};
/// use std::sync::Arc;
///
/// let store: InstanceStore<&'static str> = InstanceStore::new();
///
/// let scope = store.coordinate::<String>("greeting");
/// assert!(scope.outcome().is_undetermined());
/// let greeting = Arc::new("hello".to_string());
/// store.register(Arc::clone(&greeting));
/// scope.commit();
///
/// let scope = store.coordinate::<String>("greeting");
/// match scope.outcome() {
///     Outcome::Existing(instance) => assert!(Arc::ptr_eq(instance, &greeting)),
///     _ => unreachable!("a live instance is registered under this key"),
/// }
/// ```
pub enum Outcome<T> {
    /// A live instance is registered under the key.
    Existing(Arc<T>),
    /// No live instance exists; this scope owns its construction.
    BuildHere,
    /// The store is already building an instance further up this thread's call
    /// stack; that outer scope completes the protocol.
    Deferred,
}

impl<T> Outcome<T> {
    /// Returns `true` for [`Outcome::Existing`].
    pub fn is_existing(&self) -> bool {
        matches!(self, Outcome::Existing(_))
    }

    /// Returns `true` when the caller has to build the instance itself.
    pub fn is_undetermined(&self) -> bool {
        !self.is_existing()
    }

    /// Returns the existing instance, if any.
    pub fn instance(&self) -> Option<Arc<T>> {
        match self {
            Outcome::Existing(instance) => Some(Arc::clone(instance)),
            Outcome::BuildHere | Outcome::Deferred => None,
        }
    }
}

impl<T> Clone for Outcome<T> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Existing(instance) => Outcome::Existing(Arc::clone(instance)),
            Outcome::BuildHere => Outcome::BuildHere,
            Outcome::Deferred => Outcome::Deferred,
        }
    }
}

impl<T> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Existing(_) => f.write_str("Existing(..)"),
            Outcome::BuildHere => f.write_str("BuildHere"),
            Outcome::Deferred => f.write_str("Deferred"),
        }
    }
}
