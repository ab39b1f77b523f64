use thiserror::Error;

/// A breach of the construction protocol by the embedding code.
///
/// Violations are programming errors: they are never produced by bad input, only
/// by code that drives an [`InstanceStore`](crate::InstanceStore) in the wrong
/// order. The panicking entry points (`coordinate`, `register`, `commit`) abort
/// with the message of the corresponding variant; the `try_*` twins hand the
/// violation back instead.
///
/// A panic unwinds through the open [`Coordination`](crate::Coordination), which
/// rolls the session back. `try_coordinate` and `try_commit` roll back and release
/// the construction lock before returning the violation; after `try_register`
/// fails, the scope is still open and rolls back when dropped.
///
/// # Examples
///
/// ```
/// use flyweight_core::ProtocolViolation;
///
/// let violation = ProtocolViolation::TypeMismatch {
///     expected: "demo::Fraction",
///     found: "alloc::string::String",
/// };
/// assert_eq!(
///     violation.to_string(),
///     "registered instance of type `alloc::string::String` does not conform to the expected type `demo::Fraction`"
/// );
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// Coordination was requested again after an instance had already been
    /// registered in the unfinished session.
    #[error("coordination cannot be requested after a managed instance has already been registered")]
    CoordinateAfterRegister,
    /// `register` was called more than once in the same session.
    #[error("register can be called once per instance built")]
    DuplicateRegistration,
    /// The scope signalled that no instance existed, but nothing was registered
    /// before committing.
    #[error("coordination signalled that no instance existed, but a fresh instance was not registered")]
    NothingRegistered,
    /// The registered instance is not of the type the scope was opened for.
    #[error("registered instance of type `{found}` does not conform to the expected type `{expected}`")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

/// Aborts the current operation with `violation`.
#[cold]
#[track_caller]
pub(crate) fn fail(violation: ProtocolViolation) -> ! {
    panic!("flyweight protocol violation: {violation}")
}
