//! # Flyweight Core
//!
//! Runtime machinery for the flyweight library: stores that guarantee at most one
//! live instance per type and key, even under concurrent and nested construction.
//!
//! ## Features
//!
//! - **Weak ownership**: Stores never keep instances alive; an entry lapses with
//!   the last `Arc` held outside the store
//! - **Serialized construction**: One process-wide reentrant lock orders every
//!   construction in every store, so a key is never built twice
//! - **Nested construction**: Building one flyweight may build others, through the
//!   same store or different ones, without deadlocking
//! - **Rollback**: A construction that fails, by error or by panic, leaves nothing
//!   behind
//! - **Statistics**: Optional hit/miss/build tracking (with the `stats` feature)
//!
//! ## Module Organization
//!
//! - [`InstanceStore`] - The registry of weakly-owned instances
//! - [`Coordination`] - The scope guarding one construction
//! - [`Outcome`] - What a scope tells its caller to do
//! - [`ProtocolViolation`] - Misuse of the construction protocol
//! - [`stats_registry`] - Named access to store statistics
//!
//! ## Example
//!
//! ```
//! use flyweight_core::{InstanceStore, Outcome};
//! use std::sync::Arc;
//!
//! let store: InstanceStore<(i64, i64)> = InstanceStore::new();
//!
//! let scope = store.coordinate::<(i64, i64)>((1, 2));
//! let half = match scope.outcome() {
//!     Outcome::Existing(instance) => Arc::clone(instance),
//!     Outcome::BuildHere | Outcome::Deferred => {
//!         let instance = Arc::new((1, 2));
//!         store.register(Arc::clone(&instance));
//!         instance
//!     }
//! };
//! scope.commit();
//!
//! let again = store.get::<(i64, i64), _>(&(1, 2)).unwrap();
//! assert!(Arc::ptr_eq(&half, &again));
//! ```
mod coordination;
mod error;
mod lock;
mod outcome;
mod store;

#[cfg(feature = "stats")]
mod stats;

#[cfg(feature = "stats")]
pub mod stats_registry;

pub use coordination::Coordination;
pub use error::ProtocolViolation;
pub use lock::construction_in_progress;
pub use outcome::Outcome;
pub use store::{InstanceStore, DEFAULT_PRUNE_THRESHOLD};

#[cfg(feature = "stats")]
pub use stats::StoreStats;
