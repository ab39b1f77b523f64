//! # Flyweight
//!
//! Hash consing and flyweight instance management for Rust: equal keys map to one
//! shared instance, built exactly once, for as long as anybody holds it.
//!
//! ## Features
//!
//! - **Easy to use**: Add the `#[flyweight]` attribute to a constructor
//! - **Thread-safe**: Concurrent callers with equal arguments share one build
//! - **Weakly owned**: Instances live exactly as long as their `Arc`s; the store
//!   never keeps them alive
//! - **Result-aware**: Constructors returning `Result` only record `Ok` values
//! - **Nesting-safe**: Constructors may build other flyweights without deadlocking
//!
//! ## Quick Start
//!
//! ```rust
//! use flyweight::flyweight;
//! use std::sync::Arc;
//!
//! #[derive(Debug, PartialEq)]
//! pub struct Fraction {
//!     num: i64,
//!     den: i64,
//! }
//!
//! impl Fraction {
//!     #[flyweight]
//!     pub fn new(num: i64, den: i64) -> Result<Self, String> {
//!         if den == 0 {
//!             return Err("division by zero".to_string());
//!         }
//!         Ok(Fraction { num, den })
//!     }
//! }
//!
//! let a = Fraction::new(1, 2).unwrap();
//! let b = Fraction::new(1, 2).unwrap();
//! assert!(Arc::ptr_eq(&a, &b));
//!
//! assert!(Fraction::new(1, 0).is_err());
//! ```
//!
//! ## Driving a Store by Hand
//!
//! The macro is a thin layer over [`InstanceStore`]. Embedding code that derives
//! its own keys, or builds instances in several steps, can run the construction
//! protocol directly:
//!
//! ```rust
//! use flyweight::{InstanceStore, Outcome};
//! use once_cell::sync::Lazy;
//! use std::sync::Arc;
//!
//! pub struct Symbol(String);
//!
//! static SYMBOLS: Lazy<InstanceStore<String>> = Lazy::new(InstanceStore::new);
//!
//! impl Symbol {
//!     pub fn intern(name: &str) -> Arc<Symbol> {
//!         let scope = SYMBOLS.coordinate::<Symbol>(name.to_lowercase());
//!         if let Outcome::Existing(symbol) = scope.outcome() {
//!             return Arc::clone(symbol);
//!         }
//!         let symbol = Arc::new(Symbol(name.to_lowercase()));
//!         SYMBOLS.register(Arc::clone(&symbol));
//!         scope.commit();
//!         symbol
//!     }
//! }
//!
//! let a = Symbol::intern("Alpha");
//! let b = Symbol::intern("ALPHA");
//! assert!(Arc::ptr_eq(&a, &b));
//! assert_eq!(a.0, "alpha");
//! ```

pub use flyweight_core::*;
pub use flyweight_macros::flyweight;

#[doc(hidden)]
pub mod __private {
    pub use once_cell::sync::Lazy;

    use flyweight_core::InstanceStore;
    use std::any::Any;

    /// Publishes the statistics of a macro-generated store of `T` instances.
    pub fn register_stats<T: Any, K>(name: &str, store: &'static InstanceStore<K>) {
        #[cfg(feature = "stats")]
        flyweight_core::stats_registry::register::<T>(name, store.stats());
        #[cfg(not(feature = "stats"))]
        let _ = (name, store);
    }
}
