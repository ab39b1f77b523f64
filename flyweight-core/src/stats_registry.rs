//! Process-wide directory of store statistics.
//!
//! Flyweight stores normally live in `static`s private to a constructor, out of
//! reach of the code that wants to monitor them. A store can publish its
//! [`StoreStats`] here under a name, together with the type of instance it holds.
//! The `#[flyweight]` macro publishes every store it generates.
//!
//! # Examples
//!
//! ```
//! use flyweight_core::{stats_registry, InstanceStore};
//! use once_cell::sync::Lazy;
//!
//! struct Point(i32, i32);
//!
//! static POINTS: Lazy<InstanceStore<(i32, i32)>> = Lazy::new(InstanceStore::new);
//!
//! stats_registry::register::<Point>("points", POINTS.stats());
//! let _origin = POINTS.get_or_build((0, 0), || Point(0, 0));
//!
//! let stats = stats_registry::get("points").unwrap();
//! assert_eq!(stats.builds(), 1);
//! assert_eq!(stats_registry::stores_for::<Point>(), vec!["points".to_string()]);
//! ```

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::any::{type_name, Any, TypeId};
use std::collections::BTreeMap;
use std::ptr;

use crate::StoreStats;

struct Registration {
    instance_type: TypeId,
    stats: &'static StoreStats,
}

static DIRECTORY: Lazy<RwLock<BTreeMap<String, Registration>>> =
    Lazy::new(|| RwLock::new(BTreeMap::new()));

/// Publishes the statistics of a store holding instances of type `T` under `name`.
///
/// The first store registered under a name keeps it. Returns `false` if the name
/// was already taken, whether by this store or by another one.
pub fn register<T: Any>(name: &str, stats: &'static StoreStats) -> bool {
    let mut directory = DIRECTORY.write();
    if let Some(existing) = directory.get(name) {
        if !ptr::eq(existing.stats, stats) {
            tracing::warn!(
                name,
                type_name = type_name::<T>(),
                "statistics name already taken by another store"
            );
        }
        return false;
    }

    directory.insert(
        name.to_string(),
        Registration {
            instance_type: TypeId::of::<T>(),
            stats,
        },
    );
    true
}

/// Returns a snapshot of the statistics published under `name`.
pub fn get(name: &str) -> Option<StoreStats> {
    DIRECTORY
        .read()
        .get(name)
        .map(|registration| registration.stats.clone())
}

/// Returns the live statistics published under `name`.
pub fn get_ref(name: &str) -> Option<&'static StoreStats> {
    DIRECTORY
        .read()
        .get(name)
        .map(|registration| registration.stats)
}

/// Returns the names of every published store holding instances of type `T`, in
/// lexical order.
pub fn stores_for<T: Any>() -> Vec<String> {
    let wanted = TypeId::of::<T>();
    DIRECTORY
        .read()
        .iter()
        .filter(|(_, registration)| registration.instance_type == wanted)
        .map(|(name, _)| name.clone())
        .collect()
}

/// Returns the counters of every published store added together.
pub fn totals() -> StoreStats {
    let totals = StoreStats::new();
    for registration in DIRECTORY.read().values() {
        totals.absorb(registration.stats);
    }
    totals
}
