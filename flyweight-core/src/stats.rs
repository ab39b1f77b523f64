use std::sync::atomic::{AtomicU64, Ordering};

/// Store statistics for monitoring reuse and construction activity.
///
/// Every [`InstanceStore`](crate::InstanceStore) carries one `StoreStats` when the
/// `stats` feature is enabled. Counters are plain atomics updated with `Relaxed`
/// ordering; a snapshot taken while other threads are working is consistent per
/// counter, not across counters.
///
/// What is counted:
///
/// - **hits**: a lookup or coordination found a live instance
/// - **misses**: a lookup or coordination found nothing live
/// - **builds**: a construction session committed a fresh instance
/// - **deferrals**: a nested coordination deferred to the session already running
/// - **rollbacks**: a construction session ended without committing
///
/// # Examples
///
/// ```
/// use flyweight_core::StoreStats;
///
/// let stats = StoreStats::new();
///
/// stats.record_miss();
/// stats.record_build();
/// stats.record_hit();
/// stats.record_hit();
///
/// assert_eq!(stats.hits(), 2);
/// assert_eq!(stats.misses(), 1);
/// assert_eq!(stats.builds(), 1);
/// assert!((stats.hit_rate() - 0.6666).abs() < 0.001);
/// ```
#[derive(Debug)]
pub struct StoreStats {
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
    deferrals: AtomicU64,
    rollbacks: AtomicU64,
}

impl StoreStats {
    /// Creates a new `StoreStats` instance with zero counters.
    pub const fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            builds: AtomicU64::new(0),
            deferrals: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        }
    }

    /// Records a lookup or coordination answered with a live instance.
    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a lookup or coordination that found nothing live.
    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a committed construction.
    #[inline]
    pub fn record_build(&self) {
        self.builds.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a nested coordination that deferred to the running session.
    #[inline]
    pub fn record_deferral(&self) {
        self.deferrals.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a construction session that ended without committing.
    #[inline]
    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of lookups and coordinations answered with a live instance.
    #[inline]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Returns the number of lookups and coordinations that found nothing live.
    #[inline]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Returns the number of instances committed to the store.
    #[inline]
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    /// Returns the number of nested coordinations that deferred to an outer session.
    #[inline]
    pub fn deferrals(&self) -> u64 {
        self.deferrals.load(Ordering::Relaxed)
    }

    /// Returns the number of construction sessions that ended without a commit.
    #[inline]
    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    /// Returns the total number of lookups (hits + misses).
    #[inline]
    pub fn total_lookups(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Calculates the fraction of lookups answered with a live instance (0.0 to 1.0).
    ///
    /// Returns 0.0 if there have been no lookups.
    ///
    /// # Examples
    ///
    /// ```
    /// use flyweight_core::StoreStats;
    ///
    /// let stats = StoreStats::new();
    /// assert_eq!(stats.hit_rate(), 0.0);
    ///
    /// stats.record_hit();
    /// stats.record_miss();
    /// assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    /// ```
    #[inline]
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_lookups();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }

    /// Calculates the fraction of lookups that found nothing live.
    ///
    /// Returns 1.0 if there have been no lookups, mirroring [`hit_rate`](Self::hit_rate).
    #[inline]
    pub fn miss_rate(&self) -> f64 {
        1.0 - self.hit_rate()
    }

    /// Adds every counter of `other` to this one.
    pub(crate) fn absorb(&self, other: &StoreStats) {
        self.hits.fetch_add(other.hits(), Ordering::Relaxed);
        self.misses.fetch_add(other.misses(), Ordering::Relaxed);
        self.builds.fetch_add(other.builds(), Ordering::Relaxed);
        self.deferrals.fetch_add(other.deferrals(), Ordering::Relaxed);
        self.rollbacks.fetch_add(other.rollbacks(), Ordering::Relaxed);
    }

    /// Resets all counters to zero.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.builds.store(0, Ordering::Relaxed);
        self.deferrals.store(0, Ordering::Relaxed);
        self.rollbacks.store(0, Ordering::Relaxed);
    }
}

impl Default for StoreStats {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for StoreStats {
    fn clone(&self) -> Self {
        Self {
            hits: AtomicU64::new(self.hits()),
            misses: AtomicU64::new(self.misses()),
            builds: AtomicU64::new(self.builds()),
            deferrals: AtomicU64::new(self.deferrals()),
            rollbacks: AtomicU64::new(self.rollbacks()),
        }
    }
}
