//! # Fraction Flyweight Example
//!
//! Fractions are interned by their reduced numerator and denominator: building
//! `2/4` and `1/2` yields the same shared instance, and a zero denominator is
//! rejected without leaving anything behind in the store.
//!
//! The same type is built twice over: once with the `#[flyweight]` attribute and
//! once by driving an `InstanceStore` through the construction protocol by hand.

use flyweight::{flyweight, InstanceStore, Outcome};
use once_cell::sync::Lazy;
use std::fmt;
use std::sync::Arc;
use std::thread;

#[derive(Debug, PartialEq)]
pub struct Fraction {
    num: i64,
    den: i64,
}

#[derive(Debug, PartialEq)]
pub enum FractionError {
    ZeroDenominator,
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Brings `num / den` to lowest terms with a positive denominator. `den` must be
/// non-zero, and neither part may be `i64::MIN`.
fn reduce(num: i64, den: i64) -> (i64, i64) {
    let divisor = gcd(num.unsigned_abs(), den.unsigned_abs()).max(1) as i64 * den.signum();
    (num / divisor, den / divisor)
}

impl Fraction {
    /// Returns the shared instance for `num / den` in lowest terms.
    pub fn new(num: i64, den: i64) -> Result<Arc<Self>, FractionError> {
        let (num, den) = if den == 0 { (num, den) } else { reduce(num, den) };
        Fraction::reduced(num, den)
    }

    #[flyweight(name = "fractions")]
    fn reduced(num: i64, den: i64) -> Result<Self, FractionError> {
        println!("  building {num}/{den}");
        if den == 0 {
            return Err(FractionError::ZeroDenominator);
        }
        Ok(Fraction { num, den })
    }
}

static BY_HAND: Lazy<InstanceStore<(i64, i64)>> = Lazy::new(InstanceStore::new);

/// Builds a fraction through the store's construction protocol directly.
fn fraction_by_hand(num: i64, den: i64) -> Result<Arc<Fraction>, FractionError> {
    let (num, den) = if den == 0 { (num, den) } else { reduce(num, den) };

    let scope = BY_HAND.coordinate::<Fraction>((num, den));
    if let Outcome::Existing(existing) = scope.outcome() {
        return Ok(Arc::clone(existing));
    }

    if den == 0 {
        // Dropping the scope rolls the construction back.
        return Err(FractionError::ZeroDenominator);
    }

    println!("  building {num}/{den} by hand");
    let fraction = Arc::new(Fraction { num, den });
    BY_HAND.register(Arc::clone(&fraction));
    scope.commit();
    Ok(fraction)
}

#[cfg(feature = "stats")]
fn print_stats() {
    if let Some(stats) = flyweight::stats_registry::get("fractions") {
        println!("\n--- Statistics ---");
        println!("Lookups:   {}", stats.total_lookups());
        println!("Hits:      {}", stats.hits());
        println!("Builds:    {}", stats.builds());
        println!("Rollbacks: {}", stats.rollbacks());
        println!("Hit rate:  {:.2}%", stats.hit_rate() * 100.0);
    }
}

#[cfg(not(feature = "stats"))]
fn print_stats() {}

fn main() {
    println!("=== Fraction Flyweight Example ===\n");

    println!("--- Equal values share one instance ---");
    let half = Fraction::new(1, 2).unwrap();
    let two_quarters = Fraction::new(2, 4).unwrap();
    let minus = Fraction::new(-3, -6).unwrap();
    println!("1/2, 2/4 and -3/-6 are all {half}");
    assert!(Arc::ptr_eq(&half, &two_quarters));
    assert!(Arc::ptr_eq(&half, &minus));

    println!("\n--- Zero denominators are rejected ---");
    let invalid = Fraction::new(1, 0);
    println!("1/0 -> {invalid:?}");
    assert_eq!(invalid, Err(FractionError::ZeroDenominator));

    println!("\n--- Concurrent construction builds once ---");
    let handles: Vec<_> = (1..=4)
        .map(|k| thread::spawn(move || Fraction::new(3 * k, 7 * k).unwrap()))
        .collect();
    let sevenths: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(sevenths.iter().all(|f| Arc::ptr_eq(f, &sevenths[0])));
    println!("4 threads share {}", sevenths[0]);

    println!("\n--- Instances lapse when released ---");
    drop(sevenths);
    let again = Fraction::new(3, 7).unwrap();
    println!("3/7 was built again: {again}");

    println!("\n--- Driving the store by hand ---");
    let third = fraction_by_hand(2, 6).unwrap();
    let same = fraction_by_hand(1, 3).unwrap();
    assert!(Arc::ptr_eq(&third, &same));
    assert!(fraction_by_hand(5, 0).is_err());
    assert!(!BY_HAND.contains::<Fraction, _>(&(5, 0)));
    println!("{third} is shared; {} live instance(s) in the store", BY_HAND.len());

    print_stats();

    println!("\n=== Example Completed ===");
}
