//! Seed variation strategies for job-group fan-out.
//!
//! [`generate_seeds`] produces one seed per child job. Given the same base
//! seed every strategy is fully deterministic; without a base seed the first
//! seed is drawn from the thread-local CSPRNG and the batch becomes
//! non-reproducible.
//!
//! All arithmetic wraps modulo `MAX_SEED + 1`, so no strategy can produce an
//! out-of-range seed. After a strategy has run, colliding seeds (possible
//! through wraparound, a degenerate base, or the random fallback) are bumped
//! forward until the batch is distinct. The first seed is never bumped.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Seed;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Largest seed handed to a backend: 2^53 - 1, the largest integer that
/// survives a round trip through a JSON number in JavaScript clients.
pub const MAX_SEED: Seed = (1 << 53) - 1;

/// Minimum spacing the random strategy tries to keep between any two seeds.
pub const MIN_DISTANCE: Seed = 1_000_000;

/// Draws per slot before the random strategy accepts a too-close candidate.
pub const MAX_ATTEMPTS_PER_SLOT: u32 = 100;

/// Multiplier applied to the Fibonacci spacing.
pub const FIBONACCI_SCALE: Seed = 1_000;

/// The golden ratio, φ.
pub const GOLDEN_RATIO: f64 = 1.618_033_988_7;

/// Size of the seed space.
const SEED_MODULUS: u128 = MAX_SEED as u128 + 1;

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// How seeds are spread across the children of a job group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedStrategy {
    /// PRNG draws seeded by the base seed, kept at least [`MIN_DISTANCE`] apart.
    #[default]
    Random,
    /// `base, base + 1, base + 2, ...`
    Sequential,
    /// Offsets grow as the Fibonacci sequence times [`FIBONACCI_SCALE`].
    Fibonacci,
    /// `base + round(base * (φ^i - 1))`
    GoldenRatio,
}

impl SeedStrategy {
    /// Every strategy, in wire-name order.
    pub const ALL: [SeedStrategy; 4] = [
        SeedStrategy::Random,
        SeedStrategy::Sequential,
        SeedStrategy::Fibonacci,
        SeedStrategy::GoldenRatio,
    ];

    /// Wire name used in requests and snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            SeedStrategy::Random => "random",
            SeedStrategy::Sequential => "sequential",
            SeedStrategy::Fibonacci => "fibonacci",
            SeedStrategy::GoldenRatio => "golden_ratio",
        }
    }

    /// Comma-separated list of accepted wire names, for error messages.
    pub fn valid_names() -> String {
        Self::ALL
            .iter()
            .map(SeedStrategy::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for SeedStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeedStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| CoreError::InvalidSeedStrategy(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Generate `count` distinct seeds using `strategy`.
///
/// - `count == 0` returns an empty vector.
/// - `count == 1` returns `[base]` (or one random seed) for every strategy.
/// - A `base_seed` above [`MAX_SEED`] is wrapped into range first.
pub fn generate_seeds(count: usize, strategy: SeedStrategy, base_seed: Option<Seed>) -> Vec<Seed> {
    if count == 0 {
        return Vec::new();
    }

    let base = match base_seed {
        Some(seed) => wrap(seed as u128),
        None => rand::rng().random_range(0..=MAX_SEED),
    };

    if count == 1 {
        return vec![base];
    }

    let seeds = match strategy {
        SeedStrategy::Random => random_seeds(count, base),
        SeedStrategy::Sequential => sequential_seeds(count, base),
        SeedStrategy::Fibonacci => fibonacci_seeds(count, base),
        SeedStrategy::GoldenRatio => golden_ratio_seeds(count, base),
    };

    ensure_distinct(seeds)
}

/// Whether `candidate` keeps at least [`MIN_DISTANCE`] from every seed in `chosen`.
pub fn is_well_separated(candidate: Seed, chosen: &[Seed]) -> bool {
    chosen
        .iter()
        .all(|seed| candidate.abs_diff(*seed) >= MIN_DISTANCE)
}

fn wrap(value: u128) -> Seed {
    (value % SEED_MODULUS) as Seed
}

fn random_seeds(count: usize, base: Seed) -> Vec<Seed> {
    let mut rng = StdRng::seed_from_u64(base);
    let mut seeds = Vec::with_capacity(count);
    seeds.push(base);

    while seeds.len() < count {
        let mut candidate = rng.random_range(0..=MAX_SEED);
        for _ in 1..MAX_ATTEMPTS_PER_SLOT {
            if is_well_separated(candidate, &seeds) {
                break;
            }
            candidate = rng.random_range(0..=MAX_SEED);
        }
        // After the last attempt the candidate is kept regardless of spacing.
        seeds.push(candidate);
    }

    seeds
}

fn sequential_seeds(count: usize, base: Seed) -> Vec<Seed> {
    (0..count as u128).map(|i| wrap(base as u128 + i)).collect()
}

fn fibonacci_seeds(count: usize, base: Seed) -> Vec<Seed> {
    let mut seeds = Vec::with_capacity(count);
    let mut offset: u128 = 0;
    let (mut prev, mut curr): (u128, u128) = (0, 1);

    for _ in 0..count {
        seeds.push(wrap(base as u128 + offset * FIBONACCI_SCALE as u128));
        offset = (offset + curr) % SEED_MODULUS;
        let next = (prev + curr) % SEED_MODULUS;
        prev = curr;
        curr = next;
    }

    seeds
}

fn golden_ratio_seeds(count: usize, base: Seed) -> Vec<Seed> {
    (0..count)
        .map(|i| {
            let exponent = i32::try_from(i).unwrap_or(i32::MAX);
            let offset = (base as f64 * (GOLDEN_RATIO.powi(exponent) - 1.0))
                .round()
                .rem_euclid(SEED_MODULUS as f64);
            // Non-finite offsets saturate to 0 in the cast.
            wrap(base as u128 + offset as u128)
        })
        .collect()
}

fn ensure_distinct(mut seeds: Vec<Seed>) -> Vec<Seed> {
    let mut seen = HashSet::with_capacity(seeds.len());
    for seed in seeds.iter_mut() {
        while !seen.insert(*seed) {
            *seed = wrap(*seed as u128 + 1);
        }
    }
    seeds
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
