//! Process-wide existence filter over match ids.
//!
//! A Bloom filter never reports a stored id as absent, but it can report an
//! unseen id as present. Storage stays authoritative; the filter only decides
//! whether the authoritative lookup is worth doing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::info;

/// Membership test shared by every ingestion worker
pub trait ExistenceFilter: Send + Sync {
    /// `false` means definitely never added
    fn might_contain(&self, id: &str) -> bool;

    /// Idempotent, safe to call concurrently
    fn add(&self, id: &str);
}

/// Lock-free Bloom filter backed by atomic 64-bit words.
///
/// Uses double hashing (Kirsch-Mitzenmacher) to derive `num_hashes` probe
/// positions from two base hashes.
pub struct BloomFilter {
    bits: Vec<AtomicU64>,
    num_bits: usize,
    num_hashes: usize,
    count: AtomicU64,
}

impl BloomFilter {
    /// Sizes the filter for `expected_items` at the given false-positive rate
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let expected_items = expected_items.max(1);
        let fp = false_positive_rate.clamp(1e-9, 0.5);

        // m = -n*ln(p) / (ln 2)^2
        let ln2_squared = std::f64::consts::LN_2 * std::f64::consts::LN_2;
        let num_bits = (-(expected_items as f64) * fp.ln() / ln2_squared).ceil() as usize;
        let num_bits = num_bits.max(64).div_ceil(64) * 64;

        // k = (m/n) * ln 2
        let num_hashes =
            ((num_bits as f64 / expected_items as f64) * std::f64::consts::LN_2).ceil() as usize;
        let num_hashes = num_hashes.clamp(1, 16);

        let bits = (0..num_bits / 64).map(|_| AtomicU64::new(0)).collect();

        Self {
            bits,
            num_bits,
            num_hashes,
            count: AtomicU64::new(0),
        }
    }

    /// Builds a filter and adds every id from `ids`
    pub fn seeded<I, S>(ids: I, expected_items: usize, false_positive_rate: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let start = Instant::now();
        let filter = Self::new(expected_items, false_positive_rate);
        for id in ids {
            filter.add(id.as_ref());
        }
        info!(
            seeded = filter.count(),
            bits = filter.num_bits,
            hashes = filter.num_hashes,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "🌸 Match id filter seeded"
        );
        filter
    }

    /// Number of `add` calls, including repeats
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Estimated false-positive rate at the current fill level
    pub fn estimated_fp_rate(&self) -> f64 {
        let set: usize = self
            .bits
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum();
        (set as f64 / self.num_bits as f64).powi(self.num_hashes as i32)
    }

    fn hash_pair(id: &str) -> (u64, u64) {
        let mut h1 = DefaultHasher::new();
        id.hash(&mut h1);
        let hash1 = h1.finish();

        let mut h2 = DefaultHasher::new();
        hash1.hash(&mut h2);
        // odd step so probes cycle through the whole table
        (hash1, h2.finish() | 1)
    }

    fn probe(&self, h1: u64, h2: u64, i: usize) -> usize {
        (h1.wrapping_add(h2.wrapping_mul(i as u64)) % self.num_bits as u64) as usize
    }
}

impl ExistenceFilter for BloomFilter {
    fn might_contain(&self, id: &str) -> bool {
        let (h1, h2) = Self::hash_pair(id);
        (0..self.num_hashes).all(|i| {
            let bit = self.probe(h1, h2, i);
            let mask = 1u64 << (bit % 64);
            self.bits[bit / 64].load(Ordering::Acquire) & mask != 0
        })
    }

    fn add(&self, id: &str) {
        let (h1, h2) = Self::hash_pair(id);
        for i in 0..self.num_hashes {
            let bit = self.probe(h1, h2, i);
            let mask = 1u64 << (bit % 64);
            self.bits[bit / 64].fetch_or(mask, Ordering::AcqRel);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}
