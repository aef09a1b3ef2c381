//! Named, reproducible random-number substreams with antithetic support.
//!
//! Every consumer of randomness (MAC backoff, TARP jitter, fading,
//! shadowing, traffic generators) draws from its own keyed substream. A
//! stream's seed is derived by hashing `(key, worker id, root seed)`, so
//! two simulations configured identically are bit-reproducible and batch
//! workers with distinct ids produce disjoint streams.
//!
//! In antithetic mode every base uniform sample `U` is replaced by `1 - U`
//! and all other distributions are derived by inverse-CDF transforms, so
//! the coupling propagates to every variate the simulator draws.

use indexmap::IndexMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use sha2::{Digest, Sha256};
use statrs::distribution::{ContinuousCDF, Exp, Gamma, Normal};
use thiserror::Error;

/// Keep inverse-CDF arguments strictly inside (0, 1).
const UNIT_OPEN_EPS: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum RandomError {
    #[error("random stream with key '{0}' already exists")]
    DuplicateStream(String),
    #[error("random stream with key '{0}' does not exist")]
    UnknownStream(String),
}

/// Owner of the root seed and all derived substreams.
pub struct RandomManager {
    root_seed: u64,
    worker_id: u64,
    antithetic: bool,
    streams: IndexMap<String, RandomStream>,
}

impl RandomManager {
    pub fn new(root_seed: u64, worker_id: u64, antithetic: bool) -> Self {
        RandomManager {
            root_seed,
            worker_id,
            antithetic,
            streams: IndexMap::new(),
        }
    }

    pub fn is_antithetic(&self) -> bool {
        self.antithetic
    }

    /// Create the substream identified by `key` (case-insensitive).
    /// Creating the same key twice is a configuration error.
    pub fn create_stream(&mut self, key: &str) -> Result<(), RandomError> {
        let key = key.to_lowercase();
        if self.streams.contains_key(&key) {
            return Err(RandomError::DuplicateStream(key));
        }
        let rng = ChaCha12Rng::from_seed(self.stream_seed(&key));
        self.streams.insert(
            key,
            RandomStream {
                rng,
                antithetic: self.antithetic,
            },
        );
        Ok(())
    }

    /// Borrow the substream identified by `key`; it must have been created.
    pub fn stream(&mut self, key: &str) -> Result<&mut RandomStream, RandomError> {
        let key = key.to_lowercase();
        self.streams
            .get_mut(&key)
            .ok_or(RandomError::UnknownStream(key))
    }

    /// Seed derivation: SHA-256 over `(key, worker id, root seed)`. The
    /// digest is exactly one ChaCha seed, so no bits are discarded.
    fn stream_seed(&self, key: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.update(self.worker_id.to_le_bytes());
        hasher.update(self.root_seed.to_le_bytes());
        hasher.finalize().into()
    }
}

/// One keyed generator. All distributions are driven by `base_uniform` so
/// the antithetic toggle couples every variate.
pub struct RandomStream {
    rng: ChaCha12Rng,
    antithetic: bool,
}

impl RandomStream {
    fn base_uniform(&mut self) -> f64 {
        let u: f64 = self.rng.r#gen();
        if self.antithetic { 1.0 - u } else { u }
    }

    fn unit_open(&mut self) -> f64 {
        self.base_uniform()
            .clamp(UNIT_OPEN_EPS, 1.0 - UNIT_OPEN_EPS)
    }

    /// Uniform sample in `[low, high)` (or `(low, high]` when antithetic).
    pub fn uniform(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.base_uniform()
    }

    /// Normal sample via the inverse CDF.
    pub fn normal(&mut self, loc: f64, scale: f64) -> f64 {
        if scale == 0.0 {
            return loc;
        }
        let u = self.unit_open();
        Normal::new(loc, scale)
            .expect("normal scale must be positive")
            .inverse_cdf(u)
    }

    /// Exponential sample with mean `scale`, via the inverse CDF.
    pub fn exponential(&mut self, scale: f64) -> f64 {
        let u = self.unit_open();
        Exp::new(1.0 / scale)
            .expect("exponential scale must be positive")
            .inverse_cdf(u)
    }

    /// Nakagami-m amplitude sample with shape `m` and scale `s`
    /// (`E[X^2] = s^2`), via the Gamma inverse CDF on the squared value.
    pub fn nakagami(&mut self, shape: f64, scale: f64) -> f64 {
        let u = self.unit_open();
        let normalized_power = Gamma::new(shape, shape)
            .expect("nakagami shape must be positive")
            .inverse_cdf(u);
        scale * normalized_power.sqrt()
    }

    /// Integer sample in `[low, high)` by inverse transform.
    pub fn integers(&mut self, low: i64, high: i64) -> i64 {
        let span = high - low;
        if span <= 0 {
            return low;
        }
        let u = self.base_uniform();
        let mut offset = (u * span as f64) as i64;
        // antithetic edge case: U=0 maps to 1-U=1, which would land on span
        if offset >= span {
            offset = span - 1;
        }
        low + offset
    }

    /// Pick one element of `items` uniformly; `None` on an empty slice.
    pub fn choice<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let idx = self.integers(0, items.len() as i64) as usize;
        items.get(idx)
    }
}
