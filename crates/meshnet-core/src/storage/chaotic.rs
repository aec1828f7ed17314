//! Chaotic storage wrapper for fault injection testing
//!
//! Delegates to an inner store but fails a configurable share of operations,
//! so tests can check that a failed save never disturbs the running node and
//! that the last good snapshot survives.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{NetSnapshot, Storage, StorageError};

/// Storage wrapper that injects failures deterministically.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    rng: Arc<Mutex<ChaoticRng>>,
}

/// Linear congruential generator; the same seed gives the same failures.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn next(&mut self) -> f64 {
        // Numerical Recipes constants
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Wrap `inner`, failing operations with probability `failure_rate`
    /// (clamped to `[0.0, 1.0]`).
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Same as [`Self::new`] with an explicit seed.
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Arc::new(Mutex::new(ChaoticRng { state: seed })),
        }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn inject(&self, operation: &str) -> Result<(), StorageError> {
        if self.rng.lock().next() < self.failure_rate {
            return Err(StorageError::Io(format!("injected failure in {operation}")));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn save_snapshot(&self, snapshot: &NetSnapshot) -> Result<(), StorageError> {
        self.inject("save_snapshot")?;
        self.inner.save_snapshot(snapshot)
    }

    fn load_snapshot(&self) -> Result<Option<NetSnapshot>, StorageError> {
        self.inject("load_snapshot")?;
        self.inner.load_snapshot()
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.inject("clear")?;
        self.inner.clear()
    }
}
