// ABOUTME: Pluggable randomness for backoff, stagger, run-time and cooldown delays
// ABOUTME: Uniform whole-second sampling over inclusive ranges, thread-local or seeded

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sandloop_config::DelayRange;
use std::sync::Mutex;
use std::time::Duration;

/// Source of every randomized delay the orchestrator uses.
pub trait DelaySampler: Send + Sync {
    /// Uniform whole-second duration in `[range.min, range.max]`.
    fn sample(&self, range: DelayRange) -> Duration;
}

/// Draws from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngSampler;

impl DelaySampler for ThreadRngSampler {
    fn sample(&self, range: DelayRange) -> Duration {
        let secs = rand::thread_rng().gen_range(range.min_secs()..=range.max_secs());
        Duration::from_secs(secs)
    }
}

/// Reproducible sampler seeded once at construction.
pub struct SeededSampler {
    rng: Mutex<StdRng>,
}

impl SeededSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl DelaySampler for SeededSampler {
    fn sample(&self, range: DelayRange) -> Duration {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Duration::from_secs(rng.gen_range(range.min_secs()..=range.max_secs()))
    }
}
