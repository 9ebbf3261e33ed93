// ABOUTME: Timing parameters for connection retries, launch staggering and run cycles
// ABOUTME: Inclusive second-granularity ranges with min <= max validation and per-mode defaults

use crate::{ConfigError, Result};
use std::fmt;
use std::time::Duration;

/// Attempts made to open a session before a key is abandoned.
pub const MAX_CONNECTION_ATTEMPTS: u32 = 10;

/// Whole-process operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    /// Connect once, run the workload to completion, leave the session alive.
    Persistent,
    /// Run for a sampled duration, tear down, cool down, reconnect. Forever.
    Cyclic,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Persistent => "persistent",
            OperatingMode::Cyclic => "cyclic",
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive range of whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    min_secs: u64,
    max_secs: u64,
}

impl DelayRange {
    /// Build a range, rejecting `min > max`. `name` is used in the error message.
    pub fn new(name: &str, min_secs: u64, max_secs: u64) -> Result<Self> {
        if min_secs > max_secs {
            return Err(ConfigError::InvalidRange {
                name: name.to_string(),
                min: min_secs,
                max: max_secs,
            });
        }
        Ok(Self { min_secs, max_secs })
    }

    pub const fn fixed(secs: u64) -> Self {
        Self {
            min_secs: secs,
            max_secs: secs,
        }
    }

    pub fn min_secs(&self) -> u64 {
        self.min_secs
    }

    pub fn max_secs(&self) -> u64 {
        self.max_secs
    }

    pub fn contains(&self, delay: Duration) -> bool {
        delay >= Duration::from_secs(self.min_secs) && delay <= Duration::from_secs(self.max_secs)
    }
}

impl fmt::Display for DelayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}s", self.min_secs, self.max_secs)
    }
}

/// Immutable timing configuration for one process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingParameters {
    pub max_attempts: u32,
    /// Delay after a failed open. Deliberately a wide uniform range rather than
    /// exponential, so keys failing together after a shared outage spread out.
    pub backoff: DelayRange,
    /// Pause between successive controller launches.
    pub stagger: DelayRange,
    /// Cyclic mode only.
    pub run_time: DelayRange,
    /// Cyclic mode only.
    pub downtime: DelayRange,
}

impl TimingParameters {
    /// Defaults used when no overrides are supplied for `mode`.
    pub fn defaults_for(mode: OperatingMode) -> Self {
        let backoff = match mode {
            OperatingMode::Persistent => DelayRange::fixed(5),
            OperatingMode::Cyclic => DelayRange {
                min_secs: 60,
                max_secs: 250,
            },
        };

        Self {
            max_attempts: MAX_CONNECTION_ATTEMPTS,
            backoff,
            stagger: DelayRange {
                min_secs: 30,
                max_secs: 45,
            },
            run_time: DelayRange {
                min_secs: 230,
                max_secs: 340,
            },
            downtime: DelayRange {
                min_secs: 30,
                max_secs: 45,
            },
        }
    }

    /// Check the attempt ceiling. Every [`DelayRange`] is valid by construction.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                name: "max-attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
