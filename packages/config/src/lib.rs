// ABOUTME: Configuration primitives shared by the Sandloop orchestrator
// ABOUTME: Credential keys, key registry, timing parameters and validation errors

pub mod constants;
pub mod keys;
pub mod timing;

pub use keys::{env_keys, CredentialKey, KeyRegistry};
pub use timing::{DelayRange, OperatingMode, TimingParameters, MAX_CONNECTION_ATTEMPTS};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No API keys found - set {prefix}* or pass --key")]
    NoKeys { prefix: String },

    #[error("--{name}-min ({min}) cannot be greater than --{name}-max ({max})")]
    InvalidRange { name: String, min: u64, max: u64 },

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
