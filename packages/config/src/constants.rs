// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Sandloop

// Credentials
pub const E2B_KEY_PREFIX: &str = "E2B_KEY_";

// Gateway Configuration
pub const E2B_API_URL: &str = "E2B_API_URL";
pub const E2B_DOMAIN: &str = "E2B_DOMAIN";
pub const E2B_TEMPLATE: &str = "E2B_TEMPLATE";
pub const E2B_SANDBOX_TIMEOUT_SECS: &str = "E2B_SANDBOX_TIMEOUT_SECS";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";

// Defaults
pub const DEFAULT_E2B_API_URL: &str = "https://api.e2b.dev";
pub const DEFAULT_E2B_DOMAIN: &str = "e2b.app";
pub const DEFAULT_E2B_TEMPLATE: &str = "base";
pub const DEFAULT_SANDBOX_TIMEOUT_SECS: u64 = 3600;
