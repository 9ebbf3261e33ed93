// ABOUTME: Session gateway traits and implementations for remote sandbox backends
// ABOUTME: Defines the open/start/wait/close capability the lifecycle controller drives

use async_trait::async_trait;
use sandloop_config::CredentialKey;
use std::time::Duration;
use thiserror::Error;

pub mod e2b;

pub use e2b::{E2BConfig, E2BGateway};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Timed out after {0:?}")]
    TimeoutExceeded(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Errors that will not go away by retrying with the same credential.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProviderError::Authentication(_))
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// How a workload is started inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Caller intends to block on the workload; output is surfaced in logs.
    Foreground,
    /// Caller only cares about completion; output is discarded.
    Background,
}

/// Result of a workload that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub exit_code: Option<i32>,
}

/// Opens sessions against a remote provisioning API.
///
/// Credentials travel as call arguments only, so concurrent controllers using
/// different keys never observe each other's secrets.
#[async_trait]
pub trait SessionGateway: Send + Sync {
    /// Short provider name for log lines
    fn name(&self) -> &'static str;

    /// Provision a fresh session authorized by `credential`
    async fn open(&self, credential: &CredentialKey) -> Result<Box<dyn Session>>;
}

/// A live remote execution context owned by exactly one controller.
#[async_trait]
pub trait Session: Send + Sync {
    /// Provider-assigned identifier
    fn id(&self) -> &str;

    /// Start `command` without waiting for it. The payload is passed through verbatim.
    async fn start(&self, command: &str, mode: ExecMode) -> Result<Box<dyn CommandHandle>>;

    /// Tear the session down. Best-effort and idempotent.
    async fn close(&self) -> Result<()>;
}

/// A running workload.
#[async_trait]
pub trait CommandHandle: Send {
    /// Wait for the workload to finish.
    ///
    /// With `Some(deadline)`, returns [`ProviderError::TimeoutExceeded`] once it
    /// elapses. `None` waits indefinitely.
    async fn wait(&mut self, timeout: Option<Duration>) -> Result<Completion>;
}
