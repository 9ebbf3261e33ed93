// ABOUTME: Remote sandbox orchestration core for Sandloop
// ABOUTME: Session gateway, connection retries, per-key lifecycle control and staggered launch

pub mod events;
pub mod lifecycle;
pub mod providers;
pub mod retry;
pub mod sampler;
pub mod scheduler;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use events::{EventKind, EventSink, LifecycleEvent, RunEndReason, TracingEventSink};
pub use lifecycle::{ControllerContext, ControllerOutcome, LifecycleController, LifecycleState};
pub use providers::{
    CommandHandle, Completion, E2BConfig, E2BGateway, ExecMode, ProviderError, Session,
    SessionGateway,
};
pub use retry::{ConnectOutcome, ConnectionRetry, RetryPolicy};
pub use sampler::{DelaySampler, SeededSampler, ThreadRngSampler};
pub use scheduler::{LaunchError, LaunchReport, LaunchScheduler};
