// ABOUTME: Per-key lifecycle controller driving connect, run, shutdown and cooldown
// ABOUTME: Persistent mode runs the workload once; cyclic mode loops until the key is abandoned

use crate::events::{EventKind, EventSink, LifecycleEvent, RunEndReason};
use crate::providers::{ExecMode, ProviderError, Session, SessionGateway};
use crate::retry::{ConnectOutcome, ConnectionRetry, RetryPolicy};
use crate::sampler::DelaySampler;
use sandloop_config::{CredentialKey, OperatingMode, TimingParameters};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Connecting,
    Running,
    Cooldown,
    Abandoned,
    PersistentRunning,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Connecting => "connecting",
            LifecycleState::Running => "running",
            LifecycleState::Cooldown => "cooldown",
            LifecycleState::Abandoned => "abandoned",
            LifecycleState::PersistentRunning => "persistent_running",
        }
    }
}

/// How a controller task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerOutcome {
    Abandoned { attempts: u32 },
    /// Persistent workload returned. Says nothing about whether it succeeded.
    WorkloadExited { exit_code: Option<i32> },
    /// Persistent workload could not be launched or observed.
    ExecutionFailed { error: String },
    /// The controller task panicked.
    Panicked { message: String },
}

impl ControllerOutcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, ControllerOutcome::WorkloadExited { .. })
    }
}

/// Read-only collaborators shared by every controller.
#[derive(Clone)]
pub struct ControllerContext {
    pub gateway: Arc<dyn SessionGateway>,
    pub sampler: Arc<dyn DelaySampler>,
    pub events: Arc<dyn EventSink>,
    pub timing: Arc<TimingParameters>,
    pub mode: OperatingMode,
    /// Opaque workload payload, passed to the session untouched.
    pub command: Arc<str>,
    pub abandon_on_auth_error: bool,
}

/// Owns one credential key and every session opened with it.
pub struct LifecycleController {
    tag: String,
    key: CredentialKey,
    ctx: ControllerContext,
    state: LifecycleState,
}

impl LifecycleController {
    pub fn new(index: usize, key: CredentialKey, ctx: ControllerContext) -> Self {
        Self {
            tag: format!("sbx-{}", index),
            key,
            ctx,
            state: LifecycleState::Connecting,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Drive the key until its mode says to stop. Cyclic mode only returns on
    /// abandonment.
    pub async fn run(&mut self) -> ControllerOutcome {
        match self.ctx.mode {
            OperatingMode::Persistent => self.run_persistent().await,
            OperatingMode::Cyclic => self.run_cyclic().await,
        }
    }

    async fn run_persistent(&mut self) -> ControllerOutcome {
        self.transition(LifecycleState::Connecting);
        let session = match self.connect().await {
            Ok(session) => session,
            Err(outcome) => return outcome,
        };

        self.transition(LifecycleState::PersistentRunning);
        let result = match session.start(&self.ctx.command, ExecMode::Foreground).await {
            Ok(mut handle) => {
                self.emit(EventKind::RunStarted {
                    sandbox_id: session.id().to_string(),
                    run_time: None,
                });
                handle.wait(None).await
            }
            Err(e) => Err(e),
        };

        // The session is left alive; reclaiming it is up to the operator.
        match result {
            Ok(completion) => {
                self.emit(EventKind::RunEnded {
                    reason: RunEndReason::Completed {
                        exit_code: completion.exit_code,
                    },
                });
                ControllerOutcome::WorkloadExited {
                    exit_code: completion.exit_code,
                }
            }
            Err(e) => {
                self.emit(EventKind::RunEnded {
                    reason: RunEndReason::ExecutionError(e.to_string()),
                });
                ControllerOutcome::ExecutionFailed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn run_cyclic(&mut self) -> ControllerOutcome {
        loop {
            self.transition(LifecycleState::Connecting);
            let session = match self.connect().await {
                Ok(session) => session,
                Err(outcome) => return outcome,
            };

            let run_time = self.ctx.sampler.sample(self.ctx.timing.run_time);
            let downtime = self.ctx.sampler.sample(self.ctx.timing.downtime);

            self.transition(LifecycleState::Running);
            let reason = self.run_once(session.as_ref(), run_time).await;
            self.emit(EventKind::RunEnded { reason });

            // No session survives into the next cycle.
            if let Err(e) = session.close().await {
                self.emit(EventKind::SessionCloseFailed {
                    error: e.to_string(),
                });
            }
            drop(session);

            self.transition(LifecycleState::Cooldown);
            self.emit(EventKind::CooldownStarted { delay: downtime });
            tokio::time::sleep(downtime).await;
        }
    }

    /// Launch the workload in the background and wait at most `run_time` for it.
    async fn run_once(&self, session: &dyn Session, run_time: Duration) -> RunEndReason {
        let mut handle = match session.start(&self.ctx.command, ExecMode::Background).await {
            Ok(handle) => handle,
            Err(e) => return RunEndReason::ExecutionError(e.to_string()),
        };

        self.emit(EventKind::RunStarted {
            sandbox_id: session.id().to_string(),
            run_time: Some(run_time),
        });

        match tokio::time::timeout(run_time, handle.wait(Some(run_time))).await {
            Err(_) | Ok(Err(ProviderError::TimeoutExceeded(_))) => RunEndReason::RunTimeElapsed,
            Ok(Ok(completion)) => RunEndReason::Completed {
                exit_code: completion.exit_code,
            },
            Ok(Err(e)) => RunEndReason::ExecutionError(e.to_string()),
        }
    }

    async fn connect(&mut self) -> Result<Box<dyn Session>, ControllerOutcome> {
        let retry = ConnectionRetry {
            tag: &self.tag,
            gateway: self.ctx.gateway.as_ref(),
            sampler: self.ctx.sampler.as_ref(),
            events: self.ctx.events.as_ref(),
            policy: RetryPolicy {
                abandon_on_auth_error: self.ctx.abandon_on_auth_error,
                ..RetryPolicy::from_timing(&self.ctx.timing)
            },
        };

        match retry.attempt_connect(&self.key).await {
            ConnectOutcome::Connected { session, .. } => Ok(session),
            ConnectOutcome::Abandoned { attempts, .. } => {
                self.transition(LifecycleState::Abandoned);
                Err(ControllerOutcome::Abandoned { attempts })
            }
        }
    }

    fn transition(&mut self, next: LifecycleState) {
        if self.state != next {
            debug!(
                sandbox = %self.tag,
                from = self.state.as_str(),
                to = next.as_str(),
                "Lifecycle transition"
            );
        }
        self.state = next;
    }

    fn emit(&self, kind: EventKind) {
        self.ctx
            .events
            .emit(LifecycleEvent::new(&self.tag, &self.key, kind));
    }
}
