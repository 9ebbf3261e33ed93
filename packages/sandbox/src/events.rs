// ABOUTME: Semantic lifecycle events emitted by controllers and the launch scheduler
// ABOUTME: Event sinks decouple the core from logging; the default sink renders via tracing

use sandloop_config::CredentialKey;
use std::time::Duration;
use tracing::{error, info, warn};

/// Why a run iteration ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEndReason {
    /// Workload returned on its own. The exit code is reported as-is; a clean exit
    /// and a remote termination are not told apart.
    Completed { exit_code: Option<i32> },
    /// Cyclic deadline reached. Expected, not a failure.
    RunTimeElapsed,
    /// Launch or run failed inside the session.
    ExecutionError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    AttemptStarted { attempt: u32, max_attempts: u32 },
    AttemptFailed { attempt: u32, error: String },
    BackoffStarted { attempt: u32, delay: Duration },
    Connected { attempt: u32 },
    Abandoned { attempts: u32 },
    RunStarted {
        sandbox_id: String,
        run_time: Option<Duration>,
    },
    RunEnded { reason: RunEndReason },
    SessionCloseFailed { error: String },
    CooldownStarted { delay: Duration },
    TaskLaunched,
    StaggerPause { delay: Duration },
}

/// One event, attributed to a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// `sbx-N`, the launch index of the controller
    pub tag: String,
    /// Masked credential key
    pub key: String,
    pub kind: EventKind,
}

impl LifecycleEvent {
    pub fn new(tag: &str, key: &CredentialKey, kind: EventKind) -> Self {
        Self {
            tag: tag.to_string(),
            key: key.masked(),
            kind,
        }
    }
}

/// Receives lifecycle events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Renders events as human-readable structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: LifecycleEvent) {
        let LifecycleEvent { tag, key, kind } = event;
        let sandbox = tag.as_str();
        let key = key.as_str();

        match kind {
            EventKind::AttemptStarted {
                attempt,
                max_attempts,
            } => info!(
                sandbox,
                key, "Attempting to start session, attempt {}/{}", attempt, max_attempts
            ),
            EventKind::AttemptFailed { attempt, error } => {
                warn!(sandbox, key, "Connection attempt {} failed: {}", attempt, error)
            }
            EventKind::BackoffStarted { delay, .. } => {
                warn!(sandbox, key, "Cooling down for {}s before retry", delay.as_secs())
            }
            EventKind::Connected { attempt } => {
                info!(sandbox, key, "Session started on attempt {}", attempt)
            }
            EventKind::Abandoned { attempts } => error!(
                sandbox,
                key, "Abandoning key after {} failed attempts", attempts
            ),
            EventKind::RunStarted {
                sandbox_id,
                run_time: Some(run_time),
            } => info!(
                sandbox,
                key,
                sandbox_id = %sandbox_id,
                "Launched, will run for {}s",
                run_time.as_secs()
            ),
            EventKind::RunStarted {
                sandbox_id,
                run_time: None,
            } => info!(sandbox, key, sandbox_id = %sandbox_id, "Launched, running until the workload exits"),
            EventKind::RunEnded { reason } => match reason {
                RunEndReason::Completed { exit_code } => info!(
                    sandbox,
                    key,
                    exit_code,
                    "Workload exited"
                ),
                RunEndReason::RunTimeElapsed => {
                    info!(sandbox, key, "Run time ended, shutting down sandbox")
                }
                RunEndReason::ExecutionError(error) => warn!(
                    sandbox,
                    key, "An error occurred during command execution: {}", error
                ),
            },
            EventKind::SessionCloseFailed { error } => {
                warn!(sandbox, key, "Failed to shut down sandbox: {}", error)
            }
            EventKind::CooldownStarted { delay } => {
                info!(sandbox, key, "In cooldown for {}s", delay.as_secs())
            }
            EventKind::TaskLaunched => info!(sandbox, key, "Controller launched"),
            EventKind::StaggerPause { delay } => {
                info!(sandbox, "Grace period of {}s before next launch", delay.as_secs())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn every_kind() -> Vec<EventKind> {
        vec![
            EventKind::AttemptStarted {
                attempt: 1,
                max_attempts: 10,
            },
            EventKind::AttemptFailed {
                attempt: 1,
                error: "refused".into(),
            },
            EventKind::BackoffStarted {
                attempt: 1,
                delay: Duration::from_secs(60),
            },
            EventKind::Connected { attempt: 2 },
            EventKind::Abandoned { attempts: 10 },
            EventKind::RunStarted {
                sandbox_id: "isb1".into(),
                run_time: Some(Duration::from_secs(230)),
            },
            EventKind::RunStarted {
                sandbox_id: "isb1".into(),
                run_time: None,
            },
            EventKind::RunEnded {
                reason: RunEndReason::Completed { exit_code: Some(0) },
            },
            EventKind::RunEnded {
                reason: RunEndReason::RunTimeElapsed,
            },
            EventKind::RunEnded {
                reason: RunEndReason::ExecutionError("crashed".into()),
            },
            EventKind::SessionCloseFailed {
                error: "HTTP 500".into(),
            },
            EventKind::CooldownStarted {
                delay: Duration::from_secs(30),
            },
            EventKind::TaskLaunched,
            EventKind::StaggerPause {
                delay: Duration::from_secs(30),
            },
        ]
    }

    #[test]
    fn test_event_carries_masked_key() {
        let key = CredentialKey::new("secret-key-123456");
        let event = LifecycleEvent::new("sbx-0", &key, EventKind::TaskLaunched);
        assert_eq!(event.key, "…123456");
        assert_eq!(event.tag, "sbx-0");
    }

    #[test]
    fn test_tracing_sink_renders_every_kind_once() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_target(false)
            .finish();

        let key = CredentialKey::new("secret-key-123456");
        let kinds = every_kind();
        let total = kinds.len();
        tracing::subscriber::with_default(subscriber, || {
            for kind in kinds {
                TracingEventSink.emit(LifecycleEvent::new("sbx-0", &key, kind));
            }
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), total);
        assert!(lines.iter().all(|l| l.contains("sbx-0")));
        assert!(!output.contains("secret-key"));

        let errors = lines.iter().filter(|l| l.contains("ERROR")).count();
        let warnings = lines.iter().filter(|l| l.contains(" WARN ")).count();
        assert_eq!(errors, 1);
        assert_eq!(warnings, 4);
    }
}
