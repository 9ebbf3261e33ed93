// ABOUTME: Bounded-attempt connection loop that opens a session for one credential key
// ABOUTME: Sleeps a randomized backoff between failures and abandons the key after the ceiling

use crate::events::{EventKind, EventSink, LifecycleEvent};
use crate::providers::{ProviderError, Session, SessionGateway};
use crate::sampler::DelaySampler;
use sandloop_config::{CredentialKey, DelayRange, TimingParameters};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Uniform random delay between attempts, not exponential.
    pub backoff: DelayRange,
    /// Give up immediately on authentication failures instead of burning the
    /// remaining attempts.
    pub abandon_on_auth_error: bool,
}

impl RetryPolicy {
    pub fn from_timing(timing: &TimingParameters) -> Self {
        Self {
            max_attempts: timing.max_attempts,
            backoff: timing.backoff,
            abandon_on_auth_error: false,
        }
    }
}

pub enum ConnectOutcome {
    Connected {
        session: Box<dyn Session>,
        attempt: u32,
    },
    /// Terminal for this key.
    Abandoned {
        attempts: u32,
        last_error: Option<ProviderError>,
    },
}

impl fmt::Debug for ConnectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectOutcome::Connected { session, attempt } => f
                .debug_struct("Connected")
                .field("session", &session.id())
                .field("attempt", attempt)
                .finish(),
            ConnectOutcome::Abandoned {
                attempts,
                last_error,
            } => f
                .debug_struct("Abandoned")
                .field("attempts", attempts)
                .field("last_error", last_error)
                .finish(),
        }
    }
}

/// Opens sessions for a single key on behalf of one controller.
pub struct ConnectionRetry<'a> {
    pub tag: &'a str,
    pub gateway: &'a dyn SessionGateway,
    pub sampler: &'a dyn DelaySampler,
    pub events: &'a dyn EventSink,
    pub policy: RetryPolicy,
}

impl ConnectionRetry<'_> {
    /// Try up to `max_attempts` opens. Every error counts as transient unless the
    /// auth fast-path is enabled.
    pub async fn attempt_connect(&self, key: &CredentialKey) -> ConnectOutcome {
        let max_attempts = self.policy.max_attempts;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            self.emit(
                key,
                EventKind::AttemptStarted {
                    attempt,
                    max_attempts,
                },
            );

            match self.gateway.open(key).await {
                Ok(session) => {
                    self.emit(key, EventKind::Connected { attempt });
                    return ConnectOutcome::Connected { session, attempt };
                }
                Err(e) => {
                    self.emit(
                        key,
                        EventKind::AttemptFailed {
                            attempt,
                            error: e.to_string(),
                        },
                    );

                    let permanent = self.policy.abandon_on_auth_error && e.is_permanent();
                    last_error = Some(e);

                    if permanent {
                        self.emit(key, EventKind::Abandoned { attempts: attempt });
                        return ConnectOutcome::Abandoned {
                            attempts: attempt,
                            last_error,
                        };
                    }

                    if attempt < max_attempts {
                        let delay = self.sampler.sample(self.policy.backoff);
                        self.emit(key, EventKind::BackoffStarted { attempt, delay });
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.emit(
            key,
            EventKind::Abandoned {
                attempts: max_attempts,
            },
        );
        ConnectOutcome::Abandoned {
            attempts: max_attempts,
            last_error,
        }
    }

    fn emit(&self, key: &CredentialKey, kind: EventKind) {
        self.events.emit(LifecycleEvent::new(self.tag, key, kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CommandHandle, ExecMode, Result as ProviderResult};
    use crate::sampler::SeededSampler;
    use async_trait::async_trait;
    use mockall::mock;
    use std::sync::Mutex;
    use std::time::Duration;

    mock! {
        Gateway {}

        #[async_trait]
        impl SessionGateway for Gateway {
            fn name(&self) -> &'static str;
            async fn open(&self, credential: &CredentialKey) -> ProviderResult<Box<dyn Session>>;
        }
    }

    struct StubSession;

    #[async_trait]
    impl Session for StubSession {
        fn id(&self) -> &str {
            "stub"
        }

        async fn start(
            &self,
            _command: &str,
            _mode: ExecMode,
        ) -> ProviderResult<Box<dyn CommandHandle>> {
            Err(ProviderError::Execution("not used".into()))
        }

        async fn close(&self) -> ProviderResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<EventKind>>);

    impl EventSink for Collect {
        fn emit(&self, event: LifecycleEvent) {
            self.0.lock().unwrap().push(event.kind);
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: DelayRange::new("backoff", 60, 250).unwrap(),
            abandon_on_auth_error: false,
        }
    }

    fn backoffs(events: &Collect) -> Vec<Duration> {
        events
            .0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|k| match k {
                EventKind::BackoffStarted { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_on_first_attempt() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_open()
            .times(1)
            .returning(|_| Ok(Box::new(StubSession) as Box<dyn Session>));
        let events = Collect::default();
        let sampler = SeededSampler::new(1);

        let retry = ConnectionRetry {
            tag: "sbx-0",
            gateway: &gateway,
            sampler: &sampler,
            events: &events,
            policy: policy(10),
        };
        let outcome = retry.attempt_connect(&CredentialKey::new("key")).await;

        assert!(matches!(outcome, ConnectOutcome::Connected { attempt: 1, .. }));
        assert!(backoffs(&events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandons_after_ten_failures() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_open()
            .times(10)
            .returning(|_| Err(ProviderError::Connection("refused".into())));
        let events = Collect::default();
        let sampler = SeededSampler::new(2);

        let retry = ConnectionRetry {
            tag: "sbx-0",
            gateway: &gateway,
            sampler: &sampler,
            events: &events,
            policy: policy(10),
        };
        let started = tokio::time::Instant::now();
        let outcome = retry.attempt_connect(&CredentialKey::new("key")).await;

        match outcome {
            ConnectOutcome::Abandoned {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 10);
                assert_eq!(last_error, Some(ProviderError::Connection("refused".into())));
            }
            other => panic!("expected abandonment, got {:?}", other),
        }

        let delays = backoffs(&events);
        assert_eq!(delays.len(), 9);
        assert!(delays.iter().all(|d| (60..=250).contains(&d.as_secs())));
        let total: Duration = delays.iter().sum();
        assert!(started.elapsed() >= total);
        assert_eq!(
            events.0.lock().unwrap().last(),
            Some(&EventKind::Abandoned { attempts: 10 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let mut gateway = MockGateway::new();
        let mut calls = 0;
        gateway.expect_open().times(3).returning(move |_| {
            calls += 1;
            if calls < 3 {
                Err(ProviderError::Connection("503".into()))
            } else {
                Ok(Box::new(StubSession) as Box<dyn Session>)
            }
        });
        let events = Collect::default();
        let sampler = SeededSampler::new(3);

        let retry = ConnectionRetry {
            tag: "sbx-2",
            gateway: &gateway,
            sampler: &sampler,
            events: &events,
            policy: policy(10),
        };
        let outcome = retry.attempt_connect(&CredentialKey::new("key")).await;

        assert!(matches!(outcome, ConnectOutcome::Connected { attempt: 3, .. }));
        assert_eq!(backoffs(&events).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_errors_retried_uniformly_by_default() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_open()
            .times(4)
            .returning(|_| Err(ProviderError::Authentication("HTTP 401".into())));
        let events = Collect::default();
        let sampler = SeededSampler::new(4);

        let retry = ConnectionRetry {
            tag: "sbx-0",
            gateway: &gateway,
            sampler: &sampler,
            events: &events,
            policy: policy(4),
        };
        let outcome = retry.attempt_connect(&CredentialKey::new("key")).await;

        assert!(matches!(outcome, ConnectOutcome::Abandoned { attempts: 4, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_fast_path_abandons_immediately() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_open()
            .times(1)
            .returning(|_| Err(ProviderError::Authentication("HTTP 401".into())));
        let events = Collect::default();
        let sampler = SeededSampler::new(5);

        let retry = ConnectionRetry {
            tag: "sbx-0",
            gateway: &gateway,
            sampler: &sampler,
            events: &events,
            policy: RetryPolicy {
                abandon_on_auth_error: true,
                ..policy(10)
            },
        };
        let outcome = retry.attempt_connect(&CredentialKey::new("key")).await;

        assert!(matches!(outcome, ConnectOutcome::Abandoned { attempts: 1, .. }));
        assert!(backoffs(&events).is_empty());
    }
}
