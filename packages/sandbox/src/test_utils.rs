// ABOUTME: Scripted in-memory gateway and recording event sink for lifecycle tests
// ABOUTME: Compiled for unit tests and for integration tests through the test-utils feature

use crate::events::{EventKind, EventSink, LifecycleEvent};
use crate::providers::{
    CommandHandle, Completion, ExecMode, ProviderError, Result, Session, SessionGateway,
};
use async_trait::async_trait;
use sandloop_config::CredentialKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How `open` behaves for one key.
#[derive(Debug, Clone)]
pub enum OpenScript {
    AlwaysSucceed,
    AlwaysFail(ProviderError),
    /// Fail the first `n` opens, then succeed.
    FailTimes(u32),
    /// Succeed the first `n` opens, then fail forever.
    SucceedTimes(u32),
}

/// How the workload behaves inside every session opened for a key.
#[derive(Debug, Clone)]
pub enum WorkloadScript {
    CompleteAfter {
        after: Duration,
        exit_code: Option<i32>,
    },
    /// Never finishes on its own.
    RunForever,
    FailToStart(String),
    ErrorAfter {
        after: Duration,
        error: String,
    },
}

#[derive(Debug, Clone)]
struct KeyScript {
    open: OpenScript,
    workload: WorkloadScript,
}

/// Gateway whose behaviour is scripted per credential key.
#[derive(Default)]
pub struct ScriptedGateway {
    scripts: HashMap<String, KeyScript>,
    opens: Mutex<HashMap<String, u32>>,
    closes: Arc<Mutex<HashMap<String, u32>>>,
    sessions: AtomicU32,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: &str, open: OpenScript, workload: WorkloadScript) -> Self {
        self.scripts
            .insert(key.to_string(), KeyScript { open, workload });
        self
    }

    /// Number of `open` calls made with `key`.
    pub fn open_count(&self, key: &str) -> u32 {
        lock(&self.opens).get(key).copied().unwrap_or(0)
    }

    /// Number of `close` calls made on sessions opened with `key`.
    pub fn close_count(&self, key: &str) -> u32 {
        lock(&self.closes).get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SessionGateway for ScriptedGateway {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn open(&self, credential: &CredentialKey) -> Result<Box<dyn Session>> {
        let key = credential.expose().to_string();
        let call = {
            let mut opens = lock(&self.opens);
            let count = opens.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let script = self.scripts.get(&key).cloned().ok_or_else(|| {
            ProviderError::Authentication(format!("unknown key {}", credential.masked()))
        })?;

        let succeed = match &script.open {
            OpenScript::AlwaysSucceed => true,
            OpenScript::AlwaysFail(e) => return Err(e.clone()),
            OpenScript::FailTimes(n) => call > *n,
            OpenScript::SucceedTimes(n) => call <= *n,
        };
        if !succeed {
            return Err(ProviderError::Connection(format!(
                "scripted failure on open #{}",
                call
            )));
        }

        let index = self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            id: format!("scripted-{}", index),
            key,
            workload: script.workload,
            closes: self.closes.clone(),
        }))
    }
}

struct ScriptedSession {
    id: String,
    key: String,
    workload: WorkloadScript,
    closes: Arc<Mutex<HashMap<String, u32>>>,
}

#[async_trait]
impl Session for ScriptedSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self, _command: &str, _mode: ExecMode) -> Result<Box<dyn CommandHandle>> {
        if let WorkloadScript::FailToStart(message) = &self.workload {
            return Err(ProviderError::Execution(message.clone()));
        }
        Ok(Box::new(ScriptedHandle {
            workload: self.workload.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        *lock(&self.closes).entry(self.key.clone()).or_insert(0) += 1;
        Ok(())
    }
}

struct ScriptedHandle {
    workload: WorkloadScript,
}

#[async_trait]
impl CommandHandle for ScriptedHandle {
    async fn wait(&mut self, timeout: Option<Duration>) -> Result<Completion> {
        let (after, result) = match &self.workload {
            WorkloadScript::CompleteAfter { after, exit_code } => (
                Some(*after),
                Ok(Completion {
                    exit_code: *exit_code,
                }),
            ),
            WorkloadScript::ErrorAfter { after, error } => {
                (Some(*after), Err(ProviderError::Execution(error.clone())))
            }
            WorkloadScript::RunForever => (None, Ok(Completion { exit_code: None })),
            WorkloadScript::FailToStart(message) => {
                return Err(ProviderError::Execution(message.clone()))
            }
        };

        match (after, timeout) {
            (Some(after), Some(deadline)) if after <= deadline => {
                tokio::time::sleep(after).await;
                result
            }
            (Some(after), None) => {
                tokio::time::sleep(after).await;
                result
            }
            (_, Some(deadline)) => {
                tokio::time::sleep(deadline).await;
                Err(ProviderError::TimeoutExceeded(deadline))
            }
            (None, None) => std::future::pending().await,
        }
    }
}

/// Event sink that keeps every event in memory.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        lock(&self.events).clone()
    }

    /// Event kinds emitted under `tag`, in order.
    pub fn kinds_for(&self, tag: &str) -> Vec<EventKind> {
        lock(&self.events)
            .iter()
            .filter(|e| e.tag == tag)
            .map(|e| e.kind.clone())
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&EventKind) -> bool) -> usize {
        lock(&self.events).iter().filter(|e| predicate(&e.kind)).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: LifecycleEvent) {
        lock(&self.events).push(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
