// ABOUTME: Staggered launch of one lifecycle controller per credential key
// ABOUTME: Spawns controllers with randomized gaps, then collects every outcome independently

use crate::events::{EventKind, LifecycleEvent};
use crate::lifecycle::{ControllerContext, ControllerOutcome, LifecycleController};
use futures::FutureExt;
use sandloop_config::CredentialKey;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Final outcome of every controller, in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchReport {
    pub outcomes: Vec<(String, ControllerOutcome)>,
}

impl LaunchReport {
    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_failure()).count()
    }

    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.failed_count() == self.outcomes.len()
    }
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("All {} controller(s) failed", .0.outcomes.len())]
    AllFailed(LaunchReport),
}

pub struct LaunchScheduler {
    ctx: ControllerContext,
}

impl LaunchScheduler {
    pub fn new(ctx: ControllerContext) -> Self {
        Self { ctx }
    }

    /// Launch a controller per key, pausing a sampled stagger between launches,
    /// then wait for all of them.
    ///
    /// Controllers live in a `JoinSet`: dropping this future aborts them all.
    pub async fn run(&self, keys: Vec<CredentialKey>) -> Result<LaunchReport, LaunchError> {
        let total = keys.len();
        let mut tags = Vec::with_capacity(total);
        let mut tasks = JoinSet::new();

        info!(
            "Launching {} controller(s) in {} mode with a {} grace period",
            total, self.ctx.mode, self.ctx.timing.stagger
        );

        for (index, key) in keys.into_iter().enumerate() {
            let controller = LifecycleController::new(index, key.clone(), self.ctx.clone());
            let tag = controller.tag().to_string();
            self.ctx
                .events
                .emit(LifecycleEvent::new(&tag, &key, EventKind::TaskLaunched));

            tasks.spawn(async move {
                let mut controller = controller;
                let outcome = match AssertUnwindSafe(controller.run()).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(payload) => ControllerOutcome::Panicked {
                        message: panic_message(payload.as_ref()),
                    },
                };
                (index, outcome)
            });

            if index + 1 < total {
                let delay = self.ctx.sampler.sample(self.ctx.timing.stagger);
                self.ctx.events.emit(LifecycleEvent::new(
                    &tag,
                    &key,
                    EventKind::StaggerPause { delay },
                ));
                tokio::time::sleep(delay).await;
            }
            tags.push(tag);
        }

        let mut outcomes: Vec<Option<ControllerOutcome>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => warn!("Controller task did not complete: {}", e),
            }
        }

        let report = LaunchReport {
            outcomes: tags
                .into_iter()
                .zip(outcomes)
                .map(|(tag, outcome)| {
                    let outcome = outcome.unwrap_or_else(|| ControllerOutcome::Panicked {
                        message: "controller task was cancelled".to_string(),
                    });
                    (tag, outcome)
                })
                .collect(),
        };

        if report.all_failed() {
            return Err(LaunchError::AllFailed(report));
        }
        Ok(report)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "controller panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_all_failed() {
        let report = LaunchReport {
            outcomes: vec![
                ("sbx-0".into(), ControllerOutcome::Abandoned { attempts: 10 }),
                (
                    "sbx-1".into(),
                    ControllerOutcome::ExecutionFailed {
                        error: "boom".into(),
                    },
                ),
            ],
        };
        assert!(report.all_failed());
        assert_eq!(report.failed_count(), 2);
    }

    #[test]
    fn test_report_partial_failure_is_not_all_failed() {
        let report = LaunchReport {
            outcomes: vec![
                ("sbx-0".into(), ControllerOutcome::Abandoned { attempts: 10 }),
                (
                    "sbx-1".into(),
                    ControllerOutcome::WorkloadExited { exit_code: Some(0) },
                ),
            ],
        };
        assert!(!report.all_failed());
        assert!(!LaunchReport::default().all_failed());
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(5u8);
        assert_eq!(panic_message(boxed.as_ref()), "controller panicked");
    }
}
