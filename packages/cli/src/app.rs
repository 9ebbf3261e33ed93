// ABOUTME: Top-level launch orchestration for the sandloop binary
// ABOUTME: Wires settings into the scheduler, races it against shutdown and maps results to exit codes

use crate::config::Settings;
use sandloop_sandbox::{
    ControllerContext, DelaySampler, EventSink, LaunchError, LaunchReport, LaunchScheduler,
    SeededSampler, SessionGateway, ThreadRngSampler,
};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG_ERROR: i32 = 1;
pub const EXIT_ALL_FAILED: i32 = 2;

/// How a launch ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every controller reached a terminal state and at least one did not fail.
    Completed(LaunchReport),
    /// Every controller failed.
    AllFailed(LaunchReport),
    /// Shutdown was requested before the controllers finished.
    Interrupted,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed(_) | RunOutcome::Interrupted => EXIT_OK,
            RunOutcome::AllFailed(_) => EXIT_ALL_FAILED,
        }
    }
}

/// Exit status for an argument parsing failure. Help and version requests are
/// not failures.
pub fn parse_error_exit_code(error: &clap::Error) -> i32 {
    if error.use_stderr() {
        EXIT_CONFIG_ERROR
    } else {
        EXIT_OK
    }
}

pub fn build_sampler(seed: Option<u64>) -> Arc<dyn DelaySampler> {
    match seed {
        Some(seed) => Arc::new(SeededSampler::new(seed)),
        None => Arc::new(ThreadRngSampler),
    }
}

pub fn build_context(
    settings: &Settings,
    gateway: Arc<dyn SessionGateway>,
    events: Arc<dyn EventSink>,
) -> ControllerContext {
    ControllerContext {
        gateway,
        sampler: build_sampler(settings.seed),
        events,
        timing: Arc::new(settings.timing.clone()),
        mode: settings.mode,
        command: Arc::from(settings.command.as_str()),
        abandon_on_auth_error: settings.abandon_on_auth_error,
    }
}

/// Run one controller per configured key until they all finish or `shutdown`
/// resolves. Interrupting drops the scheduler, which aborts every controller.
pub async fn run<F>(
    settings: Settings,
    gateway: Arc<dyn SessionGateway>,
    events: Arc<dyn EventSink>,
    shutdown: F,
) -> RunOutcome
where
    F: Future<Output = ()>,
{
    info!(
        "Starting {} controller(s) on {} in {} mode",
        settings.keys.len(),
        gateway.name(),
        settings.mode
    );
    info!(
        "Timing: run {} / downtime {} / stagger {} / backoff {} x{}",
        settings.timing.run_time,
        settings.timing.downtime,
        settings.timing.stagger,
        settings.timing.backoff,
        settings.timing.max_attempts
    );

    let scheduler = LaunchScheduler::new(build_context(&settings, gateway, events));
    let keys = settings.keys.clone().into_keys();

    tokio::select! {
        result = scheduler.run(keys) => match result {
            Ok(report) => {
                info!(
                    "All controllers finished ({} of {} failed)",
                    report.failed_count(),
                    report.outcomes.len()
                );
                RunOutcome::Completed(report)
            }
            Err(LaunchError::AllFailed(report)) => {
                error!("Every controller failed ({} total)", report.outcomes.len());
                RunOutcome::AllFailed(report)
            }
        },
        _ = shutdown => {
            warn!(
                "Interrupted - remote sandboxes may keep running until the provider timeout ({}s)",
                settings.gateway.sandbox_timeout.as_secs()
            );
            RunOutcome::Interrupted
        }
    }
}
