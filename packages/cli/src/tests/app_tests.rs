use crate::app::{self, RunOutcome, EXIT_ALL_FAILED, EXIT_CONFIG_ERROR, EXIT_OK};
use crate::config::{Cli, Settings};
use clap::Parser;
use sandloop_sandbox::test_utils::{OpenScript, RecordingSink, ScriptedGateway, WorkloadScript};
use sandloop_sandbox::{EventKind, ProviderError};
use std::sync::Arc;
use std::time::Duration;

fn settings(args: &[&str]) -> Settings {
    let mut argv = vec!["sandloop", "--cmd", "./work.sh", "--seed", "7"];
    argv.extend_from_slice(args);
    let cli = Cli::try_parse_from(argv).unwrap();
    Settings::resolve(cli, Vec::new()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_persistent_run_completes_with_success_exit() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .with_key(
                "k1",
                OpenScript::AlwaysSucceed,
                WorkloadScript::CompleteAfter {
                    after: Duration::from_secs(60),
                    exit_code: Some(0),
                },
            )
            .with_key(
                "k2",
                OpenScript::AlwaysFail(ProviderError::Connection("refused".to_string())),
                WorkloadScript::RunForever,
            ),
    );
    let sink = Arc::new(RecordingSink::new());

    let outcome = app::run(
        settings(&["--mode", "persistent", "--key", "k1", "--key", "k2"]),
        gateway,
        sink.clone(),
        std::future::pending::<()>(),
    )
    .await;

    match &outcome {
        RunOutcome::Completed(report) => assert_eq!(report.failed_count(), 1),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(outcome.exit_code(), EXIT_OK);
    assert_eq!(sink.count(|k| matches!(k, EventKind::TaskLaunched)), 2);
}

#[tokio::test(start_paused = true)]
async fn test_every_key_abandoned_exits_with_failure() {
    let gateway = Arc::new(ScriptedGateway::new().with_key(
        "k1",
        OpenScript::AlwaysFail(ProviderError::Authentication("HTTP 401".to_string())),
        WorkloadScript::RunForever,
    ));

    let outcome = app::run(
        settings(&["--key", "k1", "--abandon-on-auth-error"]),
        gateway.clone(),
        Arc::new(RecordingSink::new()),
        std::future::pending::<()>(),
    )
    .await;

    assert!(matches!(outcome, RunOutcome::AllFailed(_)));
    assert_eq!(outcome.exit_code(), EXIT_ALL_FAILED);
    assert_eq!(gateway.open_count("k1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_cyclic_controllers() {
    let gateway = Arc::new(ScriptedGateway::new().with_key(
        "k1",
        OpenScript::AlwaysSucceed,
        WorkloadScript::RunForever,
    ));
    let sink = Arc::new(RecordingSink::new());

    let outcome = app::run(
        settings(&["--key", "k1"]),
        gateway.clone(),
        sink.clone(),
        tokio::time::sleep(Duration::from_secs(3600)),
    )
    .await;

    assert!(matches!(outcome, RunOutcome::Interrupted));
    assert_eq!(outcome.exit_code(), EXIT_OK);
    // An hour covers several full run/cooldown cycles.
    assert!(gateway.open_count("k1") >= 2);
    assert!(sink.count(|k| matches!(k, EventKind::CooldownStarted { .. })) >= 2);
}

#[rstest::rstest]
#[case(&["--key", "k1"])]
#[case(&["--key", "k1", "--cmd", "x", "--run-time-min", "abc"])]
#[case(&["--cmd", "x", "--cmd-file", "run.sh"])]
#[case(&["--cmd", "x", "--mode", "sometimes"])]
fn test_invalid_arguments_exit_as_config_error(#[case] args: &[&str]) {
    let mut argv = vec!["sandloop"];
    argv.extend_from_slice(args);

    let err = Cli::try_parse_from(argv).unwrap_err();

    assert_eq!(app::parse_error_exit_code(&err), EXIT_CONFIG_ERROR);
}

#[rstest::rstest]
#[case("--help")]
#[case("--version")]
fn test_help_and_version_exit_cleanly(#[case] flag: &str) {
    let err = Cli::try_parse_from(["sandloop", flag]).unwrap_err();

    assert_eq!(app::parse_error_exit_code(&err), EXIT_OK);
}
