//! Orchestrator lifecycle tests against fake collaborators.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tether::Error;

use crate::fixtures::{
    integration, prebuilt, CallLog, FakeNotifier, FakeServer, Harness, ListenBehavior,
    NotifierBehavior, WindowBehavior,
};

const CLOSE_SOON: WindowBehavior = WindowBehavior::CloseAfter(Duration::from_millis(30));

/// Test: Integration registration matrix
/// Given every combination of {Discord, Telegram} x {disabled, enabled} x {builds, fails}
/// When the orchestrator runs
/// Then exactly the enabled, successfully built integrations start,
///      and any construction failure starts nothing at all
#[tokio::test]
async fn test_integration_matrix() {
    for discord_enabled in [false, true] {
        for discord_builds in [true, false] {
            for telegram_enabled in [false, true] {
                for telegram_builds in [true, false] {
                    let case = format!(
                        "discord(enabled={discord_enabled}, builds={discord_builds}) \
                         telegram(enabled={telegram_enabled}, builds={telegram_builds})"
                    );
                    let harness = Harness::new(ListenBehavior::ServeUntilStopped, CLOSE_SOON);
                    let log = harness.log.clone();
                    let harness = harness
                        .integration(integration("discord", discord_enabled, discord_builds, &log))
                        .integration(integration("telegram", telegram_enabled, telegram_builds, &log));

                    let (result, log, bus) = harness.run(CancellationToken::new()).await;

                    let discord_fails = discord_enabled && !discord_builds;
                    let telegram_fails = telegram_enabled && !telegram_builds;

                    // Disabled integrations are never even constructed.
                    assert_eq!(log.contains("discord.build"), discord_enabled, "{case}");
                    // Construction stops at the first failure.
                    assert_eq!(
                        log.contains("telegram.build"),
                        telegram_enabled && !discord_fails,
                        "{case}"
                    );

                    if discord_fails || telegram_fails {
                        let expected = if discord_fails { "discord" } else { "telegram" };
                        match result {
                            Err(Error::Init { integration, .. }) => {
                                assert_eq!(integration, expected, "{case}")
                            }
                            other => panic!("{case}: expected init error, got {other:?}"),
                        }
                        assert!(!log.contains("front_end.run"), "{case}");
                        assert!(!log.contains("server.listen"), "{case}");
                        assert!(!log.contains("discord.start"), "{case}");
                        assert!(!log.contains("telegram.start"), "{case}");
                        assert!(!log.contains("jobs.stop_all"), "{case}");
                        assert_eq!(bus.handler_count(), 0, "{case}");
                    } else {
                        assert!(result.is_ok(), "{case}: {result:?}");
                        assert_eq!(log.contains("discord.start"), discord_enabled, "{case}");
                        assert_eq!(log.contains("telegram.start"), telegram_enabled, "{case}");
                        assert_eq!(
                            bus.handler_count(),
                            discord_enabled as usize + telegram_enabled as usize,
                            "{case}"
                        );
                    }
                }
            }
        }
    }
}

/// Test: Operator closes the window
/// Given a front-end that returns Ok
/// When it returns
/// Then every other task returns and the terminal result is Ok
#[tokio::test]
async fn test_front_end_close_is_clean_shutdown() {
    let harness = Harness::new(ListenBehavior::ServeUntilStopped, CLOSE_SOON);
    let log = harness.log.clone();
    let notifier = FakeNotifier::new("discord", &log, NotifierBehavior::RunUntilCancelled);
    let (result, log, _bus) = harness.integration(prebuilt(notifier)).run(CancellationToken::new()).await;

    assert!(result.is_ok(), "{result:?}");
    assert!(log.contains("front_end.closed"));
    assert!(log.contains("discord.start"));
    assert!(log.contains("server.listen returned"));
    log.assert_before("front_end.closed", "jobs.stop_all");
}

/// Test: Task error propagation
/// Given a notifier that fails while everything else runs
/// When it returns its error
/// Then the signal fires, every task returns, and that error is the result
#[tokio::test]
async fn test_task_error_cancels_everything() {
    let harness = Harness::new(ListenBehavior::ServeUntilStopped, WindowBehavior::WaitForDestroy);
    let log = harness.log.clone();
    let flaky = FakeNotifier::new(
        "telegram",
        &log,
        NotifierBehavior::FailAfter(Duration::from_millis(30)),
    );
    let late = FakeNotifier::new("discord", &log, NotifierBehavior::FailOnCancel);
    let root = CancellationToken::new();

    let (result, log, _bus) = harness
        .integration(prebuilt(late))
        .integration(prebuilt(flaky))
        .run(root.clone())
        .await;

    match result {
        Err(Error::Validation(message)) => assert_eq!(message, "telegram lost its connection"),
        other => panic!("expected the notifier error, got {other:?}"),
    }
    assert!(log.contains("front_end.destroyed"));
    assert!(log.contains("server.listen returned"));
    assert_eq!(log.count("jobs.stop_all"), 1);
    assert_eq!(log.count("server.stop"), 1);
    // The signal is derived from root, never the other way round.
    assert!(!root.is_cancelled());
}

/// Test: Control server cannot bind
/// Given listen fails with "address in use" and a peer that errors later
/// When the orchestrator runs
/// Then the terminal result is the bind error
#[tokio::test]
async fn test_addr_in_use_wins_over_later_errors() {
    let harness = Harness::new(ListenBehavior::AddrInUse, WindowBehavior::WaitForDestroy);
    let log = harness.log.clone();
    let late = FakeNotifier::new("discord", &log, NotifierBehavior::FailOnCancel);

    let (result, log, _bus) = harness.integration(prebuilt(late)).run(CancellationToken::new()).await;

    let err = result.unwrap_err();
    assert!(err.is_addr_in_use(), "unexpected error: {err}");
    assert!(log.contains("front_end.destroyed"));
}

/// Test: Front-end failure and panic
/// Given a front-end that errors or panics
/// When it returns
/// Then the whole process shuts down with a task error
#[tokio::test]
async fn test_front_end_failure_and_panic() {
    let (result, _log, _bus) =
        Harness::new(ListenBehavior::ServeUntilStopped, WindowBehavior::FailAfter(Duration::from_millis(20)))
            .run(CancellationToken::new())
            .await;
    assert!(matches!(result, Err(Error::FrontEnd(_))), "{result:?}");

    let (result, log, _bus) =
        Harness::new(ListenBehavior::ServeUntilStopped, WindowBehavior::PanicAfter(Duration::from_millis(20)))
            .run(CancellationToken::new())
            .await;
    match result {
        Err(Error::TaskPanicked { task, message }) => {
            assert_eq!(task, "front-end");
            assert_eq!(message, "window exploded");
        }
        other => panic!("expected a panicked task, got {other:?}"),
    }
    log.assert_before("jobs.stop_all", "server.stop");
}

/// Test: External termination request
/// Given everything running
/// When the root token is cancelled from outside
/// Then all tasks drain and the result is Ok
#[tokio::test]
async fn test_external_cancel_is_clean_shutdown() {
    let harness = Harness::new(ListenBehavior::ServeUntilStopped, WindowBehavior::WaitForDestroy);
    let root = CancellationToken::new();
    let trigger = root.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let (result, log, _bus) = harness.run(root).await;
    assert!(result.is_ok(), "{result:?}");
    assert!(log.contains("front_end.destroyed"));
}

/// Test: Job Manager stops before the Control Server for every trigger
#[tokio::test]
async fn test_stop_all_precedes_server_stop() {
    // Window close.
    let (_, log, _) = Harness::new(ListenBehavior::ServeUntilStopped, CLOSE_SOON)
        .run(CancellationToken::new())
        .await;
    log.assert_before("jobs.stop_all", "server.stop");

    // Task error.
    let harness = Harness::new(ListenBehavior::ServeUntilStopped, WindowBehavior::WaitForDestroy);
    let failing = FakeNotifier::new(
        "telegram",
        &harness.log,
        NotifierBehavior::FailAfter(Duration::from_millis(10)),
    );
    let (_, log, _) = harness.integration(prebuilt(failing)).run(CancellationToken::new()).await;
    log.assert_before("jobs.stop_all", "server.stop");

    // External termination.
    let root = CancellationToken::new();
    root.cancel();
    let (_, log, _) = Harness::new(ListenBehavior::ServeUntilStopped, WindowBehavior::WaitForDestroy)
        .run(root)
        .await;
    log.assert_before("jobs.stop_all", "server.stop");
}

/// Test: Shutdown error
/// Given a server whose stop() fails
/// When the operator closes the window
/// Then the stop error is the terminal result
#[tokio::test]
async fn test_server_stop_error_is_returned() {
    let log = CallLog::default();
    let server = FakeServer::failing_stop(&log);
    let (result, log, _bus) = Harness::with_server(log, server, CLOSE_SOON)
        .run(CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::ShutdownTimeout { .. })), "{result:?}");
    let stop = log.position("server.stop").unwrap();
    assert!(log.position("jobs.stop_all").unwrap() < stop);
}
