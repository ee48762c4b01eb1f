//! End-to-end lifecycle through the filesystem collaborators and a shell runner

use serde_json::{json, Map, Value};
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tideline::migration::{
    Action, CommandOutput, CommandRouter, Migrator, Operation, PlanStatus, RunRequest, Runner,
    RunnerError, Version,
};
use tideline_migrate::{CommandRunner, DirectoryArtifactSource, JsonFileRecordStore};

fn bag(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Three reversible migrations plus a router; `{dir}` in `runner` is the project root
fn project(runner: &str) -> (TempDir, CommandRouter) {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    let dir = root.join("migrations");
    fs::create_dir_all(&dir).unwrap();
    for (version, name) in [("1", "create_users"), ("2", "add_email"), ("3", "add_index")] {
        fs::write(dir.join(format!("{version}_{name}.up.sql")), format!("up {name}\n")).unwrap();
        fs::write(
            dir.join(format!("{version}_{name}.down.sql")),
            format!("down {name}\n"),
        )
        .unwrap();
    }
    let runner = runner.replace("{dir}", &root.display().to_string());
    let migrator = Migrator::new(
        Arc::new(DirectoryArtifactSource::new(&dir)),
        Arc::new(JsonFileRecordStore::new(root.join("state.json"))),
        Arc::new(CommandRunner::new(runner)),
    );
    (temp_dir, CommandRouter::new(migrator))
}

fn lifecycle(output: CommandOutput) -> tideline::migration::LifecycleReport {
    match output {
        CommandOutput::Lifecycle(report) => report,
        other => panic!("Expected lifecycle report, got {other:?}"),
    }
}

#[test]
fn test_runner_receives_action_on_stdin() {
    let temp_dir = TempDir::new().unwrap();
    let log = temp_dir.path().join("ran.log");
    let runner = CommandRunner::new(format!(
        "echo \"$TIDELINE_OPERATION $TIDELINE_VERSION $(cat)\" >> {}",
        log.display()
    ));
    let version = Version::new("7");
    let action = Action::new("hello");
    runner
        .run(&RunRequest {
            operation: Operation::Apply,
            version: &version,
            name: "greet",
            action: &action,
        })
        .unwrap();
    assert_eq!(fs::read_to_string(&log).unwrap().trim(), "apply 7 hello");
}

#[test]
fn test_non_zero_exit_fails_with_stderr() {
    let runner = CommandRunner::new("echo broken >&2; exit 3");
    let version = Version::new("1");
    let action = Action::new("x");
    match runner.run(&RunRequest {
        operation: Operation::Rollback,
        version: &version,
        name: "m",
        action: &action,
    }) {
        Err(RunnerError::Failed(msg)) => assert!(msg.contains("broken")),
        other => panic!("Expected failure, got {other:?}"),
    }
}

#[test]
fn test_slow_runner_times_out() {
    let runner = CommandRunner::new("sleep 5").with_timeout(Duration::from_millis(100));
    let version = Version::new("1");
    let action = Action::new("x");
    let result = runner.run(&RunRequest {
        operation: Operation::Apply,
        version: &version,
        name: "m",
        action: &action,
    });
    assert!(matches!(result, Err(RunnerError::TimedOut(_))));
}

#[test]
fn test_timeout_holds_while_stdin_is_unread() {
    let runner = CommandRunner::new("sleep 3").with_timeout(Duration::from_millis(200));
    let version = Version::new("1");
    let action = Action::new("x".repeat(1 << 20));
    let started = Instant::now();
    let result = runner.run(&RunRequest {
        operation: Operation::Apply,
        version: &version,
        name: "m",
        action: &action,
    });
    assert!(matches!(result, Err(RunnerError::TimedOut(_))), "got {result:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_exit_before_reading_action_fails() {
    let runner = CommandRunner::new("true");
    let version = Version::new("1");
    let action = Action::new("x".repeat(4 << 20));
    let result = runner.run(&RunRequest {
        operation: Operation::Apply,
        version: &version,
        name: "m",
        action: &action,
    });
    match result {
        Err(RunnerError::Failed(message)) => assert!(message.contains("before reading")),
        other => panic!("Expected failure, got {other:?}"),
    }
}

#[test]
fn test_apply_rollback_squash_through_router() {
    let (_temp_dir, router) = project("cat > /dev/null");

    let applied = lifecycle(router.dispatch("apply", &Map::new()).unwrap());
    let execution = applied.execution.unwrap();
    assert_eq!(execution.status, PlanStatus::Completed);
    assert_eq!(execution.completed, 3);

    let squashed = lifecycle(
        router
            .dispatch("squash", &bag(json!({ "from": 1, "to": 2 })))
            .unwrap(),
    );
    assert!(squashed.execution.unwrap().is_completed());

    match router.dispatch("status", &Map::new()).unwrap() {
        CommandOutput::Status(status) => {
            assert!(status.is_up_to_date());
            assert_eq!(status.applied_count, 2);
            assert!(status.applied[0].is_squash());
            assert!(status.drift.is_empty());
        }
        other => panic!("Expected status, got {other:?}"),
    }

    let rolled_back = lifecycle(router.dispatch("rollback", &bag(json!({ "steps": 2 }))).unwrap());
    assert!(rolled_back.execution.unwrap().is_completed());
    match router.dispatch("status", &Map::new()).unwrap() {
        CommandOutput::Status(status) => assert_eq!(status.pending_count, 3),
        other => panic!("Expected status, got {other:?}"),
    }
}

#[test]
fn test_failing_step_is_resumable() {
    let (temp_dir, router) = project(
        "cd {dir} && body=$(cat) && case \"$body\" in *add_email*) [ -f ok ] || exit 1;; esac",
    );

    let first = lifecycle(router.dispatch("apply", &Map::new()).unwrap());
    let execution = first.execution.unwrap();
    assert_eq!(execution.status, PlanStatus::PartiallyFailed);
    assert_eq!(execution.completed, 1);
    assert_eq!(execution.failure.unwrap().version, Version::new("2"));

    fs::write(temp_dir.path().join("ok"), "").unwrap();
    let resumed = lifecycle(router.dispatch("apply", &Map::new()).unwrap());
    let versions: Vec<_> = resumed.plan.versions().iter().map(|v| v.to_string()).collect();
    assert_eq!(versions, ["2", "3"]);
    assert!(resumed.execution.unwrap().is_completed());
}
