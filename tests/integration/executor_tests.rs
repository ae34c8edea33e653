use std::sync::Arc;
use std::time::Duration;

use skillforge::events::{EventBus, drain_names};
use skillforge::execution::{
    ChangeKind, ExecutionOptions, ExecutionStatus, Script, ScriptExecutor,
};
use skillforge::sandbox::{Permission, PermissionKind, ResourceKind};
use skillforge::test_utils::WorkspaceFixture;

fn quick_options() -> ExecutionOptions {
    ExecutionOptions {
        timeout: Some(Duration::from_secs(10)),
        kill_grace: Duration::from_millis(200),
        sample_interval: Duration::from_millis(50),
        ..ExecutionOptions::default()
    }
}

fn shell(fixture: &WorkspaceFixture, name: &str, body: &str) -> Script {
    Script::new(name, "sh", fixture.path()).with_args(["-c", body])
}

#[tokio::test(flavor = "multi_thread")]
async fn successful_run_records_output_steps_and_changes() {
    let fixture = WorkspaceFixture::new();
    fixture.create_file("keep.txt", "same");
    let events = EventBus::new();
    let rx = events.subscribe();
    let executor = ScriptExecutor::for_workspace(fixture.path(), events);

    let script = shell(&fixture, "writer", "echo hello; echo oops >&2; echo data > out.txt");
    let result = executor.execute(&script, &quick_options()).await.unwrap();

    assert!(result.success, "{result:?}");
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.contains("hello"));
    assert!(result.stderr.contains("oops"));
    assert_eq!(result.changes.len(), 1);
    assert_eq!(result.changes[0].operation, ChangeKind::Create);
    assert_eq!(result.files_modified, vec![std::path::PathBuf::from("out.txt")]);

    let state = executor.tracker().execution(&result.execution_id).unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(
        state.metadata_str("checkpoint_id"),
        result.checkpoint_id.as_deref()
    );
    let steps: Vec<&str> = state.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        steps,
        vec![
            "Checking permissions",
            "Creating checkpoint",
            "Creating sandbox",
            "Setting up resource limits",
            "Executing script",
            "Detecting file changes",
        ]
    );
    assert!(state.steps.iter().all(|s| s.status == ExecutionStatus::Completed));
    assert!((state.progress - 100.0).abs() < f64::EPSILON);

    let names = drain_names(&rx);
    assert_eq!(names.first(), Some(&"execution:started"));
    assert!(names.contains(&"execution:step:completed"));
    assert_eq!(executor.sandbox_creator().active_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn nonzero_exit_is_a_failed_result_not_an_error() {
    let fixture = WorkspaceFixture::new();
    let executor = ScriptExecutor::for_workspace(fixture.path(), EventBus::new());

    let result = executor
        .execute(&shell(&fixture, "failing", "exit 3"), &quick_options())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.error.as_deref(), Some("Script exited with code 3"));
    assert!(!result.rolled_back);
    assert_eq!(executor.status(&result.execution_id), Some(ExecutionStatus::Failed));
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_kills_the_process_and_records_a_time_violation() {
    let fixture = WorkspaceFixture::new();
    let executor = ScriptExecutor::for_workspace(fixture.path(), EventBus::new());
    let options = ExecutionOptions {
        timeout: Some(Duration::from_millis(300)),
        create_checkpoint: false,
        ..quick_options()
    };

    let script = Script::new("sleeper", "sleep", fixture.path()).with_args(["5"]);
    let result = executor.execute(&script, &options).await.unwrap();

    assert!(result.timed_out);
    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert!(result.duration < Duration::from_secs(4));
    assert_eq!(result.error.as_deref(), Some("Script timed out after 300ms"));
    assert!(
        result
            .resource_violations
            .iter()
            .any(|v| v.resource == ResourceKind::Time)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn required_denial_stops_before_anything_runs() {
    let fixture = WorkspaceFixture::new();
    let executor = ScriptExecutor::for_workspace(fixture.path(), EventBus::new());
    let script = shell(&fixture, "denied", "echo should-not-run > ran.txt").with_permission(
        Permission::new(PermissionKind::SystemExec, "sh -c", "run the shell"),
    );

    let err = executor.execute(&script, &quick_options()).await.unwrap_err();

    assert_eq!(err.code(), "permission_denied");
    assert!(err.to_string().contains("system:exec"));
    assert!(fixture.read_file("ran.txt").is_none());
    assert!(executor.rollback_manager().is_empty());
    let failed = executor.tracker().failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].steps[0].status, ExecutionStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn optional_denial_does_not_block() {
    let fixture = WorkspaceFixture::new();
    let executor = ScriptExecutor::for_workspace(fixture.path(), EventBus::new());
    let script = shell(&fixture, "tolerant", "true").with_permission(
        Permission::new(PermissionKind::NetworkHttps, "https://example.com", "telemetry").optional(),
    );

    let result = executor.execute(&script, &quick_options()).await.unwrap();
    assert!(result.success);
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_rollback_restores_workspace_after_failure() {
    let fixture = WorkspaceFixture::new();
    fixture.create_file("a.txt", "original");
    let executor = ScriptExecutor::for_workspace(fixture.path(), EventBus::new());
    let options = ExecutionOptions {
        auto_rollback_on_error: true,
        ..quick_options()
    };

    let script = shell(
        &fixture,
        "clobber",
        "echo changed > a.txt; echo new > b.txt; exit 1",
    );
    let result = executor.execute(&script, &options).await.unwrap();

    assert!(!result.success);
    assert!(result.rolled_back);
    assert_eq!(result.changes.len(), 2);
    assert_eq!(fixture.read_file("a.txt").as_deref(), Some("original"));
    assert!(fixture.read_file("b.txt").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_rollback_and_preview_use_the_stored_checkpoint() {
    let fixture = WorkspaceFixture::new();
    fixture.create_file("config.json", "{}");
    let executor = ScriptExecutor::for_workspace(fixture.path(), EventBus::new());

    let script = shell(&fixture, "editor", "echo '{\"x\":1}' > config.json");
    let result = executor.execute(&script, &quick_options()).await.unwrap();
    assert!(result.success);

    let preview = executor.preview_rollback(&result.execution_id).unwrap();
    assert_eq!(preview.len(), 1);
    assert_eq!(preview[0].operation, ChangeKind::Modify);

    let rollback = executor.rollback(&result.execution_id).unwrap();
    assert!(rollback.success);
    assert_eq!(fixture.read_file("config.json").as_deref(), Some("{}"));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_terminates_a_running_script() {
    let fixture = WorkspaceFixture::new();
    let executor = Arc::new(ScriptExecutor::for_workspace(fixture.path(), EventBus::new()));
    let script = Script::new("long", "sleep", fixture.path()).with_args(["5"]);
    let options = ExecutionOptions {
        create_checkpoint: false,
        ..quick_options()
    };

    let handle = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute(&script, &options).await })
    };

    let execution_id = loop {
        let running = executor
            .tracker()
            .active()
            .into_iter()
            .find(|s| s.status == ExecutionStatus::Running);
        if let Some(state) = running {
            break state.execution_id;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    // Give the sandbox time to spawn the child.
    tokio::time::sleep(Duration::from_millis(200)).await;
    executor.cancel(&execution_id).unwrap();

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(!result.success);
    assert!(result.duration < Duration::from_secs(4));
    assert_eq!(
        executor.cancel(&execution_id).unwrap_err().code(),
        "invalid_state"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn sandboxed_env_is_whitelisted_and_extended() {
    let fixture = WorkspaceFixture::new();
    let executor = ScriptExecutor::for_workspace(fixture.path(), EventBus::new());
    let body = "echo mode=$SKILL_MODE; echo pkg=${CARGO_PKG_NAME:-unset}";

    let mut isolated = quick_options();
    isolated.env.insert("SKILL_MODE".to_string(), "ci".to_string());
    let result = executor
        .execute(&shell(&fixture, "isolated", body), &isolated)
        .await
        .unwrap();
    assert!(result.stdout.contains("mode=ci"));
    assert!(result.stdout.contains("pkg=unset"));

    let inherited = ExecutionOptions {
        sandbox: false,
        ..quick_options()
    };
    let result = executor
        .execute(&shell(&fixture, "inherited", body), &inherited)
        .await
        .unwrap();
    assert!(result.stdout.contains("pkg=skillforge"));
    let state = executor.tracker().execution(&result.execution_id).unwrap();
    assert!(!state.steps.iter().any(|s| s.name == "Creating sandbox"));
}
