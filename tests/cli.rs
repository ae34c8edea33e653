use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;

use skillforge::core::Skill;
use skillforge::test_utils::{WorkspaceFixture, diamond_skills, skill};

/// Binary rooted in `fixture`, isolated from user config and env overrides.
fn skillforge(fixture: &WorkspaceFixture) -> Command {
    let mut cmd = Command::cargo_bin("skillforge").unwrap();
    cmd.current_dir(fixture.path())
        .env("XDG_CONFIG_HOME", fixture.path().join(".config"))
        .env_remove("SKILLFORGE_CONFIG")
        .env_remove("SKILLFORGE_REGISTRY")
        .env_remove("SKILLFORGE_ROBOT")
        .env_remove("RUST_LOG");
    cmd
}

fn workspace_with(skills: Vec<Skill>) -> WorkspaceFixture {
    let fixture = WorkspaceFixture::new();
    fixture.write_registry(skills);
    fixture
}

fn robot_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("robot output is JSON")
}

#[test]
fn help_and_version() {
    let fixture = WorkspaceFixture::new();
    skillforge(&fixture)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"));
    skillforge(&fixture)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn graph_reports_stats_and_order() {
    let fixture = workspace_with(diamond_skills());
    let output = skillforge(&fixture)
        .args(["--robot", "graph", "--order", "app", "left", "base", "right"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json = robot_json(&output);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["data"]["stats"]["total_skills"], 4);
    assert_eq!(json["data"]["cycles"].as_array().unwrap().len(), 0);
    assert_eq!(json["data"]["order"][0], "base");
    assert_eq!(json["data"]["order"][3], "app");
}

#[test]
fn graph_human_output_lists_cycles() {
    let fixture = workspace_with(vec![skill("a", &["b"]), skill("b", &["a"])]);
    skillforge(&fixture)
        .arg("graph")
        .assert()
        .success()
        .stdout(predicate::str::contains("Cycles (1)"));
}

#[test]
fn resolve_unknown_skill_fails() {
    let fixture = workspace_with(diamond_skills());
    let output = skillforge(&fixture)
        .args(["--robot", "resolve", "ghost"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let json = robot_json(&output);
    assert_eq!(json["status"]["error"]["code"], "resolution_failed");
    assert_eq!(json["data"]["success"], false);
}

#[test]
fn chain_prints_numbered_steps() {
    let fixture = workspace_with(diamond_skills());
    skillforge(&fixture)
        .args(["chain", "app", "--task", "ship it"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1. base"))
        .stdout(predicate::str::contains("ship it"));
}

#[test]
fn activate_by_trigger_pulls_in_dependencies() {
    let fixture = workspace_with(vec![
        skill("deploy", &["build"]).with_triggers(["deploy"]),
        skill("build", &[]),
    ]);
    let output = skillforge(&fixture)
        .args(["--robot", "activate", "--match", "please deploy now", "--auto"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = robot_json(&output);
    assert_eq!(json["data"]["result"]["activated"][0], "build");
    assert_eq!(json["data"]["result"]["activated"][1], "deploy");
    assert_eq!(json["data"]["active"].as_array().unwrap().len(), 2);
}

#[test]
fn check_denies_blocked_commands() {
    let fixture = WorkspaceFixture::new();
    let output = skillforge(&fixture)
        .args(["--robot", "check", "system:exec", "rm -rf /"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let json = robot_json(&output);
    assert_eq!(json["status"]["error"]["code"], "permission_denied");

    skillforge(&fixture)
        .args(["check", "bogus:kind", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown permission type"));
}

#[test]
fn run_executes_allowed_command_and_reports_changes() {
    let fixture = WorkspaceFixture::new();
    fixture.write_config("[security]\nallowed_commands = [\"sh\"]\n");
    let output = skillforge(&fixture)
        .args(["--robot", "run", "sh", "-c", "echo made > made.txt; echo done"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let json = robot_json(&output);
    assert!(json["data"]["stdout"].as_str().unwrap().contains("done"));
    assert_eq!(json["data"]["changes"][0]["path"], "made.txt");
    assert_eq!(json["data"]["changes"][0]["operation"], "create");
    assert_eq!(fixture.read_file("made.txt").as_deref(), Some("made\n"));
}

#[test]
fn run_propagates_exit_codes() {
    let fixture = WorkspaceFixture::new();
    skillforge(&fixture)
        .env("SKILLFORGE_ALLOWED_COMMANDS", "sh")
        .args(["run", "--no-checkpoint", "sh", "-c", "exit 7"])
        .assert()
        .code(7);
}

#[test]
fn run_timeout_exits_124() {
    let fixture = WorkspaceFixture::new();
    skillforge(&fixture)
        .env("SKILLFORGE_ALLOWED_COMMANDS", "sleep")
        .args(["run", "--timeout-ms", "200", "sleep", "5"])
        .assert()
        .code(124)
        .stdout(predicate::str::contains("timed out"));
}

#[test]
fn run_rejects_unlisted_commands() {
    let fixture = WorkspaceFixture::new();
    let output = skillforge(&fixture)
        .args(["--robot", "run", "sh", "-c", "touch x"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let json: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["code"], "permission_denied");
    assert!(fixture.read_file("x").is_none());
}

#[test]
fn config_shows_effective_values() {
    let fixture = WorkspaceFixture::new();
    fixture.write_config("[execution]\ntimeout = \"45s\"\n");
    let output = skillforge(&fixture)
        .args(["--robot", "config"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = robot_json(&output);
    assert_eq!(json["data"]["execution"]["timeout"], "45s");
    assert_eq!(json["data"]["activation"]["max_active_skills"], 10);
}
