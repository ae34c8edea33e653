use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use skillforge::config::Config;
use skillforge::test_utils::{TestCase, WorkspaceFixture, run_table_tests};

const CUSTOM: &str = r#"
[activation]
max_active_skills = 3
auto_activate_single_match = true

[security]
allowed_commands = ["sh"]
blocked_commands = ["curl"]
allowed_read_paths = ["src"]

[execution]
timeout = "2s"
max_memory_mb = 128
enforce_limits = true

[checkpoint]
exclude = ["target"]
max_file_size_mb = 1
"#;

fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    move |key: &str| map.get(key).cloned()
}

#[test]
fn empty_document_yields_defaults() {
    let config = Config::from_toml_str("").unwrap();
    assert_eq!(config.activation.max_active_skills, 10);
    assert_eq!(config.execution.timeout, Duration::from_secs(30));
    assert_eq!(config.security.allowed_commands, vec!["npm", "node", "tsx", "tsc"]);
    assert!(config.execution.sandbox);
    assert!(config.validate().is_ok());
}

#[test]
fn sections_patch_the_defaults() {
    let config = Config::from_toml_str(CUSTOM).unwrap();
    assert_eq!(config.activation.max_active_skills, 3);
    assert!(config.activation.auto_activate_single_match);
    assert_eq!(config.security.allowed_commands, vec!["sh"]);
    assert_eq!(config.security.blocked_commands[0], "curl");
    assert!(config.security.blocked_commands.contains(&"rm".to_string()));

    let options = config.execution_options();
    assert_eq!(options.timeout, Some(Duration::from_secs(2)));
    assert_eq!(options.max_memory_mb, 128);
    assert!(options.enforce_limits);
    assert_eq!(options.checkpoint.max_file_size, 1024 * 1024);
    assert!(options.checkpoint.exclude.contains(&"target".to_string()));
}

#[test]
fn policy_paths_resolve_against_the_workspace_root() {
    let mut config = Config::from_toml_str(CUSTOM).unwrap();
    config.security.workspace_root = Some(PathBuf::from("/work"));

    let policy = config.permission_policy();
    assert_eq!(policy.allowed_read_paths, vec![PathBuf::from("/work/src")]);
    assert_eq!(policy.allowed_write_paths, vec![PathBuf::from("/work")]);
    assert!(policy.blocked_paths.contains(&PathBuf::from("/work/.git")));
    assert_eq!(policy.allowed_commands, vec!["sh"]);
}

#[test]
fn env_overrides_apply_over_files() {
    let mut config = Config::from_toml_str(CUSTOM).unwrap();
    config
        .apply_overrides(lookup(&[
            ("SKILLFORGE_MAX_ACTIVE_SKILLS", "4"),
            ("SKILLFORGE_ALLOWED_COMMANDS", "bash, python3"),
            ("SKILLFORGE_SANDBOX", "false"),
            ("SKILLFORGE_TIMEOUT_MS", "1500"),
            ("SKILLFORGE_ALLOW_NETWORK", "yes"),
        ]))
        .unwrap();

    assert_eq!(config.activation.max_active_skills, 4);
    assert_eq!(config.security.allowed_commands, vec!["bash", "python3", "sh"]);
    assert!(!config.execution.sandbox);
    assert_eq!(config.execution.timeout, Duration::from_millis(1500));
    assert!(config.security.allow_network);
}

#[test]
fn flag_values_parse_from_table() -> Result<(), String> {
    let cases = vec![
        TestCase { name: "one", input: "1", expected: true },
        TestCase { name: "true", input: "TRUE", expected: true },
        TestCase { name: "on", input: "on", expected: true },
        TestCase { name: "zero", input: "0", expected: false },
        TestCase { name: "junk", input: "maybe", expected: false },
    ];
    run_table_tests(cases, |value| {
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[("SKILLFORGE_AUTO_ROLLBACK", value)]))
            .unwrap();
        config.execution.auto_rollback_on_error
    })
}

#[test]
fn malformed_numeric_override_is_a_config_error() {
    let mut config = Config::default();
    let err = config
        .apply_overrides(lookup(&[("SKILLFORGE_TIMEOUT_MS", "soon")]))
        .unwrap_err();
    assert_eq!(err.code(), "config_error");
    assert!(err.to_string().contains("SKILLFORGE_TIMEOUT_MS"));
}

#[test]
fn invalid_values_are_rejected() {
    let zero_active = Config::from_toml_str("[activation]\nmax_active_skills = 0\n").unwrap();
    assert!(zero_active.validate().is_err());

    let zero_memory = Config::from_toml_str("[execution]\nmax_memory_mb = 0\n").unwrap();
    assert!(zero_memory.validate().is_err());

    let bad_duration = Config::from_toml_str("[execution]\ntimeout = 5\n").unwrap_err();
    assert_eq!(bad_duration.code(), "config_error");
}

#[test]
fn explicit_file_must_exist() {
    let fixture = WorkspaceFixture::new();
    let err = Config::load(Some(&fixture.path().join("nope.toml")), fixture.path()).unwrap_err();
    assert_eq!(err.code(), "missing_config");
}

#[test]
fn explicit_file_loads_and_defaults_the_workspace_root() {
    let fixture = WorkspaceFixture::new();
    let path = fixture.create_file("custom.toml", CUSTOM);
    let config = Config::load(Some(&path), fixture.path()).unwrap();
    assert_eq!(config.activation.max_active_skills, 3);
    assert_eq!(config.workspace_root(), fixture.path());
}
