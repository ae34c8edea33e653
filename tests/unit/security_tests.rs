use skillforge::sandbox::{Permission, PermissionChecker, PermissionKind};
use skillforge::security::{is_under_root, normalize_path};
use skillforge::test_utils::{TestCase, WorkspaceFixture, run_table_tests};

fn workspace() -> WorkspaceFixture {
    let fixture = WorkspaceFixture::new();
    fixture.create_file("README.md", "# demo");
    fixture.create_file("out/.keep", "");
    fixture.create_file(".env", "TOKEN=1");
    fixture
}

#[test]
fn workspace_policy_decisions() -> Result<(), String> {
    let fixture = workspace();
    let checker = PermissionChecker::for_workspace(fixture.path());

    let cases = vec![
        TestCase {
            name: "read existing file",
            input: (PermissionKind::FilesystemRead, "README.md"),
            expected: true,
        },
        TestCase {
            name: "read missing file",
            input: (PermissionKind::FilesystemRead, "missing.txt"),
            expected: false,
        },
        TestCase {
            name: "read blocked dotenv",
            input: (PermissionKind::FilesystemRead, ".env"),
            expected: false,
        },
        TestCase {
            name: "write into existing dir",
            input: (PermissionKind::FilesystemWrite, "out/report.json"),
            expected: true,
        },
        TestCase {
            name: "write without parent",
            input: (PermissionKind::FilesystemWrite, "nope/report.json"),
            expected: false,
        },
        TestCase {
            name: "write outside workspace",
            input: (PermissionKind::FilesystemWrite, "/etc/passwd"),
            expected: false,
        },
        TestCase {
            name: "escape through dot-dot",
            input: (PermissionKind::FilesystemRead, "../../etc/hosts"),
            expected: false,
        },
        TestCase {
            name: "allowed command",
            input: (PermissionKind::SystemExec, "npm install"),
            expected: true,
        },
        TestCase {
            name: "blocked command",
            input: (PermissionKind::SystemExec, "rm -rf out"),
            expected: false,
        },
        TestCase {
            name: "unlisted command",
            input: (PermissionKind::SystemExec, "curl https://example.com"),
            expected: false,
        },
        TestCase {
            name: "network disabled",
            input: (PermissionKind::NetworkHttps, "https://example.com"),
            expected: false,
        },
        TestCase {
            name: "env disabled",
            input: (PermissionKind::SystemEnv, "HOME"),
            expected: false,
        },
    ];

    run_table_tests(cases, |(kind, scope)| {
        checker.check(&Permission::new(kind, scope, "test")).granted
    })
}

#[test]
fn network_policy_honours_domain_lists() {
    let fixture = workspace();
    let mut checker = PermissionChecker::for_workspace(fixture.path());
    checker.update_policy(|policy| {
        policy.allow_network = true;
        policy.allowed_domains = vec!["example.com".to_string()];
        policy.blocked_domains = vec!["ads.example.com".to_string()];
    });

    let check = |url: &str| {
        checker
            .check(&Permission::new(PermissionKind::NetworkHttps, url, "fetch"))
            .granted
    };
    assert!(check("https://example.com/a"));
    assert!(check("https://api.example.com/v1"));
    assert!(!check("https://ads.example.com/pixel"));
    assert!(!check("https://example.org"));
    assert!(!check("not a url"));
}

#[test]
fn denial_carries_reason_and_fix() {
    let fixture = workspace();
    let checker = PermissionChecker::for_workspace(fixture.path());
    let result = checker.check(&Permission::new(PermissionKind::SystemExec, "make", "build"));
    assert!(!result.granted);
    assert_eq!(
        result.denial_reason.as_deref(),
        Some("Command \"make\" is not in allowed commands")
    );
    assert!(result.suggested_fix.unwrap().contains("allowed_commands"));

    let optional = Permission::new(PermissionKind::SystemEnv, "HOME", "nice to have").optional();
    assert!(checker.are_all_granted(&[optional]));
}

#[test]
fn path_helpers_normalise_lexically() {
    let root = std::path::Path::new("/work");
    assert_eq!(
        normalize_path(std::path::Path::new("/work/a/../b/./c")),
        std::path::PathBuf::from("/work/b/c")
    );
    assert!(is_under_root(std::path::Path::new("/work/b"), root));
    assert!(!is_under_root(std::path::Path::new("/workshop"), root));
}
