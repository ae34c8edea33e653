//! Permission checks against an allow/block policy.
//!
//! Block lists always win over allow lists. Filesystem checks also look at
//! the disk: a read target must exist and be readable, a write target's
//! parent directory must exist and be writable.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::security::path_policy::{absolutize, is_under_any, resolve_symlinks};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionKind {
    #[serde(rename = "filesystem:read")]
    FilesystemRead,
    #[serde(rename = "filesystem:write")]
    FilesystemWrite,
    #[serde(rename = "filesystem:delete")]
    FilesystemDelete,
    #[serde(rename = "network:http")]
    NetworkHttp,
    #[serde(rename = "network:https")]
    NetworkHttps,
    #[serde(rename = "system:exec")]
    SystemExec,
    #[serde(rename = "system:env")]
    SystemEnv,
}

impl PermissionKind {
    pub const ALL: [Self; 7] = [
        Self::FilesystemRead,
        Self::FilesystemWrite,
        Self::FilesystemDelete,
        Self::NetworkHttp,
        Self::NetworkHttps,
        Self::SystemExec,
        Self::SystemEnv,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FilesystemRead => "filesystem:read",
            Self::FilesystemWrite => "filesystem:write",
            Self::FilesystemDelete => "filesystem:delete",
            Self::NetworkHttp => "network:http",
            Self::NetworkHttps => "network:https",
            Self::SystemExec => "system:exec",
            Self::SystemEnv => "system:env",
        }
    }
}

impl std::fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PermissionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Unknown permission type: {s}"))
    }
}

const fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(rename = "type")]
    pub kind: PermissionKind,
    /// Path, URL or command line, depending on `kind`.
    pub scope: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

impl Permission {
    #[must_use]
    pub fn new(kind: PermissionKind, scope: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            scope: scope.into(),
            reason: reason.into(),
            required: true,
        }
    }

    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionCheckResult {
    pub granted: bool,
    pub permission: Permission,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

impl PermissionCheckResult {
    fn granted(permission: &Permission) -> Self {
        Self {
            granted: true,
            permission: permission.clone(),
            denial_reason: None,
            suggested_fix: None,
        }
    }

    fn denied(permission: &Permission, reason: impl Into<String>, fix: impl Into<String>) -> Self {
        Self {
            granted: false,
            permission: permission.clone(),
            denial_reason: Some(reason.into()),
            suggested_fix: Some(fix.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPolicy {
    /// Relative scopes and relative policy paths resolve against this.
    pub base_dir: PathBuf,
    pub allowed_read_paths: Vec<PathBuf>,
    pub allowed_write_paths: Vec<PathBuf>,
    pub blocked_paths: Vec<PathBuf>,
    pub allow_network: bool,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub blocked_domains: Vec<String>,
    pub allowed_commands: Vec<String>,
    pub blocked_commands: Vec<String>,
    pub allow_env_access: bool,
}

impl PermissionPolicy {
    /// Read/write inside the workspace only; network and env access off.
    #[must_use]
    pub fn for_workspace(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            allowed_read_paths: vec![root.clone()],
            allowed_write_paths: vec![root.clone()],
            blocked_paths: vec![
                root.join("node_modules"),
                root.join(".git"),
                root.join(".env"),
            ],
            allow_network: false,
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
            allowed_commands: ["npm", "node", "tsx", "tsc"].map(String::from).to_vec(),
            blocked_commands: ["rm", "del", "format", "shutdown"].map(String::from).to_vec(),
            allow_env_access: false,
            base_dir: root,
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        absolutize(path, &self.base_dir)
    }

    fn resolve_all(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        paths.iter().map(|p| self.resolve(p)).collect()
    }

    /// Roots with symlinks resolved, so they compare against resolved targets.
    fn resolve_all_real(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        paths.iter().map(|p| resolve_symlinks(&self.resolve(p))).collect()
    }
}

#[derive(Debug, Clone)]
pub struct PermissionChecker {
    policy: PermissionPolicy,
}

impl PermissionChecker {
    #[must_use]
    pub const fn new(policy: PermissionPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn for_workspace(root: impl AsRef<Path>) -> Self {
        Self::new(PermissionPolicy::for_workspace(root))
    }

    #[must_use]
    pub fn check(&self, permission: &Permission) -> PermissionCheckResult {
        let result = match permission.kind {
            PermissionKind::FilesystemRead => self.check_read(permission),
            PermissionKind::FilesystemWrite => self.check_write(permission, true),
            PermissionKind::FilesystemDelete => self.check_write(permission, false),
            PermissionKind::NetworkHttp | PermissionKind::NetworkHttps => {
                self.check_network(permission)
            }
            PermissionKind::SystemExec => self.check_exec(permission),
            PermissionKind::SystemEnv => self.check_env(permission),
        };
        debug!(
            kind = %permission.kind,
            scope = %permission.scope,
            granted = result.granted,
            "permission checked"
        );
        result
    }

    #[must_use]
    pub fn check_all(&self, permissions: &[Permission]) -> Vec<PermissionCheckResult> {
        permissions.iter().map(|p| self.check(p)).collect()
    }

    /// Non-required permissions never block.
    #[must_use]
    pub fn are_all_granted(&self, permissions: &[Permission]) -> bool {
        self.check_all(permissions)
            .iter()
            .all(|r| r.granted || !r.permission.required)
    }

    #[must_use]
    pub fn denied(&self, permissions: &[Permission]) -> Vec<PermissionCheckResult> {
        self.check_all(permissions)
            .into_iter()
            .filter(|r| !r.granted)
            .collect()
    }

    pub fn update_policy(&mut self, update: impl FnOnce(&mut PermissionPolicy)) {
        update(&mut self.policy);
    }

    #[must_use]
    pub const fn policy(&self) -> &PermissionPolicy {
        &self.policy
    }

    /// Containment is decided on the path with symlinks resolved. Delete
    /// resolves only the parent, since removing a link leaves its target alone.
    fn path_gate(
        &self,
        permission: &Permission,
        allowed: &[PathBuf],
        list_name: &str,
        follow_last: bool,
    ) -> Result<PathBuf, PermissionCheckResult> {
        let target = self.policy.resolve(Path::new(&permission.scope));
        let real = if follow_last {
            resolve_symlinks(&target)
        } else {
            match (target.parent(), target.file_name()) {
                (Some(parent), Some(name)) => resolve_symlinks(parent).join(name),
                _ => target.clone(),
            }
        };

        let blocked = &self.policy.blocked_paths;
        if is_under_any(&target, &self.policy.resolve_all(blocked))
            || is_under_any(&real, &self.policy.resolve_all_real(blocked))
        {
            return Err(PermissionCheckResult::denied(
                permission,
                "Path is in blocked list",
                "Remove path from blocked_paths in security policy",
            ));
        }
        if !is_under_any(&real, &self.policy.resolve_all_real(allowed)) {
            if is_under_any(&target, &self.policy.resolve_all(allowed)) {
                return Err(PermissionCheckResult::denied(
                    permission,
                    format!("Path resolves outside {list_name} through a symlink"),
                    format!("Add \"{}\" to {list_name} in security policy", real.display()),
                ));
            }
            return Err(PermissionCheckResult::denied(
                permission,
                format!("Path is not in {list_name}"),
                format!("Add \"{}\" to {list_name} in security policy", target.display()),
            ));
        }
        Ok(real)
    }

    fn check_read(&self, permission: &Permission) -> PermissionCheckResult {
        let target = match self.path_gate(
            permission,
            &self.policy.allowed_read_paths,
            "allowed_read_paths",
            true,
        ) {
            Ok(target) => target,
            Err(denied) => return denied,
        };
        if is_readable(&target) {
            PermissionCheckResult::granted(permission)
        } else {
            PermissionCheckResult::denied(
                permission,
                "Path does not exist or is not readable",
                "Ensure the path exists and has read permissions",
            )
        }
    }

    /// Delete shares the write rules but skips the parent-directory check.
    fn check_write(&self, permission: &Permission, check_parent: bool) -> PermissionCheckResult {
        let target = match self.path_gate(
            permission,
            &self.policy.allowed_write_paths,
            "allowed_write_paths",
            check_parent,
        ) {
            Ok(target) => target,
            Err(denied) => return denied,
        };
        if !check_parent {
            return PermissionCheckResult::granted(permission);
        }
        let writable = target.parent().is_some_and(is_writable_dir);
        if writable {
            PermissionCheckResult::granted(permission)
        } else {
            PermissionCheckResult::denied(
                permission,
                "Parent directory does not exist or is not writable",
                "Ensure the parent directory exists and has write permissions",
            )
        }
    }

    fn check_network(&self, permission: &Permission) -> PermissionCheckResult {
        if !self.policy.allow_network {
            return PermissionCheckResult::denied(
                permission,
                "Network access is disabled",
                "Enable allow_network in security policy",
            );
        }
        let Some(host) = url_host(&permission.scope) else {
            return PermissionCheckResult::denied(
                permission,
                format!("Cannot parse network scope \"{}\" as an http(s) URL", permission.scope),
                "Use a full URL such as https://example.com/path",
            );
        };
        if domain_listed(&host, &self.policy.blocked_domains) {
            return PermissionCheckResult::denied(
                permission,
                format!("Domain \"{host}\" is blocked"),
                format!("Remove \"{host}\" from blocked_domains in security policy"),
            );
        }
        if !self.policy.allowed_domains.is_empty()
            && !domain_listed(&host, &self.policy.allowed_domains)
        {
            return PermissionCheckResult::denied(
                permission,
                format!("Domain \"{host}\" is not in allowed domains"),
                format!("Add \"{host}\" to allowed_domains in security policy"),
            );
        }
        PermissionCheckResult::granted(permission)
    }

    fn check_exec(&self, permission: &Permission) -> PermissionCheckResult {
        let program = program_name(&permission.scope);
        if self.policy.blocked_commands.iter().any(|c| c == program) {
            return PermissionCheckResult::denied(
                permission,
                format!("Command \"{program}\" is blocked"),
                format!("Remove \"{program}\" from blocked_commands in security policy"),
            );
        }
        if !self.policy.allowed_commands.iter().any(|c| c == program) {
            return PermissionCheckResult::denied(
                permission,
                format!("Command \"{program}\" is not in allowed commands"),
                format!("Add \"{program}\" to allowed_commands in security policy"),
            );
        }
        PermissionCheckResult::granted(permission)
    }

    fn check_env(&self, permission: &Permission) -> PermissionCheckResult {
        if self.policy.allow_env_access {
            PermissionCheckResult::granted(permission)
        } else {
            PermissionCheckResult::denied(
                permission,
                "Environment variable access is disabled",
                "Enable allow_env_access in security policy",
            )
        }
    }
}

/// Host of an http(s) URL, lowercased. `None` for anything else.
#[must_use]
pub fn url_host(scope: &str) -> Option<String> {
    let url = Url::parse(scope.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str()
        .map(|host| host.trim_matches(['[', ']']).to_ascii_lowercase())
        .filter(|host| !host.is_empty())
}

/// Exact match, or a subdomain of a listed domain.
fn domain_listed(host: &str, domains: &[String]) -> bool {
    domains.iter().any(|domain| {
        let domain = domain.to_ascii_lowercase();
        host == domain || host.ends_with(&format!(".{domain}"))
    })
}

/// File name of the program in a command line (`/usr/bin/npm run x` -> `npm`).
#[must_use]
pub fn program_name(scope: &str) -> &str {
    let first = scope.split_whitespace().next().unwrap_or("");
    Path::new(first)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(first)
}

fn is_readable(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => fs::read_dir(path).is_ok(),
        Ok(_) => fs::File::open(path).is_ok(),
        Err(_) => false,
    }
}

fn is_writable_dir(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|meta| meta.is_dir() && !meta.permissions().readonly())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, PermissionChecker) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.ts"), "console.log(1)").unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        let checker = PermissionChecker::for_workspace(dir.path());
        (dir, checker)
    }

    #[test]
    fn kinds_use_colon_names() {
        let json = serde_json::to_string(&PermissionKind::FilesystemRead).unwrap();
        assert_eq!(json, "\"filesystem:read\"");
        assert_eq!(
            "system:exec".parse::<PermissionKind>().unwrap(),
            PermissionKind::SystemExec
        );
        assert!("system:root".parse::<PermissionKind>().is_err());

        let perm: Permission =
            serde_json::from_str(r#"{"type":"network:https","scope":"https://x.io"}"#).unwrap();
        assert!(perm.required);
    }

    #[test]
    fn read_inside_workspace_is_granted() {
        let (_dir, checker) = workspace();
        let result = checker.check(&Permission::new(PermissionKind::FilesystemRead, "src/main.ts", ""));
        assert!(result.granted, "{:?}", result.denial_reason);
    }

    #[test]
    fn read_of_missing_file_is_denied() {
        let (_dir, checker) = workspace();
        let result = checker.check(&Permission::new(PermissionKind::FilesystemRead, "src/nope.ts", ""));
        assert!(!result.granted);
        assert_eq!(
            result.denial_reason.as_deref(),
            Some("Path does not exist or is not readable")
        );
    }

    #[test]
    fn blocked_path_wins() {
        let (_dir, checker) = workspace();
        let result = checker.check(&Permission::new(
            PermissionKind::FilesystemRead,
            "node_modules/pkg",
            "",
        ));
        assert_eq!(result.denial_reason.as_deref(), Some("Path is in blocked list"));
    }

    #[test]
    fn outside_roots_is_denied_even_with_empty_block_list() {
        let (dir, mut checker) = workspace();
        checker.update_policy(|p| p.blocked_paths.clear());
        let outside = dir.path().parent().unwrap().join("elsewhere.txt");
        let result = checker.check(&Permission::new(
            PermissionKind::FilesystemRead,
            outside.to_string_lossy(),
            "",
        ));
        assert!(!result.granted);
        assert_eq!(
            result.denial_reason.as_deref(),
            Some("Path is not in allowed_read_paths")
        );
    }

    #[test]
    fn sibling_prefix_is_not_contained() {
        let (dir, checker) = workspace();
        let sibling = format!("{}-evil/file", dir.path().display());
        let result = checker.check(&Permission::new(PermissionKind::FilesystemWrite, sibling, ""));
        assert!(!result.granted);
    }

    #[test]
    fn write_needs_existing_parent() {
        let (_dir, checker) = workspace();
        let ok = checker.check(&Permission::new(PermissionKind::FilesystemWrite, "src/new.ts", ""));
        assert!(ok.granted);
        let missing = checker.check(&Permission::new(
            PermissionKind::FilesystemWrite,
            "gen/deep/new.ts",
            "",
        ));
        assert!(!missing.granted);
        let delete = checker.check(&Permission::new(
            PermissionKind::FilesystemDelete,
            "gen/deep/old.ts",
            "",
        ));
        assert!(delete.granted);
    }

    #[test]
    fn network_rules() {
        let (_dir, mut checker) = workspace();
        let perm = Permission::new(PermissionKind::NetworkHttps, "https://api.github.com/repos", "");
        assert_eq!(
            checker.check(&perm).denial_reason.as_deref(),
            Some("Network access is disabled")
        );

        checker.update_policy(|p| {
            p.allow_network = true;
            p.allowed_domains = vec!["github.com".to_string()];
            p.blocked_domains = vec!["evil.com".to_string()];
        });
        assert!(checker.check(&perm).granted);
        assert!(!checker
            .check(&Permission::new(PermissionKind::NetworkHttp, "http://evil.com", ""))
            .granted);
        assert!(!checker
            .check(&Permission::new(PermissionKind::NetworkHttp, "http://other.org", ""))
            .granted);
        assert!(!checker
            .check(&Permission::new(PermissionKind::NetworkHttp, "not a url", ""))
            .granted);
    }

    #[test]
    fn exec_matches_program_name() {
        let (_dir, checker) = workspace();
        let allowed = Permission::new(PermissionKind::SystemExec, "/usr/bin/npm run build", "");
        assert!(checker.check(&allowed).granted);
        let blocked = Permission::new(PermissionKind::SystemExec, "rm -rf /", "");
        assert_eq!(
            checker.check(&blocked).denial_reason.as_deref(),
            Some("Command \"rm\" is blocked")
        );
        let unknown = Permission::new(PermissionKind::SystemExec, "curl", "");
        assert!(!checker.check(&unknown).granted);
    }

    #[test]
    fn optional_denials_do_not_block() {
        let (_dir, checker) = workspace();
        let perms = vec![
            Permission::new(PermissionKind::SystemExec, "node", ""),
            Permission::new(PermissionKind::SystemEnv, "HOME", "").optional(),
        ];
        assert!(checker.are_all_granted(&perms));
        assert_eq!(checker.denied(&perms).len(), 1);

        let required = vec![Permission::new(PermissionKind::SystemEnv, "HOME", "")];
        assert!(!checker.are_all_granted(&required));
    }

    #[test]
    fn url_host_extraction() {
        assert_eq!(url_host("https://User@Example.COM:8443/x").as_deref(), Some("example.com"));
        assert_eq!(url_host("http://[::1]:80/").as_deref(), Some("::1"));
        assert_eq!(url_host("example.com"), None);
        assert_eq!(url_host("ftp://example.com/file"), None);
        assert_eq!(url_host("file:///etc/passwd"), None);
    }

    #[test]
    fn backslash_userinfo_does_not_hide_real_host() {
        let (_dir, mut checker) = workspace();
        checker.update_policy(|p| {
            p.allow_network = true;
            p.allowed_domains = vec!["good.com".to_string()];
        });
        let scope = r"https://evil.com\@good.com/";
        assert_eq!(url_host(scope).as_deref(), Some("evil.com"));
        let result = checker.check(&Permission::new(PermissionKind::NetworkHttps, scope, ""));
        assert!(!result.granted);
        assert!(checker
            .check(&Permission::new(PermissionKind::NetworkHttps, "https://api.good.com/v1", ""))
            .granted);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_cannot_escape_allowed_roots() {
        let (dir, checker) = workspace();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), "s").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("src"), dir.path().join("src-alias")).unwrap();

        let read = checker.check(&Permission::new(PermissionKind::FilesystemRead, "link/secret.txt", ""));
        assert!(!read.granted);
        assert_eq!(
            read.denial_reason.as_deref(),
            Some("Path resolves outside allowed_read_paths through a symlink")
        );
        let write = checker.check(&Permission::new(PermissionKind::FilesystemWrite, "link/new.txt", ""));
        assert!(!write.granted);

        let inside = checker.check(&Permission::new(
            PermissionKind::FilesystemRead,
            "src-alias/main.ts",
            "",
        ));
        assert!(inside.granted, "{:?}", inside.denial_reason);
        let unlink = checker.check(&Permission::new(PermissionKind::FilesystemDelete, "link", ""));
        assert!(unlink.granted, "{:?}", unlink.denial_reason);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_into_blocked_path_is_blocked() {
        let (dir, checker) = workspace();
        std::os::unix::fs::symlink(dir.path().join("node_modules"), dir.path().join("deps")).unwrap();
        let result = checker.check(&Permission::new(PermissionKind::FilesystemRead, "deps/pkg", ""));
        assert_eq!(result.denial_reason.as_deref(), Some("Path is in blocked list"));
    }
}
