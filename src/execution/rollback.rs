//! Directory checkpoints, change detection and rollback.
//!
//! A checkpoint holds the UTF-8 content of every file under a working
//! directory that passes its include/exclude filters. Binary, unreadable and
//! oversized files are skipped with a warning. The same filters apply when
//! the directory is rescanned, so a file that was never snapshotted is never
//! reported or deleted.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use glob::Pattern;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Result, SkillError};

pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointOptions {
    pub description: Option<String>,
    pub skill_name: Option<String>,
    pub script_name: Option<String>,
    /// Glob patterns; empty means everything.
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub max_file_size: u64,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            description: None,
            skill_name: None,
            script_name: None,
            include: Vec::new(),
            exclude: Vec::new(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub working_dir: PathBuf,
    /// Relative path -> content.
    pub files: BTreeMap<PathBuf, String>,
    pub options: CheckpointOptions,
}

impl Checkpoint {
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: PathBuf,
    pub operation: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackFailure {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub success: bool,
    pub checkpoint_id: String,
    pub restored_files: Vec<PathBuf>,
    pub deleted_files: Vec<PathBuf>,
    pub errors: Vec<RollbackFailure>,
}

/// Compiled include/exclude filters.
struct FileFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl FileFilter {
    fn new(options: &CheckpointOptions) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Pattern>> {
            patterns
                .iter()
                .map(|p| {
                    Pattern::new(p)
                        .map_err(|e| SkillError::Checkpoint(format!("invalid pattern {p:?}: {e}")))
                })
                .collect()
        };
        Ok(Self {
            include: compile(&options.include)?,
            exclude: compile(&options.exclude)?,
        })
    }

    fn excluded(&self, relative: &Path) -> bool {
        self.exclude.iter().any(|p| pattern_matches(p, relative))
    }

    fn included(&self, relative: &Path) -> bool {
        self.include.is_empty() || self.include.iter().any(|p| pattern_matches(p, relative))
    }

    fn accepts(&self, relative: &Path) -> bool {
        !self.excluded(relative) && self.included(relative)
    }
}

/// Whole relative path, or any single segment for bare patterns.
fn pattern_matches(pattern: &Pattern, relative: &Path) -> bool {
    if pattern.matches_path(relative) {
        return true;
    }
    if pattern.as_str().contains('/') {
        return false;
    }
    relative.components().any(|c| match c {
        Component::Normal(segment) => segment.to_str().is_some_and(|s| pattern.matches(s)),
        _ => false,
    })
}

#[must_use]
pub fn hash_content(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[derive(Debug, Default)]
pub struct RollbackManager {
    checkpoints: Mutex<HashMap<String, Arc<Checkpoint>>>,
    counter: AtomicU64,
}

impl RollbackManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_checkpoint(
        &self,
        working_dir: impl AsRef<Path>,
        options: CheckpointOptions,
    ) -> Result<Arc<Checkpoint>> {
        let working_dir = working_dir.as_ref().to_path_buf();
        if !working_dir.is_dir() {
            return Err(SkillError::Checkpoint(format!(
                "working directory {} does not exist",
                working_dir.display()
            )));
        }
        let filter = FileFilter::new(&options)?;
        let files = scan(&working_dir, &filter, options.max_file_size, true);

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let checkpoint = Arc::new(Checkpoint {
            id: format!("checkpoint-{n}-{}", Utc::now().timestamp_millis()),
            timestamp: Utc::now(),
            working_dir,
            files,
            options,
        });
        info!(
            checkpoint = %checkpoint.id,
            files = checkpoint.files.len(),
            dir = %checkpoint.working_dir.display(),
            "checkpoint created"
        );
        self.checkpoints
            .lock()
            .insert(checkpoint.id.clone(), Arc::clone(&checkpoint));
        Ok(checkpoint)
    }

    /// Diff `dir` against `checkpoint` using the checkpoint's own filters.
    pub fn detect_changes(&self, checkpoint: &Checkpoint, dir: impl AsRef<Path>) -> Result<Vec<FileChange>> {
        let filter = FileFilter::new(&checkpoint.options)?;
        let current = scan(dir.as_ref(), &filter, checkpoint.options.max_file_size, false);
        let mut changes = Vec::new();

        for (path, before) in &checkpoint.files {
            match current.get(path) {
                None => changes.push(FileChange {
                    path: path.clone(),
                    operation: ChangeKind::Delete,
                    before: Some(before.clone()),
                    after: None,
                    before_hash: Some(hash_content(before)),
                    after_hash: None,
                }),
                Some(after) => {
                    let before_hash = hash_content(before);
                    let after_hash = hash_content(after);
                    if before_hash != after_hash {
                        changes.push(FileChange {
                            path: path.clone(),
                            operation: ChangeKind::Modify,
                            before: Some(before.clone()),
                            after: Some(after.clone()),
                            before_hash: Some(before_hash),
                            after_hash: Some(after_hash),
                        });
                    }
                }
            }
        }

        for (path, after) in &current {
            if !checkpoint.files.contains_key(path) {
                changes.push(FileChange {
                    path: path.clone(),
                    operation: ChangeKind::Create,
                    before: None,
                    after: Some(after.clone()),
                    before_hash: None,
                    after_hash: Some(hash_content(after)),
                });
            }
        }

        debug!(checkpoint = %checkpoint.id, changes = changes.len(), "changes detected");
        Ok(changes)
    }

    /// Restore every snapshotted file and delete files created since.
    /// Per-file failures are collected; `success` is true only without any.
    pub fn rollback(&self, checkpoint_id: &str) -> Result<RollbackResult> {
        let checkpoint = self.require(checkpoint_id)?;
        let root = &checkpoint.working_dir;
        let mut restored_files = Vec::new();
        let mut deleted_files = Vec::new();
        let mut errors = Vec::new();

        for (relative, content) in &checkpoint.files {
            let target = root.join(relative);
            let restored = target
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|()| fs::write(&target, content));
            match restored {
                Ok(()) => restored_files.push(relative.clone()),
                Err(e) => errors.push(RollbackFailure {
                    path: relative.clone(),
                    message: format!("Failed to restore file: {e}"),
                }),
            }
        }

        let filter = FileFilter::new(&checkpoint.options)?;
        let current = scan(root, &filter, u64::MAX, false);
        for relative in current.keys() {
            if checkpoint.files.contains_key(relative) {
                continue;
            }
            match fs::remove_file(root.join(relative)) {
                Ok(()) => deleted_files.push(relative.clone()),
                Err(e) => errors.push(RollbackFailure {
                    path: relative.clone(),
                    message: format!("Failed to delete file: {e}"),
                }),
            }
        }

        let result = RollbackResult {
            success: errors.is_empty(),
            checkpoint_id: checkpoint.id.clone(),
            restored_files,
            deleted_files,
            errors,
        };
        if result.success {
            info!(
                checkpoint = %checkpoint.id,
                restored = result.restored_files.len(),
                deleted = result.deleted_files.len(),
                "rollback complete"
            );
        } else {
            warn!(checkpoint = %checkpoint.id, errors = result.errors.len(), "rollback finished with errors");
        }
        Ok(result)
    }

    /// What [`rollback`](Self::rollback) would undo.
    pub fn preview_rollback(&self, checkpoint_id: &str) -> Result<Vec<FileChange>> {
        let checkpoint = self.require(checkpoint_id)?;
        self.detect_changes(&checkpoint, &checkpoint.working_dir)
    }

    fn require(&self, checkpoint_id: &str) -> Result<Arc<Checkpoint>> {
        self.checkpoint(checkpoint_id)
            .ok_or_else(|| SkillError::NotFound(format!("Checkpoint {checkpoint_id} not found")))
    }

    #[must_use]
    pub fn checkpoint(&self, checkpoint_id: &str) -> Option<Arc<Checkpoint>> {
        self.checkpoints.lock().get(checkpoint_id).cloned()
    }

    /// All checkpoints, oldest first.
    #[must_use]
    pub fn checkpoints(&self) -> Vec<Arc<Checkpoint>> {
        let mut all: Vec<_> = self.checkpoints.lock().values().cloned().collect();
        all.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn delete_checkpoint(&self, checkpoint_id: &str) -> bool {
        self.checkpoints.lock().remove(checkpoint_id).is_some()
    }

    pub fn clear(&self) {
        self.checkpoints.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.checkpoints.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read every accepted UTF-8 file under `root`, keyed by relative path.
fn scan(root: &Path, filter: &FileFilter, max_file_size: u64, log_skips: bool) -> BTreeMap<PathBuf, String> {
    let mut files = BTreeMap::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || entry
                    .path()
                    .strip_prefix(root)
                    .map_or(true, |rel| !filter.excluded(rel))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if log_skips {
                    warn!(error = %e, "skipping unreadable entry");
                }
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if !filter.accepts(relative) {
            continue;
        }

        let size = entry.metadata().map_or(0, |m| m.len());
        if size > max_file_size {
            if log_skips {
                warn!(path = %entry.path().display(), size, "skipping large file");
            }
            continue;
        }
        match fs::read(entry.path()).map(String::from_utf8) {
            Ok(Ok(content)) => {
                files.insert(relative.to_path_buf(), content);
            }
            Ok(Err(_)) => {
                if log_skips {
                    warn!(path = %entry.path().display(), "skipping non-UTF-8 file");
                }
            }
            Err(e) => {
                if log_skips {
                    warn!(path = %entry.path().display(), error = %e, "skipping unreadable file");
                }
            }
        }
    }
    files
}
