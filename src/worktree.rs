/// Git worktree management for worker isolation.
///
/// Each worker gets its own worktree and branch so its commits never
/// touch the parent checkout. All git operations are subprocesses; any
/// failure propagates as `WorktreeError` and the orchestrator refuses to
/// spawn a child whose worktree could not be created.
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::WorktreeError;

pub struct WorktreeManager {
    repo_root: PathBuf,
    worktree_dir: PathBuf,
}

fn branch_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9._/-]+$").unwrap())
}

pub fn valid_branch_name(name: &str) -> bool {
    !name.is_empty() && branch_re().is_match(name)
}

impl WorktreeManager {
    pub fn new(repo_root: PathBuf, worktree_dir: PathBuf) -> Self {
        Self { repo_root, worktree_dir }
    }

    /// Locate the repository containing `path`. None when not in a git
    /// repo or git is not installed.
    pub fn discover(path: &Path) -> Option<PathBuf> {
        let output = std::process::Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(path)
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let root = String::from_utf8(output.stdout).ok()?;
        Some(PathBuf::from(root.trim()))
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Create a worktree on a new branch off `base_branch`.
    pub fn create(&self, branch: &str, base_branch: &str) -> Result<PathBuf, WorktreeError> {
        if !valid_branch_name(branch) || !valid_branch_name(base_branch) {
            return Err(WorktreeError {
                op: "worktree add",
                detail: format!("invalid branch name '{branch}'"),
            });
        }
        std::fs::create_dir_all(&self.worktree_dir).map_err(|e| WorktreeError {
            op: "worktree add",
            detail: format!("cannot create {}: {e}", self.worktree_dir.display()),
        })?;

        let slug = branch.replace('/', "-");
        let path = self
            .worktree_dir
            .join(format!("codi-{slug}-{}", std::process::id()));
        let path_str = path.to_string_lossy().to_string();

        self.run_git("worktree add", &["worktree", "add", "-b", branch, &path_str, base_branch])?;
        Ok(path)
    }

    /// Detach and delete a worktree.
    pub fn remove(&self, path: &Path) -> Result<(), WorktreeError> {
        let path_str = path.to_string_lossy().to_string();
        self.run_git("worktree remove", &["worktree", "remove", "--force", &path_str])?;
        Ok(())
    }

    /// Worktree paths known to git, the main checkout excluded.
    pub fn list(&self) -> Result<Vec<PathBuf>, WorktreeError> {
        let out = self.run_git("worktree list", &["worktree", "list", "--porcelain"])?;
        let paths: Vec<PathBuf> = out
            .lines()
            .filter_map(|l| l.strip_prefix("worktree "))
            .map(PathBuf::from)
            .filter(|p| p != &self.repo_root)
            .collect();
        Ok(paths)
    }

    /// Prune dangling worktree records and delete leftover directories
    /// under our worktree dir that git no longer tracks.
    pub fn cleanup(&self) -> Result<usize, WorktreeError> {
        self.run_git("worktree prune", &["worktree", "prune"])?;
        let known = self.list()?;
        let mut removed = 0usize;

        let Ok(entries) = std::fs::read_dir(&self.worktree_dir) else { return Ok(0) };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with("codi-") {
                continue;
            }
            if !known.contains(&path) && std::fs::remove_dir_all(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Run a git command in the repo root. Returns stdout on success,
    /// Err(stderr) on failure.
    fn run_git(&self, op: &'static str, args: &[&str]) -> Result<String, WorktreeError> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| WorktreeError { op, detail: format!("failed to run git: {e}") })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(WorktreeError { op, detail: stderr.trim().to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git(dir: &Path, args: &[&str]) -> bool {
        std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Initialise a repo with one commit; None when git is unavailable.
    fn init_repo() -> Option<(tempfile::TempDir, WorktreeManager)> {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir(&repo).unwrap();
        if !git(&repo, &["init", "-b", "main"]) {
            return None;
        }
        git(&repo, &["config", "user.email", "test@example.com"]);
        git(&repo, &["config", "user.name", "Test"]);
        std::fs::write(repo.join("README.md"), "# test\n").unwrap();
        git(&repo, &["add", "-A"]);
        if !git(&repo, &["commit", "-m", "init"]) {
            return None;
        }
        let manager = WorktreeManager::new(repo, dir.path().join("worktrees"));
        Some((dir, manager))
    }

    #[test]
    fn test_branch_name_validation() {
        assert!(valid_branch_name("feature/add-tests"));
        assert!(valid_branch_name("fix-1.2.3"));
        assert!(!valid_branch_name(""));
        assert!(!valid_branch_name("has space"));
        assert!(!valid_branch_name("bad~name"));
        assert!(!valid_branch_name("semi;colon"));
    }

    #[test]
    fn test_create_list_remove() {
        let Some((_dir, manager)) = init_repo() else { return };

        let path = manager.create("feature/one", "main").unwrap();
        assert!(path.exists());
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("codi-feature-one"));

        let listed = manager.list().unwrap();
        assert!(listed.contains(&path));

        manager.remove(&path).unwrap();
        assert!(!path.exists());
        assert!(!manager.list().unwrap().contains(&path));
    }

    #[test]
    fn test_create_duplicate_branch_fails() {
        let Some((_dir, manager)) = init_repo() else { return };
        let path = manager.create("dup", "main").unwrap();
        let err = manager.create("dup", "main").unwrap_err();
        assert_eq!(err.op, "worktree add");
        manager.remove(&path).unwrap();
    }

    #[test]
    fn test_invalid_branch_rejected_without_git_call() {
        let manager = WorktreeManager::new(PathBuf::from("/nonexistent"), PathBuf::from("/tmp/x"));
        let err = manager.create("bad name", "main").unwrap_err();
        assert!(err.detail.contains("invalid branch name"));
    }

    #[test]
    fn test_cleanup_removes_untracked_dirs() {
        let Some((_dir, manager)) = init_repo() else { return };
        std::fs::create_dir_all(manager.worktree_dir.join("codi-stale-junk")).unwrap();
        std::fs::create_dir_all(manager.worktree_dir.join("unrelated")).unwrap();

        let removed = manager.cleanup().unwrap();
        assert_eq!(removed, 1);
        assert!(!manager.worktree_dir.join("codi-stale-junk").exists());
        assert!(manager.worktree_dir.join("unrelated").exists());
    }
}
