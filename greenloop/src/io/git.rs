//! Git adapter for the patch applicator.
//!
//! Every mutation of the target tree goes through git so that any apply can be
//! rolled back to a commit checkpoint. We keep a small, explicit wrapper around
//! `git` subprocess calls.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

const DEFAULT_USER_NAME: &str = "greenloop";
const DEFAULT_USER_EMAIL: &str = "greenloop@localhost";

/// Result of a `git apply` that is allowed to fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchCheck {
    Clean,
    Conflicts(String),
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// True when `workdir` is inside any git work tree.
    pub fn is_inside_work_tree(&self) -> Result<bool> {
        let out = self.run(&["rev-parse", "--is-inside-work-tree"])?;
        Ok(out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true")
    }

    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        let path = PathBuf::from(out.trim());
        fs::canonicalize(&path).with_context(|| format!("resolve {}", path.display()))
    }

    #[instrument(skip_all)]
    pub fn init(&self) -> Result<()> {
        debug!(dir = %self.workdir.display(), "initializing repository");
        self.run_checked(&["init", "-q"])?;
        Ok(())
    }

    /// Full HEAD SHA, or `None` on an unborn branch.
    pub fn head_sha(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--verify", "-q", "HEAD"])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Set a repo-local committer identity when none is configured.
    pub fn ensure_identity(&self) -> Result<()> {
        for (key, default) in [
            ("user.name", DEFAULT_USER_NAME),
            ("user.email", DEFAULT_USER_EMAIL),
        ] {
            let out = self.run(&["config", "--get", key])?;
            if out.status.success() && !out.stdout.trim_ascii().is_empty() {
                continue;
            }
            debug!(key, "setting local git identity");
            self.run_checked(&["config", key, default])?;
        }
        Ok(())
    }

    /// True when there are no staged, unstaged or untracked changes.
    pub fn is_clean(&self) -> Result<bool> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        Ok(out.trim().is_empty())
    }

    /// Append `pattern` to `.git/info/exclude` unless it is already listed.
    pub fn exclude_path(&self, pattern: &str) -> Result<()> {
        let rel = self.run_capture(&["rev-parse", "--git-path", "info/exclude"])?;
        let path = self.workdir.join(rel.trim());
        let existing = fs::read_to_string(&path).unwrap_or_default();
        if existing.lines().any(|line| line.trim() == pattern) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "{pattern}").with_context(|| format!("write {}", path.display()))?;
        debug!(pattern, "excluded path from snapshots");
        Ok(())
    }

    /// Run `git apply` (or `git apply --check`) for a patch file.
    #[instrument(skip_all, fields(check_only))]
    pub fn apply_patch(&self, patch: &Path, check_only: bool) -> Result<PatchCheck> {
        let patch = patch.to_string_lossy();
        let mut args = vec!["apply", "--ignore-whitespace", "--whitespace=nowarn"];
        if check_only {
            args.push("--check");
        }
        args.push(patch.as_ref());
        let out = self.run(&args)?;
        if out.status.success() {
            return Ok(PatchCheck::Clean);
        }
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        debug!(%stderr, "git apply refused patch");
        Ok(PatchCheck::Conflicts(stderr))
    }

    /// Stage all changes (respects .gitignore and info/exclude).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message and return the new HEAD.
    ///
    /// If there are no staged changes, this returns Ok(None) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<Option<String>> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(None);
        }
        self.run_checked(&["commit", "-q", "--no-verify", "--no-gpg-sign", "-m", message])?;
        self.head_sha()
    }

    /// Stage everything and commit it.
    pub fn commit_all(&self, message: &str) -> Result<Option<String>> {
        self.add_all()?;
        self.commit_staged(message)
    }

    /// Commit with no changes, used to root an empty repository.
    pub fn commit_empty(&self, message: &str) -> Result<String> {
        self.run_checked(&[
            "commit",
            "-q",
            "--no-verify",
            "--no-gpg-sign",
            "--allow-empty",
            "-m",
            message,
        ])?;
        self.head_sha()?
            .ok_or_else(|| anyhow!("HEAD missing after empty commit"))
    }

    #[instrument(skip_all, fields(rev))]
    pub fn reset_hard(&self, rev: &str) -> Result<()> {
        self.run_checked(&["reset", "-q", "--hard", rev])?;
        Ok(())
    }

    /// Remove untracked files and directories (ignored files are kept).
    pub fn clean_untracked(&self) -> Result<()> {
        self.run_checked(&["clean", "-q", "-fd"])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> (tempfile::TempDir, Git) {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        git.init().expect("init");
        git.ensure_identity().expect("identity");
        (temp, git)
    }

    #[test]
    fn untracked_file_makes_tree_dirty() {
        let (temp, git) = repo();
        assert!(git.is_clean().expect("clean"));
        fs::write(temp.path().join("new.txt"), "x\n").expect("write");
        assert!(!git.is_clean().expect("dirty"));
    }

    #[test]
    fn commit_returns_head_and_skips_when_nothing_staged() {
        let (temp, git) = repo();
        assert_eq!(git.head_sha().expect("head"), None);
        fs::write(temp.path().join("a.txt"), "a\n").expect("write");
        let sha = git.commit_all("first").expect("commit").expect("sha");
        assert_eq!(git.head_sha().expect("head"), Some(sha));
        assert_eq!(git.commit_all("again").expect("commit"), None);
        assert!(git.is_clean().expect("clean"));
    }

    #[test]
    fn reset_and_clean_restore_checkpoint() {
        let (temp, git) = repo();
        fs::write(temp.path().join("a.txt"), "a\n").expect("write");
        let base = git.commit_all("base").expect("commit").expect("sha");
        fs::write(temp.path().join("a.txt"), "changed\n").expect("write");
        fs::write(temp.path().join("new.txt"), "new\n").expect("write");
        git.reset_hard(&base).expect("reset");
        git.clean_untracked().expect("clean");
        assert_eq!(fs::read_to_string(temp.path().join("a.txt")).expect("read"), "a\n");
        assert!(!temp.path().join("new.txt").exists());
    }

    #[test]
    fn apply_check_reports_conflicts_without_touching_tree() {
        let (temp, git) = repo();
        fs::write(temp.path().join("a.txt"), "one\n").expect("write");
        git.commit_all("base").expect("commit");
        let patch = temp.path().join("bad.patch");
        fs::write(
            &patch,
            "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-something else\n+two\n",
        )
        .expect("patch");
        let check = git.apply_patch(&patch, true).expect("apply");
        assert!(matches!(check, PatchCheck::Conflicts(_)));
        assert_eq!(fs::read_to_string(temp.path().join("a.txt")).expect("read"), "one\n");
    }

    #[test]
    fn excluded_paths_are_not_snapshotted() {
        let (temp, git) = repo();
        git.exclude_path("/reports/").expect("exclude");
        git.exclude_path("/reports/").expect("exclude twice");
        fs::create_dir_all(temp.path().join("reports")).expect("mkdir");
        fs::write(temp.path().join("reports/gate.json"), "{}").expect("write");
        assert!(git.is_clean().expect("clean"));
        let exclude = fs::read_to_string(temp.path().join(".git/info/exclude")).expect("read");
        assert_eq!(exclude.matches("/reports/").count(), 1);
    }
}
