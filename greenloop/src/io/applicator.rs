//! Patch applicator: the only component that mutates the target tree.
//!
//! Every apply is atomic with respect to the tree. Either the whole diff lands
//! and is committed, or the tree is reset to the pre-apply checkpoint.

use std::path::Path;

use anyhow::{Result, anyhow, bail};
use tracing::{info, instrument, warn};

use crate::core::types::{ApplyOutcome, PatchProposal};
use crate::io::context::RunContext;
use crate::io::git::{Git, PatchCheck};

const BASELINE_MESSAGE: &str = "greenloop: baseline snapshot";

pub trait PatchApplicator {
    /// Identifier of the current tree state.
    fn checkpoint(&self) -> Result<String>;

    /// Apply the diff stored at `patch_path`. A diff that does not apply is
    /// `Ok(Rejected)`; `Err` means the tree could not be managed at all.
    fn apply(&self, proposal: &PatchProposal, patch_path: &Path, iteration: u32)
    -> Result<ApplyOutcome>;

    /// Roll the tree back to an earlier checkpoint.
    fn restore(&self, checkpoint: &str) -> Result<()>;

    /// Record out-of-band changes (scaffold provisioning) as a new checkpoint.
    fn snapshot(&self, message: &str) -> Result<Option<String>>;
}

/// Git-backed applicator; checkpoints are commit SHAs.
#[derive(Debug, Clone)]
pub struct GitApplicator {
    git: Git,
    baseline: String,
}

impl GitApplicator {
    /// Make the target a git work tree with a clean baseline commit.
    #[instrument(skip_all, fields(target = %ctx.target.display()))]
    pub fn prepare(ctx: &RunContext) -> Result<Self> {
        let git = Git::new(&ctx.target);
        if git.is_inside_work_tree()? {
            let toplevel = git.toplevel()?;
            if toplevel != ctx.target {
                bail!(
                    "target {} is a subdirectory of repository {}; point the target at the repository root",
                    ctx.target.display(),
                    toplevel.display()
                );
            }
        } else {
            git.init()?;
        }
        git.ensure_identity()?;

        if let Some(rel) = ctx.reports_dir_in_target() {
            let rel = rel.to_string_lossy().replace('\\', "/");
            git.exclude_path(&format!("/{rel}/"))?;
        }

        let baseline = match git.head_sha()? {
            None => match git.commit_all(BASELINE_MESSAGE)? {
                Some(sha) => sha,
                None => git.commit_empty(BASELINE_MESSAGE)?,
            },
            Some(head) => {
                if git.is_clean()? {
                    head
                } else {
                    info!("snapshotting uncommitted changes before the first gate");
                    git.commit_all(BASELINE_MESSAGE)?.unwrap_or(head)
                }
            }
        };
        info!(%baseline, "target tree prepared");
        Ok(Self { git, baseline })
    }

    pub fn baseline(&self) -> &str {
        &self.baseline
    }

    fn rollback(&self, checkpoint: &str) -> Result<()> {
        self.git.reset_hard(checkpoint)?;
        self.git.clean_untracked()
    }
}

impl PatchApplicator for GitApplicator {
    fn checkpoint(&self) -> Result<String> {
        self.git
            .head_sha()?
            .ok_or_else(|| anyhow!("target has no commits"))
    }

    #[instrument(skip_all, fields(iteration, diff_bytes = proposal.raw_diff.len()))]
    fn apply(
        &self,
        proposal: &PatchProposal,
        patch_path: &Path,
        iteration: u32,
    ) -> Result<ApplyOutcome> {
        let checkpoint = self.checkpoint()?;

        if let PatchCheck::Conflicts(reason) = self.git.apply_patch(patch_path, true)? {
            warn!(%reason, "patch does not apply");
            return Ok(ApplyOutcome::Rejected { checkpoint, reason });
        }

        let applied = self.git.apply_patch(patch_path, false).and_then(|check| match check {
            PatchCheck::Clean => self
                .git
                .commit_all(&format!("greenloop: iteration {iteration} patch"))
                .map(Ok),
            PatchCheck::Conflicts(reason) => Ok(Err(reason)),
        });

        match applied {
            Ok(Ok(commit)) => {
                info!(commit = ?commit, "patch applied");
                Ok(ApplyOutcome::Applied { checkpoint, commit })
            }
            Ok(Err(reason)) => {
                warn!(%reason, "patch failed after check, rolling back");
                self.rollback(&checkpoint)?;
                Ok(ApplyOutcome::Rejected { checkpoint, reason })
            }
            Err(err) => {
                self.rollback(&checkpoint)?;
                Err(err)
            }
        }
    }

    fn restore(&self, checkpoint: &str) -> Result<()> {
        info!(checkpoint, "restoring target tree");
        self.rollback(checkpoint)
    }

    fn snapshot(&self, message: &str) -> Result<Option<String>> {
        self.git.commit_all(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn target_with_file(contents: &str) -> (tempfile::TempDir, RunContext) {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("plugin");
        fs::create_dir_all(&target).expect("mkdir");
        fs::write(target.join("main.php"), contents).expect("write");
        let ctx = RunContext::new(&target, &target.join("reports"), "latest", "main.php")
            .expect("ctx");
        (temp, ctx)
    }

    fn proposal_at(ctx: &RunContext, diff: &str) -> (PatchProposal, std::path::PathBuf) {
        let proposal = PatchProposal::from_response(diff).expect("diff");
        let path = ctx.reports_dir.join("autofix-diff-1.patch");
        fs::write(&path, &proposal.raw_diff).expect("write patch");
        (proposal, path)
    }

    #[test]
    fn prepare_initializes_plain_directory() {
        let (_temp, ctx) = target_with_file("<?php\n");
        let applicator = GitApplicator::prepare(&ctx).expect("prepare");
        let git = Git::new(&ctx.target);
        assert_eq!(git.head_sha().expect("head").as_deref(), Some(applicator.baseline()));
        assert!(git.is_clean().expect("clean"));
    }

    #[test]
    fn prepare_refuses_nested_target() {
        let temp = tempfile::tempdir().expect("tempdir");
        Git::new(temp.path()).init().expect("init");
        let nested = temp.path().join("sub");
        fs::create_dir_all(&nested).expect("mkdir");
        let ctx = RunContext::new(&nested, &temp.path().join("out"), "latest", "m.php")
            .expect("ctx");
        let err = GitApplicator::prepare(&ctx).unwrap_err();
        assert!(err.to_string().contains("subdirectory"));
    }

    #[test]
    fn clean_patch_is_committed() {
        let (_temp, ctx) = target_with_file("<?php\necho 'a';\n");
        let applicator = GitApplicator::prepare(&ctx).expect("prepare");
        let (proposal, path) = proposal_at(
            &ctx,
            "--- a/main.php\n+++ b/main.php\n@@ -1,2 +1,2 @@\n <?php\n-echo 'a';\n+echo 'b';\n",
        );
        let outcome = applicator.apply(&proposal, &path, 1).expect("apply");
        match outcome {
            ApplyOutcome::Applied { checkpoint, commit } => {
                assert_eq!(checkpoint, applicator.baseline());
                assert!(commit.is_some());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            fs::read_to_string(ctx.target.join("main.php")).expect("read"),
            "<?php\necho 'b';\n"
        );
        assert!(Git::new(&ctx.target).is_clean().expect("clean"));
    }

    #[test]
    fn conflicting_patch_leaves_tree_untouched() {
        let (_temp, ctx) = target_with_file("<?php\necho 'a';\n");
        let applicator = GitApplicator::prepare(&ctx).expect("prepare");
        let (proposal, path) = proposal_at(
            &ctx,
            "diff --git a/main.php b/main.php\n--- a/main.php\n+++ b/main.php\n@@ -1,2 +1,2 @@\n <?php\n-echo 'zzz';\n+echo 'b';\n",
        );
        let outcome = applicator.apply(&proposal, &path, 1).expect("apply");
        assert!(matches!(outcome, ApplyOutcome::Rejected { .. }));
        assert_eq!(
            fs::read_to_string(ctx.target.join("main.php")).expect("read"),
            "<?php\necho 'a';\n"
        );
        assert_eq!(
            applicator.checkpoint().expect("checkpoint"),
            applicator.baseline()
        );
    }

    #[test]
    fn multi_file_patch_is_all_or_nothing() {
        let (_temp, ctx) = target_with_file("<?php\necho 'a';\n");
        let applicator = GitApplicator::prepare(&ctx).expect("prepare");
        // First hunk applies, second does not: nothing may land.
        let (proposal, path) = proposal_at(
            &ctx,
            "--- a/main.php\n+++ b/main.php\n@@ -1,2 +1,2 @@\n <?php\n-echo 'a';\n+echo 'b';\n\
             --- a/missing.php\n+++ b/missing.php\n@@ -1 +1 @@\n-x\n+y\n",
        );
        let outcome = applicator.apply(&proposal, &path, 1).expect("apply");
        assert!(matches!(outcome, ApplyOutcome::Rejected { .. }));
        assert_eq!(
            fs::read_to_string(ctx.target.join("main.php")).expect("read"),
            "<?php\necho 'a';\n"
        );
    }

    #[test]
    fn restore_returns_to_earlier_checkpoint() {
        let (_temp, ctx) = target_with_file("<?php\n");
        let applicator = GitApplicator::prepare(&ctx).expect("prepare");
        fs::write(ctx.target.join("extra.php"), "<?php\n").expect("write");
        let snap = applicator.snapshot("scaffold").expect("snapshot");
        assert!(snap.is_some());
        applicator.restore(applicator.baseline()).expect("restore");
        assert!(!ctx.target.join("extra.php").exists());
        assert!(ctx.reports_dir.is_dir());
    }

    #[test]
    fn dirty_tree_gets_baseline_snapshot() {
        let (_temp, ctx) = target_with_file("<?php\n");
        let git = Git::new(&ctx.target);
        git.init().expect("init");
        git.ensure_identity().expect("identity");
        git.commit_all("user commit").expect("commit");
        fs::write(ctx.target.join("main.php"), "<?php\n// wip\n").expect("write");

        let applicator = GitApplicator::prepare(&ctx).expect("prepare");
        assert!(git.is_clean().expect("clean"));
        assert_eq!(git.head_sha().expect("head").as_deref(), Some(applicator.baseline()));
    }
}
