//! Test-only helpers: scratch target trees and scripted collaborators.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::evidence::EvidenceBundle;
use crate::core::types::{PatchProposal, ScaffoldStatus};
use crate::io::check_runner::{CheckInvocation, CheckRunner, RunOutcome, write_evidence};
use crate::io::context::RunContext;
use crate::io::oracle::{OracleError, PatchOracle};
use crate::io::scaffold::Scaffold;

/// Scratch workspace with a target tree and a separate reports dir.
pub struct TestRepo {
    _temp: tempfile::TempDir,
    target: PathBuf,
    reports_dir: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let target = temp.path().join("plugin");
        let reports_dir = temp.path().join("reports");
        fs::create_dir_all(&target).context("create target")?;
        Ok(Self {
            _temp: temp,
            target,
            reports_dir,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn reports_dir(&self) -> &Path {
        &self.reports_dir
    }

    pub fn ctx(&self) -> Result<RunContext> {
        RunContext::new(&self.target, &self.reports_dir, "latest", "plugin.php")
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.target.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.target.join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn report_file(&self, name: &str) -> PathBuf {
        self.reports_dir.join(name)
    }
}

/// Unified diff replacing the only line of a one-line file.
pub fn single_line_diff(file: &str, old: &str, new: &str) -> String {
    format!("diff --git a/{file} b/{file}\n--- a/{file}\n+++ b/{file}\n@@ -1 +1 @@\n-{old}\n+{new}\n")
}

/// One canned oracle reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Raw response text, validated like a real response.
    Text(String),
    MissingCredentials,
    Http(u16),
}

/// Oracle that replays scripted replies in order and records every request.
pub struct ScriptedOracle {
    replies: RefCell<VecDeque<ScriptedReply>>,
    requests: RefCell<Vec<EvidenceBundle>>,
}

impl ScriptedOracle {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<EvidenceBundle> {
        self.requests.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.borrow().len()
    }
}

impl PatchOracle for ScriptedOracle {
    fn propose(&self, evidence: &EvidenceBundle) -> Result<PatchProposal, OracleError> {
        self.requests.borrow_mut().push(evidence.clone());
        let reply = self
            .replies
            .borrow_mut()
            .pop_front()
            .expect("scripted oracle ran out of replies");
        match reply {
            ScriptedReply::Text(text) => OracleError::check_response(&text),
            ScriptedReply::MissingCredentials => Err(OracleError::MissingCredentials {
                var: "OPENAI_API_KEY".to_string(),
            }),
            ScriptedReply::Http(status) => Err(OracleError::Http {
                status,
                body: "scripted failure".to_string(),
            }),
        }
    }
}

type CheckScript = Box<dyn Fn(&CheckInvocation) -> RunOutcome>;

/// Check runner whose outcomes are computed from the invocation (usually the
/// target tree contents). Unscripted checks pass.
#[derive(Default)]
pub struct ScriptedCheckRunner {
    scripts: BTreeMap<String, CheckScript>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedCheckRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(
        mut self,
        name: &str,
        script: impl Fn(&CheckInvocation) -> RunOutcome + 'static,
    ) -> Self {
        self.scripts.insert(name.to_string(), Box::new(script));
        self
    }

    /// `name` fails (exit 1) while `file` in the target contains `marker`.
    pub fn fails_while_contains(self, name: &str, file: &str, marker: &str) -> Self {
        let file = file.to_string();
        let marker = marker.to_string();
        self.check(name, move |inv| {
            let contents = fs::read_to_string(inv.workdir.join(&file)).unwrap_or_default();
            if contents.contains(&marker) {
                finished(1, &format!("{file}: found {marker}\n"))
            } else {
                finished(0, "ok\n")
            }
        })
    }

    /// `name` always fails with `output`.
    pub fn always_fails(self, name: &str, output: &str) -> Self {
        let output = output.to_string();
        self.check(name, move |_| finished(1, &output))
    }

    /// `name` is skipped as if its tool were not installed.
    pub fn skipped(self, name: &str) -> Self {
        self.check(name, |inv| RunOutcome::Skipped {
            reason: format!("`{}` is not installed", inv.program),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl CheckRunner for ScriptedCheckRunner {
    fn run(&self, invocation: &CheckInvocation) -> Result<RunOutcome> {
        self.calls.borrow_mut().push(invocation.name.clone());
        let outcome = match self.scripts.get(&invocation.name) {
            Some(script) => script(invocation),
            None => finished(0, "ok\n"),
        };
        let text = match &outcome {
            RunOutcome::Skipped { reason } => format!("skipped: {reason}\n"),
            RunOutcome::Finished { output, .. } => output.clone(),
        };
        write_evidence(&invocation.output_path, &text)?;
        Ok(outcome)
    }
}

pub fn finished(code: i32, output: &str) -> RunOutcome {
    RunOutcome::Finished {
        exit_code: Some(code),
        timed_out: false,
        output: output.to_string(),
    }
}

/// Scaffold that always reports the same status.
pub struct FixedScaffold {
    status: ScaffoldStatus,
    calls: Cell<u32>,
}

impl FixedScaffold {
    pub fn valid() -> Self {
        Self::new(ScaffoldStatus::valid())
    }

    pub fn new(status: ScaffoldStatus) -> Self {
        Self {
            status,
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.get()
    }
}

impl Scaffold for FixedScaffold {
    fn ensure(&self, _ctx: &RunContext) -> Result<ScaffoldStatus> {
        self.calls.set(self.calls.get() + 1);
        Ok(self.status.clone())
    }
}
