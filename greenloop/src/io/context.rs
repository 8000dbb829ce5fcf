//! Per-run context shared by the roster, scaffold and oracle.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

/// Where the run operates and the hints passed through to external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    /// Target tree under repair (absolute).
    pub target: PathBuf,
    /// Directory receiving gate reports, evidence and patches (absolute).
    pub reports_dir: PathBuf,
    /// Target platform/version hint (e.g. `latest`).
    pub platform_version: String,
    /// Entry-point identifier consumed by scaffold validation.
    pub entry_point: String,
}

impl RunContext {
    /// Resolve and validate paths. An unreachable target is a fatal setup error.
    pub fn new(
        target: &Path,
        reports_dir: &Path,
        platform_version: impl Into<String>,
        entry_point: impl Into<String>,
    ) -> Result<Self> {
        let target = fs::canonicalize(target)
            .with_context(|| format!("target path {} is not reachable", target.display()))?;
        if !target.is_dir() {
            return Err(anyhow!("target {} is not a directory", target.display()));
        }
        fs::create_dir_all(reports_dir)
            .with_context(|| format!("create reports dir {}", reports_dir.display()))?;
        let reports_dir = fs::canonicalize(reports_dir)
            .with_context(|| format!("resolve reports dir {}", reports_dir.display()))?;
        Ok(Self {
            target,
            reports_dir,
            platform_version: platform_version.into(),
            entry_point: entry_point.into().trim().trim_start_matches('/').to_string(),
        })
    }

    /// Substitute `{target}`, `{reports_dir}`, `{platform_version}` and `{entry_point}`.
    pub fn expand(&self, arg: &str) -> String {
        arg.replace("{target}", &self.target.to_string_lossy())
            .replace("{reports_dir}", &self.reports_dir.to_string_lossy())
            .replace("{platform_version}", &self.platform_version)
            .replace("{entry_point}", &self.entry_point)
    }

    pub fn expand_all(&self, args: &[String]) -> Vec<String> {
        args.iter().map(|a| self.expand(a)).collect()
    }

    /// Reports dir relative to the target, when it lives inside it.
    pub fn reports_dir_in_target(&self) -> Option<PathBuf> {
        self.reports_dir
            .strip_prefix(&self.target)
            .ok()
            .filter(|rel| !rel.as_os_str().is_empty())
            .map(Path::to_path_buf)
    }
}
