//! greenloop configuration (TOML).
//!
//! The check roster is declarative: each entry names a tool invocation, its
//! prerequisites, and the classification strategy that turns its output into
//! a pass/fail verdict. A missing config file yields the built-in roster.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::classifier::KeywordRule;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GreenloopConfig {
    /// Cap per evidence entry sent to the oracle.
    pub evidence_limit_bytes: usize,

    /// Truncate each captured stdout/stderr stream beyond this many bytes.
    pub output_limit_bytes: usize,

    pub oracle: OracleConfig,

    pub scaffold: ScaffoldConfig,

    /// Ordered gate roster.
    pub checks: Vec<CheckSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleConfig {
    pub base_url: String,
    /// Model name; `OPENAI_MODEL` overrides it when set.
    pub model: String,
    /// Environment variable holding the API credential.
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub temperature: f64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4.1-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 120,
            temperature: 0.1,
        }
    }
}

/// Commands for the external scaffold collaborator. Empty means "not managed".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScaffoldConfig {
    pub provision: Vec<String>,
    pub validate: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ScaffoldConfig {
    fn default() -> Self {
        Self {
            provision: sh(
                "if [ -x bin/install-wp-tests.sh ]; then \
                 bin/install-wp-tests.sh wordpress_test wp wp 127.0.0.1 {platform_version} true; fi",
            ),
            validate: sh("rc=0; \
                 test -f phpunit.xml.dist || { echo 'phpunit.xml.dist is missing'; rc=1; }; \
                 grep -q 'tests/bootstrap.php' phpunit.xml.dist 2>/dev/null \
                 || { echo 'phpunit.xml.dist does not reference tests/bootstrap.php'; rc=1; }; \
                 grep -q '{entry_point}' tests/bootstrap.php 2>/dev/null \
                 || { echo 'tests/bootstrap.php does not load {entry_point}'; rc=1; }; \
                 test -x bin/install-wp-tests.sh \
                 || { echo 'bin/install-wp-tests.sh is missing or not executable'; rc=1; }; \
                 exit $rc"),
            timeout_secs: 30 * 60,
        }
    }
}

/// One entry of the gate roster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckSpec {
    pub name: String,
    /// Program and arguments; placeholders are expanded per run.
    pub command: Vec<String>,
    /// Binaries that must resolve before running. Defaults to the program itself.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires_bins: Vec<String>,
    /// Files (relative to the target) that must exist before running.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires_files: Vec<String>,
    #[serde(default = "default_check_timeout_secs")]
    pub timeout_secs: u64,
    /// Evidence file name inside the reports dir. Defaults to `<name>.txt`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(default)]
    pub classifier: ClassifierSpec,
}

impl CheckSpec {
    pub fn evidence_file(&self) -> String {
        self.evidence
            .clone()
            .unwrap_or_else(|| format!("{}.txt", self.name))
    }

    pub fn prerequisite_bins(&self) -> Vec<String> {
        if self.requires_bins.is_empty() {
            self.command.first().cloned().into_iter().collect()
        } else {
            self.requires_bins.clone()
        }
    }
}

/// Named classification strategy for a check.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassifierSpec {
    #[default]
    ExitStatus,
    Keyword {
        patterns: Vec<String>,
        #[serde(default = "default_true")]
        require_zero_exit: bool,
    },
    FindingsCount {
        /// Results artifact (SARIF) file name inside the reports dir.
        artifact: String,
    },
}

fn default_true() -> bool {
    true
}

fn default_check_timeout_secs() -> u64 {
    30 * 60
}

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// Built-in roster: dependency audit, syntax, style, static analysis,
/// security scan, integration tests.
pub fn default_roster() -> Vec<CheckSpec> {
    vec![
        CheckSpec {
            name: "dependency_audit".to_string(),
            command: strings(&["composer", "audit", "--no-interaction"]),
            requires_bins: Vec::new(),
            requires_files: strings(&["composer.json"]),
            timeout_secs: 10 * 60,
            evidence: None,
            classifier: ClassifierSpec::ExitStatus,
        },
        CheckSpec {
            name: "syntax_lint".to_string(),
            command: sh(
                "find . -name '*.php' -not -path './vendor/*' -not -path './node_modules/*' -print0 \
                 | xargs -0 -r -n 1 php -l",
            ),
            requires_bins: strings(&["php"]),
            requires_files: Vec::new(),
            timeout_secs: 5 * 60,
            evidence: None,
            classifier: ClassifierSpec::Keyword {
                patterns: strings(&["Parse error", "Fatal error", "Errors parsing"]),
                require_zero_exit: true,
            },
        },
        CheckSpec {
            name: "style".to_string(),
            command: strings(&["vendor/bin/phpcs", "--report=full", "-s"]),
            requires_bins: Vec::new(),
            requires_files: Vec::new(),
            timeout_secs: 30 * 60,
            evidence: None,
            classifier: ClassifierSpec::Keyword {
                patterns: strings(&[r"FOUND \d+ ERRORS?", r"\| ERROR +\|"]),
                require_zero_exit: true,
            },
        },
        CheckSpec {
            name: "static_analysis".to_string(),
            command: strings(&[
                "vendor/bin/phpstan",
                "analyse",
                "--no-progress",
                "--error-format=table",
            ]),
            requires_bins: Vec::new(),
            requires_files: Vec::new(),
            timeout_secs: 30 * 60,
            evidence: None,
            classifier: ClassifierSpec::Keyword {
                patterns: strings(&[r"\[ERROR\]", r"Found \d+ errors?"]),
                require_zero_exit: true,
            },
        },
        CheckSpec {
            name: "security_scan".to_string(),
            command: strings(&[
                "semgrep",
                "scan",
                "--config",
                "p/php",
                "--metrics",
                "off",
                "--sarif",
                "--output",
                "{reports_dir}/semgrep.sarif",
            ]),
            requires_bins: Vec::new(),
            requires_files: Vec::new(),
            timeout_secs: 30 * 60,
            evidence: None,
            classifier: ClassifierSpec::FindingsCount {
                artifact: "semgrep.sarif".to_string(),
            },
        },
        CheckSpec {
            name: "integration_tests".to_string(),
            command: strings(&[
                "vendor/bin/phpunit",
                "--configuration",
                "phpunit.xml.dist",
            ]),
            requires_bins: Vec::new(),
            requires_files: strings(&["phpunit.xml.dist"]),
            timeout_secs: 60 * 60,
            evidence: None,
            classifier: ClassifierSpec::ExitStatus,
        },
    ]
}

impl Default for GreenloopConfig {
    fn default() -> Self {
        Self {
            evidence_limit_bytes: 12_000,
            output_limit_bytes: 1_000_000,
            oracle: OracleConfig::default(),
            scaffold: ScaffoldConfig::default(),
            checks: default_roster(),
        }
    }
}

impl GreenloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.evidence_limit_bytes == 0 {
            return Err(anyhow!("evidence_limit_bytes must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if self.oracle.api_key_env.trim().is_empty() {
            return Err(anyhow!("oracle.api_key_env must be set"));
        }
        if self.scaffold.timeout_secs == 0 {
            return Err(anyhow!("scaffold.timeout_secs must be > 0"));
        }
        if self.checks.is_empty() {
            return Err(anyhow!("checks must list at least one check"));
        }
        let mut names = BTreeSet::new();
        let mut evidence = BTreeSet::new();
        for check in &self.checks {
            validate_check(check)?;
            if !names.insert(check.name.as_str()) {
                return Err(anyhow!("duplicate check name '{}'", check.name));
            }
            if !evidence.insert(check.evidence_file()) {
                return Err(anyhow!(
                    "check '{}' reuses evidence file '{}'",
                    check.name,
                    check.evidence_file()
                ));
            }
        }
        Ok(())
    }
}

/// Evidence bundle keys the bundler adds on its own.
const RESERVED_CHECK_NAMES: [&str; 2] = ["gate", "scaffold"];

/// Reports-dir entries greenloop writes itself.
const RESERVED_ARTIFACTS: [&str; 4] = ["gate.json", "run.json", "scaffold.txt", "iterations"];
const RESERVED_ARTIFACT_PREFIXES: [&str; 3] = ["gate-", "evidence-", "autofix-"];

fn is_reserved_artifact(file: &str) -> bool {
    let top = file.split(['/', '\\']).next().unwrap_or_default();
    RESERVED_ARTIFACTS.contains(&top)
        || RESERVED_ARTIFACT_PREFIXES
            .iter()
            .any(|prefix| top.starts_with(prefix))
}

fn validate_check(check: &CheckSpec) -> Result<()> {
    let name = check.name.as_str();
    if name.trim().is_empty() || name.contains(['/', '\\']) {
        return Err(anyhow!("invalid check name '{name}'"));
    }
    if RESERVED_CHECK_NAMES.contains(&name) {
        return Err(anyhow!("check name '{name}' is reserved"));
    }
    let evidence = check.evidence_file();
    if is_reserved_artifact(&evidence) {
        return Err(anyhow!(
            "check '{name}': evidence file '{evidence}' collides with a greenloop artifact"
        ));
    }
    if check.command.is_empty() || check.command[0].trim().is_empty() {
        return Err(anyhow!("check '{name}': command must be a non-empty array"));
    }
    if check.timeout_secs == 0 {
        return Err(anyhow!("check '{name}': timeout_secs must be > 0"));
    }
    match &check.classifier {
        ClassifierSpec::ExitStatus => {}
        ClassifierSpec::Keyword {
            patterns,
            require_zero_exit,
        } => {
            KeywordRule::new(patterns, *require_zero_exit)
                .with_context(|| format!("check '{name}': invalid keyword pattern"))?;
        }
        ClassifierSpec::FindingsCount { artifact } => {
            if artifact.trim().is_empty()
                || artifact.contains(['/', '\\'])
                || is_reserved_artifact(artifact)
            {
                return Err(anyhow!("check '{name}': invalid findings artifact '{artifact}'"));
            }
        }
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `GreenloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<GreenloopConfig> {
    if !path.exists() {
        let cfg = GreenloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: GreenloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &GreenloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
