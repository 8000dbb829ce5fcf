//! Failure classification strategies for check output.
//!
//! Each check type is classified by one named strategy:
//!
//! - exit status: pass iff the tool exited 0,
//! - keyword: pass iff no failure marker matches the captured text (style and
//!   static-analysis tools often exit 0 while reporting defects),
//! - findings count: pass iff a structured results artifact (SARIF) holds no
//!   results, regardless of the tool's own exit status.
//!
//! A timed-out tool always fails; that decision lives with the caller.

use regex::Regex;
use serde_json::Value;

/// Raw facts about one finished tool run.
#[derive(Debug, Clone, Copy)]
pub struct ToolRun<'a> {
    pub exit_code: Option<i32>,
    pub output: &'a str,
}

/// Verdict of a strategy for one tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Pass,
    Fail { reason: String },
    Skip { reason: String },
}

pub fn by_exit_status(run: ToolRun<'_>) -> Classification {
    match run.exit_code {
        Some(0) => Classification::Pass,
        Some(code) => Classification::Fail {
            reason: format!("exit status {code}"),
        },
        None => Classification::Fail {
            reason: "terminated by signal".to_string(),
        },
    }
}

/// Text-marker rule for tools whose exit status is unreliable.
#[derive(Debug, Clone)]
pub struct KeywordRule {
    patterns: Vec<Regex>,
    require_zero_exit: bool,
}

impl KeywordRule {
    pub fn new(patterns: &[String], require_zero_exit: bool) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
            require_zero_exit,
        })
    }

    pub fn classify(&self, run: ToolRun<'_>) -> Classification {
        if let Some(pattern) = self.patterns.iter().find(|p| p.is_match(run.output)) {
            return Classification::Fail {
                reason: format!("output matched failure marker /{}/", pattern.as_str()),
            };
        }
        if self.require_zero_exit {
            return by_exit_status(run);
        }
        Classification::Pass
    }
}

/// Classify a structured-findings check from its results artifact.
///
/// An absent artifact is a soft skip; an unreadable one is a hard failure.
pub fn by_findings(artifact: Option<&str>) -> Classification {
    let Some(contents) = artifact else {
        return Classification::Skip {
            reason: "results artifact absent".to_string(),
        };
    };
    match count_sarif_results(contents) {
        Ok(0) => Classification::Pass,
        Ok(count) => Classification::Fail {
            reason: format!("{count} finding(s) reported"),
        },
        Err(err) => Classification::Fail {
            reason: format!("malformed results artifact: {err}"),
        },
    }
}

/// Count `results` across every run of a SARIF document.
pub fn count_sarif_results(contents: &str) -> Result<usize, String> {
    let doc: Value = serde_json::from_str(contents).map_err(|e| e.to_string())?;
    let runs = doc
        .get("runs")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing `runs` array".to_string())?;
    let mut total = 0;
    for (idx, run) in runs.iter().enumerate() {
        match run.get("results") {
            None | Some(Value::Null) => {}
            Some(Value::Array(results)) => total += results.len(),
            Some(_) => return Err(format!("runs[{idx}].results is not an array")),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(exit_code: Option<i32>, output: &str) -> ToolRun<'_> {
        ToolRun { exit_code, output }
    }

    #[test]
    fn exit_status_strategy() {
        assert_eq!(by_exit_status(run(Some(0), "")), Classification::Pass);
        assert!(matches!(
            by_exit_status(run(Some(2), "")),
            Classification::Fail { .. }
        ));
        assert!(matches!(
            by_exit_status(run(None, "")),
            Classification::Fail { .. }
        ));
    }

    #[test]
    fn keyword_fails_on_marker_despite_zero_exit() {
        let rule = KeywordRule::new(&[r"FOUND \d+ ERRORS?".to_string()], true).expect("rule");
        let out = "FILE: a.php\nFOUND 2 ERRORS AFFECTING 2 LINES\n";
        assert!(matches!(
            rule.classify(run(Some(0), out)),
            Classification::Fail { .. }
        ));
        assert_eq!(rule.classify(run(Some(0), "all clean")), Classification::Pass);
    }

    #[test]
    fn keyword_exit_status_is_optional() {
        let strict = KeywordRule::new(&["ERROR".to_string()], true).expect("rule");
        let lenient = KeywordRule::new(&["ERROR".to_string()], false).expect("rule");
        assert!(matches!(
            strict.classify(run(Some(1), "ok")),
            Classification::Fail { .. }
        ));
        assert_eq!(lenient.classify(run(Some(1), "ok")), Classification::Pass);
    }

    #[test]
    fn keyword_rejects_invalid_regex() {
        assert!(KeywordRule::new(&["(".to_string()], true).is_err());
    }

    #[test]
    fn findings_absent_is_skip() {
        assert!(matches!(by_findings(None), Classification::Skip { .. }));
    }

    #[test]
    fn findings_empty_results_pass() {
        let sarif = r#"{"version":"2.1.0","runs":[{"tool":{},"results":[]}]}"#;
        assert_eq!(by_findings(Some(sarif)), Classification::Pass);
    }

    #[test]
    fn findings_any_result_fails() {
        let sarif = r#"{"runs":[{"results":[]},{"results":[{"ruleId":"php.lang.security.eval"}]}]}"#;
        assert_eq!(
            by_findings(Some(sarif)),
            Classification::Fail {
                reason: "1 finding(s) reported".to_string()
            }
        );
    }

    #[test]
    fn findings_malformed_is_hard_failure() {
        assert!(matches!(
            by_findings(Some("not json")),
            Classification::Fail { .. }
        ));
        assert!(matches!(
            by_findings(Some(r#"{"version":"2.1.0"}"#)),
            Classification::Fail { .. }
        ));
        assert!(matches!(
            by_findings(Some(r#"{"runs":[{"results":{}}]}"#)),
            Classification::Fail { .. }
        ));
    }
}
