//! Patch oracle client.
//!
//! The controller depends only on [`PatchOracle`]. [`OpenAiOracle`] is the
//! HTTP adapter: one blocking request per proposal, no automatic retries.

use std::env;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::evidence::EvidenceBundle;
use crate::core::types::{PatchProposal, ProposalRejection};
use crate::io::config::OracleConfig;
use crate::io::context::RunContext;

const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");
const MODEL_OVERRIDE_ENV: &str = "OPENAI_MODEL";
const ERROR_BODY_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("credential environment variable {var} is not set")]
    MissingCredentials { var: String },
    #[error("oracle rejected the credential (HTTP {status})")]
    Unauthorized { status: u16 },
    #[error("oracle request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("oracle returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed oracle response: {0}")]
    MalformedResponse(String),
    #[error("oracle returned an empty response")]
    EmptyResponse,
    #[error("oracle response is not a unified diff (starts with {preview:?})")]
    NotADiff { preview: String, response: String },
    #[error("render repair prompt: {0}")]
    Prompt(String),
}

impl OracleError {
    /// Fatal errors abort the run; the rest only fail the current iteration.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OracleError::MissingCredentials { .. }
                | OracleError::Unauthorized { .. }
                | OracleError::Transport(_)
                | OracleError::Prompt(_)
        )
    }

    /// Raw response text worth keeping for audit, if any.
    pub fn rejected_response(&self) -> Option<&str> {
        match self {
            OracleError::NotADiff { response, .. } => Some(response),
            OracleError::Http { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Validate a response into a proposal, keeping the raw text on rejection.
    pub fn check_response(text: &str) -> Result<PatchProposal, OracleError> {
        PatchProposal::from_response(text).map_err(|rejection| match rejection {
            ProposalRejection::Empty => OracleError::EmptyResponse,
            ProposalRejection::NotADiff { preview } => OracleError::NotADiff {
                preview,
                response: text.to_string(),
            },
        })
    }
}

/// Narrow port between the controller and the reasoning service.
pub trait PatchOracle {
    fn propose(&self, evidence: &EvidenceBundle) -> Result<PatchProposal, OracleError>;
}

/// Render the fixed repair instructions around an evidence bundle.
pub fn render_repair_prompt(
    evidence: &EvidenceBundle,
    platform_version: &str,
    entry_point: &str,
) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("repair", REPAIR_TEMPLATE)
        .expect("repair template should be valid");
    let template = env.get_template("repair")?;
    let rendered = template
        .render(context! {
            platform_version => platform_version,
            entry_point => (!entry_point.is_empty()).then_some(entry_point),
            entries => &evidence.entries,
        })
        .context("render repair prompt")?;
    Ok(rendered)
}

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: &'a str,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ResponsesReply {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Join every `output_text` part of a Responses API reply.
pub fn extract_output_text(body: &str) -> Result<String, OracleError> {
    let reply: ResponsesReply = serde_json::from_str(body)
        .map_err(|err| OracleError::MalformedResponse(err.to_string()))?;
    let parts: Vec<&str> = reply
        .output
        .iter()
        .flat_map(|item| item.content.iter())
        .filter(|part| part.kind == "output_text")
        .map(|part| part.text.as_str())
        .collect();
    Ok(parts.join("\n").trim().to_string())
}

/// Adapter for an OpenAI-compatible `/responses` endpoint.
pub struct OpenAiOracle {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f64,
    api_key_env: String,
    api_key: Option<String>,
    platform_version: String,
    entry_point: String,
}

impl fmt::Debug for OpenAiOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiOracle")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key_env", &self.api_key_env)
            .finish_non_exhaustive()
    }
}

impl OpenAiOracle {
    pub fn new(config: &OracleConfig, ctx: &RunContext) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("build oracle http client")?;
        let model = env::var(MODEL_OVERRIDE_ENV)
            .ok()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| config.model.clone());
        Ok(Self {
            client,
            endpoint: format!("{}/responses", config.base_url.trim_end_matches('/')),
            model,
            temperature: config.temperature,
            api_key_env: config.api_key_env.clone(),
            api_key: None,
            platform_version: ctx.platform_version.clone(),
            entry_point: ctx.entry_point.clone(),
        })
    }

    /// Use `key` instead of reading the credential from the environment.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn credential(&self) -> Result<String, OracleError> {
        let key = match &self.api_key {
            Some(key) => key.clone(),
            None => env::var(&self.api_key_env).unwrap_or_default(),
        };
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(OracleError::MissingCredentials {
                var: self.api_key_env.clone(),
            });
        }
        Ok(key)
    }
}

impl PatchOracle for OpenAiOracle {
    #[instrument(skip_all, fields(model = %self.model, entries = evidence.entries.len()))]
    fn propose(&self, evidence: &EvidenceBundle) -> Result<PatchProposal, OracleError> {
        let key = self.credential()?;
        let prompt = render_repair_prompt(evidence, &self.platform_version, &self.entry_point)
            .map_err(|err| OracleError::Prompt(format!("{err:#}")))?;
        debug!(prompt_bytes = prompt.len(), "requesting patch");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(key)
            .json(&ResponsesRequest {
                model: &self.model,
                input: &prompt,
                temperature: self.temperature,
            })
            .send()?;
        let status = response.status();
        let body = response.text()?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(status = status.as_u16(), "oracle refused credential");
            return Err(OracleError::Unauthorized {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
            return Err(OracleError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let text = extract_output_text(&body)?;
        let proposal = OracleError::check_response(&text)?;
        info!(diff_bytes = proposal.raw_diff.len(), "patch proposed");
        Ok(proposal)
    }
}
