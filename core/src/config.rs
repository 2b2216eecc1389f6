//! Configuration handling for the guarded pipeline.
//!
//! Settings come from a YAML file (every field optional, defaults fill the
//! gaps) and can be overridden by environment variables. Round budgets are
//! validated once at startup, never per request.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::policy_gate::ConvergencePolicy;
use crate::redactor::RedactionRules;
use crate::template::PromptTemplates;

/// Complete configuration of a [`Pipeline`](crate::pipeline::Pipeline).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum censor attempts per question (`CENSOR_ROUNDS`).
    #[serde(alias = "CENSOR_ROUNDS")]
    pub censor_rounds: u32,
    /// Maximum generator invocations per run (`ASSISTANT_MAX_ROUNDS`).
    #[serde(alias = "ASSISTANT_MAX_ROUNDS")]
    pub assistant_max_rounds: u32,
    /// How many affirmative censor verdicts are needed to pass.
    pub convergence_policy: ConvergencePolicy,
    /// Single-confirmation passes only when the reported confidence is
    /// strictly above this value. Affirms without a confidence are not
    /// filtered.
    pub min_affirm_confidence: Option<u8>,
    /// Answers whose newest mentioned year is older than this get a
    /// staleness disclaimer.
    pub staleness_threshold_years: u32,
    /// Year used as "now" for staleness checks; `None` means the current
    /// UTC year.
    pub reference_year: Option<i32>,
    /// Timeout applied to every model call, in milliseconds.
    pub model_timeout_ms: u64,
    /// Number of past conversation messages given to the assistant.
    pub memory_window: usize,
    /// Deterministic redaction rules applied after the post-moderator.
    pub redaction: RedactionRules,
    /// Prompt templates for every stage.
    pub templates: PromptTemplates,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            censor_rounds: 5,
            assistant_max_rounds: 3,
            convergence_policy: ConvergencePolicy::ConsecutiveConfirmation,
            min_affirm_confidence: None,
            staleness_threshold_years: 5,
            reference_year: None,
            model_timeout_ms: 30_000,
            memory_window: 3,
            redaction: RedactionRules::default(),
            templates: PromptTemplates::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads a YAML file and applies environment overrides on top.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed, or if the resulting
    /// configuration is invalid.
    pub fn from_yaml(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Unable to read pipeline config from {}", path.display()))?;
        let cfg: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("Invalid pipeline config in {}", path.display()))?;
        cfg.apply_overrides(|key| env::var(key).ok())
    }

    /// Loads configuration from environment variables, falling back to defaults.
    ///
    /// Recognised variables (prefixed name wins over the bare one):
    ///
    /// - `GUARDRAG_CENSOR_ROUNDS` or `CENSOR_ROUNDS` (integer ≥ 1)
    /// - `GUARDRAG_ASSISTANT_MAX_ROUNDS` or `ASSISTANT_MAX_ROUNDS` (integer ≥ 1)
    /// - `GUARDRAG_CONVERGENCE_POLICY` or `CONVERGENCE_POLICY`
    ///   (`consecutive-confirmation` | `single-confirmation`)
    /// - `GUARDRAG_MIN_AFFIRM_CONFIDENCE` (0–100)
    /// - `GUARDRAG_STALENESS_THRESHOLD_YEARS` or `STALENESS_THRESHOLD_YEARS`
    /// - `GUARDRAG_MODEL_TIMEOUT_MS`
    /// - `GUARDRAG_MEMORY_WINDOW`
    ///
    /// # Errors
    ///
    /// Fails on unparsable values or an invalid resulting configuration.
    pub fn from_env() -> Result<Self> {
        Self::default().apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let first = |keys: &[&str]| keys.iter().find_map(|k| lookup(k));

        if let Some(raw) = first(&["GUARDRAG_CENSOR_ROUNDS", "CENSOR_ROUNDS"]) {
            self.censor_rounds = parse_number(&raw, "censor rounds")?;
        }
        if let Some(raw) = first(&["GUARDRAG_ASSISTANT_MAX_ROUNDS", "ASSISTANT_MAX_ROUNDS"]) {
            self.assistant_max_rounds = parse_number(&raw, "assistant max rounds")?;
        }
        if let Some(raw) = first(&["GUARDRAG_CONVERGENCE_POLICY", "CONVERGENCE_POLICY"]) {
            self.convergence_policy = raw.parse()?;
        }
        if let Some(raw) = first(&["GUARDRAG_MIN_AFFIRM_CONFIDENCE"]) {
            self.min_affirm_confidence = Some(parse_number(&raw, "min affirm confidence")?);
        }
        if let Some(raw) = first(&[
            "GUARDRAG_STALENESS_THRESHOLD_YEARS",
            "STALENESS_THRESHOLD_YEARS",
        ]) {
            self.staleness_threshold_years = parse_number(&raw, "staleness threshold")?;
        }
        if let Some(raw) = first(&["GUARDRAG_MODEL_TIMEOUT_MS"]) {
            self.model_timeout_ms = parse_number(&raw, "model timeout")?;
        }
        if let Some(raw) = first(&["GUARDRAG_MEMORY_WINDOW"]) {
            self.memory_window = parse_number(&raw, "memory window")?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Checks budgets and thresholds.
    ///
    /// # Errors
    ///
    /// Fails when a round budget or the model timeout is zero, or the
    /// confidence threshold exceeds 100.
    pub fn validate(&self) -> Result<()> {
        if self.censor_rounds == 0 {
            bail!("censor_rounds must be >= 1");
        }
        if self.assistant_max_rounds == 0 {
            bail!("assistant_max_rounds must be >= 1");
        }
        if self.model_timeout_ms == 0 {
            bail!("model_timeout_ms must be > 0");
        }
        if let Some(c) = self.min_affirm_confidence {
            if c > 100 {
                bail!("min_affirm_confidence must be within 0..=100, got {c}");
            }
        }
        Ok(())
    }

    /// Timeout applied to each model call.
    #[must_use]
    pub const fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }
}

fn parse_number<T>(raw: &str, what: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("Invalid value for {what}: {raw}"))
}
