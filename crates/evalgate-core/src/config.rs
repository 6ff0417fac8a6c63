//! Engine configuration.
//!
//! Loaded from a TOML file with these sections, all optional:
//!
//! ```toml
//! [scheduler]        # concurrency, grace_period_secs, deadline_secs
//! [retry]            # max_attempts, base_delay_ms, max_delay_ms, jitter
//! [pipelines.graph]  # url, timeout_secs, max_concurrency, tenant_id, top_k, include_sources
//! [diagnostics]      # base_url, api_key_env, preview_chars, timeout_secs
//! [evaluate]         # corpus, state, regression_tolerance_pp, max_error_pct
//! [scoring]          # f1_threshold, error_patterns
//! [[phases]]         # gate table, see `gate::PhaseGate`
//! ```
//!
//! `EVALGATE_<KIND>_URL` overrides a pipeline url and
//! `EVALGATE_DIAGNOSTICS_URL` the diagnostics base url.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use evalgate_ledger::PipelineKind;
use serde::{Deserialize, Serialize};

use crate::domain::{ConfigError, PipelineEndpoint};
use crate::gate::{GateTable, PhaseGate};
use crate::retry::RetryPolicy;
use crate::scheduler::SchedulerOptions;
use crate::scorer::ScorerConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSection {
    pub concurrency: usize,
    pub grace_period_secs: u64,
    pub deadline_secs: Option<u64>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            concurrency: 2,
            grace_period_secs: 5,
            deadline_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSection {
    pub url: Option<String>,
    pub timeout_secs: u64,
    pub max_concurrency: usize,
    pub tenant_id: String,
    pub top_k: u32,
    pub include_sources: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 60,
            max_concurrency: 2,
            tenant_id: "default".to_string(),
            top_k: 5,
            include_sources: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiagnosticsSection {
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub preview_chars: usize,
    pub timeout_secs: u64,
}

impl Default for DiagnosticsSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: None,
            preview_chars: crate::diagnostics::DEFAULT_PREVIEW_CHARS,
            timeout_secs: 10,
        }
    }
}

impl DiagnosticsSection {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvaluateSection {
    pub corpus: PathBuf,
    pub state: PathBuf,
    /// Largest accuracy drop vs the previous iteration that still counts as holding.
    pub regression_tolerance_pp: f64,
    pub max_error_pct: f64,
}

impl Default for EvaluateSection {
    fn default() -> Self {
        Self {
            corpus: PathBuf::from("questions.json"),
            state: PathBuf::from("evalgate-state.json"),
            regression_tolerance_pp: 2.0,
            max_error_pct: 10.0,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub scheduler: SchedulerSection,
    pub retry: RetrySection,
    pub pipelines: BTreeMap<PipelineKind, PipelineSection>,
    pub diagnostics: DiagnosticsSection,
    pub evaluate: EvaluateSection,
    pub scoring: ScorerConfig,
    pub phases: Vec<PhaseGate>,
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` and apply environment overrides.
    ///
    /// A missing file is not an error when `allow_missing` is set; defaults
    /// plus environment overrides are used instead.
    pub fn load(path: &Path, allow_missing: bool) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content)?,
            Err(e) if allow_missing && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `EVALGATE_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for kind in PipelineKind::ALL {
            let key = format!("EVALGATE_{}_URL", kind.as_str().to_ascii_uppercase());
            if let Some(url) = lookup(&key).filter(|u| !u.is_empty()) {
                self.pipelines.entry(kind).or_default().url = Some(url);
            }
        }
        if let Some(url) = lookup("EVALGATE_DIAGNOSTICS_URL").filter(|u| !u.is_empty()) {
            self.diagnostics.base_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.concurrency must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        for (kind, section) in &self.pipelines {
            if section.max_concurrency == 0 {
                return Err(ConfigError::Invalid(format!(
                    "pipelines.{kind}.max_concurrency must be at least 1"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.scoring.f1_threshold) {
            return Err(ConfigError::Invalid(
                "scoring.f1_threshold must be within 0..=1".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for phase in &self.phases {
            if !names.insert(phase.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate phase name: {}",
                    phase.name
                )));
            }
            if phase.pipelines.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "phase {} gates no pipelines",
                    phase.name
                )));
            }
            for (kind, threshold) in &phase.pipelines {
                if !(0.0..=100.0).contains(&threshold.min_accuracy) {
                    return Err(ConfigError::Invalid(format!(
                        "phase {}: {kind}.min_accuracy must be within 0..=100",
                        phase.name
                    )));
                }
            }
            if let Some(stability) = &phase.stability {
                if stability.window < 2 {
                    return Err(ConfigError::Invalid(format!(
                        "phase {}: stability.window must be at least 2",
                        phase.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Endpoint for `kind`; fails when no url is configured.
    pub fn endpoint(&self, kind: PipelineKind) -> Result<PipelineEndpoint, ConfigError> {
        let section = self.pipelines.get(&kind).cloned().unwrap_or_default();
        let url = section
            .url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ConfigError::MissingPipelineUrl(kind.to_string()))?;
        Ok(PipelineEndpoint {
            kind,
            url,
            timeout: Duration::from_secs(section.timeout_secs),
            max_concurrency: section.max_concurrency.max(1),
            tenant_id: section.tenant_id,
            top_k: section.top_k,
            include_sources: section.include_sources,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
        }
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions::default()
            .with_concurrency(self.scheduler.concurrency)
            .with_grace_period(Duration::from_secs(self.scheduler.grace_period_secs))
            .with_deadline(self.scheduler.deadline_secs.map(Duration::from_secs))
    }

    pub fn gate_table(&self) -> GateTable {
        GateTable {
            phases: self.phases.clone(),
        }
    }
}
