//! Settings loaded from `research.toml`.
//!
//! Every field has a default; environment variables take precedence over the
//! file. [`ResearchConfig::validate`] rejects settings no run can work with.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::batch::BatchSettings;
use crate::error::{ResearchError, Result};
use crate::model::{RetryPolicy, RoleContext};
use crate::poller::PollSettings;
use crate::session_store::BackupPolicy;

pub const CONFIG_FILE: &str = "research.toml";

/// One `[roles.<name>]` table.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RoleConfig {
    /// Agent for this role; the top-level `agent_id` when absent.
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub focus: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    /// Base URL of the job service API.
    pub endpoint: String,
    pub api_key: String,
    /// Agent used by batch, interactive and chat runs.
    pub agent_id: String,
    /// Agent that writes product analysis reports; `agent_id` when unset.
    pub analysis_agent_id: Option<String>,

    pub batch_timeout_secs: u64,
    pub interactive_session_timeout_secs: u64,
    pub interactive_question_timeout_secs: u64,
    pub chat_timeout_secs: u64,

    pub poll_interval_ms: u64,
    pub max_poll_failures: u32,
    pub max_retries: u32,
    pub base_delay_ms: u64,

    /// Directory holding the session map and its backups.
    pub session_dir: PathBuf,
    pub save_interval_secs: u64,
    pub backup_probability: f64,
    pub backup_retention: usize,

    pub roles: BTreeMap<String, RoleConfig>,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            agent_id: String::new(),
            analysis_agent_id: None,
            batch_timeout_secs: 300,
            interactive_session_timeout_secs: 1800,
            interactive_question_timeout_secs: 300,
            chat_timeout_secs: 600,
            poll_interval_ms: 1000,
            max_poll_failures: 3,
            max_retries: 2,
            base_delay_ms: 500,
            session_dir: PathBuf::from("agent_config"),
            save_interval_secs: 600,
            backup_probability: 0.2,
            backup_retention: 10,
            roles: BTreeMap::new(),
        }
    }
}

fn default_roles() -> Vec<(&'static str, &'static str)> {
    vec![
        (
            "all_attributes",
            "Find ALL available information: product details (title, brand, SKU), \
             full ingredient list, nutrition facts, package sizes and variants, \
             customer reviews and ratings, certifications, pricing and any other \
             relevant attributes. Be exhaustive and cite sources for each piece of information.",
        ),
        (
            "ingredients",
            "Find ONLY the complete ingredient list, the brand name, the product title \
             and the source URLs for the ingredient information. \
             Focus exclusively on ingredients and basic product identification.",
        ),
        (
            "nutrition",
            "Find ONLY nutrition information: nutrition facts (calories, protein, fat, \
             carbohydrates), vitamins and minerals, guaranteed analysis, nutrition claims \
             or certifications, and source URLs for all nutrition data.",
        ),
        (
            "reviews",
            "Find ONLY customer review information: overall rating, number of reviews, \
             key positive and negative feedback themes, representative excerpts and \
             links to review pages.",
        ),
    ]
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| ResearchError::Config(format!("{name} must be a whole number, got '{raw}'")))
}

impl ResearchConfig {
    /// Loads `path`, or defaults when the file does not exist, then applies
    /// the process environment.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<ResearchConfig>(&contents)?
        } else {
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Loads `research.toml` from the working directory.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Overrides fields from `lookup`; empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("RESEARCH_ENDPOINT") {
            self.endpoint = v;
        }
        if let Some(v) = var("RESEARCH_API_KEY") {
            self.api_key = v;
        }
        if let Some(v) = var("RESEARCH_AGENT_ID") {
            self.agent_id = v;
        }
        if let Some(v) = var("RESEARCH_ANALYSIS_AGENT_ID") {
            self.analysis_agent_id = Some(v);
        }

        let timeouts = [
            ("BATCH_TIMEOUT_SECONDS", &mut self.batch_timeout_secs),
            ("INTERACTIVE_SESSION_TIMEOUT", &mut self.interactive_session_timeout_secs),
            ("INTERACTIVE_QUESTION_TIMEOUT", &mut self.interactive_question_timeout_secs),
            ("CHAT_TIMEOUT_SECONDS", &mut self.chat_timeout_secs),
        ];
        for (name, field) in timeouts {
            if let Some(v) = var(name) {
                *field = parse_env(name, &v)?;
            }
        }
        Ok(())
    }

    /// Errors that must stop the program before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(ResearchError::Config(
                "endpoint is not set (research.toml or RESEARCH_ENDPOINT)".into(),
            ));
        }
        if self.api_key.trim().is_empty() {
            return Err(ResearchError::Config(
                "api_key is not set (research.toml or RESEARCH_API_KEY)".into(),
            ));
        }
        for (name, value) in [
            ("batch_timeout_secs", self.batch_timeout_secs),
            ("interactive_session_timeout_secs", self.interactive_session_timeout_secs),
            ("interactive_question_timeout_secs", self.interactive_question_timeout_secs),
            ("chat_timeout_secs", self.chat_timeout_secs),
            ("poll_interval_ms", self.poll_interval_ms),
            ("save_interval_secs", self.save_interval_secs),
        ] {
            if value == 0 {
                return Err(ResearchError::Config(format!("{name} must be greater than zero")));
            }
        }
        if !(0.0..=1.0).contains(&self.backup_probability) {
            return Err(ResearchError::Config(format!(
                "backup_probability must be between 0 and 1, got {}",
                self.backup_probability
            )));
        }
        if self.backup_retention == 0 {
            return Err(ResearchError::Config("backup_retention must be at least 1".into()));
        }
        if self.agent_id.trim().is_empty() {
            if let Some((name, _)) = self.roles.iter().find(|(_, r)| r.agent.is_none()) {
                return Err(ResearchError::Config(format!(
                    "role '{name}' has no agent and agent_id is not set"
                )));
            }
        }
        Ok(())
    }

    /// The agent for single-agent runs; an error when unset.
    pub fn agent(&self) -> Result<&str> {
        if self.agent_id.trim().is_empty() {
            return Err(ResearchError::Config(
                "agent_id is not set (research.toml or RESEARCH_AGENT_ID)".into(),
            ));
        }
        Ok(&self.agent_id)
    }

    /// The agent for product analysis, falling back to [`Self::agent`].
    pub fn analysis_agent(&self) -> Result<&str> {
        match self.analysis_agent_id.as_deref().map(str::trim) {
            Some(agent) if !agent.is_empty() => Ok(agent),
            _ => self.agent(),
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            tick: Duration::from_millis(self.poll_interval_ms),
            max_poll_failures: self.max_poll_failures,
            ..PollSettings::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
            ..RetryPolicy::default()
        }
    }

    pub fn backup_policy(&self) -> BackupPolicy {
        BackupPolicy {
            probability: self.backup_probability,
            retention: self.backup_retention,
        }
    }

    pub fn batch_settings(&self, resume: bool, timeout_override: Option<u64>) -> BatchSettings {
        BatchSettings {
            timeout: Duration::from_secs(timeout_override.unwrap_or(self.batch_timeout_secs)),
            resume,
            retry: self.retry_policy(),
            poll: self.poll_settings(),
        }
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    /// Configured roles, or the built-in product research roles when the
    /// config defines none. Roles without an agent use `agent_id`.
    pub fn role_contexts(&self) -> Vec<RoleContext> {
        if self.roles.is_empty() {
            return default_roles()
                .into_iter()
                .map(|(name, focus)| RoleContext::new(name, &self.agent_id).with_focus(focus))
                .collect();
        }
        self.roles
            .iter()
            .map(|(name, role)| {
                let agent = role.agent.clone().unwrap_or_else(|| self.agent_id.clone());
                let context = RoleContext::new(name, agent);
                match &role.focus {
                    Some(focus) => context.with_focus(focus),
                    None => context,
                }
            })
            .collect()
    }
}
