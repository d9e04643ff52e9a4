use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model_tier::ColdStartRule;
use taskbroker_db::models::ModelTier;

/// Broker configuration, resolved in priority order: CLI flag > env var >
/// config file > built-in default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub database_url: String,
    pub bind_addr: String,
    pub admin_token: String,
    pub event_bus_url: Option<String>,
    pub persona_directory_url: Option<String>,
    pub device_directory_url: Option<String>,
    pub agent_runtime_url: Option<String>,
    pub agent_runtime_token: Option<String>,
    pub tick_interval_ms: u64,
    pub timeout_check_interval_ms: u64,
    pub wake_timeout_ms: u64,
    pub drain_deadline_secs: u64,
    pub assignment_batch_size: i64,
    pub max_concurrent_per_agent: i64,
    pub owner_filter_enabled: bool,
    pub fast_path_enabled: bool,
    pub pareto_enabled: bool,
    #[serde(default)]
    pub weights: ScoringWeights,
    #[serde(default)]
    pub model_routing: ModelRoutingConfig,
}

/// The weight table used by the 11-factor assignment scoring engine.
/// Validated at startup so a bad config file fails fast rather than
/// silently skewing every score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub capability: f32,
    pub availability: f32,
    pub risk_fit: f32,
    pub cost_efficiency: f32,
    pub verifiability: f32,
    pub reversibility: f32,
    pub complexity_fit: f32,
    pub uncertainty_fit: f32,
    pub duration_fit: f32,
    pub contextuality: f32,
    pub subjectivity: f32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            capability: 0.20,
            availability: 0.10,
            risk_fit: 0.12,
            cost_efficiency: 0.10,
            verifiability: 0.08,
            reversibility: 0.08,
            complexity_fit: 0.10,
            uncertainty_fit: 0.07,
            duration_fit: 0.05,
            contextuality: 0.05,
            subjectivity: 0.05,
        }
    }
}

impl ScoringWeights {
    fn all(&self) -> [f32; 11] {
        [
            self.capability,
            self.availability,
            self.risk_fit,
            self.cost_efficiency,
            self.verifiability,
            self.reversibility,
            self.complexity_fit,
            self.uncertainty_fit,
            self.duration_fit,
            self.contextuality,
            self.subjectivity,
        ]
    }

    fn validate(&self) -> Result<()> {
        let all = self.all();
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            anyhow::bail!("scoring weights must be finite and non-negative, got {all:?}");
        }
        let sum: f32 = all.iter().sum();
        if (sum - 1.0).abs() > 0.001 {
            anyhow::bail!("scoring weights must sum to 1.0 (±0.001), got {sum}");
        }
        Ok(())
    }
}

/// Model-tier router configuration: whether routing runs at all, the
/// tier assigned when nothing else matches, and the ordered cold-start
/// rule list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoutingConfig {
    pub enabled: bool,
    pub default_tier: ModelTier,
    pub cold_start_rules: Vec<ColdStartRule>,
}

impl Default for ModelRoutingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_tier: ModelTier::Standard,
            cold_start_rules: Vec::new(),
        }
    }
}

impl BrokerConfig {
    pub fn config_path() -> PathBuf {
        if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("taskbroker").join("config.toml");
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("taskbroker")
            .join("config.toml")
    }

    /// Resolve configuration: CLI overrides win over environment, which
    /// wins over the on-disk config file, which wins over defaults.
    pub fn resolve(database_url_flag: Option<String>, bind_addr_flag: Option<String>) -> Result<Self> {
        let mut config = Self::from_file(&Self::config_path()).unwrap_or_else(|_| Self::default());

        if let Ok(url) = env::var("TASKBROKER_DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(addr) = env::var("TASKBROKER_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(token) = env::var("TASKBROKER_ADMIN_TOKEN") {
            config.admin_token = token;
        }
        if let Ok(url) = env::var("TASKBROKER_EVENT_BUS_URL") {
            config.event_bus_url = Some(url);
        }

        if let Some(url) = database_url_flag {
            config.database_url = url;
        }
        if let Some(addr) = bind_addr_flag {
            config.bind_addr = addr;
        }

        config.weights.validate().context("invalid scoring weight table")?;

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file at {}", path.display()))
    }

    /// Persist the config to disk with owner-only permissions, mirroring
    /// the discipline used for any file holding a bearer secret.
    #[cfg(unix)]
    pub fn save(&self, path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config dir {}", parent.display()))?;
        }
        let serialized = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, serialized)
            .with_context(|| format!("failed to write config file at {}", path.display()))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            database_url: taskbroker_db::DbConfig::DEFAULT_URL.to_owned(),
            bind_addr: "0.0.0.0:8600".to_owned(),
            admin_token: String::new(),
            event_bus_url: None,
            persona_directory_url: None,
            device_directory_url: None,
            agent_runtime_url: None,
            agent_runtime_token: None,
            tick_interval_ms: 5_000,
            timeout_check_interval_ms: 5_000,
            wake_timeout_ms: 30_000,
            drain_deadline_secs: 10,
            assignment_batch_size: 10,
            max_concurrent_per_agent: 3,
            owner_filter_enabled: true,
            fast_path_enabled: true,
            pareto_enabled: false,
            weights: ScoringWeights::default(),
            model_routing: ModelRoutingConfig::default(),
        }
    }
}
