//! Configuration document loading and validation
//!
//! The whole pipeline core is driven by one versioned TOML document that
//! declares sources, fallback chains, scoring penalties, tracker, run-log and
//! alerting settings. It is loaded once at startup into an immutable
//! [`StatlineConfig`] and handed to each component by reference.
//!
//! Path resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. `STATLINE_CONFIG` environment variable
//! 3. `<platform config dir>/statline/config.toml`

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Only document version this build understands
pub const CONFIG_VERSION: u32 = 1;

/// Environment variable consulted when no `--config` is given
pub const CONFIG_ENV_VAR: &str = "STATLINE_CONFIG";

/// Root configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatlineConfig {
    pub version: u32,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub run_log: RunLogConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One upstream data provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    /// Reliability weight, 0-100
    pub weight: u8,
    #[serde(default = "default_tier_label")]
    pub tier: String,
    /// Fields this source is declared to provide
    #[serde(default)]
    pub fields: Vec<String>,
    /// Per-source override of `resolver.extractor_timeout_ms`
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_tier_label() -> String {
    "standard".to_string()
}

/// Ordered preference list for one logical data need
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    /// Source ids in resolution order
    pub sources: Vec<String>,
    pub exhaustion: ExhaustionPolicy,
}

/// What happens when every source in a chain fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    Skip,
    Fail,
    Placeholder,
    ContinueWithPenalty { penalty: u8 },
}

impl ExhaustionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExhaustionPolicy::Skip => "skip",
            ExhaustionPolicy::Fail => "fail",
            ExhaustionPolicy::Placeholder => "placeholder",
            ExhaustionPolicy::ContinueWithPenalty { .. } => "continue_with_penalty",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Mandatory per-extractor timeout; an extractor exceeding it is a soft failure
    pub extractor_timeout_ms: u64,
}

impl ResolverConfig {
    pub fn extractor_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.extractor_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub placeholder_baseline: u8,
    #[serde(default)]
    pub degraded_baseline: u8,
    #[serde(default = "default_issue_penalty")]
    pub default_issue_penalty: u8,
    /// Issue code -> score penalty
    #[serde(default)]
    pub issue_penalties: BTreeMap<String, u8>,
}

fn default_issue_penalty() -> u8 {
    5
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            placeholder_baseline: 0,
            degraded_baseline: 0,
            default_issue_penalty: default_issue_penalty(),
            issue_penalties: BTreeMap::new(),
        }
    }
}

impl ScoringConfig {
    /// Penalty charged for one issue string (`code` or `code:detail`)
    pub fn penalty_for(&self, issue: &str) -> u8 {
        let code = issue_code(issue);
        self.issue_penalties
            .get(code)
            .copied()
            .unwrap_or(self.default_issue_penalty)
    }
}

/// Upper bound for minute-valued durations (one year)
pub const MAX_DURATION_MINUTES: u64 = 365 * 24 * 60;

/// Lookup key of an issue string: everything before the first `:`
pub fn issue_code(issue: &str) -> &str {
    issue.split(':').next().unwrap_or(issue).trim()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_staleness_minutes")]
    pub staleness_threshold_minutes: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_staleness_minutes() -> u64 {
    120
}

fn default_history_limit() -> usize {
    20
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_minutes: default_staleness_minutes(),
            history_limit: default_history_limit(),
        }
    }
}

impl TrackerConfig {
    pub fn staleness_threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.staleness_threshold_minutes.min(MAX_DURATION_MINUTES) as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunLogBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogConfig {
    #[serde(default)]
    pub backend: RunLogBackend,
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    #[serde(default = "default_max_lock_wait_ms")]
    pub max_lock_wait_ms: u64,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("statline-runs.db")
}

fn default_max_lock_wait_ms() -> u64 {
    5000
}

impl Default for RunLogConfig {
    fn default() -> Self {
        Self {
            backend: RunLogBackend::default(),
            database: default_database_path(),
            max_lock_wait_ms: default_max_lock_wait_ms(),
        }
    }
}

/// Alert severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_max_per_window")]
    pub max_per_window: u32,
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u64,
    /// In bulk mode, alerts below this severity are always batched
    #[serde(default = "default_bulk_min_severity")]
    pub bulk_min_severity: Severity,
    /// Samples kept per category for the flush summary
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Per-request timeout for webhook delivery
    #[serde(default = "default_webhook_timeout_ms")]
    pub webhook_timeout_ms: u64,
}

fn default_max_per_window() -> u32 {
    5
}

fn default_window_minutes() -> u64 {
    60
}

fn default_bulk_min_severity() -> Severity {
    Severity::Error
}

fn default_sample_size() -> usize {
    3
}

fn default_webhook_timeout_ms() -> u64 {
    5000
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            max_per_window: default_max_per_window(),
            window_minutes: default_window_minutes(),
            bulk_min_severity: default_bulk_min_severity(),
            sample_size: default_sample_size(),
            webhook_url: None,
            webhook_timeout_ms: default_webhook_timeout_ms(),
        }
    }
}

impl AlertsConfig {
    pub fn webhook_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.webhook_timeout_ms)
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.window_minutes.min(MAX_DURATION_MINUTES) as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl StatlineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: StatlineConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        if self.version != CONFIG_VERSION {
            return Err(Error::Config(format!(
                "version: unsupported config version {} (expected {})",
                self.version, CONFIG_VERSION
            )));
        }

        if self.resolver.extractor_timeout_ms == 0 {
            return Err(Error::Config(
                "resolver.extractor_timeout_ms must be > 0".to_string(),
            ));
        }

        check_minutes(
            "tracker.staleness_threshold_minutes",
            self.tracker.staleness_threshold_minutes,
        )?;

        if self.alerts.max_per_window == 0 {
            return Err(Error::Config("alerts.max_per_window must be > 0".to_string()));
        }
        check_minutes("alerts.window_minutes", self.alerts.window_minutes)?;
        if self.alerts.webhook_timeout_ms == 0 {
            return Err(Error::Config("alerts.webhook_timeout_ms must be > 0".to_string()));
        }

        check_percent("scoring.placeholder_baseline", self.scoring.placeholder_baseline)?;
        check_percent("scoring.degraded_baseline", self.scoring.degraded_baseline)?;
        check_percent("scoring.default_issue_penalty", self.scoring.default_issue_penalty)?;
        for (code, penalty) in &self.scoring.issue_penalties {
            check_percent(&format!("scoring.issue_penalties.{}", code), *penalty)?;
        }

        validate_catalog(&self.sources, &self.chains)
    }
}

fn check_minutes(field: &str, value: u64) -> Result<()> {
    if value == 0 || value > MAX_DURATION_MINUTES {
        return Err(Error::Config(format!(
            "{} must be between 1 and {} (got {})",
            field, MAX_DURATION_MINUTES, value
        )));
    }
    Ok(())
}

/// Structural checks over sources and chains
///
/// Shared by config loading and catalog construction.
pub fn validate_catalog(sources: &[SourceConfig], chains: &[ChainConfig]) -> Result<()> {
    let mut source_ids = HashSet::new();
    for source in sources {
        if source.id.trim().is_empty() {
            return Err(Error::Config("sources: source id must not be empty".to_string()));
        }
        if !source_ids.insert(source.id.as_str()) {
            return Err(Error::Config(format!("sources: duplicate source id '{}'", source.id)));
        }
        check_percent(&format!("sources.{}.weight", source.id), source.weight)?;
        if source.timeout_ms == Some(0) {
            return Err(Error::Config(format!(
                "sources.{}.timeout_ms must be > 0",
                source.id
            )));
        }
    }

    let mut chain_names = HashSet::new();
    for chain in chains {
        if !chain_names.insert(chain.name.as_str()) {
            return Err(Error::Config(format!("chains: duplicate chain name '{}'", chain.name)));
        }
        if chain.sources.is_empty() {
            return Err(Error::Config(format!(
                "chains.{}: chain must list at least one source",
                chain.name
            )));
        }

        let mut seen = HashSet::new();
        for id in &chain.sources {
            if !source_ids.contains(id.as_str()) {
                return Err(Error::Config(format!(
                    "chains.{}: unknown source '{}'",
                    chain.name, id
                )));
            }
            if !seen.insert(id.as_str()) {
                return Err(Error::Config(format!(
                    "chains.{}: source '{}' listed more than once",
                    chain.name, id
                )));
            }
        }

        if let ExhaustionPolicy::ContinueWithPenalty { penalty } = chain.exhaustion {
            check_percent(&format!("chains.{}.exhaustion.penalty", chain.name), penalty)?;
        }
    }

    Ok(())
}

fn check_percent(key: &str, value: u8) -> Result<()> {
    if value > 100 {
        return Err(Error::Config(format!("{} must be in [0, 100], got {}", key, value)));
    }
    Ok(())
}

/// Read, parse and validate the config file at `path`
pub fn load_config(path: &Path) -> Result<StatlineConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    let config = StatlineConfig::from_toml_str(&content)?;

    tracing::info!(
        path = %path.display(),
        sources = config.sources.len(),
        chains = config.chains.len(),
        "Configuration loaded"
    );

    Ok(config)
}

/// Resolve which config file to load (CLI → ENV → platform default)
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Result<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Ok(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config directory
    let default_path = dirs::config_dir()
        .map(|d| d.join("statline").join("config.toml"))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;

    if default_path.exists() {
        Ok(default_path)
    } else {
        Err(Error::Config(format!(
            "No config file given and none found at {}",
            default_path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
version = 1

[resolver]
extractor_timeout_ms = 2000

[[sources]]
id = "nbac"
weight = 100

[[chains]]
name = "team_boxscores"
sources = ["nbac"]
exhaustion = { policy = "skip" }
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = StatlineConfig::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.tracker.staleness_threshold_minutes, 120);
        assert_eq!(config.alerts.max_per_window, 5);
        assert_eq!(config.alerts.window_minutes, 60);
        assert_eq!(config.alerts.bulk_min_severity, Severity::Error);
        assert_eq!(config.scoring.placeholder_baseline, 0);
        assert_eq!(config.run_log.backend, RunLogBackend::Sqlite);
        assert_eq!(config.sources[0].tier, "standard");
        assert_eq!(config.chains[0].exhaustion, ExhaustionPolicy::Skip);
    }

    #[test]
    fn test_penalty_policy_parses_with_value() {
        let doc = MINIMAL.replace(
            r#"exhaustion = { policy = "skip" }"#,
            r#"exhaustion = { policy = "continue_with_penalty", penalty = 15 }"#,
        );
        let config = StatlineConfig::from_toml_str(&doc).unwrap();
        assert_eq!(
            config.chains[0].exhaustion,
            ExhaustionPolicy::ContinueWithPenalty { penalty: 15 }
        );
    }

    #[test]
    fn test_missing_resolver_timeout_rejected() {
        let doc = MINIMAL.replace("[resolver]\nextractor_timeout_ms = 2000\n", "");
        assert!(StatlineConfig::from_toml_str(&doc).is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let doc = MINIMAL.replace("extractor_timeout_ms = 2000", "extractor_timeout_ms = 0");
        let err = StatlineConfig::from_toml_str(&doc).unwrap_err();
        assert!(err.to_string().contains("extractor_timeout_ms"));
    }

    #[test]
    fn test_oversized_staleness_threshold_rejected() {
        let doc = format!(
            "{}\n[tracker]\nstaleness_threshold_minutes = 200000000000000000\n",
            MINIMAL
        );
        let err = StatlineConfig::from_toml_str(&doc).unwrap_err();
        assert!(err.to_string().contains("tracker.staleness_threshold_minutes"));
    }

    #[test]
    fn test_oversized_alert_window_rejected() {
        let doc = format!("{}\n[alerts]\nwindow_minutes = 600000\n", MINIMAL);
        let err = StatlineConfig::from_toml_str(&doc).unwrap_err();
        assert!(err.to_string().contains("alerts.window_minutes"));
    }

    #[test]
    fn test_durations_saturate_instead_of_panicking() {
        let tracker = TrackerConfig {
            staleness_threshold_minutes: u64::MAX,
            ..Default::default()
        };
        assert_eq!(
            tracker.staleness_threshold(),
            chrono::Duration::minutes(MAX_DURATION_MINUTES as i64)
        );

        let alerts = AlertsConfig {
            window_minutes: u64::MAX,
            ..Default::default()
        };
        assert_eq!(alerts.window(), chrono::Duration::minutes(MAX_DURATION_MINUTES as i64));
    }

    #[test]
    fn test_weight_over_100_rejected() {
        let doc = MINIMAL.replace("weight = 100", "weight = 120");
        let err = StatlineConfig::from_toml_str(&doc).unwrap_err();
        assert!(err.to_string().contains("sources.nbac.weight"));
    }

    #[test]
    fn test_unknown_chain_source_rejected() {
        let doc = MINIMAL.replace(r#"sources = ["nbac"]"#, r#"sources = ["nbac", "espn"]"#);
        let err = StatlineConfig::from_toml_str(&doc).unwrap_err();
        assert!(err.to_string().contains("unknown source 'espn'"));
    }

    #[test]
    fn test_empty_chain_rejected() {
        let doc = MINIMAL.replace(r#"sources = ["nbac"]"#, "sources = []");
        assert!(StatlineConfig::from_toml_str(&doc).is_err());
    }

    #[test]
    fn test_wrong_version_rejected() {
        let doc = MINIMAL.replace("version = 1", "version = 2");
        let err = StatlineConfig::from_toml_str(&doc).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_issue_code_and_penalty_lookup() {
        let mut scoring = ScoringConfig::default();
        scoring.issue_penalties.insert("estimated_possessions".to_string(), 10);

        assert_eq!(issue_code("missing_field:plus_minus"), "missing_field");
        assert_eq!(issue_code("estimated_possessions"), "estimated_possessions");
        assert_eq!(scoring.penalty_for("estimated_possessions"), 10);
        assert_eq!(scoring.penalty_for("estimated_possessions:q4"), 10);
        assert_eq!(scoring.penalty_for("something_else"), 5);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }
}
