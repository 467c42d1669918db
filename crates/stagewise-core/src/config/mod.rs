//! Configuration management with file persistence and hot reload
//!
//! Every numeric threshold the routing layer uses lives here. Tenants (and
//! tasks within a tenant) may override the budget ceiling, quality-gate
//! thresholds and bandit behaviour. A [`ConfigHandle`] shares the live config
//! between components and can swap it at runtime.

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::gate::GateThresholds;
use crate::ledger::RewardWeights;
use crate::routing::SelectionMode;

/// Upper bound on any breaker cooldown
pub const MAX_COOLDOWN_SECS: u64 = 30 * 24 * 60 * 60;

/// Stagewise configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub routing: RoutingConfig,
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub budget: BudgetConfig,
    pub gate: GateConfig,
    pub ledger: LedgerConfig,
    /// Per-tenant overrides keyed by tenant id
    pub tenants: BTreeMap<String, TenantOverrides>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub selection_mode: SelectionMode,
    /// Number of selections per (tenant, task) that explore uniformly
    pub cold_start_window: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            selection_mode: SelectionMode::Thompson,
            cold_start_window: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub similarity_threshold: f32,
    pub max_entries: usize,
    pub default_ttl_secs: u64,
    /// Hit count at which an entry survives the next eviction cycle
    pub promotion_threshold: u64,
    /// Write entries through to the durable store
    pub write_through: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.92,
            max_entries: 10_000,
            default_ttl_secs: 3600,
            promotion_threshold: 5,
            write_through: false,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub failure_window_secs: u64,
    pub cooldown_secs: u64,
    pub max_cooldown_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_concurrency_per_backend: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: 60,
            cooldown_secs: 30,
            max_cooldown_secs: 600,
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            max_concurrency_per_backend: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Ceiling applied to tenants without an override
    pub default_ceiling: f64,
    /// Rolling window over which committed spend counts
    pub window_secs: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_ceiling: 10.0,
            window_secs: 86_400,
        }
    }
}

impl BudgetConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub confidence_threshold: f64,
    pub min_stages: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.80,
            min_stages: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub flush_interval_ms: u64,
    /// Dirty-key count that triggers an early flush
    pub flush_batch_size: usize,
    pub max_backoff_ms: u64,
    pub reward_weights: RewardWeights,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1_000,
            flush_batch_size: 64,
            max_backoff_ms: 30_000,
            reward_weights: RewardWeights::default(),
        }
    }
}

/// Overrides for a single tenant
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantOverrides {
    pub budget_ceiling: Option<f64>,
    pub confidence_threshold: Option<f64>,
    pub min_stages: Option<usize>,
    pub cold_start_window: Option<u64>,
    pub selection_mode: Option<SelectionMode>,
    /// Task-level overrides, taking precedence over the tenant's own
    pub tasks: BTreeMap<String, TaskOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOverrides {
    pub confidence_threshold: Option<f64>,
    pub min_stages: Option<usize>,
    pub cold_start_window: Option<u64>,
    pub selection_mode: Option<SelectionMode>,
}

/// Effective settings for one (tenant, task) after applying overrides
#[derive(Debug, Clone, PartialEq)]
pub struct TenantSettings {
    pub budget_ceiling: f64,
    pub gate: GateThresholds,
    pub cold_start_window: u64,
    pub selection_mode: SelectionMode,
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("STAGEWISE_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("stagewise")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default path, or defaults if absent
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file, or defaults if absent
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Save configuration to the default path
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        check_unit("cache.similarity_threshold", self.cache.similarity_threshold as f64)?;
        if self.cache.similarity_threshold <= 0.0 {
            return Err(anyhow!("cache.similarity_threshold must be greater than 0.0"));
        }
        if self.cache.max_entries == 0 {
            return Err(anyhow!("cache.max_entries must be at least 1"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(anyhow!("breaker.failure_threshold must be at least 1"));
        }
        if self.breaker.max_attempts == 0 {
            return Err(anyhow!("breaker.max_attempts must be at least 1"));
        }
        if self.breaker.max_concurrency_per_backend == 0 {
            return Err(anyhow!("breaker.max_concurrency_per_backend must be at least 1"));
        }
        if self.breaker.max_cooldown_secs < self.breaker.cooldown_secs {
            return Err(anyhow!("breaker.max_cooldown_secs must be >= breaker.cooldown_secs"));
        }
        if self.breaker.max_cooldown_secs > MAX_COOLDOWN_SECS {
            return Err(anyhow!(
                "breaker.max_cooldown_secs must be at most {} (30 days)",
                MAX_COOLDOWN_SECS
            ));
        }
        check_ceiling("budget.default_ceiling", self.budget.default_ceiling)?;
        if self.budget.window_secs == 0 {
            return Err(anyhow!("budget.window_secs must be greater than 0"));
        }
        check_unit("gate.confidence_threshold", self.gate.confidence_threshold)?;
        if self.gate.min_stages == 0 {
            return Err(anyhow!("gate.min_stages must be at least 1"));
        }
        self.ledger.reward_weights.validate()?;

        for (tenant, overrides) in &self.tenants {
            if let Some(ceiling) = overrides.budget_ceiling {
                check_ceiling(&format!("tenants.{tenant}.budget_ceiling"), ceiling)?;
            }
            if let Some(threshold) = overrides.confidence_threshold {
                check_unit(&format!("tenants.{tenant}.confidence_threshold"), threshold)?;
            }
            if overrides.min_stages == Some(0) {
                return Err(anyhow!("tenants.{tenant}.min_stages must be at least 1"));
            }
            for (task, task_overrides) in &overrides.tasks {
                if let Some(threshold) = task_overrides.confidence_threshold {
                    check_unit(
                        &format!("tenants.{tenant}.tasks.{task}.confidence_threshold"),
                        threshold,
                    )?;
                }
                if task_overrides.min_stages == Some(0) {
                    return Err(anyhow!("tenants.{tenant}.tasks.{task}.min_stages must be at least 1"));
                }
            }
        }

        Ok(())
    }

    /// Resolve the effective settings for a (tenant, task) pair
    ///
    /// Task overrides win over tenant overrides, which win over the globals.
    pub fn resolve(&self, tenant: &str, task: &str) -> TenantSettings {
        let tenant_overrides = self.tenants.get(tenant);
        let task_overrides = tenant_overrides.and_then(|t| t.tasks.get(task));

        let confidence_threshold = task_overrides
            .and_then(|t| t.confidence_threshold)
            .or_else(|| tenant_overrides.and_then(|t| t.confidence_threshold))
            .unwrap_or(self.gate.confidence_threshold);
        let min_stages = task_overrides
            .and_then(|t| t.min_stages)
            .or_else(|| tenant_overrides.and_then(|t| t.min_stages))
            .unwrap_or(self.gate.min_stages);
        let cold_start_window = task_overrides
            .and_then(|t| t.cold_start_window)
            .or_else(|| tenant_overrides.and_then(|t| t.cold_start_window))
            .unwrap_or(self.routing.cold_start_window);
        let selection_mode = task_overrides
            .and_then(|t| t.selection_mode)
            .or_else(|| tenant_overrides.and_then(|t| t.selection_mode))
            .unwrap_or(self.routing.selection_mode);

        TenantSettings {
            budget_ceiling: self.budget_ceiling(tenant),
            gate: GateThresholds::new(confidence_threshold, min_stages),
            cold_start_window,
            selection_mode,
        }
    }

    /// Budget ceiling for a tenant
    pub fn budget_ceiling(&self, tenant: &str) -> f64 {
        self.tenants
            .get(tenant)
            .and_then(|t| t.budget_ceiling)
            .unwrap_or(self.budget.default_ceiling)
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        if let Some((tenant, field)) = tenant_key(key) {
            let overrides = self.tenants.get(tenant);
            let value = match field {
                "budget_ceiling" => overrides.and_then(|t| t.budget_ceiling).map(|v| v.to_string()),
                "confidence_threshold" => overrides
                    .and_then(|t| t.confidence_threshold)
                    .map(|v| v.to_string()),
                "min_stages" => overrides.and_then(|t| t.min_stages).map(|v| v.to_string()),
                "cold_start_window" => overrides
                    .and_then(|t| t.cold_start_window)
                    .map(|v| v.to_string()),
                "selection_mode" => overrides
                    .and_then(|t| t.selection_mode)
                    .map(|v| v.to_string()),
                _ => return Err(unknown_key(key)),
            };
            return Ok(value.unwrap_or_else(|| "(inherited)".to_string()));
        }

        match key {
            "routing.selection_mode" => Ok(self.routing.selection_mode.to_string()),
            "routing.cold_start_window" => Ok(self.routing.cold_start_window.to_string()),

            "cache.similarity_threshold" => Ok(self.cache.similarity_threshold.to_string()),
            "cache.max_entries" => Ok(self.cache.max_entries.to_string()),
            "cache.default_ttl_secs" => Ok(self.cache.default_ttl_secs.to_string()),
            "cache.promotion_threshold" => Ok(self.cache.promotion_threshold.to_string()),
            "cache.write_through" => Ok(self.cache.write_through.to_string()),

            "breaker.failure_threshold" => Ok(self.breaker.failure_threshold.to_string()),
            "breaker.failure_window_secs" => Ok(self.breaker.failure_window_secs.to_string()),
            "breaker.cooldown_secs" => Ok(self.breaker.cooldown_secs.to_string()),
            "breaker.max_cooldown_secs" => Ok(self.breaker.max_cooldown_secs.to_string()),
            "breaker.max_attempts" => Ok(self.breaker.max_attempts.to_string()),
            "breaker.base_delay_ms" => Ok(self.breaker.base_delay_ms.to_string()),
            "breaker.max_delay_ms" => Ok(self.breaker.max_delay_ms.to_string()),
            "breaker.max_concurrency_per_backend" => {
                Ok(self.breaker.max_concurrency_per_backend.to_string())
            }

            "budget.default_ceiling" => Ok(self.budget.default_ceiling.to_string()),
            "budget.window_secs" => Ok(self.budget.window_secs.to_string()),

            "gate.confidence_threshold" => Ok(self.gate.confidence_threshold.to_string()),
            "gate.min_stages" => Ok(self.gate.min_stages.to_string()),

            "ledger.flush_interval_ms" => Ok(self.ledger.flush_interval_ms.to_string()),
            "ledger.flush_batch_size" => Ok(self.ledger.flush_batch_size.to_string()),
            "ledger.max_backoff_ms" => Ok(self.ledger.max_backoff_ms.to_string()),

            _ => Err(unknown_key(key)),
        }
    }

    /// Set a configuration value by key
    ///
    /// The whole config is re-validated afterwards; on failure the previous
    /// value is restored.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let previous = self.clone();
        if let Err(err) = self.set_unchecked(key, value).and_then(|_| self.validate()) {
            *self = previous;
            return Err(err);
        }
        Ok(())
    }

    fn set_unchecked(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        if let Some((tenant, field)) = tenant_key(key) {
            let overrides = self.tenants.entry(tenant.to_string()).or_default();
            match field {
                "budget_ceiling" => overrides.budget_ceiling = Some(parse(key, value)?),
                "confidence_threshold" => overrides.confidence_threshold = Some(parse(key, value)?),
                "min_stages" => overrides.min_stages = Some(parse(key, value)?),
                "cold_start_window" => overrides.cold_start_window = Some(parse(key, value)?),
                "selection_mode" => overrides.selection_mode = Some(parse_mode(value)?),
                _ => return Err(unknown_key(key)),
            }
            return Ok(());
        }

        match key {
            "routing.selection_mode" => self.routing.selection_mode = parse_mode(value)?,
            "routing.cold_start_window" => self.routing.cold_start_window = parse(key, value)?,

            "cache.similarity_threshold" => self.cache.similarity_threshold = parse(key, value)?,
            "cache.max_entries" => self.cache.max_entries = parse(key, value)?,
            "cache.default_ttl_secs" => self.cache.default_ttl_secs = parse(key, value)?,
            "cache.promotion_threshold" => self.cache.promotion_threshold = parse(key, value)?,
            "cache.write_through" => self.cache.write_through = parse(key, value)?,

            "breaker.failure_threshold" => self.breaker.failure_threshold = parse(key, value)?,
            "breaker.failure_window_secs" => self.breaker.failure_window_secs = parse(key, value)?,
            "breaker.cooldown_secs" => self.breaker.cooldown_secs = parse(key, value)?,
            "breaker.max_cooldown_secs" => self.breaker.max_cooldown_secs = parse(key, value)?,
            "breaker.max_attempts" => self.breaker.max_attempts = parse(key, value)?,
            "breaker.base_delay_ms" => self.breaker.base_delay_ms = parse(key, value)?,
            "breaker.max_delay_ms" => self.breaker.max_delay_ms = parse(key, value)?,
            "breaker.max_concurrency_per_backend" => {
                self.breaker.max_concurrency_per_backend = parse(key, value)?
            }

            "budget.default_ceiling" => self.budget.default_ceiling = parse(key, value)?,
            "budget.window_secs" => self.budget.window_secs = parse(key, value)?,

            "gate.confidence_threshold" => self.gate.confidence_threshold = parse(key, value)?,
            "gate.min_stages" => self.gate.min_stages = parse(key, value)?,

            "ledger.flush_interval_ms" => self.ledger.flush_interval_ms = parse(key, value)?,
            "ledger.flush_batch_size" => self.ledger.flush_batch_size = parse(key, value)?,
            "ledger.max_backoff_ms" => self.ledger.max_backoff_ms = parse(key, value)?,

            _ => return Err(unknown_key(key)),
        }
        Ok(())
    }

    /// List all global configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let mut keys: Vec<String> = GLOBAL_KEYS.iter().map(|k| k.to_string()).collect();
        for tenant in self.tenants.keys() {
            for field in TENANT_FIELDS {
                keys.push(format!("tenants.{tenant}.{field}"));
            }
        }

        keys.into_iter()
            .map(|key| {
                let value = self.get(&key)?;
                Ok((key, value))
            })
            .collect()
    }

    /// Reset configuration to defaults by removing the file
    pub fn reset() -> anyhow::Result<()> {
        Self::reset_at(&Self::config_path()?)
    }

    /// Remove a specific config file so defaults apply again
    pub fn reset_at(path: &Path) -> anyhow::Result<()> {
        if path.exists() {
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

const GLOBAL_KEYS: [&str; 22] = [
    "routing.selection_mode",
    "routing.cold_start_window",
    "cache.similarity_threshold",
    "cache.max_entries",
    "cache.default_ttl_secs",
    "cache.promotion_threshold",
    "cache.write_through",
    "breaker.failure_threshold",
    "breaker.failure_window_secs",
    "breaker.cooldown_secs",
    "breaker.max_cooldown_secs",
    "breaker.max_attempts",
    "breaker.base_delay_ms",
    "breaker.max_delay_ms",
    "breaker.max_concurrency_per_backend",
    "budget.default_ceiling",
    "budget.window_secs",
    "gate.confidence_threshold",
    "gate.min_stages",
    "ledger.flush_interval_ms",
    "ledger.flush_batch_size",
    "ledger.max_backoff_ms",
];

const TENANT_FIELDS: [&str; 5] = [
    "budget_ceiling",
    "confidence_threshold",
    "min_stages",
    "cold_start_window",
    "selection_mode",
];

/// Split `tenants.<id>.<field>` into its parts
fn tenant_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix("tenants.")?;
    let (tenant, field) = rest.rsplit_once('.')?;
    if tenant.is_empty() {
        return None;
    }
    Some((tenant, field))
}

fn unknown_key(key: &str) -> anyhow::Error {
    anyhow!(
        "Unknown configuration key: {}. Use `stagewise config list` to see available keys.",
        key
    )
}

fn parse<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {}", key, value))
}

fn parse_mode(value: &str) -> anyhow::Result<SelectionMode> {
    value.parse().map_err(|e: String| anyhow!(e))
}

fn check_unit(name: &str, value: f64) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be between 0.0 and 1.0", name));
    }
    Ok(())
}

fn check_ceiling(name: &str, value: f64) -> anyhow::Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(anyhow!("{} must be a non-negative finite amount", name));
    }
    Ok(())
}

/// Shared, hot-swappable configuration
///
/// Readers take a cheap `Arc` snapshot; writers validate and swap the whole
/// config, so a reader never observes a half-applied update.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<Config>>>,
    source: Option<PathBuf>,
}

impl ConfigHandle {
    /// Wrap an in-memory config
    pub fn new(config: Config) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            source: None,
        }
    }

    /// Load from a file and remember it for [`ConfigHandle::reload`]
    pub fn from_file(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let config = Config::load_from(&path)?;
        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            source: Some(path),
        })
    }

    /// Current config snapshot
    pub fn snapshot(&self) -> Arc<Config> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Validate and swap in a new config
    pub fn replace(&self, config: Config) -> anyhow::Result<()> {
        config.validate()?;
        let next = Arc::new(config);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        tracing::info!("Configuration replaced");
        Ok(())
    }

    /// Apply a change to a copy of the current config and swap it in
    pub fn update<F>(&self, change: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Config) -> anyhow::Result<()>,
    {
        let mut next = (*self.snapshot()).clone();
        change(&mut next)?;
        self.replace(next)
    }

    /// Re-read the backing file, keeping the current config if it is invalid
    pub fn reload(&self) -> anyhow::Result<()> {
        let path = self
            .source
            .as_ref()
            .ok_or_else(|| anyhow!("Configuration was not loaded from a file"))?;
        let config = Config::load_from(path)?;
        self.replace(config)?;
        tracing::info!(path = %path.display(), "Configuration reloaded");
        Ok(())
    }

    /// Effective settings for a (tenant, task) pair under the current config
    pub fn resolve(&self, tenant: &str, task: &str) -> TenantSettings {
        self.snapshot().resolve(tenant, task)
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
