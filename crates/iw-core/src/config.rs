//! Inventory configuration.
//!
//! Loaded from YAML (with `${VAR}` substitution) or from environment
//! variables. Every section has defaults, so an empty document is valid.

use crate::cache::{TtlPolicy, DEFAULT_L1_CAPACITY, DEFAULT_L1_TTL, DEFAULT_L2_TTL};
use crate::discovery::DiscoveryConfig;
use crate::scheduler::SchedulerConfig;
use iw_connectors::store::CACHE_CONTAINER;
use iw_policy::{Feature, RolloutConfig, RolloutStage};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
}

/// Cache sizing and retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1_ttl_secs: u64,
    pub l2_ttl_secs: u64,
    pub l1_capacity: usize,
    /// Extra per-type L2 retention, in seconds, on top of the built-in table.
    pub ttl_overrides: BTreeMap<String, u64>,
    /// L2 container name.
    pub container: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_ttl_secs: DEFAULT_L1_TTL.as_secs(),
            l2_ttl_secs: DEFAULT_L2_TTL.as_secs(),
            l1_capacity: DEFAULT_L1_CAPACITY,
            ttl_overrides: BTreeMap::new(),
            container: CACHE_CONTAINER.to_string(),
        }
    }
}

impl CacheConfig {
    pub fn ttl_policy(&self) -> TtlPolicy {
        self.ttl_overrides.iter().fold(
            TtlPolicy::new(
                Duration::from_secs(self.l1_ttl_secs),
                Duration::from_secs(self.l2_ttl_secs),
            ),
            |policy, (resource_type, secs)| {
                policy.with_override(resource_type, Duration::from_secs(*secs))
            },
        )
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// Subscription filled into tool parameters when none is supplied.
    pub subscription_id: Option<String>,
    /// Resource group used when a name lookup finds nothing.
    pub resource_group: Option<String>,
    pub cache: CacheConfig,
    pub rollout: RolloutConfig,
    pub scheduler: SchedulerConfig,
    pub discovery: DiscoveryConfig,
}

impl InventoryConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|name| env::var(name).ok())?;
        Ok(config)
    }

    /// Overrides fields from `AZURE_*` and `INVENTORY_*` variables resolved
    /// through `lookup`. Unset or empty variables leave fields untouched.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("AZURE_SUBSCRIPTION_ID") {
            self.subscription_id = Some(v);
        }
        if let Some(v) = get("AZURE_RESOURCE_GROUP") {
            self.resource_group = Some(v);
        }

        if let Some(v) = get("INVENTORY_ROLLOUT_STAGE") {
            let number: u8 = parse(&v, "INVENTORY_ROLLOUT_STAGE")?;
            self.rollout.stage = RolloutStage::new(number)
                .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        }
        for feature in Feature::ALL {
            let name = format!("INVENTORY_FEATURE_{}", feature.as_str().to_uppercase());
            if let Some(v) = get(&name) {
                self.rollout.overrides.insert(feature, parse_flag(&v, &name)?);
            }
        }
        if let Some(v) = get("INVENTORY_ERROR_RATE_THRESHOLD") {
            let threshold: f64 = parse(&v, "INVENTORY_ERROR_RATE_THRESHOLD")?;
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::InvalidValue(format!(
                    "INVENTORY_ERROR_RATE_THRESHOLD must be between 0 and 1, got {}",
                    threshold
                )));
            }
            self.rollout.error_rate_threshold = threshold;
        }

        if let Some(v) = get("INVENTORY_L1_TTL_SECS") {
            self.cache.l1_ttl_secs = parse(&v, "INVENTORY_L1_TTL_SECS")?;
        }
        if let Some(v) = get("INVENTORY_L2_TTL_SECS") {
            self.cache.l2_ttl_secs = parse(&v, "INVENTORY_L2_TTL_SECS")?;
        }
        if let Some(v) = get("INVENTORY_L1_CAPACITY") {
            self.cache.l1_capacity = parse(&v, "INVENTORY_L1_CAPACITY")?;
        }

        if let Some(v) = get("INVENTORY_FULL_REFRESH_SECS") {
            self.scheduler.full_refresh_secs = parse(&v, "INVENTORY_FULL_REFRESH_SECS")?;
        }
        if let Some(v) = get("INVENTORY_INCREMENTAL_REFRESH_SECS") {
            self.scheduler.incremental_refresh_secs =
                parse(&v, "INVENTORY_INCREMENTAL_REFRESH_SECS")?;
        }
        if let Some(v) = get("INVENTORY_MAX_CONCURRENT_SCANS") {
            self.scheduler.max_concurrent_scans = parse(&v, "INVENTORY_MAX_CONCURRENT_SCANS")?;
        }

        self.validate()
    }

    /// Checks values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.l1_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "cache.l1_capacity must be at least 1".to_string(),
            ));
        }
        if self.scheduler.max_concurrent_scans == 0 {
            return Err(ConfigError::InvalidValue(
                "scheduler.max_concurrent_scans must be at least 1".to_string(),
            ));
        }
        if self.discovery.page_size == 0 || self.discovery.max_pages == 0 {
            return Err(ConfigError::InvalidValue(
                "discovery.page_size and discovery.max_pages must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(value: &str, name: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| {
        ConfigError::InvalidValue(format!("{} has an invalid value: {}", name, value))
    })
}

fn parse_flag(value: &str, name: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue(format!(
            "{} must be true/false, got {}",
            name, value
        ))),
    }
}

fn env_var_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok())
        .as_ref()
}

/// Replaces `${VAR}` references using `lookup`. Every missing variable is
/// reported at once.
fn substitute_vars<F>(input: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(re) = env_var_pattern() else {
        return Ok(input.to_string());
    };
    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match lookup(name) {
            Some(value) => value,
            None => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::EnvVarNotFound(missing.join(", ")));
    }
    Ok(result.into_owned())
}

/// Parses configuration text, substituting variables through `lookup`.
pub fn parse_config<F>(content: &str, lookup: F) -> Result<InventoryConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let content = substitute_vars(content, lookup)?;
    let config: InventoryConfig = serde_yaml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Loads a YAML configuration file, substituting `${VAR}` references from
/// the environment.
pub fn load(path: &Path) -> Result<InventoryConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content, |name| env::var(name).ok())
}
