//! warmpool.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Errors raised while loading or validating configuration.
///
/// All of these are fatal to process startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub config: GlobalSettings,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
    #[serde(default)]
    pub pools: Vec<PoolSettings>,
}

/// Process-wide defaults (`[config]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    /// Maximum clones in flight across all pools.
    pub task_limit: u32,
    /// Maximum concurrent migrations; zero, negative or `false` disables migration.
    pub migration_limit: MigrationLimit,
    /// Fallback lifetime of a checked-out machine.
    pub vm_lifetime_hours: u64,
    /// Minimum interval between two health checks of the same ready machine.
    pub vm_checktime_minutes: u64,
    /// Fallback pending timeout.
    pub timeout_minutes: u64,
    /// Prefix for generated machine names.
    pub prefix: String,
    /// How long a destroyed machine's metadata is retained.
    pub data_ttl_hours: u64,
    /// Default cluster for pools that do not name one.
    pub clone_target: Option<String>,
    pub check_loop_delay_min: u64,
    pub check_loop_delay_max: u64,
    pub check_loop_delay_decay: f64,
    pub task_queue_delay_secs: u64,
    pub supervisor_delay_secs: u64,
    /// Sub-interval on which the pool loop polls its wake condition.
    pub wakeup_poll_millis: u64,
    pub host_selection: HostSelectionSettings,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            task_limit: 10,
            migration_limit: MigrationLimit::Count(0),
            vm_lifetime_hours: 12,
            vm_checktime_minutes: 15,
            timeout_minutes: 15,
            prefix: "poolvm-".to_string(),
            data_ttl_hours: 168,
            clone_target: None,
            check_loop_delay_min: 5,
            check_loop_delay_max: 60,
            check_loop_delay_decay: 2.0,
            task_queue_delay_secs: 5,
            supervisor_delay_secs: 1,
            wakeup_poll_millis: 1000,
            host_selection: HostSelectionSettings::default(),
        }
    }
}

/// `migration_limit` accepts either a number or a boolean.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MigrationLimit {
    Flag(bool),
    Count(i64),
}

impl GlobalSettings {
    /// Effective migration limit, `None` when migration is disabled.
    pub fn migration_limit(&self) -> Option<u32> {
        match self.migration_limit {
            MigrationLimit::Count(n) if n >= 1 => Some(u32::try_from(n).unwrap_or(u32::MAX)),
            _ => None,
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.vm_checktime_minutes * 60)
    }

    pub fn data_ttl(&self) -> Duration {
        Duration::from_secs(self.data_ttl_hours * 60 * 60)
    }
}

/// `[config.host_selection]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSelectionSettings {
    pub refresh_secs: u64,
    /// Cached candidates older than this trigger a refresh before use.
    pub stale_after_secs: u64,
    /// Share of each compatibility class kept as active candidates.
    pub candidate_percentage: u32,
    /// Hosts above this CPU or memory utilization (percent) are excluded.
    pub utilization_ceiling: f64,
    pub wait_attempts: u32,
    pub wait_millis: u64,
}

impl Default for HostSelectionSettings {
    fn default() -> Self {
        Self {
            refresh_secs: 5,
            stale_after_secs: 60,
            candidate_percentage: 20,
            utilization_ceiling: 80.0,
            wait_attempts: 10,
            wait_millis: 500,
        }
    }
}

/// `[providers.<name>]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Provider implementation to instantiate; defaults to the provider name.
    pub provider_class: Option<String>,
    /// Implementation-specific options.
    #[serde(flatten)]
    pub options: toml::Table,
}

/// One `[[pools]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    pub name: String,
    /// Desired number of pending + ready machines.
    pub size: u32,
    pub provider: Option<String>,
    /// Cluster this pool clones into.
    pub clone_target: Option<String>,
    pub timeout_minutes: Option<u64>,
    /// Zero or absent means ready machines never expire.
    pub ready_ttl_minutes: Option<u64>,
    pub vm_lifetime_hours: Option<u64>,
    pub check_loop_delay_min: Option<u64>,
    pub check_loop_delay_max: Option<u64>,
    pub check_loop_delay_decay: Option<f64>,
}

/// Resolved adaptive polling bounds for one pool loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopDelaySettings {
    pub min: Duration,
    pub max: Duration,
    pub decay: f64,
}

impl LoopDelaySettings {
    /// Build normalised bounds: decay at or below 1.0 becomes 2.0 and a
    /// maximum below the minimum is raised to it.
    pub fn new(min_secs: u64, max_secs: u64, decay: f64) -> Self {
        let decay = if decay <= 1.0 { 2.0 } else { decay };
        let max_secs = max_secs.max(min_secs);
        Self {
            min: Duration::from_secs(min_secs),
            max: Duration::from_secs(max_secs),
            decay,
        }
    }
}

impl PoolSettings {
    pub fn new(name: impl Into<String>, size: u32, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            provider: Some(provider.into()),
            clone_target: None,
            timeout_minutes: None,
            ready_ttl_minutes: None,
            vm_lifetime_hours: None,
            check_loop_delay_min: None,
            check_loop_delay_max: None,
            check_loop_delay_decay: None,
        }
    }

    pub fn timeout_minutes(&self, global: &GlobalSettings) -> u64 {
        self.timeout_minutes.unwrap_or(global.timeout_minutes)
    }

    pub fn ready_ttl_minutes(&self) -> u64 {
        self.ready_ttl_minutes.unwrap_or(0)
    }

    pub fn lifetime_hours(&self, global: &GlobalSettings) -> u64 {
        self.vm_lifetime_hours.unwrap_or(global.vm_lifetime_hours)
    }

    /// Cluster the pool's machines live in, if any is configured.
    pub fn cluster<'a>(&'a self, global: &'a GlobalSettings) -> Option<&'a str> {
        self.clone_target
            .as_deref()
            .or(global.clone_target.as_deref())
    }

    pub fn loop_delay(&self, global: &GlobalSettings) -> LoopDelaySettings {
        LoopDelaySettings::new(
            self.check_loop_delay_min.unwrap_or(global.check_loop_delay_min),
            self.check_loop_delay_max.unwrap_or(global.check_loop_delay_max),
            self.check_loop_delay_decay
                .unwrap_or(global.check_loop_delay_decay),
        )
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        content.parse()
    }

    pub fn pool(&self, name: &str) -> Option<&PoolSettings> {
        self.pools.iter().find(|p| p.name == name)
    }

    /// Provider implementation class for a provider name.
    ///
    /// Falls back to the name itself when no `[providers.<name>]` entry or no
    /// explicit `provider_class` exists.
    pub fn provider_class<'a>(&'a self, provider_name: &'a str) -> &'a str {
        self.providers
            .get(provider_name)
            .and_then(|p| p.provider_class.as_deref())
            .unwrap_or(provider_name)
    }

    /// Distinct provider names referenced by pools, in pool order.
    pub fn provider_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.pools
            .iter()
            .filter_map(|p| p.provider.as_deref())
            .filter(|name| seen.insert(*name))
            .collect()
    }

    /// Check invariants that cannot be expressed in the serde model.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pools.is_empty() {
            return Err(ConfigError::Invalid("no pools defined".into()));
        }
        if self.config.task_limit == 0 {
            return Err(ConfigError::Invalid("task_limit must be at least 1".into()));
        }
        let mut names = HashSet::new();
        for pool in &self.pools {
            if pool.name.is_empty() {
                return Err(ConfigError::Invalid("pool name cannot be empty".into()));
            }
            if !names.insert(pool.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate pool name '{}'",
                    pool.name
                )));
            }
            match pool.provider.as_deref() {
                Some(p) if !p.is_empty() => {}
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "pool '{}' has no provider",
                        pool.name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[config]
task_limit = 4
migration_limit = 5
prefix = "ci-"
clone_target = "cluster-a"

[config.host_selection]
candidate_percentage = 50

[providers.lab]
provider_class = "dummy"
folder = "pools"

[[pools]]
name = "debian-12"
size = 3
provider = "lab"
ready_ttl_minutes = 60

[[pools]]
name = "win-2022"
size = 1
provider = "lab"
clone_target = "cluster-b"
timeout_minutes = 30
check_loop_delay_min = 10
check_loop_delay_max = 2
check_loop_delay_decay = 0.5
"#;

    #[test]
    fn parse_full_config() {
        let config: Config = SAMPLE.parse().unwrap();
        config.validate().unwrap();

        assert_eq!(config.config.task_limit, 4);
        assert_eq!(config.config.migration_limit(), Some(5));
        assert_eq!(config.config.prefix, "ci-");
        assert_eq!(config.config.host_selection.candidate_percentage, 50);
        assert_eq!(config.config.host_selection.stale_after_secs, 60);
        assert_eq!(config.pools.len(), 2);
        assert_eq!(config.provider_class("lab"), "dummy");
        assert_eq!(
            config.providers["lab"].options.get("folder").and_then(|v| v.as_str()),
            Some("pools")
        );
    }

    #[test]
    fn pool_overrides_fall_back_to_globals() {
        let config: Config = SAMPLE.parse().unwrap();
        let debian = config.pool("debian-12").unwrap();
        let win = config.pool("win-2022").unwrap();

        assert_eq!(debian.timeout_minutes(&config.config), 15);
        assert_eq!(win.timeout_minutes(&config.config), 30);
        assert_eq!(debian.ready_ttl_minutes(), 60);
        assert_eq!(win.ready_ttl_minutes(), 0);
        assert_eq!(debian.lifetime_hours(&config.config), 12);
        assert_eq!(debian.cluster(&config.config), Some("cluster-a"));
        assert_eq!(win.cluster(&config.config), Some("cluster-b"));
    }

    #[test]
    fn loop_delay_is_normalised() {
        let config: Config = SAMPLE.parse().unwrap();

        let debian = config.pool("debian-12").unwrap().loop_delay(&config.config);
        assert_eq!(debian.min, Duration::from_secs(5));
        assert_eq!(debian.max, Duration::from_secs(60));
        assert_eq!(debian.decay, 2.0);

        // max below min is raised, decay below 1.0 is reset.
        let win = config.pool("win-2022").unwrap().loop_delay(&config.config);
        assert_eq!(win.min, Duration::from_secs(10));
        assert_eq!(win.max, Duration::from_secs(10));
        assert_eq!(win.decay, 2.0);
    }

    #[test]
    fn migration_limit_variants() {
        let mut global = GlobalSettings::default();
        assert_eq!(global.migration_limit(), None);

        global.migration_limit = MigrationLimit::Flag(false);
        assert_eq!(global.migration_limit(), None);

        global.migration_limit = MigrationLimit::Count(-3);
        assert_eq!(global.migration_limit(), None);

        global.migration_limit = MigrationLimit::Count(2);
        assert_eq!(global.migration_limit(), Some(2));

        let parsed: Config = "[config]\nmigration_limit = false\n".parse().unwrap();
        assert_eq!(parsed.config.migration_limit(), None);
    }

    #[test]
    fn provider_class_defaults_to_name() {
        let config: Config = SAMPLE.parse().unwrap();
        assert_eq!(config.provider_class("dummy"), "dummy");
        assert_eq!(config.provider_names(), vec!["lab"]);
    }

    #[test]
    fn validation_rejects_bad_pools() {
        let empty = Config::default();
        assert!(matches!(empty.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.pools.push(PoolSettings::new("a", 1, "dummy"));
        config.pools.push(PoolSettings::new("a", 1, "dummy"));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        let mut pool = PoolSettings::new("a", 1, "dummy");
        pool.provider = None;
        config.pools.push(pool);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pools.push(PoolSettings::new("a", 1, "dummy"));
        config.config.task_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warmpool.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.pools[0].name, "debian-12");

        let missing = Config::from_file(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
