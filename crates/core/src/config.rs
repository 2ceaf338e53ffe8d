use crate::loyalty::ProgramConfiguration;
use serde::Deserialize;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `STOREFRONT__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub loyalty: LoyaltyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            loyalty: LoyaltyConfig::default(),
        }
    }
}

// ─── Loyalty Config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct LoyaltyConfig {
    #[serde(default)]
    pub program: ProgramConfiguration,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_expiry_sweep_interval_secs")]
    pub expiry_sweep_interval_secs: u64,
    #[serde(default = "default_leaderboard_max")]
    pub leaderboard_max: usize,
}

fn default_expiry_sweep_interval_secs() -> u64 { 3600 }
fn default_leaderboard_max() -> usize { 100 }

impl Default for LoyaltyConfig {
    fn default() -> Self {
        Self {
            program: ProgramConfiguration::default(),
            storage: StorageConfig::default(),
            expiry_sweep_interval_secs: default_expiry_sweep_interval_secs(),
            leaderboard_max: default_leaderboard_max(),
        }
    }
}

// ─── Storage Config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Journal file path. `None` keeps the ledger in memory only.
    #[serde(default = "default_journal_path")]
    pub journal_path: Option<String>,
    /// fsync after every record.
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,
}

fn default_journal_path() -> Option<String> { Some("data/loyalty.journal".to_string()) }
fn default_sync_writes() -> bool { true }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            journal_path: default_journal_path(),
            sync_writes: default_sync_writes(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional config file, then environment
    /// variables (which win).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let builder = builder.add_source(
            config::Environment::with_prefix("STOREFRONT")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.api.http_port, 8080);
        assert_eq!(config.loyalty.program.welcome_bonus_points, 50);
        assert!(config.loyalty.storage.journal_path.is_some());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = std::env::temp_dir().join(format!("storefront-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("loyalty.toml");
        std::fs::write(
            &path,
            r#"
node_id = "node-07"

[api]
http_port = 8181

[loyalty.program]
welcome_bonus_points = 0
min_redemption_points = 250
"#,
        )
        .unwrap();

        let config = AppConfig::load(path.to_str()).unwrap();
        assert_eq!(config.node_id, "node-07");
        assert_eq!(config.api.http_port, 8181);
        assert_eq!(config.loyalty.program.welcome_bonus_points, 0);
        assert_eq!(config.loyalty.program.min_redemption_points, 250);
        assert_eq!(config.loyalty.program.tiers.len(), 3);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
