use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, Level};

/// Scan-pipeline configuration, loaded from a TOML file with environment
/// variable overrides for the values most commonly varied in deployment
/// (the root path and whether automatic scans run at all).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Root directory to scan (required, absolute).
    pub base_path: PathBuf,

    /// Catalog persistence location (a `mysql_async`-compatible URL).
    pub db_path: String,

    /// Derivative cache root. Not written to by this crate; carried so the
    /// thumbnail/derivative cache (external) can share configuration.
    pub cache_dir: PathBuf,

    /// Static UI asset root (external, unused by the scan pipeline).
    pub static_dir: Option<PathBuf>,

    /// HTTP bind host (external, unused by the scan pipeline).
    pub host: Option<String>,

    /// HTTP bind port (external, unused by the scan pipeline).
    pub port: Option<u16>,

    pub scan: ScanConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Parallel vs serial executor; serial mode exists for benchmarking.
    #[serde(default = "default_parallel_enabled")]
    pub parallel_enabled: bool,

    /// Batch size for the catalog adapter's transactional writes.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Six-field (sec min hour dom month dow) recurring schedule; empty
    /// disables the scheduling hook entirely.
    #[serde(default = "default_cron")]
    pub cron: String,

    /// Master kill switch for automatic (cron-triggered) scans.
    #[serde(default = "default_scan_enabled")]
    pub enabled: bool,
}

fn default_parallel_enabled() -> bool {
    true
}

fn default_batch_size() -> usize {
    50
}

fn default_cron() -> String {
    "0 0 2 * * *".to_owned()
}

fn default_scan_enabled() -> bool {
    true
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            parallel_enabled: default_parallel_enabled(),
            batch_size: default_batch_size(),
            cron: default_cron(),
            enabled: default_scan_enabled(),
        }
    }
}

impl ScanConfig {
    /// Worker pool size: `min(logical CPUs, 8)` in parallel mode, `1` in
    /// serial mode (§4.5/§5).
    pub fn worker_count(&self) -> usize {
        if self.parallel_enabled {
            num_cpus::get().min(8).max(1)
        } else {
            1
        }
    }
}

// in order to extract the config table from a larger document, we need to
// specify it as a subtable of the root node, i.e. a substruct
#[derive(Debug, Serialize, Deserialize)]
struct TomlConfigFile {
    config: Config,
}

#[instrument(level = Level::DEBUG)]
pub async fn read_config(filename: PathBuf) -> anyhow::Result<Arc<Config>> {
    debug!("reading config file");

    let doc = tokio::fs::read_to_string(&filename).await?;

    let mut data: TomlConfigFile = toml::from_str(&doc)?;

    apply_env_overrides(&mut data.config);

    debug!("successfully parsed config file");
    Ok(Arc::new(data.config))
}

/// A handful of deployment knobs are commonly overridden without editing
/// the TOML file on disk; mirror that here rather than re-reading env vars
/// scattered throughout the scan pipeline.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("SCANNER_BASE_PATH") {
        config.base_path = PathBuf::from(val);
    }

    if let Ok(val) = std::env::var("SCANNER_DB_PATH") {
        config.db_path = val;
    }

    if let Ok(val) = std::env::var("SCANNER_SCAN_ENABLED") {
        if let Ok(parsed) = val.parse::<bool>() {
            config.scan.enabled = parsed;
        }
    }

    if let Ok(val) = std::env::var("SCANNER_SCAN_CRON") {
        config.scan.cron = val;
    }
}
