// Configuration module - poller, collector and exporter descriptors
//
// This module is responsible for:
// 1. Reading the poller YAML file
// 2. Materializing it into typed descriptors with defaults filled in
// 3. Validating cross references before any collector starts
//
// Everything downstream sees only these structs, never the YAML tree.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::counters::CounterTemplate;
use crate::matrix::ExportOptions;

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read poller file {path}: {source}")]
    ReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid poller file format: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid settings format: {0}")]
    InvalidSettings(String),

    #[error("Missing required setting: {0}")]
    MissingRequiredSetting(String),
}

/// Descriptor of one poller: one target cluster, its collectors and exporters
///
/// # Example poller file
/// ```yaml
/// name: cluster-01
/// addr: 10.0.0.1
/// datacenter: dc1
/// collectors:
///   - name: Unix
///     objects: [poller]
///     schedule: { data: 30s }
/// exporters:
///   - name: prom
///     type: prometheus
///     port: 12990
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Poller name, exported as the `poller` label of metadata
    pub name: String,

    /// Address of the target cluster
    #[serde(default)]
    pub addr: String,

    /// Reference to the credentials (file path or secret name), never the secret itself
    #[serde(default)]
    pub credentials: Option<String>,

    /// Datacenter label added to every exported row
    #[serde(default)]
    pub datacenter: String,

    /// Extra global labels overriding the defaults
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub collectors: Vec<CollectorSpec>,

    #[serde(default)]
    pub exporters: Vec<ExporterSpec>,
}

/// Settings of one collector type; one runner is created per object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorSpec {
    /// Registry key of the collector (e.g. "Unix")
    pub name: String,

    #[serde(default)]
    pub objects: Vec<String>,

    #[serde(default)]
    pub schedule: ScheduleSpec,

    #[serde(default)]
    pub plugins: Vec<PluginSpec>,

    /// Minimum ops per interval before a latency counter is published
    #[serde(default = "default_latency_io_reqd")]
    pub latency_io_reqd: f64,

    #[serde(default)]
    pub allow_partial_aggregation: bool,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Per-request timeout of calls to the cluster
    #[serde(with = "humantime_serde")]
    #[serde(default = "default_client_timeout")]
    pub client_timeout: Duration,

    /// When false the collected data only feeds plugins
    #[serde(default = "default_true")]
    pub export_data: bool,

    #[serde(default)]
    pub export_options: ExportOptions,

    #[serde(default)]
    pub counters: Vec<CounterTemplate>,

    /// Exporters this collector writes to; empty means all of them
    #[serde(default)]
    pub exporters: Vec<String>,

    /// Collector specific parameters
    #[serde(default)]
    pub params: BTreeMap<String, Vec<String>>,
}

/// Poll intervals of the three collector tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSpec {
    #[serde(with = "humantime_serde")]
    pub counter: Duration,

    #[serde(with = "humantime_serde")]
    pub instance: Duration,

    #[serde(with = "humantime_serde")]
    pub data: Duration,

    /// Upper bound of the random delay before the first poll
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,
}

impl Default for ScheduleSpec {
    fn default() -> Self {
        ScheduleSpec {
            counter: Duration::from_secs(20 * 60),
            instance: Duration::from_secs(10 * 60),
            data: Duration::from_secs(3 * 60),
            jitter: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSpec {
    pub name: String,

    /// Run the plugin once every this many data polls
    #[serde(default = "default_invoke_every")]
    pub invoke_every: u32,

    /// Rule lists keyed by rule kind ("rules", "split", "join", ...)
    #[serde(default)]
    pub params: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExporterKind {
    Prometheus,
    InfluxDb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterSpec {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: ExporterKind,

    /// Bind address of the scrape endpoint
    #[serde(default = "default_addr")]
    pub addr: String,

    #[serde(default)]
    pub port: Option<u16>,

    /// Destination of the push exporter
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub prefix: Option<String>,

    #[serde(default)]
    pub sort_labels: bool,

    /// Emit `# HELP` and `# TYPE` lines
    #[serde(default)]
    pub add_meta_tags: bool,

    #[serde(default)]
    pub allow_addrs: Vec<String>,

    #[serde(default)]
    pub allow_addrs_regex: Vec<String>,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default_cache_max_keep")]
    pub cache_max_keep: Duration,

    /// Keep cached blocks in files under this directory instead of memory
    #[serde(default)]
    pub disk_cache: Option<PathBuf>,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default_exporter_timeout")]
    pub timeout: Duration,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub content_type: Option<String>,

    /// Timestamp precision query parameter of the push exporter ("s", "ms", ...)
    #[serde(default)]
    pub precision: Option<String>,
}

fn default_latency_io_reqd() -> f64 {
    10.0
}

fn default_batch_size() -> usize {
    500
}

fn default_client_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_invoke_every() -> u32 {
    1
}

fn default_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_cache_max_keep() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_exporter_timeout() -> Duration {
    Duration::from_secs(5)
}

impl PollerConfig {
    /// Loads and validates a poller file
    ///
    /// # Arguments
    /// * `path` - Path of the YAML poller file
    ///
    /// # Returns
    /// * `Ok(PollerConfig)` - Parsed and validated descriptor
    /// * `Err(ConfigError)` - Unreadable file, bad YAML or failed validation
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading poller file: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parses and validates a poller descriptor from YAML text
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: PollerConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks required fields and cross references
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingRequiredSetting("name".to_string()));
        }
        if self.collectors.is_empty() {
            return Err(ConfigError::MissingRequiredSetting("collectors".to_string()));
        }
        if self.exporters.is_empty() {
            warn!("Poller '{}' has no exporters, collected data will be dropped", self.name);
        }

        let mut names = std::collections::HashSet::new();
        for exporter in &self.exporters {
            if !names.insert(exporter.name.as_str()) {
                return Err(ConfigError::InvalidSettings(format!(
                    "duplicate exporter name: {}",
                    exporter.name
                )));
            }
            exporter.validate()?;
        }

        for collector in &self.collectors {
            collector.validate()?;
            for wanted in &collector.exporters {
                if !names.contains(wanted.as_str()) {
                    return Err(ConfigError::InvalidSettings(format!(
                        "collector {} references unknown exporter: {}",
                        collector.name, wanted
                    )));
                }
            }
        }
        Ok(())
    }

    /// Global labels applied to every matrix of this poller
    pub fn global_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        if !self.datacenter.is_empty() {
            labels.insert("datacenter".to_string(), self.datacenter.clone());
        }
        labels.extend(self.labels.clone());
        labels
    }
}

impl CollectorSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingRequiredSetting("collector name".to_string()));
        }
        if self.objects.is_empty() {
            return Err(ConfigError::MissingRequiredSetting(format!(
                "objects of collector {}",
                self.name
            )));
        }
        let s = &self.schedule;
        if s.counter.is_zero() || s.instance.is_zero() || s.data.is_zero() {
            return Err(ConfigError::InvalidSettings(format!(
                "schedule of collector {} has a zero interval",
                self.name
            )));
        }
        if self.latency_io_reqd < 0.0 {
            return Err(ConfigError::InvalidSettings(format!(
                "latency_io_reqd of collector {} is negative",
                self.name
            )));
        }
        if self.plugins.iter().any(|p| p.invoke_every == 0) {
            return Err(ConfigError::InvalidSettings(format!(
                "plugin of collector {} has invoke_every = 0",
                self.name
            )));
        }
        Ok(())
    }
}

impl ExporterSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.kind {
            ExporterKind::Prometheus if self.port.is_none() => Err(
                ConfigError::MissingRequiredSetting(format!("port of exporter {}", self.name)),
            ),
            ExporterKind::InfluxDb if self.url.as_deref().unwrap_or_default().is_empty() => Err(
                ConfigError::MissingRequiredSetting(format!("url of exporter {}", self.name)),
            ),
            _ if self.cache_max_keep.is_zero() => Err(ConfigError::InvalidSettings(format!(
                "cache_max_keep of exporter {} is zero",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}
