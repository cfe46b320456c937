// Collector module - the extensible architecture for cluster data collection
//
// A collector implements up to three poll functions (counter, instance,
// data). The runner drives them through a Schedule, runs plugins after each
// data poll and hands the results to exporters. Collectors are created from
// a registry keyed by name, filled once when the poller starts.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::config::CollectorSpec;
use crate::error::PollError;
use crate::matrix::Matrix;

pub mod metadata;
pub mod perf;
pub mod runner;
pub mod unix;

pub use metadata::Metadata;
pub use runner::CollectorRunner;

/// Matrices produced by one poll, keyed by object
pub type DataMap = BTreeMap<String, Matrix>;

/// Capabilities of the target system, handed to plugins and counter tables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Remote {
    pub name: String,
    pub version: String,
    pub model: String,
    pub uuid: String,
}

impl Remote {
    /// True if the remote version is `min` or newer; unknown versions pass
    ///
    /// # Example
    /// ```text
    /// remote.version = "9.13.1"; remote.at_least("9.12") == true
    /// ```
    pub fn at_least(&self, min: &str) -> bool {
        if self.version.is_empty() {
            return true;
        }
        compare_versions(&self.version, min) != Ordering::Less
    }
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map_while(|p| {
                let digits: String = p.trim().chars().take_while(char::is_ascii_digit).collect();
                digits.parse::<u64>().ok()
            })
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let (x, y) = (a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0));
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Collector state exposed through metadata and the overview page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Up,
    Standby,
    Failed,
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::Up => 0,
            Status::Standby => 1,
            Status::Failed => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Status> {
        match code {
            0 => Some(Status::Up),
            1 => Some(Status::Standby),
            2 => Some(Status::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Up => "up",
            Status::Standby => "standby",
            Status::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three poll functions a schedule can fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Counter,
    Instance,
    Data,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Counter => "counter",
            TaskKind::Instance => "instance",
            TaskKind::Data => "data",
        }
    }
}

/// Everything a collector needs to know about where it runs
#[derive(Debug, Clone)]
pub struct CollectorContext {
    pub poller: String,
    pub addr: String,
    pub object: String,
    pub spec: CollectorSpec,
    pub global_labels: BTreeMap<String, String>,
}

/// Core trait that all collectors must implement.
///
/// Poll functions run sequentially on the collector's own task; they never
/// overlap. Errors are classified by the runner (see `PollError`), which
/// moves the collector into standby or marks it failed.
#[async_trait]
pub trait Collector: Send {
    /// Registry name of the collector (e.g. "Unix")
    fn name(&self) -> &str;

    fn object(&self) -> &str;

    /// Prepares the collector and returns the capabilities of the remote
    async fn init(&mut self) -> Result<Remote, PollError>;

    /// Tasks this collector wants scheduled
    fn tasks(&self) -> Vec<TaskKind> {
        vec![TaskKind::Counter, TaskKind::Instance, TaskKind::Data]
    }

    /// Refreshes counter metadata and the metric schema
    async fn poll_counter(&mut self, _meta: &mut Metadata) -> Result<DataMap, PollError> {
        Ok(DataMap::new())
    }

    /// Refreshes the instance list
    async fn poll_instance(&mut self, _meta: &mut Metadata) -> Result<DataMap, PollError> {
        Ok(DataMap::new())
    }

    /// Fetches raw samples and returns exportable matrices
    async fn poll_data(&mut self, meta: &mut Metadata) -> Result<DataMap, PollError>;

    /// Called when the schedule enters standby; cached deltas go stale
    fn on_standby(&mut self) {}

    /// Called when the schedule leaves standby
    fn on_recover(&mut self) {}
}

/// Builds a collector for one object
pub type CollectorFactory =
    Arc<dyn Fn(&CollectorContext) -> Result<Box<dyn Collector>, PollError> + Send + Sync>;

/// Write-once table of collector constructors
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    factories: HashMap<String, CollectorFactory>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        CollectorRegistry::default()
    }

    /// Registry with the collectors that need no external transport
    pub fn with_builtins() -> Self {
        let mut registry = CollectorRegistry::new();
        registry.register(
            unix::NAME,
            Arc::new(|ctx: &CollectorContext| {
                Ok(Box::new(unix::new(ctx)?) as Box<dyn Collector>)
            }),
        );
        registry
    }

    pub fn register(&mut self, name: &str, factory: CollectorFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn build(&self, ctx: &CollectorContext) -> Result<Box<dyn Collector>, PollError> {
        let factory = self
            .factories
            .get(&ctx.spec.name)
            .ok_or_else(|| PollError::InvalidParam(format!("unknown collector: {}", ctx.spec.name)))?;
        factory(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compare() {
        let remote = Remote {
            version: "9.13.1".into(),
            ..Default::default()
        };
        assert!(remote.at_least("9.12"));
        assert!(remote.at_least("9.13.1"));
        assert!(!remote.at_least("9.14"));
        assert!(!remote.at_least("10"));
        assert!(Remote::default().at_least("99"));
    }

    #[test]
    fn test_status_codes() {
        for status in [Status::Up, Status::Standby, Status::Failed] {
            assert_eq!(Status::from_code(status.code()), Some(status));
        }
        assert_eq!(Status::Standby.to_string(), "standby");
        assert_eq!(Status::from_code(7), None);
    }

    #[test]
    fn test_registry_unknown_collector() {
        let registry = CollectorRegistry::with_builtins();
        assert!(registry.contains("Unix"));
        let spec: CollectorSpec =
            serde_yaml::from_str("name: ZapiPerf\nobjects: [volume]").unwrap();
        let ctx = CollectorContext {
            poller: "p".into(),
            addr: String::new(),
            object: "volume".into(),
            spec,
            global_labels: BTreeMap::new(),
        };
        let err = registry.build(&ctx).err().unwrap();
        assert!(err.is_config());
    }
}
