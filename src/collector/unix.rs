// Unix collector - resource usage of local processes
//
// A counter source backed by sysinfo, run through the perf collector so the
// IO byte counters get cooked into rates like any cluster counter. Processes
// are selected by name (`params.processes`); without names the poller
// watches itself.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use sysinfo::{Pid, Process, ProcessRefreshKind, System, UpdateKind};
use tracing::debug;

use super::perf::{CounterSource, CounterValue, DataBatch, InstanceRecord, PerfCollector, Sample};
use super::{CollectorContext, Remote};
use crate::counters::CounterTemplate;
use crate::error::PollError;
use crate::matrix::Property;

pub const NAME: &str = "Unix";

pub type UnixCollector = PerfCollector<ProcessSource>;

/// Builds the collector for one object of a `Unix` collector spec
pub fn new(ctx: &CollectorContext) -> Result<UnixCollector, PollError> {
    let names = ctx.spec.params.get("processes").cloned().unwrap_or_default();
    PerfCollector::new(ctx, ProcessSource::new(names))
}

/// Counters exposed for every process
fn counters() -> Vec<CounterTemplate> {
    let raw = |name: &str, unit: &str| CounterTemplate {
        unit: Some(unit.to_string()),
        ..CounterTemplate::new(name).with_property(Property::Raw)
    };
    let rate = |name: &str| CounterTemplate {
        unit: Some("b_per_sec".to_string()),
        ..CounterTemplate::new(name).with_property(Property::Rate)
    };
    vec![
        raw("memory_rss", "bytes"),
        raw("memory_vms", "bytes"),
        raw("cpu_percent", "percent"),
        rate("io_read_bytes"),
        rate("io_write_bytes"),
        raw("start_time", "sec"),
        raw("threads", "count"),
    ]
}

pub struct ProcessSource {
    names: Vec<String>,
    system: System,
}

impl ProcessSource {
    pub fn new(names: Vec<String>) -> Self {
        ProcessSource {
            names,
            system: System::new(),
        }
    }

    fn refresh(&mut self) {
        let kind = ProcessRefreshKind::new()
            .with_cpu()
            .with_memory()
            .with_disk_usage()
            .with_cmd(UpdateKind::OnlyIfNotSet);
        self.system.refresh_processes_specifics(kind);
    }

    /// Watched processes as (pid, process)
    fn watched(&self) -> Vec<(Pid, &Process)> {
        if self.names.is_empty() {
            let own = Pid::from_u32(std::process::id());
            return self.system.process(own).map(|p| vec![(own, p)]).unwrap_or_default();
        }
        let mut found: Vec<(Pid, &Process)> = self
            .system
            .processes()
            .iter()
            .filter(|(_, p)| self.names.iter().any(|n| n == p.name()))
            .map(|(pid, p)| (*pid, p))
            .collect();
        found.sort_by_key(|(pid, _)| *pid);
        found
    }
}

#[async_trait]
impl CounterSource for ProcessSource {
    async fn remote(&mut self) -> Result<Remote, PollError> {
        Ok(Remote {
            name: System::host_name().unwrap_or_default(),
            version: System::kernel_version().unwrap_or_default(),
            model: System::name().unwrap_or_default(),
            uuid: String::new(),
        })
    }

    async fn fetch_counters(&mut self, _object: &str) -> Result<Vec<CounterTemplate>, PollError> {
        Ok(counters())
    }

    async fn fetch_instances(&mut self, object: &str) -> Result<Vec<InstanceRecord>, PollError> {
        self.refresh();
        let records: Vec<InstanceRecord> = self
            .watched()
            .into_iter()
            .map(|(pid, p)| InstanceRecord {
                key: pid.to_string(),
                labels: BTreeMap::from([
                    ("pid".to_string(), pid.to_string()),
                    ("name".to_string(), p.name().to_string()),
                    ("cmd".to_string(), p.cmd().join(" ")),
                ]),
            })
            .collect();
        debug!(object, found = records.len(), "processes listed");
        Ok(records)
    }

    async fn fetch_data(
        &mut self,
        _object: &str,
        instances: &[String],
        _counters: &[String],
    ) -> Result<DataBatch, PollError> {
        self.refresh();
        let timestamp = Utc::now().timestamp_millis() as f64 / 1000.0;
        let samples: Vec<Sample> = self
            .watched()
            .into_iter()
            .filter(|(pid, _)| instances.contains(&pid.to_string()))
            .map(|(pid, p)| {
                let disk = p.disk_usage();
                let threads = p.tasks().map(|t| t.len()).unwrap_or(1);
                let values = [
                    ("memory_rss", p.memory() as f64),
                    ("memory_vms", p.virtual_memory() as f64),
                    ("cpu_percent", f64::from(p.cpu_usage())),
                    ("io_read_bytes", disk.total_read_bytes as f64),
                    ("io_write_bytes", disk.total_written_bytes as f64),
                    ("start_time", p.start_time() as f64),
                    ("threads", threads as f64),
                ];
                Sample {
                    instance: pid.to_string(),
                    timestamp,
                    values: values
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), CounterValue::Scalar(v)))
                        .collect(),
                    partial: false,
                }
            })
            .collect();
        Ok(DataBatch {
            samples,
            calls: 1,
            bytes: 0,
        })
    }
}
