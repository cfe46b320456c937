// Perf collector - counter, instance and data polls over a counter source
//
// The transport is abstracted behind `CounterSource`: it describes the
// counters of an object, lists its instances and returns raw samples. The
// collector owns the counter table and the raw template matrix, fills a
// fresh raw matrix on every data poll and hands it to the cooker.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::{Collector, CollectorContext, DataMap, Metadata, Remote};
use crate::config::CollectorSpec;
use crate::cook::{CookConfig, Cooked, Cooker};
use crate::counters::{bucket_key, CounterTable, CounterTemplate, TIMESTAMP};
use crate::error::PollError;
use crate::matrix::{Matrix, With};

/// One instance as listed by the remote
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceRecord {
    pub key: String,
    pub labels: BTreeMap<String, String>,
}

/// Raw value of one counter
#[derive(Debug, Clone, PartialEq)]
pub enum CounterValue {
    Scalar(f64),
    /// One value per bucket, in bucket order
    Array(Vec<f64>),
}

/// Raw sample of one instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
    pub instance: String,
    /// Seconds, as reported by the remote
    pub timestamp: f64,
    pub values: BTreeMap<String, CounterValue>,
    /// Some nodes did not answer for this instance
    pub partial: bool,
}

/// Samples of one data poll with transport statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataBatch {
    pub samples: Vec<Sample>,
    pub calls: usize,
    pub bytes: usize,
}

/// Transport of a performance collector
#[async_trait]
pub trait CounterSource: Send {
    /// Capabilities of the remote, asked once on init
    async fn remote(&mut self) -> Result<Remote, PollError>;

    /// Counters the remote exposes for `object`, with their properties
    async fn fetch_counters(&mut self, object: &str) -> Result<Vec<CounterTemplate>, PollError>;

    async fn fetch_instances(&mut self, object: &str) -> Result<Vec<InstanceRecord>, PollError>;

    /// Raw values of `counters` for `instances`
    async fn fetch_data(
        &mut self,
        object: &str,
        instances: &[String],
        counters: &[String],
    ) -> Result<DataBatch, PollError>;
}

pub struct PerfCollector<S> {
    name: String,
    object: String,
    spec: CollectorSpec,
    source: S,
    remote: Remote,
    table: CounterTable,
    matrix: Matrix,
    cooker: Option<Cooker>,
}

impl<S: CounterSource> PerfCollector<S> {
    pub fn new(ctx: &CollectorContext, source: S) -> Result<Self, PollError> {
        if ctx.object.is_empty() {
            return Err(PollError::MissingParam("object".to_string()));
        }
        let name = ctx.spec.name.clone();
        let mut matrix = Matrix::new(&name, &ctx.object, &format!("{}:{}", name, ctx.object));
        matrix.set_global_labels(ctx.global_labels.iter());
        matrix.set_export_options(ctx.spec.export_options.clone());
        matrix.set_exportable(ctx.spec.export_data);

        Ok(PerfCollector {
            name,
            object: ctx.object.clone(),
            spec: ctx.spec.clone(),
            source,
            remote: Remote::default(),
            table: CounterTable::default(),
            matrix,
            cooker: None,
        })
    }

    pub fn table(&self) -> &CounterTable {
        &self.table
    }

    /// Raw template matrix: schema and instances, no data
    pub fn matrix(&self) -> &Matrix {
        &self.matrix
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn is_cold(&self) -> bool {
        self.cooker.as_ref().map(Cooker::is_cold).unwrap_or(true)
    }

    /// Template entries restricted to what the remote exposes
    ///
    /// An empty template selects every counter of the remote. Entries the
    /// remote does not know are dropped as a wrong template.
    fn select(&self, described: Vec<CounterTemplate>) -> Vec<CounterTemplate> {
        if self.spec.counters.is_empty() {
            return described;
        }
        let by_name: BTreeMap<&str, &CounterTemplate> =
            described.iter().map(|c| (c.name.as_str(), c)).collect();

        let mut selected = Vec::with_capacity(self.spec.counters.len());
        for wanted in &self.spec.counters {
            let key = wanted.name.split("=>").next().unwrap_or_default().trim();
            let Some(remote) = by_name.get(key) else {
                let err = PollError::WrongTemplate(format!("{key} not exposed by {}", self.object));
                warn!(collector = %self.name, object = %self.object, kind = err.kind(), "{}", err);
                continue;
            };
            selected.push(CounterTemplate {
                name: wanted.name.clone(),
                property: wanted.property.or(remote.property),
                base: wanted.base.clone().or_else(|| remote.base.clone()),
                unit: wanted.unit.clone().or_else(|| remote.unit.clone()),
                buckets: if wanted.buckets.is_empty() {
                    remote.buckets.clone()
                } else {
                    wanted.buckets.clone()
                },
                histogram: wanted.histogram || remote.histogram,
                min_version: wanted.min_version.clone(),
            });
        }
        selected
    }

    fn cook_config(&self) -> CookConfig {
        CookConfig {
            latency_io_reqd: self.spec.latency_io_reqd,
            allow_partial: self.spec.allow_partial_aggregation,
            timestamp_key: TIMESTAMP.to_string(),
        }
    }

    /// Copies sample values into `raw`; returns the number of cells set
    fn fill(&self, raw: &mut Matrix, samples: &[Sample]) -> usize {
        let mut count = 0;
        for sample in samples {
            let Some(index) = raw.instance_index(&sample.instance) else {
                trace!(instance = %sample.instance, "sample of unknown instance");
                continue;
            };
            if let Some(instance) = raw.instance_mut(&sample.instance) {
                instance.set_partial(sample.partial);
            }
            if let Some(ts) = raw.metric_mut(TIMESTAMP) {
                ts.set_value_f64(index, sample.timestamp);
            }
            for (key, value) in &sample.values {
                match value {
                    CounterValue::Scalar(v) => {
                        if let Some(metric) = raw.metric_mut(key) {
                            metric.set_value_f64(index, *v);
                            count += 1;
                        }
                    }
                    CounterValue::Array(values) => {
                        let Some(buckets) = self.table.get(key).and_then(|c| c.buckets.clone()) else {
                            continue;
                        };
                        if buckets.len() != values.len() {
                            debug!(counter = %key, expected = buckets.len(), got = values.len(), "array size mismatch");
                            continue;
                        }
                        for (bucket, v) in buckets.iter().zip(values) {
                            if let Some(metric) = raw.metric_mut(&bucket_key(key, bucket)) {
                                metric.set_value_f64(index, *v);
                                count += 1;
                            }
                        }
                    }
                }
            }
        }
        count
    }
}

#[async_trait]
impl<S: CounterSource> Collector for PerfCollector<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn object(&self) -> &str {
        &self.object
    }

    async fn init(&mut self) -> Result<Remote, PollError> {
        self.remote = self.source.remote().await?;
        info!(
            collector = %self.name,
            object = %self.object,
            remote = %self.remote.name,
            version = %self.remote.version,
            "initialized"
        );
        Ok(self.remote.clone())
    }

    async fn poll_counter(&mut self, meta: &mut Metadata) -> Result<DataMap, PollError> {
        let start = Instant::now();
        let described = self.source.fetch_counters(&self.object).await?;
        meta.set_duration("api_time", "counter", start.elapsed());

        let parse = Instant::now();
        let table = CounterTable::build(&self.select(described), &self.remote);
        if table.counters().iter().all(|c| !c.exportable || c.key == TIMESTAMP) {
            return Err(PollError::NoMetric(self.object.clone()));
        }
        let (added, removed) = table.sync_metrics(&mut self.matrix)?;
        self.table = table;
        meta.set_duration("parse_time", "counter", parse.elapsed());
        meta.set("count", "counter", self.table.len() as f64);
        meta.set("metrics", "counter", self.matrix.metrics().len() as f64);

        if self.cooker.is_none() {
            self.cooker = Some(Cooker::new(self.cook_config(), &self.matrix));
        }
        debug!(collector = %self.name, object = %self.object, added, removed, "counters updated");
        Ok(DataMap::new())
    }

    async fn poll_instance(&mut self, meta: &mut Metadata) -> Result<DataMap, PollError> {
        let start = Instant::now();
        let records = self.source.fetch_instances(&self.object).await?;
        meta.set_duration("api_time", "instance", start.elapsed());

        let fresh: BTreeMap<&str, &InstanceRecord> = records.iter().map(|r| (r.key.as_str(), r)).collect();
        let stale: Vec<String> = self
            .matrix
            .instance_keys()
            .into_iter()
            .filter(|k| !fresh.contains_key(k.as_str()))
            .collect();
        for key in &stale {
            self.matrix.remove_instance(key);
        }
        let mut added = 0;
        for record in &records {
            let instance = match self.matrix.instance_mut(&record.key) {
                Some(instance) => instance,
                None => {
                    added += 1;
                    self.matrix.new_instance(&record.key)?
                }
            };
            instance.set_labels(record.labels.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        meta.set("instances", "instance", self.matrix.instances().len() as f64);
        meta.set("count", "instance", records.len() as f64);
        debug!(
            collector = %self.name,
            object = %self.object,
            added,
            removed = stale.len(),
            "instances updated"
        );
        if self.matrix.instances().is_empty() {
            return Err(PollError::NoInstance(self.object.clone()));
        }
        Ok(DataMap::new())
    }

    async fn poll_data(&mut self, meta: &mut Metadata) -> Result<DataMap, PollError> {
        if self.table.is_empty() {
            return Err(PollError::NoMetric(format!("{}: no counters polled yet", self.object)));
        }
        if self.matrix.instances().is_empty() {
            return Err(PollError::NoInstance(self.object.clone()));
        }

        let instances = self.matrix.instance_keys();
        let counters: Vec<String> = self.table.counters().iter().map(|c| c.key.clone()).collect();

        let start = Instant::now();
        let batch = self.source.fetch_data(&self.object, &instances, &counters).await?;
        meta.set_duration("api_time", "data", start.elapsed());
        meta.set("numCalls", "data", batch.calls as f64);
        meta.set("bytesRx", "data", batch.bytes as f64);

        let parse = Instant::now();
        let mut raw = self.matrix.clone_with(With::SCHEMA)?;
        let count = self.fill(&mut raw, &batch.samples);
        meta.set_duration("parse_time", "data", parse.elapsed());
        meta.set("count", "data", count as f64);

        let Some(cooker) = self.cooker.as_mut() else {
            return Err(PollError::NoMetric(format!("{}: no counters polled yet", self.object)));
        };
        match cooker.cook(raw)? {
            Cooked::CacheCold => {
                debug!(collector = %self.name, object = %self.object, "cache cold, nothing to export");
                Ok(DataMap::new())
            }
            Cooked::Ready(cooked, stats) => {
                meta.set_duration("calc_time", "data", stats.calc_time);
                meta.set("skips", "data", stats.skips as f64);
                meta.set("instances", "data", stats.instances as f64);
                meta.set("numPartials", "data", stats.partials as f64);
                let recorded: usize = cooked.metrics().iter().map(|m| m.recorded_count()).sum();
                meta.set("metrics", "data", recorded as f64);
                cooked.print();

                let mut data = DataMap::new();
                data.insert(self.object.clone(), cooked);
                Ok(data)
            }
        }
    }

    fn on_standby(&mut self) {
        if let Some(cooker) = self.cooker.as_mut() {
            info!(collector = %self.name, object = %self.object, "standby, next poll starts cold");
            cooker.mark_cold();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::matrix::Property;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Counter source replaying scripted samples
    #[derive(Default)]
    pub(crate) struct ScriptedSource {
        pub counters: Vec<CounterTemplate>,
        pub instances: Vec<InstanceRecord>,
        pub polls: VecDeque<Result<Vec<Sample>, PollError>>,
    }

    #[async_trait]
    impl CounterSource for ScriptedSource {
        async fn remote(&mut self) -> Result<Remote, PollError> {
            Ok(Remote {
                name: "cluster-01".into(),
                version: "9.13.1".into(),
                ..Remote::default()
            })
        }

        async fn fetch_counters(&mut self, _object: &str) -> Result<Vec<CounterTemplate>, PollError> {
            Ok(self.counters.clone())
        }

        async fn fetch_instances(&mut self, _object: &str) -> Result<Vec<InstanceRecord>, PollError> {
            Ok(self.instances.clone())
        }

        async fn fetch_data(
            &mut self,
            _object: &str,
            _instances: &[String],
            _counters: &[String],
        ) -> Result<DataBatch, PollError> {
            let samples = self
                .polls
                .pop_front()
                .unwrap_or_else(|| Err(PollError::Connection("script exhausted".into())))?;
            Ok(DataBatch {
                samples,
                calls: 1,
                bytes: 128,
            })
        }
    }

    pub(crate) fn volume_sample(instance: &str, ts: f64, ops: f64, latency: f64) -> Sample {
        Sample {
            instance: instance.into(),
            timestamp: ts,
            values: BTreeMap::from([
                ("read_ops".to_string(), CounterValue::Scalar(ops)),
                ("read_latency".to_string(), CounterValue::Scalar(latency)),
            ]),
            partial: false,
        }
    }

    pub(crate) fn volume_source(polls: Vec<Result<Vec<Sample>, PollError>>) -> ScriptedSource {
        ScriptedSource {
            counters: vec![
                CounterTemplate::new("read_ops").with_property(Property::Rate),
                CounterTemplate::new("read_latency")
                    .with_property(Property::Average)
                    .with_base("read_ops"),
                CounterTemplate::new("not_in_template"),
            ],
            instances: vec![InstanceRecord {
                key: "v1".into(),
                labels: BTreeMap::from([("volume".to_string(), "v1".to_string())]),
            }],
            polls: polls.into(),
        }
    }

    pub(crate) fn context(collector: &str, object: &str, yaml: &str) -> CollectorContext {
        let spec: CollectorSpec =
            serde_yaml::from_str(&format!("name: {collector}\nobjects: [{object}]\n{yaml}")).unwrap();
        CollectorContext {
            poller: "cluster-01".into(),
            addr: "10.0.0.1".into(),
            object: object.into(),
            spec,
            global_labels: BTreeMap::from([("datacenter".to_string(), "dc1".to_string())]),
        }
    }

    fn metadata() -> Metadata {
        Metadata::new("KeyPerf", "volume", "cluster-01", &[("data", Duration::from_secs(10))])
    }

    #[tokio::test]
    async fn test_counter_and_instance_polls() {
        let ctx = context("KeyPerf", "volume", "counters:\n  - name: read_ops\n  - name: read_latency\n  - name: gone\n");
        let mut collector = PerfCollector::new(&ctx, volume_source(Vec::new())).unwrap();
        let mut meta = metadata();
        collector.init().await.unwrap();
        collector.poll_counter(&mut meta).await.unwrap();

        assert!(collector.table().get("read_ops").is_some());
        assert!(collector.table().get("gone").is_none());
        assert!(collector.table().get("not_in_template").is_none());
        assert!(collector.matrix().metric(TIMESTAMP).is_some());
        assert_eq!(collector.matrix().metric("read_latency").unwrap().comment(), "read_ops");

        collector.poll_instance(&mut meta).await.unwrap();
        assert_eq!(collector.matrix().instance_keys(), ["v1"]);
        assert_eq!(meta.value("instances", "instance"), Some(1.0));

        collector.source_mut().instances.clear();
        let err = collector.poll_instance(&mut meta).await.unwrap_err();
        assert!(matches!(err, PollError::NoInstance(_)));
    }

    #[tokio::test]
    async fn test_data_poll_cooks_second_sample() {
        let ctx = context("KeyPerf", "volume", "");
        let source = volume_source(vec![
            Ok(vec![volume_sample("v1", 0.0, 1000.0, 50_000.0)]),
            Ok(vec![volume_sample("v1", 10.0, 2000.0, 150_000.0)]),
        ]);
        let mut collector = PerfCollector::new(&ctx, source).unwrap();
        let mut meta = metadata();
        collector.init().await.unwrap();

        let err = collector.poll_data(&mut meta).await.unwrap_err();
        assert!(matches!(err, PollError::NoMetric(_)));

        collector.poll_counter(&mut meta).await.unwrap();
        collector.poll_instance(&mut meta).await.unwrap();
        assert!(collector.poll_data(&mut meta).await.unwrap().is_empty());

        let data = collector.poll_data(&mut meta).await.unwrap();
        let volume = &data["volume"];
        assert_eq!(volume.value("read_ops", "v1"), Some(100.0));
        assert_eq!(volume.value("read_latency", "v1"), Some(100.0));
        assert_eq!(volume.global_labels().get("datacenter").map(String::as_str), Some("dc1"));
        assert_eq!(meta.value("skips", "data"), Some(0.0));
        assert_eq!(meta.value("bytesRx", "data"), Some(128.0));
    }

    #[tokio::test]
    async fn test_transport_error_keeps_previous() {
        let ctx = context("KeyPerf", "volume", "");
        let source = volume_source(vec![
            Ok(vec![volume_sample("v1", 0.0, 1000.0, 50_000.0)]),
            Err(PollError::Connection("unreachable".into())),
            Ok(vec![volume_sample("v1", 10.0, 2000.0, 150_000.0)]),
        ]);
        let mut collector = PerfCollector::new(&ctx, source).unwrap();
        let mut meta = metadata();
        collector.poll_counter(&mut meta).await.unwrap();
        collector.poll_instance(&mut meta).await.unwrap();
        collector.poll_data(&mut meta).await.unwrap();

        let err = collector.poll_data(&mut meta).await.unwrap_err();
        assert!(matches!(err, PollError::Connection(_)));

        let data = collector.poll_data(&mut meta).await.unwrap();
        assert_eq!(data["volume"].value("read_ops", "v1"), Some(100.0));
    }

    #[tokio::test]
    async fn test_standby_marks_cold() {
        let ctx = context("KeyPerf", "volume", "");
        let source = volume_source(vec![
            Ok(vec![volume_sample("v1", 0.0, 1000.0, 50_000.0)]),
            Ok(vec![volume_sample("v1", 180.0, 2000.0, 150_000.0)]),
        ]);
        let mut collector = PerfCollector::new(&ctx, source).unwrap();
        let mut meta = metadata();
        collector.poll_counter(&mut meta).await.unwrap();
        collector.poll_instance(&mut meta).await.unwrap();
        collector.poll_data(&mut meta).await.unwrap();
        assert!(!collector.is_cold());

        collector.on_standby();
        assert!(collector.is_cold());
        assert!(collector.poll_data(&mut meta).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_array_counter_flattened() {
        let ctx = context("KeyPerf", "volume", "");
        let mut source = volume_source(Vec::new());
        source.counters.push(CounterTemplate {
            name: "read_hist".into(),
            property: Some(Property::Delta),
            buckets: vec!["<20us".into(), ">20us".into()],
            histogram: true,
            ..CounterTemplate::default()
        });
        let mut first = volume_sample("v1", 0.0, 1000.0, 50_000.0);
        first.values.insert("read_hist".into(), CounterValue::Array(vec![1.0, 2.0]));
        let mut second = volume_sample("v1", 10.0, 2000.0, 150_000.0);
        second.values.insert("read_hist".into(), CounterValue::Array(vec![4.0, 8.0]));
        source.polls = vec![Ok(vec![first]), Ok(vec![second])].into();

        let mut collector = PerfCollector::new(&ctx, source).unwrap();
        let mut meta = metadata();
        collector.poll_counter(&mut meta).await.unwrap();
        collector.poll_instance(&mut meta).await.unwrap();
        collector.poll_data(&mut meta).await.unwrap();
        let data = collector.poll_data(&mut meta).await.unwrap();
        assert_eq!(data["volume"].value("read_hist#<20us", "v1"), Some(3.0));
        assert_eq!(data["volume"].value("read_hist#>20us", "v1"), Some(6.0));
    }
}
