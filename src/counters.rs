// Counters module - counter metadata table for performance collectors
//
// The table is a pure function of the template and the remote's
// capabilities. It decides the property, base counter and unit of every
// counter and flattens array counters into one metric per bucket.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::collector::Remote;
use crate::error::{MatrixError, PollError};
use crate::matrix::{Matrix, MetricType, Property};

/// Separator between a counter name and its bucket in flattened keys
pub const BUCKET_SEPARATOR: char = '#';

/// Key of the per-instance sample timestamp
pub const TIMESTAMP: &str = "timestamp";

/// One counter entry as written in a collector template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterTemplate {
    /// `name` or `name => display_name`
    pub name: String,
    pub property: Option<Property>,
    pub base: Option<String>,
    pub unit: Option<String>,
    /// Bucket labels of an array counter
    pub buckets: Vec<String>,
    pub histogram: bool,
    /// Oldest remote version that exposes the counter (e.g. "9.12")
    pub min_version: Option<String>,
}

impl CounterTemplate {
    pub fn new(name: &str) -> Self {
        CounterTemplate {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, property: Property) -> Self {
        self.property = Some(property);
        self
    }

    pub fn with_base(mut self, base: &str) -> Self {
        self.base = Some(base.to_string());
        self
    }
}

/// Resolved metadata of one counter
#[derive(Debug, Clone, PartialEq)]
pub struct Counter {
    pub key: String,
    pub display: String,
    pub property: Property,
    pub base: Option<String>,
    pub unit: String,
    pub buckets: Option<Arc<Vec<String>>>,
    pub histogram: bool,
    pub exportable: bool,
}

impl Counter {
    /// Keys of the matrix metrics this counter occupies
    pub fn metric_keys(&self) -> Vec<String> {
        match &self.buckets {
            Some(buckets) => buckets.iter().map(|b| bucket_key(&self.key, b)).collect(),
            None => vec![self.key.clone()],
        }
    }
}

pub fn bucket_key(counter: &str, bucket: &str) -> String {
    format!("{counter}{BUCKET_SEPARATOR}{bucket}")
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterTable {
    counters: Vec<Counter>,
    index: HashMap<String, usize>,
    by_metric: HashMap<String, usize>,
    excluded: Vec<String>,
}

impl CounterTable {
    /// Builds the table for one object
    ///
    /// # Arguments
    /// * `template` - Counter entries of the collector template
    /// * `remote` - Capabilities of the target cluster
    ///
    /// # Returns
    /// The resolved table. Entries that need a newer remote are left out and
    /// reported through `excluded()`.
    pub fn build(template: &[CounterTemplate], remote: &Remote) -> CounterTable {
        let mut table = CounterTable::default();

        for entry in template {
            let (key, display) = split_display(&entry.name);
            if key.is_empty() {
                continue;
            }
            if let Some(min) = &entry.min_version {
                if !remote.at_least(min) {
                    let err = PollError::WrongTemplate(format!(
                        "{key} requires version {min}, remote has {}",
                        remote.version
                    ));
                    warn!(counter = %key, kind = err.kind(), "{}", err);
                    table.excluded.push(key.to_string());
                    continue;
                }
            }

            let (property, base, unit) = resolve(key, entry);
            let buckets = (!entry.buckets.is_empty()).then(|| Arc::new(entry.buckets.clone()));
            table.insert(Counter {
                key: key.to_string(),
                display: display.to_string(),
                property,
                base,
                unit,
                buckets,
                histogram: entry.histogram,
                exportable: true,
            });
        }

        // base counters that the template did not list are fetched but hidden
        let missing: Vec<String> = table
            .counters
            .iter()
            .filter_map(|c| c.base.clone())
            .filter(|b| !table.index.contains_key(b))
            .collect();
        for base in missing {
            if table.index.contains_key(&base) {
                continue;
            }
            debug!(counter = %base, "adding hidden base counter");
            table.insert(Counter {
                key: base.clone(),
                display: base,
                property: Property::Delta,
                base: None,
                unit: String::new(),
                buckets: None,
                histogram: false,
                exportable: false,
            });
        }

        if !table.index.contains_key(TIMESTAMP) {
            table.insert(Counter {
                key: TIMESTAMP.to_string(),
                display: TIMESTAMP.to_string(),
                property: Property::Delta,
                base: None,
                unit: "sec".to_string(),
                buckets: None,
                histogram: false,
                exportable: false,
            });
        }

        table
    }

    fn insert(&mut self, counter: Counter) {
        if self.index.contains_key(&counter.key) {
            return;
        }
        let pos = self.counters.len();
        if counter.buckets.is_some() {
            for key in counter.metric_keys() {
                self.by_metric.insert(key, pos);
            }
        }
        self.by_metric.insert(counter.key.clone(), pos);
        self.index.insert(counter.key.clone(), pos);
        self.counters.push(counter);
    }

    pub fn get(&self, key: &str) -> Option<&Counter> {
        self.index.get(key).map(|&i| &self.counters[i])
    }

    /// Counter owning a matrix metric, following flattened bucket keys
    pub fn for_metric(&self, metric_key: &str) -> Option<&Counter> {
        self.by_metric.get(metric_key).map(|&i| &self.counters[i])
    }

    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Makes the matrix schema match the table
    ///
    /// # Returns
    /// `(added, removed)` metric counts
    pub fn sync_metrics(&self, matrix: &mut Matrix) -> Result<(usize, usize), MatrixError> {
        let mut wanted: Vec<String> = Vec::new();
        let mut added = 0;

        for counter in &self.counters {
            match &counter.buckets {
                None => {
                    if matrix.metric(&counter.key).is_none() {
                        matrix.new_metric(&counter.key, MetricType::Float64)?;
                        added += 1;
                    }
                    if let Some(metric) = matrix.metric_mut(&counter.key) {
                        metric.set_name(&counter.display);
                        metric.set_property(counter.property);
                        metric.set_comment(counter.base.as_deref().unwrap_or_default());
                        metric.set_unit(&counter.unit);
                        metric.set_exportable(counter.exportable);
                    }
                    wanted.push(counter.key.clone());
                }
                Some(buckets) => {
                    if counter.histogram {
                        if matrix.metric(&counter.key).is_none() {
                            matrix.new_metric(&counter.key, MetricType::Float64)?;
                        }
                        if let Some(root) = matrix.metric_mut(&counter.key) {
                            root.set_name(&counter.display);
                            root.set_histogram(true);
                            root.set_array(true);
                            root.set_buckets(Arc::clone(buckets));
                            root.set_exportable(false);
                        }
                        wanted.push(counter.key.clone());
                    }
                    for (index, bucket) in buckets.iter().enumerate() {
                        let key = bucket_key(&counter.key, bucket);
                        if matrix.metric(&key).is_none() {
                            matrix.new_metric(&key, MetricType::Float64)?;
                            added += 1;
                        }
                        if let Some(metric) = matrix.metric_mut(&key) {
                            metric.set_name(&counter.display);
                            metric.set_property(counter.property);
                            metric.set_comment(counter.base.as_deref().unwrap_or_default());
                            metric.set_unit(&counter.unit);
                            metric.set_exportable(counter.exportable);
                            metric.set_array(true);
                            metric.set_label("metric", bucket);
                            if counter.histogram {
                                metric.set_histogram(true);
                                metric.set_bucket(&counter.key, index);
                            }
                        }
                        wanted.push(key);
                    }
                }
            }
        }

        let stale: Vec<String> = matrix
            .metric_keys()
            .into_iter()
            .filter(|k| !wanted.contains(k))
            .collect();
        for key in &stale {
            matrix.remove_metric(key);
        }
        Ok((added, stale.len()))
    }
}

fn split_display(name: &str) -> (&str, &str) {
    match name.split_once("=>") {
        Some((key, display)) => (key.trim(), display.trim()),
        None => (name.trim(), name.trim()),
    }
}

/// Property, base and unit for a template entry, filling gaps from the name
fn resolve(key: &str, entry: &CounterTemplate) -> (Property, Option<String>, String) {
    let (property, base, unit) = if key.contains("latency") {
        (Property::Average, Some(key.replacen("latency", "ops", 1)), "microsec")
    } else if key.ends_with("ops") {
        (Property::Rate, None, "per_sec")
    } else if key.contains("throughput") || key.ends_with("_data") {
        (Property::Rate, None, "b_per_sec")
    } else if key.contains(TIMESTAMP) {
        (Property::Delta, None, "sec")
    } else {
        (Property::Raw, None, "")
    };

    let property = entry.property.unwrap_or(property);
    let base = match &entry.base {
        Some(b) if !b.is_empty() => Some(b.clone()),
        Some(_) => None,
        None if property.needs_base() => base,
        None => None,
    };
    let unit = entry.unit.clone().unwrap_or_else(|| unit.to_string());
    (property, base, unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(version: &str) -> Remote {
        Remote {
            name: "cluster1".into(),
            version: version.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_infers_from_names() {
        let template = vec![
            CounterTemplate::new("read_ops"),
            CounterTemplate::new("read_latency"),
            CounterTemplate::new("size => volume_size"),
        ];
        let table = CounterTable::build(&template, &remote("9.13.1"));

        let lat = table.get("read_latency").unwrap();
        assert_eq!(lat.property, Property::Average);
        assert_eq!(lat.base.as_deref(), Some("read_ops"));
        assert_eq!(lat.unit, "microsec");
        assert_eq!(table.get("read_ops").unwrap().property, Property::Rate);
        assert_eq!(table.get("size").unwrap().display, "volume_size");
        assert_eq!(table.get(TIMESTAMP).unwrap().property, Property::Delta);
        assert!(!table.get(TIMESTAMP).unwrap().exportable);
    }

    #[test]
    fn test_missing_base_is_hidden() {
        let template = vec![CounterTemplate::new("avg_size")
            .with_property(Property::Average)
            .with_base("total_ops")];
        let table = CounterTable::build(&template, &remote("9.13"));
        let base = table.get("total_ops").unwrap();
        assert_eq!(base.property, Property::Delta);
        assert!(!base.exportable);
    }

    #[test]
    fn test_min_version_excludes() {
        let mut entry = CounterTemplate::new("nvme_ops");
        entry.min_version = Some("9.14".into());
        let table = CounterTable::build(&[entry.clone()], &remote("9.13.1"));
        assert!(table.get("nvme_ops").is_none());
        assert_eq!(table.excluded(), ["nvme_ops"]);

        let table = CounterTable::build(&[entry], &remote("9.14.0"));
        assert!(table.get("nvme_ops").is_some());
    }

    #[test]
    fn test_sync_flattens_histogram() {
        let mut entry = CounterTemplate::new("read_latency_hist").with_property(Property::Delta);
        entry.buckets = vec!["<20us".into(), "20-40us".into(), ">40us".into()];
        entry.histogram = true;
        let table = CounterTable::build(&[entry], &remote("9.13"));

        let mut m = Matrix::new("KeyPerf", "volume", "volume");
        m.new_metric("stale", MetricType::Float64).unwrap();
        let (added, removed) = table.sync_metrics(&mut m).unwrap();
        assert_eq!(added, 4);
        assert_eq!(removed, 1);

        let root = m.metric("read_latency_hist").unwrap();
        assert!(root.is_histogram());
        assert!(!root.is_exportable());
        assert_eq!(root.buckets().unwrap().len(), 3);

        let bucket = m.metric("read_latency_hist#20-40us").unwrap();
        assert_eq!(bucket.label("metric"), Some("20-40us"));
        assert_eq!(bucket.bucket().unwrap().index, 1);
        assert_eq!(
            table.for_metric("read_latency_hist#>40us").unwrap().key,
            "read_latency_hist"
        );
    }
}
