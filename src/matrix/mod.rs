// Matrix module - the tabular data model shared by collectors, plugins and exporters
//
// A Matrix is a table of instances (rows, keyed by a stable string) and metrics
// (columns). Both keep creation order. Every metric holds one cell per
// instance; removing an instance compacts all metric vectors together.

mod arith;
mod instance;
mod metric;
mod record;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MatrixError;

pub use instance::Instance;
pub use metric::{BucketRef, Metric, MetricType, Property};
pub use record::RecordSet;

/// Selects what `Matrix::clone_with` copies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct With {
    pub data: bool,
    pub metrics: bool,
    pub instances: bool,
    pub exportable: bool,
    pub partial: bool,
}

impl With {
    /// Full structural copy
    pub const ALL: With = With {
        data: true,
        metrics: true,
        instances: true,
        exportable: true,
        partial: true,
    };

    /// Schema and instance identities with zeroed cells
    pub const SCHEMA: With = With {
        data: false,
        metrics: true,
        instances: true,
        exportable: true,
        partial: false,
    };
}

/// Which instance labels an exporter turns into series labels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    /// Labels attached to every metric line
    pub instance_keys: Vec<String>,
    /// Labels emitted once per instance in a `_labels` series
    pub instance_labels: Vec<String>,
    /// Attach every instance label, ignoring `instance_keys`; implied when
    /// no `instance_keys` are declared
    pub include_all_labels: bool,
    /// Drop an instance whose key labels are all empty
    pub require_instance_keys: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions {
            instance_keys: Vec::new(),
            instance_labels: Vec::new(),
            include_all_labels: false,
            require_instance_keys: true,
        }
    }
}

impl ExportOptions {
    pub fn all_labels(&self) -> bool {
        self.include_all_labels || self.instance_keys.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    uuid: String,
    object: String,
    identifier: String,
    exportable: bool,
    global_labels: BTreeMap<String, String>,
    export_options: ExportOptions,
    instances: Vec<Instance>,
    instance_index: HashMap<String, usize>,
    metrics: Vec<Metric>,
    metric_index: HashMap<String, usize>,
}

impl Matrix {
    /// Creates an empty matrix
    ///
    /// # Arguments
    /// * `uuid` - Identifier of the owning collector (e.g. "ZapiPerf")
    /// * `object` - Object name used as the export prefix (e.g. "volume")
    /// * `identifier` - Unique key of this matrix within its collector
    pub fn new(uuid: &str, object: &str, identifier: &str) -> Self {
        Matrix {
            uuid: uuid.to_string(),
            object: object.to_string(),
            identifier: identifier.to_string(),
            exportable: true,
            global_labels: BTreeMap::new(),
            export_options: ExportOptions::default(),
            instances: Vec::new(),
            instance_index: HashMap::new(),
            metrics: Vec::new(),
            metric_index: HashMap::new(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn set_uuid(&mut self, uuid: &str) {
        self.uuid = uuid.to_string();
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn set_object(&mut self, object: &str) {
        self.object = object.to_string();
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn set_identifier(&mut self, identifier: &str) {
        self.identifier = identifier.to_string();
    }

    /// Matrices used only as plugin input are not handed to exporters
    pub fn is_exportable(&self) -> bool {
        self.exportable
    }

    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }

    pub fn global_labels(&self) -> &BTreeMap<String, String> {
        &self.global_labels
    }

    pub fn set_global_label(&mut self, key: &str, value: &str) {
        self.global_labels.insert(key.to_string(), value.to_string());
    }

    pub fn set_global_labels<'a>(&mut self, labels: impl IntoIterator<Item = (&'a String, &'a String)>) {
        for (k, v) in labels {
            self.global_labels.insert(k.clone(), v.clone());
        }
    }

    pub fn export_options(&self) -> &ExportOptions {
        &self.export_options
    }

    pub fn set_export_options(&mut self, options: ExportOptions) {
        self.export_options = options;
    }

    /// Produces a new matrix according to `with`
    ///
    /// Copying partial flags without data is rejected: the flag describes the
    /// cells it was sampled with.
    pub fn clone_with(&self, with: With) -> Result<Matrix, MatrixError> {
        if with.partial && !with.data {
            return Err(MatrixError::InvalidCloneOptions("partial flags require data"));
        }

        let mut clone = Matrix {
            uuid: self.uuid.clone(),
            object: self.object.clone(),
            identifier: self.identifier.clone(),
            exportable: self.exportable,
            global_labels: self.global_labels.clone(),
            export_options: self.export_options.clone(),
            instances: Vec::new(),
            instance_index: HashMap::new(),
            metrics: Vec::new(),
            metric_index: HashMap::new(),
        };

        if with.instances {
            clone.instances = self
                .instances
                .iter()
                .map(|inst| {
                    let mut copy = inst.identity_copy();
                    if with.exportable {
                        copy.set_exportable(inst.is_exportable());
                    }
                    if with.partial {
                        copy.set_partial(inst.is_partial());
                    }
                    copy
                })
                .collect();
            clone.instance_index = self.instance_index.clone();
        }

        if with.metrics {
            let len = clone.instances.len();
            clone.metrics = self
                .metrics
                .iter()
                .map(|m| {
                    if with.data && with.instances {
                        m.clone()
                    } else {
                        m.schema_copy(len)
                    }
                })
                .collect();
            clone.metric_index = self.metric_index.clone();
        }

        Ok(clone)
    }

    /// Appends an instance; every metric grows by one unrecorded cell
    pub fn new_instance(&mut self, key: &str) -> Result<&mut Instance, MatrixError> {
        if self.instance_index.contains_key(key) {
            return Err(MatrixError::AlreadyExists(key.to_string()));
        }
        let index = self.instances.len();
        self.instances.push(Instance::new(key));
        self.instance_index.insert(key.to_string(), index);
        for metric in &mut self.metrics {
            metric.push_cell();
        }
        Ok(&mut self.instances[index])
    }

    /// Appends a metric with one unrecorded cell per instance
    pub fn new_metric(&mut self, key: &str, mtype: MetricType) -> Result<&mut Metric, MatrixError> {
        if self.metric_index.contains_key(key) {
            return Err(MatrixError::AlreadyExists(key.to_string()));
        }
        let index = self.metrics.len();
        self.metrics.push(Metric::new(key, mtype, self.instances.len()));
        self.metric_index.insert(key.to_string(), index);
        Ok(&mut self.metrics[index])
    }

    /// Like `new_metric` with the element type given by name ("float64", ...)
    pub fn new_metric_typed(&mut self, key: &str, mtype: &str) -> Result<&mut Metric, MatrixError> {
        let mtype = mtype.parse::<MetricType>()?;
        self.new_metric(key, mtype)
    }

    pub fn instance(&self, key: &str) -> Option<&Instance> {
        self.instance_index.get(key).map(|&i| &self.instances[i])
    }

    pub fn instance_mut(&mut self, key: &str) -> Option<&mut Instance> {
        match self.instance_index.get(key) {
            Some(&i) => Some(&mut self.instances[i]),
            None => None,
        }
    }

    /// Position of an instance in every metric vector
    pub fn instance_index(&self, key: &str) -> Option<usize> {
        self.instance_index.get(key).copied()
    }

    /// Instances in creation order
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn instances_mut(&mut self) -> impl Iterator<Item = &mut Instance> {
        self.instances.iter_mut()
    }

    pub fn instance_keys(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.key().to_string()).collect()
    }

    pub fn metric(&self, key: &str) -> Option<&Metric> {
        self.metric_index.get(key).map(|&i| &self.metrics[i])
    }

    pub fn metric_mut(&mut self, key: &str) -> Option<&mut Metric> {
        match self.metric_index.get(key) {
            Some(&i) => Some(&mut self.metrics[i]),
            None => None,
        }
    }

    /// Metrics in creation order
    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> impl Iterator<Item = &mut Metric> {
        self.metrics.iter_mut()
    }

    pub fn metric_keys(&self) -> Vec<String> {
        self.metrics.iter().map(|m| m.key().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Removes an instance and compacts every metric vector
    pub fn remove_instance(&mut self, key: &str) -> Option<Instance> {
        let index = self.instance_index.remove(key)?;
        let removed = self.instances.remove(index);
        for metric in &mut self.metrics {
            metric.remove_cell(index);
        }
        for pos in self.instance_index.values_mut() {
            if *pos > index {
                *pos -= 1;
            }
        }
        Some(removed)
    }

    pub fn remove_metric(&mut self, key: &str) -> Option<Metric> {
        let index = self.metric_index.remove(key)?;
        let removed = self.metrics.remove(index);
        for pos in self.metric_index.values_mut() {
            if *pos > index {
                *pos -= 1;
            }
        }
        Some(removed)
    }

    /// Drops every instance; metrics stay with empty vectors
    pub fn purge_instances(&mut self) {
        self.instances.clear();
        self.instance_index.clear();
        for metric in &mut self.metrics {
            metric.resize_empty(0);
        }
    }

    /// Clears all recorded flags and zeroes the cells, schema unchanged
    pub fn reset(&mut self) {
        for metric in &mut self.metrics {
            metric.reset();
        }
    }

    /// Clears one row
    pub fn reset_instance(&mut self, key: &str) -> Result<(), MatrixError> {
        let index = self
            .instance_index(key)
            .ok_or_else(|| MatrixError::NotFound(key.to_string()))?;
        for metric in &mut self.metrics {
            metric.set_recorded(index, false);
        }
        Ok(())
    }

    /// Recorded value of a cell addressed by keys
    pub fn value(&self, metric: &str, instance: &str) -> Option<f64> {
        let index = self.instance_index(instance)?;
        self.metric(metric)?.value(index)
    }

    /// Sets a cell addressed by keys
    pub fn lazy_set_value(&mut self, metric: &str, instance: &str, value: f64) -> Result<(), MatrixError> {
        let index = self
            .instance_index(instance)
            .ok_or_else(|| MatrixError::NotFound(instance.to_string()))?;
        self.metric_mut(metric)
            .ok_or_else(|| MatrixError::NotFound(metric.to_string()))?
            .set_value_f64(index, value);
        Ok(())
    }

    /// Adds to a cell addressed by keys
    pub fn lazy_add_value(&mut self, metric: &str, instance: &str, value: f64) -> Result<(), MatrixError> {
        let index = self
            .instance_index(instance)
            .ok_or_else(|| MatrixError::NotFound(instance.to_string()))?;
        self.metric_mut(metric)
            .ok_or_else(|| MatrixError::NotFound(metric.to_string()))?
            .add_value_f64(index, value);
        Ok(())
    }

    /// Dumps the table at debug level
    pub fn print(&self) {
        debug!(
            uuid = %self.uuid,
            object = %self.object,
            instances = self.instances.len(),
            metrics = self.metrics.len(),
            "matrix {}", self.identifier
        );
        for (i, inst) in self.instances.iter().enumerate() {
            let cells: Vec<String> = self
                .metrics
                .iter()
                .map(|m| match m.format_value(i) {
                    Some(v) => format!("{}={}", m.key(), v),
                    None => format!("{}=-", m.key()),
                })
                .collect();
            debug!(
                instance = %inst.key(),
                exportable = inst.is_exportable(),
                partial = inst.is_partial(),
                "{}",
                cells.join(" ")
            );
        }
    }

    /// Borrows one metric mutably and another immutably
    pub(crate) fn metric_pair(&mut self, target: usize, source: usize) -> (&mut Metric, &Metric) {
        if target < source {
            let (left, right) = self.metrics.split_at_mut(source);
            (&mut left[target], &right[0])
        } else {
            let (left, right) = self.metrics.split_at_mut(target);
            (&mut right[0], &left[source])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume_matrix() -> Matrix {
        let mut m = Matrix::new("KeyPerf", "volume", "KeyPerf:volume");
        m.set_global_label("cluster", "c1");
        for key in ["vol0", "vol1", "vol2"] {
            m.new_instance(key).unwrap().set_label("volume", key);
        }
        m.new_metric("read_ops", MetricType::Float64).unwrap();
        m.new_metric("total_ops", MetricType::Uint64).unwrap();
        for (i, v) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            m.metric_mut("read_ops").unwrap().set_value_f64(i, v);
        }
        m
    }

    #[test]
    fn test_new_instance_and_metric_collisions() {
        let mut m = volume_matrix();
        assert_eq!(
            m.new_instance("vol0").unwrap_err(),
            MatrixError::AlreadyExists("vol0".into())
        );
        assert!(matches!(
            m.new_metric("read_ops", MetricType::Float64),
            Err(MatrixError::AlreadyExists(_))
        ));
        assert!(matches!(
            m.new_metric_typed("x", "complex128"),
            Err(MatrixError::InvalidType(_))
        ));
    }

    #[test]
    fn test_vectors_follow_instances() {
        let mut m = volume_matrix();
        m.new_instance("vol3").unwrap();
        for metric in m.metrics() {
            assert_eq!(metric.len(), m.instances().len());
        }
        assert!(!m.metric("read_ops").unwrap().is_recorded(3));
    }

    #[test]
    fn test_remove_instance_compacts() {
        let mut m = volume_matrix();
        m.remove_instance("vol1").unwrap();
        assert_eq!(m.instance_keys(), vec!["vol0", "vol2"]);
        assert_eq!(m.instance_index("vol2"), Some(1));
        assert_eq!(m.value("read_ops", "vol2"), Some(30.0));
        assert_eq!(m.metric("read_ops").unwrap().len(), 2);
        assert!(m.remove_instance("vol1").is_none());
    }

    #[test]
    fn test_remove_metric_reindexes() {
        let mut m = volume_matrix();
        m.new_metric("write_ops", MetricType::Float64).unwrap();
        m.remove_metric("read_ops").unwrap();
        assert_eq!(m.metric_keys(), vec!["total_ops", "write_ops"]);
        assert!(m.metric_mut("write_ops").is_some());
    }

    #[test]
    fn test_clone_schema_zeroes_data() {
        let mut m = volume_matrix();
        m.instance_mut("vol0").unwrap().set_exportable(false);
        let c = m.clone_with(With::SCHEMA).unwrap();
        assert_eq!(c.instance_keys(), m.instance_keys());
        assert_eq!(c.metric_keys(), m.metric_keys());
        assert_eq!(c.metric("read_ops").unwrap().recorded_count(), 0);
        assert_eq!(c.metric("read_ops").unwrap().len(), 3);
        assert!(!c.instance("vol0").unwrap().is_exportable());
        assert_eq!(c.global_labels().get("cluster").map(String::as_str), Some("c1"));
    }

    #[test]
    fn test_clone_without_instances() {
        let m = volume_matrix();
        let c = m
            .clone_with(With {
                data: false,
                metrics: true,
                instances: false,
                exportable: false,
                partial: false,
            })
            .unwrap();
        assert!(c.instances().is_empty());
        assert_eq!(c.metric("read_ops").unwrap().len(), 0);
    }

    #[test]
    fn test_clone_partial_requires_data() {
        let m = volume_matrix();
        let opts = With {
            data: false,
            partial: true,
            ..With::ALL
        };
        assert!(matches!(
            m.clone_with(opts),
            Err(MatrixError::InvalidCloneOptions(_))
        ));
    }

    #[test]
    fn test_clone_all_is_fixed_point() {
        let mut m = volume_matrix();
        m.instance_mut("vol2").unwrap().set_partial(true);
        let once = m.clone_with(With::ALL).unwrap();
        let twice = once.clone_with(With::ALL).unwrap();
        assert_eq!(once, twice);
        assert!(twice.instance("vol2").unwrap().is_partial());
    }

    #[test]
    fn test_reset_keeps_schema() {
        let mut m = volume_matrix();
        m.reset();
        assert_eq!(m.instances().len(), 3);
        assert_eq!(m.metric("read_ops").unwrap().recorded_count(), 0);
    }

    #[test]
    fn test_lazy_helpers() {
        let mut m = volume_matrix();
        m.lazy_set_value("total_ops", "vol1", 5.0).unwrap();
        m.lazy_add_value("total_ops", "vol1", 2.0).unwrap();
        assert_eq!(m.value("total_ops", "vol1"), Some(7.0));
        assert_eq!(
            m.lazy_set_value("nope", "vol1", 1.0),
            Err(MatrixError::NotFound("nope".into()))
        );
        m.reset_instance("vol1").unwrap();
        assert_eq!(m.value("total_ops", "vol1"), None);
    }

    #[test]
    fn test_purge_instances() {
        let mut m = volume_matrix();
        m.purge_instances();
        assert!(m.is_empty());
        assert_eq!(m.metric("read_ops").unwrap().len(), 0);
        m.new_instance("vol9").unwrap();
        assert_eq!(m.metric("read_ops").unwrap().len(), 1);
    }
}
