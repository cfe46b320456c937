// Metric module - one column of a Matrix
//
// A metric owns a value vector and a record set of the same length as the
// instance list of its matrix. Values are kept as f64 regardless of the
// declared element type; the type only decides how a value is rendered.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::record::RecordSet;
use crate::error::MatrixError;

/// Numeric element type of a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    Uint8,
    Uint64,
    Int64,
    Float64,
}

impl FromStr for MetricType {
    type Err = MatrixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uint8" => Ok(MetricType::Uint8),
            "uint64" => Ok(MetricType::Uint64),
            "int64" => Ok(MetricType::Int64),
            "float64" => Ok(MetricType::Float64),
            other => Err(MatrixError::InvalidType(other.to_string())),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricType::Uint8 => "uint8",
            MetricType::Uint64 => "uint64",
            MetricType::Int64 => "int64",
            MetricType::Float64 => "float64",
        };
        f.write_str(s)
    }
}

/// How the raw samples of a counter are turned into an exported value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Property {
    #[default]
    Raw,
    Delta,
    Rate,
    Average,
    Percent,
    String,
    #[serde(other)]
    Unknown,
}

impl Property {
    /// Average and percent consume the delta of a base counter
    pub fn needs_base(self) -> bool {
        matches!(self, Property::Average | Property::Percent)
    }

    /// Properties whose raw samples are differenced between polls
    pub fn needs_delta(self) -> bool {
        matches!(
            self,
            Property::Delta | Property::Rate | Property::Average | Property::Percent
        )
    }
}

impl From<&str> for Property {
    fn from(s: &str) -> Self {
        match s {
            "raw" => Property::Raw,
            "delta" => Property::Delta,
            "rate" => Property::Rate,
            "average" => Property::Average,
            "percent" => Property::Percent,
            "string" => Property::String,
            _ => Property::Unknown,
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Property::Raw => "raw",
            Property::Delta => "delta",
            Property::Rate => "rate",
            Property::Average => "average",
            Property::Percent => "percent",
            Property::String => "string",
            Property::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Position of a flattened histogram bucket inside its root counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRef {
    pub root: String,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    key: String,
    name: String,
    mtype: MetricType,
    property: Property,
    comment: String,
    unit: String,
    exportable: bool,
    array: bool,
    histogram: bool,
    labels: BTreeMap<String, String>,
    buckets: Option<Arc<Vec<String>>>,
    bucket: Option<BucketRef>,
    values: Vec<f64>,
    record: RecordSet,
}

impl Metric {
    pub(super) fn new(key: &str, mtype: MetricType, len: usize) -> Self {
        Metric {
            key: key.to_string(),
            name: key.to_string(),
            mtype,
            property: Property::Raw,
            comment: String::new(),
            unit: String::new(),
            exportable: true,
            array: false,
            histogram: false,
            labels: BTreeMap::new(),
            buckets: None,
            bucket: None,
            values: vec![0.0; len],
            record: RecordSet::with_len(len),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Display name used on export; defaults to the key
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn mtype(&self) -> MetricType {
        self.mtype
    }

    pub fn property(&self) -> Property {
        self.property
    }

    pub fn set_property(&mut self, property: Property) {
        self.property = property;
    }

    /// Key of the base counter for average and percent metrics
    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn set_comment(&mut self, comment: &str) {
        self.comment = comment.to_string();
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn set_unit(&mut self, unit: &str) {
        self.unit = unit.to_string();
    }

    pub fn is_exportable(&self) -> bool {
        self.exportable
    }

    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }

    pub fn is_array(&self) -> bool {
        self.array
    }

    pub fn set_array(&mut self, array: bool) {
        self.array = array;
    }

    pub fn is_histogram(&self) -> bool {
        self.histogram
    }

    pub fn set_histogram(&mut self, histogram: bool) {
        self.histogram = histogram;
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.labels.insert(key.to_string(), value.to_string());
    }

    /// Ordered bucket labels of a histogram root
    pub fn buckets(&self) -> Option<&Arc<Vec<String>>> {
        self.buckets.as_ref()
    }

    pub fn set_buckets(&mut self, buckets: Arc<Vec<String>>) {
        self.buckets = Some(buckets);
    }

    pub fn bucket(&self) -> Option<&BucketRef> {
        self.bucket.as_ref()
    }

    pub fn set_bucket(&mut self, root: &str, index: usize) {
        self.bucket = Some(BucketRef {
            root: root.to_string(),
            index,
        });
    }

    /// Number of cells, always the instance count of the owning matrix
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the value at `index` if it is recorded
    pub fn value(&self, index: usize) -> Option<f64> {
        if self.record.get(index) {
            self.values.get(index).copied()
        } else {
            None
        }
    }

    pub fn is_recorded(&self, index: usize) -> bool {
        self.record.get(index)
    }

    pub fn set_recorded(&mut self, index: usize, recorded: bool) {
        self.record.set(index, recorded);
    }

    pub fn recorded_count(&self) -> usize {
        self.record.count_ones()
    }

    /// Stores `value` and marks the cell recorded
    pub fn set_value_f64(&mut self, index: usize, value: f64) {
        if let Some(cell) = self.values.get_mut(index) {
            *cell = value;
            self.record.set(index, true);
        }
    }

    pub fn set_value_u64(&mut self, index: usize, value: u64) {
        self.set_value_f64(index, value as f64);
    }

    pub fn set_value_i64(&mut self, index: usize, value: i64) {
        self.set_value_f64(index, value as f64);
    }

    /// Parses `value` as a number and stores it
    pub fn set_value_str(&mut self, index: usize, value: &str) -> Result<(), MatrixError> {
        let parsed = value
            .trim()
            .parse::<f64>()
            .map_err(|_| MatrixError::InvalidValue {
                key: self.key.clone(),
                value: value.to_string(),
            })?;
        self.set_value_f64(index, parsed);
        Ok(())
    }

    /// Adds to a recorded cell, or sets it if the cell is not recorded yet
    pub fn add_value_f64(&mut self, index: usize, value: f64) {
        match self.value(index) {
            Some(current) => self.set_value_f64(index, current + value),
            None => self.set_value_f64(index, value),
        }
    }

    /// Clears every recorded flag without touching the values
    pub fn clear_recorded(&mut self) {
        self.record.clear_all();
    }

    /// Clears the flags and zeroes all values
    pub fn reset(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0.0);
        self.record.clear_all();
    }

    /// Renders a recorded value according to the element type
    pub fn format_value(&self, index: usize) -> Option<String> {
        let value = self.value(index)?;
        Some(match self.mtype {
            MetricType::Float64 => format!("{value}"),
            MetricType::Int64 => format!("{}", value as i64),
            MetricType::Uint8 | MetricType::Uint64 => format!("{}", value as u64),
        })
    }

    pub(super) fn raw(&self, index: usize) -> f64 {
        self.values.get(index).copied().unwrap_or_default()
    }

    pub(super) fn push_cell(&mut self) {
        self.values.push(0.0);
        self.record.push(false);
    }

    pub(super) fn remove_cell(&mut self, index: usize) {
        if index < self.values.len() {
            self.values.remove(index);
            self.record.remove(index);
        }
    }

    pub(super) fn resize_empty(&mut self, len: usize) {
        self.values = vec![0.0; len];
        self.record = RecordSet::with_len(len);
    }

    /// Copies everything but the cells; used by clone without data
    pub(super) fn schema_copy(&self, len: usize) -> Self {
        Metric {
            key: self.key.clone(),
            name: self.name.clone(),
            mtype: self.mtype,
            property: self.property,
            comment: self.comment.clone(),
            unit: self.unit.clone(),
            exportable: self.exportable,
            array: self.array,
            histogram: self.histogram,
            labels: self.labels.clone(),
            buckets: self.buckets.clone(),
            bucket: self.bucket.clone(),
            values: vec![0.0; len],
            record: RecordSet::with_len(len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_type_parse() {
        assert_eq!("uint64".parse::<MetricType>().unwrap(), MetricType::Uint64);
        assert_eq!(
            "float32".parse::<MetricType>(),
            Err(MatrixError::InvalidType("float32".into()))
        );
    }

    #[test]
    fn test_property_flags() {
        assert!(Property::from("average").needs_base());
        assert!(Property::from("percent").needs_base());
        assert!(!Property::from("rate").needs_base());
        assert!(Property::from("rate").needs_delta());
        assert!(!Property::from("raw").needs_delta());
        assert_eq!(Property::from("bogus"), Property::Unknown);
    }

    #[test]
    fn test_value_requires_recorded() {
        let mut m = Metric::new("read_ops", MetricType::Float64, 2);
        assert_eq!(m.value(0), None);
        m.set_value_f64(0, 4.5);
        assert_eq!(m.value(0), Some(4.5));
        m.set_recorded(0, false);
        assert_eq!(m.value(0), None);
        assert_eq!(m.format_value(0), None);
    }

    #[test]
    fn test_set_value_str() {
        let mut m = Metric::new("size", MetricType::Uint64, 1);
        m.set_value_str(0, " 1024 ").unwrap();
        assert_eq!(m.format_value(0).as_deref(), Some("1024"));
        assert!(m.set_value_str(0, "n/a").is_err());
    }

    #[test]
    fn test_add_value_starts_from_unrecorded() {
        let mut m = Metric::new("count", MetricType::Float64, 1);
        m.add_value_f64(0, 2.0);
        m.add_value_f64(0, 3.0);
        assert_eq!(m.value(0), Some(5.0));
    }

    #[test]
    fn test_format_by_type() {
        let mut m = Metric::new("ratio", MetricType::Float64, 1);
        m.set_value_f64(0, 100.0);
        assert_eq!(m.format_value(0).as_deref(), Some("100"));
        m.set_value_f64(0, 0.5);
        assert_eq!(m.format_value(0).as_deref(), Some("0.5"));

        let mut i = Metric::new("delta", MetricType::Int64, 1);
        i.set_value_i64(0, -3);
        assert_eq!(i.format_value(0).as_deref(), Some("-3"));
    }
}
