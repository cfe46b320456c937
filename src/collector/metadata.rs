// Collector metadata - poll timings and counts exported next to the data
//
// One row per task (counter, instance, data) plus a `plugin` row. The
// `status` metric on the data row carries the collector status code.

use std::time::Duration;

use tracing::debug;

use super::Status;
use crate::matrix::{ExportOptions, Matrix, MetricType};

/// Object name of every collector metadata matrix
pub const OBJECT: &str = "metadata_collector";

pub const ROWS: [&str; 4] = ["counter", "instance", "data", "plugin"];

pub const METRICS: [&str; 14] = [
    "poll_time",
    "task_time",
    "api_time",
    "parse_time",
    "calc_time",
    "plugin_time",
    "count",
    "instances",
    "metrics",
    "skips",
    "numCalls",
    "bytesRx",
    "numPartials",
    "status",
];

#[derive(Debug, Clone)]
pub struct Metadata {
    matrix: Matrix,
    status: Status,
    reason: String,
}

impl Metadata {
    /// Creates the metadata matrix of one collector/object pair
    ///
    /// # Arguments
    /// * `collector` - Collector name
    /// * `object` - Object the collector polls
    /// * `poller` - Poller name
    /// * `intervals` - Interval per task row, exported as the `interval` label
    pub fn new(collector: &str, object: &str, poller: &str, intervals: &[(&str, Duration)]) -> Self {
        let mut matrix = Matrix::new(collector, OBJECT, &format!("{collector}:{object}"));
        let hostname = sysinfo::System::host_name().unwrap_or_default();
        matrix.set_global_label("hostname", &hostname);
        matrix.set_global_label("version", env!("CARGO_PKG_VERSION"));
        matrix.set_global_label("poller", poller);
        matrix.set_global_label("collector", collector);
        matrix.set_global_label("object", object);
        matrix.set_export_options(ExportOptions::default());

        for key in METRICS {
            let mtype = if key == "status" {
                MetricType::Uint8
            } else {
                MetricType::Int64
            };
            if let Err(err) = matrix.new_metric(key, mtype) {
                debug!(metric = key, error = %err, "metadata metric not created");
            }
        }
        for row in ROWS {
            if let Ok(instance) = matrix.new_instance(row) {
                instance.set_label("task", row);
                if let Some((_, interval)) = intervals.iter().find(|(name, _)| *name == row) {
                    instance.set_label("interval", &format!("{:.4}", interval.as_secs_f64()));
                }
            }
        }

        let mut metadata = Metadata {
            matrix,
            status: Status::Up,
            reason: "initialized".to_string(),
        };
        metadata.apply_status();
        metadata
    }

    pub fn matrix(&self) -> &Matrix {
        &self.matrix
    }

    pub fn set(&mut self, metric: &str, row: &str, value: f64) {
        if let Err(err) = self.matrix.lazy_set_value(metric, row, value) {
            debug!(metric, row, error = %err, "metadata not set");
        }
    }

    pub fn add(&mut self, metric: &str, row: &str, value: f64) {
        if let Err(err) = self.matrix.lazy_add_value(metric, row, value) {
            debug!(metric, row, error = %err, "metadata not added");
        }
    }

    /// Stores a duration in microseconds
    pub fn set_duration(&mut self, metric: &str, row: &str, value: Duration) {
        self.set(metric, row, value.as_micros() as f64);
    }

    pub fn value(&self, metric: &str, row: &str) -> Option<f64> {
        self.matrix.value(metric, row)
    }

    /// Clears the row of a task before it runs again
    pub fn reset_row(&mut self, row: &str) {
        if let Err(err) = self.matrix.reset_instance(row) {
            debug!(row, error = %err, "metadata row not reset");
        }
        if row == "data" {
            self.apply_status();
        }
    }

    pub fn status(&self) -> (Status, &str) {
        (self.status, &self.reason)
    }

    pub fn set_status(&mut self, status: Status, reason: &str) {
        self.status = status;
        self.reason = reason.to_string();
        self.apply_status();
    }

    fn apply_status(&mut self) {
        self.set("status", "data", f64::from(self.status.code()));
        if let Some(data) = self.matrix.instance_mut("data") {
            data.set_label("reason", &self.reason);
        }
    }
}
