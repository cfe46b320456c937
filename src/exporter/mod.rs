// Exporter module - where cooked matrices leave the poller
//
// Two kinds: a scrape endpoint that caches rendered blocks for Prometheus,
// and a push exporter that posts line protocol to InfluxDB. Both are shared
// by every collector runner of a poller, so `export` takes `&self`.

pub mod influx;
pub mod prometheus;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ExporterKind, ExporterSpec};
use crate::error::ExportError;
use crate::matrix::{ExportOptions, Matrix, MetricType};

pub use influx::Influx;
pub use prometheus::Prometheus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterStatus {
    Up,
    Failed,
}

#[async_trait]
pub trait Exporter: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ExporterKind;

    /// Current status and the reason for it
    fn status(&self) -> (ExporterStatus, String);

    fn is_up(&self) -> bool {
        self.status().0 == ExporterStatus::Up
    }

    /// Renders `data` and hands it to the destination
    async fn export(&self, data: &Matrix) -> Result<(), ExportError>;

    /// Starts background tasks (HTTPd, cache janitor)
    fn start(self: Arc<Self>, _shutdown: CancellationToken) -> Result<Vec<JoinHandle<()>>, ExportError> {
        Ok(Vec::new())
    }
}

/// Builds the exporter described by `spec`
///
/// # Arguments
/// * `spec` - Exporter descriptor from the poller file
/// * `poller` - Poller name, exported as a label of exporter metadata
pub fn build(spec: &ExporterSpec, poller: &str) -> Result<Arc<dyn Exporter>, ExportError> {
    let exporter: Arc<dyn Exporter> = match spec.kind {
        ExporterKind::Prometheus => Arc::new(Prometheus::new(spec, poller)?),
        ExporterKind::InfluxDb => Arc::new(Influx::new(spec, poller)?),
    };
    debug!(exporter = %spec.name, kind = ?spec.kind, "exporter built");
    Ok(exporter)
}

/// Object name of exporter metadata
pub const METADATA_OBJECT: &str = "metadata_exporter";

/// Rows of the exporter metadata matrix
pub const METADATA_ROWS: [&str; 4] = ["export", "render", "http", "info"];

/// Timings and counts of one exporter, exported with its own data
#[derive(Debug, Clone)]
pub struct ExporterMetadata {
    matrix: Matrix,
}

impl ExporterMetadata {
    pub fn new(exporter: &str, kind: &str, poller: &str) -> Self {
        let mut matrix = Matrix::new(exporter, METADATA_OBJECT, &format!("{kind}:{exporter}"));
        matrix.set_global_label("hostname", &sysinfo::System::host_name().unwrap_or_default());
        matrix.set_global_label("version", env!("CARGO_PKG_VERSION"));
        matrix.set_global_label("poller", poller);
        matrix.set_global_label("exporter", kind);
        matrix.set_global_label("target", exporter);
        matrix.set_export_options(ExportOptions::default());
        for metric in ["time", "count"] {
            if let Err(err) = matrix.new_metric(metric, MetricType::Int64) {
                debug!(metric, error = %err, "exporter metadata metric not created");
            }
        }
        for row in METADATA_ROWS {
            if let Ok(instance) = matrix.new_instance(row) {
                instance.set_label("task", row);
            }
        }
        ExporterMetadata { matrix }
    }

    pub fn matrix(&self) -> &Matrix {
        &self.matrix
    }

    /// Stores the time (microseconds) and item count of a task row
    pub fn set(&mut self, row: &str, elapsed: Duration, count: usize) {
        let time = elapsed.as_micros() as f64;
        for (metric, value) in [("time", time), ("count", count as f64)] {
            if let Err(err) = self.matrix.lazy_set_value(metric, row, value) {
                debug!(metric, row, error = %err, "exporter metadata not set");
            }
        }
    }

    pub fn value(&self, metric: &str, row: &str) -> Option<f64> {
        self.matrix.value(metric, row)
    }
}
