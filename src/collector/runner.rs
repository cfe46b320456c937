// Collector runner - the task that owns one collector/object pair
//
// This module is responsible for:
// 1. Sleeping until the next task of the schedule is due
// 2. Running due poll functions sequentially, catching panics
// 3. Classifying errors into standby, failed or "log and continue"
// 4. Running plugins after data polls and handing matrices to exporters
//
// Nothing else touches the collector's matrices, so no locking is needed.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Collector, CollectorContext, DataMap, Metadata, Remote, Status, TaskKind};
use crate::config::ScheduleSpec;
use crate::error::PollError;
use crate::exporter::Exporter;
use crate::matrix::Matrix;
use crate::plugin::PluginSlot;
use crate::schedule::Schedule;

/// Retry after a connection failure starts here and grows by `BACKOFF_FACTOR`
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_FACTOR: u32 = 4;
pub const BACKOFF_MAX: Duration = Duration::from_secs(1024);

pub const NO_INSTANCE_RETRY: Duration = Duration::from_secs(5 * 60);
pub const NO_METRIC_RETRY: Duration = Duration::from_secs(60 * 60);
pub const AUTH_RETRY: Duration = Duration::from_secs(10 * 60);

/// Retry interval after `failures` consecutive connection failures
pub fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    BACKOFF_BASE
        .saturating_mul(BACKOFF_FACTOR.saturating_pow(exp))
        .min(BACKOFF_MAX)
}

fn interval_of(schedule: &ScheduleSpec, kind: TaskKind) -> Duration {
    match kind {
        TaskKind::Counter => schedule.counter,
        TaskKind::Instance => schedule.instance,
        TaskKind::Data => schedule.data,
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs `fut`, turning a panic into `PollError::Panic`
async fn guarded<T>(fut: impl Future<Output = Result<T, PollError>>) -> Result<T, PollError> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(PollError::Panic(panic_message(panic))))
}

/// What the loop does after a failed task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Continue,
    Standby,
    Stop,
}

pub struct CollectorRunner {
    collector: Box<dyn Collector>,
    name: String,
    object: String,
    schedule: Schedule<TaskKind>,
    plugins: Vec<PluginSlot>,
    exporters: Vec<Arc<dyn Exporter>>,
    metadata: Metadata,
    failures: u32,
}

impl CollectorRunner {
    /// Builds the schedule of `collector` from its descriptor
    ///
    /// # Arguments
    /// * `collector` - Collector of one object
    /// * `ctx` - Descriptor and poller context the collector was built from
    /// * `plugins` - Plugins of the collector, in declaration order
    /// * `exporters` - Exporters the collector writes to
    pub fn new(
        collector: Box<dyn Collector>,
        ctx: &CollectorContext,
        plugins: Vec<PluginSlot>,
        exporters: Vec<Arc<dyn Exporter>>,
    ) -> Result<Self, PollError> {
        let spec = &ctx.spec.schedule;
        let mut schedule = Schedule::new();
        let mut intervals = Vec::new();
        for kind in collector.tasks() {
            let interval = interval_of(spec, kind);
            schedule.new_task(kind.as_str(), interval, spec.jitter, kind, true)?;
            intervals.push((kind.as_str(), interval));
        }
        if schedule.tasks().is_empty() {
            return Err(PollError::MissingParam(format!("tasks of collector {}", collector.name())));
        }

        let name = collector.name().to_string();
        let object = collector.object().to_string();
        let metadata = Metadata::new(&name, &object, &ctx.poller, &intervals);
        Ok(CollectorRunner {
            collector,
            name,
            object,
            schedule,
            plugins,
            exporters,
            metadata,
            failures: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn status(&self) -> (Status, &str) {
        self.metadata.status()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn schedule(&self) -> &Schedule<TaskKind> {
        &self.schedule
    }

    /// Initializes the collector, then its plugins
    pub async fn init(&mut self) -> Result<Remote, PollError> {
        let remote = guarded(self.collector.init()).await?;
        for slot in &mut self.plugins {
            slot.plugin_mut().init(&remote)?;
        }
        self.metadata.set_status(Status::Up, "running");
        Ok(remote)
    }

    /// Polls until `shutdown` fires
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(collector = %self.name, object = %self.object, "started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if !self.run_due().await {
                break;
            }
            self.export_metadata().await;

            let wait = self.schedule.next_due();
            debug!(collector = %self.name, object = %self.object, wait = ?wait, "sleeping");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!(collector = %self.name, object = %self.object, "stopped");
    }

    /// Runs every due task once; false when the collector must stop
    pub async fn run_due(&mut self) -> bool {
        for name in self.schedule.due_tasks(Instant::now()) {
            let Some(kind) = self.schedule.start(&name) else {
                continue;
            };
            let start = Instant::now();
            let result = self.poll(kind).await;
            let elapsed = start.elapsed();
            self.metadata.set_duration("poll_time", kind.as_str(), elapsed);
            if let Some(task) = self.schedule.task(&name) {
                if elapsed > task.interval() {
                    warn!(
                        collector = %self.name,
                        object = %self.object,
                        task = %name,
                        elapsed = ?elapsed,
                        interval = ?task.interval(),
                        "poll took longer than its interval"
                    );
                }
            }

            match result {
                Ok(data) => {
                    self.on_success(kind);
                    if kind == TaskKind::Data {
                        self.run_plugins_and_export(data).await;
                    } else {
                        export_all(&self.exporters, &self.name, data.values()).await;
                    }
                    self.metadata.set_duration("task_time", kind.as_str(), start.elapsed());
                }
                Err(err) => match self.on_error(kind, err) {
                    Verdict::Continue => {}
                    // other tasks are hidden until recovery
                    Verdict::Standby => break,
                    Verdict::Stop => return false,
                },
            }
        }
        true
    }

    async fn poll(&mut self, kind: TaskKind) -> Result<DataMap, PollError> {
        self.metadata.reset_row(kind.as_str());
        let collector = &mut self.collector;
        let meta = &mut self.metadata;
        guarded(async move {
            match kind {
                TaskKind::Counter => collector.poll_counter(meta).await,
                TaskKind::Instance => collector.poll_instance(meta).await,
                TaskKind::Data => collector.poll_data(meta).await,
            }
        })
        .await
    }

    fn on_success(&mut self, kind: TaskKind) {
        self.failures = 0;
        if self.schedule.standby_task() == Some(kind.as_str()) {
            info!(collector = %self.name, object = %self.object, task = %kind.as_str(), "recovered from standby");
            self.schedule.recover();
            self.collector.on_recover();
            self.metadata.set_status(Status::Up, "running");
        } else if self.metadata.status().0 != Status::Up {
            self.metadata.set_status(Status::Up, "running");
        }
    }

    fn on_error(&mut self, kind: TaskKind, err: PollError) -> Verdict {
        let task = kind.as_str();
        let (status, retry) = match &err {
            PollError::Connection(_) => {
                self.failures = self.failures.saturating_add(1);
                (Status::Standby, backoff(self.failures))
            }
            PollError::AuthFailed(_) => (Status::Standby, AUTH_RETRY),
            PollError::NoInstance(_) => (Status::Standby, NO_INSTANCE_RETRY),
            PollError::NoMetric(_) => (Status::Standby, NO_METRIC_RETRY),
            PollError::Panic(_) => {
                self.failures = self.failures.saturating_add(1);
                (Status::Failed, backoff(self.failures))
            }
            PollError::MissingParam(_) | PollError::InvalidParam(_) => {
                error!(collector = %self.name, object = %self.object, task, error = %err, "configuration error, stopping");
                self.metadata.set_status(Status::Failed, err.kind());
                return Verdict::Stop;
            }
            PollError::WrongTemplate(_) => {
                warn!(collector = %self.name, object = %self.object, task, error = %err, "template mismatch");
                return Verdict::Continue;
            }
            PollError::ApiResponse(_) | PollError::ApiRequestRejected(_) | PollError::Matrix(_) => {
                error!(collector = %self.name, object = %self.object, task, error = %err, "poll failed");
                return Verdict::Continue;
            }
        };

        match status {
            Status::Failed => {
                error!(collector = %self.name, object = %self.object, task, error = %err, retry = ?retry, "collector failed")
            }
            _ => {
                warn!(collector = %self.name, object = %self.object, task, error = %err, retry = ?retry, "entering standby")
            }
        }
        self.metadata.set_status(status, err.kind());
        if let Err(e) = self.schedule.set_standby(task, retry) {
            error!(collector = %self.name, task, error = %e, "set standby");
            return Verdict::Continue;
        }
        self.collector.on_standby();
        Verdict::Standby
    }

    async fn run_plugins_and_export(&mut self, mut data: DataMap) {
        let start = Instant::now();
        let mut extra: Vec<Matrix> = Vec::new();
        let (mut instances, mut metrics) = (0, 0);
        for slot in &mut self.plugins {
            if !slot.due() {
                continue;
            }
            let name = slot.name().to_string();
            let plugin = slot.plugin_mut();
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| plugin.run(&mut data)))
                .unwrap_or_else(|panic| Err(PollError::Panic(panic_message(panic))));
            match result {
                Ok(output) => {
                    instances += output.instances;
                    metrics += output.metrics;
                    extra.extend(output.matrices);
                }
                Err(e) => error!(collector = %self.name, object = %self.object, plugin = %name, error = %e, "plugin failed"),
            }
        }
        if !self.plugins.is_empty() {
            self.metadata.set_duration("plugin_time", "data", start.elapsed());
            self.metadata.set_duration("poll_time", "plugin", start.elapsed());
            self.metadata.set("instances", "plugin", instances as f64);
            self.metadata.set("metrics", "plugin", metrics as f64);
        }

        export_all(&self.exporters, &self.name, data.values().chain(extra.iter())).await;
    }

    async fn export_metadata(&mut self) {
        export_all(&self.exporters, &self.name, std::iter::once(self.metadata.matrix())).await;
    }
}

/// Hands every exportable matrix to every exporter that is up
async fn export_all<'a>(
    exporters: &[Arc<dyn Exporter>],
    collector: &str,
    matrices: impl Iterator<Item = &'a Matrix>,
) {
    for matrix in matrices {
        if !matrix.is_exportable() {
            debug!(object = %matrix.object(), "skip export, matrix not exportable");
            continue;
        }
        for exporter in exporters {
            if !exporter.is_up() {
                debug!(exporter = %exporter.name(), "skip export, exporter down");
                continue;
            }
            if let Err(e) = exporter.export(matrix).await {
                warn!(
                    collector,
                    object = %matrix.object(),
                    exporter = %exporter.name(),
                    error = %e,
                    "export failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::perf::tests::{context, volume_sample, volume_source};
    use crate::collector::perf::PerfCollector;
    use crate::config::ExporterKind;
    use crate::error::ExportError;
    use crate::exporter::ExporterStatus;
    use crate::plugin::{Plugin, PluginOutput};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        exported: Mutex<Vec<Matrix>>,
        down: bool,
    }

    impl Recorder {
        fn objects(&self) -> Vec<String> {
            self.exported.lock().iter().map(|m| m.object().to_string()).collect()
        }
    }

    #[async_trait]
    impl Exporter for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn kind(&self) -> ExporterKind {
            ExporterKind::Prometheus
        }

        fn status(&self) -> (ExporterStatus, String) {
            if self.down {
                (ExporterStatus::Failed, "down".into())
            } else {
                (ExporterStatus::Up, String::new())
            }
        }

        async fn export(&self, data: &Matrix) -> Result<(), ExportError> {
            self.exported.lock().push(data.clone());
            Ok(())
        }
    }

    struct Panicky;

    impl Plugin for Panicky {
        fn name(&self) -> &str {
            "Panicky"
        }

        fn run(&mut self, _data: &mut DataMap) -> Result<PluginOutput, PollError> {
            panic!("plugin bug");
        }
    }

    struct Copier;

    impl Plugin for Copier {
        fn name(&self) -> &str {
            "Copier"
        }

        fn run(&mut self, data: &mut DataMap) -> Result<PluginOutput, PollError> {
            let matrices = data
                .values()
                .map(|m| {
                    let mut copy = m.clone();
                    copy.set_object(&format!("{}_copy", m.object()));
                    copy
                })
                .collect();
            Ok(PluginOutput {
                matrices,
                instances: 1,
                metrics: 2,
            })
        }
    }

    fn runner(
        polls: Vec<Result<Vec<crate::collector::perf::Sample>, PollError>>,
        plugins: Vec<PluginSlot>,
        exporter: Arc<Recorder>,
    ) -> CollectorRunner {
        let ctx = context("KeyPerf", "volume", "schedule:\n  counter: 1h\n  instance: 30m\n  data: 10s\n");
        let collector = PerfCollector::new(&ctx, volume_source(polls)).unwrap();
        CollectorRunner::new(Box::new(collector), &ctx, plugins, vec![exporter as Arc<dyn Exporter>]).unwrap()
    }

    #[test]
    fn test_backoff() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(4));
        assert_eq!(backoff(5), Duration::from_secs(256));
        assert_eq!(backoff(6), Duration::from_secs(1024));
        assert_eq!(backoff(60), BACKOFF_MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_wake_runs_all_tasks_and_exports() {
        let recorder = Arc::new(Recorder::default());
        let mut runner = runner(
            vec![
                Ok(vec![volume_sample("v1", 0.0, 1000.0, 50_000.0)]),
                Ok(vec![volume_sample("v1", 10.0, 2000.0, 150_000.0)]),
            ],
            vec![PluginSlot::new(Box::new(Copier), 1)],
            Arc::clone(&recorder),
        );
        runner.init().await.unwrap();

        assert!(runner.run_due().await);
        assert!(runner.metadata().value("poll_time", "counter").is_some());
        assert!(runner.metadata().value("poll_time", "data").is_some());
        // cache cold
        assert!(recorder.objects().is_empty());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(runner.run_due().await);
        assert_eq!(recorder.objects(), ["volume", "volume_copy"]);
        let exported = recorder.exported.lock();
        assert_eq!(exported[0].value("read_ops", "v1"), Some(100.0));
        assert_eq!(runner.metadata().value("metrics", "plugin"), Some(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_error_enters_standby_and_recovers() {
        let recorder = Arc::new(Recorder::default());
        let mut runner = runner(
            vec![
                Ok(vec![volume_sample("v1", 0.0, 1000.0, 50_000.0)]),
                Err(PollError::Connection("refused".into())),
                Ok(vec![volume_sample("v1", 180.0, 5000.0, 150_000.0)]),
                Ok(vec![volume_sample("v1", 190.0, 6000.0, 250_000.0)]),
            ],
            Vec::new(),
            Arc::clone(&recorder),
        );
        runner.init().await.unwrap();
        runner.run_due().await;

        tokio::time::advance(Duration::from_secs(10)).await;
        runner.run_due().await;
        assert_eq!(runner.status(), (Status::Standby, "connection error"));
        assert_eq!(runner.schedule().standby_task(), Some("data"));
        assert_eq!(runner.schedule().tasks().len(), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        runner.run_due().await;
        assert_eq!(runner.status(), (Status::Up, "running"));
        assert!(!runner.schedule().in_standby());
        // counter and instance catch up immediately
        assert_eq!(runner.schedule().due_tasks(Instant::now()), ["counter", "instance"]);
        // first sample after recovery is cold
        assert!(recorder.exported.lock().iter().all(|m| m.object() != "volume"));

        runner.run_due().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        runner.run_due().await;
        let exported = recorder.exported.lock();
        let volume = exported.iter().find(|m| m.object() == "volume").unwrap();
        assert_eq!(volume.value("read_ops", "v1"), Some(100.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plugin_panic_is_contained() {
        let recorder = Arc::new(Recorder::default());
        let mut runner = runner(
            vec![
                Ok(vec![volume_sample("v1", 0.0, 1000.0, 50_000.0)]),
                Ok(vec![volume_sample("v1", 10.0, 2000.0, 150_000.0)]),
            ],
            vec![PluginSlot::new(Box::new(Panicky), 1)],
            Arc::clone(&recorder),
        );
        runner.init().await.unwrap();
        runner.run_due().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(runner.run_due().await);
        assert_eq!(runner.status().0, Status::Up);
        assert!(recorder.objects().contains(&"volume".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exporter_down_is_skipped() {
        let recorder = Arc::new(Recorder {
            down: true,
            ..Recorder::default()
        });
        let mut runner = runner(
            vec![Ok(vec![volume_sample("v1", 0.0, 1000.0, 50_000.0)])],
            Vec::new(),
            Arc::clone(&recorder),
        );
        runner.init().await.unwrap();
        runner.run_due().await;
        runner.export_metadata().await;
        assert!(recorder.exported.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let recorder = Arc::new(Recorder::default());
        let mut runner = runner(
            vec![Ok(vec![volume_sample("v1", 0.0, 1000.0, 50_000.0)])],
            Vec::new(),
            Arc::clone(&recorder),
        );
        runner.init().await.unwrap();
        let token = CancellationToken::new();
        let handle = tokio::spawn(runner.run(token.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        handle.await.unwrap();
        assert!(recorder.objects().contains(&crate::collector::metadata::OBJECT.to_string()));
    }
}
