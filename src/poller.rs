// Poller module - wires collectors, plugins and exporters of one cluster
//
// This module is responsible for:
// 1. Building exporters and starting their background tasks
// 2. Creating one collector runner per (collector, object)
// 3. Spawning every runner as its own tokio task
// 4. Cancelling and joining everything on shutdown
//
// A collector that fails to build or initialize is logged and skipped; the
// rest of the poller keeps running.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collector::{CollectorContext, CollectorRegistry, CollectorRunner};
use crate::config::{CollectorSpec, ConfigError, PollerConfig};
use crate::error::PollError;
use crate::exporter::{self, Exporter};
use crate::plugin::PluginRegistry;

pub struct Poller {
    config: PollerConfig,
    collectors: CollectorRegistry,
    plugins: PluginRegistry,
}

impl Poller {
    /// Creates a poller with the built-in collectors and plugins
    pub fn new(config: PollerConfig) -> Self {
        Self::with_registries(config, CollectorRegistry::with_builtins(), PluginRegistry::with_builtins())
    }

    /// Creates a poller with custom registries, e.g. to add cluster collectors
    pub fn with_registries(config: PollerConfig, collectors: CollectorRegistry, plugins: PluginRegistry) -> Self {
        Poller {
            config,
            collectors,
            plugins,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Builds every exporter of the poller file, skipping broken ones
    pub fn build_exporters(&self) -> Vec<Arc<dyn Exporter>> {
        self.config
            .exporters
            .iter()
            .filter_map(|spec| match exporter::build(spec, &self.config.name) {
                Ok(exporter) => {
                    info!(exporter = %spec.name, kind = ?spec.kind, "exporter ready");
                    Some(exporter)
                }
                Err(e) => {
                    error!(exporter = %spec.name, error = %e, "exporter skipped");
                    None
                }
            })
            .collect()
    }

    /// Builds and initializes the runners of every collector object
    pub async fn build_runners(&self, exporters: &[Arc<dyn Exporter>]) -> Vec<CollectorRunner> {
        let global_labels = self.config.global_labels();
        let mut runners = Vec::new();
        for spec in &self.config.collectors {
            for object in &spec.objects {
                let ctx = CollectorContext {
                    poller: self.config.name.clone(),
                    addr: self.config.addr.clone(),
                    object: object.clone(),
                    spec: spec.clone(),
                    global_labels: global_labels.clone(),
                };
                match self.build_runner(&ctx, exporters).await {
                    Ok(runner) => runners.push(runner),
                    Err(e) => error!(
                        collector = %spec.name,
                        object = %object,
                        error = %e,
                        "collector skipped"
                    ),
                }
            }
        }
        runners
    }

    async fn build_runner(
        &self,
        ctx: &CollectorContext,
        exporters: &[Arc<dyn Exporter>],
    ) -> Result<CollectorRunner, PollError> {
        let collector = self.collectors.build(ctx)?;
        let plugins = self.plugins.build_all(ctx)?;
        let linked = link(&ctx.spec, exporters);
        if linked.is_empty() {
            warn!(collector = %ctx.spec.name, object = %ctx.object, "no exporters linked");
        }
        let mut runner = CollectorRunner::new(collector, ctx, plugins, linked)?;
        let remote = runner.init().await?;
        info!(
            collector = %ctx.spec.name,
            object = %ctx.object,
            remote = %remote.name,
            version = %remote.version,
            "collector initialized"
        );
        Ok(runner)
    }

    /// Runs until `shutdown` is cancelled
    ///
    /// # Returns
    /// * `Ok(())` - All tasks stopped after cancellation
    /// * `Err(ConfigError)` - Not a single collector could be started
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ConfigError> {
        info!(poller = %self.config.name, addr = %self.config.addr, "starting poller");
        let exporters = self.build_exporters();

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for exporter in &exporters {
            match Arc::clone(exporter).start(shutdown.child_token()) {
                Ok(started) => handles.extend(started),
                Err(e) => error!(exporter = %exporter.name(), error = %e, "exporter failed to start"),
            }
        }

        let runners = self.build_runners(&exporters).await;
        if runners.is_empty() {
            shutdown.cancel();
            join_all(handles).await;
            return Err(ConfigError::InvalidSettings(format!(
                "poller {}: no collector could be started",
                self.config.name
            )));
        }

        info!(poller = %self.config.name, collectors = runners.len(), "all collectors started");
        for runner in runners {
            handles.push(tokio::spawn(runner.run(shutdown.child_token())));
        }

        shutdown.cancelled().await;
        info!(poller = %self.config.name, "shutting down");
        join_all(handles).await;
        info!(poller = %self.config.name, "stopped");
        Ok(())
    }
}

/// Exporters a collector writes to: those it names, or all of them
pub fn link(spec: &CollectorSpec, exporters: &[Arc<dyn Exporter>]) -> Vec<Arc<dyn Exporter>> {
    exporters
        .iter()
        .filter(|e| spec.exporters.is_empty() || spec.exporters.iter().any(|name| name == e.name()))
        .cloned()
        .collect()
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Task panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const POLLER: &str = r#"
name: cluster-01
datacenter: dc1
collectors:
  - name: Unix
    objects: [poller]
    schedule:
      data: 10s
    exporters: [prom]
exporters:
  - name: prom
    type: prometheus
    addr: 127.0.0.1
    port: 0
  - name: influx
    type: influxdb
    url: http://127.0.0.1:8086/api/v2/write
"#;

    #[test]
    fn test_build_exporters_and_link() {
        let config = PollerConfig::from_yaml(POLLER).unwrap();
        let poller = Poller::new(config.clone());
        let exporters = poller.build_exporters();
        assert_eq!(exporters.len(), 2);

        let linked = link(&config.collectors[0], &exporters);
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].name(), "prom");

        let mut all = config.collectors[0].clone();
        all.exporters.clear();
        assert_eq!(link(&all, &exporters).len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_plugin_skips_collector() {
        let yaml = POLLER.replace("    exporters: [prom]\n", "    plugins:\n      - name: Nope\n");
        let poller = Poller::new(PollerConfig::from_yaml(&yaml).unwrap());
        let runners = poller.build_runners(&[]).await;
        assert!(runners.is_empty());

        let err = poller.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSettings(_)));
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let poller = Poller::new(PollerConfig::from_yaml(POLLER).unwrap());
        let token = CancellationToken::new();
        let stop = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stop.cancel();
        });
        tokio::time::timeout(Duration::from_secs(10), poller.run(token))
            .await
            .unwrap()
            .unwrap();
    }
}
