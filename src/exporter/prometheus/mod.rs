// Prometheus exporter - render into the exposition cache, serve on scrape
//
// `export` runs on the collector's task: it renders the matrix and replaces
// the cached block of its key. The HTTPd reads the cache on its own tasks.

pub mod cache;
pub mod disk_cache;
pub mod histogram;
pub mod httpd;
pub mod render;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use self::cache::{CacheKey, MemCache, MetricCache};
use self::disk_cache::DiskCache;
use self::httpd::{AccessList, HttpState};
use self::render::Renderer;
use super::{Exporter, ExporterMetadata, ExporterStatus};
use crate::config::{ExporterKind, ExporterSpec};
use crate::error::ExportError;
use crate::matrix::Matrix;

pub struct Prometheus {
    name: String,
    poller: String,
    bind: String,
    renderer: Renderer,
    cache: Arc<dyn MetricCache>,
    disk: Option<Arc<DiskCache>>,
    access: Arc<AccessList>,
    metadata: Arc<Mutex<ExporterMetadata>>,
    status: Mutex<(ExporterStatus, String)>,
}

impl Prometheus {
    /// Creates the exporter and its cache; nothing is bound until `start`
    ///
    /// # Returns
    /// * `Err(ExportError::MissingParam)` - No port configured
    /// * `Err(ExportError::InvalidParam)` - An allow list pattern does not compile
    /// * `Err(ExportError::Io)` - The disk cache directory cannot be prepared
    pub fn new(spec: &ExporterSpec, poller: &str) -> Result<Self, ExportError> {
        let port = spec
            .port
            .ok_or_else(|| ExportError::MissingParam(format!("port of exporter {}", spec.name)))?;
        let access = AccessList::new(&spec.allow_addrs, &spec.allow_addrs_regex)?;

        let (cache, disk): (Arc<dyn MetricCache>, _) = match &spec.disk_cache {
            Some(dir) => {
                let disk = Arc::new(DiskCache::new(dir, spec.cache_max_keep)?);
                (Arc::clone(&disk) as Arc<dyn MetricCache>, Some(disk))
            }
            None => (Arc::new(MemCache::new(spec.cache_max_keep)), None),
        };

        debug!(
            exporter = %spec.name,
            port,
            max_keep = ?spec.cache_max_keep,
            disk = disk.is_some(),
            open = access.is_open(),
            "prometheus exporter initialized"
        );

        Ok(Prometheus {
            name: spec.name.clone(),
            poller: poller.to_string(),
            bind: format!("{}:{}", spec.addr, port),
            renderer: Renderer::new(spec.prefix.as_deref(), spec.sort_labels, spec.add_meta_tags),
            cache,
            disk,
            access: Arc::new(access),
            metadata: Arc::new(Mutex::new(ExporterMetadata::new(&spec.name, "Prometheus", poller))),
            status: Mutex::new((ExporterStatus::Up, "initialized".to_string())),
        })
    }

    pub fn cache(&self) -> &Arc<dyn MetricCache> {
        &self.cache
    }

    pub fn metadata(&self) -> &Arc<Mutex<ExporterMetadata>> {
        &self.metadata
    }

    fn set_status(&self, status: ExporterStatus, reason: &str) {
        *self.status.lock() = (status, reason.to_string());
    }

    fn http_state(&self) -> HttpState {
        HttpState {
            poller: self.poller.clone(),
            cache: Arc::clone(&self.cache),
            access: Arc::clone(&self.access),
            metadata: Arc::clone(&self.metadata),
            renderer: self.renderer.clone(),
        }
    }
}

#[async_trait]
impl Exporter for Prometheus {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ExporterKind {
        ExporterKind::Prometheus
    }

    fn status(&self) -> (ExporterStatus, String) {
        self.status.lock().clone()
    }

    async fn export(&self, data: &Matrix) -> Result<(), ExportError> {
        let start = Instant::now();
        let block = self.renderer.render(data);
        let rendered = start.elapsed();
        let count = block.len();
        let key = CacheKey::of(data);
        debug!(exporter = %self.name, key = %key, lines = count, "caching metrics");
        if self.disk.is_some() {
            // file IO stays off the async workers
            let cache = Arc::clone(&self.cache);
            if let Err(e) = tokio::task::spawn_blocking(move || cache.put(key, block)).await {
                error!(exporter = %self.name, error = %e, "disk cache write panicked");
            }
        } else {
            self.cache.put(key, block);
        }

        let mut metadata = self.metadata.lock();
        metadata.set("render", rendered, count);
        metadata.set("export", start.elapsed(), count);
        Ok(())
    }

    fn start(self: Arc<Self>, shutdown: CancellationToken) -> Result<Vec<JoinHandle<()>>, ExportError> {
        let listener = std::net::TcpListener::bind(&self.bind)?;
        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let local: Option<SocketAddr> = listener.local_addr().ok();
        info!(exporter = %self.name, addr = ?local, "prometheus exporter listening");

        let mut handles = Vec::new();
        let exporter = Arc::clone(&self);
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = httpd::serve(listener, exporter.http_state(), token).await {
                error!(exporter = %exporter.name, error = %e, "httpd stopped");
                exporter.set_status(ExporterStatus::Failed, &e.to_string());
            }
        }));
        if let Some(disk) = &self.disk {
            handles.push(disk.spawn_janitor(shutdown));
        }
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::MetricType;
    use std::collections::HashSet;
    use std::time::Duration;

    fn spec(extra: &str) -> ExporterSpec {
        serde_yaml::from_str(&format!("name: prom\ntype: prometheus\naddr: 127.0.0.1\nport: 0\n{extra}")).unwrap()
    }

    fn volume(value: f64) -> Matrix {
        let mut m = Matrix::new("ZapiPerf", "volume", "ZapiPerf:volume");
        m.new_metric("read_ops", MetricType::Float64).unwrap();
        m.new_instance("v1").unwrap().set_label("volume", "v1");
        m.lazy_set_value("read_ops", "v1", value).unwrap();
        m
    }

    #[tokio::test]
    async fn test_export_replaces_block() {
        let prom = Prometheus::new(&spec("prefix: netapp\n"), "cluster-01").unwrap();
        prom.export(&volume(1.0)).await.unwrap();
        prom.export(&volume(2.0)).await.unwrap();
        assert_eq!(prom.cache().len(), 1);

        let mut out = String::new();
        prom.cache().stream(&mut out, &mut HashSet::new());
        assert_eq!(out, "netapp_volume_read_ops{volume=\"v1\"} 2\n");

        let metadata = prom.metadata().lock();
        assert_eq!(metadata.value("count", "export"), Some(1.0));
        assert_eq!(metadata.value("count", "render"), Some(1.0));
    }

    #[tokio::test]
    async fn test_disk_cache_variant() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("prom");
        let prom = Prometheus::new(&spec(&format!("disk_cache: {}\n", dir.display())), "p").unwrap();
        prom.export(&volume(3.0)).await.unwrap();
        assert!(dir.join("ZapiPerf.volume.ZapiPerf%3Avolume.metrics").exists());
        let mut out = String::new();
        prom.cache().stream(&mut out, &mut HashSet::new());
        assert_eq!(out, "volume_read_ops{volume=\"v1\"} 3\n");
    }

    #[test]
    fn test_missing_port_and_bad_pattern() {
        let mut s = spec("");
        s.port = None;
        assert!(matches!(Prometheus::new(&s, "p"), Err(ExportError::MissingParam(_))));

        let s = spec("allow_addrs_regex: ['(']\n");
        assert!(matches!(Prometheus::new(&s, "p"), Err(ExportError::InvalidParam(_))));
    }

    #[tokio::test]
    async fn test_start_serves_and_stops() {
        let prom = Arc::new(Prometheus::new(&spec("cache_max_keep: 1m\n"), "p").unwrap());
        prom.export(&volume(5.0)).await.unwrap();
        let token = CancellationToken::new();
        let handles = Arc::clone(&prom).start(token.clone()).unwrap();
        assert_eq!(handles.len(), 1);
        assert!(prom.is_up());

        token.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        }
    }
}
