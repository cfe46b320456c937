// HTTPd - scrape endpoint of the Prometheus exporter
//
// `GET /metrics` streams every live cache block followed by the exporter's
// own metadata; `GET /` is an overview page for humans. Anything else is a
// 404. Callers outside the allow list get a 403.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use regex::Regex;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{write_block, CacheStats, MetricCache};
use super::render::Renderer;
use crate::collector::Status;
use crate::error::ExportError;
use crate::exporter::ExporterMetadata;

pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Remote addresses allowed to scrape, with per-address memoization
#[derive(Debug, Default)]
pub struct AccessList {
    plain: Vec<String>,
    patterns: Vec<Regex>,
    memo: Mutex<HashMap<String, bool>>,
}

impl AccessList {
    /// # Arguments
    /// * `plain` - Addresses matched verbatim
    /// * `patterns` - Regular expressions matched against the address
    ///
    /// # Returns
    /// * `Err(ExportError::InvalidParam)` - A pattern does not compile
    pub fn new(plain: &[String], patterns: &[String]) -> Result<Self, ExportError> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| ExportError::InvalidParam(format!("allow_addrs_regex {p}: {e}"))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AccessList {
            plain: plain.to_vec(),
            patterns,
            memo: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_open(&self) -> bool {
        self.plain.is_empty() && self.patterns.is_empty()
    }

    /// Checks an address without its port
    pub fn allows(&self, addr: &str) -> bool {
        if self.is_open() {
            return true;
        }
        let mut memo = self.memo.lock();
        if let Some(&allowed) = memo.get(addr) {
            return allowed;
        }
        let allowed = self.plain.iter().any(|a| a == addr) || self.patterns.iter().any(|r| r.is_match(addr));
        memo.insert(addr.to_string(), allowed);
        allowed
    }
}

#[derive(Clone)]
pub struct HttpState {
    pub poller: String,
    pub cache: Arc<dyn MetricCache>,
    pub access: Arc<AccessList>,
    pub metadata: Arc<Mutex<ExporterMetadata>>,
    pub renderer: Renderer,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(overview).fallback(not_found))
        .route("/metrics", get(metrics).fallback(not_found))
        .fallback(not_found)
        .with_state(state)
}

/// Serves `listener` until `shutdown` fires
pub async fn serve(listener: TcpListener, state: HttpState, shutdown: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "serving metrics");
    }
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "404 page not found").into_response()
}

fn forbidden(remote: &str, path: &str) -> Response {
    warn!(remote, path, "denied request");
    (StatusCode::FORBIDDEN, "403 Forbidden").into_response()
}

async fn metrics(State(state): State<HttpState>, ConnectInfo(remote): ConnectInfo<SocketAddr>) -> Response {
    let remote = remote.ip().to_string();
    if !state.access.allows(&remote) {
        return forbidden(&remote, "/metrics");
    }
    let start = Instant::now();
    let mut body = String::new();
    let mut seen = HashSet::new();
    let mut count = state.cache.stream(&mut body, &mut seen);

    let own = {
        let mut metadata = state.metadata.lock();
        metadata.set("http", start.elapsed(), count);
        state.renderer.render(metadata.matrix())
    };
    count += write_block(&mut body, own.iter().map(String::as_str), &mut seen);

    debug!(remote = %remote, lines = count, elapsed = ?start.elapsed(), "served metrics");
    ([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], body).into_response()
}

async fn overview(State(state): State<HttpState>, ConnectInfo(remote): ConnectInfo<SocketAddr>) -> Response {
    let remote = remote.ip().to_string();
    if !state.access.allows(&remote) {
        return forbidden(&remote, "/");
    }
    let start = Instant::now();
    let stats = state.cache.stats();
    let page = overview_page(&state.poller, &stats);
    state.metadata.lock().set("info", start.elapsed(), stats.num_metrics);
    ([(header::CONTENT_TYPE, "text/html")], page).into_response()
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

/// Lists collector -> object -> metric names with the collector status
pub fn overview_page(poller: &str, stats: &CacheStats) -> String {
    let poller = html_escape(poller);
    let mut page = String::new();
    let _ = write!(
        page,
        "<!DOCTYPE html>\n<html>\n<head><title>{poller}</title></head>\n<body>\n<h1>{poller}</h1>\n\
         <p>{} collectors, {} objects, {} metrics</p>\n",
        stats.num_collectors(),
        stats.num_objects(),
        stats.num_metrics
    );
    for (collector, objects) in &stats.objects {
        let _ = writeln!(page, "<h2>{}</h2>\n<ul>", html_escape(collector));
        for (object, names) in objects {
            let status = match stats.status.get(&format!("{collector}:{object}")) {
                Some(s) => {
                    let name = Status::from_code(s.code).map(Status::as_str).unwrap_or("unknown");
                    format!(" <i>{} ({})</i>", name, html_escape(&s.reason))
                }
                None => String::new(),
            };
            let _ = writeln!(page, "<li><b>{}</b>{status}\n<ul>", html_escape(object));
            for name in names {
                let _ = writeln!(page, "<li>{}</li>", html_escape(name));
            }
            page.push_str("</ul>\n</li>\n");
        }
        page.push_str("</ul>\n");
    }
    page.push_str("</body>\n</html>\n");
    page
}
