// Exposition cache - last rendered block per matrix, served on scrape
//
// Scrapes and polls run on independent cadences, so the last block of every
// (collector, object, identifier) is kept until it is replaced or grows older
// than `max_keep`. Expired entries are dropped lazily on read.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::collector::metadata;
use crate::matrix::Matrix;

/// Identity of one cached block
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub collector: String,
    pub object: String,
    pub identifier: String,
}

impl CacheKey {
    pub fn of(matrix: &Matrix) -> Self {
        CacheKey {
            collector: matrix.uuid().to_string(),
            object: matrix.object().to_string(),
            identifier: matrix.identifier().to_string(),
        }
    }

    /// File name safe rendering of the key, distinct for distinct keys
    ///
    /// Each part is percent-escaped before joining with `.`, so separators
    /// inside a part cannot collide with the join.
    pub fn file_stem(&self) -> String {
        [&self.collector, &self.object, &self.identifier]
            .iter()
            .map(|part| escape_path_part(part))
            .collect::<Vec<_>>()
            .join(".")
    }
}

fn escape_path_part(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => out.push_str("%25"),
            '.' => out.push_str("%2E"),
            '/' => out.push_str("%2F"),
            ':' => out.push_str("%3A"),
            '\\' => out.push_str("%5C"),
            c => out.push(c),
        }
    }
    out
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.collector, self.object, self.identifier)
    }
}

/// Status of a collector as reported by its metadata block
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorStatus {
    pub code: u8,
    pub reason: String,
}

/// What the overview page shows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// collector -> object -> metric names
    pub objects: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    /// "collector:object" -> status
    pub status: BTreeMap<String, CollectorStatus>,
    pub num_metrics: usize,
}

impl CacheStats {
    pub fn num_collectors(&self) -> usize {
        self.objects.len()
    }

    pub fn num_objects(&self) -> usize {
        self.objects.values().map(BTreeMap::len).sum()
    }

    /// Adds one cached block
    pub fn add<'a>(&mut self, key: &CacheKey, lines: impl Iterator<Item = &'a str>) {
        if key.object == metadata::OBJECT {
            for line in lines {
                if let Some(status) = parse_status(line) {
                    self.status.insert(status.0, status.1);
                }
            }
            return;
        }
        if key.object.starts_with("metadata_") {
            return;
        }
        let names = metric_names(lines);
        self.num_metrics += names.len();
        self.objects
            .entry(key.collector.clone())
            .or_default()
            .entry(key.object.clone())
            .or_default()
            .extend(names);
    }
}

/// Store of rendered blocks shared between exporters and the HTTPd
pub trait MetricCache: Send + Sync {
    /// Replaces the block of `key`
    fn put(&self, key: CacheKey, block: Vec<String>);

    /// Appends every live block to `out`, dropping repeated `# HELP`/`# TYPE`
    /// lines; returns the number of lines written
    fn stream(&self, out: &mut String, seen: &mut HashSet<String>) -> usize;

    fn stats(&self) -> CacheStats;

    /// Number of live blocks
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writes `lines`, keeping only the first `# HELP name` and `# TYPE name`
pub fn write_block<'a>(out: &mut String, lines: impl Iterator<Item = &'a str>, seen: &mut HashSet<String>) -> usize {
    let mut count = 0;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with("# ") {
            // "# HELP name ..." -> "# HELP name"
            let tag: String = line.splitn(4, ' ').take(3).collect::<Vec<_>>().join(" ");
            if !seen.insert(tag) {
                continue;
            }
        }
        out.push_str(line);
        out.push('\n');
        count += 1;
    }
    count
}

/// Series names of a block, meta lines excluded
pub fn metric_names<'a>(lines: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    lines
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.split_once('{').map(|(name, _)| name))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Label pairs of an exposition line
pub fn parse_labels(line: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let Some(start) = line.find('{') else {
        return labels;
    };
    let body = &line[start + 1..];
    let mut chars = body.chars();
    loop {
        let key: String = chars.by_ref().take_while(|&c| c != '=').collect();
        if key.is_empty() || chars.next() != Some('"') {
            break;
        }
        let mut value = String::new();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some('n') => value.push('\n'),
                    Some(other) => value.push(other),
                    None => break,
                },
                '"' => break,
                c => value.push(c),
            }
        }
        labels.insert(key, value);
        match chars.next() {
            Some(',') => continue,
            _ => break,
        }
    }
    labels
}

fn parse_status(line: &str) -> Option<(String, CollectorStatus)> {
    let (series, value) = line.rsplit_once(' ')?;
    let (name, _) = series.split_once('{')?;
    if !name.ends_with(&format!("{}_status", metadata::OBJECT)) {
        return None;
    }
    let labels = parse_labels(series);
    let collector = labels.get("collector")?;
    let object = labels.get("object")?;
    Some((
        format!("{collector}:{object}"),
        CollectorStatus {
            code: value.trim().parse().ok()?,
            reason: labels.get("reason").cloned().unwrap_or_default(),
        },
    ))
}

#[derive(Debug)]
struct Entry {
    block: Arc<Vec<String>>,
    stored: Instant,
}

/// In-memory cache guarded by a single mutex
#[derive(Debug)]
pub struct MemCache {
    entries: Mutex<BTreeMap<CacheKey, Entry>>,
    expire: Duration,
}

impl MemCache {
    pub fn new(expire: Duration) -> Self {
        MemCache {
            entries: Mutex::new(BTreeMap::new()),
            expire,
        }
    }

    /// Live blocks, dropping expired ones
    fn live(&self) -> Vec<(CacheKey, Arc<Vec<String>>)> {
        let mut entries = self.entries.lock();
        let expire = self.expire;
        entries.retain(|key, entry| {
            let keep = entry.stored.elapsed() <= expire;
            if !keep {
                debug!(key = %key, "expired cache entry");
            }
            keep
        });
        entries
            .iter()
            .map(|(k, e)| (k.clone(), Arc::clone(&e.block)))
            .collect()
    }
}

impl MetricCache for MemCache {
    fn put(&self, key: CacheKey, block: Vec<String>) {
        let entry = Entry {
            block: Arc::new(block),
            stored: Instant::now(),
        };
        self.entries.lock().insert(key, entry);
    }

    fn stream(&self, out: &mut String, seen: &mut HashSet<String>) -> usize {
        self.live()
            .iter()
            .map(|(_, block)| write_block(out, block.iter().map(String::as_str), seen))
            .sum()
    }

    fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for (key, block) in self.live() {
            stats.add(&key, block.iter().map(String::as_str));
        }
        stats
    }

    fn len(&self) -> usize {
        self.live().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(object: &str) -> CacheKey {
        CacheKey {
            collector: "ZapiPerf".into(),
            object: object.into(),
            identifier: format!("ZapiPerf:{object}"),
        }
    }

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_filter_meta_tags() {
        let block = [
            "# HELP some_metric help text",
            "# TYPE some_metric type",
            r#"some_metric{node="node_1"} 0.0"#,
            "# HELP some_other_metric help text",
            "# TYPE some_other_metric type",
            r#"some_other_metric{node="node_2"} 0.0"#,
            "# HELP some_other_metric DUPLICATE help text",
            "# TYPE some_other_metric type",
            r#"some_other_metric{node="node_3"} 0.0"#,
        ];
        let mut out = String::new();
        let mut seen = HashSet::new();
        let count = write_block(&mut out, block.iter().copied(), &mut seen);
        assert_eq!(count, 7);
        assert_eq!(
            out,
            "# HELP some_metric help text\n# TYPE some_metric type\nsome_metric{node=\"node_1\"} 0.0\n\
             # HELP some_other_metric help text\n# TYPE some_other_metric type\n\
             some_other_metric{node=\"node_2\"} 0.0\nsome_other_metric{node=\"node_3\"} 0.0\n"
        );
    }

    #[test]
    fn test_key_file_stem() {
        assert_eq!(key("volume").to_string(), "ZapiPerf.volume.ZapiPerf:volume");
        assert_eq!(key("volume").file_stem(), "ZapiPerf.volume.ZapiPerf%3Avolume");
        assert_eq!(key("a/b").file_stem(), "ZapiPerf.a%2Fb.ZapiPerf%3Aa%2Fb");

        let colon = CacheKey {
            collector: "c".into(),
            object: "a:b".into(),
            identifier: "i".into(),
        };
        let underscore = CacheKey {
            object: "a_b".into(),
            ..colon.clone()
        };
        let dotted = CacheKey {
            collector: "c.a".into(),
            object: "b".into(),
            identifier: "i".into(),
        };
        let split = CacheKey {
            collector: "c".into(),
            object: "a.b".into(),
            identifier: "i".into(),
        };
        assert_ne!(colon.file_stem(), underscore.file_stem());
        assert_ne!(dotted.file_stem(), split.file_stem());
    }

    #[test]
    fn test_parse_labels() {
        let labels = parse_labels(r#"x{a="1",b="q\"uo\\te",c=""} 3"#);
        assert_eq!(labels.get("a").map(String::as_str), Some("1"));
        assert_eq!(labels.get("b").map(String::as_str), Some(r#"q"uo\te"#));
        assert_eq!(labels.get("c").map(String::as_str), Some(""));
        assert!(parse_labels("x 3").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_replaces_and_expires() {
        let cache = MemCache::new(Duration::from_secs(300));
        cache.put(key("volume"), lines(&["volume_read_ops{} 1"]));
        cache.put(key("volume"), lines(&["volume_read_ops{} 2"]));
        let mut out = String::new();
        assert_eq!(cache.stream(&mut out, &mut HashSet::new()), 1);
        assert_eq!(out, "volume_read_ops{} 2\n");

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(cache.len(), 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stats() {
        let cache = MemCache::new(Duration::from_secs(300));
        cache.put(
            key("volume"),
            lines(&["# HELP volume_read_ops x", "volume_read_ops{a=\"1\"} 1", "volume_read_ops{a=\"2\"} 1", "volume_size{} 3"]),
        );
        cache.put(key("lun"), lines(&["lun_ops{} 1"]));
        cache.put(
            CacheKey {
                collector: "ZapiPerf".into(),
                object: metadata::OBJECT.into(),
                identifier: "ZapiPerf:volume".into(),
            },
            lines(&[r#"metadata_collector_status{collector="ZapiPerf",object="volume",reason="running",task="data"} 0"#]),
        );

        let stats = cache.stats();
        assert_eq!(stats.num_collectors(), 1);
        assert_eq!(stats.num_objects(), 2);
        assert_eq!(stats.num_metrics, 3);
        assert_eq!(
            stats.status.get("ZapiPerf:volume"),
            Some(&CollectorStatus {
                code: 0,
                reason: "running".into()
            })
        );
    }
}
