// Disk cache - rendered blocks kept in files instead of memory
//
// One file per cache key under a dedicated directory. The directory is
// wiped on start; a janitor task removes expired entries twice per expiry
// period, together with any file the index no longer knows about.
//
// A block is written to a temporary sibling and renamed over the cache file,
// so a scrape reading the file sees either the old block or the new one.
// Writes and the janitor hold the index lock, so a file is never swept
// between being written and being indexed.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cache::{metric_names, write_block, CacheKey, CacheStats, MetricCache};

/// Buffer size of cache file readers and writers
pub const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug)]
struct DiskEntry {
    path: PathBuf,
    names: BTreeSet<String>,
    stored: Instant,
}

#[derive(Debug)]
pub struct DiskCache {
    dir: PathBuf,
    expire: Duration,
    entries: Mutex<BTreeMap<CacheKey, DiskEntry>>,
}

impl DiskCache {
    /// Creates the cache directory, removing leftovers of a previous run
    pub fn new(dir: &Path, expire: Duration) -> io::Result<Self> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;
        debug!(dir = %dir.display(), "disk cache ready");
        Ok(DiskCache {
            dir: dir.to_path_buf(),
            expire,
            entries: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.metrics", key.file_stem()))
    }

    /// Replaces the file at `path` with `block` in one rename
    fn write_file(path: &Path, block: &[String]) -> io::Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut writer = BufWriter::with_capacity(BUFFER_SIZE, File::create(&tmp)?);
        for line in block {
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        drop(writer);
        fs::rename(&tmp, path).inspect_err(|_| {
            if let Err(e) = fs::remove_file(&tmp) {
                debug!(file = %tmp.display(), error = %e, "failed to remove temporary cache file");
            }
        })
    }

    fn read_file(path: &Path) -> io::Result<Vec<String>> {
        let reader = BufReader::with_capacity(BUFFER_SIZE, File::open(path)?);
        reader.lines().collect()
    }

    /// Entries within `max_keep`, as (key, path) pairs
    fn live(&self) -> Vec<(CacheKey, PathBuf)> {
        let expire = self.expire;
        self.entries
            .lock()
            .iter()
            .filter(|(_, e)| e.stored.elapsed() <= expire)
            .map(|(k, e)| (k.clone(), e.path.clone()))
            .collect()
    }

    /// Drops expired entries and files that belong to no entry
    pub fn clean(&self) {
        let mut entries = self.entries.lock();
        let expire = self.expire;
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, e)| e.stored.elapsed() > expire)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = entries.remove(&key) {
                if let Err(e) = fs::remove_file(&entry.path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        debug!(file = %entry.path.display(), error = %e, "failed to remove expired cache file");
                    }
                }
                debug!(key = %key, "expired cache entry");
            }
        }

        let known: HashSet<&Path> = entries.values().map(|e| e.path.as_path()).collect();
        let listing = match fs::read_dir(&self.dir) {
            Ok(listing) => listing,
            Err(e) => {
                debug!(dir = %self.dir.display(), error = %e, "failed to read cache directory");
                return;
            }
        };
        for file in listing.flatten() {
            let path = file.path();
            if known.contains(path.as_path()) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => debug!(file = %path.display(), "removed unknown cache file"),
                Err(e) => debug!(file = %path.display(), error = %e, "failed to remove unknown cache file"),
            }
        }
    }

    /// Runs `clean` every half expiry period until `shutdown` fires
    pub fn spawn_janitor(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = (cache.expire / 2).max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => cache.clean(),
                }
            }
            debug!(dir = %cache.dir.display(), "disk cache janitor stopped");
        })
    }
}

impl MetricCache for DiskCache {
    fn put(&self, key: CacheKey, block: Vec<String>) {
        let path = self.path_of(&key);
        let names = metric_names(block.iter().map(String::as_str));
        let mut entries = self.entries.lock();
        if let Err(e) = Self::write_file(&path, &block) {
            warn!(key = %key, file = %path.display(), error = %e, "failed to write cache file");
            return;
        }
        debug!(key = %key, lines = block.len(), "cached metrics to disk");
        entries.insert(
            key,
            DiskEntry {
                path,
                names,
                stored: Instant::now(),
            },
        );
    }

    fn stream(&self, out: &mut String, seen: &mut HashSet<String>) -> usize {
        let mut count = 0;
        let mut failed = 0;
        for (key, path) in self.live() {
            match Self::read_file(&path) {
                Ok(lines) => count += write_block(out, lines.iter().map(String::as_str), seen),
                Err(e) => {
                    failed += 1;
                    debug!(key = %key, error = %e, "failed to stream cache file");
                }
            }
        }
        if failed > 0 {
            warn!(failed, "failed to stream some cache files");
        }
        count
    }

    fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for (key, path) in self.live() {
            if key.object.starts_with("metadata_") {
                // status lines are only in the file
                if let Ok(lines) = Self::read_file(&path) {
                    stats.add(&key, lines.iter().map(String::as_str));
                }
                continue;
            }
            let entries = self.entries.lock();
            if let Some(entry) = entries.get(&key) {
                stats.num_metrics += entry.names.len();
                stats
                    .objects
                    .entry(key.collector.clone())
                    .or_default()
                    .entry(key.object.clone())
                    .or_default()
                    .extend(entry.names.iter().cloned());
            }
        }
        stats
    }

    fn len(&self) -> usize {
        self.live().len()
    }
}
