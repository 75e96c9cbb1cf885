use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, trace, warn};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Rendered blobs are published under this extension; presence of the blob file
/// is the sole hit signal.
const IMAGE_EXT: &str = "png";
/// Suffix of entries still being written. `sweep` skips them.
const STAGING_EXT: &str = "tmp";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash of exactly the submitted bytes, never of a rewritten form: identical
    /// user input maps to the same entry regardless of the submission channel.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    pub fn hex(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

type RenderOutcome = Result<Arc<Vec<u8>>, Arc<anyhow::Error>>;

/// Content-addressed store of rendered images, plus the per-fingerprint gate
/// that keeps concurrent requests from invoking the expensive renderer twice.
pub struct RenderCache {
    cache_dir: PathBuf,
    in_flight: DashMap<String, watch::Receiver<Option<RenderOutcome>>>,
}

impl RenderCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self, anyhow::Error> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)
            .with_context(|| format!("Creating cache directory {}", cache_dir.display()))?;
        Ok(Self {
            cache_dir,
            in_flight: DashMap::new(),
        })
    }

    fn blob_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.cache_dir.join(format!("{}.{}", fingerprint.hex(), IMAGE_EXT))
    }

    /// A miss (or an unreadable entry) is never a user-visible failure, it only
    /// costs the render.
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Option<Vec<u8>> {
        match tokio::fs::read(self.blob_path(fingerprint)).await {
            Ok(bytes) => {
                trace!("Cache hit for {}", fingerprint);
                Some(bytes)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Failed to read cache entry {}: {}", fingerprint, e);
                None
            }
        }
    }

    /// Writes to a staging file, then publishes by rename: a concurrent `lookup`
    /// never observes a partially written entry.
    pub async fn store(&self, fingerprint: &Fingerprint, bytes: &[u8]) -> Result<(), anyhow::Error> {
        let staging = self
            .cache_dir
            .join(format!("{}.{}.{}", fingerprint.hex(), IMAGE_EXT, STAGING_EXT));
        tokio::fs::write(&staging, bytes)
            .await
            .with_context(|| format!("Writing staging entry {}", staging.display()))?;
        tokio::fs::rename(&staging, self.blob_path(fingerprint))
            .await
            .with_context(|| format!("Publishing cache entry {}", fingerprint))?;
        debug!("Stored {} ({} bytes)", fingerprint, bytes.len());
        Ok(())
    }

    /// At most one render per fingerprint: the first caller runs `render`, later
    /// callers with the same fingerprint await its published result instead of
    /// duplicating the work. The in-flight handle is retired once the outcome
    /// (success or failure) is published.
    pub async fn render_gated<F, Fut>(&self, fingerprint: &Fingerprint, render: F) -> Result<Arc<Vec<u8>>, anyhow::Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, anyhow::Error>>,
    {
        if let Some(bytes) = self.lookup(fingerprint).await {
            return Ok(Arc::new(bytes));
        }

        let publisher = match self.in_flight.entry(fingerprint.hex().to_string()) {
            Entry::Occupied(entry) => {
                let mut rx = entry.get().clone();
                drop(entry);
                debug!("Awaiting in-flight render for {}", fingerprint);
                loop {
                    let published = rx.borrow().clone();
                    if let Some(outcome) = published {
                        return outcome.map_err(|e| anyhow::anyhow!("Render failed: {:#}", e));
                    }
                    if rx.changed().await.is_err() {
                        // publisher vanished without a result; the blob is the fallback
                        return self
                            .lookup(fingerprint)
                            .await
                            .map(Arc::new)
                            .context("In-flight render was aborted");
                    }
                }
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(rx);
                tx
            }
        };

        // we may have been raced between the miss and inserting the handle
        let outcome: RenderOutcome = match self.lookup(fingerprint).await {
            Some(bytes) => Ok(Arc::new(bytes)),
            None => match render().await {
                Ok(bytes) => {
                    if let Err(e) = self.store(fingerprint, &bytes).await {
                        // a failed store only costs the next request a render
                        warn!("Failed to store render result for {}: {:#}", fingerprint, e);
                    }
                    Ok(Arc::new(bytes))
                }
                Err(e) => Err(Arc::new(e)),
            },
        };

        let _ = publisher.send(Some(outcome.clone()));
        self.in_flight.remove(fingerprint.hex());

        outcome.map_err(|e| anyhow::anyhow!("Render failed: {:#}", e))
    }

    /// Age-based retention sweep. Staging files of in-flight stores are skipped,
    /// and every failure is logged rather than surfaced; a sweep can only ever
    /// cost latency, not correctness.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let mut dir = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Sweep cannot enumerate {}: {}", self.cache_dir.display(), e);
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Sweep enumeration failed: {}", e);
                    break;
                }
            };
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == STAGING_EXT) {
                continue;
            }

            let expired = entry
                .metadata()
                .await
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age > max_age);
            if !expired {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Swept expired cache entry {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to sweep {}: {}", path.display(), e),
            }
        }
        removed
    }

    /// Background, low-priority retention loop, independent of request handling.
    pub fn spawn_sweeper(self: Arc<Self>, period: Duration, max_age: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = self.sweep(max_age).await;
                if removed > 0 {
                    info!("Sweep removed {} expired cache entries", removed);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> (tempfile::TempDir, Arc<RenderCache>) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(RenderCache::new(dir.path()).unwrap());
        (dir, cache)
    }

    #[test]
    fn identical_bytes_share_a_fingerprint() {
        let a = Fingerprint::of(b"Shape \"sphere\"\n");
        let b = Fingerprint::of(b"Shape \"sphere\"\n");
        assert_eq!(a, b);
        assert_eq!(a.hex().len(), 64);
        assert_ne!(a, Fingerprint::of(b"Shape \"disk\"\n"));
    }

    #[tokio::test]
    async fn store_publishes_and_lookup_finds_it() {
        let (_dir, cache) = cache();
        let fp = Fingerprint::of(b"scene");
        assert!(cache.lookup(&fp).await.is_none());

        cache.store(&fp, b"image bytes").await.unwrap();
        assert_eq!(cache.lookup(&fp).await.unwrap(), b"image bytes");
    }

    #[tokio::test]
    async fn staging_files_are_not_hits_and_survive_the_sweep() {
        let (dir, cache) = cache();
        let fp = Fingerprint::of(b"scene");
        let staging = dir.path().join(format!("{}.png.tmp", fp.hex()));
        tokio::fs::write(&staging, b"partial").await.unwrap();

        assert!(cache.lookup(&fp).await.is_none());
        assert_eq!(cache.sweep(Duration::ZERO).await, 0);
        assert!(staging.is_file());
    }

    #[tokio::test]
    async fn second_request_hits_the_cache_instead_of_rendering() {
        let (_dir, cache) = cache();
        let fp = Fingerprint::of(b"scene");
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let bytes = cache
                .render_gated(&fp, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(b"image".to_vec())
                })
                .await
                .unwrap();
            assert_eq!(bytes.as_slice(), b"image");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_requests_render_once() {
        let (_dir, cache) = cache();
        let fp = Fingerprint::of(b"scene");
        let calls = Arc::new(AtomicUsize::new(0));

        let render = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<Vec<u8>, anyhow::Error>(b"image".to_vec())
        };

        let (a, b) = tokio::join!(
            cache.render_gated(&fp, || render(calls.clone())),
            cache.render_gated(&fp, || render(calls.clone())),
        );
        assert_eq!(a.unwrap().as_slice(), b"image");
        assert_eq!(b.unwrap().as_slice(), b"image");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_published_and_do_not_create_entries() {
        let (_dir, cache) = cache();
        let fp = Fingerprint::of(b"scene");

        let err = cache
            .render_gated(&fp, || async { Err(anyhow::anyhow!("renderer exploded")) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("renderer exploded"));
        assert!(cache.lookup(&fp).await.is_none());

        // the handle was retired, a later request may try again
        let bytes = cache
            .render_gated(&fp, || async { Ok(b"image".to_vec()) })
            .await
            .unwrap();
        assert_eq!(bytes.as_slice(), b"image");
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let (_dir, cache) = cache();
        let old = Fingerprint::of(b"old");
        cache.store(&old, b"bytes").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.sweep(Duration::from_millis(10)).await, 1);
        assert!(cache.lookup(&old).await.is_none());

        let fresh = Fingerprint::of(b"fresh");
        cache.store(&fresh, b"bytes").await.unwrap();
        assert_eq!(cache.sweep(Duration::from_secs(3600)).await, 0);
        assert!(cache.lookup(&fresh).await.is_some());
    }

    #[tokio::test]
    async fn sweeper_task_runs_on_its_interval() {
        let (_dir, cache) = cache();
        let fp = Fingerprint::of(b"scene");
        cache.store(&fp, b"bytes").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let handle = cache.clone().spawn_sweeper(Duration::from_millis(20), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert!(cache.lookup(&fp).await.is_none());
    }
}
