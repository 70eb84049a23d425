use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use http::Uri;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::fs as async_fs;
use tracing::{debug, trace, warn};

use crate::entity::CachedEntity;
use crate::group::CachedRequestGroup;
use crate::lock::LockManager;

/// Process-wide map from URL to its cached variant group, bounded by entry
/// count. Over capacity the least-recently-used group is evicted and its
/// directory deleted, unless a lock is held on it and eviction is not
/// aggressive. A `Weak` side table keeps the map honest: at most one live
/// group object exists per URL, even after an eviction races a reader that
/// still holds the old handle.
pub struct CacheIndex {
    root: PathBuf,
    max_capacity: usize,
    aggressive: bool,
    locks: LockManager,
    inner: Mutex<IndexInner>,
}

struct IndexInner {
    lru: LruCache<String, Arc<CachedRequestGroup>>,
    live: HashMap<String, Weak<CachedRequestGroup>>,
}

impl CacheIndex {
    pub async fn new(
        root: PathBuf,
        max_capacity: usize,
        aggressive: bool,
        locks: LockManager,
    ) -> Result<Self> {
        async_fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create cache root {}", root.display()))?;
        remove_temp_files(&root).await?;
        Ok(Self {
            root,
            max_capacity,
            aggressive,
            locks,
            inner: Mutex::new(IndexInner {
                lru: LruCache::unbounded(),
                live: HashMap::new(),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A fresh temp-file path inside the cache root; leftovers are swept on
    /// startup.
    pub fn temp_path(&self) -> PathBuf {
        self.root.join(format!("tmp_{}", uuid::Uuid::new_v4()))
    }

    /// Get or create the group for a URL. Never yields two live group
    /// objects for the same URL.
    pub async fn find_group(&self, url: &str) -> Result<Arc<CachedRequestGroup>> {
        let dir = url_dir(&self.root, url)?;
        let (group, evicted) = {
            let mut inner = self.inner.lock();
            if let Some(group) = inner.lru.get(url) {
                return Ok(group.clone());
            }
            let group = match inner.live.get(url).and_then(Weak::upgrade) {
                // Evicted from the map earlier but still referenced; the same
                // object goes back in rather than a duplicate.
                Some(existing) => existing,
                None => Arc::new(CachedRequestGroup::new(
                    url.to_string(),
                    dir,
                    self.locks.clone(),
                )),
            };
            inner.lru.push(url.to_string(), group.clone());
            inner.live.retain(|_, weak| weak.strong_count() > 0);
            inner.live.insert(url.to_string(), Arc::downgrade(&group));
            let evicted = self.evict_over_capacity(&mut inner);
            (group, evicted)
        };
        for victim in evicted {
            trace!(url = %victim.url(), "evicting cache group");
            delete_group_dir(&self.root, victim.dir()).await;
        }
        Ok(group)
    }

    fn evict_over_capacity(&self, inner: &mut IndexInner) -> Vec<Arc<CachedRequestGroup>> {
        let mut evicted = Vec::new();
        // Never considers the entry that triggered the overflow; a map where
        // every other entry is in use stays over capacity until locks drain.
        let mut attempts = inner.lru.len().saturating_sub(1);
        while inner.lru.len() > self.max_capacity && attempts > 0 {
            attempts -= 1;
            let Some((url, group)) = inner.lru.pop_lru() else {
                break;
            };
            if !self.aggressive && group.in_use() {
                // Promote and look for a quieter victim.
                inner.lru.push(url, group);
                continue;
            }
            // The weak side-table entry stays: if a reader still holds this
            // group, the next lookup must return the same object.
            evicted.push(group);
        }
        evicted
    }

    /// Mark the groups for the given URLs stale (used after unsafe methods).
    pub async fn invalidate_urls(&self, urls: &[String]) -> Result<()> {
        for url in urls {
            let live = {
                let mut inner = self.inner.lock();
                inner
                    .lru
                    .get(url)
                    .cloned()
                    .or_else(|| inner.live.get(url).and_then(Weak::upgrade))
            };
            let group = match live {
                Some(group) => group,
                None => {
                    let dir = match url_dir(&self.root, url) {
                        Ok(dir) => dir,
                        Err(err) => {
                            debug!(url = %url, error = %err, "skipping invalidation of unparsable URL");
                            continue;
                        }
                    };
                    if async_fs::metadata(&dir).await.is_err() {
                        continue;
                    }
                    self.find_group(url).await?
                }
            };
            debug!(url = %url, "invalidating cache group");
            group.stale_all().await?;
        }
        Ok(())
    }

    /// Mark every stored group stale, on disk and in memory.
    pub async fn invalidate_all(&self) -> Result<()> {
        let live: Vec<Arc<CachedRequestGroup>> = {
            let inner = self.inner.lock();
            inner
                .live
                .values()
                .filter_map(Weak::upgrade)
                .collect()
        };
        let mut live_urls = std::collections::HashSet::new();
        for group in &live {
            live_urls.insert(group.url().to_string());
            group.stale_all().await?;
        }

        for head_path in collect_head_files(&self.root).await? {
            let entity = match CachedEntity::load(&head_path, self.locks.clone()).await {
                Ok(entity) => entity,
                Err(err) => {
                    warn!(
                        path = %head_path.display(),
                        error = %err,
                        "skipping unreadable cache entity during invalidation"
                    );
                    continue;
                }
            };
            if live_urls.contains(entity.url()) {
                continue;
            }
            if let Err(err) = entity.mark_stale().await {
                warn!(
                    path = %head_path.display(),
                    error = %err,
                    "failed to mark cache entity stale"
                );
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }
}

/// Lower-case a URL component and map anything outside `[a-z0-9]` to `_`.
fn safe(component: &str) -> String {
    component
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn hash16(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex()[..16].to_string()
}

/// Two-level hashed layout: a readable authority/path prefix, then a hash of
/// the URL without its query, then a hash of the full URL. Same-path URLs
/// that differ only in query share the third level but not the fourth.
pub(crate) fn url_dir(root: &Path, url: &str) -> Result<PathBuf> {
    let uri: Uri = url
        .parse()
        .with_context(|| format!("invalid cache URL {url:?}"))?;
    let scheme = uri.scheme_str().context("cache URL missing scheme")?;
    let authority = uri
        .authority()
        .context("cache URL missing authority")?
        .as_str();
    let path = uri.path();
    let base = format!("{scheme}://{authority}{path}");
    Ok(root
        .join(safe(authority))
        .join(safe(path))
        .join(format!("${}", hash16(&base)))
        .join(format!("${}", hash16(url))))
}

/// Remove a group directory and prune now-empty parents. Racing a concurrent
/// create is fine: removing a non-empty directory fails and the walk stops.
async fn delete_group_dir(root: &Path, dir: &Path) {
    async_fs::remove_dir_all(dir).await.ok();
    let mut current = dir.parent();
    while let Some(parent) = current {
        if parent == root {
            break;
        }
        if async_fs::remove_dir(parent).await.is_err() {
            break;
        }
        current = parent.parent();
    }
}

async fn remove_temp_files(root: &Path) -> Result<()> {
    let mut entries = match async_fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_temp = path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with("tmp_"))
                .unwrap_or(false);
        if is_temp {
            debug!(path = %path.display(), "removing stale cache temp file");
            async_fs::remove_file(&path).await.ok();
        }
    }
    Ok(())
}

async fn collect_head_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut heads = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match async_fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('$') && n.ends_with("-head"))
                .unwrap_or(false)
            {
                heads.push(path);
            }
        }
    }
    Ok(heads)
}
