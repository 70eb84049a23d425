use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use http::{HeaderMap, StatusCode};
use tokio::fs as async_fs;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::entity::CachedEntity;
use crate::lock::LockManager;
use crate::request::CacheRequest;

/// Every stored variant for one URL, backed by one on-disk directory. The
/// entity list is loaded lazily from the directory listing and guarded by a
/// per-group mutex so concurrent revalidations cannot corrupt it.
pub struct CachedRequestGroup {
    url: String,
    dir: PathBuf,
    locks: LockManager,
    entities: Mutex<Option<Vec<Arc<CachedEntity>>>>,
}

impl CachedRequestGroup {
    pub(crate) fn new(url: String, dir: PathBuf, locks: LockManager) -> Self {
        Self {
            url,
            dir,
            locks,
            entities: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Key protecting lookups and structural mutation for this URL.
    pub(crate) fn lock_key(&self) -> String {
        format!("{}#", self.url)
    }

    /// Whether any lock in this group's key family is held.
    pub fn in_use(&self) -> bool {
        self.locks.is_locked_with_prefix(&self.lock_key())
    }

    async fn ensure_loaded<'a>(
        &self,
        guard: &'a mut Option<Vec<Arc<CachedEntity>>>,
    ) -> Result<&'a mut Vec<Arc<CachedEntity>>> {
        if guard.is_none() {
            let mut entities = Vec::new();
            let mut entries = match async_fs::read_dir(&self.dir).await {
                Ok(entries) => Some(entries),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to list cache dir {}", self.dir.display()));
                }
            };
            if let Some(entries) = entries.as_mut() {
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    let is_head = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with('$') && n.ends_with("-head"))
                        .unwrap_or(false);
                    if !is_head {
                        continue;
                    }
                    match CachedEntity::load(&path, self.locks.clone()).await {
                        Ok(entity) => entities.push(Arc::new(entity)),
                        Err(err) => {
                            warn!(
                                path = %path.display(),
                                error = %err,
                                "skipping unreadable cache entity"
                            );
                        }
                    }
                }
            }
            *guard = Some(entities);
        }
        Ok(guard.as_mut().expect("entities loaded"))
    }

    /// Find the stored entity matching the request's method and variant
    /// headers. Entities whose body has gone missing are pruned as the scan
    /// passes them.
    pub async fn find(&self, request: &CacheRequest) -> Result<Option<Arc<CachedEntity>>> {
        let method = request.lookup_method();
        let url = request.url();
        let mut guard = self.entities.lock().await;
        let entities = self.ensure_loaded(&mut guard).await?;

        let mut index = 0;
        while index < entities.len() {
            let entity = entities[index].clone();
            if entity.is_dangling().await {
                debug!(url = %self.url, "dropping dangling cache entity");
                entity.remove_files().await;
                entities.remove(index);
                continue;
            }
            if entity.matches(method, &url) && entity.is_variation(request) {
                return Ok(Some(entity));
            }
            index += 1;
        }
        Ok(None)
    }

    /// Find the entity an upstream response refers to (by `ETag`).
    pub async fn find_by_etag(&self, etag: &str) -> Result<Option<Arc<CachedEntity>>> {
        let mut guard = self.entities.lock().await;
        let entities = self.ensure_loaded(&mut guard).await?;
        Ok(entities
            .iter()
            .find(|entity| entity.etag().as_deref() == Some(etag))
            .cloned())
    }

    /// Apply an upstream response: update the entity carrying the response's
    /// entity tag, or create a fresh one. When a prior (stale) entity served
    /// this request variation and the response introduces a new tag, the
    /// prior entity is superseded and removed.
    pub async fn store(
        &self,
        request: &CacheRequest,
        status: StatusCode,
        reason: Option<&str>,
        headers: &HeaderMap,
        tmp_body: Option<(PathBuf, u64)>,
        prior: Option<Arc<CachedEntity>>,
    ) -> Result<Arc<CachedEntity>> {
        let etag = headers
            .get(http::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut guard = self.entities.lock().await;
        let entities = self.ensure_loaded(&mut guard).await?;

        if let Some(etag) = etag.as_deref() {
            if let Some(existing) = entities
                .iter()
                .find(|entity| entity.etag().as_deref() == Some(etag))
                .cloned()
            {
                existing.set_response(status, reason, headers, tmp_body).await?;
                existing.record_variation(request).await?;
                return Ok(existing);
            }
        }

        let revalidation =
            status == StatusCode::NOT_MODIFIED || status == StatusCode::PRECONDITION_FAILED;
        if revalidation {
            // A conditional response referring to an entity no longer stored:
            // the cache and origin disagree about what was being revalidated.
            error!(
                url = %self.url,
                etag = etag.as_deref().unwrap_or("<none>"),
                "revalidation response matches no stored entity"
            );
            if let Some(fallback) = entities.first().cloned() {
                fallback.set_response(status, reason, headers, tmp_body).await?;
                fallback.record_variation(request).await?;
                return Ok(fallback);
            }
            anyhow::bail!("revalidation response for empty cache group {}", self.url);
        }

        let etag = etag.context("storing a response without an entity tag")?;
        let fresh = Arc::new(CachedEntity::new(
            &self.dir,
            request.lookup_method(),
            &self.url,
            &etag,
            self.locks.clone(),
        ));
        fresh.set_response(status, reason, headers, tmp_body).await?;
        fresh.record_variation(request).await?;

        if let Some(prior) = prior {
            if prior.head_path() != fresh.head_path() {
                prior.remove_files().await;
                entities.retain(|entity| entity.head_path() != prior.head_path());
            }
        }
        entities.push(fresh.clone());
        Ok(fresh)
    }

    /// Replace one entity with another (used when a stale variant is
    /// superseded outside the normal store path).
    pub async fn replace(
        &self,
        stale: Option<&Arc<CachedEntity>>,
        fresh: Arc<CachedEntity>,
    ) -> Result<()> {
        let mut guard = self.entities.lock().await;
        let entities = self.ensure_loaded(&mut guard).await?;
        if let Some(stale) = stale {
            stale.remove_files().await;
            entities.retain(|entity| entity.head_path() != stale.head_path());
        }
        entities.push(fresh);
        Ok(())
    }

    /// Mark every stored variant stale.
    pub async fn stale_all(&self) -> Result<()> {
        let mut guard = self.entities.lock().await;
        let entities = self.ensure_loaded(&mut guard).await?;
        for entity in entities.iter() {
            if let Err(err) = entity.mark_stale().await {
                warn!(
                    url = %self.url,
                    error = %err,
                    "failed to mark cache entity stale"
                );
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        let mut guard = self.entities.lock().await;
        self.ensure_loaded(&mut guard)
            .await
            .map(|entities| entities.len())
            .unwrap_or(0)
    }
}
