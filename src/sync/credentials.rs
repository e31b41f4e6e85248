use crate::api::rate_limiter::RateLimiter;
use crate::api::target::{DelegatedHandle, LabelTarget};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Per-owner delegated handles, resolved lazily and kept for the life of
/// the process.
///
/// Misses are not cached, so an owner that appears in the directory later is
/// picked up on the next lookup. Two tasks missing on the same owner at once
/// may both query the directory; the cache keeps whichever equivalent handle
/// lands last.
pub struct CredentialCache {
    target: Arc<dyn LabelTarget>,
    limiter: Arc<RateLimiter>,
    handles: RwLock<HashMap<String, DelegatedHandle>>,
}

impl CredentialCache {
    pub fn new(target: Arc<dyn LabelTarget>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            target,
            limiter,
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Handle acting as `owner`, or `None` when the directory has no such user.
    pub async fn resolve(&self, owner: &str) -> Result<Option<DelegatedHandle>> {
        if let Some(handle) = self.cached(owner) {
            tracing::trace!(owner, "delegated handle cache hit");
            return Ok(Some(handle));
        }

        self.limiter.acquire().await;
        let account = self
            .target
            .find_owner(owner)
            .await
            .with_context(|| format!("owner lookup failed for {owner}"))?;

        let Some(account) = account else {
            tracing::info!(owner, "no target account found for file owner");
            return Ok(None);
        };

        let handle = DelegatedHandle::from(account);
        self.handles
            .write()
            .expect("credential cache lock poisoned")
            .insert(owner.to_owned(), handle.clone());
        tracing::debug!(owner, user_id = %handle.user_id, "cached delegated handle");
        Ok(Some(handle))
    }

    pub fn len(&self) -> usize {
        self.handles
            .read()
            .expect("credential cache lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, owner: &str) -> Option<DelegatedHandle> {
        self.handles
            .read()
            .expect("credential cache lock poisoned")
            .get(owner)
            .cloned()
    }
}
