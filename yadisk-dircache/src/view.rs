use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::alias::AliasMapper;
use crate::cache::{CacheError, DirectoryCache, ReadOptions};
use crate::paths;
use crate::tree::TreeNode;

/// What the user navigates: display paths in, display trees out. Every
/// read and invalidation goes to the cache under the real path.
#[derive(Clone)]
pub struct DirectoryView {
    cache: DirectoryCache,
    aliases: Arc<RwLock<AliasMapper>>,
}

impl DirectoryView {
    pub fn new(cache: DirectoryCache, aliases: Arc<RwLock<AliasMapper>>) -> Self {
        Self { cache, aliases }
    }

    pub fn cache(&self) -> &DirectoryCache {
        &self.cache
    }

    pub fn aliases(&self) -> RwLockReadGuard<'_, AliasMapper> {
        self.aliases.read().expect("alias mapper lock poisoned")
    }

    pub fn aliases_mut(&self) -> RwLockWriteGuard<'_, AliasMapper> {
        self.aliases.write().expect("alias mapper lock poisoned")
    }

    /// Real path behind a display path. Paths outside every alias are
    /// already real and come back normalized.
    pub fn real_path(&self, display_path: &str) -> Option<String> {
        let path = paths::normalize(display_path)?;
        Some(self.aliases().resolve_to_real(&path).unwrap_or(path))
    }

    pub fn display_path(&self, real_path: &str) -> Option<String> {
        let path = paths::normalize(real_path)?;
        Some(self.aliases().resolve_to_alias(&path).unwrap_or(path))
    }

    pub async fn open(&self, display_path: &str, options: ReadOptions) -> Result<TreeNode, CacheError> {
        let path = paths::normalize(display_path)
            .ok_or_else(|| CacheError::InvalidPath(display_path.to_string()))?;
        let real = {
            let aliases = self.aliases();
            if aliases.is_group(&path) {
                debug!(path = %path, "serving synthetic group listing");
                return Ok(aliases.synthetic_listing(&path));
            }
            aliases.resolve_to_real(&path).unwrap_or(path)
        };

        let tree = self.cache.get(&real, options).await?;
        let aliases = self.aliases();
        let mut display = aliases.to_display(&tree);
        aliases.attach_groups(&mut display);
        Ok(display)
    }

    pub fn invalidate(&self, display_path: &str) {
        if let Some(real) = self.real_path(display_path) {
            self.cache.invalidate(&real);
        }
    }
}
