use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

use lru::LruCache;

/// Parent chains longer than this are treated as rooted at the last node seen.
const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNode {
    pub name: String,
    pub parent: Option<String>,
}

/// Memoized remote id -> `/`-joined path, built from parent pointers.
pub struct RemotePathCache {
    entries: Mutex<LruCache<String, String>>,
}

impl RemotePathCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn cached(&self, id: &str) -> Option<String> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Resolves `id` to its full path, calling `lookup` only for ids whose
    /// path is not cached. `Ok(None)` means `lookup` does not know `id`.
    pub async fn resolve<F, Fut, E>(&self, id: &str, lookup: F) -> Result<Option<String>, E>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<Option<RemoteNode>, E>>,
    {
        let mut chain: Vec<(String, String)> = Vec::new();
        let mut base = String::new();
        let mut current = Some(id.to_string());

        while let Some(node_id) = current.take() {
            if let Some(hit) = self.cached(&node_id) {
                base = hit;
                break;
            }
            if chain.len() >= MAX_DEPTH {
                break;
            }
            match lookup(node_id.clone()).await? {
                Some(node) => {
                    current = node.parent;
                    chain.push((node_id, node.name));
                }
                None if chain.is_empty() => return Ok(None),
                None => break,
            }
        }

        let mut entries = self.lock();
        for (node_id, name) in chain.into_iter().rev() {
            base.push('/');
            base.push_str(&name);
            entries.put(node_id, base.clone());
        }
        Ok(Some(base))
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
