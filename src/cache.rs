use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Remembers recently delivered event ids so redelivered callbacks are handled once.
#[derive(Clone)]
pub struct SeenEvents {
    cache: Arc<Mutex<LruCache<String, ()>>>,
}

impl SeenEvents {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1024).unwrap());
        Self {
            cache: Arc::new(Mutex::new(LruCache::new(cap))),
        }
    }

    /// Records `event_id`; returns `false` if it was already seen.
    pub fn first_seen(&self, event_id: &str) -> bool {
        let mut cache = match self.cache.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.put(event_id.to_string(), ()).is_none()
    }
}
