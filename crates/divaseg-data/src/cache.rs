//! Bounded cache of decoded image/ground-truth pairs.
//!
//! Consecutive crops mostly come from the same page, so keeping the last few
//! decoded pages avoids decoding a page once per crop. Eviction is FIFO.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};

use image::RgbImage;

/// A decoded page and its ground truth.
#[derive(Debug)]
pub struct DecodedPair {
    pub image: RgbImage,
    pub gt: RgbImage,
}

#[derive(Debug, Default)]
struct Entries {
    order: VecDeque<String>,
    pairs: HashMap<String, Arc<DecodedPair>>,
}

/// Instance-local cache keyed by image filename.
#[derive(Debug)]
pub struct ImageCache {
    capacity: usize,
    entries: Mutex<Entries>,
}

impl ImageCache {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<DecodedPair>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pairs
            .get(name)
            .cloned()
    }

    pub fn insert(&self, name: &str, pair: Arc<DecodedPair>) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.pairs.insert(name.to_owned(), pair).is_some() {
            return;
        }
        entries.order.push_back(name.to_owned());
        while entries.order.len() > self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.pairs.remove(&oldest);
            }
        }
    }

    /// Returns the cached pair or decodes it with `load` and caches the result.
    pub fn get_or_try_insert<E>(
        &self,
        name: &str,
        load: impl FnOnce() -> Result<DecodedPair, E>,
    ) -> Result<Arc<DecodedPair>, E> {
        if let Some(pair) = self.get(name) {
            return Ok(pair);
        }
        // Decoding happens outside the lock; two workers may decode the same
        // page concurrently, the second insert just replaces the first.
        let pair = Arc::new(load()?);
        self.insert(name, pair.clone());
        Ok(pair)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pairs
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> DecodedPair {
        DecodedPair {
            image: RgbImage::new(1, 1),
            gt: RgbImage::new(1, 1),
        }
    }

    #[test]
    fn evicts_oldest_entry_beyond_capacity() {
        let cache = ImageCache::new(2);
        for name in ["a", "b", "c"] {
            cache.insert(name, Arc::new(pair()));
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn loader_runs_only_on_miss() {
        let cache = ImageCache::new(1);
        let mut loads = 0;

        for _ in 0..3 {
            cache
                .get_or_try_insert::<()>("a", || {
                    loads += 1;
                    Ok(pair())
                })
                .unwrap();
        }

        assert_eq!(loads, 1);
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let cache = ImageCache::new(0);

        cache.insert("a", Arc::new(pair()));

        assert!(cache.is_empty());
    }
}
