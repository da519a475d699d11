use crate::core::error::{Error, Result};
use crate::index::record::PageBuf;
use crate::storage::backend::StorageBackend;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

pub const DEFAULT_CACHE_PAGES: usize = 256;

/// LRU cache of decoded data-table records, shared by every cursor open
/// on one index handle.
pub struct LeafCache {
    pages: Mutex<LruCache<i64, Arc<PageBuf>>>,
}

impl LeafCache {
    pub fn new(capacity: usize) -> Self {
        LeafCache {
            pages: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
        }
    }

    pub fn get(&self, id: i64) -> Option<Arc<PageBuf>> {
        self.pages.lock().get(&id).cloned()
    }

    pub fn put(&self, id: i64, page: Arc<PageBuf>) {
        self.pages.lock().put(id, page);
    }

    pub fn invalidate(&self, id: i64) {
        self.pages.lock().pop(&id);
    }

    pub fn clear(&self) {
        self.pages.lock().clear();
    }
}

/// Read-side handle: backend plus cache. Cheap to copy into iterators.
#[derive(Clone, Copy)]
pub struct PageReader<'a> {
    pub backend: &'a dyn StorageBackend,
    pub cache: &'a LeafCache,
}

impl<'a> PageReader<'a> {
    /// Read a record that may legitimately be absent (dlidx probes).
    pub fn read_opt(&self, id: i64) -> Result<Option<Arc<PageBuf>>> {
        if let Some(page) = self.cache.get(id) {
            return Ok(Some(page));
        }
        match self.backend.data_read(id)? {
            Some(record) => {
                let page = PageBuf::from_record(record);
                self.cache.put(id, page.clone());
                Ok(Some(page))
            }
            None => Ok(None),
        }
    }

    /// Read a record that must exist; absence is corruption.
    pub fn read(&self, id: i64) -> Result<Arc<PageBuf>> {
        self.read_opt(id)?
            .ok_or_else(|| Error::corrupt(&format!("missing data record {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemBackend;

    #[test]
    fn test_read_through_and_invalidate() {
        let backend = MemBackend::new();
        backend.data_write(42, b"hello").unwrap();
        let cache = LeafCache::new(4);
        let reader = PageReader {
            backend: &backend,
            cache: &cache,
        };

        let page = reader.read(42).unwrap();
        assert_eq!(&page.data[..page.n], b"hello");
        // Served from cache even after the record is gone.
        backend.data_delete(42).unwrap();
        assert!(reader.read(42).is_ok());
        cache.invalidate(42);
        assert!(reader.read(42).is_err());
        assert!(reader.read_opt(42).unwrap().is_none());
    }
}
