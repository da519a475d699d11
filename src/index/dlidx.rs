use crate::compression::varint::{get_varint, put_varint};
use crate::core::error::{Error, Result};
use crate::core::types::Rowid;
use crate::index::cache::PageReader;
use crate::index::record::dlidx_id;
use crate::storage::backend::StorageBackend;

/// A doclist that crosses at least this many termless leaves gets a
/// doclist-index.
pub const MIN_DLIDX_EMPTY: u32 = 4;

/// Doclist-index page:
///
/// ```text
///   byte(flags)            bit0 = 1 when the page is not the root
///   varint(firstChild)     leaf pgno (level 0) or child page key
///   varint(firstRowid)
///   { varint(rowidDelta) | 0x00 }
/// ```
///
/// Entry `e` describes child `firstChild + e` (the header pair is entry
/// 0). A `0x00` entry marks a leaf holding no rowid of this doclist.
/// Pages of level `k` are keyed `start_leaf + page_index`, which cannot
/// collide across doclists because a doclist-index only exists for a
/// doclist spanning more leaves than it needs index pages.
pub struct DlidxWriter {
    pub segid: u16,
    pub start_leaf: u32,
    pub page_size: usize,
    levels: Vec<DlidxLevel>,
    flushed_any: bool,
}

#[derive(Default)]
struct DlidxLevel {
    buf: Vec<u8>,
    open: bool,
    first_child: u32,
    first_rowid: Rowid,
    prev_rowid: Rowid,
    pages_flushed: u32,
}

impl DlidxWriter {
    pub fn new(segid: u16, page_size: usize) -> Self {
        DlidxWriter {
            segid,
            start_leaf: 0,
            page_size,
            levels: Vec::new(),
            flushed_any: false,
        }
    }

    /// Begin collecting for a new doclist starting on `leaf_pgno`.
    pub fn reset(&mut self, leaf_pgno: u32) {
        self.start_leaf = leaf_pgno;
        self.levels.clear();
        self.flushed_any = false;
    }

    /// Record the first rowid encountered on `leaf_pgno`, or a rowid-less
    /// continuation leaf.
    pub fn append(
        &mut self,
        backend: &dyn StorageBackend,
        leaf_pgno: u32,
        rowid: Option<Rowid>,
    ) -> Result<()> {
        self.append_at(backend, 0, leaf_pgno, rowid)
    }

    fn append_at(
        &mut self,
        backend: &dyn StorageBackend,
        level: usize,
        child: u32,
        rowid: Option<Rowid>,
    ) -> Result<()> {
        if self.levels.len() <= level {
            self.levels.push(DlidxLevel::default());
        }
        let lvl = &mut self.levels[level];
        if !lvl.open {
            // The first child of a page always carries a rowid.
            debug_assert!(rowid.is_some());
            lvl.open = true;
            lvl.first_child = child;
            lvl.first_rowid = rowid.unwrap_or(0);
            lvl.prev_rowid = lvl.first_rowid;
            lvl.buf.clear();
            return Ok(());
        }
        match rowid {
            None => {
                lvl.buf.push(0);
                Ok(())
            }
            Some(r) => {
                if lvl.buf.len() + 24 >= self.page_size {
                    self.flush_page(backend, level, false)?;
                    return self.append_at(backend, level, child, Some(r));
                }
                let lvl = &mut self.levels[level];
                put_varint(&mut lvl.buf, r.wrapping_sub(lvl.prev_rowid) as u64);
                lvl.prev_rowid = r;
                Ok(())
            }
        }
    }

    fn flush_page(&mut self, backend: &dyn StorageBackend, level: usize, root: bool) -> Result<()> {
        let (key, first_child, first_rowid, body) = {
            let lvl = &mut self.levels[level];
            debug_assert!(lvl.open);
            let key = self.start_leaf + lvl.pages_flushed;
            lvl.pages_flushed += 1;
            lvl.open = false;
            (
                key,
                lvl.first_child,
                lvl.first_rowid,
                std::mem::take(&mut lvl.buf),
            )
        };
        let mut page = Vec::with_capacity(body.len() + 20);
        page.push(if root { 0 } else { 1 });
        put_varint(&mut page, first_child as u64);
        put_varint(&mut page, first_rowid as u64);
        page.extend_from_slice(&body);
        backend.data_write(dlidx_id(self.segid, level as u8, key), &page)?;
        self.flushed_any = true;
        if !root {
            self.append_at(backend, level + 1, key, Some(first_rowid))?;
        }
        Ok(())
    }

    /// True once the collected doclist deserves an index on disk.
    pub fn worth_keeping(&self, n_empty: u32) -> bool {
        self.flushed_any || n_empty >= MIN_DLIDX_EMPTY
    }

    /// Write out all buffered pages; the single page of the top level
    /// becomes the root.
    pub fn finish(&mut self, backend: &dyn StorageBackend) -> Result<()> {
        let mut level = 0;
        while level < self.levels.len() {
            let is_top = level + 1 == self.levels.len() && self.levels[level].pages_flushed == 0;
            if self.levels[level].open {
                self.flush_page(backend, level, is_top)?;
            }
            level += 1;
        }
        self.levels.clear();
        self.flushed_any = false;
        Ok(())
    }
}

/// Reader over one doclist-index.
pub struct DlidxIter {
    pub segid: u16,
    pub start_leaf: u32,
    pub root_level: u8,
}

impl DlidxIter {
    /// Probe for a doclist-index rooted at `start_leaf`. Walks upward
    /// from level 0 until the page without the not-root flag is found.
    pub fn probe(reader: &PageReader<'_>, segid: u16, start_leaf: u32) -> Result<Option<DlidxIter>> {
        let mut level = 0u8;
        loop {
            let page = match reader.read_opt(dlidx_id(segid, level, start_leaf))? {
                Some(p) => p,
                None => {
                    if level == 0 {
                        return Ok(None);
                    }
                    // A not-root flag promised a parent page.
                    return Err(Error::corrupt("dlidx parent page missing"));
                }
            };
            if page.n > 0 && page.data[0] & 1 == 0 {
                return Ok(Some(DlidxIter {
                    segid,
                    start_leaf,
                    root_level: level,
                }));
            }
            level += 1;
        }
    }

    /// Largest `(leaf_pgno, first_rowid)` with `first_rowid <= target`,
    /// or the doclist's first leaf when target precedes everything.
    pub fn seek(&self, reader: &PageReader<'_>, target: Rowid) -> Result<(u32, Rowid)> {
        let mut level = self.root_level;
        let mut key = self.start_leaf;
        loop {
            let page = reader.read(dlidx_id(self.segid, level, key))?;
            let data = &page.data[..page.n];
            let mut i = 1usize;
            let (first_child, n) = get_varint(&data[i..]);
            i += n;
            let (first_rowid, n) = get_varint(&data[i..]);
            i += n;
            let first_rowid = first_rowid as Rowid;

            let mut best_child = first_child as u32;
            let mut best_rowid = first_rowid;
            let mut rowid = first_rowid;
            let mut e = 0u32;
            while i < data.len() {
                e += 1;
                if data[i] == 0 {
                    i += 1;
                    continue;
                }
                let (delta, n) = get_varint(&data[i..]);
                i += n;
                rowid = rowid.wrapping_add(delta as Rowid);
                if rowid <= target {
                    best_child = first_child as u32 + e;
                    best_rowid = rowid;
                } else {
                    break;
                }
            }

            if level == 0 {
                return Ok((best_child, best_rowid));
            }
            level -= 1;
            key = best_child;
        }
    }

    /// Last leaf of the doclist that holds a rowid.
    pub fn last_leaf(&self, reader: &PageReader<'_>) -> Result<(u32, Rowid)> {
        self.seek(reader, Rowid::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::cache::{LeafCache, PageReader};
    use crate::storage::backend::MemBackend;

    fn reader<'a>(backend: &'a MemBackend, cache: &'a LeafCache) -> PageReader<'a> {
        PageReader { backend, cache }
    }

    #[test]
    fn test_single_page_round_trip() {
        let backend = MemBackend::new();
        let cache = LeafCache::new(16);
        let mut w = DlidxWriter::new(3, 1000);
        w.reset(5);
        // Doclist starts on leaf 5, crosses empty leaf 7.
        w.append(&backend, 5, Some(100)).unwrap();
        w.append(&backend, 6, Some(200)).unwrap();
        w.append(&backend, 7, None).unwrap();
        w.append(&backend, 8, Some(350)).unwrap();
        assert!(w.worth_keeping(4));
        w.finish(&backend).unwrap();

        let r = reader(&backend, &cache);
        let iter = DlidxIter::probe(&r, 3, 5).unwrap().unwrap();
        assert_eq!(iter.root_level, 0);
        assert_eq!(iter.seek(&r, 100).unwrap(), (5, 100));
        assert_eq!(iter.seek(&r, 150).unwrap(), (5, 100));
        assert_eq!(iter.seek(&r, 200).unwrap(), (6, 200));
        assert_eq!(iter.seek(&r, 349).unwrap(), (6, 200));
        assert_eq!(iter.seek(&r, 350).unwrap(), (8, 350));
        assert_eq!(iter.seek(&r, 99).unwrap(), (5, 100));
        assert_eq!(iter.last_leaf(&r).unwrap(), (8, 350));
    }

    #[test]
    fn test_probe_absent() {
        let backend = MemBackend::new();
        let cache = LeafCache::new(16);
        let r = reader(&backend, &cache);
        assert!(DlidxIter::probe(&r, 3, 5).unwrap().is_none());
    }

    #[test]
    fn test_multi_level() {
        let backend = MemBackend::new();
        let cache = LeafCache::new(64);
        // Tiny pages force level promotion.
        let mut w = DlidxWriter::new(9, 64);
        w.reset(1);
        let n_leaves = 200u32;
        for leaf in 0..n_leaves {
            w.append(&backend, 1 + leaf, Some((leaf as Rowid) * 10)).unwrap();
        }
        w.finish(&backend).unwrap();

        let r = reader(&backend, &cache);
        let iter = DlidxIter::probe(&r, 9, 1).unwrap().unwrap();
        assert!(iter.root_level >= 1);
        for leaf in [0u32, 1, 57, 123, 199] {
            let target = (leaf as Rowid) * 10;
            assert_eq!(iter.seek(&r, target).unwrap(), (1 + leaf, target));
            assert_eq!(iter.seek(&r, target + 5).unwrap(), (1 + leaf, target));
        }
        assert_eq!(iter.last_leaf(&r).unwrap(), (n_leaves, (n_leaves as Rowid - 1) * 10));
    }
}
