use crate::compression::varint::{put_varint, varint_len};
use crate::core::error::Result;
use crate::core::types::Rowid;
use crate::index::dlidx::{DlidxWriter, MIN_DLIDX_EMPTY};
use crate::index::record::{interior_id, leaf_id, put_u16, LEAF_HDR};
use crate::storage::backend::StorageBackend;

/// Longest common prefix of two terms.
pub fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    let n = a.len().min(b.len());
    let mut i = 0;
    while i < n && a[i] == b[i] {
        i += 1;
    }
    i
}

/// Builds the leaves of one segment, one target-size page at a time.
///
/// Layout invariants maintained here:
/// - the first term on a page is stored uncompressed and its offset is
///   recorded in the page header;
/// - the first rowid on a page is absolute and its offset is recorded in
///   the page header; the first rowid of every doclist is absolute too;
/// - position lists spill across leaves in exact page-size chunks;
/// - every leaf after the first that opens with a new term contributes a
///   separator row to the idx table, tagged with the dlidx flag once the
///   term's doclist is known to carry a doclist-index.
pub struct SegmentWriter<'a> {
    backend: &'a dyn StorageBackend,
    pub segid: u16,
    pub page_size: usize,
    pub pgno_first: u32,

    page: Vec<u8>,
    pgno: u32,
    term: Vec<u8>,
    have_prev_term: bool,
    first_term_in_page: bool,
    first_rowid_in_page: bool,
    first_rowid_in_doclist: bool,
    doclist_open: bool,
    page_has_term: bool,
    page_has_rowid: bool,
    prev_rowid: Rowid,

    /// Termless leaves flushed since the current term began.
    n_empty: u32,
    dlidx: DlidxWriter,
    /// Deferred idx row for the leaf the current term opened, written
    /// once the dlidx decision for that term is known.
    pending_idx: Option<PendingIdx>,

    pub n_leaf_written: u32,
}

struct PendingIdx {
    separator: Vec<u8>,
    pgno: u32,
    dlidx: bool,
}

impl<'a> SegmentWriter<'a> {
    pub fn new(backend: &'a dyn StorageBackend, segid: u16, page_size: usize) -> Self {
        Self::resume(backend, segid, page_size, 1)
    }

    /// Continue an existing segment at `next_pgno`. The previous term is
    /// unknown, so the first term written is stored and indexed in full.
    pub fn resume(
        backend: &'a dyn StorageBackend,
        segid: u16,
        page_size: usize,
        next_pgno: u32,
    ) -> Self {
        SegmentWriter {
            backend,
            segid,
            page_size,
            pgno_first: next_pgno,
            page: vec![0u8; LEAF_HDR],
            pgno: next_pgno,
            term: Vec::new(),
            have_prev_term: false,
            first_term_in_page: true,
            first_rowid_in_page: true,
            first_rowid_in_doclist: true,
            doclist_open: false,
            page_has_term: false,
            page_has_rowid: false,
            prev_rowid: 0,
            n_empty: 0,
            dlidx: DlidxWriter::new(segid, page_size),
            pending_idx: None,
            n_leaf_written: 0,
        }
    }

    /// Begin a new term. Terms must arrive in strictly ascending order.
    pub fn append_term(&mut self, key: &[u8]) -> Result<()> {
        debug_assert!(!self.have_prev_term || key > self.term.as_slice());
        self.end_doclist()?;

        // A term offset must fit the u16 header field even on the
        // largest permitted pages.
        if self.page.len() >= self.page_size || self.page.len() > u16::MAX as usize {
            self.flush_leaf()?;
        }

        if self.first_term_in_page {
            let off = self.page.len() as u16;
            put_u16(&mut self.page, 2, off);
            put_varint(&mut self.page, key.len() as u64);
            self.page.extend_from_slice(key);
            self.first_term_in_page = false;
            if self.pgno > self.pgno_first || self.pgno_first > 1 {
                // Separator: the shortest prefix of the new term strictly
                // greater than the previous one, or the full term when
                // resuming without context.
                let separator = if self.have_prev_term {
                    let n = common_prefix(&self.term, key);
                    key[..n + 1].to_vec()
                } else {
                    key.to_vec()
                };
                self.pending_idx = Some(PendingIdx {
                    separator,
                    pgno: self.pgno,
                    dlidx: false,
                });
            }
        } else {
            let n_prefix = common_prefix(&self.term, key);
            put_varint(&mut self.page, n_prefix as u64);
            put_varint(&mut self.page, (key.len() - n_prefix) as u64);
            self.page.extend_from_slice(&key[n_prefix..]);
        }

        self.term.clear();
        self.term.extend_from_slice(key);
        self.have_prev_term = true;
        self.doclist_open = true;
        self.first_rowid_in_doclist = true;
        self.page_has_term = true;
        self.n_empty = 0;
        self.dlidx.reset(self.pgno);
        Ok(())
    }

    /// Append one `(rowid, poslist)` entry to the open doclist.
    pub fn append_entry(&mut self, rowid: Rowid, pos_data: &[u8], delete: bool) -> Result<()> {
        debug_assert!(self.doclist_open);
        if self.first_rowid_in_page && self.page.len() > u16::MAX as usize {
            // Keep the rowid offset representable in the u16 header.
            self.flush_leaf()?;
        }
        if self.first_rowid_in_page {
            let off = self.page.len() as u16;
            put_u16(&mut self.page, 0, off);
            self.first_rowid_in_page = false;
        }
        if self.first_rowid_in_doclist || !self.page_has_rowid {
            put_varint(&mut self.page, rowid as u64);
            self.dlidx.append(self.backend, self.pgno, Some(rowid))?;
        } else {
            debug_assert!(rowid > self.prev_rowid);
            put_varint(&mut self.page, rowid.wrapping_sub(self.prev_rowid) as u64);
        }
        self.first_rowid_in_doclist = false;
        self.page_has_rowid = true;
        self.prev_rowid = rowid;

        put_varint(&mut self.page, (pos_data.len() as u64) << 1 | delete as u64);

        // Spill the position list across page boundaries in exact
        // page-size chunks.
        let mut data = pos_data;
        while self.page.len() + data.len() >= self.page_size {
            let space = self.page_size.saturating_sub(self.page.len()).min(data.len());
            self.page.extend_from_slice(&data[..space]);
            data = &data[space..];
            self.flush_leaf()?;
        }
        self.page.extend_from_slice(data);
        Ok(())
    }

    /// Close the open doclist: terminator byte, dlidx decision, idx row.
    fn end_doclist(&mut self) -> Result<()> {
        if self.doclist_open {
            self.page.push(0);
            self.doclist_open = false;
            if self.dlidx.worth_keeping(self.n_empty) {
                self.dlidx.finish(self.backend)?;
                if let Some(p) = self.pending_idx.as_mut() {
                    // The row describes the term that opened this leaf; a
                    // doclist long enough for a dlidx is that term's.
                    if p.pgno == self.dlidx.start_leaf {
                        p.dlidx = true;
                    }
                }
            }
        }
        if let Some(p) = self.pending_idx.take() {
            self.backend
                .idx_write(self.segid, &p.separator, (p.pgno as i64) << 1 | p.dlidx as i64)?;
        }
        Ok(())
    }

    fn flush_leaf(&mut self) -> Result<()> {
        if self.doclist_open && !self.page_has_rowid {
            // Pure spill page: the doclist crosses it without a rowid.
            self.dlidx.append(self.backend, self.pgno, None)?;
        }
        self.backend
            .data_write(leaf_id(self.segid, self.pgno), &self.page)?;
        if !self.page_has_term {
            self.n_empty += 1;
        }
        self.n_leaf_written += 1;
        self.pgno += 1;
        self.page.clear();
        self.page.resize(LEAF_HDR, 0);
        self.first_term_in_page = true;
        self.first_rowid_in_page = true;
        self.page_has_term = false;
        self.page_has_rowid = false;
        Ok(())
    }

    /// Flush trailing state. Returns `(pgno_last, leaves_written)`;
    /// `pgno_last < pgno_first` means nothing was written.
    pub fn finish(mut self) -> Result<(u32, u32)> {
        self.end_doclist()?;
        if self.page.len() > LEAF_HDR {
            self.flush_leaf()?;
        }
        Ok((self.pgno.wrapping_sub(1), self.n_leaf_written))
    }
}

/// Build the interior b-tree pages for a completed segment from its idx
/// rows and leaf page-number gaps, and return the segment height
/// (1 = leaves only).
///
/// Height-1 nodes interleave `termEntry` separators with `noTerm` runs
/// of termless leaves (bit0 of the lead byte marks a doclist-index over
/// the run). Higher levels carry only `termEntry` items. In-order
/// traversal of the finished tree yields exactly the idx-row separators.
pub fn build_btree(
    backend: &dyn StorageBackend,
    segid: u16,
    pgno_first: u32,
    pgno_last: u32,
    page_size: usize,
) -> Result<u8> {
    let rows = backend.idx_scan(segid)?;
    if rows.is_empty() {
        return Ok(1);
    }

    let mut level = InteriorBuilder::new(backend, segid, 1, page_size, pgno_first);
    let mut prev_leaf = pgno_first;
    for (term, value) in &rows {
        let leaf_pgno = (*value >> 1) as u32;
        let gap = leaf_pgno.saturating_sub(prev_leaf + 1);
        if gap > 0 {
            level.add_no_term(gap, gap >= MIN_DLIDX_EMPTY);
        }
        level.add_term(term, leaf_pgno)?;
        prev_leaf = leaf_pgno;
    }
    let trailing = pgno_last.saturating_sub(prev_leaf);
    if trailing > 0 {
        level.add_no_term(trailing, trailing >= MIN_DLIDX_EMPTY);
    }
    let (mut n_pages, mut promoted) = level.finish()?;

    let mut height = 2u8;
    while n_pages > 1 {
        let mut upper = InteriorBuilder::new(backend, segid, height, page_size, 1);
        for (i, term) in promoted.iter().enumerate() {
            upper.add_term(term, i as u32 + 2)?;
        }
        let done = upper.finish()?;
        n_pages = done.0;
        promoted = done.1;
        height += 1;
    }
    Ok(height)
}

/// Accumulates one interior level, splitting on page size the way a
/// b-tree node splits: the overflowing separator is promoted to the
/// parent and its child becomes the next page's leftmost child.
struct InteriorBuilder<'a> {
    backend: &'a dyn StorageBackend,
    segid: u16,
    height: u8,
    page_size: usize,
    buf: Vec<u8>,
    term: Vec<u8>,
    entries_on_page: usize,
    pgno: u32,
    promoted: Vec<Vec<u8>>,
}

impl<'a> InteriorBuilder<'a> {
    fn new(
        backend: &'a dyn StorageBackend,
        segid: u16,
        height: u8,
        page_size: usize,
        leftmost_child: u32,
    ) -> Self {
        let mut buf = Vec::new();
        put_varint(&mut buf, leftmost_child as u64);
        InteriorBuilder {
            backend,
            segid,
            height,
            page_size,
            buf,
            term: Vec::new(),
            entries_on_page: 0,
            pgno: 1,
            promoted: Vec::new(),
        }
    }

    fn add_term(&mut self, term: &[u8], child: u32) -> Result<()> {
        let need = varint_len(term.len() as u64 + 2) + varint_len(term.len() as u64) + term.len();
        if self.entries_on_page > 0 && self.buf.len() + need > self.page_size {
            self.flush_page()?;
            // The separator is promoted; its child opens the new page.
            put_varint(&mut self.buf, child as u64);
            self.promoted.push(term.to_vec());
            self.term.clear();
            return Ok(());
        }
        let n_prefix = if self.entries_on_page > 0 {
            common_prefix(&self.term, term)
        } else {
            0
        };
        put_varint(&mut self.buf, n_prefix as u64 + 2);
        put_varint(&mut self.buf, (term.len() - n_prefix) as u64);
        self.buf.extend_from_slice(&term[n_prefix..]);
        self.entries_on_page += 1;
        self.term.clear();
        self.term.extend_from_slice(term);
        Ok(())
    }

    fn add_no_term(&mut self, n_empty: u32, dlidx: bool) {
        debug_assert_eq!(self.height, 1);
        self.buf.push(dlidx as u8);
        put_varint(&mut self.buf, n_empty as u64);
    }

    fn flush_page(&mut self) -> Result<()> {
        self.backend
            .data_write(interior_id(self.segid, self.height, self.pgno), &self.buf)?;
        self.pgno += 1;
        self.buf.clear();
        self.entries_on_page = 0;
        Ok(())
    }

    /// Returns `(pages_written, promoted_separators)`.
    fn finish(mut self) -> Result<(u32, Vec<Vec<u8>>)> {
        self.flush_page()?;
        Ok((self.pgno - 1, std::mem::take(&mut self.promoted)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::record::{dlidx_id, get_u16};
    use crate::storage::backend::MemBackend;

    #[test]
    fn test_common_prefix() {
        assert_eq!(common_prefix(b"abc", b"abd"), 2);
        assert_eq!(common_prefix(b"abc", b"abc"), 3);
        assert_eq!(common_prefix(b"abc", b"xyz"), 0);
        assert_eq!(common_prefix(b"ab", b"abcd"), 2);
        assert_eq!(common_prefix(b"", b"a"), 0);
    }

    #[test]
    fn test_single_leaf_layout() {
        let backend = MemBackend::new();
        let mut w = SegmentWriter::new(&backend, 4, 1000);
        w.append_term(b"0alpha").unwrap();
        w.append_entry(1, &[2, 3], false).unwrap();
        w.append_entry(4, &[2], false).unwrap();
        w.append_term(b"0beta").unwrap();
        w.append_entry(2, &[4], true).unwrap();
        let (pgno_last, n_leaf) = w.finish().unwrap();
        assert_eq!((pgno_last, n_leaf), (1, 1));

        let page = backend.data_read(leaf_id(4, 1)).unwrap().unwrap();
        // First term at offset 4, first rowid right after the term image.
        assert_eq!(get_u16(&page, 2), 4);
        let rowid_off = get_u16(&page, 0) as usize;
        assert_eq!(rowid_off, 4 + 1 + 6);
        assert_eq!(page[rowid_off], 1); // varint(1)
        // No idx rows for a single-leaf segment.
        assert!(backend.idx_scan(4).unwrap().is_empty());
    }

    #[test]
    fn test_multi_leaf_emits_idx_rows() {
        let backend = MemBackend::new();
        let mut w = SegmentWriter::new(&backend, 4, 64);
        for i in 0..40u32 {
            let term = format!("0term{:03}", i);
            w.append_term(term.as_bytes()).unwrap();
            w.append_entry(1, &[5, 4], false).unwrap();
        }
        let (pgno_last, n_leaf) = w.finish().unwrap();
        assert!(n_leaf > 1);
        assert_eq!(pgno_last, n_leaf);

        let rows = backend.idx_scan(4).unwrap();
        assert!(!rows.is_empty());
        // Separator terms and leaf numbers are strictly increasing.
        for pair in rows.windows(2) {
            assert!(pair[0].0 < pair[1].0);
            assert!(pair[0].1 >> 1 < pair[1].1 >> 1);
        }
        for (_, v) in &rows {
            let pgno = (v >> 1) as u32;
            assert!(pgno >= 2 && pgno <= pgno_last);
            assert!(backend.data_read(leaf_id(4, pgno)).unwrap().is_some());
        }
    }

    #[test]
    fn test_long_doclist_creates_dlidx() {
        let backend = MemBackend::new();
        let mut w = SegmentWriter::new(&backend, 6, 64);
        w.append_term(b"0common").unwrap();
        for rowid in 0..400 {
            w.append_entry(rowid * 3, &[9, 9, 9, 9], false).unwrap();
        }
        w.append_term(b"0rare").unwrap();
        w.append_entry(1, &[4], false).unwrap();
        let (pgno_last, _) = w.finish().unwrap();
        assert!(pgno_last > 5);

        // A dlidx root exists for the long doclist, rooted at leaf 1.
        assert!(backend.data_read(dlidx_id(6, 0, 1)).unwrap().is_some());
    }

    #[test]
    fn test_short_doclists_get_no_dlidx() {
        let backend = MemBackend::new();
        let mut w = SegmentWriter::new(&backend, 6, 64);
        w.append_term(b"0aa").unwrap();
        w.append_entry(1, &[7, 7], false).unwrap();
        w.append_term(b"0bb").unwrap();
        for rowid in 0..10 {
            w.append_entry(rowid, &[7, 7], false).unwrap();
        }
        w.finish().unwrap();
        assert!(backend.data_read(dlidx_id(6, 0, 1)).unwrap().is_none());
        assert!(backend.data_read(dlidx_id(6, 0, 2)).unwrap().is_none());
    }

    #[test]
    fn test_btree_build_heights() {
        let backend = MemBackend::new();
        let mut w = SegmentWriter::new(&backend, 5, 64);
        for i in 0..200u32 {
            let term = format!("0word{:04}", i);
            w.append_term(term.as_bytes()).unwrap();
            w.append_entry(7, &[8, 8], false).unwrap();
        }
        let (pgno_last, _) = w.finish().unwrap();
        let height = build_btree(&backend, 5, 1, pgno_last, 64).unwrap();
        assert!(height >= 3);
        // Each interior level below the root exists; nothing above it.
        for h in 1..height {
            assert!(backend.data_read(interior_id(5, h, 1)).unwrap().is_some());
        }
        assert!(backend.data_read(interior_id(5, height, 1)).unwrap().is_none());
    }

    #[test]
    fn test_btree_single_page() {
        let backend = MemBackend::new();
        let mut w = SegmentWriter::new(&backend, 5, 1000);
        for i in 0..4u32 {
            let term = format!("0word{}", i);
            w.append_term(term.as_bytes()).unwrap();
            w.append_entry(7, &[8, 8], false).unwrap();
        }
        let (pgno_last, _) = w.finish().unwrap();
        assert_eq!(pgno_last, 1);
        // Single leaf, no idx rows: height stays 1.
        assert_eq!(build_btree(&backend, 5, 1, pgno_last, 1000).unwrap(), 1);
    }
}
