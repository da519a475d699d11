use crate::compression::varint::get_varint;
use crate::core::error::{Error, Result};
use crate::core::types::Rowid;
use crate::index::cache::PageReader;
use crate::index::dlidx::DlidxIter;
use crate::index::record::{leaf_id, PageBuf, LEAF_HDR};
use crate::index::structure::SegmentInfo;
use crate::storage::backend::StorageBackend;
use std::sync::Arc;

/// Collect `n_pos` poslist bytes beginning at `(pgno, off)`, stitching
/// together the leaf spans of a doclist that crosses pages.
pub fn read_poslist(
    reader: &PageReader<'_>,
    segid: u16,
    pgno_last: u32,
    mut pgno: u32,
    mut off: usize,
    n_pos: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    let mut rem = n_pos;
    while rem > 0 {
        let page = reader.read(leaf_id(segid, pgno))?;
        let avail = page.n.saturating_sub(off);
        let take = avail.min(rem);
        out.extend_from_slice(&page.data[off..off + take]);
        rem -= take;
        if rem > 0 {
            pgno += 1;
            if pgno > pgno_last {
                return Err(Error::corrupt("poslist runs past final leaf"));
            }
            off = LEAF_HDR;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct RevEntry {
    rowid: Rowid,
    n_pos: usize,
    b_del: bool,
    pos_pgno: u32,
    pos_off: usize,
}

struct RevState {
    entries: Vec<RevEntry>,
    i: usize,
    page: u32,
}

/// Cursor over one segment's leaves.
///
/// Walks `(term, rowid, poslist)` groups in term-then-rowid order, or in
/// descending rowid order over a single term's doclist after a seek
/// (`REVERSE` is only ever combined with `ONETERM`). A trimmed segment
/// starts at `pgno_first > 1`; seeks clamp to it.
pub struct SegmentIter<'a> {
    reader: PageReader<'a>,
    pub segid: u16,
    pgno_first: u32,
    pgno_last: u32,
    pub one_term: bool,
    pub reverse: bool,

    page: Arc<PageBuf>,
    pgno: u32,
    off: usize,
    expecting_term: bool,
    term_starts_page: bool,

    pub term: Vec<u8>,
    pub rowid: Rowid,
    pub n_pos: usize,
    pub b_del: bool,
    pos_pgno: u32,
    pos_off: usize,
    pub eof: bool,

    /// Leaf and offset where the current term's doclist begins.
    pub term_leaf_pgno: u32,
    pub term_doclist_off: usize,

    dlidx: Option<DlidxIter>,
    dlidx_checked: bool,
    /// From the idx row used by the seek: the flag applies when the
    /// found term is the first term of the row's leaf.
    dlidx_hint: Option<bool>,

    rev: Option<RevState>,
}

impl<'a> SegmentIter<'a> {
    fn empty(reader: PageReader<'a>, seg: &SegmentInfo) -> SegmentIter<'a> {
        SegmentIter {
            reader,
            segid: seg.segid,
            pgno_first: seg.pgno_first,
            pgno_last: seg.pgno_last,
            one_term: false,
            reverse: false,
            page: PageBuf::from_record(Vec::new()),
            pgno: seg.pgno_first,
            off: 0,
            expecting_term: true,
            term_starts_page: false,
            term: Vec::new(),
            rowid: 0,
            n_pos: 0,
            b_del: false,
            pos_pgno: seg.pgno_first,
            pos_off: 0,
            eof: true,
            term_leaf_pgno: seg.pgno_first,
            term_doclist_off: 0,
            dlidx: None,
            dlidx_checked: false,
            dlidx_hint: None,
            rev: None,
        }
    }

    /// Position at the first term of the segment.
    pub fn scan(reader: PageReader<'a>, seg: &SegmentInfo) -> Result<SegmentIter<'a>> {
        let mut iter = Self::empty(reader, seg);
        if seg.pgno_last < seg.pgno_first {
            return Ok(iter);
        }
        iter.eof = false;
        iter.load_page(seg.pgno_first)?;
        let off = iter.page.first_term_off();
        if off == 0 {
            return Err(Error::corrupt("segment first leaf carries no term"));
        }
        iter.off = off;
        iter.expecting_term = true;
        iter.parse_next()?;
        Ok(iter)
    }

    /// Position at `key` (or, with `ge`, at the first term >= `key`).
    /// The idx helper table locates the starting leaf; the walk from
    /// there is linear.
    pub fn seek(
        reader: PageReader<'a>,
        seg: &SegmentInfo,
        key: &[u8],
        ge: bool,
        one_term: bool,
    ) -> Result<SegmentIter<'a>> {
        let mut iter = Self::empty(reader, seg);
        if seg.pgno_last < seg.pgno_first {
            return Ok(iter);
        }
        let row = reader.backend.idx_seek(seg.segid, key)?;
        let mut row_leaf = None;
        let mut start = seg.pgno_first;
        if let Some((_, value)) = &row {
            let pgno = (*value >> 1) as u32;
            if pgno > seg.pgno_first {
                start = pgno;
                row_leaf = Some((pgno, *value & 1 != 0));
            }
        }

        iter.eof = false;
        iter.load_page(start)?;
        let off = iter.page.first_term_off();
        if off == 0 {
            return Err(Error::corrupt("seek leaf carries no term"));
        }
        iter.off = off;
        iter.expecting_term = true;
        iter.parse_next()?;

        while !iter.eof && iter.term.as_slice() < key {
            iter.next()?;
        }
        iter.one_term = one_term;
        if iter.eof || (!ge && iter.term.as_slice() != key) {
            iter.eof = true;
            return Ok(iter);
        }
        if let Some((pgno, flag)) = row_leaf {
            if iter.term_leaf_pgno == pgno && iter.term_starts_page {
                iter.dlidx_hint = Some(flag);
            }
        }
        Ok(iter)
    }

    fn load_page(&mut self, pgno: u32) -> Result<()> {
        self.page = self.reader.read(leaf_id(self.segid, pgno))?;
        self.pgno = pgno;
        Ok(())
    }

    fn advance_page(&mut self) -> Result<bool> {
        if self.pgno >= self.pgno_last {
            self.eof = true;
            return Ok(false);
        }
        let next = self.pgno + 1;
        self.load_page(next)?;
        self.off = LEAF_HDR;
        Ok(true)
    }

    /// Advance to the next `(term, rowid)` group in forward order.
    /// Returns true when the group starts a new term.
    pub fn next(&mut self) -> Result<bool> {
        debug_assert!(!self.reverse);
        if self.eof {
            return Ok(false);
        }
        // Step over the current poslist, following spill pages.
        if self.pgno != self.pos_pgno {
            self.load_page(self.pos_pgno)?;
        }
        self.off = self.pos_off + self.n_pos;
        while self.off > self.page.n {
            let excess = self.off - self.page.n;
            if !self.advance_page()? {
                return Ok(false);
            }
            self.off = LEAF_HDR + excess;
        }
        self.parse_next()
    }

    /// Parse the next structural item at `(pgno, off)`.
    fn parse_next(&mut self) -> Result<bool> {
        loop {
            if self.off >= self.page.n {
                if !self.advance_page()? {
                    return Ok(false);
                }
                continue;
            }

            if !self.expecting_term {
                if self.off == self.page.first_rowid_off() {
                    // First rowid on the page: stored absolute.
                    let (v, n) = get_varint(&self.page.data[self.off..]);
                    self.off += n;
                    self.rowid = v as Rowid;
                    self.read_size_and_poslist();
                    return Ok(false);
                }
                if self.page.data[self.off] == 0 {
                    // Doclist terminator.
                    self.off += 1;
                    if self.one_term {
                        self.eof = true;
                        return Ok(false);
                    }
                    self.expecting_term = true;
                    continue;
                }
                let (delta, n) = get_varint(&self.page.data[self.off..]);
                self.off += n;
                self.rowid = self.rowid.wrapping_add(delta as Rowid);
                self.read_size_and_poslist();
                return Ok(false);
            }

            // A term entry: uncompressed when it is the page's first.
            if self.off == self.page.first_term_off() {
                let (n_term, n) = get_varint(&self.page.data[self.off..]);
                self.off += n;
                let n_term = n_term as usize;
                if self.off + n_term > self.page.n {
                    return Err(Error::corrupt("term image runs off leaf"));
                }
                self.term.clear();
                self.term
                    .extend_from_slice(&self.page.data[self.off..self.off + n_term]);
                self.off += n_term;
                self.term_starts_page = true;
            } else {
                let (n_prefix, n) = get_varint(&self.page.data[self.off..]);
                self.off += n;
                let (n_suffix, n) = get_varint(&self.page.data[self.off..]);
                self.off += n;
                let (n_prefix, n_suffix) = (n_prefix as usize, n_suffix as usize);
                if n_prefix > self.term.len() || self.off + n_suffix > self.page.n {
                    return Err(Error::corrupt("bad term prefix compression"));
                }
                self.term.truncate(n_prefix);
                self.term
                    .extend_from_slice(&self.page.data[self.off..self.off + n_suffix]);
                self.off += n_suffix;
                self.term_starts_page = false;
            }
            self.expecting_term = false;
            self.term_leaf_pgno = self.pgno;
            self.term_doclist_off = self.off;
            self.dlidx = None;
            self.dlidx_checked = false;
            self.dlidx_hint = None;

            // First rowid of the doclist: absolute.
            let (v, n) = get_varint(&self.page.data[self.off..]);
            self.off += n;
            self.rowid = v as Rowid;
            self.read_size_and_poslist();
            return Ok(true);
        }
    }

    fn read_size_and_poslist(&mut self) {
        let (v, n) = get_varint(&self.page.data[self.off..]);
        self.off += n;
        self.n_pos = (v >> 1) as usize;
        self.b_del = v & 1 != 0;
        self.pos_pgno = self.pgno;
        self.pos_off = self.off;
    }

    /// Copy the current entry's poslist, following spill pages.
    pub fn poslist(&self, out: &mut Vec<u8>) -> Result<()> {
        read_poslist(
            &self.reader,
            self.segid,
            self.pgno_last,
            self.pos_pgno,
            self.pos_off,
            self.n_pos,
            out,
        )
    }

    fn ensure_dlidx(&mut self) -> Result<()> {
        if self.dlidx_checked {
            return Ok(());
        }
        self.dlidx_checked = true;
        if self.dlidx_hint == Some(false) {
            return Ok(());
        }
        self.dlidx = DlidxIter::probe(&self.reader, self.segid, self.term_leaf_pgno)?;
        Ok(())
    }

    /// Skip to the first entry at or past `target` in iteration order,
    /// using the doclist-index to jump over whole leaves where one
    /// exists.
    pub fn next_from(&mut self, target: Rowid) -> Result<()> {
        if self.reverse {
            // The reverse walk is bounded by one doclist; step linearly.
            while !self.eof && self.rowid > target {
                self.advance()?;
            }
            return Ok(());
        }
        if self.eof || self.rowid >= target {
            return Ok(());
        }
        self.ensure_dlidx()?;
        if let Some(dl) = self.dlidx.as_ref() {
            let (leaf, first_rowid) = dl.seek(&self.reader, target)?;
            if leaf > self.pgno {
                self.load_page(leaf)?;
                let off = self.page.first_rowid_off();
                if off == 0 {
                    return Err(Error::corrupt("dlidx points at rowid-less leaf"));
                }
                self.off = off;
                let (v, n) = get_varint(&self.page.data[self.off..]);
                self.off += n;
                self.rowid = v as Rowid;
                if self.rowid != first_rowid {
                    return Err(Error::corrupt("dlidx rowid disagrees with leaf"));
                }
                self.read_size_and_poslist();
            }
        }
        while !self.eof && self.rowid < target {
            self.next()?;
        }
        Ok(())
    }

    /// Switch the (ONETERM) iterator to descending rowid order. Scans
    /// forward to the last leaf of the doclist, then records each rowid
    /// offset on the current page to support backward stepping.
    pub fn reverse_init(&mut self) -> Result<()> {
        debug_assert!(self.one_term);
        self.reverse = true;
        if self.eof {
            return Ok(());
        }
        self.ensure_dlidx()?;
        let last_page = match self.dlidx.as_ref() {
            Some(dl) => dl.last_leaf(&self.reader)?.0,
            None => {
                // Without a dlidx the doclist spans only a handful of
                // leaves; scan it forward to its terminator.
                self.probe_last_leaf()?
            }
        };

        let mut page = last_page;
        loop {
            let entries = self.page_entries(page)?;
            if !entries.is_empty() {
                let i = entries.len() - 1;
                self.apply_rev_entry(&entries[i]);
                self.rev = Some(RevState { entries, i, page });
                return Ok(());
            }
            if page <= self.term_leaf_pgno {
                self.eof = true;
                return Ok(());
            }
            page -= 1;
        }
    }

    /// Walk the current doclist from the current entry to its
    /// terminator, returning the leaf holding its last rowid. Entry
    /// values are skipped, not decoded.
    fn probe_last_leaf(&self) -> Result<u32> {
        let mut pgno = self.pos_pgno;
        let mut off = self.pos_off + self.n_pos;
        let mut last = self.pos_pgno;
        let mut page = self.reader.read(leaf_id(self.segid, pgno))?;
        loop {
            while off > page.n {
                if pgno >= self.pgno_last {
                    return Ok(last);
                }
                off = LEAF_HDR + (off - page.n);
                pgno += 1;
                page = self.reader.read(leaf_id(self.segid, pgno))?;
            }
            if off >= page.n {
                if pgno >= self.pgno_last {
                    return Ok(last);
                }
                pgno += 1;
                off = LEAF_HDR;
                page = self.reader.read(leaf_id(self.segid, pgno))?;
                continue;
            }
            if off != page.first_rowid_off() && page.data[off] == 0 {
                return Ok(last); // doclist terminator
            }
            let (_, n) = get_varint(&page.data[off..]);
            off += n;
            last = pgno;
            let (sz, n) = get_varint(&page.data[off..]);
            off += n;
            off += (sz >> 1) as usize;
        }
    }

    /// Decode the entries of the current doclist residing on `pgno`.
    fn page_entries(&self, pgno: u32) -> Result<Vec<RevEntry>> {
        let page = self.reader.read(leaf_id(self.segid, pgno))?;
        let mut out = Vec::new();
        let mut off;
        if pgno == self.term_leaf_pgno {
            off = self.term_doclist_off;
        } else {
            off = page.first_rowid_off();
            if off == 0 {
                return Ok(out);
            }
        }
        let mut rowid = 0i64;
        let mut first = true;
        while off < page.n {
            if !first && page.data[off] == 0 {
                break;
            }
            let (v, n) = get_varint(&page.data[off..]);
            off += n;
            rowid = if first {
                v as Rowid
            } else {
                rowid.wrapping_add(v as Rowid)
            };
            first = false;
            let (sz, n) = get_varint(&page.data[off..]);
            off += n;
            let n_pos = (sz >> 1) as usize;
            out.push(RevEntry {
                rowid,
                n_pos,
                b_del: sz & 1 != 0,
                pos_pgno: pgno,
                pos_off: off,
            });
            // A spilling poslist ends this page's run of entries.
            off += n_pos;
        }
        Ok(out)
    }

    fn apply_rev_entry(&mut self, e: &RevEntry) {
        self.rowid = e.rowid;
        self.n_pos = e.n_pos;
        self.b_del = e.b_del;
        self.pos_pgno = e.pos_pgno;
        self.pos_off = e.pos_off;
    }

    /// Step once in the iterator's direction.
    pub fn advance(&mut self) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        if !self.reverse {
            self.next()?;
            return Ok(());
        }
        let Some(rev) = self.rev.as_mut() else {
            self.eof = true;
            return Ok(());
        };
        if rev.i > 0 {
            rev.i -= 1;
            let e = rev.entries[rev.i];
            self.apply_rev_entry(&e);
            return Ok(());
        }
        // Exhausted this page: move to the previous leaf of the doclist.
        let mut page = rev.page;
        loop {
            if page <= self.term_leaf_pgno {
                self.eof = true;
                self.rev = None;
                return Ok(());
            }
            page -= 1;
            let entries = self.page_entries(page)?;
            if !entries.is_empty() {
                let i = entries.len() - 1;
                self.apply_rev_entry(&entries[i]);
                self.rev = Some(RevState { entries, i, page });
                return Ok(());
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MemEntryPos {
    rowid: Rowid,
    n_pos: usize,
    b_del: bool,
    pos_off: usize,
}

/// Iterator over in-memory `(term, doclist)` pairs, either the pending
/// hash snapshot or a merged prefix doclist, presented with the same shape
/// as a segment cursor so the multi-iterator can treat it uniformly.
pub struct MemIter {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    i: usize,
    d: usize,
    started: bool,
    pub rowid: Rowid,
    pub n_pos: usize,
    pub b_del: bool,
    pos_off: usize,
    pub eof: bool,
    pub reverse: bool,
    rev: Option<(Vec<MemEntryPos>, usize)>,
}

impl MemIter {
    pub fn new(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<MemIter> {
        let mut iter = MemIter {
            entries,
            i: 0,
            d: 0,
            started: false,
            rowid: 0,
            n_pos: 0,
            b_del: false,
            pos_off: 0,
            eof: false,
            reverse: false,
            rev: None,
        };
        if iter.entries.is_empty() {
            iter.eof = true;
        } else {
            iter.step()?;
        }
        Ok(iter)
    }

    /// Single-term iterator over one doclist buffer.
    pub fn single(key: Vec<u8>, doclist: Vec<u8>) -> Result<MemIter> {
        Self::new(vec![(key, doclist)])
    }

    pub fn term(&self) -> &[u8] {
        if self.i >= self.entries.len() {
            return &[];
        }
        &self.entries[self.i].0
    }

    pub fn poslist(&self) -> &[u8] {
        if self.i >= self.entries.len() {
            return &[];
        }
        let data = &self.entries[self.i].1;
        &data[self.pos_off..self.pos_off + self.n_pos]
    }

    fn step(&mut self) -> Result<bool> {
        loop {
            let data = &self.entries[self.i].1;
            if self.d >= data.len() {
                // Doclist exhausted: move to the next term.
                self.i += 1;
                self.d = 0;
                self.started = false;
                if self.i >= self.entries.len() {
                    self.eof = true;
                    return Ok(false);
                }
                continue;
            }
            let (v, n) = get_varint(&data[self.d..]);
            self.d += n;
            self.rowid = if self.started {
                self.rowid.wrapping_add(v as Rowid)
            } else {
                v as Rowid
            };
            let new_term = !self.started;
            self.started = true;
            let (sz, n) = get_varint(&data[self.d..]);
            self.d += n;
            self.n_pos = (sz >> 1) as usize;
            self.b_del = sz & 1 != 0;
            self.pos_off = self.d;
            self.d += self.n_pos;
            return Ok(new_term);
        }
    }

    pub fn advance(&mut self) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        if !self.reverse {
            self.step()?;
            return Ok(());
        }
        let Some((entries, i)) = self.rev.as_mut() else {
            self.eof = true;
            return Ok(());
        };
        if *i == 0 {
            self.eof = true;
            return Ok(());
        }
        *i -= 1;
        let e = entries[*i];
        self.rowid = e.rowid;
        self.n_pos = e.n_pos;
        self.b_del = e.b_del;
        self.pos_off = e.pos_off;
        Ok(())
    }

    /// Flip a single-term iterator to descending rowid order.
    pub fn reverse_init(&mut self) -> Result<()> {
        debug_assert!(self.entries.len() <= 1);
        self.reverse = true;
        if self.eof {
            return Ok(());
        }
        let mut all = vec![MemEntryPos {
            rowid: self.rowid,
            n_pos: self.n_pos,
            b_del: self.b_del,
            pos_off: self.pos_off,
        }];
        while !self.eof {
            self.step()?;
            if self.eof {
                break;
            }
            all.push(MemEntryPos {
                rowid: self.rowid,
                n_pos: self.n_pos,
                b_del: self.b_del,
                pos_off: self.pos_off,
            });
        }
        self.eof = false;
        self.i = 0;
        let i = all.len() - 1;
        let e = all[i];
        self.rowid = e.rowid;
        self.n_pos = e.n_pos;
        self.b_del = e.b_del;
        self.pos_off = e.pos_off;
        self.rev = Some((all, i));
        Ok(())
    }

    pub fn next_from(&mut self, target: Rowid) -> Result<()> {
        if self.reverse {
            while !self.eof && self.rowid > target {
                self.advance()?;
            }
        } else {
            while !self.eof && self.rowid < target {
                self.advance()?;
            }
        }
        Ok(())
    }
}
