use crate::core::config::IndexConfig;
use crate::core::error::{Error, Result};
use crate::core::types::{Position, Rowid};
use crate::compression::poslist::PoslistReader;
use crate::index::cache::{LeafCache, PageReader, DEFAULT_CACHE_PAGES};
use crate::index::doclist::DoclistReader;
use crate::index::merge::MergeCtx;
use crate::index::pending::{term_key, PendingIndex};
use crate::index::prefix::{prefix_upper_bound, PrefixAccumulator};
use crate::index::record::{leaf_id, Averages, AVERAGES_ID, STRUCTURE_ID};
use crate::index::segment_iter::{MemIter, SegmentIter};
use crate::index::segment_writer::{build_btree, SegmentWriter};
use crate::index::structure::{Level, SegmentInfo, Structure};
use crate::index::multi_iter::{MultiIter, SubIter};
use crate::storage::backend::StorageBackend;

/// Entry hash folded into the index checksum: XOR of this value over
/// every `(rowid, col, pos, idx, term)` posting equals the checksum
/// computed from the content table by re-tokenizing every row.
pub fn entry_cksum(rowid: Rowid, col: u32, pos: u32, idx: usize, term: &[u8]) -> u64 {
    let mut h = rowid as u64;
    h = h.wrapping_mul(9).wrapping_add(col as u64);
    h = h.wrapping_mul(9).wrapping_add(pos as u64);
    h = h.wrapping_mul(9).wrapping_add(b'0' as u64 + idx as u64);
    for &b in term {
        h = h.wrapping_mul(9).wrapping_add(b as u64);
    }
    h
}

/// Byte length of the first `n` characters of `token`, or None when the
/// token is shorter than `n` characters.
pub fn char_prefix_len(token: &str, n: usize) -> Option<usize> {
    let mut count = 0;
    for (i, _) in token.char_indices() {
        if count == n {
            return Some(i);
        }
        count += 1;
    }
    if count >= n { Some(token.len()) } else { None }
}

/// The inverted index: on-disk segments described by the structure
/// record, plus the in-memory pending postings, behind one query and
/// write surface.
pub struct FtsIndex {
    backend: Box<dyn StorageBackend>,
    pub structure: Structure,
    pending: PendingIndex,
    cache: LeafCache,
    write_rowid: Rowid,
    have_write: bool,
}

impl FtsIndex {
    /// Initialize index records on a fresh backend.
    pub fn create(backend: Box<dyn StorageBackend>, config: &IndexConfig) -> Result<FtsIndex> {
        let mut index = FtsIndex {
            backend,
            structure: Structure::default(),
            pending: PendingIndex::new(),
            cache: LeafCache::new(DEFAULT_CACHE_PAGES),
            write_rowid: 0,
            have_write: false,
        };
        index.structure.cookie = config.cookie;
        index.write_structure(config)?;
        index
            .backend
            .data_write(AVERAGES_ID, &Averages::new(config.column_count()).encode())?;
        Ok(index)
    }

    /// Open an existing index, checking the configuration cookie.
    pub fn open(backend: Box<dyn StorageBackend>, config: &IndexConfig) -> Result<FtsIndex> {
        let record = backend
            .data_read(STRUCTURE_ID)?
            .ok_or_else(|| Error::corrupt("structure record missing"))?;
        let structure = Structure::decode(&record)?;
        if structure.cookie != config.cookie {
            return Err(Error::corrupt("configuration cookie mismatch"));
        }
        Ok(FtsIndex {
            backend,
            structure,
            pending: PendingIndex::new(),
            cache: LeafCache::new(DEFAULT_CACHE_PAGES),
            write_rowid: 0,
            have_write: false,
        })
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    pub fn reader(&self) -> PageReader<'_> {
        PageReader {
            backend: self.backend.as_ref(),
            cache: &self.cache,
        }
    }

    fn merge_ctx<'a>(&'a self, config: &IndexConfig) -> MergeCtx<'a> {
        MergeCtx {
            backend: self.backend.as_ref(),
            cache: &self.cache,
            page_size: config.page_size,
            automerge: config.automerge,
            crisis_merge: config.crisis_merge,
        }
    }

    /// Segments youngest-data-first: level 0 downward, and newest first
    /// within a level. This is the order sub-iterators are created in,
    /// which is what makes youngest-wins duplicate collapsing correct.
    fn segments_youngest_first(&self) -> Vec<SegmentInfo> {
        let mut out = Vec::with_capacity(self.structure.n_segments());
        for level in &self.structure.levels {
            for seg in level.segments.iter().rev() {
                out.push(seg.clone());
            }
        }
        out
    }

    /// Declare the row about to be written. Flushes first when the
    /// rowid is non-monotone or the pending hash exceeds its budget.
    pub fn begin_row(&mut self, config: &IndexConfig, rowid: Rowid) -> Result<()> {
        if (self.have_write && rowid <= self.write_rowid)
            || self.pending.n_bytes() >= config.hash_size
        {
            self.flush(config)?;
        }
        self.write_rowid = rowid;
        self.have_write = true;
        Ok(())
    }

    /// Add one token occurrence to the main index and every prefix
    /// index wide enough to cover it.
    pub fn write_token(
        &mut self,
        config: &IndexConfig,
        rowid: Rowid,
        col: u32,
        off: u32,
        token: &str,
    ) {
        let bytes = token.as_bytes();
        let pos = Position::new(col, off);
        self.pending.write(&term_key(0, bytes), rowid, pos);
        for (i, &n_chars) in config.prefixes.iter().enumerate() {
            if let Some(n_bytes) = char_prefix_len(token, n_chars) {
                self.pending.write(&term_key(i + 1, &bytes[..n_bytes]), rowid, pos);
            }
        }
    }

    /// Add delete markers for one token of a removed row.
    pub fn delete_token(&mut self, config: &IndexConfig, rowid: Rowid, token: &str) {
        let bytes = token.as_bytes();
        self.pending.write_delete(&term_key(0, bytes), rowid);
        for (i, &n_chars) in config.prefixes.iter().enumerate() {
            if let Some(n_bytes) = char_prefix_len(token, n_chars) {
                self.pending.write_delete(&term_key(i + 1, &bytes[..n_bytes]), rowid);
            }
        }
    }

    /// Serialize the pending hash as a new level-0 segment, then apply
    /// the automerge quanta and the crisis threshold.
    pub fn flush(&mut self, config: &IndexConfig) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let ctx = self.merge_ctx(config);
        let mut s = self.structure.clone();
        let segid = ctx.alloc_segid(&s)?;
        let mut writer = SegmentWriter::new(self.backend.as_ref(), segid, config.page_size);
        for (key, doclist) in self.pending.scan() {
            writer.append_term(&key)?;
            let mut r = DoclistReader::new(&doclist);
            while r.next() {
                writer.append_entry(r.rowid, r.poslist(), r.b_del)?;
            }
        }
        let (pgno_last, n_leaf) = writer.finish()?;
        if n_leaf > 0 {
            let height =
                build_btree(self.backend.as_ref(), segid, 1, pgno_last, config.page_size)?;
            if s.levels.is_empty() {
                s.levels.push(Level::default());
            }
            s.levels[0].segments.push(SegmentInfo {
                segid,
                height,
                pgno_first: 1,
                pgno_last,
            });
        }
        let ctx = self.merge_ctx(config);
        ctx.automerge(&mut s, n_leaf as u64)?;
        ctx.crisis_merge(&mut s)?;
        self.structure = s;
        self.write_structure(config)?;
        self.pending.clear();
        self.have_write = false;
        self.cache.clear();
        Ok(())
    }

    /// Discard uncommitted state and reload the structure record; the
    /// host may have reverted bytes underneath us.
    pub fn rollback(&mut self, config: &IndexConfig) -> Result<()> {
        self.pending.clear();
        self.have_write = false;
        self.cache.clear();
        let record = self
            .backend
            .data_read(STRUCTURE_ID)?
            .ok_or_else(|| Error::corrupt("structure record missing"))?;
        self.structure = Structure::decode(&record)?;
        if self.structure.cookie != config.cookie {
            return Err(Error::corrupt("configuration cookie mismatch"));
        }
        Ok(())
    }

    pub fn write_structure(&mut self, config: &IndexConfig) -> Result<()> {
        self.structure.cookie = config.cookie;
        self.backend
            .data_write(STRUCTURE_ID, &self.structure.encode())
    }

    /// Iterator over one term's doclist (index `idx`, 0 = main),
    /// merging every segment with the pending hash.
    pub fn query_term(&self, idx: usize, term: &[u8], reverse: bool) -> Result<MultiIter<'_>> {
        let key = term_key(idx, term);
        let mut subs = Vec::new();
        if let Some(doclist) = self.pending.doclist_for(&key) {
            let mut mem = MemIter::single(key.clone(), doclist)?;
            if reverse {
                mem.reverse_init()?;
            }
            subs.push(SubIter::Mem(mem));
        }
        let reader = self.reader();
        for seg in self.segments_youngest_first() {
            let mut si = SegmentIter::seek(reader, &seg, &key, false, true)?;
            if reverse {
                si.reverse_init()?;
            }
            subs.push(SubIter::Seg(si));
        }
        MultiIter::new(subs, reverse, true)
    }

    /// Full-index scan in `(term, rowid)` order, pending included.
    pub fn scan_all(&self, skip_empty: bool) -> Result<MultiIter<'_>> {
        let mut subs = vec![SubIter::Mem(MemIter::new(self.pending.scan())?)];
        let reader = self.reader();
        for seg in self.segments_youngest_first() {
            subs.push(SubIter::Seg(SegmentIter::scan(reader, &seg)?));
        }
        MultiIter::new(subs, false, skip_empty)
    }

    /// Scan starting at the first term >= `key`.
    pub fn scan_from(&self, key: &[u8], hi: Option<&[u8]>) -> Result<MultiIter<'_>> {
        let upper = match hi {
            Some(h) => h.to_vec(),
            None => vec![0xff; 1 + key.len() + 8],
        };
        let mut subs = vec![SubIter::Mem(MemIter::new(
            self.pending.scan_range(key, &upper),
        )?)];
        let reader = self.reader();
        for seg in self.segments_youngest_first() {
            subs.push(SubIter::Seg(SegmentIter::seek(reader, &seg, key, true, false)?));
        }
        MultiIter::new(subs, false, true)
    }

    /// Materialize the merged doclist of every main-index term starting
    /// with `token`, via the bucketized accumulator. This is the path
    /// taken when no prefix index covers the query.
    pub fn prefix_doclist_scan(&self, token: &[u8]) -> Result<Vec<u8>> {
        let lo = term_key(0, token);
        let hi = prefix_upper_bound(&lo)
            .unwrap_or_else(|| vec![0xff; lo.len() + 9]);
        let mut iter = self.scan_from(&lo, Some(&hi))?;
        let mut acc = PrefixAccumulator::new();
        let mut pos_buf = Vec::new();
        while !iter.eof() && iter.term().starts_with(&lo) {
            pos_buf.clear();
            iter.poslist(&mut pos_buf)?;
            acc.push(iter.rowid(), &pos_buf);
            iter.advance()?;
        }
        Ok(acc.finish())
    }

    /// Materialize one term's (or prefix-index term's) doclist through
    /// the regular merge path. Used to feed phrase evaluation.
    pub fn term_doclist(&self, idx: usize, term: &[u8]) -> Result<Vec<u8>> {
        let mut iter = self.query_term(idx, term, false)?;
        let mut acc = PrefixAccumulator::new();
        let mut pos_buf = Vec::new();
        while !iter.eof() {
            pos_buf.clear();
            iter.poslist(&mut pos_buf)?;
            acc.push(iter.rowid(), &pos_buf);
            iter.advance()?;
        }
        Ok(acc.finish())
    }

    /// Doclist for a prefix query: the dedicated prefix index when one
    /// matches the token's character count, otherwise a term-range scan.
    pub fn prefix_doclist(&self, config: &IndexConfig, token: &str) -> Result<Vec<u8>> {
        let n_chars = token.chars().count();
        match config.prefix_index_for(n_chars) {
            Some(idx) => self.term_doclist(idx, token.as_bytes()),
            None => self.prefix_doclist_scan(token.as_bytes()),
        }
    }

    /// Merge every segment into one. Content is unchanged.
    pub fn optimize(&mut self, config: &IndexConfig) -> Result<()> {
        self.flush(config)?;
        let ctx = self.merge_ctx(config);
        let mut s = self.structure.clone();
        ctx.optimize(&mut s)?;
        self.structure = s;
        self.write_structure(config)
    }

    /// Drop every index record and reset the structure.
    pub fn delete_all(&mut self, config: &IndexConfig) -> Result<()> {
        for segid in self.structure.segids() {
            let ctx = self.merge_ctx(config);
            ctx.remove_segment(segid)?;
        }
        self.pending.clear();
        self.have_write = false;
        self.structure = Structure::default();
        self.write_structure(config)?;
        self.cache.clear();
        Ok(())
    }

    /// XOR checksum over every surviving posting in every index.
    pub fn checksum(&self) -> Result<u64> {
        let mut iter = self.scan_all(true)?;
        let mut cksum = 0u64;
        let mut pos_buf = Vec::new();
        while !iter.eof() {
            let key = iter.term();
            if key.is_empty() {
                return Err(Error::corrupt("empty term key"));
            }
            let idx = (key[0] - b'0') as usize;
            let term = key[1..].to_vec();
            let rowid = iter.rowid();
            pos_buf.clear();
            iter.poslist(&mut pos_buf)?;
            for p in PoslistReader::new(&pos_buf) {
                cksum ^= entry_cksum(rowid, p.col(), p.offset(), idx, &term);
            }
            iter.advance()?;
        }
        Ok(cksum)
    }

    /// Verify structure invariants, per-segment ordering, idx-table and
    /// b-tree consistency, and the checksum equation against
    /// `expected_cksum` (computed by the caller from stored content).
    pub fn integrity_check(&self, expected_cksum: u64) -> Result<()> {
        self.structure.validate()?;
        if self.checksum()? != expected_cksum {
            return Err(Error::corrupt("index/content checksum mismatch"));
        }
        let reader = self.reader();
        for seg in self.structure.all_segments() {
            self.check_segment(&reader, seg)?;
        }
        Ok(())
    }

    fn check_segment(&self, reader: &PageReader<'_>, seg: &SegmentInfo) -> Result<()> {
        if seg.pgno_last < seg.pgno_first {
            return Ok(()); // fully consumed merge input
        }
        // Terms strictly ascending; rowids strictly ascending per term.
        let mut iter = SegmentIter::scan(*reader, seg)?;
        let mut prev_term: Option<Vec<u8>> = None;
        let mut prev_rowid = 0;
        while !iter.eof {
            let new_term = match &prev_term {
                Some(t) => iter.term.as_slice() != t.as_slice(),
                None => true,
            };
            if new_term {
                if let Some(t) = &prev_term {
                    if iter.term.as_slice() <= t.as_slice() {
                        return Err(Error::corrupt("terms out of order in segment"));
                    }
                }
                prev_term = Some(iter.term.clone());
            } else if iter.rowid <= prev_rowid {
                return Err(Error::corrupt("rowids out of order in doclist"));
            }
            prev_rowid = iter.rowid;
            iter.next()?;
        }

        // Every idx row names a real leaf whose first term it bounds.
        let rows = self.backend.idx_scan(seg.segid)?;
        for (sep, value) in &rows {
            let pgno = (*value >> 1) as u32;
            if pgno < seg.pgno_first || pgno > seg.pgno_last {
                return Err(Error::corrupt("idx row points outside segment"));
            }
            let page = reader.read(leaf_id(seg.segid, pgno))?;
            let t_off = page.first_term_off();
            if t_off == 0 {
                return Err(Error::corrupt("idx row points at termless leaf"));
            }
            let (n_term, n) = crate::compression::varint::get_varint(&page.data[t_off..]);
            let start = t_off + n;
            let end = start + n_term as usize;
            if end > page.n {
                return Err(Error::corrupt("leaf first term truncated"));
            }
            if sep.as_slice() > &page.data[start..end] {
                return Err(Error::corrupt("idx separator exceeds leaf first term"));
            }
            if *value & 1 != 0 {
                let dlidx = self
                    .backend
                    .data_read(crate::index::record::dlidx_id(seg.segid, 0, pgno))?;
                if dlidx.is_none() {
                    return Err(Error::corrupt("idx dlidx flag without dlidx pages"));
                }
            }
        }

        // Interior pages exist only for whole (untrimmed) segments.
        if seg.height > 1 && seg.pgno_first == 1 {
            self.check_btree(seg, &rows)?;
        }
        Ok(())
    }

    /// In-order traversal of the interior b-tree must reproduce the idx
    /// separators exactly, and height-1 nodes must cover every leaf.
    fn check_btree(&self, seg: &SegmentInfo, rows: &[(Vec<u8>, i64)]) -> Result<()> {
        let mut separators = Vec::new();
        self.collect_separators(seg, seg.height - 1, 1, &mut separators)?;
        if separators.len() != rows.len() {
            return Err(Error::corrupt("b-tree separator count mismatch"));
        }
        for (sep, (row_term, _)) in separators.iter().zip(rows.iter()) {
            if sep != row_term {
                return Err(Error::corrupt("b-tree separator disagrees with idx row"));
            }
        }
        // Leaf coverage from height-1 nodes.
        let mut covered = 0u64;
        let mut pgno = 1u32;
        loop {
            let id = crate::index::record::interior_id(seg.segid, 1, pgno);
            let Some(record) = self.backend.data_read(id)? else {
                break;
            };
            let (_, items) = crate::index::decode::parse_interior(&record)?;
            covered += 1; // leftmost child
            for item in &items {
                match item {
                    crate::index::decode::InteriorItem::Term(_) => covered += 1,
                    crate::index::decode::InteriorItem::NoTerm { n_empty, .. } => {
                        covered += n_empty
                    }
                }
            }
            pgno += 1;
        }
        if covered != (seg.pgno_last - seg.pgno_first + 1) as u64 {
            return Err(Error::corrupt("b-tree leaf coverage mismatch"));
        }
        Ok(())
    }

    fn collect_separators(
        &self,
        seg: &SegmentInfo,
        level: u8,
        pgno: u32,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<()> {
        let id = crate::index::record::interior_id(seg.segid, level, pgno);
        let record = self
            .backend
            .data_read(id)?
            .ok_or_else(|| Error::corrupt("interior page missing"))?;
        let (leftmost, items) = crate::index::decode::parse_interior(&record)?;
        if level == 1 {
            for item in items {
                if let crate::index::decode::InteriorItem::Term(t) = item {
                    out.push(t);
                }
            }
            return Ok(());
        }
        let mut child = leftmost;
        self.collect_separators(seg, level - 1, child, out)?;
        for item in items {
            if let crate::index::decode::InteriorItem::Term(t) = item {
                out.push(t);
                child += 1;
                self.collect_separators(seg, level - 1, child, out)?;
            }
        }
        Ok(())
    }
}
