use crate::compression::varint::put_varint;
use crate::core::error::{Error, ErrorKind, Result};
use crate::index::cache::{LeafCache, PageReader};
use crate::index::record::{dlidx_id, leaf_id, put_u16, segment_id_range, LEAF_HDR, MAX_SEGMENTS};
use crate::index::segment_iter::SegmentIter;
use crate::index::segment_writer::{build_btree, SegmentWriter};
use crate::index::structure::{Level, SegmentInfo, Structure};
use crate::index::multi_iter::{MultiIter, SubIter};
use crate::storage::backend::StorageBackend;
use rand::Rng;

/// Automerge distributes merge work in quanta of this many output
/// leaves, spreading write amplification across many inserts.
pub const WORK_UNIT: u64 = 64;

/// Merge machinery shared by flush-time triggers and the explicit
/// `optimize` command.
pub struct MergeCtx<'a> {
    pub backend: &'a dyn StorageBackend,
    pub cache: &'a LeafCache,
    pub page_size: usize,
    pub automerge: usize,
    pub crisis_merge: usize,
}

struct TrimPoint {
    segid: u16,
    exhausted: bool,
    term: Vec<u8>,
    leaf_pgno: u32,
    doclist_off: usize,
}

impl<'a> MergeCtx<'a> {
    fn reader(&self) -> PageReader<'a> {
        PageReader {
            backend: self.backend,
            cache: self.cache,
        }
    }

    /// Allocate a previously-unused random 16-bit segment id.
    pub fn alloc_segid(&self, s: &Structure) -> Result<u16> {
        if s.n_segments() >= MAX_SEGMENTS {
            return Err(Error::new(
                ErrorKind::Full,
                "segment count limit reached".to_string(),
            ));
        }
        let used = s.segids();
        let mut rng = rand::thread_rng();
        for _ in 0..128 {
            let segid: u16 = rng.gen_range(1..u16::MAX);
            if !used.contains(&segid) {
                return Ok(segid);
            }
        }
        Err(Error::new(
            ErrorKind::Full,
            "segment id space exhausted".to_string(),
        ))
    }

    pub fn remove_segment(&self, segid: u16) -> Result<()> {
        let (first, last) = segment_id_range(segid);
        self.backend.data_delete_range(first, last)?;
        self.backend.idx_delete_segment(segid)?;
        self.cache.clear();
        Ok(())
    }

    /// Merge the (in-progress subset of the) segments of level `i_lvl`
    /// into a segment at level `i_lvl + 1`, writing at most `n_rem`
    /// output leaves before pausing at a term boundary. Returns the
    /// number of leaves written.
    pub fn merge_level(
        &self,
        s: &mut Structure,
        i_lvl: usize,
        n_rem: Option<u32>,
    ) -> Result<u32> {
        while s.levels.len() < i_lvl + 2 {
            s.levels.push(Level::default());
        }
        if s.levels[i_lvl].segments.is_empty() {
            return Ok(0);
        }
        let continuing = s.levels[i_lvl].n_merge > 0;
        // The newest segment of this level may itself be the unfinished
        // output of the level below's merge; a fresh merge must leave it
        // in place.
        let n_avail = s.levels[i_lvl].segments.len()
            - (i_lvl > 0 && s.levels[i_lvl - 1].n_merge > 0) as usize;
        let n_input = if continuing {
            s.levels[i_lvl].n_merge
        } else {
            n_avail
        };
        if n_input == 0 {
            return Ok(0);
        }
        let inputs: Vec<SegmentInfo> = s.levels[i_lvl].segments[..n_input].to_vec();

        let (out_segid, out_resume_pgno, out_pgno_first) = if continuing {
            let out = s.levels[i_lvl + 1]
                .segments
                .last()
                .ok_or_else(|| Error::corrupt("in-progress merge has no output segment"))?;
            (out.segid, out.pgno_last + 1, out.pgno_first)
        } else {
            (self.alloc_segid(s)?, 1, 1)
        };

        // The output is the oldest segment in the index when nothing
        // older exists beside it; only then may delete markers be
        // dropped instead of propagated.
        let others_same_level = s.levels[i_lvl + 1].segments.len() > continuing as usize;
        let others_below = s.levels[i_lvl + 2..]
            .iter()
            .any(|l| !l.segments.is_empty());
        let b_oldest = !others_same_level && !others_below;

        let reader = self.reader();
        let mut subs = Vec::with_capacity(n_input);
        for seg in inputs.iter().rev() {
            subs.push(SubIter::Seg(SegmentIter::scan(reader, seg)?));
        }
        let mut iter = MultiIter::new(subs, false, false)?;
        let mut writer =
            SegmentWriter::resume(self.backend, out_segid, self.page_size, out_resume_pgno);

        let mut cur_term: Vec<u8> = Vec::new();
        let mut have_term = false;
        let mut term_written = false;
        let mut pos_buf = Vec::new();
        while !iter.eof() {
            let term_changed = !have_term || iter.term() != cur_term.as_slice();
            if term_changed {
                if let Some(limit) = n_rem {
                    if writer.n_leaf_written >= limit {
                        break;
                    }
                }
                cur_term.clear();
                cur_term.extend_from_slice(iter.term());
                have_term = true;
                term_written = false;
            }
            let suppress = iter.n_pos() == 0 && b_oldest;
            if !suppress {
                if !term_written {
                    writer.append_term(&cur_term)?;
                    term_written = true;
                }
                pos_buf.clear();
                iter.poslist(&mut pos_buf)?;
                writer.append_entry(iter.rowid(), &pos_buf, iter.b_del())?;
            }
            iter.advance()?;
        }
        let exhausted = iter.eof();

        // Capture per-input positions before the iterator goes away.
        let mut trims = Vec::new();
        if !exhausted {
            for sub in iter.subs() {
                if let SubIter::Seg(si) = sub {
                    trims.push(TrimPoint {
                        segid: si.segid,
                        exhausted: si.eof,
                        term: si.term.clone(),
                        leaf_pgno: si.term_leaf_pgno,
                        doclist_off: si.term_doclist_off,
                    });
                }
            }
        }
        drop(iter);

        let (pgno_last, n_leaf) = writer.finish()?;
        let wrote_any = pgno_last >= out_pgno_first && (n_leaf > 0 || continuing);

        if exhausted {
            for seg in &inputs {
                self.remove_segment(seg.segid)?;
            }
            s.levels[i_lvl].segments.drain(..n_input);
            s.levels[i_lvl].n_merge = 0;
            if wrote_any {
                let height =
                    build_btree(self.backend, out_segid, out_pgno_first, pgno_last, self.page_size)?;
                if continuing {
                    let out = s.levels[i_lvl + 1].segments.last_mut().unwrap();
                    out.pgno_last = pgno_last.max(out.pgno_last);
                    out.height = height;
                } else {
                    s.levels[i_lvl + 1].segments.push(SegmentInfo {
                        segid: out_segid,
                        height,
                        pgno_first: 1,
                        pgno_last,
                    });
                }
                self.promote(s, i_lvl + 1);
            } else if continuing {
                // Nothing new arrived; the output stands as written.
                self.promote(s, i_lvl + 1);
            }
        } else {
            if continuing {
                let out = s.levels[i_lvl + 1].segments.last_mut().unwrap();
                out.pgno_last = pgno_last.max(out.pgno_last);
            } else {
                s.levels[i_lvl + 1].segments.push(SegmentInfo {
                    segid: out_segid,
                    height: 1,
                    pgno_first: 1,
                    pgno_last,
                });
            }
            s.levels[i_lvl].n_merge = n_input;
            for t in &trims {
                let seg = s.levels[i_lvl]
                    .segments
                    .iter_mut()
                    .find(|seg| seg.segid == t.segid)
                    .ok_or_else(|| Error::corrupt("trim target vanished from level"))?;
                self.trim_segment(seg, t)?;
            }
        }
        self.cache.clear();
        s.validate()?;
        Ok(n_leaf)
    }

    /// Rewrite a partially-consumed input segment so its first leaf
    /// begins at the first unconsumed term, then advance `pgno_first`.
    fn trim_segment(&self, seg: &mut SegmentInfo, t: &TrimPoint) -> Result<()> {
        if t.exhausted {
            // Fully absorbed: free its leaves but keep the segment slot
            // until the merge completes.
            let first = leaf_id(seg.segid, seg.pgno_first);
            let last = leaf_id(seg.segid, seg.pgno_last);
            self.backend.data_delete_range(first, last)?;
            self.backend.idx_delete_upto(seg.segid, seg.pgno_last)?;
            seg.pgno_first = seg.pgno_last + 1;
            return Ok(());
        }
        let page = self.reader().read(leaf_id(seg.segid, t.leaf_pgno))?;
        let mut fresh: Vec<u8> = vec![0; LEAF_HDR];
        put_u16(&mut fresh, 2, LEAF_HDR as u16);
        put_varint(&mut fresh, t.term.len() as u64);
        fresh.extend_from_slice(&t.term);
        let rowid_off = fresh.len() as u16;
        put_u16(&mut fresh, 0, rowid_off);
        if t.doclist_off > page.n {
            return Err(Error::corrupt("trim offset past leaf end"));
        }
        fresh.extend_from_slice(&page.data[t.doclist_off..page.n]);
        self.backend
            .data_write(leaf_id(seg.segid, t.leaf_pgno), &fresh)?;
        self.cache.invalidate(leaf_id(seg.segid, t.leaf_pgno));

        if t.leaf_pgno > seg.pgno_first {
            let first = leaf_id(seg.segid, seg.pgno_first);
            let last = leaf_id(seg.segid, t.leaf_pgno - 1);
            self.backend.data_delete_range(first, last)?;
        }
        self.backend.idx_delete_upto(seg.segid, t.leaf_pgno)?;
        let dlidx = self
            .backend
            .data_read(dlidx_id(seg.segid, 0, t.leaf_pgno))?
            .is_some();
        self.backend.idx_write(
            seg.segid,
            &t.term,
            (t.leaf_pgno as i64) << 1 | dlidx as i64,
        )?;
        seg.pgno_first = t.leaf_pgno;
        Ok(())
    }

    /// Move a freshly completed merge output upward while every newer
    /// level is empty and the segment is no larger than the smallest of
    /// the nearest populated older level. Keeps segment sizes
    /// increasing with level.
    fn promote(&self, s: &mut Structure, i_out: usize) {
        if s.levels[..i_out].iter().any(|l| !l.segments.is_empty()) {
            return;
        }
        if s.levels[i_out].segments.len() != 1 || s.levels[i_out].n_merge > 0 {
            return;
        }
        let Some(j) = (i_out + 1..s.levels.len())
            .find(|&j| !s.levels[j].segments.is_empty())
        else {
            return;
        };
        let size = s.levels[i_out].segments[0].size();
        let max_above = s.levels[j]
            .segments
            .iter()
            .map(|seg| seg.size())
            .max()
            .unwrap_or(0);
        if size <= max_above && s.levels[j].n_merge == 0 {
            let seg = s.levels[i_out].segments.pop().unwrap();
            s.levels[j].segments.push(seg);
        }
    }

    /// Apply up to `n_rem` leaves of merge work, preferring an
    /// in-progress merge, otherwise the level with the most segments
    /// (provided it has at least `n_min`).
    pub fn index_merge(&self, s: &mut Structure, mut n_rem: i64, n_min: usize) -> Result<()> {
        while n_rem > 0 {
            let i_lvl = match s.levels.iter().position(|l| l.n_merge > 0) {
                Some(i) => i,
                None => {
                    let best = s
                        .levels
                        .iter()
                        .enumerate()
                        .max_by_key(|(_, l)| l.segments.len());
                    match best {
                        Some((i, l)) if l.segments.len() >= n_min.max(2) => i,
                        _ => break,
                    }
                }
            };
            let wrote = self.merge_level(s, i_lvl, Some(n_rem.max(1) as u32))?;
            if wrote == 0 {
                break;
            }
            n_rem -= wrote as i64;
        }
        Ok(())
    }

    /// Post-flush incremental merging: one work quantum per `WORK_UNIT`
    /// level-0 leaves ever written, scaled by the level count.
    pub fn automerge(&self, s: &mut Structure, n_leaf: u64) -> Result<()> {
        if self.automerge == 0 || n_leaf == 0 {
            s.write_counter += n_leaf;
            return Ok(());
        }
        let n_work = (s.write_counter + n_leaf) / WORK_UNIT - s.write_counter / WORK_UNIT;
        s.write_counter += n_leaf;
        if n_work > 0 {
            let n_rem = (WORK_UNIT * n_work * s.levels.len().max(1) as u64) as i64;
            self.index_merge(s, n_rem, self.automerge)?;
        }
        Ok(())
    }

    /// Fully merge any level holding `crisis_merge` or more segments.
    /// Bounds the segment count even with automerge disabled.
    pub fn crisis_merge(&self, s: &mut Structure) -> Result<()> {
        loop {
            let Some(i_lvl) = s
                .levels
                .iter()
                .position(|l| l.segments.len() >= self.crisis_merge)
            else {
                return Ok(());
            };
            let before = s.levels[i_lvl].segments.len();
            self.merge_level(s, i_lvl, None)?;
            if s.levels[i_lvl].segments.len() >= before {
                return Ok(());
            }
        }
    }

    /// Merge the entire index into a single segment on a fresh bottom
    /// level. Visible content is unchanged.
    pub fn optimize(&self, s: &mut Structure) -> Result<()> {
        // Finish any in-progress merges first so every segment is whole.
        while let Some(i_lvl) = s.levels.iter().position(|l| l.n_merge > 0) {
            self.merge_level(s, i_lvl, None)?;
        }
        let total = s.n_segments();
        if total <= 1 {
            return Ok(());
        }
        let inputs: Vec<SegmentInfo> = s.all_segments().cloned().collect();
        let out_segid = self.alloc_segid(s)?;
        let reader = self.reader();
        // Youngest data first: levels are already newest-to-oldest;
        // within a level the stored order is oldest first.
        let mut subs = Vec::new();
        for level in &s.levels {
            for seg in level.segments.iter().rev() {
                subs.push(SubIter::Seg(SegmentIter::scan(reader, seg)?));
            }
        }
        let mut iter = MultiIter::new(subs, false, false)?;
        let mut writer = SegmentWriter::new(self.backend, out_segid, self.page_size);
        let mut cur_term: Vec<u8> = Vec::new();
        let mut have_term = false;
        let mut term_written = false;
        let mut pos_buf = Vec::new();
        while !iter.eof() {
            if !have_term || iter.term() != cur_term.as_slice() {
                cur_term.clear();
                cur_term.extend_from_slice(iter.term());
                have_term = true;
                term_written = false;
            }
            if iter.n_pos() > 0 {
                if !term_written {
                    writer.append_term(&cur_term)?;
                    term_written = true;
                }
                pos_buf.clear();
                iter.poslist(&mut pos_buf)?;
                writer.append_entry(iter.rowid(), &pos_buf, false)?;
            }
            iter.advance()?;
        }
        drop(iter);
        let (pgno_last, n_leaf) = writer.finish()?;

        for seg in &inputs {
            self.remove_segment(seg.segid)?;
        }
        let n_levels = s.levels.len();
        s.levels = vec![Level::default(); n_levels];
        if n_leaf > 0 {
            let height = build_btree(self.backend, out_segid, 1, pgno_last, self.page_size)?;
            s.levels.push(Level {
                n_merge: 0,
                segments: vec![SegmentInfo {
                    segid: out_segid,
                    height,
                    pgno_first: 1,
                    pgno_last,
                }],
            });
        }
        self.cache.clear();
        s.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::cache::LeafCache;
    use crate::storage::backend::MemBackend;

    fn ctx<'a>(backend: &'a MemBackend, cache: &'a LeafCache) -> MergeCtx<'a> {
        MergeCtx {
            backend,
            cache,
            page_size: 64,
            automerge: 4,
            crisis_merge: 16,
        }
    }

    fn seg(segid: u16, size: u32) -> SegmentInfo {
        SegmentInfo {
            segid,
            height: 1,
            pgno_first: 1,
            pgno_last: size,
        }
    }

    #[test]
    fn test_alloc_segid_respects_limits() {
        let backend = MemBackend::new();
        let cache = LeafCache::new(4);
        let c = ctx(&backend, &cache);

        let mut s = Structure::default();
        s.levels.push(Level {
            n_merge: 0,
            segments: (1..=MAX_SEGMENTS as u16).map(|id| seg(id, 1)).collect(),
        });
        let err = c.alloc_segid(&s).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Full);

        s.levels[0].segments.pop();
        let id = c.alloc_segid(&s).unwrap();
        assert!(id > 0);
        assert!(!s.segids().contains(&id));
    }

    #[test]
    fn test_promote_moves_sole_small_segment() {
        let backend = MemBackend::new();
        let cache = LeafCache::new(4);
        let c = ctx(&backend, &cache);

        let mut s = Structure {
            cookie: 0,
            write_counter: 0,
            levels: vec![
                Level::default(),
                Level {
                    n_merge: 0,
                    segments: vec![seg(7, 3)],
                },
                Level {
                    n_merge: 0,
                    segments: vec![seg(9, 10)],
                },
            ],
        };
        c.promote(&mut s, 1);
        assert!(s.levels[1].segments.is_empty());
        assert_eq!(s.levels[2].segments.len(), 2);
        // The promoted segment is the youngest of its new level.
        assert_eq!(s.levels[2].segments[1].segid, 7);
        s.validate().unwrap();
    }

    #[test]
    fn test_promote_keeps_oversized_segment() {
        let backend = MemBackend::new();
        let cache = LeafCache::new(4);
        let c = ctx(&backend, &cache);

        let mut s = Structure {
            cookie: 0,
            write_counter: 0,
            levels: vec![
                Level {
                    n_merge: 0,
                    segments: vec![seg(7, 50)],
                },
                Level {
                    n_merge: 0,
                    segments: vec![seg(9, 10)],
                },
            ],
        };
        c.promote(&mut s, 0);
        assert_eq!(s.levels[0].segments.len(), 1);
        assert_eq!(s.levels[1].segments.len(), 1);
    }
}
