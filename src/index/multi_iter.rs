use crate::core::error::Result;
use crate::core::types::Rowid;
use crate::index::segment_iter::{MemIter, SegmentIter};

/// One source feeding the multi-iterator: a real segment cursor or an
/// in-memory synthetic segment (pending-hash snapshot, merged prefix
/// doclist). `None` pads the slot array to a power of two.
pub enum SubIter<'a> {
    Seg(SegmentIter<'a>),
    Mem(MemIter),
    None,
}

impl<'a> SubIter<'a> {
    pub fn eof(&self) -> bool {
        match self {
            SubIter::Seg(i) => i.eof,
            SubIter::Mem(i) => i.eof,
            SubIter::None => true,
        }
    }

    pub fn term(&self) -> &[u8] {
        match self {
            SubIter::Seg(i) => &i.term,
            SubIter::Mem(i) => i.term(),
            SubIter::None => &[],
        }
    }

    pub fn rowid(&self) -> Rowid {
        match self {
            SubIter::Seg(i) => i.rowid,
            SubIter::Mem(i) => i.rowid,
            SubIter::None => 0,
        }
    }

    pub fn n_pos(&self) -> usize {
        match self {
            SubIter::Seg(i) => i.n_pos,
            SubIter::Mem(i) => i.n_pos,
            SubIter::None => 0,
        }
    }

    pub fn b_del(&self) -> bool {
        match self {
            SubIter::Seg(i) => i.b_del,
            SubIter::Mem(i) => i.b_del,
            SubIter::None => false,
        }
    }

    pub fn advance(&mut self) -> Result<()> {
        match self {
            SubIter::Seg(i) => i.advance(),
            SubIter::Mem(i) => i.advance(),
            SubIter::None => Ok(()),
        }
    }

    pub fn next_from(&mut self, target: Rowid) -> Result<()> {
        match self {
            SubIter::Seg(i) => i.next_from(target),
            SubIter::Mem(i) => i.next_from(target),
            SubIter::None => Ok(()),
        }
    }

    pub fn poslist(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            SubIter::Seg(i) => i.poslist(out),
            SubIter::Mem(i) => {
                out.extend_from_slice(i.poslist());
                Ok(())
            }
            SubIter::None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CmpOut {
    i_first: u16,
    b_term_eq: bool,
}

/// N-way merge over sub-iterators using a loser tree: `a_first[1]`
/// always names the sub-iterator with the smallest `(term, rowid)` in
/// the current direction, and advancing one source re-evaluates only
/// its path to the root.
///
/// Sub-iterators are ordered youngest data first; for identical
/// `(term, rowid)` keys the youngest entry survives and older
/// duplicates are stepped past, folding delete markers the way leveled
/// merging requires.
pub struct MultiIter<'a> {
    subs: Vec<SubIter<'a>>,
    a_first: Vec<CmpOut>,
    n_slot: usize,
    pub reverse: bool,
    pub skip_empty: bool,
    scratch_term: Vec<u8>,
}

impl<'a> MultiIter<'a> {
    pub fn new(mut subs: Vec<SubIter<'a>>, reverse: bool, skip_empty: bool) -> Result<MultiIter<'a>> {
        let n = subs.len().max(2);
        let n_slot = n.next_power_of_two();
        while subs.len() < n_slot {
            subs.push(SubIter::None);
        }
        let mut iter = MultiIter {
            subs,
            a_first: vec![CmpOut::default(); n_slot],
            n_slot,
            reverse,
            skip_empty,
            scratch_term: Vec::new(),
        };
        for i in (1..n_slot).rev() {
            iter.do_compare(i);
        }
        if iter.skip_empty {
            iter.skip_empty_entries()?;
        }
        Ok(iter)
    }

    fn winner(&self) -> usize {
        self.a_first[1].i_first as usize
    }

    /// The sub-iterators, each at its first unconsumed entry; the
    /// merger reads these back to trim paused inputs.
    pub fn subs(&self) -> &[SubIter<'a>] {
        &self.subs
    }

    pub fn eof(&self) -> bool {
        self.subs[self.winner()].eof()
    }

    pub fn term(&self) -> &[u8] {
        self.subs[self.winner()].term()
    }

    pub fn rowid(&self) -> Rowid {
        self.subs[self.winner()].rowid()
    }

    pub fn n_pos(&self) -> usize {
        self.subs[self.winner()].n_pos()
    }

    pub fn b_del(&self) -> bool {
        self.subs[self.winner()].b_del()
    }

    pub fn poslist(&self, out: &mut Vec<u8>) -> Result<()> {
        self.subs[self.winner()].poslist(out)
    }

    /// Compare the two children feeding `a_first[i_out]`.
    fn do_compare(&mut self, i_out: usize) {
        let (i1, i2) = if i_out >= self.n_slot / 2 {
            let i1 = (i_out - self.n_slot / 2) * 2;
            (i1, i1 + 1)
        } else {
            (
                self.a_first[i_out * 2].i_first as usize,
                self.a_first[i_out * 2 + 1].i_first as usize,
            )
        };
        let a = &self.subs[i1];
        let b = &self.subs[i2];
        let out = if a.eof() {
            CmpOut {
                i_first: if b.eof() { i1 } else { i2 } as u16,
                b_term_eq: false,
            }
        } else if b.eof() {
            CmpOut {
                i_first: i1 as u16,
                b_term_eq: false,
            }
        } else {
            match a.term().cmp(b.term()) {
                std::cmp::Ordering::Less => CmpOut {
                    i_first: i1 as u16,
                    b_term_eq: false,
                },
                std::cmp::Ordering::Greater => CmpOut {
                    i_first: i2 as u16,
                    b_term_eq: false,
                },
                std::cmp::Ordering::Equal => {
                    // Terms agree: order by rowid in the scan direction,
                    // youngest (lowest index) first on full equality.
                    let (ra, rb) = (a.rowid(), b.rowid());
                    let a_wins = if ra == rb {
                        true
                    } else if self.reverse {
                        ra > rb
                    } else {
                        ra < rb
                    };
                    CmpOut {
                        i_first: if a_wins { i1 } else { i2 } as u16,
                        b_term_eq: true,
                    }
                }
            }
        };
        self.a_first[i_out] = out;
    }

    /// Re-evaluate the path from sub-iterator `i` to the root.
    fn replay(&mut self, i: usize) {
        let mut i_out = (i + self.n_slot) / 2;
        while i_out >= 1 {
            self.do_compare(i_out);
            i_out /= 2;
        }
    }

    /// True when another sub-iterator may hold the winner's exact
    /// `(term, rowid)`: some comparison on the winner's path to the
    /// root saw equal terms. When every node on the path is false, the
    /// duplicate check can be skipped entirely.
    fn dup_possible(&self, w: usize) -> bool {
        let mut i_out = (w + self.n_slot) / 2;
        while i_out >= 1 {
            if self.a_first[i_out].b_term_eq {
                return true;
            }
            i_out /= 2;
        }
        false
    }

    /// Advance the winner once, stepping equal-keyed older entries too.
    fn step(&mut self) -> Result<()> {
        let w = self.winner();
        let dup_possible = self.dup_possible(w);
        let old_rowid = self.subs[w].rowid();
        if dup_possible {
            self.scratch_term.clear();
            self.scratch_term.extend_from_slice(self.subs[w].term());
        }
        self.subs[w].advance()?;
        self.replay(w);
        if dup_possible {
            loop {
                let w2 = self.winner();
                if self.subs[w2].eof()
                    || self.subs[w2].rowid() != old_rowid
                    || self.subs[w2].term() != self.scratch_term.as_slice()
                {
                    break;
                }
                self.subs[w2].advance()?;
                self.replay(w2);
            }
        }
        Ok(())
    }

    fn skip_empty_entries(&mut self) -> Result<()> {
        while !self.eof() && self.n_pos() == 0 {
            self.step()?;
        }
        Ok(())
    }

    pub fn advance(&mut self) -> Result<()> {
        if self.eof() {
            return Ok(());
        }
        self.step()?;
        if self.skip_empty {
            self.skip_empty_entries()?;
        }
        Ok(())
    }

    /// Skip to the first surviving entry at or past `target` in the
    /// iteration direction.
    pub fn advance_from(&mut self, target: Rowid) -> Result<()> {
        loop {
            if self.eof() {
                return Ok(());
            }
            let r = self.rowid();
            let reached = if self.reverse { r <= target } else { r >= target };
            if reached {
                break;
            }
            let w = self.winner();
            self.subs[w].next_from(target)?;
            self.replay(w);
        }
        if self.skip_empty {
            self.skip_empty_entries()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::doclist::DoclistWriter;
    use crate::index::segment_iter::MemIter;

    fn mem_doclist(rows: &[(i64, bool)]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut w = DoclistWriter::new();
        for &(rowid, del) in rows {
            let pos: &[u8] = if del { &[] } else { &[8] };
            w.append(&mut buf, rowid, pos, del);
        }
        buf
    }

    fn mem_sub(term: &[u8], rows: &[(i64, bool)]) -> SubIter<'static> {
        SubIter::Mem(MemIter::single(term.to_vec(), mem_doclist(rows)).unwrap())
    }

    fn drain(iter: &mut MultiIter<'_>) -> Vec<(Vec<u8>, i64, bool)> {
        let mut out = Vec::new();
        while !iter.eof() {
            out.push((iter.term().to_vec(), iter.rowid(), iter.b_del()));
            iter.advance().unwrap();
        }
        out
    }

    #[test]
    fn test_merge_two_sources() {
        let subs = vec![
            mem_sub(b"0a", &[(1, false), (5, false)]),
            mem_sub(b"0a", &[(2, false), (9, false)]),
        ];
        let mut iter = MultiIter::new(subs, false, true).unwrap();
        let rows = drain(&mut iter);
        let rowids: Vec<i64> = rows.iter().map(|r| r.1).collect();
        assert_eq!(rowids, vec![1, 2, 5, 9]);
    }

    #[test]
    fn test_youngest_wins_on_duplicates() {
        // Sub 0 is younger: its delete marker hides the older entry.
        let subs = vec![
            mem_sub(b"0a", &[(5, true)]),
            mem_sub(b"0a", &[(5, false), (7, false)]),
        ];
        let mut iter = MultiIter::new(subs, false, true).unwrap();
        let rows = drain(&mut iter);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, 7);

        // Without skip_empty the surviving marker itself is emitted
        // (this is the merge-path view).
        let subs = vec![
            mem_sub(b"0a", &[(5, true)]),
            mem_sub(b"0a", &[(5, false), (7, false)]),
        ];
        let mut iter = MultiIter::new(subs, false, false).unwrap();
        let rows = drain(&mut iter);
        assert_eq!(rows, vec![(b"0a".to_vec(), 5, true), (b"0a".to_vec(), 7, false)]);
    }

    #[test]
    fn test_duplicates_in_same_subtree() {
        // Subs 0 and 1 share a tree subtree; the root comparison sees a
        // different term, so the duplicate must be found on the path.
        let subs = vec![
            mem_sub(b"0a", &[(5, false)]),
            mem_sub(b"0a", &[(5, false), (9, false)]),
            mem_sub(b"0b", &[(1, false)]),
        ];
        let mut iter = MultiIter::new(subs, false, true).unwrap();
        let rows = drain(&mut iter);
        assert_eq!(
            rows,
            vec![
                (b"0a".to_vec(), 5, false),
                (b"0a".to_vec(), 9, false),
                (b"0b".to_vec(), 1, false),
            ]
        );
    }

    #[test]
    fn test_term_interleave() {
        let subs = vec![
            mem_sub(b"0b", &[(1, false)]),
            mem_sub(b"0a", &[(4, false)]),
            mem_sub(b"0c", &[(2, false)]),
        ];
        let mut iter = MultiIter::new(subs, false, true).unwrap();
        let rows = drain(&mut iter);
        let terms: Vec<Vec<u8>> = rows.iter().map(|r| r.0.clone()).collect();
        assert_eq!(terms, vec![b"0a".to_vec(), b"0b".to_vec(), b"0c".to_vec()]);
    }

    #[test]
    fn test_reverse_rowid_order() {
        let mut a = MemIter::single(b"0a".to_vec(), mem_doclist(&[(1, false), (5, false)])).unwrap();
        a.reverse_init().unwrap();
        let mut b = MemIter::single(b"0a".to_vec(), mem_doclist(&[(2, false), (9, false)])).unwrap();
        b.reverse_init().unwrap();
        let mut iter =
            MultiIter::new(vec![SubIter::Mem(a), SubIter::Mem(b)], true, true).unwrap();
        let rows = drain(&mut iter);
        let rowids: Vec<i64> = rows.iter().map(|r| r.1).collect();
        assert_eq!(rowids, vec![9, 5, 2, 1]);
    }

    #[test]
    fn test_advance_from() {
        let subs = vec![
            mem_sub(b"0a", &[(1, false), (10, false), (20, false)]),
            mem_sub(b"0a", &[(5, false), (15, false)]),
        ];
        let mut iter = MultiIter::new(subs, false, true).unwrap();
        iter.advance_from(9).unwrap();
        assert_eq!(iter.rowid(), 10);
        iter.advance_from(16).unwrap();
        assert_eq!(iter.rowid(), 20);
        iter.advance_from(100).unwrap();
        assert!(iter.eof());
    }

    #[test]
    fn test_update_shadows_older_poslist() {
        // Younger source rewrites rowid 5's positions; the older copy is
        // never surfaced.
        let young = {
            let mut buf = Vec::new();
            let mut w = DoclistWriter::new();
            w.append(&mut buf, 5, &[9, 9], false);
            buf
        };
        let old = {
            let mut buf = Vec::new();
            let mut w = DoclistWriter::new();
            w.append(&mut buf, 5, &[3], false);
            buf
        };
        let subs = vec![
            SubIter::Mem(MemIter::single(b"0a".to_vec(), young).unwrap()),
            SubIter::Mem(MemIter::single(b"0a".to_vec(), old).unwrap()),
        ];
        let mut iter = MultiIter::new(subs, false, true).unwrap();
        assert_eq!(iter.rowid(), 5);
        let mut pos = Vec::new();
        iter.poslist(&mut pos).unwrap();
        assert_eq!(pos, vec![9, 9]);
        iter.advance().unwrap();
        assert!(iter.eof());
    }
}
