use crate::compression::poslist::merge_poslists;
use crate::core::types::Rowid;
use crate::index::doclist::{DoclistReader, DoclistWriter};

/// Partial results of a prefix scan are bucketized into this many
/// geometrically-growing buffers, capping worst-case memory the way a
/// merge-sort buffer tree does.
pub const N_MERGE_BUFS: usize = 32;

/// Merge two in-memory doclists by rowid; poslists are unioned when the
/// same rowid appears in both (the row matched several distinct terms).
pub fn merge_doclists(a: &[u8], b: &[u8]) -> Vec<u8> {
    if a.is_empty() {
        return b.to_vec();
    }
    if b.is_empty() {
        return a.to_vec();
    }
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut w = DoclistWriter::new();
    let mut ra = DoclistReader::new(a);
    let mut rb = DoclistReader::new(b);
    let mut more_a = ra.next();
    let mut more_b = rb.next();
    let mut merged_pos = Vec::new();
    while more_a && more_b {
        if ra.rowid < rb.rowid {
            w.append(&mut out, ra.rowid, ra.poslist(), ra.b_del);
            more_a = ra.next();
        } else if rb.rowid < ra.rowid {
            w.append(&mut out, rb.rowid, rb.poslist(), rb.b_del);
            more_b = rb.next();
        } else {
            merged_pos.clear();
            merge_poslists(ra.poslist(), rb.poslist(), &mut merged_pos);
            w.append(&mut out, ra.rowid, &merged_pos, ra.b_del && rb.b_del);
            more_a = ra.next();
            more_b = rb.next();
        }
    }
    while more_a {
        w.append(&mut out, ra.rowid, ra.poslist(), ra.b_del);
        more_a = ra.next();
    }
    while more_b {
        w.append(&mut out, rb.rowid, rb.poslist(), rb.b_del);
        more_b = rb.next();
    }
    out
}

/// Accumulates `(rowid, poslist)` pairs arriving sorted per term but
/// unsorted across terms, producing one merged doclist.
///
/// Runs of ascending rowids append cheaply; when a rowid regresses (a
/// new term's doclist began) the finished run folds into the buffer
/// tree binary-counter style.
#[derive(Default)]
pub struct PrefixAccumulator {
    bufs: Vec<Option<Vec<u8>>>,
    cur: Vec<u8>,
    writer: DoclistWriter,
}

impl PrefixAccumulator {
    pub fn new() -> Self {
        PrefixAccumulator {
            bufs: (0..N_MERGE_BUFS).map(|_| None).collect(),
            cur: Vec::new(),
            writer: DoclistWriter::new(),
        }
    }

    pub fn push(&mut self, rowid: Rowid, poslist: &[u8]) {
        if !self.writer.accepts(rowid) {
            self.fold_current();
        }
        self.writer.append(&mut self.cur, rowid, poslist, false);
    }

    fn fold_current(&mut self) {
        let mut run = std::mem::take(&mut self.cur);
        self.writer = DoclistWriter::new();
        if run.is_empty() {
            return;
        }
        for slot in self.bufs.iter_mut() {
            match slot.take() {
                None => {
                    *slot = Some(run);
                    return;
                }
                Some(existing) => {
                    run = merge_doclists(&existing, &run);
                }
            }
        }
        // Every slot was occupied; park the giant run in the last one.
        *self.bufs.last_mut().unwrap() = Some(run);
    }

    /// Merge every buffered run into the final doclist.
    pub fn finish(mut self) -> Vec<u8> {
        self.fold_current();
        let mut result = Vec::new();
        for slot in self.bufs.iter_mut() {
            if let Some(buf) = slot.take() {
                result = merge_doclists(&result, &buf);
            }
        }
        result
    }
}

/// Smallest byte string strictly greater than every string with the
/// given prefix, or None when the prefix is all `0xff`.
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(&last) = out.last() {
        if last < 0xff {
            *out.last_mut().unwrap() = last + 1;
            return Some(out);
        }
        out.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::poslist::write_poslist;
    use crate::core::types::Position;

    fn pos(offsets: &[u32]) -> Vec<u8> {
        let positions: Vec<Position> = offsets.iter().map(|&o| Position::new(0, o)).collect();
        let mut buf = Vec::new();
        write_poslist(&mut buf, &positions);
        buf
    }

    fn rowids(doclist: &[u8]) -> Vec<Rowid> {
        let mut out = Vec::new();
        let mut r = DoclistReader::new(doclist);
        while r.next() {
            out.push(r.rowid);
        }
        out
    }

    #[test]
    fn test_merge_doclists_disjoint_and_overlap() {
        let mut a = Vec::new();
        let mut w = DoclistWriter::new();
        w.append(&mut a, 1, &pos(&[0]), false);
        w.append(&mut a, 5, &pos(&[2]), false);
        let mut b = Vec::new();
        let mut w = DoclistWriter::new();
        w.append(&mut b, 3, &pos(&[1]), false);
        w.append(&mut b, 5, &pos(&[1]), false);

        let merged = merge_doclists(&a, &b);
        assert_eq!(rowids(&merged), vec![1, 3, 5]);
        let mut r = DoclistReader::new(&merged);
        r.next();
        r.next();
        r.next();
        assert_eq!(r.rowid, 5);
        let positions: Vec<u32> = crate::compression::poslist::PoslistReader::new(r.poslist())
            .map(|p| p.offset())
            .collect();
        assert_eq!(positions, vec![1, 2]);
    }

    #[test]
    fn test_accumulator_multiple_runs() {
        let mut acc = PrefixAccumulator::new();
        // Term one: rowids 2, 7. Term two: rowids 1, 7. Term three: 4.
        acc.push(2, &pos(&[0]));
        acc.push(7, &pos(&[0]));
        acc.push(1, &pos(&[3]));
        acc.push(7, &pos(&[3]));
        acc.push(4, &pos(&[9]));
        let merged = acc.finish();
        assert_eq!(rowids(&merged), vec![1, 2, 4, 7]);
    }

    #[test]
    fn test_accumulator_many_terms() {
        let mut acc = PrefixAccumulator::new();
        // 100 single-row runs with descending rowids force one fold per
        // run and exercise the buffer-tree carries.
        for i in (0..100i64).rev() {
            acc.push(i, &pos(&[1]));
        }
        let merged = acc.finish();
        assert_eq!(rowids(&merged), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_prefix_upper_bound() {
        assert_eq!(prefix_upper_bound(b"ab").unwrap(), b"ac".to_vec());
        assert_eq!(prefix_upper_bound(b"a\xff").unwrap(), b"b".to_vec());
        assert!(prefix_upper_bound(b"\xff\xff").is_none());
        assert!(prefix_upper_bound(b"").is_none());
    }
}
