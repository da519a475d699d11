use crate::compression::poslist::{write_poslist, PoslistReader};
use crate::core::error::Result;
use crate::core::types::{Position, Rowid};
use crate::index::multi_iter::MultiIter;
use crate::index::segment_iter::MemIter;

/// One term's doclist stream: the live merge across segments and the
/// pending hash, or an owned merged buffer (prefix queries).
pub enum TermStream<'a> {
    Multi(MultiIter<'a>),
    Mem(MemIter),
}

impl<'a> TermStream<'a> {
    pub fn eof(&self) -> bool {
        match self {
            TermStream::Multi(i) => i.eof(),
            TermStream::Mem(i) => i.eof,
        }
    }

    pub fn rowid(&self) -> Rowid {
        match self {
            TermStream::Multi(i) => i.rowid(),
            TermStream::Mem(i) => i.rowid,
        }
    }

    pub fn advance(&mut self) -> Result<()> {
        match self {
            TermStream::Multi(i) => i.advance(),
            TermStream::Mem(i) => i.advance(),
        }
    }

    pub fn advance_from(&mut self, target: Rowid) -> Result<()> {
        match self {
            TermStream::Multi(i) => i.advance_from(target),
            TermStream::Mem(i) => i.next_from(target),
        }
    }

    pub fn poslist(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            TermStream::Multi(i) => i.poslist(out),
            TermStream::Mem(i) => {
                out.extend_from_slice(i.poslist());
                Ok(())
            }
        }
    }
}

/// Streams the rows matching one phrase, producing per-row phrase
/// position lists (positions of the phrase's first token).
pub struct PhraseStream<'a> {
    terms: Vec<TermStream<'a>>,
    pub rowid: Rowid,
    pub poslist: Vec<u8>,
    pub eof: bool,
    reverse: bool,
    scratch: Vec<Vec<u8>>,
}

impl<'a> PhraseStream<'a> {
    pub fn new(terms: Vec<TermStream<'a>>, reverse: bool) -> Result<PhraseStream<'a>> {
        let n = terms.len();
        let mut stream = PhraseStream {
            terms,
            rowid: 0,
            poslist: Vec::new(),
            eof: false,
            reverse,
            scratch: vec![Vec::new(); n],
        };
        stream.align()?;
        Ok(stream)
    }

    pub fn n_terms(&self) -> usize {
        self.terms.len()
    }

    /// Advance past the current row to the next matching one.
    pub fn advance(&mut self) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        self.terms[0].advance()?;
        self.align()
    }

    /// Position at the first matching row at or past `target` in the
    /// stream direction.
    pub fn advance_from(&mut self, target: Rowid) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        let already = if self.reverse {
            self.rowid <= target
        } else {
            self.rowid >= target
        };
        if already && !self.poslist.is_empty() {
            return Ok(());
        }
        self.terms[0].advance_from(target)?;
        self.align()
    }

    /// Line up all term streams on one rowid with a non-empty phrase
    /// match.
    fn align(&mut self) -> Result<()> {
        'outer: loop {
            if self.terms.iter().any(|t| t.eof()) {
                self.eof = true;
                self.poslist.clear();
                return Ok(());
            }
            // Drive every stream to the furthest current rowid.
            let target = if self.reverse {
                self.terms.iter().map(|t| t.rowid()).min().unwrap()
            } else {
                self.terms.iter().map(|t| t.rowid()).max().unwrap()
            };
            for i in 0..self.terms.len() {
                self.terms[i].advance_from(target)?;
                if self.terms[i].eof() {
                    self.eof = true;
                    self.poslist.clear();
                    return Ok(());
                }
                if self.terms[i].rowid() != target {
                    continue 'outer;
                }
            }
            if self.evaluate()? {
                self.rowid = target;
                return Ok(());
            }
            self.terms[0].advance()?;
        }
    }

    /// Intersect term positions for consecutiveness. Fills
    /// `self.poslist` and reports whether the row matches.
    fn evaluate(&mut self) -> Result<bool> {
        if self.terms.len() == 1 {
            self.poslist.clear();
            self.terms[0].poslist(&mut self.poslist)?;
            return Ok(!self.poslist.is_empty());
        }
        for (i, term) in self.terms.iter().enumerate() {
            self.scratch[i].clear();
            term.poslist(&mut self.scratch[i])?;
        }
        let lists: Vec<Vec<Position>> = self
            .scratch
            .iter()
            .map(|buf| PoslistReader::new(buf).collect())
            .collect();
        let mut matches: Vec<Position> = Vec::new();
        let mut cursors = vec![0usize; lists.len()];
        'candidates: for &p in &lists[0] {
            for (k, list) in lists.iter().enumerate().skip(1) {
                let want = Position(p.packed() + k as u64);
                while cursors[k] < list.len() && list[cursors[k]] < want {
                    cursors[k] += 1;
                }
                match list.get(cursors[k]) {
                    Some(&q) if q == want => {}
                    Some(_) => continue 'candidates,
                    None => break 'candidates,
                }
            }
            matches.push(p);
        }
        self.poslist.clear();
        write_poslist(&mut self.poslist, &matches);
        Ok(!matches.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::doclist::DoclistWriter;

    fn mem_stream(rows: &[(i64, &[u32])]) -> TermStream<'static> {
        let mut buf = Vec::new();
        let mut w = DoclistWriter::new();
        for &(rowid, offsets) in rows {
            let positions: Vec<Position> =
                offsets.iter().map(|&o| Position::new(0, o)).collect();
            let mut pos = Vec::new();
            write_poslist(&mut pos, &positions);
            w.append(&mut buf, rowid, &pos, false);
        }
        TermStream::Mem(MemIter::single(b"0t".to_vec(), buf).unwrap())
    }

    fn positions(data: &[u8]) -> Vec<(u32, u32)> {
        PoslistReader::new(data).map(|p| (p.col(), p.offset())).collect()
    }

    #[test]
    fn test_single_term_stream() {
        let mut s = PhraseStream::new(vec![mem_stream(&[(1, &[4]), (3, &[0, 9])])], false).unwrap();
        assert_eq!(s.rowid, 1);
        s.advance().unwrap();
        assert_eq!(s.rowid, 3);
        assert_eq!(positions(&s.poslist), vec![(0, 0), (0, 9)]);
        s.advance().unwrap();
        assert!(s.eof);
    }

    #[test]
    fn test_two_term_phrase() {
        // "quick brown": consecutive in row 1, not in row 2, only row 1
        // matches.
        let quick = mem_stream(&[(1, &[1, 7]), (2, &[3])]);
        let brown = mem_stream(&[(1, &[2]), (2, &[5])]);
        let mut s = PhraseStream::new(vec![quick, brown], false).unwrap();
        assert_eq!(s.rowid, 1);
        assert_eq!(positions(&s.poslist), vec![(0, 1)]);
        s.advance().unwrap();
        assert!(s.eof);
    }

    #[test]
    fn test_phrase_requires_shared_rowid() {
        let a = mem_stream(&[(1, &[0]), (5, &[0])]);
        let b = mem_stream(&[(2, &[1]), (5, &[1])]);
        let mut s = PhraseStream::new(vec![a, b], false).unwrap();
        assert_eq!(s.rowid, 5);
        s.advance().unwrap();
        assert!(s.eof);
    }

    #[test]
    fn test_advance_from() {
        let t = mem_stream(&[(1, &[0]), (4, &[0]), (9, &[0])]);
        let mut s = PhraseStream::new(vec![t], false).unwrap();
        s.advance_from(3).unwrap();
        assert_eq!(s.rowid, 4);
        s.advance_from(4).unwrap();
        assert_eq!(s.rowid, 4);
        s.advance_from(10).unwrap();
        assert!(s.eof);
    }
}
