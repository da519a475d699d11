use crate::compression::poslist::PoslistReader;
use crate::core::error::Result;
use crate::index::index::FtsIndex;
use crate::index::pending::MAIN_PREFIX;

/// Per-term statistics over the main index: distinct rows and total
/// hits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermStats {
    pub term: Vec<u8>,
    pub n_doc: u64,
    pub n_hit: u64,
}

/// Per-term, per-column statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermColStats {
    pub term: Vec<u8>,
    pub col: u32,
    pub n_doc: u64,
    pub n_hit: u64,
}

/// Row-form vocabulary: one record per term.
pub fn term_stats(index: &FtsIndex) -> Result<Vec<TermStats>> {
    let mut out: Vec<TermStats> = Vec::new();
    let mut iter = index.scan_all(true)?;
    let mut pos_buf = Vec::new();
    while !iter.eof() {
        let key = iter.term();
        if key.first() != Some(&MAIN_PREFIX) {
            // Prefix-index entries would double-count; the vocabulary
            // describes the main index only.
            break;
        }
        let term = key[1..].to_vec();
        pos_buf.clear();
        iter.poslist(&mut pos_buf)?;
        let hits = PoslistReader::new(&pos_buf).count() as u64;
        match out.last_mut() {
            Some(last) if last.term == term => {
                last.n_doc += 1;
                last.n_hit += hits;
            }
            _ => out.push(TermStats {
                term,
                n_doc: 1,
                n_hit: hits,
            }),
        }
        iter.advance()?;
    }
    Ok(out)
}

/// Column-form vocabulary: one record per `(term, column)` pair.
pub fn term_col_stats(index: &FtsIndex) -> Result<Vec<TermColStats>> {
    let mut out: Vec<TermColStats> = Vec::new();
    let mut iter = index.scan_all(true)?;
    let mut pos_buf = Vec::new();
    while !iter.eof() {
        let key = iter.term();
        if key.first() != Some(&MAIN_PREFIX) {
            break;
        }
        let term = key[1..].to_vec();
        pos_buf.clear();
        iter.poslist(&mut pos_buf)?;
        let mut col_hits: Vec<(u32, u64)> = Vec::new();
        for p in PoslistReader::new(&pos_buf) {
            match col_hits.last_mut() {
                Some((col, hits)) if *col == p.col() => *hits += 1,
                _ => col_hits.push((p.col(), 1)),
            }
        }
        for (col, hits) in col_hits {
            match out
                .iter_mut()
                .find(|s| s.term == term && s.col == col)
            {
                Some(s) => {
                    s.n_doc += 1;
                    s.n_hit += hits;
                }
                None => out.push(TermColStats {
                    term: term.clone(),
                    col,
                    n_doc: 1,
                    n_hit: hits,
                }),
            }
        }
        iter.advance()?;
    }
    out.sort_by(|a, b| a.term.cmp(&b.term).then(a.col.cmp(&b.col)));
    Ok(out)
}
