use crate::core::config::IndexConfig;
use crate::core::error::Result;
use crate::core::types::Rowid;
use crate::index::index::FtsIndex;
use crate::index::segment_iter::MemIter;
use crate::query::expr::{Expr, Phrase, Query};
use crate::query::phrase::{PhraseStream, TermStream};

/// Document-at-a-time cursor over a MATCH expression: every phrase
/// opens one stream, and the boolean structure is solved per rowid in
/// ascending or descending order.
pub struct MatchCursor<'a> {
    pub query: Query,
    phrases: Vec<PhraseStream<'a>>,
    pub rowid: Rowid,
    pub eof: bool,
    pub reverse: bool,
    started: bool,
}

/// Open the term streams for one phrase.
pub fn open_phrase<'a>(
    index: &'a FtsIndex,
    config: &IndexConfig,
    phrase: &Phrase,
    reverse: bool,
) -> Result<PhraseStream<'a>> {
    let mut terms = Vec::with_capacity(phrase.terms.len());
    for term in &phrase.terms {
        if term.prefix {
            let doclist = index.prefix_doclist(config, &term.text)?;
            let mut mem = MemIter::single(term.text.as_bytes().to_vec(), doclist)?;
            if reverse {
                mem.reverse_init()?;
            }
            terms.push(TermStream::Mem(mem));
        } else {
            terms.push(TermStream::Multi(index.query_term(
                0,
                term.text.as_bytes(),
                reverse,
            )?));
        }
    }
    PhraseStream::new(terms, reverse)
}

impl<'a> MatchCursor<'a> {
    pub fn new(
        index: &'a FtsIndex,
        config: &IndexConfig,
        query: Query,
        reverse: bool,
    ) -> Result<MatchCursor<'a>> {
        let mut phrases = Vec::with_capacity(query.phrases.len());
        for phrase in &query.phrases {
            phrases.push(open_phrase(index, config, phrase, reverse)?);
        }
        let mut cursor = MatchCursor {
            query,
            phrases,
            rowid: 0,
            eof: false,
            reverse,
            started: false,
        };
        cursor.next()?;
        Ok(cursor)
    }

    pub fn phrase_count(&self) -> usize {
        self.phrases.len()
    }

    pub fn phrase_size(&self, i: usize) -> usize {
        self.phrases[i].n_terms()
    }

    /// Phrase position list for the current row; empty when the phrase
    /// did not contribute to the match (OR branches).
    pub fn phrase_poslist(&self, i: usize) -> &[u8] {
        let p = &self.phrases[i];
        if !p.eof && p.rowid == self.rowid {
            &p.poslist
        } else {
            &[]
        }
    }

    /// Advance to the next matching row.
    pub fn next(&mut self) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        let bound = if !self.started {
            self.started = true;
            if self.reverse { Rowid::MAX } else { Rowid::MIN }
        } else if self.reverse {
            match self.rowid.checked_sub(1) {
                Some(b) => b,
                None => {
                    self.eof = true;
                    return Ok(());
                }
            }
        } else {
            match self.rowid.checked_add(1) {
                Some(b) => b,
                None => {
                    self.eof = true;
                    return Ok(());
                }
            }
        };
        let expr = self.query.expr.clone();
        match solve(&expr, &mut self.phrases, bound, self.reverse)? {
            Some(rowid) => self.rowid = rowid,
            None => self.eof = true,
        }
        Ok(())
    }

    /// Collect every matching rowid (drains the cursor).
    pub fn collect_rowids(mut self) -> Result<Vec<Rowid>> {
        let mut out = Vec::new();
        while !self.eof {
            out.push(self.rowid);
            self.next()?;
        }
        Ok(out)
    }
}

fn past(a: Rowid, b: Rowid, reverse: bool) -> bool {
    if reverse { a <= b } else { a >= b }
}

/// Smallest (in scan direction) rowid at or past `bound` satisfying
/// `expr`, or None.
fn solve(
    expr: &Expr,
    phrases: &mut [PhraseStream<'_>],
    bound: Rowid,
    reverse: bool,
) -> Result<Option<Rowid>> {
    match expr {
        Expr::Phrase(i) => {
            let p = &mut phrases[*i];
            p.advance_from(bound)?;
            Ok(if p.eof { None } else { Some(p.rowid) })
        }
        Expr::And(items) => {
            let mut target = bound;
            'retry: loop {
                let mut candidate: Option<Rowid> = None;
                for item in items {
                    match solve(item, phrases, target, reverse)? {
                        None => return Ok(None),
                        Some(r) => {
                            if let Some(c) = candidate {
                                if r != c {
                                    // Move the bound to the furthest
                                    // child and realign everyone.
                                    target = if past(r, c, reverse) && r != c { r } else { c };
                                    continue 'retry;
                                }
                            } else {
                                candidate = Some(r);
                            }
                        }
                    }
                }
                return Ok(candidate);
            }
        }
        Expr::Or(items) => {
            let mut best: Option<Rowid> = None;
            for item in items {
                if let Some(r) = solve(item, phrases, bound, reverse)? {
                    best = Some(match best {
                        Some(b) if past(r, b, reverse) => b,
                        _ => r,
                    });
                }
            }
            Ok(best)
        }
        Expr::Not(yes, no) => {
            let mut target = bound;
            loop {
                let Some(r) = solve(yes, phrases, target, reverse)? else {
                    return Ok(None);
                };
                match solve(no, phrases, r, reverse)? {
                    Some(blocked) if blocked == r => {
                        target = if reverse {
                            match r.checked_sub(1) {
                                Some(t) => t,
                                None => return Ok(None),
                            }
                        } else {
                            match r.checked_add(1) {
                                Some(t) => t,
                                None => return Ok(None),
                            }
                        };
                    }
                    _ => return Ok(Some(r)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tokenizer::SimpleTokenizer;
    use crate::core::config::IndexConfig;
    use crate::query::expr::QueryParser;
    use crate::storage::backend::MemBackend;

    fn index_with(rows: &[(i64, &str)], config: &IndexConfig) -> FtsIndex {
        let tokenizer = SimpleTokenizer::default();
        let mut index = FtsIndex::create(Box::new(MemBackend::new()), config).unwrap();
        for &(rowid, text) in rows {
            index.begin_row(config, rowid).unwrap();
            let mut tokens = Vec::new();
            crate::analysis::tokenizer::Tokenizer::tokenize(&tokenizer, text, &mut |t| {
                tokens.push((t.text.to_string(), t.position));
                Ok(())
            })
            .unwrap();
            for (text, pos) in tokens {
                index.write_token(config, rowid, 0, pos, &text);
            }
        }
        index
    }

    fn run(index: &FtsIndex, config: &IndexConfig, expr: &str, reverse: bool) -> Vec<i64> {
        let query = QueryParser::parse(&SimpleTokenizer::default(), expr).unwrap();
        MatchCursor::new(index, config, query, reverse)
            .unwrap()
            .collect_rowids()
            .unwrap()
    }

    #[test]
    fn test_boolean_operators() {
        let config = IndexConfig::parse(&["t"]).unwrap();
        let index = index_with(
            &[(1, "a b c"), (2, "a b d"), (3, "c d e")],
            &config,
        );
        assert_eq!(run(&index, &config, "a", false), vec![1, 2]);
        assert_eq!(run(&index, &config, "a", true), vec![2, 1]);
        assert_eq!(run(&index, &config, "b", false), vec![1, 2]);
        assert_eq!(run(&index, &config, "x", false), Vec::<i64>::new());
        assert_eq!(run(&index, &config, "a AND d", false), vec![2]);
        assert_eq!(run(&index, &config, "a OR e", false), vec![1, 2, 3]);
        assert_eq!(run(&index, &config, "d NOT a", false), vec![3]);
        assert_eq!(run(&index, &config, "(a OR c) NOT d", false), vec![1]);
    }

    #[test]
    fn test_phrase_query() {
        let config = IndexConfig::parse(&["t"]).unwrap();
        let index = index_with(
            &[(1, "the quick brown fox"), (2, "brown the quick")],
            &config,
        );
        assert_eq!(run(&index, &config, "\"quick brown\"", false), vec![1]);
        assert_eq!(run(&index, &config, "quick brown", false), vec![1, 2]);
        assert_eq!(run(&index, &config, "\"quick brown\"", true), vec![1]);
    }

    #[test]
    fn test_prefix_query_scan_path() {
        let config = IndexConfig::parse(&["t"]).unwrap();
        let index = index_with(&[(1, "alphabet soup"), (2, "alpine lake")], &config);
        assert_eq!(run(&index, &config, "al*", false), vec![1, 2]);
        assert_eq!(run(&index, &config, "alpha*", false), vec![1]);
        assert_eq!(run(&index, &config, "al*", true), vec![2, 1]);
    }

    #[test]
    fn test_prefix_query_indexed_path_equivalence() {
        let with_index = IndexConfig::parse(&["t", "prefix=2"]).unwrap();
        let index = index_with(&[(1, "alphabet soup"), (2, "alpine lake")], &with_index);
        // Declared prefix index used for a 2-char prefix.
        assert_eq!(run(&index, &with_index, "al*", false), vec![1, 2]);
        // Same docset through the scan path (property check).
        let scan = index.prefix_doclist_scan(b"al").unwrap();
        let indexed = index.term_doclist(1, b"al").unwrap();
        let rowids = |doclist: &[u8]| {
            let mut r = crate::index::doclist::DoclistReader::new(doclist);
            let mut out = Vec::new();
            while r.next() {
                out.push(r.rowid);
            }
            out
        };
        assert_eq!(rowids(&scan), rowids(&indexed));
    }
}
