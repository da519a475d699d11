use crate::analysis::tokenizer::{create_tokenizer, tokenize_to_vec, Tokenizer};
use crate::core::config::{parse_rank, IndexConfig, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::Rowid;
use crate::index::index::{char_prefix_len, entry_cksum, FtsIndex};
use crate::index::record::Averages;
use crate::query::cursor::{open_phrase, MatchCursor};
use crate::query::expr::QueryParser;
use crate::scoring::bm25::bm25;
use crate::search::api::{AuxContext, Instance};
use crate::search::{highlight, snippet};
use crate::storage::backend::StorageBackend;
use crate::storage::documents::DocumentStore;
use std::any::Any;
use std::collections::HashMap;

/// On-disk format version recorded in the config table.
pub const FORMAT_VERSION: u32 = 4;

/// The top-level handle: configuration, tokenizer, document stores and
/// the inverted index behind one insert/delete/query surface. The host
/// serializes writers; `&mut self` on the write path mirrors that.
pub struct Database {
    config: IndexConfig,
    tokenizer: Box<dyn Tokenizer>,
    index: FtsIndex,
}

impl Database {
    /// Create a new table on an empty backend from CREATE-style args.
    pub fn create(backend: Box<dyn StorageBackend>, args: &[&str]) -> Result<Database> {
        let config = IndexConfig::parse(args)?;
        let tokenizer = create_tokenizer(&config.tokenizer)?;
        persist_config(backend.as_ref(), &config)?;
        let index = FtsIndex::create(backend, &config)?;
        Ok(Database {
            config,
            tokenizer,
            index,
        })
    }

    /// Open an existing table, reading configuration from the backend.
    pub fn open(backend: Box<dyn StorageBackend>) -> Result<Database> {
        let config = load_config(backend.as_ref())?;
        let tokenizer = create_tokenizer(&config.tokenizer)?;
        let index = FtsIndex::open(backend, &config)?;
        Ok(Database {
            config,
            tokenizer,
            index,
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Number of rows currently indexed.
    pub fn row_count(&self) -> Result<u64> {
        Ok(self.averages()?.n_row)
    }

    /// Stored column values for one rowid, if present.
    pub fn row_text(&self, rowid: Rowid) -> Result<Option<Vec<String>>> {
        DocumentStore::read_row(self.index.backend(), rowid)
    }

    fn averages(&self) -> Result<Averages> {
        DocumentStore::read_averages(self.index.backend(), self.config.column_count())
    }

    fn tokenize_columns(&self, values: &[&str]) -> Result<Vec<Vec<(String, u32)>>> {
        values
            .iter()
            .map(|text| tokenize_to_vec(self.tokenizer.as_ref(), text))
            .collect()
    }

    /// Insert a row. Fails if the rowid is already present.
    pub fn insert(&mut self, rowid: Rowid, values: &[&str]) -> Result<()> {
        if values.len() != self.config.column_count() {
            return Err(Error::query(format!(
                "expected {} values, got {}",
                self.config.column_count(),
                values.len()
            )));
        }
        if DocumentStore::read_row(self.index.backend(), rowid)?.is_some() {
            return Err(Error::query(format!("rowid {} already exists", rowid)));
        }
        let columns = self.tokenize_columns(values)?;
        self.index.begin_row(&self.config, rowid)?;
        let mut counts = Vec::with_capacity(columns.len());
        for (col, tokens) in columns.iter().enumerate() {
            counts.push(tokens.len() as u64);
            for (text, pos) in tokens {
                self.index
                    .write_token(&self.config, rowid, col as u32, *pos, text);
            }
        }
        let owned: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        DocumentStore::write_row(self.index.backend(), rowid, &owned)?;
        DocumentStore::write_docsize(self.index.backend(), rowid, &counts)?;
        let mut averages = self.averages()?;
        averages.n_row += 1;
        for (col, &c) in counts.iter().enumerate() {
            averages.col_tokens[col] += c;
        }
        DocumentStore::write_averages(self.index.backend(), &averages)
    }

    /// Delete a row. Deleting an absent rowid is a no-op.
    pub fn delete(&mut self, rowid: Rowid) -> Result<()> {
        let Some(values) = DocumentStore::read_row(self.index.backend(), rowid)? else {
            return Ok(());
        };
        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
        let columns = self.tokenize_columns(&refs)?;
        self.index.begin_row(&self.config, rowid)?;
        let mut counts = Vec::with_capacity(columns.len());
        for tokens in &columns {
            counts.push(tokens.len() as u64);
            for (text, _) in tokens {
                self.index.delete_token(&self.config, rowid, text);
            }
        }
        DocumentStore::delete_row(self.index.backend(), rowid)?;
        DocumentStore::delete_docsize(self.index.backend(), rowid)?;
        let mut averages = self.averages()?;
        averages.n_row = averages.n_row.saturating_sub(1);
        for (col, &c) in counts.iter().enumerate() {
            averages.col_tokens[col] = averages.col_tokens[col].saturating_sub(c);
        }
        DocumentStore::write_averages(self.index.backend(), &averages)
    }

    /// Replace a row's content (delete then insert).
    pub fn update(&mut self, rowid: Rowid, values: &[&str]) -> Result<()> {
        self.delete(rowid)?;
        self.insert(rowid, values)
    }

    /// Flush the pending hash to a level-0 segment.
    pub fn sync(&mut self) -> Result<()> {
        self.index.flush(&self.config)
    }

    pub fn begin(&mut self) -> Result<()> {
        self.index.backend().begin()
    }

    /// Make all writes since `begin` durable: flush, then commit the
    /// backend transaction.
    pub fn commit(&mut self) -> Result<()> {
        self.sync()?;
        self.index.backend().commit()
    }

    /// Discard the pending hash and any uncommitted backend state. The
    /// configuration is reloaded too, since a setting change may be
    /// among the reverted writes.
    pub fn rollback(&mut self) -> Result<()> {
        self.index.backend().rollback()?;
        self.config = load_config(self.index.backend())?;
        self.tokenizer = create_tokenizer(&self.config.tokenizer)?;
        self.index.rollback(&self.config)
    }

    /// Open a cursor over a MATCH expression, ascending by rowid.
    pub fn query(&self, expression: &str) -> Result<Cursor<'_>> {
        self.cursor(expression, false)
    }

    /// Descending-rowid variant.
    pub fn query_desc(&self, expression: &str) -> Result<Cursor<'_>> {
        self.cursor(expression, true)
    }

    fn cursor(&self, expression: &str, desc: bool) -> Result<Cursor<'_>> {
        let query = QueryParser::parse(self.tokenizer.as_ref(), expression)?;
        let inner = MatchCursor::new(&self.index, &self.config, query, desc)?;
        Ok(Cursor {
            db: self,
            inner,
            aux_data: HashMap::new(),
            inst_cache: None,
        })
    }

    /// Run a MATCH query and return rowids sorted by the configured
    /// rank function, best first.
    pub fn query_ranked(&self, expression: &str, limit: usize) -> Result<Vec<(Rowid, f64)>> {
        let mut cursor = self.query(expression)?;
        let mut out = Vec::new();
        while !cursor.eof() {
            let score = cursor.rank()?;
            out.push((cursor.rowid(), score));
            cursor.next()?;
        }
        out.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        out.truncate(limit);
        Ok(out)
    }

    /// Merge every segment into one; visible content is unchanged.
    pub fn optimize(&mut self) -> Result<()> {
        self.index.optimize(&self.config)
    }

    /// Drop all rows and index data.
    pub fn delete_all(&mut self) -> Result<()> {
        for (rowid, _) in self.index.backend().content_scan()? {
            DocumentStore::delete_row(self.index.backend(), rowid)?;
            DocumentStore::delete_docsize(self.index.backend(), rowid)?;
        }
        self.index.delete_all(&self.config)?;
        DocumentStore::write_averages(
            self.index.backend(),
            &Averages::new(self.config.column_count()),
        )
    }

    /// Discard the index and re-tokenize every content row. Needed
    /// after a tokenizer change.
    pub fn rebuild(&mut self) -> Result<()> {
        let rows = DocumentStore::scan_rows(self.index.backend())?;
        self.index.delete_all(&self.config)?;
        let mut averages = Averages::new(self.config.column_count());
        for (rowid, values) in &rows {
            let refs: Vec<&str> = values.iter().map(String::as_str).collect();
            let columns = self.tokenize_columns(&refs)?;
            self.index.begin_row(&self.config, *rowid)?;
            let mut counts = Vec::with_capacity(columns.len());
            for (col, tokens) in columns.iter().enumerate() {
                counts.push(tokens.len() as u64);
                for (text, pos) in tokens {
                    self.index
                        .write_token(&self.config, *rowid, col as u32, *pos, text);
                }
            }
            DocumentStore::write_docsize(self.index.backend(), *rowid, &counts)?;
            averages.n_row += 1;
            for (col, &c) in counts.iter().enumerate() {
                averages.col_tokens[col] += c;
            }
        }
        DocumentStore::write_averages(self.index.backend(), &averages)?;
        self.sync()
    }

    /// XOR checksum of every surviving index posting.
    pub fn checksum(&self) -> Result<u64> {
        self.index.checksum()
    }

    /// Vocabulary statistics, row form: `(term, docs, hits)` per term.
    pub fn vocab(&self) -> Result<Vec<crate::index::vocab::TermStats>> {
        crate::index::vocab::term_stats(&self.index)
    }

    /// Vocabulary statistics, column form: per `(term, column)` pair.
    pub fn vocab_cols(&self) -> Result<Vec<crate::index::vocab::TermColStats>> {
        crate::index::vocab::term_col_stats(&self.index)
    }

    /// Human-readable disassembly of one stored index record; pair of
    /// the debug scalar functions (`decode`, `compose_rowid`).
    pub fn decode_record(&self, id: Rowid) -> Result<String> {
        let record = self
            .index
            .backend()
            .data_read(id)?
            .ok_or_else(|| Error::corrupt(&format!("no data record {}", id)))?;
        crate::index::decode::decode_record(id, &record)
    }

    /// Checksum computed from stored content by re-tokenizing every
    /// row, covering the main index and each prefix index.
    fn content_checksum(&self) -> Result<u64> {
        let mut cksum = 0u64;
        for (rowid, values) in DocumentStore::scan_rows(self.index.backend())? {
            for (col, text) in values.iter().enumerate() {
                for (token, pos) in tokenize_to_vec(self.tokenizer.as_ref(), text)? {
                    let bytes = token.as_bytes();
                    cksum ^= entry_cksum(rowid, col as u32, pos, 0, bytes);
                    for (i, &n_chars) in self.config.prefixes.iter().enumerate() {
                        if let Some(n_bytes) = char_prefix_len(&token, n_chars) {
                            cksum ^= entry_cksum(rowid, col as u32, pos, i + 1, &bytes[..n_bytes]);
                        }
                    }
                }
            }
        }
        Ok(cksum)
    }

    /// Verify the whole table: index structure and formats, the
    /// index/content checksum equation, per-row docsize records and the
    /// averages record.
    pub fn integrity_check(&self) -> Result<()> {
        let expected = self.content_checksum()?;
        self.index.integrity_check(expected)?;

        let n_col = self.config.column_count();
        for (rowid, values) in DocumentStore::scan_rows(self.index.backend())? {
            let stored = DocumentStore::read_docsize(self.index.backend(), rowid, n_col)?
                .ok_or_else(|| Error::corrupt("docsize record missing"))?;
            for (col, text) in values.iter().enumerate() {
                let n = tokenize_to_vec(self.tokenizer.as_ref(), text)?.len() as u64;
                if stored[col] != n {
                    return Err(Error::corrupt("docsize disagrees with content"));
                }
            }
        }
        let stored = self.averages()?;
        let recounted =
            DocumentStore::recount_averages(self.index.backend(), n_col)?;
        if stored != recounted {
            return Err(Error::corrupt("averages record out of date"));
        }
        Ok(())
    }

    /// Change the target page size for future leaves.
    pub fn set_pgsz(&mut self, pgsz: usize) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&pgsz) {
            return Err(Error::config(format!("pgsz out of range: {}", pgsz)));
        }
        self.config.page_size = pgsz;
        self.apply_config_change()
    }

    pub fn set_automerge(&mut self, automerge: usize) -> Result<()> {
        let parsed = IndexConfig::parse(&["c", &format!("automerge={}", automerge)])?;
        self.config.automerge = parsed.automerge;
        self.apply_config_change()
    }

    pub fn set_crisismerge(&mut self, crisis: usize) -> Result<()> {
        let parsed = IndexConfig::parse(&["c", &format!("crisismerge={}", crisis)])?;
        self.config.crisis_merge = parsed.crisis_merge;
        self.apply_config_change()
    }

    pub fn set_hashsize(&mut self, hashsize: usize) -> Result<()> {
        self.config.hash_size = hashsize;
        self.apply_config_change()
    }

    pub fn set_rank(&mut self, rank: &str) -> Result<()> {
        self.config.rank = parse_rank(rank)?;
        self.apply_config_change()
    }

    fn apply_config_change(&mut self) -> Result<()> {
        self.config.bump_cookie();
        persist_config(self.index.backend(), &self.config)?;
        self.index.write_structure(&self.config)
    }
}

fn persist_config(backend: &dyn StorageBackend, config: &IndexConfig) -> Result<()> {
    backend.config_set("version", &FORMAT_VERSION.to_string())?;
    backend.config_set("rank", &config.rank.to_directive())?;
    let raw = serde_json::to_string(config)
        .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?;
    backend.config_set("config", &raw)
}

fn load_config(backend: &dyn StorageBackend) -> Result<IndexConfig> {
    let version: u32 = backend
        .config_get("version")?
        .ok_or_else(|| Error::corrupt("config version missing"))?
        .parse()
        .map_err(|_| Error::corrupt("config version malformed"))?;
    if version != FORMAT_VERSION {
        return Err(Error::corrupt("unsupported format version"));
    }
    let raw = backend
        .config_get("config")?
        .ok_or_else(|| Error::corrupt("config record missing"))?;
    let mut config: IndexConfig = serde_json::from_str(&raw)
        .map_err(|e| Error::corrupt(&format!("config record malformed: {}", e)))?;
    if let Some(rank) = backend.config_get("rank")? {
        config.rank = parse_rank(&rank)?;
    }
    Ok(config)
}

/// An open query cursor plus the auxiliary-function state that rides
/// with it (per-function auxdata, the per-row instance cache).
pub struct Cursor<'a> {
    db: &'a Database,
    inner: MatchCursor<'a>,
    aux_data: HashMap<&'static str, Box<dyn Any + Send>>,
    inst_cache: Option<Vec<Instance>>,
}

impl<'a> Cursor<'a> {
    pub fn eof(&self) -> bool {
        self.inner.eof
    }

    pub fn rowid(&self) -> Rowid {
        self.inner.rowid
    }

    pub fn next(&mut self) -> Result<()> {
        self.inst_cache = None;
        self.inner.next()
    }

    pub fn collect_rowids(mut self) -> Result<Vec<Rowid>> {
        let mut out = Vec::new();
        while !self.eof() {
            out.push(self.rowid());
            self.next()?;
        }
        Ok(out)
    }

    pub fn column_text(&mut self, col: usize) -> Result<String> {
        let mut frame = AuxFrame {
            cursor: self,
            fn_name: "column_text",
        };
        frame.column_text(col)
    }

    /// Evaluate the configured rank function for the current row.
    pub fn rank(&mut self) -> Result<f64> {
        let spec = self.db.config.rank.clone();
        match spec.name.as_str() {
            "bm25" => {
                let mut frame = AuxFrame {
                    cursor: self,
                    fn_name: "bm25",
                };
                bm25(&mut frame, &spec.args)
            }
            other => Err(Error::query(format!("unknown rank function: {}", other))),
        }
    }

    pub fn snippet(
        &mut self,
        col: Option<usize>,
        open: &str,
        close: &str,
        ellipsis: &str,
        n_token: usize,
    ) -> Result<String> {
        let mut frame = AuxFrame {
            cursor: self,
            fn_name: "snippet",
        };
        snippet::snippet(&mut frame, col, open, close, ellipsis, n_token)
    }

    pub fn highlight(&mut self, col: usize, open: &str, close: &str) -> Result<String> {
        let mut frame = AuxFrame {
            cursor: self,
            fn_name: "highlight",
        };
        highlight::highlight(&mut frame, col, open, close)
    }

    fn instances(&mut self) -> Result<&Vec<Instance>> {
        if self.inst_cache.is_none() {
            let mut all = Vec::new();
            for phrase in 0..self.inner.phrase_count() {
                let poslist = self.inner.phrase_poslist(phrase);
                for p in crate::compression::poslist::PoslistReader::new(poslist) {
                    all.push(Instance {
                        phrase,
                        col: p.col(),
                        off: p.offset(),
                    });
                }
            }
            all.sort_by(|a, b| (a.col, a.off, a.phrase).cmp(&(b.col, b.off, b.phrase)));
            self.inst_cache = Some(all);
        }
        Ok(self.inst_cache.as_ref().unwrap())
    }
}

/// The view of a cursor handed to one auxiliary function invocation.
struct AuxFrame<'c, 'a> {
    cursor: &'c mut Cursor<'a>,
    fn_name: &'static str,
}

impl<'c, 'a> AuxContext for AuxFrame<'c, 'a> {
    fn column_count(&self) -> usize {
        self.cursor.db.config.column_count()
    }

    fn row_count(&mut self) -> Result<u64> {
        Ok(self.cursor.db.averages()?.n_row)
    }

    fn column_total_size(&mut self, col: Option<usize>) -> Result<u64> {
        let averages = self.cursor.db.averages()?;
        Ok(match col {
            Some(c) => *averages.col_tokens.get(c).unwrap_or(&0),
            None => averages.col_tokens.iter().sum(),
        })
    }

    fn column_avg_size(&mut self, col: Option<usize>) -> Result<u64> {
        let averages = self.cursor.db.averages()?;
        let total = match col {
            Some(c) => *averages.col_tokens.get(c).unwrap_or(&0),
            None => averages.col_tokens.iter().sum(),
        };
        Ok(total / averages.n_row.max(1))
    }

    fn tokenize(
        &self,
        text: &str,
        sink: &mut dyn FnMut(crate::analysis::token::Token<'_>) -> Result<()>,
    ) -> Result<()> {
        self.cursor.db.tokenizer.tokenize(text, sink)
    }

    fn phrase_count(&self) -> usize {
        self.cursor.inner.phrase_count()
    }

    fn phrase_size(&self, phrase: usize) -> usize {
        self.cursor.inner.phrase_size(phrase)
    }

    fn rowid(&self) -> Rowid {
        self.cursor.inner.rowid
    }

    fn column_text(&mut self, col: usize) -> Result<String> {
        let rowid = self.cursor.inner.rowid;
        let row = DocumentStore::read_row(self.cursor.db.index.backend(), rowid)?
            .ok_or_else(|| Error::corrupt("content row missing for matched rowid"))?;
        row.get(col)
            .cloned()
            .ok_or_else(|| Error::query(format!("column {} out of range", col)))
    }

    fn column_size(&mut self, col: Option<usize>) -> Result<u64> {
        let rowid = self.cursor.inner.rowid;
        let n_col = self.cursor.db.config.column_count();
        let counts = DocumentStore::read_docsize(self.cursor.db.index.backend(), rowid, n_col)?
            .ok_or_else(|| Error::corrupt("docsize missing for matched rowid"))?;
        Ok(match col {
            Some(c) => *counts.get(c).unwrap_or(&0),
            None => counts.iter().sum(),
        })
    }

    fn inst_count(&mut self) -> Result<usize> {
        Ok(self.cursor.instances()?.len())
    }

    fn inst(&mut self, i: usize) -> Result<Instance> {
        self.cursor
            .instances()?
            .get(i)
            .copied()
            .ok_or_else(|| Error::query(format!("instance {} out of range", i)))
    }

    fn poslist(&mut self, phrase: usize) -> Result<Vec<u8>> {
        Ok(self.cursor.inner.phrase_poslist(phrase).to_vec())
    }

    fn query_phrase(
        &mut self,
        phrase: usize,
        visitor: &mut dyn FnMut(Rowid) -> Result<()>,
    ) -> Result<()> {
        let def = self
            .cursor
            .inner
            .query
            .phrases
            .get(phrase)
            .ok_or_else(|| Error::query(format!("phrase {} out of range", phrase)))?
            .clone();
        let mut stream = open_phrase(
            &self.cursor.db.index,
            &self.cursor.db.config,
            &def,
            false,
        )?;
        while !stream.eof {
            visitor(stream.rowid)?;
            stream.advance()?;
        }
        Ok(())
    }

    fn set_auxdata(&mut self, data: Box<dyn Any + Send>) {
        self.cursor.aux_data.insert(self.fn_name, data);
    }

    fn get_auxdata(&mut self) -> Option<&mut Box<dyn Any + Send>> {
        self.cursor.aux_data.get_mut(self.fn_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemBackend;
    use crate::storage::file::FileBackend;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn db(args: &[&str]) -> Database {
        Database::create(Box::new(MemBackend::new()), args).unwrap()
    }

    fn rowids(db: &Database, expr: &str) -> Vec<Rowid> {
        db.query(expr).unwrap().collect_rowids().unwrap()
    }

    fn rowids_desc(db: &Database, expr: &str) -> Vec<Rowid> {
        db.query_desc(expr).unwrap().collect_rowids().unwrap()
    }

    #[test]
    fn test_single_column_insert_and_match() {
        let mut db = db(&["content"]);
        db.insert(1, &["the quick brown fox"]).unwrap();

        let cursor = db.query("quick").unwrap();
        assert!(!cursor.eof());
        assert_eq!(cursor.rowid(), 1);
        // Poslist of the only phrase: column 0, offset 1.
        let positions: Vec<(u32, u32)> =
            crate::compression::poslist::PoslistReader::new(cursor.inner.phrase_poslist(0))
                .map(|p| (p.col(), p.offset()))
                .collect();
        assert_eq!(positions, vec![(0, 1)]);
    }

    #[test]
    fn test_ordering_and_booleans() {
        let mut db = db(&["t"]);
        db.insert(1, &["a b c"]).unwrap();
        db.insert(2, &["a b d"]).unwrap();
        db.insert(3, &["c d e"]).unwrap();

        assert_eq!(rowids(&db, "a"), vec![1, 2]);
        assert_eq!(rowids_desc(&db, "a"), vec![2, 1]);
        assert_eq!(rowids(&db, "b"), vec![1, 2]);
        assert_eq!(rowids(&db, "x"), Vec::<Rowid>::new());
        assert_eq!(rowids(&db, "c AND d"), vec![3]);
        assert_eq!(rowids(&db, "c NOT d"), vec![1]);
    }

    #[test]
    fn test_prefix_index_equivalence() {
        let mut db = db(&["t", "prefix=2,3"]);
        db.insert(1, &["alphabet"]).unwrap();
        db.insert(2, &["beta"]).unwrap();
        assert_eq!(rowids(&db, "al*"), vec![1]);
        // Same result through the unindexed scan path.
        let scan = db.index.prefix_doclist_scan(b"al").unwrap();
        let mut r = crate::index::doclist::DoclistReader::new(&scan);
        assert!(r.next());
        assert_eq!(r.rowid, 1);
        assert!(!r.next());
        // And the same for a length no prefix index covers.
        assert_eq!(rowids(&db, "alph*"), vec![1]);
    }

    #[test]
    fn test_bulk_small_pages_checksum_and_optimize() {
        let mut db = Database::create(
            Box::new(MemBackend::new()),
            &["t", "pgsz=64", "hashsize=4096"],
        )
        .unwrap();
        let words = [
            "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
            "juliet", "kilo", "lima",
        ];
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for rowid in 1..=400i64 {
            let text: Vec<&str> = (0..5).map(|_| words[rng.gen_range(0..words.len())]).collect();
            db.insert(rowid, &[&text.join(" ")]).unwrap();
        }
        db.sync().unwrap();
        let before = db.checksum().unwrap();
        db.integrity_check().unwrap();
        assert!(db.index.structure.n_segments() >= 1);

        db.optimize().unwrap();
        assert_eq!(db.index.structure.n_segments(), 1);
        assert_eq!(db.checksum().unwrap(), before);
        db.integrity_check().unwrap();

        // Every word still resolves to the same docset after optimize.
        for w in &words {
            let n = rowids(&db, w).len();
            assert!(n > 0, "word {} vanished", w);
        }
    }

    #[test]
    fn test_delete_half_commit_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sdm");
        let mut survivors = Vec::new();
        {
            let backend = FileBackend::open(&path).unwrap();
            let mut db = Database::create(Box::new(backend), &["t"]).unwrap();
            for rowid in 1..=100i64 {
                db.insert(rowid, &[&format!("doc word{}", rowid)]).unwrap();
            }
            let mut rng = StdRng::seed_from_u64(7);
            for rowid in 1..=100i64 {
                if rng.gen_bool(0.5) {
                    db.delete(rowid).unwrap();
                } else {
                    survivors.push(rowid);
                }
            }
            db.commit().unwrap();
        }
        let backend = FileBackend::open(&path).unwrap();
        let db = Database::open(Box::new(backend)).unwrap();
        assert_eq!(rowids(&db, "doc"), survivors);
        assert_eq!(db.row_count().unwrap(), survivors.len() as u64);
        db.integrity_check().unwrap();
    }

    #[test]
    fn test_bm25_ranks_double_match_first() {
        let mut db = db(&["t"]);
        db.insert(1, &["quick brown fox"]).unwrap();
        for rowid in 2..=100i64 {
            let text = if rowid % 2 == 0 {
                "quick red squirrel jumping"
            } else {
                "slow brown snail crawling"
            };
            db.insert(rowid, &[text]).unwrap();
        }
        // Every row matches one term; only row 1 matches both.
        let ranked = db.query_ranked("quick OR brown", 10).unwrap();
        assert_eq!(ranked.len(), 10);
        assert_eq!(ranked[0].0, 1);
        assert!(ranked[0].1 < ranked[1].1);
        // The AND form returns just the double match.
        assert_eq!(rowids(&db, "quick brown"), vec![1]);
    }

    #[test]
    fn test_snippet_and_highlight() {
        let mut db = db(&["t"]);
        db.insert(1, &["one two three quick brown five six seven eight nine ten"])
            .unwrap();
        let mut cursor = db.query("\"quick brown\"").unwrap();
        assert!(!cursor.eof());
        assert!(cursor.column_text(0).unwrap().starts_with("one two"));
        let hl = cursor.highlight(0, "[", "]").unwrap();
        assert_eq!(
            hl,
            "one two three [quick brown] five six seven eight nine ten"
        );
        let snip = cursor.snippet(None, "[", "]", "...", 5).unwrap();
        assert!(snip.contains("[quick brown]"), "snippet: {}", snip);
        assert!(snip.len() < hl.len());
    }

    #[test]
    fn test_update_and_idempotent_delete() {
        let mut db = db(&["t"]);
        db.insert(1, &["old words here"]).unwrap();
        db.update(1, &["new words here"]).unwrap();
        assert_eq!(rowids(&db, "old"), Vec::<Rowid>::new());
        assert_eq!(rowids(&db, "new"), vec![1]);

        db.delete(99).unwrap(); // absent: no-op
        db.delete(1).unwrap();
        db.delete(1).unwrap(); // second delete: no-op
        assert_eq!(rowids(&db, "new"), Vec::<Rowid>::new());
        assert_eq!(db.row_count().unwrap(), 0);
        db.integrity_check().unwrap();
    }

    #[test]
    fn test_rollback_discards_writes() {
        let mut db = db(&["t"]);
        db.insert(1, &["kept row"]).unwrap();
        db.commit().unwrap();
        db.begin().unwrap();
        db.insert(2, &["dropped row"]).unwrap();
        db.rollback().unwrap();
        assert_eq!(rowids(&db, "kept"), vec![1]);
        assert_eq!(rowids(&db, "dropped"), Vec::<Rowid>::new());
        db.integrity_check().unwrap();
    }

    #[test]
    fn test_rebuild_and_delete_all() {
        let mut db = db(&["t"]);
        for rowid in 1..=20i64 {
            db.insert(rowid, &[&format!("common word{}", rowid)]).unwrap();
        }
        db.sync().unwrap();
        db.rebuild().unwrap();
        assert_eq!(rowids(&db, "common").len(), 20);
        db.integrity_check().unwrap();

        db.delete_all().unwrap();
        assert_eq!(rowids(&db, "common"), Vec::<Rowid>::new());
        assert_eq!(db.row_count().unwrap(), 0);
        db.integrity_check().unwrap();
    }

    #[test]
    fn test_config_changes_bump_cookie() {
        let mut db = db(&["t"]);
        let cookie = db.config().cookie;
        db.set_pgsz(128).unwrap();
        assert_eq!(db.config().page_size, 128);
        assert!(db.config().cookie != cookie);
        db.set_automerge(0).unwrap();
        assert_eq!(db.config().automerge, 0);
        db.set_crisismerge(8).unwrap();
        assert_eq!(db.config().crisis_merge, 8);
        db.set_hashsize(64 * 1024).unwrap();
        assert_eq!(db.config().hash_size, 64 * 1024);
        db.set_rank("bm25(1.4, 0.9)").unwrap();
        assert_eq!(db.config().rank.args, vec!["1.4", "0.9"]);
        assert!(db.set_pgsz(16).is_err());
        // The persisted cookie still matches: inserts keep working.
        db.insert(1, &["still works"]).unwrap();
        assert_eq!(rowids(&db, "works"), vec![1]);
    }

    #[test]
    fn test_insert_existing_rowid_fails() {
        let mut db = db(&["t"]);
        db.insert(1, &["a"]).unwrap();
        assert!(db.insert(1, &["b"]).is_err());
        assert!(db.insert(2, &["a", "b"]).is_err()); // wrong arity
    }

    #[test]
    fn test_porter_tokenizer_via_config() {
        let mut db = db(&["t", "tokenize=porter"]);
        db.insert(1, &["running dogs"]).unwrap();
        // Query terms are stemmed the same way.
        assert_eq!(rowids(&db, "run"), vec![1]);
        assert_eq!(rowids(&db, "runs"), vec![1]);
        db.integrity_check().unwrap();
    }

    #[test]
    fn test_crisis_merge_bounds_segment_count() {
        let mut db = Database::create(
            Box::new(MemBackend::new()),
            &["t", "pgsz=64", "automerge=0", "crisismerge=4"],
        )
        .unwrap();
        for rowid in 1..=40i64 {
            db.insert(rowid, &[&format!("filler text number{}", rowid)]).unwrap();
            db.sync().unwrap(); // one level-0 segment per row
        }
        assert!(db.index.structure.levels[0].segments.len() < 4);
        db.integrity_check().unwrap();
        assert_eq!(rowids(&db, "filler").len(), 40);
    }

    #[test]
    fn test_vocab_and_decode() {
        let mut db = db(&["a", "b"]);
        db.insert(1, &["apple apple", "pear"]).unwrap();
        db.insert(2, &["apple", ""]).unwrap();
        db.sync().unwrap();

        let vocab = db.vocab().unwrap();
        assert_eq!(vocab.len(), 2);
        assert_eq!(vocab[0].term, b"apple");
        assert_eq!((vocab[0].n_doc, vocab[0].n_hit), (2, 3));
        assert_eq!(vocab[1].term, b"pear");
        assert_eq!((vocab[1].n_doc, vocab[1].n_hit), (1, 1));

        let cols = db.vocab_cols().unwrap();
        // apple appears only in column 0, pear only in column 1.
        assert_eq!(cols.len(), 2);
        assert_eq!((cols[0].term.as_slice(), cols[0].col), (&b"apple"[..], 0));
        assert_eq!(cols[0].n_hit, 3);
        assert_eq!((cols[1].term.as_slice(), cols[1].col), (&b"pear"[..], 1));

        let structure = db
            .decode_record(crate::index::record::STRUCTURE_ID)
            .unwrap();
        assert!(structure.contains("level 0"));
        let averages = db
            .decode_record(crate::index::record::AVERAGES_ID)
            .unwrap();
        assert!(averages.contains("rows=2"));
        // Decode the first leaf of the only segment.
        let seg = db.index.structure.levels[0].segments[0].clone();
        let leaf = db
            .decode_record(crate::index::decode::compose_rowid("segment", seg.segid, 0, 1).unwrap())
            .unwrap();
        assert!(leaf.contains("term \"0apple\""), "leaf: {}", leaf);
    }

    #[test]
    fn test_automerge_keeps_scans_intact() {
        let mut db = Database::create(
            Box::new(MemBackend::new()),
            &["t", "pgsz=64", "hashsize=512"],
        )
        .unwrap();
        for rowid in 1..=300i64 {
            db.insert(rowid, &[&format!("shared unique{} extra words", rowid)])
                .unwrap();
        }
        db.sync().unwrap();
        assert_eq!(rowids(&db, "shared").len(), 300);
        for rowid in [1i64, 57, 300] {
            assert_eq!(rowids(&db, &format!("unique{}", rowid)), vec![rowid]);
        }
        db.integrity_check().unwrap();
    }
}
