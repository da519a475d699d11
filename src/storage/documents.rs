use crate::compression::varint::{put_varint, VarintReader};
use crate::core::error::{Error, Result};
use crate::core::types::Rowid;
use crate::index::record::{Averages, AVERAGES_ID};
use crate::storage::backend::StorageBackend;

/// The document-side stores that ride along with the inverted index:
/// original row text, per-row per-column token counts, and the averages
/// record BM25 normalizes against. All three are maintained
/// transactionally with inserts and deletes.
pub struct DocumentStore;

impl DocumentStore {
    pub fn write_row(backend: &dyn StorageBackend, rowid: Rowid, values: &[String]) -> Result<()> {
        let blob = bincode::serialize(values)?;
        backend.content_write(rowid, &blob)
    }

    pub fn read_row(backend: &dyn StorageBackend, rowid: Rowid) -> Result<Option<Vec<String>>> {
        match backend.content_read(rowid)? {
            Some(blob) => Ok(Some(bincode::deserialize(&blob)?)),
            None => Ok(None),
        }
    }

    pub fn delete_row(backend: &dyn StorageBackend, rowid: Rowid) -> Result<()> {
        backend.content_delete(rowid)
    }

    pub fn scan_rows(backend: &dyn StorageBackend) -> Result<Vec<(Rowid, Vec<String>)>> {
        let mut out = Vec::new();
        for (rowid, blob) in backend.content_scan()? {
            out.push((rowid, bincode::deserialize(&blob)?));
        }
        Ok(out)
    }

    /// Docsize blob: one varint token count per column.
    pub fn write_docsize(backend: &dyn StorageBackend, rowid: Rowid, counts: &[u64]) -> Result<()> {
        let mut blob = Vec::with_capacity(counts.len() * 2);
        for &c in counts {
            put_varint(&mut blob, c);
        }
        backend.docsize_write(rowid, &blob)
    }

    pub fn read_docsize(
        backend: &dyn StorageBackend,
        rowid: Rowid,
        n_col: usize,
    ) -> Result<Option<Vec<u64>>> {
        let Some(blob) = backend.docsize_read(rowid)? else {
            return Ok(None);
        };
        let mut r = VarintReader::new(&blob);
        let mut counts = Vec::with_capacity(n_col);
        for _ in 0..n_col {
            counts.push(r.u64()?);
        }
        if !r.eof() {
            return Err(Error::corrupt("trailing bytes in docsize record"));
        }
        Ok(Some(counts))
    }

    pub fn delete_docsize(backend: &dyn StorageBackend, rowid: Rowid) -> Result<()> {
        backend.docsize_delete(rowid)
    }

    pub fn read_averages(backend: &dyn StorageBackend, n_col: usize) -> Result<Averages> {
        match backend.data_read(AVERAGES_ID)? {
            Some(record) => Averages::decode(&record, n_col),
            None => Ok(Averages::new(n_col)),
        }
    }

    pub fn write_averages(backend: &dyn StorageBackend, averages: &Averages) -> Result<()> {
        backend.data_write(AVERAGES_ID, &averages.encode())
    }

    /// Recompute the averages record from the docsize table; integrity
    /// checking compares this against the stored record.
    pub fn recount_averages(backend: &dyn StorageBackend, n_col: usize) -> Result<Averages> {
        let mut averages = Averages::new(n_col);
        for (_, blob) in backend.docsize_scan()? {
            averages.n_row += 1;
            let mut r = VarintReader::new(&blob);
            for col in 0..n_col {
                averages.col_tokens[col] += r.u64()?;
            }
        }
        Ok(averages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemBackend;

    #[test]
    fn test_row_round_trip() {
        let backend = MemBackend::new();
        let values = vec!["hello world".to_string(), "second column".to_string()];
        DocumentStore::write_row(&backend, 5, &values).unwrap();
        assert_eq!(DocumentStore::read_row(&backend, 5).unwrap().unwrap(), values);
        assert!(DocumentStore::read_row(&backend, 6).unwrap().is_none());
        DocumentStore::delete_row(&backend, 5).unwrap();
        assert!(DocumentStore::read_row(&backend, 5).unwrap().is_none());
    }

    #[test]
    fn test_docsize_and_averages() {
        let backend = MemBackend::new();
        DocumentStore::write_docsize(&backend, 1, &[3, 7]).unwrap();
        DocumentStore::write_docsize(&backend, 2, &[5, 0]).unwrap();
        assert_eq!(
            DocumentStore::read_docsize(&backend, 1, 2).unwrap().unwrap(),
            vec![3, 7]
        );

        let recounted = DocumentStore::recount_averages(&backend, 2).unwrap();
        assert_eq!(recounted.n_row, 2);
        assert_eq!(recounted.col_tokens, vec![8, 7]);

        DocumentStore::write_averages(&backend, &recounted).unwrap();
        assert_eq!(
            DocumentStore::read_averages(&backend, 2).unwrap(),
            recounted
        );
    }
}
