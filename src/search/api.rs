use crate::analysis::token::Token;
use crate::core::error::Result;
use crate::core::types::Rowid;
use std::any::Any;

/// One phrase instance in the current row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instance {
    pub phrase: usize,
    pub col: u32,
    pub off: u32,
}

/// The stable callback surface handed to every auxiliary function
/// (ranking, snippet, highlight). Implemented by the cursor frame; the
/// callee never sees the cursor itself.
///
/// `set_auxdata` stores one value per auxiliary function per query; it
/// is dropped when the cursor closes. `query_phrase` runs a nested
/// match of one phrase of the current query and reports each matching
/// row, which is how BM25 counts document frequency.
pub trait AuxContext {
    fn column_count(&self) -> usize;

    fn row_count(&mut self) -> Result<u64>;

    /// Total tokens ever inserted into `col`, or across all columns.
    fn column_total_size(&mut self, col: Option<usize>) -> Result<u64>;

    /// Average tokens per row in `col`, or across all columns.
    fn column_avg_size(&mut self, col: Option<usize>) -> Result<u64>;

    fn tokenize(&self, text: &str, sink: &mut dyn FnMut(Token<'_>) -> Result<()>) -> Result<()>;

    fn phrase_count(&self) -> usize;

    fn phrase_size(&self, phrase: usize) -> usize;

    fn rowid(&self) -> Rowid;

    fn column_text(&mut self, col: usize) -> Result<String>;

    /// Tokens in the current row's `col`, or across all columns.
    fn column_size(&mut self, col: Option<usize>) -> Result<u64>;

    fn inst_count(&mut self) -> Result<usize>;

    fn inst(&mut self, i: usize) -> Result<Instance>;

    /// Size-prefix-free position list of `phrase` in the current row;
    /// empty when the phrase does not match this row.
    fn poslist(&mut self, phrase: usize) -> Result<Vec<u8>>;

    fn query_phrase(
        &mut self,
        phrase: usize,
        visitor: &mut dyn FnMut(Rowid) -> Result<()>,
    ) -> Result<()>;

    fn set_auxdata(&mut self, data: Box<dyn Any + Send>);

    fn get_auxdata(&mut self) -> Option<&mut Box<dyn Any + Send>>;
}
