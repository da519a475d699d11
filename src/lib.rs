pub mod analysis;
pub mod compression;
pub mod core;
pub mod index;
pub mod query;
pub mod scoring;
pub mod search;
pub mod storage;

pub use crate::core::config::IndexConfig;
pub use crate::core::database::{Cursor, Database};
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::types::{Position, Rowid};
pub use crate::storage::backend::{MemBackend, StorageBackend};
pub use crate::storage::file::FileBackend;

/*
SEDIMENT ARCHITECTURE

  Database (core/database.rs)
    ├── IndexConfig            columns, prefix lengths, tokenizer, pgsz,
    │                          automerge/crisismerge, rank, cookie
    ├── Tokenizer              analysis/: simple (unicode words), porter
    └── FtsIndex (index/index.rs)
          ├── StorageBackend   storage/: data, idx, docsize, content,
          │                    config tables; Mem + File backends
          ├── Structure        levels → segments (structure record, id 10)
          ├── PendingIndex     in-memory term → doclist accumulator
          ├── SegmentWriter    leaf pages, prefix-compressed terms,
          │                    doclist-indexes, idx separators, b-tree
          ├── SegmentIter      per-segment cursor: seek / next_from /
          │                    reverse, poslist stitching across leaves
          ├── MultiIter        loser tree over segments + pending
          └── MergeCtx         merge_level / automerge / crisis / optimize

  Query pipeline (query/)
    MATCH text → QueryParser → Expr over Phrases
    Phrase → TermStream per term (live merge or prefix doclist)
    MatchCursor solves the boolean tree document-at-a-time

  Extension surface (search/, scoring/)
    AuxContext callbacks → bm25, snippet, highlight

  Write path:  insert → tokenize → pending → flush → level-0 segment
               → automerge / crisis merge → leveled segments
  Read path:   phrase terms → multi-iterator over all segments +
               pending → (rowid, poslist) stream → rank callback
*/
