// Minimal walkthrough of the sediment API: create a table, add rows,
// run plain / ranked / decorated queries.
//
// Build as a demo binary: copy next to a Cargo project depending on
// sediment, or adapt into an integration test.

use sediment::{Database, MemBackend, Result};

fn main() -> Result<()> {
    let mut db = Database::create(
        Box::new(MemBackend::new()),
        &["title", "body", "prefix=2,3", "tokenize=porter"],
    )?;

    db.insert(1, &["Rust in practice", "systems programming with safe abstractions"])?;
    db.insert(2, &["Search engines", "building inverted indexes for full-text search"])?;
    db.insert(3, &["Database internals", "b-trees, write-ahead logs and storage engines"])?;
    db.commit()?;

    println!("rows matching 'search':");
    for rowid in db.query("search")?.collect_rowids()? {
        println!("  rowid {}", rowid);
    }

    println!("ranked for 'storage engines':");
    for (rowid, score) in db.query_ranked("storage engines", 5)? {
        println!("  rowid {} score {:.4}", rowid, score);
    }

    let mut cursor = db.query("invert*")?;
    while !cursor.eof() {
        let text = cursor.highlight(1, "<b>", "</b>")?;
        println!("highlight: {}", text);
        cursor.next()?;
    }

    db.integrity_check()?;
    Ok(())
}
