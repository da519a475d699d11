use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sediment::{Database, MemBackend};

fn bench_insert(c: &mut Criterion) {
    c.bench_function("insert_100_rows", |b| {
        b.iter(|| {
            let mut db =
                Database::create(Box::new(MemBackend::new()), &["body", "pgsz=1000"]).unwrap();
            for rowid in 1..=100i64 {
                db.insert(
                    rowid,
                    &[&format!("the quick brown fox number{} jumps over", rowid)],
                )
                .unwrap();
            }
            db.sync().unwrap();
            black_box(db);
        })
    });
}

fn bench_query(c: &mut Criterion) {
    let mut db = Database::create(Box::new(MemBackend::new()), &["body"]).unwrap();
    for rowid in 1..=1000i64 {
        db.insert(
            rowid,
            &[&format!("common filler text item{} trailing words", rowid)],
        )
        .unwrap();
    }
    db.sync().unwrap();

    c.bench_function("term_query_1000_docs", |b| {
        b.iter(|| {
            let hits = db
                .query("common")
                .unwrap()
                .collect_rowids()
                .unwrap();
            black_box(hits.len());
        })
    });

    c.bench_function("ranked_query_1000_docs", |b| {
        b.iter(|| {
            let hits = db.query_ranked("filler common", 10).unwrap();
            black_box(hits);
        })
    });
}

criterion_group!(benches, bench_insert, bench_query);
criterion_main!(benches);
