use crate::compression::poslist::PoslistReader;
use crate::core::error::Result;
use crate::search::api::AuxContext;

pub const DEFAULT_K1: f64 = 1.2;
pub const DEFAULT_B: f64 = 0.75;

/// Per-query state computed on the first invocation and kept in the
/// cursor's auxdata slot.
struct Bm25Data {
    idf: Vec<f64>,
    avgdl: f64,
    k1: f64,
    b: f64,
}

fn build_data(ctx: &mut dyn AuxContext, args: &[String]) -> Result<Bm25Data> {
    let k1 = args
        .first()
        .and_then(|a| a.parse().ok())
        .unwrap_or(DEFAULT_K1);
    let b = args
        .get(1)
        .and_then(|a| a.parse().ok())
        .unwrap_or(DEFAULT_B);
    let n_row = ctx.row_count()? as f64;
    let total = ctx.column_total_size(None)? as f64;
    let avgdl = if n_row > 0.0 { total / n_row } else { 1.0 };

    let mut idf = Vec::with_capacity(ctx.phrase_count());
    for phrase in 0..ctx.phrase_count() {
        let mut n_hit = 0u64;
        ctx.query_phrase(phrase, &mut |_rowid| {
            n_hit += 1;
            Ok(())
        })?;
        let value = ((n_row - n_hit as f64 + 0.5) / (n_hit as f64 + 0.5)).ln();
        idf.push(value.max(1e-6));
    }
    Ok(Bm25Data { idf, avgdl, k1, b })
}

/// BM25 rank: `sum(idf_i * f_i / (f_i + k1 (1 - b + b D/avgdl)))`,
/// negated so that more relevant rows sort first ascending.
pub fn bm25(ctx: &mut dyn AuxContext, args: &[String]) -> Result<f64> {
    let have = ctx
        .get_auxdata()
        .is_some_and(|d| d.downcast_ref::<Bm25Data>().is_some());
    if !have {
        let data = build_data(ctx, args)?;
        ctx.set_auxdata(Box::new(data));
    }
    let d = ctx.column_size(None)? as f64;
    let (idf, avgdl, k1, b) = {
        let data = ctx
            .get_auxdata()
            .and_then(|d| d.downcast_ref::<Bm25Data>())
            .expect("bm25 auxdata just installed");
        (data.idf.clone(), data.avgdl, data.k1, data.b)
    };

    let mut score = 0.0;
    for (phrase, idf) in idf.iter().enumerate() {
        let poslist = ctx.poslist(phrase)?;
        let freq = PoslistReader::new(&poslist).count() as f64;
        if freq > 0.0 {
            score += idf * freq / (freq + k1 * (1.0 - b + b * d / avgdl));
        }
    }
    Ok(-score)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idf_shape() {
        // Rarer phrases must weigh more; the floor keeps common phrases
        // from going negative.
        let idf = |n: f64, hits: f64| ((n - hits + 0.5) / (hits + 0.5)).ln().max(1e-6);
        assert!(idf(100.0, 1.0) > idf(100.0, 10.0));
        assert_eq!(idf(100.0, 99.0), 1e-6);
    }
}
