use crate::core::error::Result;
use crate::search::api::{AuxContext, Instance};
use crate::search::highlight::{coalesced_ranges, token_spans};

/// Score awarded per distinct phrase present in a candidate window;
/// additional hits of already-counted phrases add one each.
const PHRASE_SCORE: u64 = 1000;

/// Render the best window of `n_token` tokens around the current row's
/// matches:
///
/// 1. pick the column (highest-scoring one unless `col` is given);
/// 2. pick the window holding the highest-scoring coalesced match set;
/// 3. shift the window left so the first match is not flush against
///    its edge;
/// 4. re-tokenize the stored text once to recover byte offsets and
///    emit `ellipsis`/`open`/`close` decorated text.
pub fn snippet(
    ctx: &mut dyn AuxContext,
    col: Option<usize>,
    open: &str,
    close: &str,
    ellipsis: &str,
    n_token: usize,
) -> Result<String> {
    let n_token = n_token.max(1);
    let n_inst = ctx.inst_count()?;
    let mut instances = Vec::with_capacity(n_inst);
    for i in 0..n_inst {
        instances.push(ctx.inst(i)?);
    }

    let cols: Vec<usize> = match col {
        Some(c) => vec![c],
        None => {
            let mut cols: Vec<usize> = instances.iter().map(|i| i.col as usize).collect();
            cols.sort_unstable();
            cols.dedup();
            if cols.is_empty() { vec![0] } else { cols }
        }
    };

    // Best (score, col, anchor) over every instance-anchored window.
    let mut best: Option<(u64, usize, u32)> = None;
    for &c in &cols {
        let in_col: Vec<&Instance> = instances
            .iter()
            .filter(|i| i.col as usize == c)
            .collect();
        for anchor in &in_col {
            let w_start = anchor.off;
            let w_end = w_start + n_token as u32;
            let mut seen_phrases = Vec::new();
            let mut score = 0u64;
            for inst in &in_col {
                let end = inst.off + ctx.phrase_size(inst.phrase) as u32;
                if inst.off >= w_start && end <= w_end {
                    if seen_phrases.contains(&inst.phrase) {
                        score += 1;
                    } else {
                        seen_phrases.push(inst.phrase);
                        score += PHRASE_SCORE;
                    }
                }
            }
            if best.map_or(true, |(s, ..)| score > s) {
                best = Some((score, c, w_start));
            }
        }
    }

    let (col, anchor) = match best {
        Some((_, c, a)) => (c, a),
        None => (cols[0], 0),
    };
    let col_tokens = ctx.column_size(Some(col))? as usize;

    // Shift so the first match is not flush against the left edge.
    let last_end = instances
        .iter()
        .filter(|i| i.col as usize == col)
        .map(|i| i.off + ctx.phrase_size(i.phrase) as u32)
        .filter(|&e| e <= anchor + n_token as u32)
        .max()
        .unwrap_or(anchor);
    let slack = (n_token as u32).saturating_sub(last_end.saturating_sub(anchor));
    let mut start = anchor.saturating_sub(slack / 2) as usize;
    if start + n_token > col_tokens {
        start = col_tokens.saturating_sub(n_token);
    }
    let end = (start + n_token).min(col_tokens);

    let text = ctx.column_text(col)?;
    let spans = token_spans(ctx, &text)?;
    if spans.is_empty() {
        return Ok(String::new());
    }
    let s_byte = spans.get(start).map_or(0, |s| s.0);
    let e_byte = spans.get(end.saturating_sub(1)).map_or(text.len(), |s| s.1);

    let mut out = String::new();
    if start > 0 {
        out.push_str(ellipsis);
    }
    let mut cursor = s_byte;
    for (r_start, r_end) in coalesced_ranges(ctx, col)? {
        if (r_start as usize) < start || r_end as usize > end {
            continue;
        }
        let Some(&(rs_byte, _)) = spans.get(r_start as usize) else {
            continue;
        };
        let Some(&(_, re_byte)) = spans.get(r_end as usize - 1) else {
            continue;
        };
        if rs_byte < cursor {
            continue;
        }
        out.push_str(&text[cursor..rs_byte]);
        out.push_str(open);
        out.push_str(&text[rs_byte..re_byte]);
        out.push_str(close);
        cursor = re_byte;
    }
    out.push_str(&text[cursor..e_byte]);
    if end < col_tokens {
        out.push_str(ellipsis);
    }
    Ok(out)
}
