use crate::core::error::Result;
use crate::search::api::{AuxContext, Instance};

/// Token ranges `[start, end)` of every phrase instance in `col`,
/// coalesced: instances whose ranges overlap are unioned into one.
pub fn coalesced_ranges(
    ctx: &mut dyn AuxContext,
    col: usize,
) -> Result<Vec<(u32, u32)>> {
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    let n = ctx.inst_count()?;
    for i in 0..n {
        let Instance { phrase, col: c, off } = ctx.inst(i)?;
        if c as usize != col {
            continue;
        }
        let end = off + ctx.phrase_size(phrase) as u32;
        match ranges.last_mut() {
            Some((_, last_end)) if off <= *last_end => {
                *last_end = (*last_end).max(end);
            }
            _ => ranges.push((off, end)),
        }
    }
    Ok(ranges)
}

/// Byte span of each token position in `text`.
pub fn token_spans(
    ctx: &dyn AuxContext,
    text: &str,
) -> Result<Vec<(usize, usize)>> {
    let mut spans = Vec::new();
    ctx.tokenize(text, &mut |t| {
        spans.push((t.start, t.end));
        Ok(())
    })?;
    Ok(spans)
}

/// Wrap every coalesced phrase instance of the current row's `col` in
/// `open`/`close`, re-tokenizing the stored text once to recover byte
/// offsets.
pub fn highlight(
    ctx: &mut dyn AuxContext,
    col: usize,
    open: &str,
    close: &str,
) -> Result<String> {
    let text = ctx.column_text(col)?;
    let ranges = coalesced_ranges(ctx, col)?;
    let spans = token_spans(ctx, &text)?;

    let mut out = String::with_capacity(text.len() + ranges.len() * (open.len() + close.len()));
    let mut cursor = 0usize;
    for (start, end) in ranges {
        let Some(&(s_byte, _)) = spans.get(start as usize) else {
            continue;
        };
        let Some(&(_, e_byte)) = spans.get(end as usize - 1) else {
            continue;
        };
        if s_byte < cursor {
            continue;
        }
        out.push_str(&text[cursor..s_byte]);
        out.push_str(open);
        out.push_str(&text[s_byte..e_byte]);
        out.push_str(close);
        cursor = e_byte;
    }
    out.push_str(&text[cursor..]);
    Ok(out)
}
