use crate::compression::varint::{get_varint, VarintReader};
use crate::core::error::{Error, Result};
use crate::index::record::{split_id, AVERAGES_ID, LEAF_HDR, STRUCTURE_ID};
use crate::index::structure::Structure;
use std::fmt::Write;

/// One item of an interior b-tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum InteriorItem {
    Term(Vec<u8>),
    NoTerm { n_empty: u64, dlidx: bool },
}

/// Decode an interior node: `varint(leftmostChild)` then a sequence of
/// `noTerm` (lead byte 0 or 1: dlidx bit, then varint count) and
/// `termEntry` (`varint(nPrefix+2) varint(nSuffix) suffix`) items. The
/// +2 bias keeps the two forms distinguishable by the lead byte.
pub fn parse_interior(data: &[u8]) -> Result<(u32, Vec<InteriorItem>)> {
    let mut r = VarintReader::new(data);
    let leftmost = r.u32()?;
    let mut items = Vec::new();
    let mut term: Vec<u8> = Vec::new();
    while !r.eof() {
        let lead = r.u64()?;
        if lead <= 1 {
            let n_empty = r.u64()?;
            items.push(InteriorItem::NoTerm {
                n_empty,
                dlidx: lead == 1,
            });
            continue;
        }
        let n_prefix = (lead - 2) as usize;
        let n_suffix = r.u64()? as usize;
        if n_prefix > term.len() || r.off + n_suffix > data.len() {
            return Err(Error::corrupt("interior term entry truncated"));
        }
        term.truncate(n_prefix);
        term.extend_from_slice(&data[r.off..r.off + n_suffix]);
        r.off += n_suffix;
        items.push(InteriorItem::Term(term.clone()));
    }
    Ok((leftmost, items))
}

fn fmt_term(term: &[u8]) -> String {
    match std::str::from_utf8(term) {
        Ok(s) => format!("{:?}", s),
        Err(_) => format!("{:02x?}", term),
    }
}

/// Human-readable disassembly of any record in the data table, keyed by
/// its record id. Mirrors the on-disk formats exactly; used from tests
/// and while debugging index corruption.
pub fn decode_record(id: i64, data: &[u8]) -> Result<String> {
    if id == STRUCTURE_ID {
        return decode_structure(data);
    }
    if id == AVERAGES_ID {
        return decode_averages(data);
    }
    let (segid, dlidx, height, pgno) = split_id(id);
    if dlidx {
        return decode_dlidx(segid, height, pgno, data);
    }
    if height > 0 {
        return decode_interior(segid, height, pgno, data);
    }
    decode_leaf(segid, pgno, data)
}

/// Compose a record id from its parts, mirroring the id encoding the
/// decoder splits. Kind is one of `segment`, `dlidx`.
pub fn compose_rowid(kind: &str, segid: u16, height: u8, pgno: u32) -> Result<i64> {
    match kind {
        "segment" => Ok(crate::index::record::record_id(segid, false, height, pgno)),
        "dlidx" => Ok(crate::index::record::record_id(segid, true, height, pgno)),
        other => Err(Error::query(format!("unknown record kind: {}", other))),
    }
}

fn decode_structure(data: &[u8]) -> Result<String> {
    let s = Structure::decode(data)?;
    let mut out = String::new();
    write!(
        out,
        "structure cookie={:#010x} write_counter={}",
        s.cookie, s.write_counter
    )
    .unwrap();
    for (i, level) in s.levels.iter().enumerate() {
        write!(out, "\n  level {} merge={} :", i, level.n_merge).unwrap();
        for seg in &level.segments {
            write!(
                out,
                " {{id={} h={} leaves={}..{}}}",
                seg.segid, seg.height, seg.pgno_first, seg.pgno_last
            )
            .unwrap();
        }
    }
    Ok(out)
}

fn decode_averages(data: &[u8]) -> Result<String> {
    let mut r = VarintReader::new(data);
    let n_row = r.u64()?;
    let mut out = format!("averages rows={}", n_row);
    let mut col = 0;
    while !r.eof() {
        write!(out, " col{}={}", col, r.u64()?).unwrap();
        col += 1;
    }
    Ok(out)
}

fn decode_dlidx(segid: u16, level: u8, pgno: u32, data: &[u8]) -> Result<String> {
    if data.is_empty() {
        return Err(Error::corrupt("empty dlidx page"));
    }
    let mut r = VarintReader::new(&data[1..]);
    let first_child = r.u64()?;
    let mut rowid = r.u64()? as i64;
    let mut out = format!(
        "dlidx seg={} level={} pgno={}{} first_child={} rowid={}",
        segid,
        level,
        pgno,
        if data[0] & 1 == 0 { " (root)" } else { "" },
        first_child,
        rowid
    );
    let mut child = first_child;
    while !r.eof() {
        child += 1;
        if r.buf[r.off] == 0 {
            r.off += 1;
            write!(out, "\n  child {} (no rowid)", child).unwrap();
            continue;
        }
        rowid = rowid.wrapping_add(r.u64()? as i64);
        write!(out, "\n  child {} rowid={}", child, rowid).unwrap();
    }
    Ok(out)
}

fn decode_interior(segid: u16, height: u8, pgno: u32, data: &[u8]) -> Result<String> {
    let (leftmost, items) = parse_interior(data)?;
    let mut out = format!(
        "interior seg={} height={} pgno={} leftmost_child={}",
        segid, height, pgno, leftmost
    );
    for item in items {
        match item {
            InteriorItem::Term(t) => write!(out, "\n  term {}", fmt_term(&t)).unwrap(),
            InteriorItem::NoTerm { n_empty, dlidx } => write!(
                out,
                "\n  {} empty leaves{}",
                n_empty,
                if dlidx { " (dlidx)" } else { "" }
            )
            .unwrap(),
        }
    }
    Ok(out)
}

/// Decode one leaf page in isolation: the header offsets plus the term
/// and rowid stream, without following doclists onto other pages.
fn decode_leaf(segid: u16, pgno: u32, data: &[u8]) -> Result<String> {
    if data.len() < LEAF_HDR {
        return Err(Error::corrupt("leaf shorter than its header"));
    }
    let first_rowid = crate::index::record::get_u16(data, 0) as usize;
    let first_term = crate::index::record::get_u16(data, 2) as usize;
    let mut out = format!(
        "leaf seg={} pgno={} first_rowid_off={} first_term_off={}",
        segid, pgno, first_rowid, first_term
    );
    if first_term == 0 {
        write!(out, "\n  (doclist continuation page)").unwrap();
        return Ok(out);
    }

    let mut off = first_term;
    let mut term: Vec<u8> = Vec::new();
    let mut first_term_on_page = true;
    let mut rowid = 0i64;
    loop {
        if off >= data.len() {
            break;
        }
        // Term image.
        if first_term_on_page {
            let (n, c) = get_varint(&data[off..]);
            off += c;
            let n = n as usize;
            if off + n > data.len() {
                return Err(Error::corrupt("leaf term truncated"));
            }
            term = data[off..off + n].to_vec();
            off += n;
            first_term_on_page = false;
        } else {
            let (n_prefix, c) = get_varint(&data[off..]);
            off += c;
            let (n_suffix, c) = get_varint(&data[off..]);
            off += c;
            let (n_prefix, n_suffix) = (n_prefix as usize, n_suffix as usize);
            if n_prefix > term.len() || off + n_suffix > data.len() {
                return Err(Error::corrupt("leaf term prefix truncated"));
            }
            term.truncate(n_prefix);
            term.extend_from_slice(&data[off..off + n_suffix]);
            off += n_suffix;
        }
        write!(out, "\n  term {}", fmt_term(&term)).unwrap();

        // Doclist until terminator or page end.
        let mut first_rowid_of_doclist = true;
        loop {
            if off >= data.len() {
                return Ok(out);
            }
            if !first_rowid_of_doclist && data[off] == 0 {
                off += 1;
                break;
            }
            let (v, c) = get_varint(&data[off..]);
            off += c;
            rowid = if first_rowid_of_doclist || off - c == first_rowid {
                v as i64
            } else {
                rowid.wrapping_add(v as i64)
            };
            first_rowid_of_doclist = false;
            let (sz, c) = get_varint(&data[off..]);
            off += c;
            let n_pos = (sz >> 1) as usize;
            write!(
                out,
                "\n    rowid {}{} n_pos={}",
                rowid,
                if sz & 1 != 0 { " (del)" } else { "" },
                n_pos
            )
            .unwrap();
            off += n_pos;
            if off > data.len() {
                write!(out, " (spills to next leaf)").unwrap();
                return Ok(out);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::record::{leaf_id, AVERAGES_ID};
    use crate::index::record::Averages;
    use crate::index::segment_writer::SegmentWriter;
    use crate::storage::backend::{MemBackend, StorageBackend};

    #[test]
    fn test_compose_and_split() {
        let id = compose_rowid("segment", 9, 0, 4).unwrap();
        assert_eq!(split_id(id), (9, false, 0, 4));
        let id = compose_rowid("dlidx", 9, 2, 4).unwrap();
        assert_eq!(split_id(id), (9, true, 2, 4));
        assert!(compose_rowid("nonsense", 1, 0, 1).is_err());
    }

    #[test]
    fn test_decode_leaf_and_structure() {
        let backend = MemBackend::new();
        let mut w = SegmentWriter::new(&backend, 3, 1000);
        w.append_term(b"0alpha").unwrap();
        w.append_entry(7, &[4, 4], false).unwrap();
        w.append_term(b"0beta").unwrap();
        w.append_entry(2, &[], true).unwrap();
        w.finish().unwrap();

        let leaf = backend.data_read(leaf_id(3, 1)).unwrap().unwrap();
        let text = decode_record(leaf_id(3, 1), &leaf).unwrap();
        assert!(text.contains("term \"0alpha\""));
        assert!(text.contains("rowid 7"));
        assert!(text.contains("term \"0beta\""));
        assert!(text.contains("rowid 2 (del)"));

        let avg = Averages {
            n_row: 3,
            col_tokens: vec![12],
        };
        let text = decode_record(AVERAGES_ID, &avg.encode()).unwrap();
        assert!(text.contains("rows=3"));
        assert!(text.contains("col0=12"));
    }

    #[test]
    fn test_parse_interior_round_trip() {
        // leftmost child 1, then: term "abc", 5 empty leaves with a
        // dlidx, term "abd" prefix-compressed.
        let mut data = Vec::new();
        crate::compression::varint::put_varint(&mut data, 1);
        crate::compression::varint::put_varint(&mut data, 0 + 2);
        crate::compression::varint::put_varint(&mut data, 3);
        data.extend_from_slice(b"abc");
        data.push(1);
        crate::compression::varint::put_varint(&mut data, 5);
        crate::compression::varint::put_varint(&mut data, 2 + 2);
        crate::compression::varint::put_varint(&mut data, 1);
        data.extend_from_slice(b"d");

        let (leftmost, items) = parse_interior(&data).unwrap();
        assert_eq!(leftmost, 1);
        assert_eq!(
            items,
            vec![
                InteriorItem::Term(b"abc".to_vec()),
                InteriorItem::NoTerm {
                    n_empty: 5,
                    dlidx: true
                },
                InteriorItem::Term(b"abd".to_vec()),
            ]
        );
    }
}
