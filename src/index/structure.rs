use crate::compression::varint::{put_varint, VarintReader};
use crate::core::error::{Error, Result};
use crate::index::record::MAX_SEGMENTS;
use std::collections::HashSet;

/// One on-disk segment as recorded in the structure record. A segment is
/// immutable once written, except that `pgno_first` advances when an
/// incremental merge has consumed a prefix of its leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub segid: u16,
    /// 1 = leaves only; h > 1 adds h-1 interior b-tree levels.
    pub height: u8,
    pub pgno_first: u32,
    pub pgno_last: u32,
}

impl SegmentInfo {
    /// Size measured in leaves; what leveling and promotion compare.
    pub fn size(&self) -> u32 {
        if self.pgno_last >= self.pgno_first {
            self.pgno_last - self.pgno_first + 1
        } else {
            0
        }
    }
}

/// A level holds segments of comparable size, oldest first. `n_merge`
/// is the number of oldest segments participating in an in-progress
/// merge into the tail segment of the next level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Level {
    pub n_merge: usize,
    pub segments: Vec<SegmentInfo>,
}

/// The root metadata record, stored at the reserved structure id.
/// `write_counter` counts level-0 leaves ever produced and paces the
/// automerge work quanta.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Structure {
    pub cookie: u32,
    pub write_counter: u64,
    pub levels: Vec<Level>,
}

impl Structure {
    pub fn n_segments(&self) -> usize {
        self.levels.iter().map(|l| l.segments.len()).sum()
    }

    pub fn segids(&self) -> HashSet<u16> {
        self.levels
            .iter()
            .flat_map(|l| l.segments.iter().map(|s| s.segid))
            .collect()
    }

    /// All segments, oldest level last, oldest segment first within a
    /// level (storage order).
    pub fn all_segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.levels.iter().flat_map(|l| l.segments.iter())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.cookie.to_be_bytes());
        put_varint(&mut buf, self.write_counter);
        put_varint(&mut buf, self.levels.len() as u64);
        put_varint(&mut buf, self.n_segments() as u64);
        for level in &self.levels {
            put_varint(&mut buf, level.n_merge as u64);
            put_varint(&mut buf, level.segments.len() as u64);
            for seg in &level.segments {
                put_varint(&mut buf, seg.segid as u64);
                put_varint(&mut buf, seg.height as u64);
                put_varint(&mut buf, seg.pgno_first as u64);
                put_varint(&mut buf, seg.pgno_last as u64);
            }
        }
        buf
    }

    pub fn decode(record: &[u8]) -> Result<Structure> {
        if record.len() < 4 {
            return Err(Error::corrupt("structure record too short"));
        }
        let cookie = u32::from_be_bytes(record[0..4].try_into().unwrap());
        let mut r = VarintReader::new(&record[4..]);
        let write_counter = r.u64()?;
        let n_level = r.u64()? as usize;
        let n_segment = r.u64()? as usize;
        if n_segment > MAX_SEGMENTS {
            return Err(Error::corrupt("segment count exceeds limit"));
        }

        let mut levels = Vec::with_capacity(n_level);
        for _ in 0..n_level {
            let n_merge = r.u64()? as usize;
            let n_seg = r.u64()? as usize;
            if n_merge > n_seg {
                return Err(Error::corrupt("nMerge exceeds level segment count"));
            }
            let mut segments = Vec::with_capacity(n_seg);
            for _ in 0..n_seg {
                let segid = r.u64()?;
                if segid == 0 || segid >= 1 << 16 {
                    return Err(Error::corrupt("segment id out of range"));
                }
                segments.push(SegmentInfo {
                    segid: segid as u16,
                    height: r.u64()? as u8,
                    pgno_first: r.u32()?,
                    pgno_last: r.u32()?,
                });
            }
            levels.push(Level { n_merge, segments });
        }

        let structure = Structure {
            cookie,
            write_counter,
            levels,
        };
        if structure.n_segments() != n_segment {
            return Err(Error::corrupt("segment accounting mismatch"));
        }
        structure.validate()?;
        Ok(structure)
    }

    /// Structural invariants: ids unique and in range, counts bounded.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for level in &self.levels {
            if level.n_merge > level.segments.len() {
                return Err(Error::corrupt("nMerge exceeds level segment count"));
            }
            for seg in &level.segments {
                if seg.segid == 0 {
                    return Err(Error::corrupt("segment id out of range"));
                }
                if !seen.insert(seg.segid) {
                    return Err(Error::corrupt("duplicate segment id"));
                }
            }
        }
        if seen.len() > MAX_SEGMENTS {
            return Err(Error::corrupt("segment count exceeds limit"));
        }
        Ok(())
    }
}
