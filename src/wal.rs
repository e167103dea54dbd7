//! WAL segment-name algebra.
//!
//! A segment name is 24 hex digits: bytes [0,8) are the *timeline*, bytes
//! [8,24) a log/seg pair that encodes a big-endian 64-bit byte offset divided
//! by the WAL segment size.  Lexicographic ordering is correct *within one
//! timeline only*; every distance-style operation here requires the caller to
//! have confirmed matching timelines first — cross-timeline adjacency is
//! meaningless.
//!
//! Archived WAL file names append the plaintext checksum and compression
//! extension: `<24hex>[.partial]-<40hex sha1>[.gz|.bz2|.lz4|.zst]`.

use std::fmt;

use crate::error::{Error, Result};
use crate::filter::Compress;

/// Clusters older than 9.3 never fill the last segment of a log file.
pub const PG_VERSION_93: u32 = 90300;

/// Convert a cluster version string to its numeric form: `"9.2"` → 90200,
/// `"15"` → 150000.
pub fn pg_version_num(version: &str) -> Result<u32> {
    let bad = || Error::format(format!("'{version}' is not a cluster version"));
    match version.split_once('.') {
        Some((major, minor)) => {
            let major: u32 = major.parse().map_err(|_| bad())?;
            let minor: u32 = minor.parse().map_err(|_| bad())?;
            Ok(major * 10000 + minor * 100)
        }
        None => {
            let major: u32 = version.parse().map_err(|_| bad())?;
            Ok(major * 10000)
        }
    }
}

/// One WAL segment, identified by its 24-hex-digit name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalSegment {
    name: String,
}

impl WalSegment {
    /// Parse a 24-hex-digit segment name.  Hex digits are normalised to the
    /// uppercase form the archive layout uses.
    pub fn parse(name: &str) -> Result<Self> {
        if name.len() != 24 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::format(format!("'{name}' is not a WAL segment name")));
        }
        Ok(Self { name: name.to_ascii_uppercase() })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The timeline — the first 8 hex digits.
    pub fn timeline(&self) -> &str {
        &self.name[..8]
    }

    /// True when both segments sit on the same timeline; a precondition for
    /// [`WalSegment::next`] / [`WalSegment::dist`] comparisons.
    pub fn same_timeline(&self, other: &WalSegment) -> bool {
        self.timeline() == other.timeline()
    }

    /// The first 16 hex digits — the repository directory the segment
    /// archives into.
    pub fn timeline_dir(&self) -> &str {
        &self.name[..16]
    }

    fn log(&self) -> u64 {
        u64::from_str_radix(&self.name[8..16], 16).expect("validated hex")
    }

    fn seg(&self) -> u64 {
        u64::from_str_radix(&self.name[16..24], 16).expect("validated hex")
    }

    /// Segments per 4 GiB log file at the given segment size.
    fn segments_per_log(wal_segment_size: u64) -> u64 {
        0x1_0000_0000 / wal_segment_size
    }

    /// The segment that follows this one on the same timeline.
    pub fn next(&self, wal_segment_size: u64, pg_version: u32) -> WalSegment {
        let per_log = Self::segments_per_log(wal_segment_size);
        let mut log = self.log();
        let mut seg = self.seg() + 1;

        // Pre-9.3 clusters skip the final segment of every log file.
        let last = if pg_version < PG_VERSION_93 { per_log - 1 } else { per_log };
        if seg >= last {
            log += 1;
            seg = 0;
        }

        WalSegment {
            name: format!("{}{:08X}{:08X}", self.timeline(), log, seg),
        }
    }

    /// Distance in segments from `self` to `to`.
    ///
    /// Defined only for `self ≤ to` on the same timeline; callers must check
    /// timelines first.
    pub fn dist(&self, to: &WalSegment, wal_segment_size: u64, pg_version: u32) -> u64 {
        debug_assert!(self.same_timeline(to));
        debug_assert!(self.name <= to.name);

        let per_log = Self::segments_per_log(wal_segment_size);
        let usable = if pg_version < PG_VERSION_93 { per_log - 1 } else { per_log };
        let a = self.log() * usable + self.seg();
        let b = to.log() * usable + to.seg();
        b.saturating_sub(a)
    }
}

impl fmt::Display for WalSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ── Archived file names ──────────────────────────────────────────────────────

/// A parsed archive file name: segment, partial flag, stored checksum,
/// compression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFileName {
    pub segment:  WalSegment,
    pub partial:  bool,
    pub checksum: String,
    pub compress: Compress,
}

impl WalFileName {
    /// Parse `<24hex>[.partial]-<40hex>[.ext]`.  Anything else (history
    /// files, backup labels) returns `None`.
    pub fn parse(name: &str) -> Option<Self> {
        let compress = Compress::from_name(name);
        let stem = Compress::strip(name);

        let (seg_part, checksum) = stem.rsplit_once('-')?;
        if checksum.len() != 40 || !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }

        let (seg_name, partial) = match seg_part.strip_suffix(".partial") {
            Some(s) => (s, true),
            None    => (seg_part, false),
        };
        let segment = WalSegment::parse(seg_name).ok()?;

        Some(Self {
            segment,
            partial,
            checksum: checksum.to_ascii_lowercase(),
            compress,
        })
    }
}

// ── Ranges ───────────────────────────────────────────────────────────────────

/// A maximal contiguous run of archived segments on one timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRange {
    pub start: WalSegment,
    pub stop:  WalSegment,
}

impl WalRange {
    /// True when `seg` lies inside `[start, stop]` on this range's timeline.
    pub fn contains(&self, seg: &WalSegment) -> bool {
        self.start.same_timeline(seg)
            && self.start.as_str() <= seg.as_str()
            && seg.as_str() <= self.stop.as_str()
    }
}

/// Fold a sorted, deduplicated segment list into maximal contiguous ranges.
/// Two segments are contiguous iff `next(prev) == curr`; a timeline change
/// always starts a new range.
pub fn build_ranges(
    segments:         &[WalSegment],
    wal_segment_size: u64,
    pg_version:       u32,
) -> Vec<WalRange> {
    let mut ranges: Vec<WalRange> = Vec::new();
    for seg in segments {
        match ranges.last_mut() {
            Some(range)
                if range.stop.same_timeline(seg)
                    && range.stop.next(wal_segment_size, pg_version) == *seg =>
            {
                range.stop = seg.clone();
            }
            _ => ranges.push(WalRange { start: seg.clone(), stop: seg.clone() }),
        }
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: u64 = 16 * 1024 * 1024;
    const PG: u32 = 150000;

    fn seg(name: &str) -> WalSegment {
        WalSegment::parse(name).unwrap()
    }

    #[test]
    fn version_numbers() {
        assert_eq!(pg_version_num("9.2").unwrap(), 90200);
        assert_eq!(pg_version_num("9.6").unwrap(), 90600);
        assert_eq!(pg_version_num("15").unwrap(), 150000);
        assert!(pg_version_num("fifteen").is_err());
    }

    #[test]
    fn next_and_dist_agree() {
        let s = seg("000000010000000000000001");
        let n = s.next(SIZE, PG);
        assert_eq!(n.as_str(), "000000010000000000000002");
        assert_eq!(s.dist(&n, SIZE, PG), 1);
        assert_eq!(s.dist(&s, SIZE, PG), 0);
    }

    #[test]
    fn next_rolls_into_the_following_log() {
        // 16 MiB segments: 256 per log, last is 0xFF.
        let s = seg("0000000100000000000000FF");
        assert_eq!(s.next(SIZE, PG).as_str(), "000000010000000100000000");

        // Pre-9.3 skips the 0xFF segment entirely.
        let s = seg("0000000100000000000000FE");
        assert_eq!(s.next(SIZE, 90200).as_str(), "000000010000000100000000");
    }

    #[test]
    fn dist_spans_log_boundaries() {
        let a = seg("0000000100000000000000FE");
        let b = seg("000000010000000100000002");
        assert_eq!(a.dist(&b, SIZE, PG), 4);
    }

    #[test]
    fn timeline_split() {
        let s = seg("0000000A0000000300000007");
        assert_eq!(s.timeline(), "0000000A");
        assert_eq!(s.timeline_dir(), "0000000A00000003");
        assert!(!s.same_timeline(&seg("0000000B0000000300000007")));
    }

    #[test]
    fn file_name_parsing() {
        let f = WalFileName::parse(
            "000000010000000000000001-0c4ceecaf0f9d76fad7bd2f7f7bbaf0dfdb14b27.gz",
        )
        .unwrap();
        assert_eq!(f.segment.as_str(), "000000010000000000000001");
        assert!(!f.partial);
        assert_eq!(f.compress, Compress::Gz);
        assert_eq!(f.checksum.len(), 40);

        let f = WalFileName::parse(
            "000000010000000000000002.partial-0c4ceecaf0f9d76fad7bd2f7f7bbaf0dfdb14b27",
        )
        .unwrap();
        assert!(f.partial);
        assert_eq!(f.compress, Compress::None);

        assert!(WalFileName::parse("00000002.history").is_none());
        assert!(WalFileName::parse("000000010000000000000001").is_none());
        assert!(WalFileName::parse("000000010000000000000001-shortsha").is_none());
    }

    #[test]
    fn ranges_split_on_gaps_and_timelines() {
        let segs = vec![
            seg("000000010000000000000001"),
            seg("000000010000000000000002"),
            // gap: ...0003 missing
            seg("000000010000000000000004"),
            // new timeline
            seg("000000020000000000000005"),
            seg("000000020000000000000006"),
        ];
        let ranges = build_ranges(&segs, SIZE, PG);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].start.as_str(), "000000010000000000000001");
        assert_eq!(ranges[0].stop.as_str(), "000000010000000000000002");
        assert_eq!(ranges[1].start.as_str(), "000000010000000000000004");
        assert_eq!(ranges[2].start.timeline(), "00000002");
        assert!(ranges[0].contains(&seg("000000010000000000000002")));
        assert!(!ranges[0].contains(&seg("000000010000000000000004")));
    }
}
