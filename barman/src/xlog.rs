//! Naming algebra for WAL files.
//!
//! A WAL segment is identified by a 24-hex-digit name `TTTTTTTTXXXXXXXXYYYYYYYY`
//! (timeline, xlogid, segment-within-xlogid). Timeline history files are
//! `TTTTTTTT.history`. A `.partial` suffix marks a segment that is still
//! being streamed; a `.backup` suffix marks a backup-stop label file emitted
//! next to its segment.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use once_cell::sync::Lazy;
use regex::Regex;
use utils::lsn::Lsn;

/// WAL segment size. Barman only supports the default.
pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// Segments per xlogid, given the default segment size.
const SEGMENTS_PER_XLOGID: u64 = 0x1_0000_0000 / WAL_SEGMENT_SIZE as u64;

static SEGMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9A-F]{24}$").unwrap());
static HISTORY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9A-F]{8}\.history$").unwrap());
static BACKUP_LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-F]{24}\.[0-9A-F]{8}\.backup$").unwrap());
static PARTIAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9A-F]{24}\.partial$").unwrap());

/// One WAL segment, identified by timeline and absolute segment number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Segment {
    pub tli: u32,
    pub segno: u64,
}

impl Segment {
    /// The segment that contains the given LSN on the given timeline.
    pub fn containing(tli: u32, lsn: Lsn) -> Self {
        Segment {
            tli,
            segno: lsn.segment_number(WAL_SEGMENT_SIZE),
        }
    }

    /// First byte of this segment.
    pub fn start_lsn(&self) -> Lsn {
        Lsn(self.segno * WAL_SEGMENT_SIZE as u64)
    }

    pub fn next(&self) -> Segment {
        Segment {
            tli: self.tli,
            segno: self.segno + 1,
        }
    }

    /// Canonical 24-hex-digit file name.
    pub fn name(&self) -> String {
        format!(
            "{:08X}{:08X}{:08X}",
            self.tli,
            self.segno / SEGMENTS_PER_XLOGID,
            self.segno % SEGMENTS_PER_XLOGID
        )
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Segment {
    type Err = anyhow::Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        if !SEGMENT_RE.is_match(name) {
            bail!("'{name}' is not a valid WAL segment name");
        }
        let tli = u32::from_str_radix(&name[0..8], 16)?;
        let log = u64::from_str_radix(&name[8..16], 16)?;
        let seg = u64::from_str_radix(&name[16..24], 16)?;
        if seg >= SEGMENTS_PER_XLOGID {
            bail!("'{name}' has out-of-range segment field for 16 MiB segments");
        }
        Ok(Segment {
            tli,
            segno: log * SEGMENTS_PER_XLOGID + seg,
        })
    }
}

/// True for a plain 24-hex segment name.
pub fn is_segment_name(name: &str) -> bool {
    SEGMENT_RE.is_match(name)
}

/// True for a timeline history file name.
pub fn is_history_name(name: &str) -> bool {
    HISTORY_RE.is_match(name)
}

/// True for a backup-stop label file name.
pub fn is_backup_label_name(name: &str) -> bool {
    BACKUP_LABEL_RE.is_match(name)
}

/// True for a partial (still-streaming) segment name.
pub fn is_partial_name(name: &str) -> bool {
    PARTIAL_RE.is_match(name)
}

/// True for anything the archiver accepts: segments, history files, and
/// backup label files.
pub fn is_archivable_name(name: &str) -> bool {
    is_segment_name(name) || is_history_name(name) || is_backup_label_name(name)
}

/// Timeline encoded in a segment, history, backup, or partial file name.
pub fn timeline_of(name: &str) -> Option<u32> {
    if !(is_archivable_name(name) || is_partial_name(name)) {
        return None;
    }
    u32::from_str_radix(&name[0..8], 16).ok()
}

/// The archive shards WAL files by the first 16 hex digits of the name;
/// history files keep their full name as the shard.
pub fn hash_dir(name: &str) -> String {
    if is_history_name(name) {
        name.to_string()
    } else {
        name[0..16].to_string()
    }
}

/// Canonical history file name for a timeline.
pub fn history_name(tli: u32) -> String {
    format!("{tli:08X}.history")
}

/// Inclusive range of segment names [begin, end], in ascending order.
///
/// Both ends must be on the same timeline; a range crossing a timeline
/// switch is iterated per timeline by the caller using history files.
pub fn segment_range(begin: &str, end: &str) -> anyhow::Result<Vec<String>> {
    let begin: Segment = begin.parse()?;
    let end: Segment = end.parse()?;
    if begin.tli != end.tli {
        bail!(
            "segment range {}-{} crosses timelines {} and {}",
            begin,
            end,
            begin.tli,
            end.tli
        );
    }
    if begin.segno > end.segno {
        bail!("segment range {begin}-{end} is inverted");
    }
    Ok((begin.segno..=end.segno)
        .map(|segno| Segment {
            tli: begin.tli,
            segno,
        }
        .name())
        .collect())
}

/// Sort key that keeps xlog.db monotonic: history files for timeline N sort
/// before the first segment of timeline N.
pub fn sort_key(name: &str) -> (u32, u64, u8) {
    if let Some(tli) = timeline_of(name) {
        if is_history_name(name) {
            return (tli, 0, 0);
        }
        if let Ok(seg) = name[..24.min(name.len())].parse::<Segment>() {
            return (tli, seg.segno, 1);
        }
    }
    (u32::MAX, u64::MAX, 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_name_roundtrip() {
        let seg: Segment = "0000000100000001000000A0".parse().unwrap();
        assert_eq!(seg.tli, 1);
        assert_eq!(seg.segno, 256 + 0xA0);
        assert_eq!(seg.name(), "0000000100000001000000A0");

        // Rolling over the xlogid boundary.
        let seg: Segment = "000000020000000A000000FF".parse().unwrap();
        assert_eq!(seg.next().name(), "000000020000000B00000000");
    }

    #[test]
    fn name_classification() {
        assert!(is_segment_name("000000010000000000000001"));
        assert!(!is_segment_name("00000001000000000000000"));
        assert!(!is_segment_name("00000001000000000000000g"));
        assert!(is_history_name("00000002.history"));
        assert!(is_backup_label_name(
            "0000000100000001000000A0.00000028.backup"
        ));
        assert!(is_partial_name("0000000100000001000000A0.partial"));
        assert!(!is_archivable_name("0000000100000001000000A0.partial"));
        assert!(is_archivable_name("00000002.history"));
    }

    #[test]
    fn segment_field_bounds() {
        // seg field must stay below segments-per-xlogid for 16 MiB segments
        assert!("000000010000000000000100".parse::<Segment>().is_err());
        assert!("0000000100000000000000FF".parse::<Segment>().is_ok());
    }

    #[test]
    fn containing_lsn() {
        // LSN 0/2000028 lives in segment 2 of timeline 1
        let lsn: Lsn = "0/2000028".parse().unwrap();
        let seg = Segment::containing(1, lsn);
        assert_eq!(seg.name(), "000000010000000000000002");
        assert_eq!(seg.start_lsn(), Lsn(2 * WAL_SEGMENT_SIZE as u64));
    }

    #[test]
    fn range_iteration() {
        let range = segment_range(
            "0000000100000001000000FE",
            "000000010000000200000001",
        )
        .unwrap();
        assert_eq!(
            range,
            vec![
                "0000000100000001000000FE",
                "0000000100000001000000FF",
                "000000010000000200000000",
                "000000010000000200000001",
            ]
        );
        assert!(segment_range(
            "000000010000000200000001",
            "000000010000000100000001"
        )
        .is_err());
        assert!(segment_range(
            "000000010000000100000001",
            "000000020000000100000002"
        )
        .is_err());
    }

    #[test]
    fn hash_dir_sharding() {
        assert_eq!(hash_dir("0000000100000001000000A0"), "0000000100000001");
        assert_eq!(hash_dir("00000002.history"), "00000002.history");
    }

    #[test]
    fn ordering_key() {
        let mut names = vec![
            "000000010000000000000002".to_string(),
            "00000002.history".to_string(),
            "000000010000000000000001".to_string(),
            "000000020000000000000003".to_string(),
        ];
        names.sort_by_key(|n| sort_key(n));
        assert_eq!(
            names,
            vec![
                "000000010000000000000001",
                "000000010000000000000002",
                "00000002.history",
                "000000020000000000000003",
            ]
        );
    }
}
