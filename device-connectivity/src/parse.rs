//! Parsers for multipath-tools and sg3_utils output.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ConnectivityError, Result};
use crate::types::VolumeIdentity;

/// Last designator of the NAA descriptor in `sg_inq -p 0x83`, e.g.
///
/// ```text
///       Vendor Specific Identifier Extension: 0xcea
///       [0x6001738cfc9035eb0000000000000cea]
/// ```
static SG_INQ_WWN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Vendor Specific Identifier Extension: 0x\S*\s*\[0x([0-9A-Za-z]+)\]")
        .expect("static regex")
});

/// One `<wwid>,<dm_name>` line of `multipathd show maps raw format "%w,%d"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry<'a> {
    pub wwid: &'a str,
    pub dm_name: &'a str,
}

impl<'a> MapEntry<'a> {
    /// Parse a single line. Either field order is accepted; the field that
    /// names a `dm-` device is the dm name.
    pub fn parse(line: &'a str) -> Option<Self> {
        let (first, second) = line.trim().split_once(',')?;
        let (first, second) = (first.trim(), second.trim());
        if first.is_empty() || second.is_empty() {
            return None;
        }
        match (first.starts_with("dm-"), second.starts_with("dm-")) {
            (false, true) => Some(Self {
                wwid: first,
                dm_name: second,
            }),
            (true, false) => Some(Self {
                wwid: second,
                dm_name: first,
            }),
            _ => None,
        }
    }

    pub fn belongs_to(&self, volume: &VolumeIdentity) -> bool {
        wwid_matches(self.wwid, volume)
    }
}

/// Lazily parse `show maps` output, skipping headers and malformed lines.
pub fn parse_show_maps(output: &str) -> impl Iterator<Item = MapEntry<'_>> {
    output.lines().filter_map(MapEntry::parse)
}

/// Whether a multipath wwid names the volume.
///
/// Matches case-insensitively on the bare id, or after stripping the SCSI
/// NAA designator prefix (`3` + 32 chars) or the NVMe `eui.` prefix.
pub fn wwid_matches(wwid: &str, volume: &VolumeIdentity) -> bool {
    let wwid = wwid.trim().to_ascii_lowercase();
    if volume.matches(&wwid) {
        return true;
    }
    if let Some(eui) = wwid.strip_prefix("eui.") {
        return volume.matches(eui);
    }
    if wwid.len() == 33
        && let Some(naa) = wwid.strip_prefix('3')
    {
        return volume.matches(naa);
    }
    false
}

/// Identity reported by a SCSI INQUIRY on VPD page 0x83.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiInquiry {
    /// Lowercased WWN without the `0x` prefix.
    pub wwn: String,
}

impl ScsiInquiry {
    pub fn parse(device: &str, output: &str) -> Result<Self> {
        SG_INQ_WWN
            .captures(output)
            .and_then(|caps| caps.get(1))
            .map(|m| Self {
                wwn: m.as_str().to_ascii_lowercase(),
            })
            .ok_or_else(|| ConnectivityError::NoRegexWwnMatchInScsiInq {
                device: device.to_string(),
                output: output.to_string(),
            })
    }
}
