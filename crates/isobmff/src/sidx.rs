//! Segment index (`sidx`) parsing.

use tracing::trace;

use crate::error::{Diagnostics, ParseDiagnostic};
use crate::reader::FieldReader;

/// Derived timing and byte range of one subsegment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubsegmentInfo {
    /// Duration in seconds.
    pub duration: f64,
    /// First byte of the subsegment.
    pub start: u64,
    /// Last byte of the subsegment (inclusive).
    pub end: u64,
}

/// One media reference of a `sidx` box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SidxReference {
    /// Size of the referenced subsegment in bytes.
    pub reference_size: u32,
    /// Duration in `sidx` timescale units.
    pub subsegment_duration: u32,
    /// Derived byte range and duration.
    pub info: SubsegmentInfo,
}

/// Decoded `sidx` box.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentIndex {
    /// Box version; version 1 carries 64-bit time and offset fields.
    pub version: u8,
    /// Ticks per second for `earliest_presentation_time` and durations.
    pub timescale: u32,
    /// Presentation time of the first referenced sample.
    pub earliest_presentation_time: u64,
    /// Distance from the end of the `sidx` box to the first subsegment.
    pub first_offset: u64,
    /// Declared reference count.
    pub references_count: u16,
    /// References in file order.
    pub references: Vec<SidxReference>,
}

/// Decode the payload of a `sidx` box.
///
/// Returns `None` for truncated payloads, a zero timescale, or when any
/// reference points at another `sidx` (hierarchical indexes are not supported).
pub fn parse_segment_index(sidx: &[u8], diag: &mut Diagnostics) -> Option<SegmentIndex> {
    match read_segment_index(sidx) {
        Ok(index) => Some(index),
        Err(d) => {
            diag.push(d);
            None
        }
    }
}

fn read_segment_index(sidx: &[u8]) -> Result<SegmentIndex, ParseDiagnostic> {
    let mut reader = FieldReader::new(sidx, "sidx");
    let version = reader.u8()?;
    // flags + reference_ID
    reader.skip(3 + 4)?;
    let timescale = reader.u32()?;
    if timescale == 0 {
        return Err(ParseDiagnostic::InvalidTimescale { context: "sidx" });
    }

    let (earliest_presentation_time, first_offset) = if version == 0 {
        (u64::from(reader.u32()?), u64::from(reader.u32()?))
    } else {
        (reader.u64()?, reader.u64()?)
    };
    reader.skip(2)?;
    let references_count = reader.u16()?;

    // Byte ranges are relative to the first byte after the sidx box.
    let mut start = (sidx.len() as u64).saturating_add(first_offset);
    let mut references = Vec::with_capacity(references_count as usize);
    for reference in 0..references_count as usize {
        let info = reader.u32()?;
        if info & 0x8000_0000 != 0 {
            return Err(ParseDiagnostic::HierarchicalSidx { reference });
        }
        let reference_size = info & 0x7FFF_FFFF;
        let subsegment_duration = reader.u32()?;
        // SAP fields
        reader.skip(4)?;

        let overflow = || ParseDiagnostic::SidxRangeOverflow { reference };
        let end = start
            .checked_add(u64::from(reference_size))
            .ok_or_else(overflow)?
            .saturating_sub(1);
        references.push(SidxReference {
            reference_size,
            subsegment_duration,
            info: SubsegmentInfo {
                duration: f64::from(subsegment_duration) / f64::from(timescale),
                start,
                end,
            },
        });
        start = end.checked_add(1).ok_or_else(overflow)?;
    }

    trace!(
        version,
        timescale,
        earliest_presentation_time,
        references = references.len(),
        "Parsed sidx"
    );

    Ok(SegmentIndex {
        version,
        timescale,
        earliest_presentation_time,
        first_offset,
        references_count,
        references,
    })
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;
    use crate::test_support::make_sidx;

    fn payload(sidx: &[u8]) -> &[u8] {
        &sidx[8..]
    }

    #[test]
    fn test_parse_v0_references() {
        let sidx = make_sidx(0, 1000, 500, 0, &[(false, 100, 2000), (false, 50, 1000)]);
        let body = payload(&sidx);
        let mut diag = Diagnostics::new();
        let index = parse_segment_index(body, &mut diag).unwrap();

        assert_eq!(index.version, 0);
        assert_eq!(index.timescale, 1000);
        assert_eq!(index.earliest_presentation_time, 500);
        assert_eq!(index.references_count, 2);

        let base = body.len() as u64;
        let first = &index.references[0];
        assert_eq!(first.reference_size, 100);
        assert_eq!(first.subsegment_duration, 2000);
        assert_eq!(first.info.duration, 2.0);
        assert_eq!(first.info.start, base);
        assert_eq!(first.info.end, base + 99);

        let second = &index.references[1];
        assert_eq!(second.info.start, base + 100);
        assert_eq!(second.info.end, base + 149);
        assert_eq!(second.info.duration, 1.0);
        assert!(diag.is_empty());
    }

    #[test]
    fn test_parse_v1_with_first_offset() {
        let ept = (1u64 << 33) + 7;
        let sidx = make_sidx(1, 90_000, ept, 16, &[(false, 10, 90_000)]);
        let body = payload(&sidx);
        let mut diag = Diagnostics::new();
        let index = parse_segment_index(body, &mut diag).unwrap();

        assert_eq!(index.earliest_presentation_time, ept);
        assert_eq!(index.first_offset, 16);
        assert_eq!(index.references[0].info.start, body.len() as u64 + 16);
    }

    #[test]
    fn test_hierarchical_reference_rejects_index() {
        let sidx = make_sidx(0, 1000, 0, 0, &[(false, 10, 10), (true, 10, 10)]);
        let mut diag = Diagnostics::new();
        assert!(parse_segment_index(payload(&sidx), &mut diag).is_none());
        assert!(diag.contains(|d| matches!(d, ParseDiagnostic::HierarchicalSidx { reference: 1 })));
    }

    #[test]
    fn test_first_offset_overflow_is_reported() {
        let sidx = make_sidx(1, 1000, 0, u64::MAX, &[(false, 10, 10)]);
        let mut diag = Diagnostics::new();
        assert!(parse_segment_index(payload(&sidx), &mut diag).is_none());
        assert!(diag.contains(|d| matches!(d, ParseDiagnostic::SidxRangeOverflow { reference: 0 })));

        // first range ends exactly at u64::MAX, leaving no start for the next
        let refs = [(false, 10, 10), (false, 10, 10)];
        let body_len = payload(&make_sidx(1, 1000, 0, 0, &refs)).len() as u64;
        let sidx = make_sidx(1, 1000, 0, u64::MAX - 9 - body_len, &refs);
        let mut diag = Diagnostics::new();
        assert!(parse_segment_index(payload(&sidx), &mut diag).is_none());
        assert!(diag.contains(|d| matches!(d, ParseDiagnostic::SidxRangeOverflow { reference: 0 })));
    }

    #[test]
    fn test_zero_references() {
        let sidx = make_sidx(0, 1000, 0, 0, &[]);
        let mut diag = Diagnostics::new();
        let index = parse_segment_index(payload(&sidx), &mut diag).unwrap();
        assert!(index.references.is_empty());
        assert!(diag.is_empty());
    }

    #[test]
    fn test_zero_timescale() {
        let sidx = make_sidx(0, 0, 0, 0, &[(false, 10, 10)]);
        let mut diag = Diagnostics::new();
        assert!(parse_segment_index(payload(&sidx), &mut diag).is_none());
        assert!(diag.contains(|d| matches!(d, ParseDiagnostic::InvalidTimescale { .. })));
    }

    #[test]
    fn test_truncated_reference_table() {
        let sidx = make_sidx(0, 1000, 0, 0, &[(false, 10, 10)]);
        let body = payload(&sidx);
        let mut diag = Diagnostics::new();
        assert!(parse_segment_index(&body[..body.len() - 4], &mut diag).is_none());
        assert!(diag.contains(|d| matches!(d, ParseDiagnostic::Truncated { context: "sidx" })));
    }
}
