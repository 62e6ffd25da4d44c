//! Box tree walking.
//!
//! All walkers work on absolute byte ranges of one backing buffer, so the
//! same search can feed zero-copy `Bytes` slices, borrowed slices or in-place
//! patching of the original buffer.

use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::reader::read_u32;
use crate::types::FourCc;

pub(crate) const BOX_HEADER_SIZE: usize = 8;

/// Parsed view over a single ISOBMFF box inside a parent byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BoxView {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) fourcc: FourCc,
    pub(crate) body_start: usize,
}

impl BoxView {
    #[inline]
    pub(crate) fn body(&self) -> Range<usize> {
        self.body_start..self.end
    }
}

/// Read a box header: returns `(total_box_size, fourcc)`.
///
/// A declared size of `0` or `1` means the box extends to the end of `data`;
/// 64-bit extended sizes are not supported.
pub(crate) fn read_box_header(data: &[u8]) -> Option<(usize, FourCc)> {
    if data.len() < BOX_HEADER_SIZE {
        return None;
    }

    let size = read_u32(data, 0)? as usize;
    let fourcc = FourCc::from_slice(&data[4..8])?;

    if size <= 1 {
        Some((data.len(), fourcc))
    } else {
        Some((size, fourcc))
    }
}

/// Parse a single box located at `offset` within `[0..end)`.
///
/// Returns `None` when the header does not fit or the declared size runs past
/// `end`; walkers stop at that point instead of reading beyond the parent.
pub(crate) fn box_at(data: &[u8], offset: usize, end: usize) -> Option<BoxView> {
    if offset >= end {
        return None;
    }

    let remaining = data.get(offset..end)?;
    let (size, fourcc) = read_box_header(remaining)?;

    if size < BOX_HEADER_SIZE || size > remaining.len() {
        trace!(
            %fourcc,
            offset,
            size,
            available = remaining.len(),
            "Box overruns its parent, stopping walk"
        );
        return None;
    }

    Some(BoxView {
        start: offset,
        end: offset + size,
        fourcc,
        body_start: offset + BOX_HEADER_SIZE,
    })
}

/// Iterator over the sibling boxes of one nesting level.
pub(crate) struct Boxes<'a> {
    data: &'a [u8],
    offset: usize,
    end: usize,
}

impl Iterator for Boxes<'_> {
    type Item = BoxView;

    fn next(&mut self) -> Option<BoxView> {
        let Some(parsed) = box_at(self.data, self.offset, self.end) else {
            self.offset = self.end;
            return None;
        };
        self.offset = parsed.end;
        Some(parsed)
    }
}

pub(crate) fn boxes(data: &[u8], range: Range<usize>) -> Boxes<'_> {
    Boxes {
        data,
        offset: range.start,
        end: range.end.min(data.len()),
    }
}

/// Finds the payload ranges of every box matching `path` inside `range`.
///
/// The search is depth-first and left-to-right; every sibling matching the
/// current path element is visited, so results come back in document order.
pub fn find_box_ranges(data: &[u8], range: Range<usize>, path: &[[u8; 4]]) -> Vec<Range<usize>> {
    let mut results = Vec::new();
    collect_box_ranges(data, range, path, &mut results);
    results
}

fn collect_box_ranges(
    data: &[u8],
    range: Range<usize>,
    path: &[[u8; 4]],
    results: &mut Vec<Range<usize>>,
) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };

    for parsed in boxes(data, range) {
        if parsed.fourcc != *head {
            continue;
        }

        if rest.is_empty() {
            results.push(parsed.body());
        } else {
            collect_box_ranges(data, parsed.body(), rest, results);
        }
    }
}

pub(crate) fn first_box_range(
    data: &[u8],
    range: Range<usize>,
    path: &[[u8; 4]],
) -> Option<Range<usize>> {
    find_box_ranges(data, range, path).into_iter().next()
}

pub(crate) fn find_box_slices<'a>(data: &'a [u8], path: &[[u8; 4]]) -> Vec<&'a [u8]> {
    find_box_ranges(data, 0..data.len(), path)
        .into_iter()
        .map(|range| &data[range])
        .collect()
}

pub(crate) fn first_box<'a>(data: &'a [u8], path: &[[u8; 4]]) -> Option<&'a [u8]> {
    first_box_range(data, 0..data.len(), path).map(|range| &data[range])
}

/// Finds the payloads of every box matching `path`, as zero-copy slices.
///
/// ```
/// # use bytes::Bytes;
/// # use isobmff::find_box;
/// let data = Bytes::from_static(b"\x00\x00\x00\x0cmoov\x01\x02\x03\x04");
/// let found = find_box(&data, &[*b"moov"]);
/// assert_eq!(found[0].as_ref(), &[1, 2, 3, 4]);
/// ```
pub fn find_box(data: &Bytes, path: &[[u8; 4]]) -> Vec<Bytes> {
    find_box_ranges(data, 0..data.len(), path)
        .into_iter()
        .map(|range| data.slice(range))
        .collect()
}

/// Returns `true` if a top-level `moof` box is present.
pub fn has_moof_data(data: &[u8]) -> bool {
    let end = data.len();
    let mut offset = 0;
    while offset + BOX_HEADER_SIZE <= end {
        let Some(size) = read_u32(data, offset).map(|size| size as usize) else {
            break;
        };
        if size > BOX_HEADER_SIZE && &data[offset + 4..offset + 8] == b"moof" {
            return true;
        }
        offset = if size > 1 { offset.saturating_add(size) } else { end };
    }
    false
}

/// Builds a box from a type and its concatenated payload parts.
pub fn mp4_box(fourcc: [u8; 4], payloads: &[&[u8]]) -> Bytes {
    let size = BOX_HEADER_SIZE + payloads.iter().map(|p| p.len()).sum::<usize>();
    let mut out = BytesMut::with_capacity(size);
    out.put_u32(size as u32);
    out.put_slice(&fourcc);
    for payload in payloads {
        out.put_slice(payload);
    }
    out.freeze()
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;
    use crate::test_support::make_box;

    #[test]
    fn test_read_box_header_basic() {
        let data = [
            0x00, 0x00, 0x00, 0x10, b'f', b't', b'y', b'p', 0, 0, 0, 0, 0, 0, 0, 0,
        ];
        let (size, fourcc) = read_box_header(&data).unwrap();
        assert_eq!(size, 16);
        assert_eq!(fourcc, *b"ftyp");
    }

    #[test]
    fn test_read_box_header_size_zero_and_one() {
        let data = [0x00, 0x00, 0x00, 0x00, b't', b'e', b's', b't', 1, 2, 3];
        assert_eq!(read_box_header(&data).unwrap().0, 11);

        let data = [0x00, 0x00, 0x00, 0x01, b't', b'e', b's', b't', 1, 2, 3];
        assert_eq!(read_box_header(&data).unwrap().0, 11);
    }

    #[test]
    fn test_read_box_header_too_short() {
        assert!(read_box_header(&[0; 7]).is_none());
        assert!(read_box_header(&[]).is_none());
    }

    #[test]
    fn test_find_box_no_match_is_empty() {
        let data = Bytes::from(make_box(b"free", &[0; 4]));
        assert!(find_box(&data, &[*b"moov"]).is_empty());
        assert!(find_box(&data, &[]).is_empty());
    }

    #[test]
    fn test_find_box_returns_siblings_in_order() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&make_box(b"trak", &[1]));
        buf.extend_from_slice(&make_box(b"free", &[9]));
        buf.extend_from_slice(&make_box(b"trak", &[2]));
        buf.extend_from_slice(&make_box(b"trak", &[3]));
        let data = Bytes::from(buf);

        let found = find_box(&data, &[*b"trak"]);
        let payloads: Vec<&[u8]> = found.iter().map(|b| b.as_ref()).collect();
        assert_eq!(payloads, [&[1u8][..], &[2], &[3]]);
    }

    #[test]
    fn test_find_box_nested_path() {
        let tkhd = make_box(b"tkhd", &[7, 7]);
        let trak_a = make_box(b"trak", &tkhd);
        let trak_b = make_box(b"trak", &make_box(b"mdia", &[]));
        let moov = make_box(b"moov", &[trak_a, trak_b].concat());
        let data = Bytes::from(moov);

        let found = find_box(&data, &[*b"moov", *b"trak", *b"tkhd"]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].as_ref(), &[7, 7]);

        let traks = find_box(&data, &[*b"moov", *b"trak"]);
        assert_eq!(traks.len(), 2);
    }

    #[test]
    fn test_find_box_stops_at_overrun() {
        let mut buf = make_box(b"trak", &[1, 2]);
        // Second box claims 64 bytes but only 12 remain.
        buf.extend_from_slice(&64u32.to_be_bytes());
        buf.extend_from_slice(b"trak");
        buf.extend_from_slice(&[0; 4]);
        let data = Bytes::from(buf);

        let found = find_box(&data, &[*b"trak"]);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_find_box_size_zero_extends_to_parent_end() {
        let mut inner = Vec::new();
        inner.extend_from_slice(&0u32.to_be_bytes());
        inner.extend_from_slice(b"mdat");
        inner.extend_from_slice(&[5, 6, 7]);
        let data = Bytes::from(make_box(b"moof", &inner));

        let found = find_box(&data, &[*b"moof", *b"mdat"]);
        assert_eq!(found[0].as_ref(), &[5, 6, 7]);
    }

    #[test]
    fn test_has_moof_data() {
        let mut buf = make_box(b"styp", &[0; 4]);
        assert!(!has_moof_data(&buf));
        buf.extend_from_slice(&make_box(b"moof", &[0; 8]));
        assert!(has_moof_data(&buf));
        assert!(!has_moof_data(&make_box(b"moof", &[])));
    }

    #[test]
    fn test_mp4_box_layout() {
        let built = mp4_box(*b"free", &[&[1, 2], &[3]]);
        assert_eq!(built.as_ref(), &[0, 0, 0, 11, b'f', b'r', b'e', b'e', 1, 2, 3]);
        assert_eq!(built.as_ref(), make_box(b"free", &[1, 2, 3]).as_slice());
    }
}
