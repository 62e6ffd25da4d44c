//! Media fragment timing.
//!
//! Walks `moof/traf` boxes to compute per-track decode start, accumulated
//! sample duration, sample count and the first key frame, falling back to a
//! top-level `sidx` when a fragment carries no usable sample durations.

use std::collections::BTreeMap;
use std::ops::Range;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::box_utils::{BOX_HEADER_SIZE, find_box_ranges, find_box_slices, first_box};
use crate::error::{Diagnostics, ParseDiagnostic};
use crate::init::{InitData, TrackDescriptor};
use crate::reader::{FieldReader, read_u32, read_u64, write_u32};
use crate::sidx::parse_segment_index;
use crate::types::{TrackId, TrackKind};

/// Timescale assumed for tracks whose `mdhd` declares zero.
const FALLBACK_TIMESCALE: u32 = 90_000;

/// `sample_is_non_sync_sample` bit of the ISO sample flags.
const SAMPLE_IS_NON_SYNC: u32 = 0x0001_0000;

pub(crate) mod tfhd_flags {
    pub const BASE_DATA_OFFSET: u32 = 0x00_0001;
    pub const SAMPLE_DESCRIPTION_INDEX: u32 = 0x00_0002;
    pub const DEFAULT_SAMPLE_DURATION: u32 = 0x00_0008;
    pub const DEFAULT_SAMPLE_SIZE: u32 = 0x00_0010;
}

pub(crate) mod trun_flags {
    pub const DATA_OFFSET: u32 = 0x00_0001;
    pub const FIRST_SAMPLE_FLAGS: u32 = 0x00_0004;
    pub const SAMPLE_DURATION: u32 = 0x00_0100;
    pub const SAMPLE_SIZE: u32 = 0x00_0200;
    pub const SAMPLE_FLAGS: u32 = 0x00_0400;
    pub const SAMPLE_COMPOSITION_TIME_OFFSET: u32 = 0x00_0800;
    /// Flags that add a field to every sample entry.
    pub const PER_SAMPLE_FIELDS: u32 =
        SAMPLE_DURATION | SAMPLE_SIZE | SAMPLE_FLAGS | SAMPLE_COMPOSITION_TIME_OFFSET;
}

/// Timing accumulated for one track over a fragment buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackTimes {
    /// Smallest `tfdt` base media decode time seen, in timescale units.
    pub start: Option<u64>,
    /// Sum of sample durations, in timescale units.
    pub duration: u64,
    /// Samples declared by all `trun` boxes of the track.
    pub sample_count: u64,
    /// Track timescale from the init segment.
    pub timescale: u32,
    /// Track role from the init segment.
    pub kind: TrackKind,
    /// Index of the first sync sample, counted from the first sample of the buffer.
    pub key_frame_index: Option<u64>,
    /// Decode time of the first sync sample.
    pub key_frame_start: Option<u64>,
}

impl TrackTimes {
    fn new(track: &TrackDescriptor) -> Self {
        Self {
            start: None,
            duration: 0,
            sample_count: 0,
            timescale: track.timescale,
            kind: track.kind,
            key_frame_index: None,
            key_frame_start: None,
        }
    }

    /// Duration in seconds, `None` when the timescale is zero.
    pub fn duration_secs(&self) -> Option<f64> {
        (self.timescale != 0).then(|| self.duration as f64 / f64::from(self.timescale))
    }

    /// Start time in seconds, `None` when no `tfdt` was seen or the timescale is zero.
    pub fn start_secs(&self) -> Option<f64> {
        let start = self.start?;
        (self.timescale != 0).then(|| start as f64 / f64::from(self.timescale))
    }
}

/// Reads the base media decode time of a `tfdt` payload.
///
/// Version 1 values whose high word is `0xFFFFFFFF` come from writers that
/// stored a negative signed time; those are reported and ignored.
fn read_tfdt(tfdt: &[u8], track_id: TrackId, diag: &mut Diagnostics) -> Option<u64> {
    let version = *tfdt.first()?;
    if version == 0 {
        return read_u32(tfdt, 4).map(u64::from);
    }
    if read_u32(tfdt, 4)? == u32::MAX {
        diag.push(ParseDiagnostic::InvalidTfdtHighWord { track_id });
        return None;
    }
    read_u64(tfdt, 4)
}

/// Default sample duration from `tfhd`, or the `trex` default when absent.
fn default_sample_duration(tfhd: &[u8], track: &TrackDescriptor) -> u32 {
    let fallback = track.defaults.map_or(0, |d| d.duration);
    let Some(flags) = read_u32(tfhd, 0).map(|f| f & 0x00FF_FFFF) else {
        return fallback;
    };
    if flags & tfhd_flags::DEFAULT_SAMPLE_DURATION == 0 {
        return fallback;
    }

    let mut offset = 8;
    if flags & tfhd_flags::BASE_DATA_OFFSET != 0 {
        offset += 8;
    }
    if flags & tfhd_flags::SAMPLE_DESCRIPTION_INDEX != 0 {
        offset += 4;
    }
    read_u32(tfhd, offset).unwrap_or(fallback)
}

/// Adds one `trun` to `times`, with sample decode times starting at `dts`.
///
/// Returns the decode time following the last sample of the run.
fn accumulate_trun(
    trun: &[u8],
    default_duration: u32,
    dts: u64,
    times: &mut TrackTimes,
) -> Result<u64, ParseDiagnostic> {
    let mut reader = FieldReader::new(trun, "trun");
    let flags = reader.u32()? & 0x00FF_FFFF;
    let sample_count = reader.u32()?;

    let first_index = times.sample_count;
    times.sample_count = times.sample_count.saturating_add(u64::from(sample_count));

    if flags & trun_flags::DATA_OFFSET != 0 {
        reader.skip(4)?;
    }
    let first_sample_flags = if flags & trun_flags::FIRST_SAMPLE_FLAGS != 0 {
        Some(reader.u32()?)
    } else {
        None
    };

    if flags & trun_flags::PER_SAMPLE_FIELDS == 0 {
        // No sample table: every sample has the default duration and only the
        // first one can carry flags.
        if sample_count > 0
            && let Some(first) = first_sample_flags
            && first & SAMPLE_IS_NON_SYNC == 0
            && times.key_frame_index.is_none()
        {
            times.key_frame_index = Some(first_index);
            times.key_frame_start = Some(dts);
        }
        let raw_duration = u64::from(default_duration) * u64::from(sample_count);
        times.duration = times.duration.saturating_add(raw_duration);
        return Ok(dts.saturating_add(raw_duration));
    }

    let mut dts = dts;
    let mut raw_duration: u64 = 0;
    let mut explicit_durations = false;
    for i in 0..u64::from(sample_count) {
        let duration = if flags & trun_flags::SAMPLE_DURATION != 0 {
            explicit_durations = true;
            reader.u32()?
        } else {
            default_duration
        };
        if flags & trun_flags::SAMPLE_SIZE != 0 {
            reader.skip(4)?;
        }
        let sample_flags = if flags & trun_flags::SAMPLE_FLAGS != 0 {
            Some(reader.u32()?)
        } else {
            None
        };
        if flags & trun_flags::SAMPLE_COMPOSITION_TIME_OFFSET != 0 {
            reader.skip(4)?;
        }

        let sample_flags = match (i, first_sample_flags) {
            (0, Some(first)) => Some(first),
            _ => sample_flags,
        };
        if let Some(sample_flags) = sample_flags
            && sample_flags & SAMPLE_IS_NON_SYNC == 0
            && times.key_frame_index.is_none()
        {
            times.key_frame_index = Some(first_index + i);
            times.key_frame_start = Some(dts);
        }

        raw_duration = raw_duration.saturating_add(u64::from(duration));
        dts = dts.saturating_add(u64::from(duration));
    }

    if !explicit_durations && raw_duration == 0 {
        raw_duration = u64::from(default_duration) * u64::from(sample_count);
    }
    times.duration = times.duration.saturating_add(raw_duration);
    Ok(dts)
}

/// Compute per-track timing for every `moof/traf` of `fragment` whose track
/// is known to `init`.
pub fn parse_fragment_times(
    fragment: &[u8],
    init: &InitData,
    diag: &mut Diagnostics,
) -> BTreeMap<TrackId, TrackTimes> {
    let mut tracks: BTreeMap<TrackId, TrackTimes> = BTreeMap::new();

    for traf in find_box_slices(fragment, &[*b"moof", *b"traf"]) {
        let Some(tfhd) = first_box(traf, &[*b"tfhd"]) else {
            diag.push(ParseDiagnostic::MissingBox {
                context: "traf",
                fourcc: (*b"tfhd").into(),
            });
            continue;
        };
        let Some(track_id) = read_u32(tfhd, 4).map(TrackId) else {
            diag.push(ParseDiagnostic::Truncated { context: "tfhd" });
            continue;
        };
        let Some(track) = init.get(track_id) else {
            trace!(%track_id, "Skipping traf for unknown track");
            continue;
        };
        let times = tracks
            .entry(track_id)
            .or_insert_with(|| TrackTimes::new(track));

        let base_time = first_box(traf, &[*b"tfdt"])
            .and_then(|tfdt| read_tfdt(tfdt, track_id, diag));
        if let Some(base_time) = base_time
            && times.start.is_none_or(|start| base_time < start)
        {
            times.start = Some(base_time);
        }

        // Local tfhd flags only; trex carries sample flags, not tfhd flags.
        let default_duration = default_sample_duration(tfhd, track);
        let mut dts = base_time.or(times.start).unwrap_or(0);
        for trun in find_box_slices(traf, &[*b"trun"]) {
            match accumulate_trun(trun, default_duration, dts, times) {
                Ok(next) => dts = next,
                Err(d) => diag.push(d),
            }
        }
    }

    apply_sidx_fallback(fragment, &mut tracks, diag);
    tracks
}

/// Estimate durations from the top-level `sidx` boxes for tracks that
/// accumulated no sample duration.
fn apply_sidx_fallback(
    fragment: &[u8],
    tracks: &mut BTreeMap<TrackId, TrackTimes>,
    diag: &mut Diagnostics,
) {
    if tracks.values().all(|t| t.duration != 0) {
        return;
    }

    let mut min_start = f64::INFINITY;
    let mut max_end = 0.0f64;
    for sidx in find_box_slices(fragment, &[*b"sidx"]) {
        let Some(index) = parse_segment_index(sidx, diag) else {
            continue;
        };
        let start = index.earliest_presentation_time as f64 / f64::from(index.timescale);
        let total: f64 = index.references.iter().map(|r| r.info.duration).sum();
        min_start = min_start.min(start);
        max_end = max_end.max(start + total);
    }
    if max_end <= 0.0 || !max_end.is_finite() {
        return;
    }

    for (track_id, times) in tracks.iter_mut().filter(|(_, t)| t.duration == 0) {
        let timescale = f64::from(times.timescale);
        if times.start.is_none() && min_start.is_finite() {
            times.start = Some((min_start * timescale).round() as u64);
        }
        let start = times.start.unwrap_or(0) as f64;
        times.duration = (max_end * timescale - start).max(0.0).round() as u64;
        debug!(
            %track_id,
            duration = times.duration,
            "Using sidx duration for track without sample durations"
        );
    }
}

/// Earliest fragment decode time across known tracks, in seconds.
pub fn start_dts(init: &InitData, fragment: &[u8]) -> Option<f64> {
    let mut diag = Diagnostics::new();
    let mut result: Option<f64> = None;

    for traf in find_box_slices(fragment, &[*b"moof", *b"traf"]) {
        let Some(tfdt) = first_box(traf, &[*b"tfdt"]) else {
            continue;
        };
        for tfhd in find_box_slices(traf, &[*b"tfhd"]) {
            let Some(track) = read_u32(tfhd, 4).and_then(|id| init.get(TrackId(id))) else {
                continue;
            };
            let Some(base_time) = read_tfdt(tfdt, track.id, &mut diag) else {
                continue;
            };
            let timescale = effective_timescale(track);
            let start = base_time as f64 / f64::from(timescale);
            if start.is_finite() && result.is_none_or(|r| start < r) {
                result = Some(start);
            }
        }
    }
    result
}

#[inline]
fn effective_timescale(track: &TrackDescriptor) -> u32 {
    if track.timescale == 0 {
        FALLBACK_TIMESCALE
    } else {
        track.timescale
    }
}

/// Shift every known track's `tfdt` back by `time_offset` seconds, in place.
///
/// Results below zero are clamped to zero. Version 0 boxes saturate at
/// `u32::MAX` since their field cannot grow.
pub fn offset_start_dts(init: &InitData, fragment: &mut [u8], time_offset: f64) {
    let mut patches: Vec<(Range<usize>, u32)> = Vec::new();
    for traf in find_box_ranges(fragment, 0..fragment.len(), &[*b"moof", *b"traf"]) {
        for tfhd in find_box_ranges(fragment, traf.clone(), &[*b"tfhd"]) {
            let Some(track) = read_u32(&fragment[tfhd], 4).and_then(|id| init.get(TrackId(id)))
            else {
                continue;
            };
            let timescale = effective_timescale(track);
            for tfdt in find_box_ranges(fragment, traf.clone(), &[*b"tfdt"]) {
                patches.push((tfdt, timescale));
            }
        }
    }

    for (tfdt, timescale) in patches {
        let offset = (time_offset * f64::from(timescale)).round() as i128;
        if offset == 0 {
            continue;
        }
        let body = &mut fragment[tfdt];
        let Some(&version) = body.first() else {
            continue;
        };

        if version == 0 {
            let Some(base) = read_u32(body, 4) else {
                continue;
            };
            let shifted = (i128::from(base) - offset).clamp(0, i128::from(u32::MAX)) as u32;
            write_u32(body, 4, shifted);
        } else {
            let Some(base) = read_u64(body, 4) else {
                continue;
            };
            let shifted = (i128::from(base) - offset).clamp(0, i128::from(u64::MAX)) as u64;
            write_u32(body, 4, (shifted >> 32) as u32);
            write_u32(body, 8, shifted as u32);
        }
    }
}

/// Complete and trailing parts of a partially received fragmented buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentValidRange {
    /// Everything before the last `moof`, when at least two are present.
    pub valid: Option<Bytes>,
    /// The last, possibly incomplete, fragment (or the whole buffer).
    pub remainder: Bytes,
}

/// Split `data` at the start of its last top-level `moof`.
///
/// With fewer than two fragments nothing is known to be complete yet.
pub fn segment_valid_range(data: &Bytes) -> SegmentValidRange {
    let moofs = find_box_ranges(data, 0..data.len(), &[*b"moof"]);
    match moofs.as_slice() {
        [_, .., last] => {
            let split = last.start - BOX_HEADER_SIZE;
            SegmentValidRange {
                valid: Some(data.slice(..split)),
                remainder: data.slice(split..),
            }
        }
        _ => SegmentValidRange {
            valid: None,
            remainder: data.clone(),
        },
    }
}

/// Longest track duration of `fragment`, in seconds.
pub fn fragment_duration(fragment: &[u8], init: &InitData, diag: &mut Diagnostics) -> Option<f64> {
    parse_fragment_times(fragment, init, diag)
        .values()
        .filter_map(TrackTimes::duration_secs)
        .reduce(f64::max)
}
