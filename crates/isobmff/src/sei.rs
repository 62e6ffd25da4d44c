//! SEI user data extraction from fragmented video samples.
//!
//! Finds SEI NAL units in the length-prefixed samples of a track and yields
//! ATSC A/53 caption byte pairs (`user_data_registered_itu_t_t35`) and
//! `user_data_unregistered` payloads with their presentation times.

use std::borrow::Cow;

use memchr::memmem;
use tracing::trace;
use uuid::Uuid;

use crate::box_utils::{find_box_ranges, find_box_slices, first_box};
use crate::error::{Diagnostics, ParseDiagnostic};
use crate::fragment::{tfhd_flags, trun_flags};
use crate::init::TrackDescriptor;
use crate::reader::{FieldReader, read_u32, read_u64};
use crate::types::{TrackId, TrackKind};

const SEI_USER_DATA_REGISTERED: u32 = 4;
const SEI_USER_DATA_UNREGISTERED: u32 = 5;

const ITU_T_T35_COUNTRY_USA: u8 = 181;
const ATSC_PROVIDER_CODE: u16 = 49;
const ATSC_USER_IDENTIFIER: &[u8; 4] = b"GA94";
const CC_DATA_USER_DATA_TYPE: u8 = 3;

const H264_NAL_SEI: u8 = 6;
const HEVC_NAL_PREFIX_SEI: u8 = 39;
const HEVC_NAL_SUFFIX_SEI: u8 = 40;

/// Raw CEA-608/708 `cc_data` from an ATSC A/53 SEI payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionData {
    /// SEI payload type, `4`.
    pub payload_type: u32,
    /// `user_data_type_code`, always `3` (cc_data).
    pub user_data_type: u8,
    /// Presentation time in seconds.
    pub pts: f64,
    /// `cc_data` starting at the flags/count byte; empty when `process_cc_data_flag` is clear.
    pub bytes: Vec<u8>,
}

/// A `user_data_unregistered` SEI payload.
#[derive(Debug, Clone, PartialEq)]
pub struct UnregisteredUserData {
    /// SEI payload type, `5`.
    pub payload_type: u32,
    /// Presentation time in seconds.
    pub pts: f64,
    /// `uuid_iso_iec_11578` of the payload.
    pub uuid: Uuid,
    /// Payload decoded as UTF-8 (lossy) with NUL bytes removed.
    pub user_data: String,
    /// Payload bytes following the UUID.
    pub user_data_bytes: Vec<u8>,
}

/// User data found in one SEI message.
#[derive(Debug, Clone, PartialEq)]
pub enum UserdataSample {
    /// ATSC A/53 captions.
    Captions(CaptionData),
    /// Unregistered user data.
    Unregistered(UnregisteredUserData),
}

impl UserdataSample {
    /// Presentation time in seconds.
    pub fn pts(&self) -> f64 {
        match self {
            Self::Captions(c) => c.pts,
            Self::Unregistered(u) => u.pts,
        }
    }
}

/// Remove emulation prevention bytes (`00 00 03` becomes `00 00`).
///
/// Borrows the input when there is nothing to remove.
pub fn discard_epb(data: &[u8]) -> Cow<'_, [u8]> {
    let positions: Vec<usize> = memmem::find_iter(data, &[0x00, 0x00, 0x03])
        .filter(|&pos| pos >= 1)
        .map(|pos| pos + 2)
        .collect();
    if positions.is_empty() {
        return Cow::Borrowed(data);
    }

    let mut out = Vec::with_capacity(data.len() - positions.len());
    let mut start = 0;
    for pos in positions {
        out.extend_from_slice(&data[start..pos]);
        start = pos + 1;
    }
    out.extend_from_slice(&data[start..]);
    Cow::Owned(out)
}

/// Read an SEI `payloadType`/`payloadSize` value (a sum of bytes continued by `0xFF`).
fn read_sei_value(data: &[u8], pos: &mut usize) -> u32 {
    let mut value = 0u32;
    while let Some(&b) = data.get(*pos) {
        *pos += 1;
        value = value.saturating_add(u32::from(b));
        if b != 0xFF {
            break;
        }
    }
    value
}

/// Parse the SEI messages of one NAL unit, appending user data to `out`.
///
/// `header_size` is the NAL header length: 1 for H.264, 2 for HEVC.
pub fn parse_sei_message(
    nal: &[u8],
    header_size: usize,
    pts: f64,
    out: &mut Vec<UserdataSample>,
    diag: &mut Diagnostics,
) {
    let data = discard_epb(nal);
    let mut pos = header_size;

    while pos < data.len() {
        let payload_type = read_sei_value(&data, &mut pos);
        let payload_size = read_sei_value(&data, &mut pos) as usize;

        let remaining = data.len().saturating_sub(pos);
        if payload_size > remaining {
            diag.push(ParseDiagnostic::MalformedSeiPayload {
                payload_size,
                remaining,
            });
            return;
        }
        let payload = &data[pos..pos + payload_size];
        pos += payload_size;

        match payload_type {
            SEI_USER_DATA_REGISTERED => {
                if let Ok(Some(bytes)) = read_atsc_cc_data(payload) {
                    out.push(UserdataSample::Captions(CaptionData {
                        payload_type,
                        user_data_type: CC_DATA_USER_DATA_TYPE,
                        pts,
                        bytes,
                    }));
                }
            }
            SEI_USER_DATA_UNREGISTERED if payload_size > 16 => {
                let (uuid, user_data_bytes) = payload.split_at(16);
                let uuid = Uuid::from_slice(uuid).unwrap_or_default();
                let user_data = String::from_utf8_lossy(user_data_bytes).replace('\0', "");
                out.push(UserdataSample::Unregistered(UnregisteredUserData {
                    payload_type,
                    pts,
                    uuid,
                    user_data,
                    user_data_bytes: user_data_bytes.to_vec(),
                }));
            }
            _ => {}
        }
    }
}

/// Extract `cc_data` from an ITU-T T.35 payload carrying ATSC A/53 captions.
///
/// Returns `Ok(None)` for T.35 payloads of other providers or types.
fn read_atsc_cc_data(payload: &[u8]) -> Result<Option<Vec<u8>>, ParseDiagnostic> {
    let mut reader = FieldReader::new(payload, "sei t35");
    if reader.u8()? != ITU_T_T35_COUNTRY_USA
        || reader.u16()? != ATSC_PROVIDER_CODE
        || reader.bytes(4)? != ATSC_USER_IDENTIFIER
        || reader.u8()? != CC_DATA_USER_DATA_TYPE
    {
        return Ok(None);
    }

    let first = reader.u8()?;
    if first & 0x40 == 0 {
        return Ok(Some(Vec::new()));
    }
    let cc_count = usize::from(first & 0x1F);
    // em_data byte followed by three bytes per cc
    let len = (1 + cc_count * 3).min(reader.remaining());
    let mut bytes = Vec::with_capacity(len + 1);
    bytes.push(first);
    bytes.extend_from_slice(reader.bytes(len)?);
    Ok(Some(bytes))
}

/// Whether a codec string names an HEVC based sample entry.
fn is_hevc(codec: &str) -> bool {
    matches!(codec.get(..4), Some("hvc1" | "hev1" | "dvh1" | "dvhe"))
}

fn is_sei_nal(hevc: bool, header: u8) -> bool {
    if hevc {
        let nal_type = (header >> 1) & 0x3F;
        nal_type == HEVC_NAL_PREFIX_SEI || nal_type == HEVC_NAL_SUFFIX_SEI
    } else {
        header & 0x1F == H264_NAL_SEI
    }
}

struct TrafDefaults {
    duration: u32,
    size: u32,
}

fn read_tfhd_defaults(tfhd: &[u8]) -> TrafDefaults {
    let flags = read_u32(tfhd, 0).unwrap_or(0) & 0x00FF_FFFF;
    let mut offset = 8;
    if flags & tfhd_flags::BASE_DATA_OFFSET != 0 {
        offset += 8;
    }
    if flags & tfhd_flags::SAMPLE_DESCRIPTION_INDEX != 0 {
        offset += 4;
    }
    let mut defaults = TrafDefaults {
        duration: 0,
        size: 0,
    };
    if flags & tfhd_flags::DEFAULT_SAMPLE_DURATION != 0 {
        defaults.duration = read_u32(tfhd, offset).unwrap_or(0);
        offset += 4;
    }
    if flags & tfhd_flags::DEFAULT_SAMPLE_SIZE != 0 {
        defaults.size = read_u32(tfhd, offset).unwrap_or(0);
    }
    defaults
}

/// Scan state shared across the fragments of one `parse_samples` call.
struct SampleScan<'a> {
    payload: &'a [u8],
    track_id: TrackId,
    timescale: f64,
    hevc: bool,
    time: f64,
}

impl SampleScan<'_> {
    fn scan_trun(
        &mut self,
        trun: &[u8],
        moof_start: usize,
        defaults: &TrafDefaults,
        out: &mut Vec<UserdataSample>,
        diag: &mut Diagnostics,
    ) -> Result<(), ParseDiagnostic> {
        let mut reader = FieldReader::new(trun, "trun");
        let version = reader.u8()?;
        reader.skip(3)?;
        let flags = read_u32(trun, 0).unwrap_or(0) & 0x00FF_FFFF;
        let sample_count = reader.u32()?;

        let mut data_offset = 0u32;
        if flags & trun_flags::DATA_OFFSET != 0 {
            data_offset = reader.u32()?;
        }
        if flags & trun_flags::FIRST_SAMPLE_FLAGS != 0 {
            reader.skip(4)?;
        }

        if flags & trun_flags::PER_SAMPLE_FIELDS == 0 && defaults.size == 0 {
            // Empty samples hold no NAL units; only the clock advances.
            self.time += f64::from(sample_count) * f64::from(defaults.duration) / self.timescale;
            return Ok(());
        }

        let mut sample_offset = moof_start.saturating_add(data_offset as usize);
        for _ in 0..sample_count {
            if sample_offset > self.payload.len() {
                return Err(ParseDiagnostic::SampleOutOfBounds {
                    track_id: self.track_id,
                    offset: sample_offset,
                });
            }
            let duration = if flags & trun_flags::SAMPLE_DURATION != 0 {
                reader.u32()?
            } else {
                defaults.duration
            };
            let size = if flags & trun_flags::SAMPLE_SIZE != 0 {
                reader.u32()?
            } else {
                defaults.size
            };
            if flags & trun_flags::SAMPLE_FLAGS != 0 {
                reader.skip(4)?;
            }
            let composition_offset = if flags & trun_flags::SAMPLE_COMPOSITION_TIME_OFFSET != 0 {
                if version == 0 {
                    f64::from(reader.u32()?)
                } else {
                    f64::from(reader.i32()?)
                }
            } else {
                0.0
            };

            let pts = self.time + composition_offset / self.timescale;
            self.scan_sample(&mut sample_offset, size as usize, pts, out, diag)?;
            self.time += f64::from(duration) / self.timescale;
        }
        Ok(())
    }

    /// Walk the length-prefixed NAL units of one sample.
    fn scan_sample(
        &self,
        sample_offset: &mut usize,
        size: usize,
        pts: f64,
        out: &mut Vec<UserdataSample>,
        diag: &mut Diagnostics,
    ) -> Result<(), ParseDiagnostic> {
        let out_of_bounds = |offset| ParseDiagnostic::SampleOutOfBounds {
            track_id: self.track_id,
            offset,
        };
        let header_size = if self.hevc { 2 } else { 1 };

        let mut consumed = 0;
        while consumed < size {
            let nal_size =
                read_u32(self.payload, *sample_offset).ok_or_else(|| out_of_bounds(*sample_offset))?
                    as usize;
            *sample_offset += 4;
            let nal = self
                .payload
                .get(*sample_offset..sample_offset.saturating_add(nal_size))
                .ok_or_else(|| out_of_bounds(*sample_offset))?;

            if let Some(&header) = nal.first()
                && is_sei_nal(self.hevc, header)
            {
                trace!(track_id = %self.track_id, pts, nal_size, "Parsing SEI NAL unit");
                parse_sei_message(nal, header_size, pts, out, diag);
            }
            *sample_offset += nal_size;
            consumed += nal_size + 4;
        }
        Ok(())
    }
}

/// Extract SEI user data from every sample of `track` in a fragment buffer.
///
/// Sample times start at each `traf`'s `tfdt`; `time_offset` (seconds) is
/// used until the first `tfdt` is seen. Non-video tracks yield nothing.
pub fn parse_samples(
    time_offset: f64,
    track: &TrackDescriptor,
    payload: &[u8],
    diag: &mut Diagnostics,
) -> Vec<UserdataSample> {
    let mut out = Vec::new();
    if track.kind != TrackKind::Video {
        return out;
    }
    if track.timescale == 0 {
        diag.push(ParseDiagnostic::InvalidTimescale {
            context: "sei track",
        });
        return out;
    }

    let mut scan = SampleScan {
        payload,
        track_id: track.id,
        timescale: f64::from(track.timescale),
        hevc: is_hevc(track.codec.codec()),
        time: time_offset,
    };

    for moof in find_box_ranges(payload, 0..payload.len(), &[*b"moof"]) {
        let moof_start = moof.start - 8;
        for traf in find_box_ranges(payload, moof, &[*b"traf"]) {
            let traf = &payload[traf];
            if let Some(tfdt) = first_box(traf, &[*b"tfdt"]) {
                let base_time = match tfdt.first() {
                    Some(0) => read_u32(tfdt, 4).map(u64::from),
                    _ => read_u64(tfdt, 4),
                };
                if let Some(base_time) = base_time {
                    scan.time = base_time as f64 / scan.timescale;
                }
            }

            let Some(tfhd) = first_box(traf, &[*b"tfhd"]) else {
                continue;
            };
            if read_u32(tfhd, 4) != Some(track.id.0) {
                continue;
            }
            let defaults = read_tfhd_defaults(tfhd);

            for trun in find_box_slices(traf, &[*b"trun"]) {
                if let Err(d) = scan.scan_trun(trun, moof_start, &defaults, &mut out, diag) {
                    diag.push(d);
                }
            }
        }
    }
    out
}
