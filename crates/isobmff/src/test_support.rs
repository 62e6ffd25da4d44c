//! Shared ISOBMFF test builders.
//!
//! This module is available for local tests and optionally for downstream
//! crate tests and benches when the `test-utils` feature is enabled.

use bytes::Bytes;

use crate::codec::{AUDIO_SAMPLE_ENTRY_BODY, VISUAL_SAMPLE_ENTRY_BODY};

/// Route parser diagnostics to the test output.
#[cfg(test)]
#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// Plain box: size, type, body.
pub fn make_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let size = (8 + body.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
    out
}

/// Full box: version and 24-bit flags precede `payload`.
pub fn make_full_box(fourcc: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.push(version);
    body.push(((flags >> 16) & 0xFF) as u8);
    body.push(((flags >> 8) & 0xFF) as u8);
    body.push((flags & 0xFF) as u8);
    body.extend_from_slice(payload);
    make_box(fourcc, &body)
}

fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

/// `VisualSampleEntry` with zeroed fields and `children` appended.
pub fn make_visual_sample_entry(fourcc: &[u8; 4], children: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8; VISUAL_SAMPLE_ENTRY_BODY];
    body.extend_from_slice(children);
    make_box(fourcc, &body)
}

/// `AudioSampleEntry` with zeroed fields and `children` appended.
pub fn make_audio_sample_entry(fourcc: &[u8; 4], children: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8; AUDIO_SAMPLE_ENTRY_BODY];
    body.extend_from_slice(children);
    make_box(fourcc, &body)
}

/// `sinf` box declaring `original_format` protected with `scheme`.
pub fn make_sinf(original_format: &[u8; 4], scheme: &[u8; 4], key_id: [u8; 16]) -> Vec<u8> {
    let frma = make_box(b"frma", original_format);
    let mut schm_payload = scheme.to_vec();
    schm_payload.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    let schm = make_full_box(b"schm", 0, 0, &schm_payload);

    let mut tenc_payload = vec![0, 0, 1, 8];
    tenc_payload.extend_from_slice(&key_id);
    let tenc = make_full_box(b"tenc", 0, 0, &tenc_payload);
    let schi = make_box(b"schi", &tenc);

    make_box(b"sinf", &[frma, schm, schi].concat())
}

/// `stsd` holding `entries`.
pub fn make_stsd(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut payload = (entries.len() as u32).to_be_bytes().to_vec();
    for entry in entries {
        payload.extend_from_slice(entry);
    }
    make_full_box(b"stsd", 0, 0, &payload)
}

/// `tkhd` of the given version with `track_id` set.
pub fn make_tkhd(version: u8, track_id: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    if version == 1 {
        payload.extend_from_slice(&[0u8; 16]);
    } else {
        payload.extend_from_slice(&[0u8; 8]);
    }
    payload.extend_from_slice(&track_id.to_be_bytes());
    payload.extend_from_slice(&[0u8; 4]);
    make_full_box(b"tkhd", version, 7, &payload)
}

/// `mdhd` of the given version with `timescale` set.
pub fn make_mdhd(version: u8, timescale: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    if version == 1 {
        payload.extend_from_slice(&[0u8; 16]);
        payload.extend_from_slice(&timescale.to_be_bytes());
        payload.extend_from_slice(&[0u8; 8]);
    } else {
        payload.extend_from_slice(&[0u8; 8]);
        payload.extend_from_slice(&timescale.to_be_bytes());
        payload.extend_from_slice(&[0u8; 4]);
    }
    payload.extend_from_slice(&[0u8; 4]);
    make_full_box(b"mdhd", version, 0, &payload)
}

/// `hdlr` with `handler` as the handler type.
pub fn make_hdlr(handler: &[u8; 4]) -> Vec<u8> {
    let mut payload = vec![0u8; 4];
    payload.extend_from_slice(handler);
    payload.extend_from_slice(&[0u8; 12]);
    payload.push(0);
    make_full_box(b"hdlr", 0, 0, &payload)
}

/// A complete `trak` with `tkhd`, `mdhd`, `hdlr` and a one-entry `stsd`.
pub fn make_trak(track_id: u32, timescale: u32, handler: &[u8; 4], sample_entry: &[u8]) -> Vec<u8> {
    let stsd = make_stsd(&[sample_entry.to_vec()]);
    let stbl = make_box(b"stbl", &stsd);
    let minf = make_box(b"minf", &stbl);
    let mdia = make_box(
        b"mdia",
        &[make_mdhd(0, timescale), make_hdlr(handler), minf].concat(),
    );
    make_box(b"trak", &[make_tkhd(0, track_id), mdia].concat())
}

/// `trex` with the sample description index set to 1.
pub fn make_trex(track_id: u32, default_duration: u32, default_flags: u32) -> Vec<u8> {
    make_full_box(
        b"trex",
        0,
        0,
        &words(&[track_id, 1, default_duration, 0, default_flags]),
    )
}

/// `ftyp` followed by a `moov` holding `traks`, plus an `mvex` when `trexs` is non-empty.
pub fn make_init_segment(traks: &[Vec<u8>], trexs: &[Vec<u8>]) -> Bytes {
    let mut moov_body = make_full_box(b"mvhd", 0, 0, &[0u8; 96]);
    for trak in traks {
        moov_body.extend_from_slice(trak);
    }
    if !trexs.is_empty() {
        moov_body.extend_from_slice(&make_box(b"mvex", &trexs.concat()));
    }

    let mut out = make_box(b"ftyp", b"iso6\0\0\0\0");
    out.extend_from_slice(&make_box(b"moov", &moov_body));
    Bytes::from(out)
}

/// `tfhd` with `fields` written after the track id, in flag order.
pub fn make_tfhd(track_id: u32, flags: u32, fields: &[u32]) -> Vec<u8> {
    let mut payload = track_id.to_be_bytes().to_vec();
    payload.extend_from_slice(&words(fields));
    make_full_box(b"tfhd", 0, flags, &payload)
}

/// Version 0 `tfdt`.
pub fn make_tfdt_v0(base_time: u32) -> Vec<u8> {
    make_full_box(b"tfdt", 0, 0, &base_time.to_be_bytes())
}

/// Version 1 `tfdt`.
pub fn make_tfdt_v1(base_time: u64) -> Vec<u8> {
    make_full_box(b"tfdt", 1, 0, &base_time.to_be_bytes())
}

/// `trun` with `fields` written after the sample count: optional header
/// fields first, then the per-sample table.
pub fn make_trun(version: u8, flags: u32, sample_count: u32, fields: &[u32]) -> Vec<u8> {
    let mut payload = sample_count.to_be_bytes().to_vec();
    payload.extend_from_slice(&words(fields));
    make_full_box(b"trun", version, flags, &payload)
}

/// `moof` with an `mfhd` and one `traf` per entry of `trafs`.
pub fn make_moof(trafs: &[Vec<u8>]) -> Vec<u8> {
    let mfhd = make_full_box(b"mfhd", 0, 0, &1u32.to_be_bytes());
    let mut body = mfhd;
    for traf in trafs {
        body.extend_from_slice(&make_box(b"traf", traf));
    }
    make_box(b"moof", &body)
}

/// One `sidx` reference: `(hierarchical, size, duration)`.
pub type SidxRef = (bool, u32, u32);

/// `sidx` box with reference id 1 and no SAP information.
pub fn make_sidx(
    version: u8,
    timescale: u32,
    earliest_presentation_time: u64,
    first_offset: u64,
    references: &[SidxRef],
) -> Vec<u8> {
    let mut payload = 1u32.to_be_bytes().to_vec();
    payload.extend_from_slice(&timescale.to_be_bytes());
    if version == 0 {
        payload.extend_from_slice(&(earliest_presentation_time as u32).to_be_bytes());
        payload.extend_from_slice(&(first_offset as u32).to_be_bytes());
    } else {
        payload.extend_from_slice(&earliest_presentation_time.to_be_bytes());
        payload.extend_from_slice(&first_offset.to_be_bytes());
    }
    payload.extend_from_slice(&[0, 0]);
    payload.extend_from_slice(&(references.len() as u16).to_be_bytes());
    for &(hierarchical, size, duration) in references {
        let info = (u32::from(hierarchical) << 31) | (size & 0x7FFF_FFFF);
        payload.extend_from_slice(&words(&[info, duration, 0x9000_0000]));
    }
    make_full_box(b"sidx", version, 0, &payload)
}

/// Length-prefix each NAL unit as it appears inside an `mdat` sample.
pub fn make_length_prefixed_sample(nal_units: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in nal_units {
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

/// A single-traf fragment carrying `samples` for `track_id`.
///
/// Each sample is `(duration, composition_offset, payload)`; the `trun`
/// carries a data offset and per-sample duration, size and composition offset.
pub fn make_media_segment_for_track(
    track_id: u32,
    base_time: u32,
    samples: &[(u32, i32, Vec<u8>)],
) -> Bytes {
    let tfhd = make_tfhd(track_id, 0, &[]);
    let tfdt = make_tfdt_v0(base_time);

    // trun flags: data_offset + duration + size + composition time offset
    let trun_flags = 0x000001 | 0x000100 | 0x000200 | 0x000800;
    let mut fields = vec![0u32];
    for (duration, cto, payload) in samples {
        fields.extend_from_slice(&[*duration, payload.len() as u32, *cto as u32]);
    }
    let mut trun = make_trun(1, trun_flags, samples.len() as u32, &fields);

    // moof = header + mfhd (16) + traf header + tfhd + tfdt + trun, then the mdat header.
    let moof_len = 8 + 16 + 8 + tfhd.len() + tfdt.len() + trun.len();
    let data_offset = (moof_len + 8) as u32;
    let data_offset_pos = 8 /* box header */ + 4 /* fullbox flags */ + 4 /* sample_count */;
    trun[data_offset_pos..data_offset_pos + 4].copy_from_slice(&data_offset.to_be_bytes());

    let moof = make_moof(&[[tfhd, tfdt, trun].concat()]);
    let mdat_body: Vec<u8> = samples.iter().flat_map(|(_, _, p)| p.clone()).collect();
    let mdat = make_box(b"mdat", &mdat_body);

    let mut out = moof;
    out.extend_from_slice(&mdat);
    Bytes::from(out)
}
