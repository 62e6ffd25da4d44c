//! Common Encryption metadata: `tenc` key ids and `pssh` boxes.

use std::ops::Range;

use bytes::Bytes;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::box_utils::{find_box_ranges, first_box, first_box_range, mp4_box};
use crate::codec::{AUDIO_SAMPLE_ENTRY_BODY, VISUAL_SAMPLE_ENTRY_BODY};
use crate::error::{Diagnostics, Mp4Error, ParseDiagnostic, Result};
use crate::reader::{FieldReader, read_u32};

/// Size of a key id and a system id.
pub const KEY_ID_SIZE: usize = 16;

/// Offset of `default_KID` inside a `tenc` payload.
const TENC_KEY_ID_OFFSET: usize = 8;

/// Well-known DRM system ids.
pub mod system_ids {
    use uuid::Uuid;

    /// Google Widevine.
    pub const WIDEVINE: Uuid = Uuid::from_u128(0xedef8ba9_79d6_4ace_a3c8_27dcd51d21ed);
    /// Microsoft PlayReady.
    pub const PLAYREADY: Uuid = Uuid::from_u128(0x9a04f079_9840_4286_ab92_e65be0885f95);
    /// Apple FairPlay.
    pub const FAIRPLAY: Uuid = Uuid::from_u128(0x94ce86fb_07ff_4f43_adb8_93d2fa968ca2);
    /// W3C Clear Key.
    pub const CLEARKEY: Uuid = Uuid::from_u128(0x1077efec_c0b2_4d02_ace3_3c1e52e2fb4b);
}

fn is_supported_scheme(scheme: &[u8]) -> bool {
    scheme == b"cenc" || scheme == b"cbcs"
}

/// Returns the `schi/tenc` payload of a `sinf` payload protected with
/// `cenc` or `cbcs`. Other schemes yield `None`.
pub fn parse_sinf(sinf: &[u8]) -> Option<&[u8]> {
    let scheme = first_box(sinf, &[*b"schm"])?.get(4..8)?;
    if !is_supported_scheme(scheme) {
        trace!(scheme = %String::from_utf8_lossy(scheme), "Ignoring sinf with unsupported scheme");
        return None;
    }
    first_box(sinf, &[*b"schi", *b"tenc"])
}

fn sinf_tenc_range(data: &[u8], sinf: Range<usize>) -> Option<Range<usize>> {
    let schm = first_box_range(data, sinf.clone(), &[*b"schm"])?;
    let scheme = data[schm].get(4..8)?;
    if !is_supported_scheme(scheme) {
        return None;
    }
    first_box_range(data, sinf, &[*b"schi", *b"tenc"])
}

/// Absolute payload ranges of every `tenc` box reachable from an
/// `enca`/`encv` sample entry of `init`, in document order.
///
/// Audio entries take precedence: video entries of a track are only
/// inspected when the track has no `enca` entry.
fn tenc_ranges(init: &[u8]) -> Vec<(Range<usize>, bool)> {
    let mut out = Vec::new();
    for trak in find_box_ranges(init, 0..init.len(), &[*b"moov", *b"trak"]) {
        let Some(stsd) = first_box_range(init, trak, &[*b"mdia", *b"minf", *b"stbl", *b"stsd"])
        else {
            continue;
        };
        let entries = (stsd.start + 8).min(stsd.end)..stsd.end;

        let mut is_audio = true;
        let mut encrypted = find_box_ranges(init, entries.clone(), &[*b"enca"]);
        if encrypted.is_empty() {
            is_audio = false;
            encrypted = find_box_ranges(init, entries, &[*b"encv"]);
        }

        let body = if is_audio {
            AUDIO_SAMPLE_ENTRY_BODY
        } else {
            VISUAL_SAMPLE_ENTRY_BODY
        };
        for entry in encrypted {
            let children = (entry.start + body).min(entry.end)..entry.end;
            for sinf in find_box_ranges(init, children, &[*b"sinf"]) {
                if let Some(tenc) = sinf_tenc_range(init, sinf) {
                    out.push((tenc, is_audio));
                }
            }
        }
    }
    out
}

fn tenc_key_id(tenc: &[u8]) -> Option<[u8; KEY_ID_SIZE]> {
    tenc.get(TENC_KEY_ID_OFFSET..TENC_KEY_ID_OFFSET + KEY_ID_SIZE)?
        .try_into()
        .ok()
}

/// Collect the default key id of every protected sample entry in `init`.
pub fn parse_key_ids_from_tenc(init: &[u8], diag: &mut Diagnostics) -> Vec<[u8; KEY_ID_SIZE]> {
    let mut key_ids = Vec::new();
    for (tenc, _) in tenc_ranges(init) {
        match tenc_key_id(&init[tenc]) {
            Some(key_id) => key_ids.push(key_id),
            None => diag.push(ParseDiagnostic::Truncated { context: "tenc" }),
        }
    }
    key_ids
}

/// Write `key_id` into every `tenc` whose default key id is all zeros.
///
/// Key ids that are already set are left untouched. Returns the number of
/// boxes patched.
pub fn patch_encryption_data(
    init: &mut [u8],
    key_id: &[u8; KEY_ID_SIZE],
    diag: &mut Diagnostics,
) -> usize {
    let mut patched = 0;
    for (tenc, is_audio) in tenc_ranges(init) {
        let field = tenc.start + TENC_KEY_ID_OFFSET..tenc.start + TENC_KEY_ID_OFFSET + KEY_ID_SIZE;
        if field.end > tenc.end {
            diag.push(ParseDiagnostic::Truncated { context: "tenc" });
            continue;
        }
        let current = &mut init[field];
        if current.iter().any(|&b| b != 0) {
            continue;
        }
        debug!(
            entry = if is_audio { "enca" } else { "encv" },
            from = %hex::encode(&*current),
            to = %hex::encode(key_id),
            "Patching tenc default key id"
        );
        current.copy_from_slice(key_id);
        patched += 1;
    }
    patched
}

/// Build a `pssh` box.
///
/// Passing `key_ids` produces a version 1 box listing them; `None` produces
/// version 0. Fails when the system id or any key id is not 16 bytes.
pub fn mp4_pssh<K: AsRef<[u8]>>(
    system_id: &[u8],
    key_ids: Option<&[K]>,
    data: &[u8],
) -> Result<Bytes> {
    if system_id.len() != KEY_ID_SIZE {
        return Err(Mp4Error::InvalidSystemIdLength {
            actual: system_id.len(),
        });
    }

    let (version, kid_count, kids) = match key_ids {
        Some(key_ids) => {
            let mut kids = Vec::with_capacity(key_ids.len() * KEY_ID_SIZE);
            for (index, key_id) in key_ids.iter().enumerate() {
                let key_id = key_id.as_ref();
                if key_id.len() != KEY_ID_SIZE {
                    return Err(Mp4Error::InvalidKeyIdLength {
                        index,
                        actual: key_id.len(),
                    });
                }
                kids.extend_from_slice(key_id);
            }
            let count = (key_ids.len() as u32).to_be_bytes().to_vec();
            (1u8, count, kids)
        }
        None => (0u8, Vec::new(), Vec::new()),
    };

    let data_size = (data.len() as u32).to_be_bytes();
    Ok(mp4_box(
        *b"pssh",
        &[
            &[version, 0, 0, 0],
            system_id,
            &kid_count,
            &kids,
            &data_size,
            data,
        ],
    ))
}

/// A decoded `pssh` box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsshData {
    /// Box version; only version 1 carries key ids.
    pub version: u8,
    /// System id as lowercase hex.
    pub system_id: String,
    /// Key ids of a version 1 box.
    pub key_ids: Option<Vec<[u8; KEY_ID_SIZE]>>,
    /// System specific payload.
    pub data: Bytes,
    /// Offset of the box within the scanned buffer.
    pub offset: usize,
    /// Declared box size.
    pub size: usize,
}

impl PsshData {
    /// System id as a UUID.
    pub fn system_uuid(&self) -> Option<Uuid> {
        Uuid::try_parse(&self.system_id).ok()
    }
}

/// Result of decoding one candidate box of a `pssh` init data buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PsshRecord {
    /// A decoded box.
    Valid(PsshData),
    /// The box could not be decoded; `size` bytes may be skipped.
    Invalid {
        /// Offset of the box within the scanned buffer.
        offset: usize,
        /// Bytes covered by the box.
        size: usize,
    },
}

impl PsshRecord {
    /// Offset of the box within the scanned buffer.
    pub fn offset(&self) -> usize {
        match self {
            Self::Valid(pssh) => pssh.offset,
            Self::Invalid { offset, .. } => *offset,
        }
    }

    /// Bytes covered by the box.
    pub fn size(&self) -> usize {
        match self {
            Self::Valid(pssh) => pssh.size,
            Self::Invalid { size, .. } => *size,
        }
    }

    /// The decoded box, if valid.
    pub fn as_valid(&self) -> Option<&PsshData> {
        match self {
            Self::Valid(pssh) => Some(pssh),
            Self::Invalid { .. } => None,
        }
    }
}

fn read_pssh(
    buffer: &Bytes,
    offset: usize,
    size: usize,
) -> std::result::Result<PsshData, &'static str> {
    let view = &buffer[offset..offset + size];
    let mut reader = FieldReader::new(view, "pssh");
    let truncated = |_| "truncated";

    reader.skip(4).map_err(truncated)?;
    if reader.bytes(4).map_err(truncated)? != b"pssh" {
        return Err("not a pssh box");
    }
    let version = reader.u32().map_err(truncated)? >> 24;
    if version > 1 {
        return Err("unsupported version");
    }
    let system_id = hex::encode(reader.bytes(KEY_ID_SIZE).map_err(truncated)?);

    let key_ids = if version == 1 {
        let count = reader.u32().map_err(truncated)? as usize;
        if count == 0 {
            return Err("no key ids");
        }
        if count
            .checked_mul(KEY_ID_SIZE)
            .and_then(|len| len.checked_add(32))
            .is_none_or(|end| end > size)
        {
            return Err("key ids exceed box size");
        }
        let mut key_ids = Vec::with_capacity(count);
        for _ in 0..count {
            key_ids.push(reader.array::<KEY_ID_SIZE>().map_err(truncated)?);
        }
        Some(key_ids)
    } else {
        None
    };

    let data_len = reader.u32().map_err(truncated)? as usize;
    if data_len > reader.remaining() {
        return Err("data exceeds box size");
    }
    let data_start = offset + reader.position();
    Ok(PsshData {
        version: version as u8,
        system_id,
        key_ids,
        data: buffer.slice(data_start..data_start + data_len),
        offset,
        size,
    })
}

fn parse_pssh_at(buffer: &Bytes, offset: usize, diag: &mut Diagnostics) -> PsshRecord {
    let remaining = buffer.len() - offset;
    let declared = read_u32(buffer, offset).map_or(0, |size| size as usize);
    if declared > remaining {
        diag.push(ParseDiagnostic::InvalidPssh {
            offset,
            size: declared,
            reason: "declared size exceeds buffer",
        });
        return PsshRecord::Invalid {
            offset,
            size: remaining,
        };
    }

    match read_pssh(buffer, offset, declared) {
        Ok(pssh) => PsshRecord::Valid(pssh),
        Err(reason) => {
            diag.push(ParseDiagnostic::InvalidPssh {
                offset,
                size: declared,
                reason,
            });
            PsshRecord::Invalid {
                offset,
                size: declared,
            }
        }
    }
}

/// Decode a single `pssh` box starting at the beginning of `data`.
pub fn parse_pssh(data: &Bytes, diag: &mut Diagnostics) -> PsshRecord {
    if data.is_empty() {
        diag.push(ParseDiagnostic::InvalidPssh {
            offset: 0,
            size: 0,
            reason: "empty buffer",
        });
        return PsshRecord::Invalid { offset: 0, size: 0 };
    }
    parse_pssh_at(data, 0, diag)
}

/// Decode every `pssh` box of a concatenated init data buffer.
///
/// Invalid boxes are returned as [`PsshRecord::Invalid`] and skipped by their
/// declared size. A zero size ends the scan.
pub fn parse_multi_pssh(init_data: &Bytes, diag: &mut Diagnostics) -> Vec<PsshRecord> {
    let mut results = Vec::new();
    let mut offset = 0;
    while offset + 32 < init_data.len() {
        let record = parse_pssh_at(init_data, offset, diag);
        let size = record.size();
        results.push(record);
        if size == 0 {
            break;
        }
        offset += size;
    }
    results
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;
    use crate::test_support::{
        make_audio_sample_entry, make_box, make_init_segment, make_sinf, make_trak,
        make_visual_sample_entry,
    };

    const KID_A: [u8; 16] = [0xAA; 16];
    const KID_B: [u8; 16] = [0xBB; 16];

    fn system_id() -> [u8; 16] {
        *system_ids::WIDEVINE.as_bytes()
    }

    fn protected_init(video_kid: [u8; 16], audio_kid: [u8; 16]) -> Vec<u8> {
        let avcc = make_box(b"avcC", &[1, 0x64, 0, 0x1F]);
        let video = make_visual_sample_entry(
            b"encv",
            &[avcc, make_sinf(b"avc1", b"cenc", video_kid)].concat(),
        );
        let audio = make_audio_sample_entry(b"enca", &make_sinf(b"mp4a", b"cbcs", audio_kid));
        make_init_segment(
            &[
                make_trak(1, 90_000, b"vide", &video),
                make_trak(2, 48_000, b"soun", &audio),
            ],
            &[],
        )
        .to_vec()
    }

    #[test]
    fn test_parse_sinf_schemes() {
        let sinf = make_sinf(b"avc1", b"cenc", KID_A);
        let tenc = parse_sinf(&sinf[8..]).unwrap();
        assert_eq!(tenc_key_id(tenc), Some(KID_A));

        let sinf = make_sinf(b"avc1", b"cbc2", KID_A);
        assert!(parse_sinf(&sinf[8..]).is_none());
    }

    #[test]
    fn test_parse_key_ids_from_tenc() {
        let init = protected_init(KID_A, KID_B);
        let mut diag = Diagnostics::new();
        assert_eq!(parse_key_ids_from_tenc(&init, &mut diag), vec![KID_A, KID_B]);
        assert!(diag.is_empty());
    }

    #[test]
    fn test_patch_only_zero_key_ids() {
        let mut init = protected_init([0; 16], KID_B);
        let mut diag = Diagnostics::new();
        let patched = patch_encryption_data(&mut init, &KID_A, &mut diag);
        assert_eq!(patched, 1);
        assert_eq!(parse_key_ids_from_tenc(&init, &mut diag), vec![KID_A, KID_B]);

        assert_eq!(patch_encryption_data(&mut init, &[0xCC; 16], &mut diag), 0);
    }

    #[test]
    fn test_unsupported_scheme_is_not_patched() {
        let video = make_visual_sample_entry(b"encv", &make_sinf(b"avc1", b"cbc2", [0; 16]));
        let mut init = make_init_segment(&[make_trak(1, 90_000, b"vide", &video)], &[]).to_vec();
        let original = init.clone();
        let mut diag = Diagnostics::new();
        assert_eq!(patch_encryption_data(&mut init, &KID_A, &mut diag), 0);
        assert_eq!(init, original);
    }

    #[test]
    fn test_mp4_pssh_v0_layout() {
        let pssh = mp4_pssh::<&[u8]>(&system_id(), None, &[1, 2, 3]).unwrap();
        assert_eq!(pssh.len(), 8 + 4 + 16 + 4 + 3);
        assert_eq!(&pssh[4..8], b"pssh");
        assert_eq!(pssh[8], 0);
        assert_eq!(&pssh[28..32], &[0, 0, 0, 3]);
    }

    #[test]
    fn test_mp4_pssh_rejects_bad_ids() {
        assert_eq!(
            mp4_pssh::<&[u8]>(&[0; 15], None, &[]),
            Err(Mp4Error::InvalidSystemIdLength { actual: 15 })
        );
        let kids: [&[u8]; 2] = [&KID_A, &[1, 2, 3]];
        assert_eq!(
            mp4_pssh(&system_id(), Some(&kids[..]), &[]),
            Err(Mp4Error::InvalidKeyIdLength {
                index: 1,
                actual: 3
            })
        );
    }

    #[test]
    fn test_pssh_round_trip_v0() {
        let pssh = mp4_pssh::<&[u8]>(&system_id(), None, b"payload").unwrap();
        let mut diag = Diagnostics::new();
        let record = parse_pssh(&pssh, &mut diag);
        let data = record.as_valid().unwrap();
        assert_eq!(data.version, 0);
        assert_eq!(data.system_id, "edef8ba979d64acea3c827dcd51d21ed");
        assert_eq!(data.system_uuid(), Some(system_ids::WIDEVINE));
        assert_eq!(data.key_ids, None);
        assert_eq!(data.data.as_ref(), b"payload");
        assert_eq!(data.size, pssh.len());
    }

    #[test]
    fn test_pssh_round_trip_v1() {
        let pssh = mp4_pssh(&system_id(), Some(&[KID_A, KID_B][..]), &[]).unwrap();
        let mut diag = Diagnostics::new();
        let record = parse_pssh(&pssh, &mut diag);
        let data = record.as_valid().unwrap();
        assert_eq!(data.version, 1);
        assert_eq!(data.key_ids.as_deref(), Some(&[KID_A, KID_B][..]));
        assert!(data.data.is_empty());
    }

    #[test]
    fn test_parse_multi_pssh_skips_invalid() {
        let first = mp4_pssh::<&[u8]>(&system_id(), None, b"one").unwrap();
        let mut bogus = first.to_vec();
        bogus[8] = 2;
        let third = mp4_pssh(system_ids::PLAYREADY.as_bytes(), Some(&[KID_A][..]), b"three")
            .unwrap();
        let buffer = Bytes::from([first.to_vec(), bogus.clone(), third.to_vec()].concat());

        let mut diag = Diagnostics::new();
        let records = parse_multi_pssh(&buffer, &mut diag);
        assert_eq!(records.len(), 3);
        assert!(records[0].as_valid().is_some());
        assert_eq!(
            records[1],
            PsshRecord::Invalid {
                offset: first.len(),
                size: bogus.len()
            }
        );
        let last = records[2].as_valid().unwrap();
        assert_eq!(last.offset, first.len() + bogus.len());
        assert_eq!(last.data.as_ref(), b"three");
        assert!(diag.contains(|d| matches!(d, ParseDiagnostic::InvalidPssh { .. })));
    }

    #[test]
    fn test_parse_multi_pssh_oversized_box() {
        let mut pssh = mp4_pssh::<&[u8]>(&system_id(), None, &[0; 8]).unwrap().to_vec();
        pssh[3] = 0xFF;
        let buffer = Bytes::from(pssh);
        let mut diag = Diagnostics::new();
        let records = parse_multi_pssh(&buffer, &mut diag);
        assert_eq!(
            records,
            vec![PsshRecord::Invalid {
                offset: 0,
                size: buffer.len()
            }]
        );
    }

    #[test]
    fn test_v1_kid_count_exceeding_size_is_invalid() {
        let mut pssh = mp4_pssh(&system_id(), Some(&[KID_A][..]), &[]).unwrap().to_vec();
        pssh[31] = 9;
        let mut diag = Diagnostics::new();
        let record = parse_pssh(&Bytes::from(pssh), &mut diag);
        assert!(matches!(record, PsshRecord::Invalid { offset: 0, .. }));
    }

    #[test]
    fn test_zero_size_ends_scan() {
        let buffer = Bytes::from(vec![0u8; 64]);
        let mut diag = Diagnostics::new();
        let records = parse_multi_pssh(&buffer, &mut diag);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].size(), 0);
    }
}
