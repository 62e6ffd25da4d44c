//! Codec signature synthesis from `stsd` sample entries.
//!
//! Turns the first sample entry of a sample description box into an RFC 6381
//! style codec string (`avc1.64001F`, `mp4a.40.2`, `hvc1.1.6.L93.B0`, ...),
//! plus a supplemental Dolby Vision string for layered codecs.

use std::fmt::Write as _;

use tracing::debug;

use crate::box_utils::{box_at, find_box_slices, first_box};
use crate::error::{Diagnostics, ParseDiagnostic};
use crate::reader::{FieldReader, read_u32};
use crate::types::FourCc;

/// Sample entry payload bytes before child boxes in a `VisualSampleEntry`.
pub(crate) const VISUAL_SAMPLE_ENTRY_BODY: usize = 78;

/// Sample entry payload bytes before child boxes in an `AudioSampleEntry`.
pub(crate) const AUDIO_SAMPLE_ENTRY_BODY: usize = 28;

/// Options for parsing init segments.
#[derive(Debug, Clone, Copy)]
pub struct InitParseOptions {
    /// Probe `dvvC`/`dvcC` boxes for a supplemental Dolby Vision codec string.
    pub probe_dolby_vision: bool,
    /// Populate the per-role lookup (`audio()`, `video()`, ...) of [`crate::InitData`].
    pub role_aliases: bool,
}

impl Default for InitParseOptions {
    fn default() -> Self {
        Self {
            probe_dolby_vision: true,
            role_aliases: true,
        }
    }
}

/// Codec string of a sample entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecSignature {
    /// A single codec string.
    Single(String),
    /// A base codec string with a compatible Dolby Vision enhancement.
    Layered {
        /// Base codec string.
        codec: String,
        /// Dolby Vision codec string.
        supplemental: String,
    },
}

impl CodecSignature {
    /// The base codec string.
    pub fn codec(&self) -> &str {
        match self {
            Self::Single(codec) | Self::Layered { codec, .. } => codec,
        }
    }

    /// The Dolby Vision codec string, when one was found.
    pub fn supplemental(&self) -> Option<&str> {
        match self {
            Self::Single(_) => None,
            Self::Layered { supplemental, .. } => Some(supplemental),
        }
    }

    fn new(codec: String, supplemental: Option<String>) -> Self {
        match supplemental {
            Some(supplemental) => Self::Layered {
                codec,
                supplemental,
            },
            None => Self::Single(codec),
        }
    }
}

/// Result of inspecting an `stsd` box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleDescription {
    /// FourCC of the first sample entry as stored (`encv`/`enca` when protected).
    pub sample_entry: FourCc,
    /// Codec string, resolved through `frma` for protected entries.
    pub codec: CodecSignature,
    /// Whether the entry is protected by a recognized scheme.
    pub encrypted: bool,
}

/// Parse the payload of an `stsd` box into a codec signature.
///
/// Returns `None` when the box does not contain a sample entry.
pub fn parse_stsd(
    stsd: &[u8],
    options: InitParseOptions,
    diag: &mut Diagnostics,
) -> Option<SampleDescription> {
    let Some(entries) = stsd.get(8..) else {
        diag.push(ParseDiagnostic::Truncated { context: "stsd" });
        return None;
    };
    let Some(entry) = box_at(entries, 0, entries.len()) else {
        diag.push(ParseDiagnostic::Truncated {
            context: "stsd sample entry",
        });
        return None;
    };

    let sample_entry = entry.fourcc;
    let payload = &entries[entry.body()];
    let visual_children = payload.get(VISUAL_SAMPLE_ENTRY_BODY..).unwrap_or_default();
    let audio_children = payload.get(AUDIO_SAMPLE_ENTRY_BODY..).unwrap_or_default();

    let encrypted = sample_entry == *b"enca" || sample_entry == *b"encv";
    let mut fourcc = sample_entry;
    if encrypted {
        let children = if sample_entry == *b"enca" {
            audio_children
        } else {
            visual_children
        };
        if let Some(original) = original_format(children, diag) {
            fourcc = original;
        }
    }

    let base = fourcc.to_string();
    let dolby_vision = |dv_fourcc: &str| {
        if options.probe_dolby_vision {
            dolby_vision_codec(dv_fourcc, visual_children)
        } else {
            None
        }
    };

    let (codec, supplemental) = match fourcc.as_bytes() {
        b"avc1" | b"avc2" | b"avc3" | b"avc4" => match first_box(visual_children, &[*b"avcC"]) {
            Some(avcc) if avcc.len() > 3 => {
                let codec = format!("{base}.{:02X}{:02X}{:02X}", avcc[1], avcc[2], avcc[3]);
                let dv = if fourcc == *b"avc1" { "dva1" } else { "dvav" };
                (codec, dolby_vision(dv))
            }
            _ => (base, None),
        },
        b"mp4a" => {
            let mut codec = base;
            if let Some(esds) = first_box(audio_children, &[*b"esds"])
                && esds.len() > 7
                && let Err(d) = append_mpeg4_audio_codec(esds, &mut codec)
            {
                diag.push(d);
            }
            (codec, None)
        }
        b"hvc1" | b"hev1" => match first_box(visual_children, &[*b"hvcC"]) {
            Some(hvcc) if hvcc.len() > 12 => {
                let codec = hevc_codec(&base, hvcc);
                let dv = if fourcc == *b"hev1" { "dvhe" } else { "dvh1" };
                (codec, dolby_vision(dv))
            }
            _ => (base, None),
        },
        b"dvh1" | b"dvhe" | b"dvav" | b"dva1" | b"dav1" => {
            let codec = dolby_vision_codec(&base, visual_children).unwrap_or(base);
            (codec, None)
        }
        b"vp09" => match first_box(visual_children, &[*b"vpcC"]) {
            Some(vpcc) if vpcc.len() > 6 => {
                let bit_depth = (vpcc[6] >> 4) & 0x0F;
                let codec = format!("{base}.{:02}.{:02}.{bit_depth:02}", vpcc[4], vpcc[5]);
                (codec, None)
            }
            _ => (base, None),
        },
        b"av01" => match first_box(visual_children, &[*b"av1C"]) {
            Some(av1c) if av1c.len() > 2 => (av1_codec(&base, av1c), dolby_vision("dav1")),
            _ => (base, None),
        },
        b"ac-3" | b"ec-3" | b"alac" | b"fLaC" | b"Opus" => (base, None),
        _ => {
            debug!(%fourcc, "Unknown sample entry FourCC");
            (base, None)
        }
    };

    Some(SampleDescription {
        sample_entry,
        codec: CodecSignature::new(codec, supplemental),
        encrypted,
    })
}

/// Find the unprotected format of an `enca`/`encv` entry via `sinf/frma`.
///
/// Only `cenc` and `cbcs` protection is recognized.
fn original_format(children: &[u8], diag: &mut Diagnostics) -> Option<FourCc> {
    let mut original = None;
    for sinf in find_box_slices(children, &[*b"sinf"]) {
        let Some(scheme) = first_box(sinf, &[*b"schm"]).and_then(|schm| schm.get(4..8)) else {
            continue;
        };
        let Some(scheme) = FourCc::from_slice(scheme) else {
            continue;
        };
        if scheme == *b"cbcs" || scheme == *b"cenc" {
            if let Some(frma) = first_box(sinf, &[*b"frma"]).and_then(FourCc::from_slice) {
                original = Some(frma);
            }
        } else {
            diag.push(ParseDiagnostic::UnsupportedScheme { scheme });
        }
    }
    original
}

/// Skip a BER-encoded descriptor length (at most 5 bytes).
fn skip_ber_length(reader: &mut FieldReader<'_>) -> Result<(), ParseDiagnostic> {
    let limit = reader.position() + 5;
    loop {
        let b = reader.u8()?;
        if b & 0x80 == 0 || reader.position() >= limit {
            return Ok(());
        }
    }
}

/// Walk an `esds` payload and append `.40.<audio object type>` to `codec`.
///
/// Stops at the first descriptor that does not match; whatever was appended
/// before that point is kept.
fn append_mpeg4_audio_codec(esds: &[u8], codec: &mut String) -> Result<(), ParseDiagnostic> {
    let mut reader = FieldReader::new(esds, "esds");
    reader.skip(4)?;

    if reader.u8()? != 0x03 {
        return Err(ParseDiagnostic::MalformedEsds {
            context: "missing ES descriptor",
        });
    }
    skip_ber_length(&mut reader)?;
    reader.skip(2)?;
    let flags = reader.u8()?;
    if flags & 0x80 != 0 {
        reader.skip(2)?;
    }
    if flags & 0x40 != 0 {
        let url_len = reader.u8()?;
        reader.skip(url_len as usize)?;
    }

    if reader.u8()? != 0x04 {
        return Err(ParseDiagnostic::MalformedEsds {
            context: "missing decoder config descriptor",
        });
    }
    skip_ber_length(&mut reader)?;
    let object_type = reader.u8()?;
    if object_type != 0x40 {
        return Err(ParseDiagnostic::UnsupportedObjectType { object_type });
    }
    let _ = write!(codec, ".{object_type:02X}");
    reader.skip(12)?;

    if reader.u8()? != 0x05 {
        return Err(ParseDiagnostic::MalformedEsds {
            context: "missing decoder specific info",
        });
    }
    skip_ber_length(&mut reader)?;
    let first = reader.u8()?;
    let mut audio_object_type = u32::from((first & 0xF8) >> 3);
    if audio_object_type == 31 {
        let second = reader.u8()?;
        audio_object_type += 1 + (u32::from(first & 0x07) << 3) + u32::from((second & 0xE0) >> 5);
    }
    let _ = write!(codec, ".{audio_object_type}");
    Ok(())
}

fn hevc_codec(base: &str, hvcc: &[u8]) -> String {
    let profile_byte = hvcc[1];
    let profile_space = ["", "A", "B", "C"][(profile_byte >> 6) as usize];
    let general_profile_idc = profile_byte & 0x1F;
    let compatibility = read_u32(hvcc, 2).unwrap_or(0).reverse_bits();
    let tier = if profile_byte & 0x20 != 0 { 'H' } else { 'L' };
    let level_idc = hvcc[12];

    let mut codec = format!(
        "{base}.{profile_space}{general_profile_idc}.{compatibility:X}.{tier}{level_idc}"
    );

    let constraints = &hvcc[6..12];
    if let Some(last) = constraints.iter().rposition(|&b| b != 0) {
        for b in &constraints[..=last] {
            let _ = write!(codec, ".{b:X}");
        }
    }
    codec
}

fn av1_codec(base: &str, av1c: &[u8]) -> String {
    let profile = av1c[1] >> 5;
    let level = av1c[1] & 0x1F;
    let tier = if av1c[2] >> 7 != 0 { 'H' } else { 'M' };
    let high_bitdepth = av1c[2] & 0x40 != 0;
    let twelve_bit = av1c[2] & 0x20 != 0;
    let bit_depth = match (profile, high_bitdepth, twelve_bit) {
        (2, true, true) => 12,
        (_, true, _) => 10,
        _ => 8,
    };
    let monochrome = (av1c[2] & 0x10) >> 4;
    let subsampling_x = (av1c[2] & 0x08) >> 3;
    let subsampling_y = (av1c[2] & 0x04) >> 2;
    let sample_position = av1c[2] & 0x03;

    // Color config is not carried in av1C; report BT.709, limited range.
    format!(
        "{base}.{profile}.{level:02}{tier}.{bit_depth:02}.{monochrome}.\
         {subsampling_x}{subsampling_y}{sample_position}.01.01.01.0"
    )
}

/// Build a Dolby Vision codec string from a `dvvC` or `dvcC` box.
fn dolby_vision_codec(fourcc: &str, children: &[u8]) -> Option<String> {
    let config = first_box(children, &[*b"dvvC"]).or_else(|| first_box(children, &[*b"dvcC"]))?;
    if config.len() < 4 {
        return None;
    }
    let profile = (config[2] >> 1) & 0x7F;
    let level = ((config[2] << 5) & 0x20) | ((config[3] >> 3) & 0x1F);
    Some(format!("{fourcc}.{profile:02}.{level:02}"))
}
