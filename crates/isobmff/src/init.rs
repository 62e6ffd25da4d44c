//! Init segment track table.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::box_utils::{find_box_slices, first_box};
use crate::codec::{CodecSignature, InitParseOptions, parse_stsd};
use crate::error::{Diagnostics, ParseDiagnostic};
use crate::reader::read_u32;
use crate::types::{FourCc, TrackId, TrackKind};

/// Per-track defaults from `moov/mvex/trex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackDefaults {
    /// `default_sample_duration`, in track timescale units.
    pub duration: u32,
    /// `default_sample_flags`.
    pub flags: u32,
}

/// Metadata for one `trak` of an init segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescriptor {
    /// Track id from `tkhd`.
    pub id: TrackId,
    /// Media timescale from `mdhd`.
    pub timescale: u32,
    /// Role from the `hdlr` handler type.
    pub kind: TrackKind,
    /// Codec string of the first sample entry.
    pub codec: CodecSignature,
    /// Whether the sample entry is protected.
    pub encrypted: bool,
    /// FourCC of the first sample entry as stored in `stsd`.
    pub sample_entry: FourCc,
    /// Matching `trex` defaults, if the init segment has an `mvex`.
    pub defaults: Option<TrackDefaults>,
}

impl TrackDescriptor {
    /// Dolby Vision codec string, if any.
    #[inline]
    pub fn supplemental(&self) -> Option<&str> {
        self.codec.supplemental()
    }
}

/// Track table of an init segment, keyed by track id with a separate role lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitData {
    tracks: BTreeMap<TrackId, TrackDescriptor>,
    roles: HashMap<TrackKind, TrackId>,
}

impl InitData {
    /// Track with id `id`.
    pub fn get(&self, id: TrackId) -> Option<&TrackDescriptor> {
        self.tracks.get(&id)
    }

    /// The only track of `kind`, when the segment has exactly one.
    pub fn by_kind(&self, kind: TrackKind) -> Option<&TrackDescriptor> {
        self.roles.get(&kind).and_then(|id| self.tracks.get(id))
    }

    /// The only audio track.
    pub fn audio(&self) -> Option<&TrackDescriptor> {
        self.by_kind(TrackKind::Audio)
    }

    /// The only video track.
    pub fn video(&self) -> Option<&TrackDescriptor> {
        self.by_kind(TrackKind::Video)
    }

    /// Tracks in ascending id order.
    pub fn tracks(&self) -> impl Iterator<Item = &TrackDescriptor> {
        self.tracks.values()
    }

    /// Number of tracks.
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Whether no track was found.
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub(crate) fn insert(&mut self, track: TrackDescriptor) {
        self.tracks.insert(track.id, track);
    }
}

/// Offset of a field that sits after the version-dependent creation and
/// modification times of `tkhd`/`mdhd`.
#[inline]
fn versioned_offset(payload: &[u8]) -> usize {
    if payload.first() == Some(&0) { 12 } else { 20 }
}

/// Build the track table of an init segment.
///
/// Tracks missing a required box are skipped and reported to `diag`; the
/// remaining tracks are still returned.
pub fn parse_init_segment(
    data: &[u8],
    options: InitParseOptions,
    diag: &mut Diagnostics,
) -> InitData {
    let mut init = InitData::default();

    for trak in find_box_slices(data, &[*b"moov", *b"trak"]) {
        if let Some(track) = parse_trak(trak, options, diag) {
            debug!(
                track_id = %track.id,
                kind = %track.kind,
                codec = track.codec.codec(),
                timescale = track.timescale,
                "Parsed track"
            );
            init.insert(track);
        }
    }

    for trex in find_box_slices(data, &[*b"moov", *b"mvex", *b"trex"]) {
        let (Some(id), Some(duration), Some(flags)) =
            (read_u32(trex, 4), read_u32(trex, 12), read_u32(trex, 20))
        else {
            diag.push(ParseDiagnostic::Truncated { context: "trex" });
            continue;
        };
        if let Some(track) = init.tracks.get_mut(&TrackId(id)) {
            track.defaults = Some(TrackDefaults { duration, flags });
        }
    }

    if options.role_aliases {
        let mut counts: HashMap<TrackKind, usize> = HashMap::new();
        for track in init.tracks.values() {
            *counts.entry(track.kind).or_default() += 1;
        }
        for track in init.tracks.values() {
            if counts.get(&track.kind) == Some(&1) {
                init.roles.insert(track.kind, track.id);
            }
        }
    }

    init
}

fn require<'a>(
    found: Option<&'a [u8]>,
    fourcc: [u8; 4],
    diag: &mut Diagnostics,
) -> Option<&'a [u8]> {
    if found.is_none() {
        diag.push(ParseDiagnostic::MissingBox {
            context: "trak",
            fourcc: FourCc(fourcc),
        });
    }
    found
}

fn parse_trak(
    trak: &[u8],
    options: InitParseOptions,
    diag: &mut Diagnostics,
) -> Option<TrackDescriptor> {
    let tkhd = require(first_box(trak, &[*b"tkhd"]), *b"tkhd", diag)?;
    let Some(id) = read_u32(tkhd, versioned_offset(tkhd)) else {
        diag.push(ParseDiagnostic::Truncated { context: "tkhd" });
        return None;
    };

    let mdhd = require(first_box(trak, &[*b"mdia", *b"mdhd"]), *b"mdhd", diag)?;
    let Some(timescale) = read_u32(mdhd, versioned_offset(mdhd)) else {
        diag.push(ParseDiagnostic::Truncated { context: "mdhd" });
        return None;
    };

    let hdlr = require(first_box(trak, &[*b"mdia", *b"hdlr"]), *b"hdlr", diag)?;
    let Some(handler) = hdlr.get(8..12).and_then(FourCc::from_slice) else {
        diag.push(ParseDiagnostic::Truncated { context: "hdlr" });
        return None;
    };
    let Some(kind) = TrackKind::from_handler(handler) else {
        debug!(track_id = id, %handler, "Skipping track with unhandled handler type");
        return None;
    };

    let stsd = require(
        first_box(trak, &[*b"mdia", *b"minf", *b"stbl", *b"stsd"]),
        *b"stsd",
        diag,
    )?;
    let description = parse_stsd(stsd, options, diag)?;

    Some(TrackDescriptor {
        id: TrackId(id),
        timescale,
        kind,
        codec: description.codec,
        encrypted: description.encrypted,
        sample_entry: description.sample_entry,
        defaults: None,
    })
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;
    use crate::test_support::{
        make_audio_sample_entry, make_box, make_hdlr, make_init_segment, make_mdhd, make_stsd,
        make_tkhd, make_trak, make_trex, make_visual_sample_entry,
    };

    fn avc_entry() -> Vec<u8> {
        make_visual_sample_entry(b"avc1", &make_box(b"avcC", &[1, 0x4D, 0x40, 0x1E]))
    }

    fn parse(data: &[u8]) -> (InitData, Diagnostics) {
        let mut diag = Diagnostics::new();
        let init = parse_init_segment(data, InitParseOptions::default(), &mut diag);
        (init, diag)
    }

    #[test]
    fn test_audio_video_tracks() {
        let data = make_init_segment(
            &[
                make_trak(1, 90_000, b"vide", &avc_entry()),
                make_trak(2, 48_000, b"soun", &make_audio_sample_entry(b"ac-3", &[])),
            ],
            &[make_trex(1, 3000, 0x0101_0000), make_trex(2, 1024, 0)],
        );
        let (init, diag) = parse(&data);
        assert!(diag.is_empty());
        assert_eq!(init.len(), 2);

        let video = init.video().unwrap();
        assert_eq!(video.id, TrackId(1));
        assert_eq!(video.timescale, 90_000);
        assert_eq!(video.codec.codec(), "avc1.4D401E");
        assert_eq!(
            video.defaults,
            Some(TrackDefaults {
                duration: 3000,
                flags: 0x0101_0000
            })
        );

        let audio = init.audio().unwrap();
        assert_eq!(audio.id, TrackId(2));
        assert_eq!(audio.codec.codec(), "ac-3");
        assert_eq!(audio.defaults.unwrap().duration, 1024);
        assert!(!audio.encrypted);
    }

    #[test]
    fn test_version_1_headers() {
        let stsd = make_stsd(&[avc_entry()]);
        let minf = make_box(b"minf", &make_box(b"stbl", &stsd));
        let mdia = make_box(
            b"mdia",
            &[make_mdhd(1, 30_000), make_hdlr(b"vide"), minf].concat(),
        );
        let trak = make_box(b"trak", &[make_tkhd(1, 7), mdia].concat());
        let (init, _) = parse(&make_init_segment(&[trak], &[]));

        let track = init.get(TrackId(7)).unwrap();
        assert_eq!(track.timescale, 30_000);
        assert_eq!(track.defaults, None);
    }

    #[test]
    fn test_track_missing_mdhd_is_skipped() {
        let stsd = make_stsd(&[avc_entry()]);
        let minf = make_box(b"minf", &make_box(b"stbl", &stsd));
        let mdia = make_box(b"mdia", &[make_hdlr(b"vide"), minf].concat());
        let broken = make_box(b"trak", &[make_tkhd(0, 1), mdia].concat());

        let data = make_init_segment(
            &[
                broken,
                make_trak(2, 48_000, b"soun", &make_audio_sample_entry(b"Opus", &[])),
            ],
            &[],
        );
        let (init, diag) = parse(&data);
        assert_eq!(init.len(), 1);
        assert!(init.get(TrackId(1)).is_none());
        assert!(init.get(TrackId(2)).is_some());
        assert!(diag.contains(|d| matches!(
            d,
            ParseDiagnostic::MissingBox { fourcc, .. } if *fourcc == *b"mdhd"
        )));
    }

    #[test]
    fn test_unknown_handler_is_skipped() {
        let data = make_init_segment(&[make_trak(3, 1000, b"hint", &avc_entry())], &[]);
        let (init, diag) = parse(&data);
        assert!(init.is_empty());
        assert!(diag.is_empty());
    }

    #[test]
    fn test_role_alias_requires_single_track() {
        let data = make_init_segment(
            &[
                make_trak(1, 48_000, b"soun", &make_audio_sample_entry(b"ac-3", &[])),
                make_trak(2, 48_000, b"soun", &make_audio_sample_entry(b"ec-3", &[])),
                make_trak(3, 90_000, b"vide", &avc_entry()),
            ],
            &[],
        );
        let (init, _) = parse(&data);
        assert_eq!(init.len(), 3);
        assert!(init.audio().is_none());
        assert_eq!(init.video().unwrap().id, TrackId(3));

        let ids: Vec<_> = init.tracks().map(|t| t.id.0).collect();
        assert_eq!(ids, [1, 2, 3]);
    }

    #[test]
    fn test_role_aliases_disabled() {
        let data = make_init_segment(&[make_trak(1, 90_000, b"vide", &avc_entry())], &[]);
        let mut diag = Diagnostics::new();
        let options = InitParseOptions {
            role_aliases: false,
            ..InitParseOptions::default()
        };
        let init = parse_init_segment(&data, options, &mut diag);
        assert!(init.video().is_none());
        assert!(init.get(TrackId(1)).is_some());
    }

    #[test]
    fn test_metadata_track_kind() {
        let data = make_init_segment(
            &[make_trak(5, 1000, b"meta", &make_box(b"mett", &[0; 8]))],
            &[],
        );
        let (init, _) = parse(&data);
        let track = init.by_kind(TrackKind::Metadata).unwrap();
        assert_eq!(track.id, TrackId(5));
        assert_eq!(track.codec.codec(), "mett");
    }

    #[test]
    fn test_trex_for_unknown_track_is_ignored() {
        let data = make_init_segment(
            &[make_trak(1, 90_000, b"vide", &avc_entry())],
            &[make_trex(9, 1000, 0)],
        );
        let (init, diag) = parse(&data);
        assert_eq!(init.get(TrackId(1)).unwrap().defaults, None);
        assert!(diag.is_empty());
    }
}
