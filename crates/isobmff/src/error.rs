//! Error and diagnostic types.
//!
//! Malformed media never aborts a parse: each tolerated problem is recorded as
//! a [`ParseDiagnostic`] in the caller's [`Diagnostics`] sink and the walk
//! continues with sibling boxes. [`Mp4Error`] is reserved for misuse of the
//! builder APIs.

use thiserror::Error;
use tracing::warn;

use crate::types::{FourCc, TrackId};

/// Errors returned for API contract violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Mp4Error {
    /// A `pssh` system id must be exactly 16 bytes.
    #[error("invalid system id: expected 16 bytes, got {actual}")]
    InvalidSystemIdLength {
        /// Length that was supplied.
        actual: usize,
    },

    /// Every `pssh` key id must be exactly 16 bytes.
    #[error("invalid key id at index {index}: expected 16 bytes, got {actual}")]
    InvalidKeyIdLength {
        /// Position of the offending key id.
        index: usize,
        /// Length that was supplied.
        actual: usize,
    },
}

/// Result type for builder operations.
pub type Result<T> = std::result::Result<T, Mp4Error>;

/// A recoverable problem found while walking untrusted input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseDiagnostic {
    /// A box payload ended before a required field.
    #[error("{context}: not enough data")]
    Truncated {
        /// Box or structure being read.
        context: &'static str,
    },

    /// A mandatory child box is absent.
    #[error("{context}: required `{fourcc}` box is missing")]
    MissingBox {
        /// Parent box or structure.
        context: &'static str,
        /// Code of the missing box.
        fourcc: FourCc,
    },

    /// A timescale of zero, which would divide by zero.
    #[error("{context}: timescale is zero")]
    InvalidTimescale {
        /// Box or track carrying the timescale.
        context: &'static str,
    },

    /// A `sidx` reference points at another `sidx`.
    #[error("sidx reference {reference} is hierarchical (not supported)")]
    HierarchicalSidx {
        /// Index of the offending reference.
        reference: usize,
    },

    /// A `sidx` byte range does not fit in 64 bits.
    #[error("sidx reference {reference} byte range overflows 64 bits")]
    SidxRangeOverflow {
        /// Index of the offending reference.
        reference: usize,
    },

    /// A `schm` scheme other than `cenc` or `cbcs`.
    #[error("unsupported protection scheme `{scheme}`")]
    UnsupportedScheme {
        /// Scheme type found.
        scheme: FourCc,
    },

    /// An `esds` decoder config that is not MPEG-4 audio.
    #[error("unsupported esds object type 0x{object_type:02x}")]
    UnsupportedObjectType {
        /// Object type indication found.
        object_type: u8,
    },

    /// An `esds` descriptor chain that could not be followed.
    #[error("malformed esds: {context}")]
    MalformedEsds {
        /// Descriptor being read.
        context: &'static str,
    },

    /// A version 1 `tfdt` whose high word is `0xFFFFFFFF`.
    #[error("track {track_id}: ignoring assumed invalid signed 64-bit track fragment decode time")]
    InvalidTfdtHighWord {
        /// Track of the enclosing `traf`.
        track_id: TrackId,
    },

    /// An `emsg` presentation time above `2^53 - 1`.
    #[error(
        "emsg presentation time {high}:{low} exceeds the safe integer limit and was clamped"
    )]
    PresentationTimeClamped {
        /// High 32 bits as stored.
        high: u32,
        /// Low 32 bits as stored.
        low: u32,
    },

    /// An SEI payload declares more bytes than the NAL unit holds.
    #[error("malformed SEI payload: {payload_size} bytes declared, only {remaining} left")]
    MalformedSeiPayload {
        /// Declared payload size.
        payload_size: usize,
        /// Bytes left in the NAL unit.
        remaining: usize,
    },

    /// Sample data addressed by a `trun` lies outside the buffer.
    #[error("track {track_id}: sample data at offset {offset} is out of bounds")]
    SampleOutOfBounds {
        /// Track being scanned.
        track_id: TrackId,
        /// Offset that could not be read.
        offset: usize,
    },

    /// A `pssh` box that could not be decoded.
    #[error("invalid pssh box at offset {offset} (size {size}): {reason}")]
    InvalidPssh {
        /// Offset of the box within the scanned buffer.
        offset: usize,
        /// Bytes covered by the box.
        size: usize,
        /// What was wrong with it.
        reason: &'static str,
    },
}

impl ParseDiagnostic {
    /// Short machine-friendly name, used as the `kind` field of log events.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::MissingBox { .. } => "missing_box",
            Self::InvalidTimescale { .. } => "invalid_timescale",
            Self::HierarchicalSidx { .. } => "hierarchical_sidx",
            Self::SidxRangeOverflow { .. } => "sidx_range_overflow",
            Self::UnsupportedScheme { .. } => "unsupported_scheme",
            Self::UnsupportedObjectType { .. } => "unsupported_object_type",
            Self::MalformedEsds { .. } => "malformed_esds",
            Self::InvalidTfdtHighWord { .. } => "invalid_tfdt",
            Self::PresentationTimeClamped { .. } => "presentation_time_clamped",
            Self::MalformedSeiPayload { .. } => "malformed_sei",
            Self::SampleOutOfBounds { .. } => "sample_out_of_bounds",
            Self::InvalidPssh { .. } => "invalid_pssh",
        }
    }
}

/// Ordered sink for the diagnostics of one or more parse calls.
///
/// Every recorded diagnostic is also emitted as a `tracing` warning.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    entries: Vec<ParseDiagnostic>,
}

impl Diagnostics {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `diagnostic` and logs it at warn level.
    pub fn push(&mut self, diagnostic: ParseDiagnostic) {
        warn!(kind = diagnostic.kind(), "{diagnostic}");
        self.entries.push(diagnostic);
    }

    /// Number of recorded diagnostics.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Diagnostics in recording order.
    pub fn iter(&self) -> impl Iterator<Item = &ParseDiagnostic> {
        self.entries.iter()
    }

    /// Returns `true` if any recorded diagnostic matches `predicate`.
    pub fn contains(&self, predicate: impl Fn(&ParseDiagnostic) -> bool) -> bool {
        self.entries.iter().any(predicate)
    }

    /// Consumes the sink, returning the recorded diagnostics.
    pub fn into_vec(self) -> Vec<ParseDiagnostic> {
        self.entries
    }
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_preserve_order() {
        let mut diag = Diagnostics::new();
        assert!(diag.is_empty());

        diag.push(ParseDiagnostic::Truncated { context: "tfhd" });
        diag.push(ParseDiagnostic::HierarchicalSidx { reference: 2 });

        assert_eq!(diag.len(), 2);
        assert!(diag.contains(|d| matches!(d, ParseDiagnostic::HierarchicalSidx { reference: 2 })));
        let kinds: Vec<_> = diag.iter().map(ParseDiagnostic::kind).collect();
        assert_eq!(kinds, ["truncated", "hierarchical_sidx"]);
    }

    #[test]
    fn test_error_messages() {
        let err = Mp4Error::InvalidKeyIdLength {
            index: 1,
            actual: 15,
        };
        assert_eq!(
            err.to_string(),
            "invalid key id at index 1: expected 16 bytes, got 15"
        );

        let diag = ParseDiagnostic::UnsupportedScheme {
            scheme: FourCc(*b"cbc2"),
        };
        assert_eq!(diag.to_string(), "unsupported protection scheme `cbc2`");
    }
}
