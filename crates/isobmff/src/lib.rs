//! ISO Base Media File Format (fragmented MP4) introspection.
//!
//! A set of pure functions over already-fetched byte buffers:
//! - box tree search ([`find_box`], [`has_moof_data`])
//! - init segment track tables with RFC 6381 codec strings ([`parse_init_segment`])
//! - fragment timing with a `sidx` fallback ([`parse_fragment_times`], [`parse_segment_index`])
//! - Common Encryption key ids and `pssh` boxes ([`parse_key_ids_from_tenc`], [`mp4_pssh`])
//! - SEI caption/user data and `emsg` events ([`parse_samples`], [`parse_emsg`])
//!
//! Malformed input never panics or aborts a parse. Each tolerated problem is
//! recorded in a caller supplied [`Diagnostics`] sink and emitted through
//! `tracing`, and the caller receives a best-effort result.
//!
//! ## License
//!
//! This project is licensed under the [MIT](./LICENSE.MIT) or
//! [Apache-2.0](./LICENSE.Apache-2.0) license. You can choose between one of
//! them if you use this work.
//!
//! `SPDX-License-Identifier: MIT OR Apache-2.0`
#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![deny(missing_docs)]
#![deny(unsafe_code)]

mod box_utils;
pub mod codec;
pub mod emsg;
pub mod encryption;
pub mod error;
pub mod fragment;
pub mod init;
pub mod reader;
pub mod sei;
pub mod sidx;
mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use box_utils::{find_box, find_box_ranges, has_moof_data, mp4_box};
pub use codec::{CodecSignature, InitParseOptions, SampleDescription, parse_stsd};
pub use emsg::{EmsgTiming, EventMessage, parse_emsg};
pub use encryption::{
    KEY_ID_SIZE, PsshData, PsshRecord, mp4_pssh, parse_key_ids_from_tenc, parse_multi_pssh,
    parse_pssh, parse_sinf, patch_encryption_data,
};
pub use error::{Diagnostics, Mp4Error, ParseDiagnostic, Result};
pub use fragment::{
    SegmentValidRange, TrackTimes, fragment_duration, offset_start_dts, parse_fragment_times,
    segment_valid_range, start_dts,
};
pub use init::{InitData, TrackDefaults, TrackDescriptor, parse_init_segment};
pub use reader::{MAX_SAFE_INTEGER, read_i32, read_u16, read_u32, read_u64, write_u32};
pub use sei::{
    CaptionData, UnregisteredUserData, UserdataSample, discard_epb, parse_samples,
    parse_sei_message,
};
pub use sidx::{SegmentIndex, SidxReference, SubsegmentInfo, parse_segment_index};
pub use types::{FourCc, TrackId, TrackKind};
