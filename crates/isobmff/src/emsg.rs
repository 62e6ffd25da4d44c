//! Event message (`emsg`) boxes.

use bytes::Bytes;
use memchr::memchr;
use tracing::debug;

use crate::error::{Diagnostics, ParseDiagnostic};
use crate::reader::{FieldReader, MAX_SAFE_INTEGER};

const ID3_SCHEME_URI: &str = "https://aomedia.org/emsg/ID3";

/// Event timing as carried by the two `emsg` versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmsgTiming {
    /// Version 0: offset from the earliest presentation time of the segment.
    PresentationTimeDelta(u32),
    /// Version 1: absolute presentation time, at most `2^53 - 1`.
    PresentationTime(u64),
}

/// Decoded `emsg` box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    /// Box version, 0 or 1.
    pub version: u8,
    /// Identifies the message scheme.
    pub scheme_id_uri: String,
    /// Scheme specific value.
    pub value: String,
    /// Ticks per second for the timing fields.
    pub timescale: u32,
    /// Presentation time or delta, depending on the version.
    pub timing: EmsgTiming,
    /// Event duration in timescale units.
    pub event_duration: u32,
    /// Event instance id.
    pub id: u32,
    /// Message body, e.g. an ID3 tag.
    pub message_data: Bytes,
}

impl EventMessage {
    /// Whether the message carries an ID3 tag (AOM or `urn:...:id3:...` schemes).
    pub fn is_id3(&self) -> bool {
        self.scheme_id_uri == ID3_SCHEME_URI
            || (self.scheme_id_uri.starts_with("urn:") && self.scheme_id_uri.contains(":id3:"))
    }
}

/// Reads a NUL-terminated string; the terminator is consumed but not returned.
fn read_cstr(reader: &mut FieldReader<'_>, data: &[u8]) -> Result<String, ParseDiagnostic> {
    let rest = &data[reader.position()..];
    let len = memchr(0, rest).ok_or(ParseDiagnostic::Truncated {
        context: "emsg string",
    })?;
    let value = String::from_utf8_lossy(reader.bytes(len)?).into_owned();
    reader.skip(1)?;
    Ok(value)
}

/// Decode the payload of an `emsg` box.
pub fn parse_emsg(emsg: &Bytes, diag: &mut Diagnostics) -> Option<EventMessage> {
    match read_emsg(emsg, diag) {
        Ok(message) => message,
        Err(d) => {
            diag.push(d);
            None
        }
    }
}

fn read_emsg(
    emsg: &Bytes,
    diag: &mut Diagnostics,
) -> Result<Option<EventMessage>, ParseDiagnostic> {
    let mut reader = FieldReader::new(emsg, "emsg");
    let version = reader.u8()?;
    reader.skip(3)?;

    let message = match version {
        0 => {
            let scheme_id_uri = read_cstr(&mut reader, emsg)?;
            let value = read_cstr(&mut reader, emsg)?;
            let timescale = reader.u32()?;
            let delta = reader.u32()?;
            let event_duration = reader.u32()?;
            let id = reader.u32()?;
            EventMessage {
                version,
                scheme_id_uri,
                value,
                timescale,
                timing: EmsgTiming::PresentationTimeDelta(delta),
                event_duration,
                id,
                message_data: emsg.slice(reader.position()..),
            }
        }
        1 => {
            let timescale = reader.u32()?;
            let high = reader.u32()?;
            let low = reader.u32()?;
            let mut presentation_time = (u64::from(high) << 32) | u64::from(low);
            if presentation_time > MAX_SAFE_INTEGER {
                diag.push(ParseDiagnostic::PresentationTimeClamped { high, low });
                presentation_time = MAX_SAFE_INTEGER;
            }
            let event_duration = reader.u32()?;
            let id = reader.u32()?;
            let scheme_id_uri = read_cstr(&mut reader, emsg)?;
            let value = read_cstr(&mut reader, emsg)?;
            EventMessage {
                version,
                scheme_id_uri,
                value,
                timescale,
                timing: EmsgTiming::PresentationTime(presentation_time),
                event_duration,
                id,
                message_data: emsg.slice(reader.position()..),
            }
        }
        _ => {
            debug!(version, "Ignoring emsg with unknown version");
            return Ok(None);
        }
    };
    Ok(Some(message))
}
