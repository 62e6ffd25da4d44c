use std::fmt;

/// A four-character box or sample-entry code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    /// Wraps a raw four-byte code.
    #[inline]
    pub const fn new(code: [u8; 4]) -> Self {
        Self(code)
    }

    /// Builds a code from the first four bytes of `data`.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let code: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some(Self(code))
    }

    /// The raw code bytes.
    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl From<[u8; 4]> for FourCc {
    fn from(code: [u8; 4]) -> Self {
        Self(code)
    }
}

impl PartialEq<[u8; 4]> for FourCc {
    fn eq(&self, other: &[u8; 4]) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc(\"{self}\")")
    }
}

/// Track identifier as carried by `tkhd`, `trex` and `tfhd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for TrackId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Semantic role of a track, derived from its `hdlr` handler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// `soun` handler.
    Audio,
    /// `vide` handler.
    Video,
    /// `meta`, `text` or `subt` handler.
    Metadata,
}

impl TrackKind {
    /// Maps a handler type to a track role. Unknown handlers yield `None`.
    pub fn from_handler(handler: FourCc) -> Option<Self> {
        match handler.as_bytes() {
            b"soun" => Some(Self::Audio),
            b"vide" => Some(Self::Video),
            b"meta" | b"text" | b"subt" => Some(Self::Metadata),
            _ => None,
        }
    }

    /// Lowercase role name, as used for the role lookup.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Metadata => "metadata",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_display_replaces_non_printable() {
        assert_eq!(FourCc(*b"moov").to_string(), "moov");
        assert_eq!(FourCc(*b"ac-3").to_string(), "ac-3");
        assert_eq!(FourCc([b'a', 0, b'b', 0xFF]).to_string(), "a?b?");
    }

    #[test]
    fn test_fourcc_from_slice() {
        assert_eq!(FourCc::from_slice(b"trakxyz"), Some(FourCc(*b"trak")));
        assert_eq!(FourCc::from_slice(b"tra"), None);
    }

    #[test]
    fn test_track_kind_from_handler() {
        assert_eq!(TrackKind::from_handler(FourCc(*b"soun")), Some(TrackKind::Audio));
        assert_eq!(TrackKind::from_handler(FourCc(*b"vide")), Some(TrackKind::Video));
        assert_eq!(TrackKind::from_handler(FourCc(*b"meta")), Some(TrackKind::Metadata));
        assert_eq!(TrackKind::from_handler(FourCc(*b"hint")), None);
    }
}
