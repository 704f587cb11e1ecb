//! Bundle location strings and their mapping to revision kinds.
//!
//! A location selects how content is materialized:
//! `reference:file:<path>` uses content in place (directory or packed file),
//! `inputstream:` marks content supplied as a byte stream, and `file:<path>`
//! is copied into the cache. Other schemes are rejected; the container is
//! single-process and performs no network fetch.

use crate::CacheError;
use std::path::PathBuf;

pub const REFERENCE_PROTOCOL: &str = "reference:";
pub const FILE_PROTOCOL: &str = "file:";
pub const INPUTSTREAM_PROTOCOL: &str = "inputstream:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationKind {
    /// `reference:file:` pointing at a directory; used in place, nothing copied.
    ReferencedDirectory(PathBuf),
    /// `reference:file:` pointing at a packed file; used in place, native
    /// libraries still extracted.
    ReferencedFile(PathBuf),
    /// Content supplied as a stream and copied into the revision directory.
    Stream,
    /// `file:` location copied into the revision directory.
    File(PathBuf),
}

/// Classify a location string. Referenced paths are percent-decoded and must
/// exist so the directory/file distinction can be made.
pub fn classify(location: &str) -> Result<LocationKind, CacheError> {
    if let Some(rest) = location.strip_prefix(REFERENCE_PROTOCOL) {
        let Some(raw_path) = rest.strip_prefix(FILE_PROTOCOL) else {
            return Err(CacheError::NonFileReference(location.to_owned()));
        };
        let path = PathBuf::from(percent_decode(raw_path)?);
        if !path.exists() {
            return Err(CacheError::ReferencedFileMissing(
                path.display().to_string(),
            ));
        }
        if path.is_dir() {
            Ok(LocationKind::ReferencedDirectory(path))
        } else {
            Ok(LocationKind::ReferencedFile(path))
        }
    } else if location.starts_with(INPUTSTREAM_PROTOCOL) {
        Ok(LocationKind::Stream)
    } else if let Some(raw_path) = location.strip_prefix(FILE_PROTOCOL) {
        Ok(LocationKind::File(PathBuf::from(percent_decode(raw_path)?)))
    } else {
        Err(CacheError::UnsupportedLocation(location.to_owned()))
    }
}

/// Decode `%HH` escape runs; consecutive escapes form one byte sequence
/// decoded as UTF-8.
pub fn percent_decode(input: &str) -> Result<String, CacheError> {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            // Safe to index by bytes: '%' is ASCII, so any multi-byte UTF-8
            // sequence passes through this arm unsplit.
            let ch_len = utf8_len(bytes[i]);
            out.push_str(&input[i..i + ch_len]);
            i += ch_len;
            continue;
        }
        let mut decoded = Vec::new();
        while i < bytes.len() && bytes[i] == b'%' {
            let (Some(&h), Some(&l)) = (bytes.get(i + 1), bytes.get(i + 2)) else {
                return Err(CacheError::InvalidEscape {
                    input: input.to_owned(),
                    offset: i,
                });
            };
            let (Some(h), Some(l)) = (hex_digit(h), hex_digit(l)) else {
                return Err(CacheError::InvalidEscape {
                    input: input.to_owned(),
                    offset: i,
                });
            };
            decoded.push((h << 4) | l);
            i += 3;
        }
        let text = String::from_utf8(decoded).map_err(|_| CacheError::InvalidEscape {
            input: input.to_owned(),
            offset: i,
        })?;
        out.push_str(&text);
    }
    Ok(out)
}

fn utf8_len(first: u8) -> usize {
    match first {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_plain_passthrough() {
        assert_eq!(percent_decode("/plain/path").unwrap(), "/plain/path");
    }

    #[test]
    fn decode_single_escape() {
        assert_eq!(percent_decode("/a%20b").unwrap(), "/a b");
    }

    #[test]
    fn decode_multibyte_utf8_run() {
        // 'é' is 0xC3 0xA9 in UTF-8.
        assert_eq!(percent_decode("caf%C3%A9").unwrap(), "café");
    }

    #[test]
    fn decode_rejects_truncated_escape() {
        assert!(percent_decode("abc%2").is_err());
        assert!(percent_decode("abc%").is_err());
    }

    #[test]
    fn decode_rejects_bad_hex() {
        assert!(percent_decode("%zz").is_err());
    }

    #[test]
    fn decode_rejects_invalid_utf8_sequence() {
        assert!(percent_decode("%FF%FE").is_err());
    }

    #[test]
    fn decode_preserves_literal_unicode() {
        assert_eq!(percent_decode("über/%2e").unwrap(), "über/.");
    }

    #[test]
    fn classify_stream() {
        assert_eq!(classify("inputstream:").unwrap(), LocationKind::Stream);
    }

    #[test]
    fn classify_file() {
        assert_eq!(
            classify("file:/opt/b.tar").unwrap(),
            LocationKind::File(PathBuf::from("/opt/b.tar"))
        );
    }

    #[test]
    fn classify_rejects_unknown_scheme() {
        assert!(matches!(
            classify("http://example.com/b.tar"),
            Err(CacheError::UnsupportedLocation(_))
        ));
    }

    #[test]
    fn classify_rejects_non_file_reference() {
        assert!(matches!(
            classify("reference:http://x"),
            Err(CacheError::NonFileReference(_))
        ));
    }

    #[test]
    fn classify_reference_directory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("b.tar");
        std::fs::write(&file, b"x").unwrap();

        let loc = format!("reference:file:{}", dir.path().display());
        assert!(matches!(
            classify(&loc).unwrap(),
            LocationKind::ReferencedDirectory(_)
        ));

        let loc = format!("reference:file:{}", file.display());
        assert!(matches!(
            classify(&loc).unwrap(),
            LocationKind::ReferencedFile(_)
        ));
    }

    #[test]
    fn classify_reference_missing_target() {
        assert!(matches!(
            classify("reference:file:/definitely/not/here"),
            Err(CacheError::ReferencedFileMissing(_))
        ));
    }
}
