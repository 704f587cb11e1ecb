//! Four-segment bundle version model: `major.minor.patch[.qualifier]`.
//!
//! Missing numeric segments default to zero, so `"1"` and `"1.0.0"` compare
//! equal. The qualifier compares lexicographically after the numeric segments.

use crate::ManifestError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub qualifier: String,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            qualifier: String::new(),
        }
    }

    pub fn parse(input: &str) -> Result<Self, ManifestError> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self::default());
        }

        let invalid = |reason: &str| ManifestError::InvalidVersion {
            input: input.to_owned(),
            reason: reason.to_owned(),
        };

        let mut numeric = [0u32; 3];
        let mut qualifier = String::new();
        for (i, segment) in input.splitn(4, '.').enumerate() {
            if i < 3 {
                numeric[i] = segment
                    .parse::<u32>()
                    .map_err(|_| invalid("segment is not a number"))?;
            } else {
                if segment.is_empty() {
                    return Err(invalid("qualifier must not be empty"));
                }
                qualifier = segment.to_owned();
            }
        }

        Ok(Self {
            major: numeric[0],
            minor: numeric[1],
            patch: numeric[2],
            qualifier,
        })
    }
}

impl FromStr for Version {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = ManifestError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Version> for String {
    fn from(v: Version) -> String {
        v.to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.qualifier.is_empty() {
            write!(f, ".{}", self.qualifier)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_version() {
        let v = Version::parse("1.2.3.beta").unwrap();
        assert_eq!(v.major, 1);
        assert_eq!(v.minor, 2);
        assert_eq!(v.patch, 3);
        assert_eq!(v.qualifier, "beta");
    }

    #[test]
    fn missing_segments_default_to_zero() {
        assert_eq!(Version::parse("1").unwrap(), Version::new(1, 0, 0));
        assert_eq!(Version::parse("1.2").unwrap(), Version::new(1, 2, 0));
        assert_eq!(Version::parse("").unwrap(), Version::default());
    }

    #[test]
    fn display_roundtrip() {
        let v = Version::parse("2.0.1.rc1").unwrap();
        assert_eq!(v.to_string(), "2.0.1.rc1");
        assert_eq!(Version::parse(&v.to_string()).unwrap(), v);
    }

    #[test]
    fn display_omits_empty_qualifier() {
        assert_eq!(Version::new(1, 2, 3).to_string(), "1.2.3");
    }

    #[test]
    fn ordering() {
        let a = Version::parse("1.0.0").unwrap();
        let b = Version::parse("1.0.1").unwrap();
        let c = Version::parse("1.0.1.a").unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn rejects_non_numeric_segment() {
        assert!(Version::parse("1.x.0").is_err());
    }

    #[test]
    fn rejects_empty_qualifier() {
        assert!(Version::parse("1.0.0.").is_err());
    }

    #[test]
    fn serde_as_string() {
        let v = Version::parse("1.2.3").unwrap();
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"1.2.3\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
