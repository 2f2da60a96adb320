//! Digital Twin Model Identifiers.
//!
//! A DTMI has the shape `dtmi:<segment>(:<segment>)*;<version>`. Segments
//! start with a letter, may contain letters, digits, and underscores, and
//! must not end in an underscore. The version is a positive integer with at
//! most nine digits.

use core::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("`{value}` is not a valid DTMI")]
#[must_use]
pub struct InvalidDtmi {
    pub value: String,
}

/// A validated Digital Twin Model Identifier.
///
/// Ordering is plain lexicographic ordering of the underlying string, which
/// is what the catalog uses to make `bases` ordering deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Dtmi(String);

impl Dtmi {
    /// Validates and wraps a DTMI string.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidDtmi`] if the string does not match the DTMI grammar.
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidDtmi> {
        let value = value.into();
        if is_valid_dtmi(&value) {
            Ok(Self(value))
        } else {
            Err(InvalidDtmi { value })
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The version suffix, i.e. the digits after `;`.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.0
            .rsplit(';')
            .next()
            .and_then(|version| version.parse().ok())
            .unwrap_or(1)
    }
}

impl fmt::Display for Dtmi {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.0)
    }
}

impl FromStr for Dtmi {
    type Err = InvalidDtmi;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::new(value)
    }
}

impl AsRef<str> for Dtmi {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Dtmi {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::new(value).map_err(serde::de::Error::custom)
    }
}

fn is_valid_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphabetic() {
        return false;
    }
    if segment.ends_with('_') {
        return false;
    }
    chars.all(|char| char.is_ascii_alphanumeric() || char == '_')
}

fn is_valid_dtmi(value: &str) -> bool {
    let Some(body) = value.strip_prefix("dtmi:") else {
        return false;
    };
    let Some((path, version)) = body.rsplit_once(';') else {
        return false;
    };
    if version.is_empty()
        || version.len() > 9
        || version.starts_with('0')
        || !version.bytes().all(|byte| byte.is_ascii_digit())
    {
        return false;
    }
    !path.is_empty() && path.split(':').all(is_valid_segment)
}
