use std::fmt;

use serde::{Deserialize, Serialize};

/// Minimum number of digits in a tract identifier. Shorter codes are zero-padded.
pub const GEOID_WIDTH: usize = 5;

/// Length of the `GEO_ID` prefix, e.g. `1400000US`.
pub const GEO_ID_PREFIX_LEN: usize = 9;

/// Summary level of census tracts in ACS `GEO_ID`s.
pub const TRACT_SUMMARY_LEVEL: &str = "140";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeoIdError {
    #[error("identifier {0:?} is empty")]
    Empty(String),
    #[error("identifier {0:?} contains non-digit characters")]
    NotNumeric(String),
    #[error("GEO_ID {0:?} does not start with a 9-character `<level><code>US` prefix")]
    MalformedPrefix(String),
    #[error("GEO_ID {value:?} has summary level {found}, expected {expected}")]
    SummaryLevel {
        value: String,
        found: String,
        expected: String,
    },
}

/// A zero-padded numeric tract identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Geoid(String);

impl Geoid {
    /// Trims `raw`, requires ASCII digits and left-pads to [`GEOID_WIDTH`].
    pub fn normalize(raw: &str) -> Result<Self, GeoIdError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(GeoIdError::Empty(raw.to_string()));
        }
        if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(GeoIdError::NotNumeric(raw.to_string()));
        }
        Ok(Self(format!("{:0>width$}", trimmed, width = GEOID_WIDTH)))
    }

    /// Derives the identifier from a Census `GEO_ID` such as `1400000US01001`.
    ///
    /// The prefix is checked rather than sliced blindly: it must be three digits of
    /// summary level, four digits of component/variant code and the literal `US`,
    /// and the summary level must equal `summary_level`.
    pub fn from_geo_id(raw: &str, summary_level: &str) -> Result<Self, GeoIdError> {
        let value = raw.trim();
        let (prefix, code) = match (value.get(..GEO_ID_PREFIX_LEN), value.get(GEO_ID_PREFIX_LEN..)) {
            (Some(prefix), Some(code)) => (prefix, code),
            _ => return Err(GeoIdError::MalformedPrefix(raw.to_string())),
        };
        let digits = match prefix.strip_suffix("US") {
            Some(digits) if digits.bytes().all(|b| b.is_ascii_digit()) => digits,
            _ => return Err(GeoIdError::MalformedPrefix(raw.to_string())),
        };
        let level = &digits[..3];
        if level != summary_level {
            return Err(GeoIdError::SummaryLevel {
                value: raw.to_string(),
                found: level.to_string(),
                expected: summary_level.to_string(),
            });
        }
        Self::normalize(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Geoid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Geoid {
    type Error = GeoIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::normalize(&value)
    }
}

impl From<Geoid> for String {
    fn from(value: Geoid) -> Self {
        value.0
    }
}

/// One tract's ACS attributes after cleaning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PopulationRecord {
    pub geoid: Geoid,
    // Same order as the column mapping that produced them
    pub values: Vec<f64>,
}

impl PopulationRecord {
    /// Parses every raw estimate, coercing anything unusable to zero.
    pub fn from_raw<'a>(geoid: Geoid, raw: impl IntoIterator<Item = Option<&'a str>>) -> Self {
        Self {
            geoid,
            values: raw.into_iter().map(coerce_estimate).collect(),
        }
    }
}

/// ACS estimates carry markers like `-`, `(X)` or `N`; those, blanks and
/// non-finite numbers all become `0.0`.
pub fn coerce_estimate(raw: Option<&str>) -> f64 {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}
