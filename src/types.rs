use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Placeholder used when a lookup fails.
pub const UNKNOWN: &str = "unknown";

fn unknown() -> String {
    UNKNOWN.to_string()
}

/// Location details as returned by the IP-info service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LocationInfo {
    #[serde(default = "unknown")]
    pub ip: String,
    /// "lat,lon" or "unknown".
    #[serde(default = "unknown")]
    pub loc: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub postal: String,
}

impl LocationInfo {
    pub fn unknown() -> Self {
        Self {
            ip: unknown(),
            loc: unknown(),
            city: String::new(),
            region: String::new(),
            country: String::new(),
            org: String::new(),
            postal: String::new(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.ip == UNKNOWN
    }
}

impl Default for LocationInfo {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Failed login counter for one username, stored under `loginAttempts`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub last_attempt: Option<String>,
}

/// username -> record
pub type AttemptMap = BTreeMap<String, AttemptRecord>;

/// One persisted intrusion snapshot. Immutable once appended.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRecord {
    pub id: String,
    pub timestamp: String,
    pub ip: String,
    pub location: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub postal: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    /// Inline JPEG as a `data:` URL.
    #[serde(default)]
    pub image_data: Option<String>,
    /// Image stored by the upload API.
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub blocked: bool,
}

impl CaptureRecord {
    pub fn has_image(&self) -> bool {
        self.image_data.is_some() || self.image_path.is_some()
    }

    pub fn coordinates(&self) -> [f64; 2] {
        parse_coordinates(&self.location)
    }
}

/// Latest failure pointer stored under `lastFailedAttempt`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailedAttemptPointer {
    pub username: String,
    pub count: u32,
    pub timestamp: String,
    /// Set once the lockout protocol ran.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub locked: bool,
}

/// Visual risk class of a marker, a pure function of the attempt count.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Safe,
    Warning,
    Danger,
}

impl Tier {
    pub fn for_attempts(attempts: u32) -> Self {
        match attempts {
            0 => Tier::Safe,
            1..=2 => Tier::Warning,
            _ => Tier::Danger,
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            Tier::Safe => "#2ecc71",
            Tier::Warning => "#f39c12",
            Tier::Danger => "#e74c3c",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Safe => "safe",
            Tier::Warning => "warning",
            Tier::Danger => "danger",
        }
    }
}

/// Parse a "lat,lon" string. Anything else lands on [0, 0].
pub fn parse_coordinates(loc: &str) -> [f64; 2] {
    let parsed = loc.split_once(',').and_then(|(lat, lon)| {
        let lat = lat.trim().parse::<f64>().ok()?;
        let lon = lon.trim().parse::<f64>().ok()?;
        (lat.is_finite() && lon.is_finite()).then_some([lat, lon])
    });
    parsed.unwrap_or([0.0, 0.0])
}

pub fn now_rfc3339() -> String {
    format_rfc3339(OffsetDateTime::now_utc())
}

pub fn format_rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

pub fn parse_rfc3339(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339).ok()
}

pub fn unix_millis(t: OffsetDateTime) -> i128 {
    t.unix_timestamp_nanos() / 1_000_000
}
