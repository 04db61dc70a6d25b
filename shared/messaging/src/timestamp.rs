//! Canonical timestamps: milliseconds since the Unix epoch.
//!
//! Producers disagree on the representation (numbers from some paths, RFC 3339
//! strings from others). Everything is converted to `i64` milliseconds on the
//! way in and always written back out as a number.

use crate::{MessagingError, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Parses either a decimal millisecond count or an RFC 3339 instant.
pub fn parse_timestamp(text: &str) -> Result<i64> {
    let text = text.trim();
    if let Ok(ms) = text.parse::<i64>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| MessagingError::InvalidTimestamp(text.to_owned()))
}

pub fn to_rfc3339(ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Millis(i64),
    Float(f64),
    Text(String),
}

impl RawTimestamp {
    fn into_millis(self) -> Result<i64> {
        match self {
            Self::Millis(ms) => Ok(ms),
            Self::Float(ms) => Ok(ms as i64),
            Self::Text(text) => parse_timestamp(&text),
        }
    }
}

pub fn serialize<S>(ms: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_i64(*ms)
}

pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    RawTimestamp::deserialize(deserializer)?
        .into_millis()
        .map_err(D::Error::custom)
}

pub mod option {
    use super::RawTimestamp;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ms: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match ms {
            Some(ms) => serializer.serialize_some(ms),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<RawTimestamp>::deserialize(deserializer)?
            .map(RawTimestamp::into_millis)
            .transpose()
            .map_err(D::Error::custom)
    }
}
