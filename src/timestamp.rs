//! Canonical timestamps.
//!
//! Sources and the store disagree on how to spell the same instant
//! (`...48.911Z`, `...48.911000+00:00`, `... 48.911+00`). Everything that is
//! compared or persisted goes through [`normalize`] first so equal instants
//! always produce equal strings.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};

use crate::error::FormatError;

/// UTC, six fractional digits, explicit offset.
pub const CANONICAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f+00:00";

pub const UNKNOWN_RELEASE_DATE: &str = "1900-01-01";

pub fn parse_instant(input: &str) -> Result<DateTime<Utc>, FormatError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(FormatError::new("played_at", input, "empty timestamp"));
    }

    let spelled = trimmed.replacen(' ', "T", 1);
    let (body, zone) = split_zone(&spelled);
    let zone = canonical_zone(zone).ok_or_else(|| {
        FormatError::new("played_at", input, format!("bad utc offset {zone:?}"))
    })?;
    let assembled = format!("{}{}", pad_fraction(body), zone);

    DateTime::parse_from_rfc3339(&assembled)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| FormatError::new("played_at", input, err.to_string()))
}

pub fn canonical(instant: &DateTime<Utc>) -> String {
    instant.format(CANONICAL_FORMAT).to_string()
}

pub fn normalize(input: &str) -> Result<String, FormatError> {
    parse_instant(input).map(|instant| canonical(&instant))
}

/// Splits `body` from its zone suffix. Only the time half is searched for a
/// sign so the dashes of the date are never mistaken for an offset.
fn split_zone(value: &str) -> (&str, &str) {
    if let Some(body) = value.strip_suffix(&['Z', 'z'][..]) {
        return (body, "Z");
    }
    let time_start = value.find('T').map(|idx| idx + 1).unwrap_or(0);
    match value[time_start..].rfind(&['+', '-'][..]) {
        Some(idx) => value.split_at(time_start + idx),
        None => (value, ""),
    }
}

/// Missing zones are read as UTC.
fn canonical_zone(zone: &str) -> Option<String> {
    if zone.is_empty() || zone == "Z" {
        return Some("+00:00".to_string());
    }
    let (sign, digits) = zone.split_at(1);
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match digits.len() {
        2 => Some(format!("{sign}{digits}:00")),
        4 => Some(format!("{sign}{}:{}", &digits[..2], &digits[2..])),
        _ => None,
    }
}

fn pad_fraction(body: &str) -> String {
    match body.rsplit_once('.') {
        Some((base, fraction)) => {
            let mut micros: String = fraction.chars().take(6).collect();
            while micros.len() < 6 {
                micros.push('0');
            }
            format!("{base}.{micros}")
        }
        None => body.to_string(),
    }
}

/// Pads year-only and year-month release dates to a full `YYYY-MM-DD`.
pub fn normalize_release_date(raw: &str) -> Result<String, FormatError> {
    let trimmed = raw.trim();
    let padded = match trimmed.split('-').count() {
        1 => format!("{trimmed}-01-01"),
        2 => format!("{trimmed}-01"),
        _ => trimmed.to_string(),
    };
    NaiveDate::parse_from_str(&padded, "%Y-%m-%d")
        .map(|date| date.format("%Y-%m-%d").to_string())
        .map_err(|err| FormatError::new("release_date", raw, err.to_string()))
}

/// Release date with the unknown placeholder for absent or junk values.
pub fn release_date_or_unknown(raw: Option<&str>) -> String {
    match raw.map(normalize_release_date) {
        Some(Ok(date)) => date,
        Some(Err(err)) => {
            tracing::debug!(%err, "falling back to unknown release date");
            UNKNOWN_RELEASE_DATE.to_string()
        }
        None => UNKNOWN_RELEASE_DATE.to_string(),
    }
}

/// The fixed offset every "local" hour and day is computed in. This is not
/// a timezone: DST transitions are ignored.
pub fn reporting_offset(hours: i32) -> Option<FixedOffset> {
    if !(-12..=14).contains(&hours) {
        return None;
    }
    FixedOffset::east_opt(hours * 3600)
}

/// Serde adapter storing instants as canonical strings.
pub mod canonical_instant {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        instant: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::canonical(instant))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_instant(&raw).map_err(serde::de::Error::custom)
    }
}
