//! Reconciles the two timestamp conventions found in `chat.db`.
//!
//! The `message.date` column counts from the Apple reference date
//! (2001-01-01 00:00:00 UTC) — in whole seconds on older systems, in
//! nanoseconds starting with High Sierra. A database that has lived through
//! the transition contains both conventions side by side, and a run on the
//! wrong OS version may have stored nonsense dates derived from the wrong
//! decoding. Rather than keying off the OS, every raw value is decided on its
//! own: a nanosecond reading that lands within [`SECONDS_CONVENTION_WINDOW`]
//! of the reference date can only be a seconds-era value.

use chrono::{NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use eyre::{Result, eyre};

/// Unix timestamp of 2001-01-01 00:00:00 UTC.
pub const APPLE_EPOCH_UNIX: i64 = 978_307_200;

/// Sentinel shown (and stored) for timestamps that decode to garbage.
pub const UNKNOWN_DATE: &str = "Unknown Date";

/// Storage/display format for canonical timestamps. Lexicographic order
/// matches chronological order, which the store's `ORDER BY timestamp` relies on.
pub const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A nanosecond decoding within this many seconds of the reference date means
/// the raw value was written under the old seconds convention.
const SECONDS_CONVENTION_WINDOW: i64 = 1_000;

/// The timezone canonical timestamps are rendered in.
#[derive(Clone, Copy)]
pub enum DisplayZone {
    Local,
    Named(Tz),
}

impl DisplayZone {
    /// `None` falls back to the system timezone. An unrecognized name is fatal.
    pub fn parse(name: Option<&str>) -> Result<Self> {
        match name {
            None => Ok(DisplayZone::Local),
            Some(n) => n
                .parse::<Tz>()
                .map(DisplayZone::Named)
                .map_err(|e| eyre!("Invalid timezone {:?}: {}", n, e)),
        }
    }

    fn naive(&self, unix: i64) -> Option<NaiveDateTime> {
        match self {
            DisplayZone::Local => chrono::Local
                .timestamp_opt(unix, 0)
                .single()
                .map(|d| d.naive_local()),
            DisplayZone::Named(tz) => tz
                .timestamp_opt(unix, 0)
                .single()
                .map(|d| d.naive_local()),
        }
    }
}

/// The believed-correct reading of a raw `message.date` value.
pub struct Reconciled {
    /// Localized `DISPLAY_FORMAT` string, or [`UNKNOWN_DATE`].
    pub display: String,
    /// Localized wall-clock time; `None` when unknown (bucketed at time zero).
    pub naive: Option<NaiveDateTime>,
    /// What the seconds decoding displays as, when the nanosecond decoding won
    /// and the losing value is still representable. A previous run on an older
    /// version of this tool may have stored a row under this timestamp; the
    /// store deletes it before inserting the corrected row.
    pub legacy_display: Option<String>,
}

pub fn reconcile(raw: i64, zone: DisplayZone) -> Reconciled {
    let ns_secs = raw / 1_000_000_000;
    let seconds_wins = ns_secs.abs() <= SECONDS_CONVENTION_WINDOW;
    let canonical = if seconds_wins { raw } else { ns_secs };

    let naive = if canonical < 0 {
        None
    } else {
        canonical
            .checked_add(APPLE_EPOCH_UNIX)
            .and_then(|unix| zone.naive(unix))
    };
    let display = match naive {
        Some(n) => n.format(DISPLAY_FORMAT).to_string(),
        None => UNKNOWN_DATE.to_string(),
    };

    let legacy_display = if seconds_wins {
        None
    } else {
        raw.checked_add(APPLE_EPOCH_UNIX)
            .and_then(|unix| zone.naive(unix))
            .map(|n| n.format(DISPLAY_FORMAT).to_string())
    };

    Reconciled {
        display,
        naive,
        legacy_display,
    }
}

/// Parse a stored canonical timestamp back into wall-clock time.
/// The [`UNKNOWN_DATE`] sentinel (and anything else unparsable) yields `None`.
pub fn parse_display(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, DISPLAY_FORMAT).ok()
}
