use std::fmt;

use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime, UtcOffset};

/// A UTC timestamp truncated to the start of its minute.
///
/// Every piece of bucket state is keyed by one of these: the distinct-id set,
/// the notification target, and the finalized stat written to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Minute(OffsetDateTime);

impl Minute {
    /// The minute bucket `at` falls into.
    pub fn containing(at: OffsetDateTime) -> Self {
        let at = at.to_offset(UtcOffset::UTC);
        Minute(
            at - Duration::seconds(at.second().into())
                - Duration::nanoseconds(at.nanosecond().into()),
        )
    }

    /// The bucket one `interval` before `now`, which is what a flush tick finalizes.
    pub fn preceding(now: OffsetDateTime, interval: std::time::Duration) -> Self {
        Self::containing(now - interval)
    }

    pub fn start(&self) -> OffsetDateTime {
        self.0
    }

    /// Seconds since the epoch, used for store keys and message keys.
    pub fn epoch_seconds(&self) -> i64 {
        self.0.unix_timestamp()
    }

    /// `HH:MM:SS` label used in the stats log file.
    pub fn clock_label(&self) -> String {
        format!(
            "{:02}:{:02}:{:02}",
            self.0.hour(),
            self.0.minute(),
            self.0.second()
        )
    }

    pub fn rfc3339(&self) -> Result<String, time::error::Format> {
        self.0.format(&Rfc3339)
    }

    pub fn next(&self) -> Self {
        Minute(self.0 + Duration::MINUTE)
    }
}

impl fmt::Display for Minute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.epoch_seconds())
    }
}
