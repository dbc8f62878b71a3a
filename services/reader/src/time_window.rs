use chrono::{DateTime, Duration, Utc};

/// Half-open `[start, end)` time range a reader is restricted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The hour leading up to now
    pub fn last_hour() -> Self {
        Self::ending_at(Utc::now())
    }

    /// Fill in whichever bound is missing: `end` defaults to now and `start`
    /// to one hour before now.
    pub fn from_bounds(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        let now = Utc::now();
        Self {
            start: start.unwrap_or(now - Duration::hours(1)),
            end: end.unwrap_or(now),
        }
    }

    fn ending_at(end: DateTime<Utc>) -> Self {
        Self {
            start: end - Duration::hours(1),
            end,
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Start as epoch milliseconds, at whole-second precision
    pub fn start_millis(&self) -> i64 {
        self.start.timestamp() * 1000
    }

    /// End as epoch milliseconds, at whole-second precision
    pub fn end_millis(&self) -> i64 {
        self.end.timestamp() * 1000
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self::last_hour()
    }
}
