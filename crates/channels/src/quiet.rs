//! Quiet hours for outbound notifications.

use chrono::{NaiveTime, Timelike};

/// A do-not-disturb window, possibly crossing midnight.
#[derive(Debug, Clone, Copy)]
pub struct QuietHours {
    start: NaiveTime,
    end: NaiveTime,
}

impl QuietHours {
    /// Parse `"HH:MM"` bounds; malformed input falls back to 22:00-08:00.
    pub fn new(start: &str, end: &str) -> Self {
        Self {
            start: parse_hhmm(start).unwrap_or_else(|| NaiveTime::from_hms_opt(22, 0, 0).unwrap()),
            end: parse_hhmm(end).unwrap_or_else(|| NaiveTime::from_hms_opt(8, 0, 0).unwrap()),
        }
    }

    /// Whether `now` falls inside the window. The start is inclusive, the
    /// end exclusive; a start after the end means the window wraps past
    /// midnight.
    pub fn is_dnd(&self, now: NaiveTime) -> bool {
        let current = now.with_second(0).unwrap_or(now).with_nanosecond(0).unwrap_or(now);
        if self.start > self.end {
            current >= self.start || current < self.end
        } else {
            self.start <= current && current < self.end
        }
    }

    pub fn is_dnd_now(&self) -> bool {
        self.is_dnd(chrono::Local::now().time())
    }
}

fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    let mut parts = value.splitn(2, ':');
    let hour: u32 = parts.next()?.trim().parse().ok()?;
    let minute: u32 = parts.next()?.trim().parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}
