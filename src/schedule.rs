//! Compact class-schedule descriptor, e.g. `MWF 9:00 AM-10:00 AM`.
//!
//! Days are emitted in fixed weekly order (Mon..Sun). The pair {Tue, Thu}
//! is the literal token `TTH`; every other set concatenates the per-day
//! abbreviations (`M`, `T`, `W`, `TH`, `F`, `SAT`, `SUN`) with no separator.
//! Times are local 12-hour clock values carried as opaque strings; there is
//! no time-zone handling here.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("schedule has no days selected")]
    EmptyDays,
    #[error("unrecognized day token in {0:?}")]
    BadDayToken(String),
    #[error("invalid time {0:?}: expected H:MM AM/PM")]
    BadTime(String),
    #[error("invalid schedule {0:?}: expected '<days> <start>-<end>'")]
    BadFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScheduleDay {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl ScheduleDay {
    pub const ALL: [ScheduleDay; 7] = [
        ScheduleDay::Mon,
        ScheduleDay::Tue,
        ScheduleDay::Wed,
        ScheduleDay::Thu,
        ScheduleDay::Fri,
        ScheduleDay::Sat,
        ScheduleDay::Sun,
    ];

    pub fn token(self) -> &'static str {
        match self {
            ScheduleDay::Mon => "M",
            ScheduleDay::Tue => "T",
            ScheduleDay::Wed => "W",
            ScheduleDay::Thu => "TH",
            ScheduleDay::Fri => "F",
            ScheduleDay::Sat => "SAT",
            ScheduleDay::Sun => "SUN",
        }
    }

    /// Lowercase key used in IPC params ("mon", "tue", ...).
    pub fn key(self) -> &'static str {
        match self {
            ScheduleDay::Mon => "mon",
            ScheduleDay::Tue => "tue",
            ScheduleDay::Wed => "wed",
            ScheduleDay::Thu => "thu",
            ScheduleDay::Fri => "fri",
            ScheduleDay::Sat => "sat",
            ScheduleDay::Sun => "sun",
        }
    }

    pub fn from_key(s: &str) -> Option<ScheduleDay> {
        match s.to_ascii_lowercase().as_str() {
            "mon" => Some(ScheduleDay::Mon),
            "tue" => Some(ScheduleDay::Tue),
            "wed" => Some(ScheduleDay::Wed),
            "thu" => Some(ScheduleDay::Thu),
            "fri" => Some(ScheduleDay::Fri),
            "sat" => Some(ScheduleDay::Sat),
            "sun" => Some(ScheduleDay::Sun),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Meridiem {
    Am,
    Pm,
}

impl Meridiem {
    pub fn from_str_loose(s: &str) -> Option<Meridiem> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AM" => Some(Meridiem::Am),
            "PM" => Some(Meridiem::Pm),
            _ => None,
        }
    }
}

impl fmt::Display for Meridiem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Meridiem::Am => "AM",
            Meridiem::Pm => "PM",
        })
    }
}

/// A local 12-hour clock time, e.g. `9:05 AM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTime {
    pub hour: u8,
    pub minute: u8,
    pub meridiem: Meridiem,
}

impl ClockTime {
    pub fn new(hour: u8, minute: u8, meridiem: Meridiem) -> Result<ClockTime, ScheduleError> {
        if !(1..=12).contains(&hour) || minute > 59 {
            return Err(ScheduleError::BadTime(format!(
                "{}:{:02} {}",
                hour, minute, meridiem
            )));
        }
        Ok(ClockTime {
            hour,
            minute,
            meridiem,
        })
    }

    /// Minutes since midnight: 12:00 AM -> 0, 12:00 PM -> 720.
    pub fn minutes_since_midnight(self) -> u32 {
        let h = u32::from(self.hour % 12);
        let base = match self.meridiem {
            Meridiem::Am => 0,
            Meridiem::Pm => 720,
        };
        base + h * 60 + u32::from(self.minute)
    }

    pub fn parse(s: &str) -> Result<ClockTime, ScheduleError> {
        let bad = || ScheduleError::BadTime(s.to_string());
        let t = s.trim();
        let (clock, ampm) = t.rsplit_once(' ').ok_or_else(bad)?;
        let meridiem = Meridiem::from_str_loose(ampm).ok_or_else(bad)?;
        let (h, m) = clock.split_once(':').ok_or_else(bad)?;
        let hour: u8 = h.trim().parse().map_err(|_| bad())?;
        let minute: u8 = m.trim().parse().map_err(|_| bad())?;
        ClockTime::new(hour, minute, meridiem).map_err(|_| bad())
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:02} {}", self.hour, self.minute, self.meridiem)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub days: Vec<ScheduleDay>,
    pub start: ClockTime,
    pub end: ClockTime,
}

/// Canonical day-token run for an ordered day set.
///
/// Input order and duplicates are irrelevant; output is always in weekly
/// order. Fails with `EmptyDays` when nothing is selected.
pub fn format_days(days: &[ScheduleDay]) -> Result<String, ScheduleError> {
    let mut picked: Vec<ScheduleDay> = ScheduleDay::ALL
        .iter()
        .copied()
        .filter(|d| days.contains(d))
        .collect();
    if picked.is_empty() {
        return Err(ScheduleError::EmptyDays);
    }
    if picked == [ScheduleDay::Tue, ScheduleDay::Thu] {
        return Ok("TTH".to_string());
    }
    Ok(picked.drain(..).map(ScheduleDay::token).collect())
}

pub fn format_schedule(
    days: &[ScheduleDay],
    start: ClockTime,
    end: ClockTime,
) -> Result<String, ScheduleError> {
    Ok(format!("{} {}-{}", format_days(days)?, start, end))
}

/// Ordered weekday set from a schedule string (or a bare day-token run).
pub fn parse_days(text: &str) -> Result<Vec<ScheduleDay>, ScheduleError> {
    let run = text.trim().split_whitespace().next().unwrap_or("");
    parse_day_run(run)
}

fn parse_day_run(run: &str) -> Result<Vec<ScheduleDay>, ScheduleError> {
    if run.is_empty() {
        return Err(ScheduleError::EmptyDays);
    }
    let upper = run.to_ascii_uppercase();
    let mut found = [false; 7];
    let mut rest = upper.as_str();
    while !rest.is_empty() {
        // Longest token first so "TH" and the weekend tokens win over "T".
        let day = if let Some(r) = rest.strip_prefix("SAT") {
            rest = r;
            ScheduleDay::Sat
        } else if let Some(r) = rest.strip_prefix("SUN") {
            rest = r;
            ScheduleDay::Sun
        } else if let Some(r) = rest.strip_prefix("TH") {
            rest = r;
            ScheduleDay::Thu
        } else if let Some(r) = rest.strip_prefix('M') {
            rest = r;
            ScheduleDay::Mon
        } else if let Some(r) = rest.strip_prefix('T') {
            rest = r;
            ScheduleDay::Tue
        } else if let Some(r) = rest.strip_prefix('W') {
            rest = r;
            ScheduleDay::Wed
        } else if let Some(r) = rest.strip_prefix('F') {
            rest = r;
            ScheduleDay::Fri
        } else {
            return Err(ScheduleError::BadDayToken(run.to_string()));
        };
        found[day as usize] = true;
    }
    Ok(ScheduleDay::ALL
        .iter()
        .copied()
        .filter(|d| found[*d as usize])
        .collect())
}

/// Full inverse of `format_schedule`. The generator uses this to derive the
/// late threshold (start + grace) and the session end time.
pub fn parse_schedule(text: &str) -> Result<Schedule, ScheduleError> {
    let bad = || ScheduleError::BadFormat(text.to_string());
    let t = text.trim();
    let (day_run, times) = t.split_once(' ').ok_or_else(bad)?;
    let days = parse_day_run(day_run)?;
    let (start_raw, end_raw) = split_time_range(times).ok_or_else(bad)?;
    Ok(Schedule {
        days,
        start: ClockTime::parse(start_raw)?,
        end: ClockTime::parse(end_raw)?,
    })
}

// The '-' joining the range is unambiguous: times never contain one.
fn split_time_range(times: &str) -> Option<(&str, &str)> {
    let (a, b) = times.split_once('-')?;
    if a.trim().is_empty() || b.trim().is_empty() {
        return None;
    }
    Some((a, b))
}
