//! Attendance state machine: one record per identity per calendar day.
//!
//! Per identity and day the state moves `NoRecord → {Success, Late}` and is
//! terminal once set. A recognition outside the check-in window leaves the day
//! in `NoRecord`.

use crate::types::AttendanceStatus;
use chrono::{NaiveDateTime, NaiveTime};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum WindowError {
    #[error("check-in window must satisfy opens <= late_after <= closes ({opens} / {late_after} / {closes})")]
    Unordered {
        opens: NaiveTime,
        late_after: NaiveTime,
        closes: NaiveTime,
    },
}

/// Daily check-in window. All bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttendanceWindow {
    opens: NaiveTime,
    late_after: NaiveTime,
    closes: NaiveTime,
}

impl AttendanceWindow {
    pub fn new(opens: NaiveTime, late_after: NaiveTime, closes: NaiveTime) -> Result<Self, WindowError> {
        if !(opens <= late_after && late_after <= closes) {
            return Err(WindowError::Unordered { opens, late_after, closes });
        }
        Ok(Self { opens, late_after, closes })
    }

    pub fn opens(&self) -> NaiveTime {
        self.opens
    }

    pub fn late_after(&self) -> NaiveTime {
        self.late_after
    }

    pub fn closes(&self) -> NaiveTime {
        self.closes
    }

    /// Status for a fresh check-in at `t`, or `None` when the window is closed.
    pub fn status_at(&self, t: NaiveTime) -> Option<AttendanceStatus> {
        if t < self.opens || t > self.closes {
            None
        } else if t <= self.late_after {
            Some(AttendanceStatus::Success)
        } else {
            Some(AttendanceStatus::Late)
        }
    }
}

impl Default for AttendanceWindow {
    /// 06:00 – 10:00, late after 08:00.
    fn default() -> Self {
        let at = |h| NaiveTime::from_hms_opt(h, 0, 0).unwrap_or_default();
        Self {
            opens: at(6),
            late_after: at(8),
            closes: at(10),
        }
    }
}

/// What to do for a matched identity, given today's stored record (if any).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Persist a new record with this status.
    Record(AttendanceStatus),
    /// A record exists already; report it without writing.
    Existing(AttendanceStatus),
    /// No record and outside the window.
    Closed,
}

pub fn decide(existing: Option<AttendanceStatus>, window: &AttendanceWindow, t: NaiveTime) -> Decision {
    match existing {
        Some(status) => Decision::Existing(status),
        None => window.status_at(t).map_or(Decision::Closed, Decision::Record),
    }
}

/// Result of the attendance step, as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttendanceOutcome {
    Recorded(AttendanceStatus),
    AlreadyRecorded(AttendanceStatus),
    WindowClosed,
}

impl AttendanceOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            AttendanceOutcome::Recorded(AttendanceStatus::Success) => "Check-in recorded",
            AttendanceOutcome::Recorded(AttendanceStatus::Late) => "Checked in late",
            AttendanceOutcome::AlreadyRecorded(AttendanceStatus::Success) => "Already checked in on time",
            AttendanceOutcome::AlreadyRecorded(AttendanceStatus::Late) => "Already checked in late",
            AttendanceOutcome::WindowClosed => "Check-in window closed",
        }
    }
}

/// Source of the current local wall-clock time.
pub trait Clock: Send {
    fn now(&self) -> NaiveDateTime;
}

/// The host's local time zone.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}
