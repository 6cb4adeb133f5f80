//! Packed calendar time as stored in key and directory headers.
//!
//! The 32-bit layout, most significant bits first, is
//! `year-1995 (6) | month (4) | day (5) | hour (5) | minute (6) | second (6)`.

use std::fmt::{Display, Formatter};

use chrono::format::StrftimeItems;
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};

const YEAR_OFFSET: i32 = 1995;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Datime(u32);

impl Datime {
    pub fn now() -> Self {
        Self::from_naive(Local::now().naive_local())
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    /// from_naive packs dt; years outside [1995, 2058] are clamped to the representable range.
    pub fn from_naive(dt: NaiveDateTime) -> Self {
        let year = (dt.year() - YEAR_OFFSET).clamp(0, 63) as u32;
        Self(
            year << 26
                | dt.month() << 22
                | dt.day() << 17
                | dt.hour() << 12
                | dt.minute() << 6
                | dt.second(),
        )
    }

    /// to_naive unpacks the value, returning None for bit patterns that are no calendar date.
    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        let v = self.0;
        let year = (v >> 26) as i32 + YEAR_OFFSET;
        let month = (v << 6) >> 28;
        let day = (v << 10) >> 27;
        let hour = (v << 15) >> 27;
        let minute = (v << 20) >> 26;
        let second = (v << 26) >> 26;
        NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
    }
}

impl Display for Datime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.to_naive() {
            Some(dt) => write!(f, "{}", time_format(dt)),
            None => write!(f, "invalid-datime({:#010x})", self.0),
        }
    }
}

pub fn time_format(dt: NaiveDateTime) -> String {
    let fmt = StrftimeItems::new("%Y-%m-%d %H:%M:%S");
    format!("{}", dt.format_with_items(fmt))
}
