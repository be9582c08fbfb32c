//! Meal-shift windows derived from wall-clock time.

use chrono::{NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// Attendance sheet a recognition belongs to.
///
/// Lunch runs 11:45–14:30 and Dinner 19:00–21:30 (start inclusive, end
/// exclusive); every other time of day is General.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShiftMode {
    Lunch,
    Dinner,
    General,
}

const LUNCH: (u32, u32) = (11 * 60 + 45, 14 * 60 + 30);
const DINNER: (u32, u32) = (19 * 60, 21 * 60 + 30);

impl ShiftMode {
    pub fn at(time: NaiveTime) -> Self {
        let minute = time.hour() * 60 + time.minute();
        let within = |(start, end): (u32, u32)| minute >= start && minute < end;
        if within(LUNCH) {
            ShiftMode::Lunch
        } else if within(DINNER) {
            ShiftMode::Dinner
        } else {
            ShiftMode::General
        }
    }

    /// Start of the window containing `now`.
    ///
    /// General has no window of its own: it starts where the previous meal
    /// window ended, or at midnight before Lunch.
    pub fn window_start(now: NaiveDateTime) -> NaiveDateTime {
        let minute = now.hour() * 60 + now.minute();
        let start = match Self::at(now.time()) {
            ShiftMode::Lunch => LUNCH.0,
            ShiftMode::Dinner => DINNER.0,
            ShiftMode::General if minute >= DINNER.1 => DINNER.1,
            ShiftMode::General if minute >= LUNCH.1 => LUNCH.1,
            ShiftMode::General => 0,
        };
        let time = NaiveTime::from_hms_opt(start / 60, start % 60, 0).unwrap_or(NaiveTime::MIN);
        now.date().and_time(time)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShiftMode::Lunch => "Lunch",
            ShiftMode::Dinner => "Dinner",
            ShiftMode::General => "General",
        }
    }
}

impl std::fmt::Display for ShiftMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_lunch_window_bounds() {
        assert_eq!(ShiftMode::at(t(11, 44)), ShiftMode::General);
        assert_eq!(ShiftMode::at(t(11, 45)), ShiftMode::Lunch);
        assert_eq!(ShiftMode::at(t(14, 29)), ShiftMode::Lunch);
        assert_eq!(ShiftMode::at(t(14, 30)), ShiftMode::General);
    }

    #[test]
    fn test_dinner_window_bounds() {
        assert_eq!(ShiftMode::at(t(18, 59)), ShiftMode::General);
        assert_eq!(ShiftMode::at(t(19, 0)), ShiftMode::Dinner);
        assert_eq!(ShiftMode::at(t(21, 29)), ShiftMode::Dinner);
        assert_eq!(ShiftMode::at(t(21, 30)), ShiftMode::General);
    }

    fn dt(h: u32, m: u32) -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2024, 3, 4).unwrap().and_time(t(h, m))
    }

    #[test]
    fn test_window_start() {
        assert_eq!(ShiftMode::window_start(dt(12, 0)), dt(11, 45));
        assert_eq!(ShiftMode::window_start(dt(19, 5)), dt(19, 0));
        assert_eq!(ShiftMode::window_start(dt(8, 30)), dt(0, 0));
        assert_eq!(ShiftMode::window_start(dt(14, 31)), dt(14, 30));
        assert_eq!(ShiftMode::window_start(dt(23, 10)), dt(21, 30));
    }

    #[test]
    fn test_serialized_names() {
        assert_eq!(serde_json::to_string(&ShiftMode::Lunch).unwrap(), "\"Lunch\"");
        assert_eq!(ShiftMode::Dinner.to_string(), "Dinner");
    }
}
