use chrono::Timelike;

use crate::error::ClockError;

/// Reading from the network time source, before any zone adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawTime {
    pub hour: i32,
    pub minute: i32,
}

impl RawTime {
    /// What a time source reports before its first successful sync.
    pub const UNSYNCED: Self = Self {
        hour: -1,
        minute: -1,
    };

    pub fn new(hour: i32, minute: i32) -> Self {
        Self { hour, minute }
    }

    pub fn from_time<T: Timelike>(time: &T) -> Self {
        Self {
            hour: time.hour() as i32,
            minute: time.minute() as i32,
        }
    }

    pub fn is_synced(&self) -> bool {
        (0..24).contains(&self.hour) && (0..60).contains(&self.minute)
    }

    pub fn synced(self) -> Result<Self, ClockError> {
        if self.is_synced() {
            Ok(self)
        } else {
            Err(ClockError::TimeUnavailable)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTime {
    pub hour: u8,
    pub minute: i32,
}

pub trait TimeSource {
    fn raw_time(&mut self) -> RawTime;
}

/// Shifts a raw hour by the zone offset plus one hour of daylight saving and
/// wraps it into `0..=23`. Defined for every integer input; the minute is
/// passed through untouched.
pub fn adjust(raw_hour: i32, raw_minute: i32, offset_hours: i32, dst: bool) -> LocalTime {
    let shifted = i64::from(raw_hour) + i64::from(offset_hours) + i64::from(dst);
    LocalTime {
        hour: shifted.rem_euclid(24) as u8,
        minute: raw_minute,
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveTime;

    use super::*;

    #[test]
    fn wraps_forward_past_midnight() {
        assert_eq!(adjust(23, 0, 3, false), LocalTime { hour: 2, minute: 0 });
        assert_eq!(adjust(23, 45, 0, true), LocalTime { hour: 0, minute: 45 });
    }

    #[test]
    fn wraps_backward_before_midnight() {
        assert_eq!(adjust(1, 0, -3, false), LocalTime { hour: 22, minute: 0 });
        assert_eq!(adjust(0, 10, -12, true), LocalTime { hour: 13, minute: 10 });
    }

    #[test]
    fn result_is_always_a_valid_hour() {
        for raw_hour in -200..200 {
            for offset in -100..100 {
                for dst in [false, true] {
                    let local = adjust(raw_hour, 7, offset, dst);
                    assert!(local.hour < 24, "{raw_hour} {offset} {dst}");
                    assert_eq!(local.minute, 7);
                    let expected = (raw_hour + offset + i32::from(dst)).rem_euclid(24);
                    assert_eq!(i32::from(local.hour), expected);
                }
            }
        }
    }

    #[test]
    fn extreme_inputs_do_not_overflow() {
        assert!(adjust(i32::MAX, 0, i32::MAX, true).hour < 24);
        assert!(adjust(i32::MIN, 0, i32::MIN, false).hour < 24);
        assert!(adjust(RawTime::UNSYNCED.hour, RawTime::UNSYNCED.minute, 1, false).hour < 24);
    }

    #[test]
    fn unsynced_reading_is_time_unavailable() {
        assert!(matches!(
            RawTime::UNSYNCED.synced(),
            Err(ClockError::TimeUnavailable)
        ));
        assert!(RawTime::new(24, 0).synced().is_err());
        assert!(RawTime::new(12, 60).synced().is_err());
        assert_eq!(RawTime::new(0, 0).synced().unwrap(), RawTime::new(0, 0));
    }

    #[test]
    fn reads_hour_and_minute_from_chrono() {
        let time = NaiveTime::from_hms_opt(17, 42, 9).unwrap();
        assert_eq!(RawTime::from_time(&time), RawTime::new(17, 42));
    }
}
