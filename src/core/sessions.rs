use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::US::Eastern;

use crate::config::Config;

pub const OFF_SESSION: &str = "off_session";

/// Maps wall-clock time onto the configured FX sessions (ET).
pub struct SessionManager {
    pub current_session: String,
    trade_sessions: Vec<String>,
}

impl SessionManager {
    pub fn new(cfg: &Config) -> Self {
        Self {
            current_session: OFF_SESSION.to_string(),
            trade_sessions: cfg.trade_sessions.clone(),
        }
    }

    pub fn update(&mut self, cfg: &Config, utc_now: DateTime<Utc>) {
        self.current_session = Self::session_at(cfg, utc_now);
    }

    pub fn session_at(cfg: &Config, utc_now: DateTime<Utc>) -> String {
        let et_now = utc_now.with_timezone(&Eastern);
        let current = et_now.hour() * 60 + et_now.minute();

        for (name, times) in &cfg.sessions {
            let start = times.start.0 * 60 + times.start.1;
            let end = times.end.0 * 60 + times.end.1;

            let inside = if start < end {
                current >= start && current < end
            } else {
                // Wraps midnight (Asian session)
                current >= start || current < end
            };
            if inside {
                return name.clone();
            }
        }
        OFF_SESSION.to_string()
    }

    pub fn is_trade_session(&self) -> bool {
        self.trade_sessions.iter().any(|s| *s == self.current_session)
    }

    /// FX trades from Sunday 17:00 ET to Friday 17:00 ET.
    pub fn is_market_open(utc_now: DateTime<Utc>) -> bool {
        let et = utc_now.with_timezone(&Eastern);
        match et.weekday() {
            Weekday::Sat => false,
            Weekday::Sun => et.hour() >= 17,
            Weekday::Fri => et.hour() < 17,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::default_test_config;
    use chrono::{NaiveDate, TimeZone};

    // January: ET = UTC-5. 2024-01-15 is a Monday.
    fn utc_for_et(day: u32, et_hour: u32, et_minute: u32) -> DateTime<Utc> {
        let utc_hour = et_hour + 5;
        let (day, hour) = if utc_hour >= 24 {
            (day + 1, utc_hour - 24)
        } else {
            (day, utc_hour)
        };
        let naive = NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hour, et_minute, 0)
            .unwrap();
        Utc.from_utc_datetime(&naive)
    }

    #[test]
    fn london_and_new_york() {
        let cfg = default_test_config();
        let mut sm = SessionManager::new(&cfg);
        sm.update(&cfg, utc_for_et(15, 4, 30));
        assert_eq!(sm.current_session, "london");
        assert!(sm.is_trade_session());

        sm.update(&cfg, utc_for_et(15, 9, 0));
        assert_eq!(sm.current_session, "new_york");
        assert!(sm.is_trade_session());
    }

    #[test]
    fn asian_wraps_midnight_and_is_not_traded() {
        let cfg = default_test_config();
        let mut sm = SessionManager::new(&cfg);
        sm.update(&cfg, utc_for_et(15, 21, 0));
        assert_eq!(sm.current_session, "asian");
        sm.update(&cfg, utc_for_et(15, 1, 0));
        assert_eq!(sm.current_session, "asian");
        assert!(!sm.is_trade_session());
    }

    #[test]
    fn gap_between_sessions_is_off() {
        let cfg = default_test_config();
        assert_eq!(SessionManager::session_at(&cfg, utc_for_et(15, 18, 0)), OFF_SESSION);
    }

    #[test]
    fn weekend_closed() {
        assert!(!SessionManager::is_market_open(utc_for_et(20, 12, 0))); // Saturday
        assert!(!SessionManager::is_market_open(utc_for_et(21, 10, 0))); // Sunday morning
        assert!(SessionManager::is_market_open(utc_for_et(21, 18, 0))); // Sunday evening
        assert!(SessionManager::is_market_open(utc_for_et(17, 12, 0))); // Wednesday
        assert!(!SessionManager::is_market_open(utc_for_et(19, 17, 30))); // Friday close
    }
}
