//! Daily processing window.

use crate::config::ScheduleConfig;
use chrono::NaiveTime;

/// Daily window `[start, end]`, both bounds included. A start after the end
/// wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ProcessingWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn from_config(config: &ScheduleConfig) -> Self {
        Self::new(config.start_time, config.end_time)
    }

    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= now && now <= self.end
        } else {
            now >= self.start || now <= self.end
        }
    }

    /// Debug mode ignores the window.
    pub fn should_process(&self, now: NaiveTime, debug_mode: bool) -> bool {
        debug_mode || self.contains(now)
    }
}

impl std::fmt::Display for ProcessingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_overnight_window() {
        let window = ProcessingWindow::new(t(22, 0), t(6, 0));
        assert!(window.contains(t(23, 0)));
        assert!(window.contains(t(2, 30)));
        assert!(window.contains(t(22, 0)));
        assert!(window.contains(t(6, 0)));
        assert!(!window.contains(t(6, 1)));
        assert!(!window.contains(t(12, 0)));
    }

    #[test]
    fn test_daytime_window() {
        let window = ProcessingWindow::new(t(2, 0), t(10, 0));
        assert!(window.contains(t(2, 0)));
        assert!(window.contains(t(9, 59)));
        assert!(window.contains(t(10, 0)));
        assert!(!window.contains(NaiveTime::from_hms_opt(10, 0, 1).unwrap()));
        assert!(!window.contains(t(23, 0)));
    }

    #[test]
    fn test_debug_mode_ignores_window() {
        let window = ProcessingWindow::new(t(2, 0), t(10, 0));
        assert!(!window.should_process(t(12, 0), false));
        assert!(window.should_process(t(12, 0), true));
    }

    #[test]
    fn test_display() {
        assert_eq!(ProcessingWindow::new(t(22, 0), t(6, 5)).to_string(), "22:00-06:05");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_wrapped_window_is_complement_inside_bounds(
            a in 0u32..1440,
            b in 0u32..1440,
            now in 0u32..1440,
        ) {
            prop_assume!(a != b && now != a && now != b);
            let (lo, hi) = (a.min(b), a.max(b));
            let lo = t(lo / 60, lo % 60);
            let hi = t(hi / 60, hi % 60);
            let now = t(now / 60, now % 60);
            let straight = ProcessingWindow::new(lo, hi);
            let wrapped = ProcessingWindow::new(hi, lo);
            prop_assert_ne!(straight.contains(now), wrapped.contains(now));
        }

        #[test]
        fn prop_bounds_are_always_inside(a in 0u32..1440, b in 0u32..1440) {
            prop_assume!(a != b);
            let window = ProcessingWindow::new(t(a / 60, a % 60), t(b / 60, b % 60));
            prop_assert!(window.contains(window.start));
            prop_assert!(window.contains(window.end));
        }
    }
}
