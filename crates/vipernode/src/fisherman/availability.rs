//! Trailing availability window per servicer

use std::collections::{HashMap, VecDeque};
use vipernet_core::Address;

/// Consecutive unavailable samples that trigger a penalty
pub const AVAILABILITY_WINDOW: usize = 5;

#[derive(Debug, Default)]
struct Window {
    recent: VecDeque<bool>,
    penalized: bool,
}

/// Tracks the last [`AVAILABILITY_WINDOW`] samples of each servicer.
///
/// A servicer is penalized once when the whole window is unavailable and
/// not again until it answers at least once.
#[derive(Debug, Default)]
pub struct AvailabilityMonitor {
    windows: HashMap<Address, Window>,
}

impl AvailabilityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample. Returns true when a penalty is due.
    pub fn record(&mut self, servicer: &Address, available: bool) -> bool {
        let window = self.windows.entry(*servicer).or_default();
        if window.recent.len() == AVAILABILITY_WINDOW {
            window.recent.pop_front();
        }
        window.recent.push_back(available);

        if available {
            window.penalized = false;
            return false;
        }
        let all_down = window.recent.len() == AVAILABILITY_WINDOW
            && window.recent.iter().all(|a| !a);
        if all_down && !window.penalized {
            window.penalized = true;
            return true;
        }
        false
    }

    pub fn is_penalized(&self, servicer: &Address) -> bool {
        self.windows.get(servicer).map(|w| w.penalized).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_penalty_once_per_outage() {
        let mut monitor = AvailabilityMonitor::new();
        let s = Address([1; 20]);
        let penalties: Vec<bool> = (0..6).map(|_| monitor.record(&s, false)).collect();
        assert_eq!(penalties, vec![false, false, false, false, true, false]);
        assert!(monitor.is_penalized(&s));
    }

    #[test]
    fn test_recovery_rearms_penalty() {
        let mut monitor = AvailabilityMonitor::new();
        let s = Address([1; 20]);
        for _ in 0..5 {
            monitor.record(&s, false);
        }
        assert!(!monitor.record(&s, true));
        assert!(!monitor.is_penalized(&s));
        let again: Vec<bool> = (0..5).map(|_| monitor.record(&s, false)).collect();
        assert_eq!(again.iter().filter(|p| **p).count(), 1);
    }

    #[test]
    fn test_servicers_tracked_independently() {
        let mut monitor = AvailabilityMonitor::new();
        let (a, b) = (Address([1; 20]), Address([2; 20]));
        for _ in 0..4 {
            monitor.record(&a, false);
            monitor.record(&b, true);
        }
        assert!(monitor.record(&a, false));
        assert!(!monitor.record(&b, false));
    }
}
