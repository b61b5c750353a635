//! Fault accounting for a running server session
//!
//! Transport read faults are tolerated up to a fixed threshold per session;
//! crossing it demands a shutdown so a wedged server cannot spam the host
//! with error noise forever.

/// Read faults tolerated before the session must be shut down
pub const FAULT_THRESHOLD: u32 = 5;

/// What the caller must do after recording a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultVerdict {
    /// Under threshold, keep the session running
    Continue,
    /// Threshold reached, stop the session and surface a single notice
    Shutdown,
}

/// How a transport closure should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseVerdict {
    /// The host asked for the stop; silence is correct
    ExpectedStop,
    /// The server went away on its own; surface a notice, never restart
    DoNotRestart,
}

/// Per-session counter of transport read faults
///
/// A tracker belongs to exactly one session; starting a new session means
/// starting a fresh tracker.
#[derive(Debug, Default)]
pub struct FaultTracker {
    count: u32,
}

impl FaultTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one fault and report whether the session may continue
    pub fn record(&mut self) -> FaultVerdict {
        self.count = self.count.saturating_add(1);
        if self.count >= FAULT_THRESHOLD {
            FaultVerdict::Shutdown
        } else {
            FaultVerdict::Continue
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_faults_under_threshold_continue() {
        let mut tracker = FaultTracker::new();
        for _ in 0..FAULT_THRESHOLD - 1 {
            assert_eq!(tracker.record(), FaultVerdict::Continue);
        }
        assert_eq!(tracker.count(), FAULT_THRESHOLD - 1);
    }

    #[test]
    fn test_threshold_fault_demands_shutdown() {
        let mut tracker = FaultTracker::new();
        for _ in 0..FAULT_THRESHOLD - 1 {
            tracker.record();
        }
        assert_eq!(tracker.record(), FaultVerdict::Shutdown);
    }

    #[test]
    fn test_counter_sticks_at_shutdown_past_threshold() {
        let mut tracker = FaultTracker::new();
        for _ in 0..FAULT_THRESHOLD + 3 {
            tracker.record();
        }
        assert_eq!(tracker.record(), FaultVerdict::Shutdown);
    }

    #[test]
    fn test_fresh_tracker_starts_at_zero() {
        let tracker = FaultTracker::new();
        assert_eq!(tracker.count(), 0);
    }
}
