use crate::stats::{average_of, one_percent_low_of};
use parking_lot::Mutex;
use std::time::SystemTime;

/// Point-in-time statistics of the current session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionStats {
    pub avg_fps: f64,
    pub one_percent_low: f64,
    pub sample_count: usize,
}

impl SessionStats {
    /// Whether the session recorded anything worth uploading
    pub fn has_data(&self) -> bool {
        self.avg_fps > 0.0
    }
}

struct AccumulatorState {
    samples: Vec<f64>,
    started_at: Option<SystemTime>,
}

/// Aggregates accepted FPS samples for the session in progress.
///
/// Samples are only fed in while the gate reports recording && active, in
/// arrival order, by a single producer; one lock covers the whole state.
/// Cleared after every upload attempt, successful or not.
pub struct SessionAccumulator {
    inner: Mutex<AccumulatorState>,
}

impl SessionAccumulator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AccumulatorState {
                samples: Vec::new(),
                started_at: None,
            }),
        }
    }

    /// Record one accepted FPS sample; the first sample marks session start
    pub fn add_fps(&self, fps: f64) {
        let mut state = self.inner.lock();
        if state.started_at.is_none() {
            state.started_at = Some(SystemTime::now());
        }
        state.samples.push(fps);
    }

    /// Average and 1%-low of the session so far (0.0 / 0.0 when empty)
    pub fn stats(&self) -> SessionStats {
        let state = self.inner.lock();
        SessionStats {
            avg_fps: average_of(&state.samples),
            one_percent_low: one_percent_low_of(&state.samples),
            sample_count: state.samples.len(),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.inner.lock().samples.len()
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.inner.lock().started_at
    }

    /// Reset for the next session
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.samples.clear();
        state.started_at = None;
    }
}

impl Default for SessionAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_session_has_no_data() {
        let accumulator = SessionAccumulator::new();
        let stats = accumulator.stats();
        assert!(!stats.has_data());
        assert_eq!(stats.avg_fps, 0.0);
        assert_eq!(stats.one_percent_low, 0.0);
        assert_eq!(stats.sample_count, 0);
        assert!(accumulator.started_at().is_none());
    }

    #[test]
    fn test_session_statistics() {
        let accumulator = SessionAccumulator::new();
        for fps in [58.0, 59.0, 60.0, 61.0, 60.0, 59.0, 58.0, 62.0, 60.0, 61.0] {
            accumulator.add_fps(fps);
        }

        let stats = accumulator.stats();
        assert_eq!(stats.avg_fps, 59.8);
        // 10 samples: worst_count = 1, so the minimum
        assert_eq!(stats.one_percent_low, 58.0);
        assert_eq!(stats.sample_count, 10);
        assert!(stats.has_data());
    }

    #[test]
    fn test_first_sample_marks_start() {
        let accumulator = SessionAccumulator::new();
        assert!(accumulator.started_at().is_none());
        accumulator.add_fps(60.0);
        assert!(accumulator.started_at().is_some());
    }

    #[test]
    fn test_clear_resets_everything() {
        let accumulator = SessionAccumulator::new();
        accumulator.add_fps(60.0);
        accumulator.add_fps(61.0);
        accumulator.clear();

        assert_eq!(accumulator.sample_count(), 0);
        assert!(accumulator.started_at().is_none());
        assert!(!accumulator.stats().has_data());
    }

    #[test]
    fn test_small_session_low_is_minimum() {
        let accumulator = SessionAccumulator::new();
        accumulator.add_fps(60.0);
        accumulator.add_fps(45.0);
        accumulator.add_fps(55.0);
        assert_eq!(accumulator.stats().one_percent_low, 45.0);
    }
}
