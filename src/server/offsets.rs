//! Last committed sequence per sensor.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Thread-safe, monotonic map of sensor id to last committed sequence.
///
/// Consulted by the scheduler as the `since_sequence` high-water mark, so a
/// server restart resumes from what was actually acked rather than from
/// whatever the store happens to hold.
#[derive(Default)]
pub struct OffsetTracker {
    offsets: Mutex<HashMap<String, i64>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `sequence` if it advances the sensor's high-water mark.
    pub fn update(&self, sensor_id: &str, sequence: i64) {
        let mut offsets = self.offsets.lock();
        let current = offsets.entry(sensor_id.to_string()).or_insert(0);
        if sequence > *current {
            *current = sequence;
        }
    }

    pub fn get(&self, sensor_id: &str) -> i64 {
        self.offsets.lock().get(sensor_id).copied().unwrap_or(0)
    }

    pub fn all(&self) -> HashMap<String, i64> {
        self.offsets.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_monotonic() {
        let tracker = OffsetTracker::new();
        assert_eq!(tracker.get("s1"), 0);
        tracker.update("s1", 5);
        assert_eq!(tracker.get("s1"), 5);
        tracker.update("s1", 3);
        assert_eq!(tracker.get("s1"), 5);
        tracker.update("s1", 9);
        assert_eq!(tracker.get("s1"), 9);
        tracker.update("s2", 1);
        assert_eq!(tracker.all().len(), 2);
    }
}
