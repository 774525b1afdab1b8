//! Stepped backoff for repeated receive failures

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Delays applied after consecutive receive errors
///
/// The n-th consecutive error waits `steps[n - 1]`; errors beyond the last
/// step keep waiting the last step. A successful receive resets the count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffLadder {
    steps: Vec<Duration>,
}

impl Default for BackoffLadder {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(15),
            Duration::from_secs(30),
            Duration::from_secs(60),
        ])
    }
}

impl BackoffLadder {
    /// Create a ladder; an empty list means no backoff
    pub fn new(steps: Vec<Duration>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Duration] {
        &self.steps
    }

    /// Delay after `consecutive_errors` failures in a row
    pub fn delay_for(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors == 0 {
            return Duration::ZERO;
        }
        let index = (consecutive_errors as usize - 1).min(self.steps.len().saturating_sub(1));
        self.steps.get(index).copied().unwrap_or(Duration::ZERO)
    }
}

impl Serialize for BackoffLadder {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let millis: Vec<u64> = self
            .steps
            .iter()
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .collect();
        millis.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BackoffLadder {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let millis = Vec::<u64>::deserialize(deserializer)?;
        Ok(Self::new(millis.into_iter().map(Duration::from_millis).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_steps() {
        let ladder = BackoffLadder::new(vec![
            Duration::from_millis(100),
            Duration::from_millis(500),
        ]);

        assert_eq!(ladder.delay_for(0), Duration::ZERO);
        assert_eq!(ladder.delay_for(1), Duration::from_millis(100));
        assert_eq!(ladder.delay_for(2), Duration::from_millis(500));
        assert_eq!(ladder.delay_for(10), Duration::from_millis(500));
    }

    #[test]
    fn test_empty_ladder() {
        let ladder = BackoffLadder::new(vec![]);
        assert_eq!(ladder.delay_for(3), Duration::ZERO);
    }

    #[test]
    fn test_serialized_as_millis() {
        let ladder = BackoffLadder::new(vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert_eq!(serde_json::to_string(&ladder).unwrap(), "[1000,2000]");

        let parsed: BackoffLadder = serde_json::from_str("[250]").unwrap();
        assert_eq!(parsed.delay_for(4), Duration::from_millis(250));
    }
}
