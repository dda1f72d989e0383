use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::Deserialize;

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Artificial per-request latency, configured in milliseconds.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RandomLatency {
    pub min: u64,
    pub max: u64,
}

impl RandomLatency {
    pub fn sample(&self) -> Duration {
        if self.max == 0 || self.max <= self.min {
            return Duration::from_millis(self.min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(self.min..=self.max))
    }

    pub async fn apply(&self) {
        if self.max > 0 {
            tokio::time::sleep(self.sample()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_sample_stays_in_range() {
        let latency = RandomLatency { min: 5, max: 20 };
        for _ in 0..100 {
            let d = latency.sample().as_millis() as u64;
            assert!((5..=20).contains(&d));
        }
    }

    #[test]
    fn zero_latency_samples_zero() {
        let latency = RandomLatency::default();
        assert_eq!(latency.sample(), Duration::from_millis(0));
    }
}
