use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for a single worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Upper bound on simultaneously executing tasks.
    pub max_concurrency: usize,
    /// Seconds the dispatcher sleeps after a reservation that returned
    /// nothing.
    pub poll_interval_secs: f64,
    /// Maximum number of tasks fetched by a single reservation. Also capped
    /// dynamically by the free concurrency slots.
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            poll_interval_secs: 1.0,
            batch_size: 10,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == 0 {
            return Err("max_concurrency must be at least 1".to_string());
        }
        if !(self.poll_interval_secs > 0.0) {
            return Err("poll_interval_secs must be positive".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.batch_size, 10);
    }

    #[test]
    fn rejects_zero_knobs() {
        assert!(WorkerConfig {
            max_concurrency: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(WorkerConfig {
            poll_interval_secs: 0.0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(WorkerConfig {
            batch_size: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn partial_config_deserializes_with_defaults() {
        let config: WorkerConfig = serde_json::from_str(r#"{"max_concurrency": 3}"#).unwrap();
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.batch_size, 10);
    }
}
