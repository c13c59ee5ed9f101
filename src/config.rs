use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CheckoutError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckoutConfig {
    /// Partition holding the pending records.
    pub partition: String,
    pub lease_ttl_ms: u64,
    pub max_selection_attempts: u32,
    pub selection_timeout_ms: u64,
    pub store_call_timeout_ms: u64,
    /// Upper bound on documents read by one candidate scan or sweep.
    pub scan_limit: usize,
    pub max_reloads_per_selection: u32,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            partition: "active".into(),
            lease_ttl_ms: 10 * 60 * 1000,
            max_selection_attempts: 250,
            selection_timeout_ms: 25_000,
            store_call_timeout_ms: 20_000,
            scan_limit: 20_000,
            max_reloads_per_selection: 2,
        }
    }
}

impl CheckoutConfig {
    pub fn validate(&self) -> Result<(), CheckoutError> {
        if self.partition.trim().is_empty() {
            return Err(CheckoutError::Validation("partition cannot be empty".into()));
        }
        if self.lease_ttl_ms < 1000 {
            return Err(CheckoutError::Validation(
                "lease_ttl_ms should be at least 1000ms".into(),
            ));
        }
        if self.max_selection_attempts == 0 {
            return Err(CheckoutError::Validation(
                "max_selection_attempts must be > 0".into(),
            ));
        }
        if self.selection_timeout_ms == 0 {
            return Err(CheckoutError::Validation(
                "selection_timeout_ms must be > 0".into(),
            ));
        }
        if self.store_call_timeout_ms == 0 {
            return Err(CheckoutError::Validation(
                "store_call_timeout_ms must be > 0".into(),
            ));
        }
        if self.scan_limit == 0 {
            return Err(CheckoutError::Validation("scan_limit must be > 0".into()));
        }
        // A drained candidate queue is only refilled by a reload
        if self.max_reloads_per_selection == 0 {
            return Err(CheckoutError::Validation(
                "max_reloads_per_selection must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn selection_timeout(&self) -> Duration {
        Duration::from_millis(self.selection_timeout_ms)
    }

    pub fn store_call_timeout(&self) -> Duration {
        Duration::from_millis(self.store_call_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CheckoutConfig::default();
        config.validate().unwrap();
        assert_eq!(config.lease_ttl(), Duration::from_secs(600));
        assert_eq!(config.partition, "active");
    }

    #[test]
    fn rejects_degenerate_values() {
        let mut config = CheckoutConfig {
            lease_ttl_ms: 500,
            ..CheckoutConfig::default()
        };
        assert!(config.validate().is_err());

        config.lease_ttl_ms = 60_000;
        config.max_selection_attempts = 0;
        assert!(config.validate().is_err());

        config.max_selection_attempts = 10;
        config.partition = "  ".into();
        assert!(config.validate().is_err());

        config.partition = "active".into();
        config.max_reloads_per_selection = 0;
        assert!(config.validate().is_err());

        config.max_reloads_per_selection = 1;
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: CheckoutConfig =
            serde_json::from_str(r#"{"partition":"triage","lease_ttl_ms":30000}"#).unwrap();
        assert_eq!(config.partition, "triage");
        assert_eq!(config.lease_ttl_ms, 30_000);
        assert_eq!(config.max_selection_attempts, 250);
    }
}
