//! Transaction manager configuration.

use serde::{Deserialize, Serialize};

use super::error::TransactionResult;
use super::retry::RetryConfig;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Persist a replication record with every transaction that mutates.
    pub replicate_transactions: bool,
    pub retry: RetryConfig,
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replicate_transactions(mut self, value: bool) -> Self {
        self.replicate_transactions = value;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> TransactionResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert!(!config.replicate_transactions);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_from_json() {
        let config = ManagerConfig::from_json(
            r#"{"replicate_transactions": true, "retry": {"max_attempts": 5}}"#,
        )
        .unwrap();
        assert!(config.replicate_transactions);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 100);

        assert!(ManagerConfig::from_json("{\"retry\": 3}").is_err());
    }
}
