//! Tree model configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, TreeError};

/// Runtime options for an [`AsyncTreeModel`](crate::AsyncTreeModel).
///
/// Every field has a default, so partial configuration documents are fine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Show a synthetic "loading" child while a node's children are fetched.
    pub show_placeholder_while_loading: bool,
    /// `1` runs fetches on a serial worker queue, more uses a thread pool.
    pub worker_threads: usize,
    /// Window used to batch `queue_update` bursts.
    pub update_coalesce_ms: u64,
    /// Delay before asking an unavailable provider again for a first load.
    pub unavailable_retry_ms: u64,
    /// Retries before an unavailable first load materializes as empty.
    pub max_unavailable_retries: u32,
    /// Fetch children twice and report providers with unstable equality.
    pub verify_structure: bool,
    pub consumer_thread_name: String,
    pub worker_thread_name: String,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            show_placeholder_while_loading: true,
            worker_threads: 1,
            update_coalesce_ms: 50,
            unavailable_retry_ms: 500,
            max_unavailable_retries: 3,
            verify_structure: false,
            consumer_thread_name: "tree-consumer".to_string(),
            worker_thread_name: "tree-worker".to_string(),
        }
    }
}

impl TreeConfig {
    /// Checks values that would leave the model unable to make progress.
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(TreeError::Config(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.consumer_thread_name.is_empty() || self.worker_thread_name.is_empty() {
            return Err(TreeError::Config("thread names must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn update_coalesce_delay(&self) -> Duration {
        Duration::from_millis(self.update_coalesce_ms)
    }

    pub fn unavailable_retry_delay(&self) -> Duration {
        Duration::from_millis(self.unavailable_retry_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TreeConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.show_placeholder_while_loading);
        assert_eq!(config.worker_threads, 1);
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let config: TreeConfig =
            serde_json::from_str(r#"{ "worker_threads": 4, "verify_structure": true }"#)
                .expect("config should parse");
        assert_eq!(config.worker_threads, 4);
        assert!(config.verify_structure);
        assert_eq!(config.update_coalesce_ms, 50);
        assert_eq!(config.consumer_thread_name, "tree-consumer");
    }

    #[test]
    fn zero_workers_rejected() {
        let config = TreeConfig {
            worker_threads: 0,
            ..TreeConfig::default()
        };
        assert!(matches!(config.validate(), Err(TreeError::Config(_))));
    }
}
