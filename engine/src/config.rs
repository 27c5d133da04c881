use serde::{Deserialize, Serialize};

pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_MAX_SCRIPT_BYTES: usize = 10_000;
pub const DEFAULT_RETAIN_FINISHED: usize = 1024;
pub const DEFAULT_SCRIPT_FILE: &str = "script.py";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sandboxes that may exist at once.
    pub pool_size: usize,
    /// Jobs waiting for a slot, across all tenants.
    pub queue_capacity: usize,
    pub max_script_bytes: usize,
    /// Terminal jobs kept for status queries; oldest are evicted first.
    pub retain_finished: usize,
    /// Name the script is written under inside its workspace.
    pub script_file: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_script_bytes: DEFAULT_MAX_SCRIPT_BYTES,
            retain_finished: DEFAULT_RETAIN_FINISHED,
            script_file: DEFAULT_SCRIPT_FILE.into(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("pool_size must be at least 1".into());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be at least 1".into());
        }
        if self.script_file.is_empty() || self.script_file.contains('/') {
            return Err(format!("invalid script_file: {:?}", self.script_file));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"pool_size": 8}"#).unwrap();
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.max_script_bytes, DEFAULT_MAX_SCRIPT_BYTES);
    }

    #[test]
    fn rejects_zero_pool() {
        let config = EngineConfig {
            pool_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
