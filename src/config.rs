use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::BufferError;

/// Sizing policy of a [`HostBuffer`](crate::HostBuffer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Size of the backing store at creation, in bytes.
    pub initial_size: u64,
    /// The backing store never grows past this.
    pub max_size: u64,
    /// Multiplier applied to the capacity each time the store grows.
    pub growth_factor: f64,
    /// Alignment of every allocation, in bytes. 0 disables alignment.
    pub alignment: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            initial_size: 1 << 20,
            max_size: 256 << 20,
            growth_factor: 2.0,
            alignment: 16,
        }
    }
}

impl BufferConfig {
    pub fn from_json(json: &str) -> Result<Self, BufferError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, BufferError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), BufferError> {
        if self.initial_size == 0 {
            return Err(BufferError::Config("initial_size must be non-zero".into()));
        }
        if self.max_size < self.initial_size {
            return Err(BufferError::Config(format!(
                "max_size ({}) is smaller than initial_size ({})",
                self.max_size, self.initial_size
            )));
        }
        if !(self.growth_factor > 1.0) {
            return Err(BufferError::Config(format!(
                "growth_factor must be greater than 1, got {}",
                self.growth_factor
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = BufferConfig::from_json(r#"{ "initial_size": 4096 }"#).unwrap();
        assert_eq!(config.initial_size, 4096);
        assert_eq!(config.alignment, BufferConfig::default().alignment);
        assert_eq!(config.max_size, BufferConfig::default().max_size);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            BufferConfig::from_json(r#"{ "initial_size": 0 }"#),
            Err(BufferError::Config(_))
        ));
        assert!(matches!(
            BufferConfig::from_json(r#"{ "initial_size": 100, "max_size": 10 }"#),
            Err(BufferError::Config(_))
        ));
        assert!(matches!(
            BufferConfig::from_json(r#"{ "growth_factor": 1.0 }"#),
            Err(BufferError::Config(_))
        ));
        assert!(matches!(
            BufferConfig::from_json("not json"),
            Err(BufferError::Json(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            BufferConfig::load("/nonexistent/dust-suballoc.json"),
            Err(BufferError::Io(_))
        ));
    }

    #[test]
    fn test_round_trip_through_json() {
        let config = BufferConfig {
            initial_size: 512,
            max_size: 8192,
            growth_factor: 1.5,
            alignment: 64,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(BufferConfig::from_json(&json).unwrap(), config);
    }
}
