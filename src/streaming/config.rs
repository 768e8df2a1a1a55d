//! Streaming configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::Error;
use crate::core::types::Result;
use crate::streaming::materialize::RenderConfig;

/// Tunables of the streamer. Missing JSON fields fall back to the defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Maximum number of points admitted for display at once
    pub point_budget: u64,
    /// Nodes projecting to fewer pixels than this are not loaded
    pub min_projected_size: f32,
    /// Nodes materialized per consumer tick
    pub max_materialize_per_tick: usize,
    /// Display handles destroyed per consumer tick
    pub max_destroy_per_tick: usize,
    /// How long the loader sleeps on an empty queue before re-checking (ms)
    pub loader_idle_wait_ms: u64,
    /// Passed to the materializer
    pub render: RenderConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            point_budget: 2_000_000,
            min_projected_size: 30.0,
            max_materialize_per_tick: 4,
            max_destroy_per_tick: 16,
            loader_idle_wait_ms: 10,
            render: RenderConfig::default(),
        }
    }
}

impl StreamingConfig {
    /// Default config with a different point budget
    pub fn with_budget(point_budget: u64) -> Self {
        Self {
            point_budget,
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json)?;
        log::info!("Loaded streaming config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Reject values the scheduler cannot make progress with
    pub fn validate(&self) -> Result<()> {
        if self.point_budget == 0 {
            return Err(Error::InvalidConfig("point_budget must be positive".into()));
        }
        if !self.min_projected_size.is_finite() || self.min_projected_size < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "min_projected_size must be a non-negative number, got {}",
                self.min_projected_size
            )));
        }
        if self.max_materialize_per_tick == 0 || self.max_destroy_per_tick == 0 {
            return Err(Error::InvalidConfig("per-tick caps must be at least 1".into()));
        }
        if self.render.point_size <= 0.0 {
            return Err(Error::InvalidConfig("render.point_size must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(StreamingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = StreamingConfig::from_json(r#"{"point_budget": 5000, "max_materialize_per_tick": 2}"#).unwrap();
        assert_eq!(config.point_budget, 5000);
        assert_eq!(config.max_materialize_per_tick, 2);
        assert_eq!(config.max_destroy_per_tick, StreamingConfig::default().max_destroy_per_tick);
        assert_eq!(config.render, RenderConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            StreamingConfig::from_json(r#"{"point_budget": 0}"#),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            StreamingConfig::from_json(r#"{"max_destroy_per_tick": 0}"#),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            StreamingConfig::from_json(r#"{"min_projected_size": -1.0}"#),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(StreamingConfig::from_json("{"), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streaming.json");

        let mut config = StreamingConfig::with_budget(123_456);
        config.render.point_size = 3.5;
        config.save(&path).unwrap();

        assert_eq!(StreamingConfig::load(&path).unwrap(), config);
    }
}
