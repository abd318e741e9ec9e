//! Rollout features and stages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised by the rollout controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RolloutError {
    /// Feature name not recognised.
    #[error("Unknown feature: {0}")]
    UnknownFeature(String),

    /// Stage outside 1..=4.
    #[error("Invalid rollout stage: {0}. Must be between 1 and 4.")]
    InvalidStage(u8),
}

/// A feature gated by the rollout controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Live discovery against the cloud APIs.
    Discovery,
    /// Serving reads from the cache.
    Reads,
    /// Filling tool parameters from the inventory.
    ParameterResolution,
    /// Returning cache hits without re-filtering.
    FastPath,
}

impl Feature {
    /// Every feature, in stage order.
    pub const ALL: [Feature; 4] = [
        Feature::Discovery,
        Feature::Reads,
        Feature::ParameterResolution,
        Feature::FastPath,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Discovery => "discovery",
            Feature::Reads => "reads",
            Feature::ParameterResolution => "parameter_resolution",
            Feature::FastPath => "fast_path",
        }
    }

    /// The stage at which this feature is switched on.
    pub fn introduced_in(&self) -> RolloutStage {
        match self {
            Feature::Discovery => RolloutStage(1),
            Feature::Reads => RolloutStage(2),
            Feature::ParameterResolution => RolloutStage(3),
            Feature::FastPath => RolloutStage(4),
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = RolloutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "discovery" => Ok(Feature::Discovery),
            "reads" => Ok(Feature::Reads),
            "parameter_resolution" => Ok(Feature::ParameterResolution),
            "fast_path" => Ok(Feature::FastPath),
            other => Err(RolloutError::UnknownFeature(other.to_string())),
        }
    }
}

/// Cumulative rollout stage, 1 through 4.
///
/// Stage N switches on every feature introduced at a stage <= N.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct RolloutStage(u8);

impl RolloutStage {
    /// Discovery only.
    pub const MIN: RolloutStage = RolloutStage(1);
    /// Every feature.
    pub const MAX: RolloutStage = RolloutStage(4);

    pub fn new(stage: u8) -> Result<Self, RolloutError> {
        if (Self::MIN.0..=Self::MAX.0).contains(&stage) {
            Ok(Self(stage))
        } else {
            Err(RolloutError::InvalidStage(stage))
        }
    }

    pub fn number(&self) -> u8 {
        self.0
    }

    pub fn includes(&self, feature: Feature) -> bool {
        feature.introduced_in() <= *self
    }

    /// Features switched on at this stage.
    pub fn features(&self) -> Vec<Feature> {
        Feature::ALL
            .into_iter()
            .filter(|f| self.includes(*f))
            .collect()
    }
}

impl Default for RolloutStage {
    fn default() -> Self {
        Self::MIN
    }
}

impl TryFrom<u8> for RolloutStage {
    type Error = RolloutError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RolloutStage> for u8 {
    fn from(stage: RolloutStage) -> Self {
        stage.0
    }
}

impl fmt::Display for RolloutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {}", self.0)
    }
}
