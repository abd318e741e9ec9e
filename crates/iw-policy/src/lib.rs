//! # iw-policy
//!
//! Staged rollout and circuit breaking for Inventory Warden.
//!
//! This crate decides whether discovery, cache reads, parameter resolution
//! and the fast read path may run, and switches them off automatically when
//! they start failing.

pub mod feature;
pub mod rollout;

pub use feature::{Feature, RolloutError, RolloutStage};
pub use rollout::{
    FeatureCondition, FeatureState, FeatureStatus, RolloutConfig, RolloutController,
    RolloutEvent, RolloutStatus, StateChange,
};
