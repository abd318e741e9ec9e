//! Cloud inventory connectors.
//!
//! Provides the Azure implementations of the resource query, subscription
//! listing and live inspection interfaces, plus configurable mocks.

pub mod azure;
pub mod mock;
