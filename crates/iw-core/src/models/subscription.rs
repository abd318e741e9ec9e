use chrono::{DateTime, Utc};
use iw_connectors::RawSubscription;
use serde::{Deserialize, Serialize};

/// A subscription reachable by the configured credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: String,
    pub display_name: String,
    pub state: String,
    pub tenant_id: String,
    pub discovered_at: DateTime<Utc>,
}

impl Subscription {
    pub fn from_raw(raw: RawSubscription, discovered_at: DateTime<Utc>) -> Self {
        Self {
            subscription_id: raw.subscription_id,
            display_name: raw.display_name,
            state: raw.state,
            tenant_id: raw.tenant_id,
            discovered_at,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.eq_ignore_ascii_case("enabled")
    }
}
