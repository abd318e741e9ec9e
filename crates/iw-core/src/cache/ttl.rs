//! Per-resource-type retention.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// Default L1 retention.
pub const DEFAULT_L1_TTL: Duration = Duration::from_secs(5 * MINUTE);
/// Default L2 retention.
pub const DEFAULT_L2_TTL: Duration = Duration::from_secs(HOUR);

/// Retention per resource type. Volatile types (compute) expire quickly,
/// slow-moving network topology is kept for a day.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    overrides: HashMap<String, Duration>,
    default_l1: Duration,
    default_l2: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        let overrides = [
            ("microsoft.compute/virtualmachines", 30 * MINUTE),
            ("microsoft.web/sites", 30 * MINUTE),
            ("microsoft.containerservice/managedclusters", 30 * MINUTE),
            ("microsoft.network/virtualnetworks", 24 * HOUR),
            ("microsoft.network/networksecuritygroups", 6 * HOUR),
            ("microsoft.storage/storageaccounts", 6 * HOUR),
            ("microsoft.sql/servers", 6 * HOUR),
        ]
        .into_iter()
        .map(|(t, secs)| (t.to_string(), Duration::from_secs(secs)))
        .collect();

        Self {
            overrides,
            default_l1: DEFAULT_L1_TTL,
            default_l2: DEFAULT_L2_TTL,
        }
    }
}

impl TtlPolicy {
    /// Creates a policy with the built-in overrides and the given defaults.
    pub fn new(default_l1: Duration, default_l2: Duration) -> Self {
        Self {
            default_l1,
            default_l2,
            ..Self::default()
        }
    }

    /// Sets (or replaces) the retention for a type.
    pub fn with_override(mut self, resource_type: &str, ttl: Duration) -> Self {
        self.overrides.insert(resource_type.to_lowercase(), ttl);
        self
    }

    /// `min(type override or default L2, default L1)`.
    pub fn l1_ttl(&self, resource_type: &str) -> Duration {
        self.l2_ttl(resource_type).min(self.default_l1)
    }

    /// Type override, or the default L2 retention.
    pub fn l2_ttl(&self, resource_type: &str) -> Duration {
        self.overrides
            .get(&resource_type.to_lowercase())
            .copied()
            .unwrap_or(self.default_l2)
    }

    /// L1 retention cap applied to every type.
    pub fn default_l1(&self) -> Duration {
        self.default_l1
    }

    /// L2 retention for types without an override.
    pub fn default_l2(&self) -> Duration {
        self.default_l2
    }

    /// Overrides in seconds, ordered by type.
    pub fn overrides(&self) -> BTreeMap<String, u64> {
        self.overrides
            .iter()
            .map(|(t, d)| (t.clone(), d.as_secs()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = TtlPolicy::default();
        assert_eq!(
            policy.l2_ttl("Microsoft.Network/virtualNetworks"),
            Duration::from_secs(24 * HOUR)
        );
        assert_eq!(policy.l2_ttl("microsoft.keyvault/vaults"), DEFAULT_L2_TTL);
        assert_eq!(policy.l1_ttl("microsoft.network/virtualnetworks"), DEFAULT_L1_TTL);
        assert_eq!(policy.overrides().len(), 7);
    }

    #[test]
    fn test_short_override_caps_l1() {
        let policy = TtlPolicy::default()
            .with_override("microsoft.compute/virtualmachines", Duration::from_secs(60));
        assert_eq!(
            policy.l1_ttl("microsoft.compute/virtualmachines"),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_custom_defaults() {
        let policy = TtlPolicy::new(Duration::from_secs(10), Duration::from_secs(100));
        assert_eq!(policy.l1_ttl("unknown/type"), Duration::from_secs(10));
        assert_eq!(policy.l2_ttl("unknown/type"), Duration::from_secs(100));
        assert_eq!(
            policy.l2_ttl("microsoft.sql/servers"),
            Duration::from_secs(6 * HOUR)
        );
    }
}
