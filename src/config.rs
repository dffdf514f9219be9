use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{GridError, Result};
use crate::scheduler::job::{PartitionKey, ServiceId, ServiceVersion};

/// Lease timing and retry policy.
///
/// The lease must outlast a worker's processing time plus one round trip,
/// otherwise live jobs get reclaimed and processed twice. Short leases
/// recover from dead workers faster; long leases waste less work.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Lease duration for partitions without an override
    pub default_lease_ms: u64,
    /// Background sweep period
    pub sweep_interval_ms: u64,
    /// Reclaims allowed before a job fails
    pub max_retries: u32,
    /// Per-partition lease durations
    pub overrides: HashMap<PartitionKey, u64>,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_lease_ms: 30_000,
            sweep_interval_ms: 1_000,
            max_retries: 3,
            overrides: HashMap::new(),
        }
    }
}

impl LeaseConfig {
    pub fn lease_for(&self, key: &PartitionKey) -> Duration {
        let ms = self
            .overrides
            .get(key)
            .copied()
            .unwrap_or(self.default_lease_ms);
        Duration::from_millis(ms)
    }

    /// Background sweep period, never shorter than 1ms.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Upper bounds on caller-supplied partition identifiers. `None` means
/// unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionBounds {
    pub max_service_id: Option<ServiceId>,
    pub max_service_version: Option<ServiceVersion>,
}

impl PartitionBounds {
    pub fn check(&self, key: &PartitionKey) -> Result<()> {
        let id_ok = self.max_service_id.map_or(true, |max| key.service_id <= max);
        let version_ok = self
            .max_service_version
            .map_or(true, |max| key.service_version <= max);
        if id_ok && version_ok {
            Ok(())
        } else {
            Err(GridError::InvalidPartition {
                service_id: key.service_id,
                service_version: key.service_version,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub lease: LeaseConfig,
    pub bounds: PartitionBounds,
    pub max_pending_per_partition: usize,
    /// Results returned by `fetch_results` when the caller gives no limit
    pub default_fetch_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:50051"
                .parse()
                .expect("default listen address is valid"),
            lease: LeaseConfig::default(),
            bounds: PartitionBounds::default(),
            max_pending_per_partition: 10_000,
            default_fetch_limit: 100,
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_lease_ms(mut self, lease_ms: u64) -> Self {
        self.lease.default_lease_ms = lease_ms;
        self
    }

    pub fn with_lease_override(mut self, key: PartitionKey, lease_ms: u64) -> Self {
        self.lease.overrides.insert(key, lease_ms);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.lease.max_retries = max_retries;
        self
    }

    pub fn with_sweep_interval_ms(mut self, sweep_interval_ms: u64) -> Self {
        self.lease.sweep_interval_ms = sweep_interval_ms;
        self
    }

    pub fn with_bounds(mut self, bounds: PartitionBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending_per_partition = max_pending;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_config_default() {
        let cfg = LeaseConfig::default();
        assert_eq!(cfg.default_lease_ms, 30_000);
        assert_eq!(cfg.sweep_interval_ms, 1_000);
        assert_eq!(cfg.max_retries, 3);
        assert!(cfg.overrides.is_empty());
    }

    #[test]
    fn lease_override_applies_to_one_partition() {
        let cfg = ServerConfig::default()
            .with_lease_ms(2_000)
            .with_lease_override(PartitionKey::new(1, 2), 500);
        assert_eq!(
            cfg.lease.lease_for(&PartitionKey::new(1, 2)),
            Duration::from_millis(500)
        );
        assert_eq!(
            cfg.lease.lease_for(&PartitionKey::new(1, 3)),
            Duration::from_millis(2_000)
        );
    }

    #[test]
    fn unbounded_partitions_accept_anything() {
        let bounds = PartitionBounds::default();
        assert!(bounds.check(&PartitionKey::new(u32::MAX, u32::MAX)).is_ok());
    }

    #[test]
    fn bounds_reject_out_of_range_keys() {
        let bounds = PartitionBounds {
            max_service_id: Some(10),
            max_service_version: Some(2),
        };
        assert!(bounds.check(&PartitionKey::new(10, 2)).is_ok());
        assert_eq!(
            bounds.check(&PartitionKey::new(11, 0)).unwrap_err(),
            GridError::InvalidPartition {
                service_id: 11,
                service_version: 0
            }
        );
        assert!(bounds.check(&PartitionKey::new(0, 3)).is_err());
    }

    #[test]
    fn server_config_default() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:50051");
        assert_eq!(cfg.max_pending_per_partition, 10_000);
        assert_eq!(cfg.default_fetch_limit, 100);
        assert_eq!(cfg.bounds, PartitionBounds::default());
    }

    #[test]
    fn server_config_builders() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = ServerConfig::new(addr)
            .with_max_retries(5)
            .with_sweep_interval_ms(50)
            .with_max_pending(8);
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.lease.max_retries, 5);
        assert_eq!(cfg.lease.sweep_interval(), Duration::from_millis(50));
        assert_eq!(cfg.max_pending_per_partition, 8);
    }

    #[test]
    fn zero_sweep_interval_is_clamped() {
        let cfg = ServerConfig::default().with_sweep_interval_ms(0);
        assert_eq!(cfg.lease.sweep_interval(), Duration::from_millis(1));
    }
}
