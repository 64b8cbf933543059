use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::ConfigError;

/// Tunables for the fleet, the node client and the workload.
///
/// Every field has a default, so a JSON file only needs to carry overrides.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Root of all fleet state: metadata file and per-node working directories.
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    /// Node executable. Defaults to `<data_dir>/bin/node` when unset.
    pub node_binary: Option<PathBuf>,
    /// Files copied into every node directory before launch, e.g. the
    /// shared key file the node expects next to its data.
    pub node_support_files: Vec<PathBuf>,

    pub base_server_port: u16,
    pub base_secondary_port: u16,

    pub consensus_node_count: usize,
    pub min_transaction_nodes: usize,
    pub max_transaction_nodes: usize,
    pub min_transactions: usize,
    pub max_transactions: usize,

    pub node_boot_grace_secs: u64,
    pub node_startup_timeout_secs: u64,
    pub readiness_backoff: Backoff,
    pub request_timeout_secs: u64,
    /// Second leg of the signing handshake may wait for peer agreement.
    pub signing_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub restart_attempts: u32,
    pub restart_spacing_secs: u64,

    pub identity_password: String,
    pub consensus_key_password: String,

    pub funding_units: u32,
    pub funding_attempts: u32,
    pub funding_balance_polls: u32,
    pub funding_poll_interval_secs: u64,

    pub registration_settle_ms: u64,
    pub rebroadcast_spacing_ms: u64,

    pub round_settle_ms: u64,
    pub balance_floor: f64,
    pub max_transfer_amount: u32,
    pub rng_seed: Option<u64>,

    pub monitor: MonitorConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub min_balance: f64,
    pub refill_units: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 600,
            min_balance: 1000.0,
            refill_units: 100,
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./fleet-data"),
            reports_dir: PathBuf::from("./reports"),
            node_binary: None,
            node_support_files: Vec::new(),
            base_server_port: 20000,
            base_secondary_port: 10500,
            consensus_node_count: 7,
            min_transaction_nodes: 2,
            max_transaction_nodes: 20,
            min_transactions: 1,
            max_transactions: 500,
            node_boot_grace_secs: 30,
            node_startup_timeout_secs: 120,
            readiness_backoff: Backoff::default(),
            request_timeout_secs: 30,
            signing_timeout_secs: 15 * 60,
            shutdown_timeout_secs: 2,
            restart_attempts: 3,
            restart_spacing_secs: 5,
            identity_password: "mypassword".to_string(),
            consensus_key_password: "mypassword".to_string(),
            funding_units: 100,
            funding_attempts: 2,
            funding_balance_polls: 10,
            funding_poll_interval_secs: 5,
            registration_settle_ms: 2000,
            rebroadcast_spacing_ms: 100,
            round_settle_ms: 500,
            balance_floor: 1.0,
            max_transfer_amount: 10,
            rng_seed: None,
            monitor: MonitorConfig::default(),
        }
    }
}

impl SimulatorConfig {
    /// Load overrides from a JSON file on top of the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consensus_node_count == 0 {
            return Err(ConfigError::Invalid(
                "consensus_node_count must be at least 1".into(),
            ));
        }
        if self.min_transaction_nodes < 2 {
            return Err(ConfigError::Invalid(
                "min_transaction_nodes must be at least 2".into(),
            ));
        }
        if self.min_transaction_nodes > self.max_transaction_nodes {
            return Err(ConfigError::Invalid(format!(
                "transaction node bounds inverted: {} > {}",
                self.min_transaction_nodes, self.max_transaction_nodes
            )));
        }
        if self.min_transactions == 0 || self.min_transactions > self.max_transactions {
            return Err(ConfigError::Invalid(format!(
                "transaction bounds invalid: {}..={}",
                self.min_transactions, self.max_transactions
            )));
        }
        if self.readiness_backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "readiness_backoff.multiplier must be >= 1.0".into(),
            ));
        }
        if self.max_transfer_amount == 0 {
            return Err(ConfigError::Invalid(
                "max_transfer_amount must be positive".into(),
            ));
        }
        let highest = self.consensus_node_count + self.max_transaction_nodes;
        if usize::from(self.base_server_port) + highest > usize::from(u16::MAX)
            || usize::from(self.base_secondary_port) + highest > usize::from(u16::MAX)
        {
            return Err(ConfigError::Invalid(
                "port range exceeds 65535 for the maximum fleet size".into(),
            ));
        }
        Ok(())
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join("node_metadata.json")
    }

    pub fn nodes_dir(&self) -> PathBuf {
        self.data_dir.join("nodes")
    }

    pub fn node_binary(&self) -> PathBuf {
        self.node_binary
            .clone()
            .unwrap_or_else(|| self.data_dir.join("bin").join("node"))
    }

    pub fn node_boot_grace(&self) -> Duration {
        Duration::from_secs(self.node_boot_grace_secs)
    }

    pub fn node_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.node_startup_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn signing_timeout(&self) -> Duration {
        Duration::from_secs(self.signing_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn restart_spacing(&self) -> Duration {
        Duration::from_secs(self.restart_spacing_secs)
    }

    pub fn funding_poll_interval(&self) -> Duration {
        Duration::from_secs(self.funding_poll_interval_secs)
    }

    pub fn registration_settle(&self) -> Duration {
        Duration::from_millis(self.registration_settle_ms)
    }

    pub fn rebroadcast_spacing(&self) -> Duration {
        Duration::from_millis(self.rebroadcast_spacing_ms)
    }

    pub fn round_settle(&self) -> Duration {
        Duration::from_millis(self.round_settle_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.interval_secs.max(1))
    }

    /// Port pair for the node at `index`.
    pub fn ports_for(&self, index: usize) -> (u16, u16) {
        // validate() bounds index + base below u16::MAX for any admitted fleet size
        let offset = index as u16;
        (
            self.base_server_port.saturating_add(offset),
            self.base_secondary_port.saturating_add(offset),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SimulatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ports_for(0), (20000, 10500));
        assert_eq!(config.ports_for(8), (20008, 10508));
        assert_eq!(
            config.metadata_path(),
            PathBuf::from("./fleet-data/node_metadata.json")
        );
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: SimulatorConfig =
            serde_json::from_str(r#"{"consensus_node_count": 4, "monitor": {"enabled": false}}"#)
                .unwrap();
        assert_eq!(config.consensus_node_count, 4);
        assert!(!config.monitor.enabled);
        assert_eq!(config.monitor.refill_units, 100);
        assert_eq!(config.max_transactions, 500);
        assert!(config.node_support_files.is_empty());
    }

    #[test]
    fn inverted_bounds_rejected() {
        let config = SimulatorConfig {
            min_transaction_nodes: 10,
            max_transaction_nodes: 4,
            ..SimulatorConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.json");
        std::fs::write(
            &path,
            r#"{"round_settle_ms": 10, "rng_seed": 7, "node_support_files": ["keys/swarm.key"]}"#,
        )
        .unwrap();
        let config = SimulatorConfig::from_file(&path).unwrap();
        assert_eq!(config.round_settle(), Duration::from_millis(10));
        assert_eq!(config.rng_seed, Some(7));
        assert_eq!(config.node_support_files, vec![PathBuf::from("keys/swarm.key")]);
    }
}
