use crate::networking::circuit::CircuitOptions;
use crate::networking::packets::RegionHandshake;
use crate::networking::scheduler::SchedulerOptions;
use anyhow::Context;
use config::{Config, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

const CONFIG_FILE: &str = "transport.toml";

/// Prefix for environment overrides, e.g. `SIM_NETWORK__BIND_ADDRESS`
const ENV_PREFIX: &str = "SIM";

// =============================================================================
// Transport Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub bind_address: SocketAddr,
    /// Concurrent receives on the socket
    pub receivers: usize,
    /// Pooled buffers for object-lane packets
    pub pool_capacity: usize,
    pub pool_buffer_size: usize,
    pub pool_wait_ms: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 9000)),
            receivers: 5,
            pool_capacity: 256,
            pool_buffer_size: 1500,
            pool_wait_ms: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    pub congestion_cap: usize,
    pub datagram_budget: usize,
    pub resend_timeout_ms: u64,
    pub max_resends: u32,
    pub ping_interval_ms: u64,
    pub receive_timeout_secs: u64,
    pub logout_timeout_secs: u64,
    pub duplicate_window: usize,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        let options = CircuitOptions::default();
        Self {
            congestion_cap: options.congestion_cap,
            datagram_budget: options.datagram_budget,
            resend_timeout_ms: options.resend_timeout.as_millis() as u64,
            max_resends: options.max_resends,
            ping_interval_ms: options.ping_interval.as_millis() as u64,
            receive_timeout_secs: options.receive_timeout.as_secs(),
            logout_timeout_secs: options.logout_timeout.as_secs(),
            duplicate_window: options.duplicate_window,
        }
    }
}

impl CircuitSettings {
    pub fn options(&self) -> CircuitOptions {
        CircuitOptions {
            congestion_cap: self.congestion_cap,
            datagram_budget: self.datagram_budget,
            resend_timeout: Duration::from_millis(self.resend_timeout_ms),
            max_resends: self.max_resends,
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            receive_timeout: Duration::from_secs(self.receive_timeout_secs),
            logout_timeout: Duration::from_secs(self.logout_timeout_secs),
            duplicate_window: self.duplicate_window,
            ..CircuitOptions::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub mtu_budget: usize,
    pub kill_batch: usize,
    pub drain_interval_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let options = SchedulerOptions::default();
        Self {
            mtu_budget: options.mtu_budget,
            kill_batch: options.kill_batch,
            drain_interval_ms: options.drain_interval.as_millis() as u64,
        }
    }
}

impl SchedulerSettings {
    /// Back-pressure follows the circuit's congestion cap
    pub fn options(&self, congestion_cap: usize) -> SchedulerOptions {
        SchedulerOptions {
            mtu_budget: self.mtu_budget,
            kill_batch: self.kill_batch,
            congestion_cap,
            drain_interval: Duration::from_millis(self.drain_interval_ms),
        }
    }
}

/// Region description sent in the handshake response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionSettings {
    pub name: String,
    pub region_id: Uuid,
    pub owner_id: Uuid,
    pub region_flags: u32,
    pub sim_access: u8,
    pub water_height: f32,
    pub billable_factor: f32,
    pub product_sku: String,
    pub product_name: String,
}

impl Default for RegionSettings {
    fn default() -> Self {
        Self {
            name: "Sandbox".to_string(),
            region_id: Uuid::nil(),
            owner_id: Uuid::nil(),
            region_flags: 0,
            sim_access: 13, // PG
            water_height: 20.0,
            billable_factor: 1.0,
            product_sku: String::new(),
            product_name: "Full Region".to_string(),
        }
    }
}

impl RegionSettings {
    pub fn handshake(&self, agent_id: Uuid) -> RegionHandshake {
        RegionHandshake {
            region_flags: self.region_flags,
            sim_access: self.sim_access,
            sim_name: self.name.clone(),
            sim_owner: self.owner_id,
            is_estate_manager: agent_id == self.owner_id,
            water_height: self.water_height,
            billable_factor: self.billable_factor,
            cache_id: Uuid::new_v4(),
            region_id: self.region_id,
            product_sku: self.product_sku.clone(),
            product_name: self.product_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub network: NetworkSettings,
    pub circuit: CircuitSettings,
    pub scheduler: SchedulerSettings,
    pub region: RegionSettings,
}

impl TransportSettings {
    pub fn scheduler_options(&self) -> SchedulerOptions {
        self.scheduler.options(self.circuit.congestion_cap)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "sim", "sim-circuits").map(|proj| proj.config_dir().join(CONFIG_FILE))
}

/// Defaults, then the TOML file if present, then `SIM_*` environment variables
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<TransportSettings> {
    let defaults = toml::to_string(&TransportSettings::default()).context("serialising default settings")?;
    let mut builder = Config::builder().add_source(File::from_str(&defaults, FileFormat::Toml));

    let path = path.map(Path::to_path_buf).or_else(default_config_path);
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
    }

    builder
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true))
        .build()
        .context("reading settings")?
        .try_deserialize()
        .context("invalid settings")
}

pub fn save_settings(settings: &TransportSettings, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let toml = toml::to_string_pretty(settings)?;
    fs::write(path, toml).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_constants() {
        let settings = TransportSettings::default();
        let options = settings.circuit.options();
        assert_eq!(options.congestion_cap, 100);
        assert_eq!(options.datagram_budget, 1500);
        assert_eq!(options.receive_timeout, Duration::from_secs(60));
        assert_eq!(options.logout_timeout, Duration::from_secs(10));
        let scheduler = settings.scheduler_options();
        assert_eq!(scheduler.mtu_budget, 1400);
        assert_eq!(scheduler.kill_batch, 250);
        assert_eq!(scheduler.congestion_cap, 100);
        assert_eq!(settings.network.receivers, 5);
    }

    #[test]
    fn test_save_then_load_file() {
        let dir = std::env::temp_dir().join(format!("sim-circuits-{}", Uuid::new_v4()));
        let path = dir.join(CONFIG_FILE);
        let mut settings = TransportSettings::default();
        settings.network.bind_address = "127.0.0.1:9100".parse().unwrap();
        settings.circuit.max_resends = 5;
        settings.region.name = "Ahern".to_string();
        save_settings(&settings, &path).unwrap();

        let loaded = load_settings(Some(&path)).unwrap();
        assert_eq!(loaded.network.bind_address, settings.network.bind_address);
        assert_eq!(loaded.circuit.max_resends, 5);
        assert_eq!(loaded.region.name, "Ahern");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = std::env::temp_dir().join(format!("sim-circuits-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, "[scheduler]\nmtu_budget = 1200\n").unwrap();

        let loaded = load_settings(Some(&path)).unwrap();
        assert_eq!(loaded.scheduler.mtu_budget, 1200);
        assert_eq!(loaded.scheduler.kill_batch, 250);
        assert_eq!(loaded.circuit, CircuitSettings::default());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_handshake_from_region() {
        let region = RegionSettings {
            owner_id: Uuid::from_u128(9),
            ..RegionSettings::default()
        };
        let handshake = region.handshake(Uuid::from_u128(9));
        assert!(handshake.is_estate_manager);
        assert_eq!(handshake.sim_name, "Sandbox");
        assert!(!region.handshake(Uuid::from_u128(1)).is_estate_manager);
    }
}
