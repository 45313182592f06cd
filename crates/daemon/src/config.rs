//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Store directory path (fleet file, preset file)
    pub store_path: PathBuf,

    /// HTTP listen port
    pub listen_port: u16,

    /// Probe configuration
    pub probe: ProbeConfig,

    /// Window manager configuration
    pub wm: WmConfig,

    /// Session configuration
    pub session: SessionConfig,

    /// Fleet configuration
    pub fleet: FleetConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: fleetdeck_common::default_store_path(),
            listen_port: 5000,
            probe: ProbeConfig::default(),
            wm: WmConfig::default(),
            session: SessionConfig::default(),
            fleet: FleetConfig::default(),
        }
    }
}

/// Probe timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// ICMP echo deadline in seconds
    pub ping_timeout_secs: u64,

    /// TCP connect deadline in seconds
    pub port_timeout_secs: u64,

    /// Network base for discovery sweeps, e.g. "192.168.1"
    pub network_base: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ping_timeout_secs: 2,
            port_timeout_secs: 1,
            network_base: "192.168.1".to_string(),
        }
    }
}

/// Window manager bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WmConfig {
    /// Path to the hyprctl binary
    pub hyprctl_path: String,

    /// Pixels reserved at the top of each monitor for the status bar
    pub top_margin: u32,

    /// Gap between window edges and monitor edges
    pub gap: u32,

    /// Name of the overlay/scratchpad workspace
    pub overlay_workspace: String,
}

impl Default for WmConfig {
    fn default() -> Self {
        Self {
            hyprctl_path: "hyprctl".to_string(),
            top_margin: 40,
            gap: 8,
            overlay_workspace: "special:deck".to_string(),
        }
    }
}

/// Session lifecycle timings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds to wait before checking whether a spawned client exited
    pub settle_secs: u64,

    /// Seconds to wait for graceful termination before SIGKILL
    pub kill_grace_secs: u64,

    /// Reaper sweep interval in seconds
    pub reap_interval_secs: u64,

    /// systemd user unit prefix for per-machine services
    pub unit_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_secs: 2,
            kill_grace_secs: 5,
            reap_interval_secs: 30,
            unit_prefix: "fleetdeck-".to_string(),
        }
    }
}

/// Fleet-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Script run for fleet-wide up/down commands
    pub script_path: String,

    /// Default account used when a machine entry has no credentials
    pub username: String,
    pub password: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            script_path: "./fleetdeck".to_string(),
            username: "deck".to_string(),
            password: "changeme".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the fleet file path
    pub fn fleet_path(&self) -> PathBuf {
        self.store_path.join("fleet.toml")
    }

    /// Get the preset store path
    pub fn presets_path(&self) -> PathBuf {
        self.store_path.join("presets.json")
    }
}
