//! Fleet registry
//!
//! The configured set of managed machines. Seeded with a built-in
//! fleet, overridden by the fleet file when present, and rewritten
//! wholesale on every mutation. Entries are updated or disabled, never
//! deleted.

use fleetdeck_common::{Error, Geometry, Result, ScreenPosition};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

/// One managed machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineEntry {
    /// Display label
    pub callsign: String,
    /// Network address
    pub address: String,
    /// `user:password` used by session clients
    pub credentials: String,
    /// Preferred session geometry
    pub geometry: Geometry,
    /// Preferred workspace index
    pub workspace: i64,
    /// Preferred slot on the owning monitor
    pub position: ScreenPosition,
    /// Place in the overlay workspace instead of a numbered one
    pub scratchpad: bool,
    pub enabled: bool,
}

/// Partial update applied to a machine entry
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MachinePatch {
    pub callsign: Option<String>,
    pub address: Option<String>,
    pub credentials: Option<String>,
    pub geometry: Option<Geometry>,
    pub workspace: Option<i64>,
    pub position: Option<ScreenPosition>,
    pub scratchpad: Option<bool>,
    pub enabled: Option<bool>,
}

/// On-disk shape of the fleet file
#[derive(Debug, Default, Serialize, Deserialize)]
struct FleetFile {
    machines: BTreeMap<String, MachineEntry>,
}

/// Mapping of machine id to connection parameters.
pub struct FleetRegistry {
    path: PathBuf,
    machines: Mutex<BTreeMap<String, MachineEntry>>,
}

impl FleetRegistry {
    /// Load the registry from `path`, falling back to the built-in
    /// fleet when the file is missing or unreadable.
    pub fn load(path: PathBuf) -> Self {
        let machines = match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<FleetFile>(&content) {
                Ok(file) => {
                    info!("Loaded {} machines from {}", file.machines.len(), path.display());
                    file.machines
                }
                Err(e) => {
                    warn!("Fleet file {} unreadable ({}), using defaults", path.display(), e);
                    default_fleet()
                }
            },
            Err(_) => default_fleet(),
        };

        Self {
            path,
            machines: Mutex::new(machines),
        }
    }

    /// Snapshot of all machines
    pub fn list(&self) -> BTreeMap<String, MachineEntry> {
        self.machines.lock().clone()
    }

    pub fn get(&self, id: &str) -> Result<MachineEntry> {
        self.machines
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("machine", id))
    }

    /// Merge a partial update into one entry and persist the whole file.
    pub fn update(&self, id: &str, patch: MachinePatch) -> Result<MachineEntry> {
        let updated = {
            let mut machines = self.machines.lock();
            let entry = machines
                .get_mut(id)
                .ok_or_else(|| Error::not_found("machine", id))?;

            if let Some(v) = patch.callsign {
                entry.callsign = v;
            }
            if let Some(v) = patch.address {
                entry.address = v;
            }
            if let Some(v) = patch.credentials {
                entry.credentials = v;
            }
            if let Some(v) = patch.geometry {
                entry.geometry = v;
            }
            if let Some(v) = patch.workspace {
                entry.workspace = v;
            }
            if let Some(v) = patch.position {
                entry.position = v;
            }
            if let Some(v) = patch.scratchpad {
                entry.scratchpad = v;
            }
            if let Some(v) = patch.enabled {
                entry.enabled = v;
            }
            entry.clone()
        };

        self.save()?;
        Ok(updated)
    }

    /// Add or replace a full entry and persist.
    pub fn upsert(&self, id: String, entry: MachineEntry) -> Result<()> {
        self.machines.lock().insert(id, entry);
        self.save()
    }

    /// Rewrite the fleet file wholesale.
    fn save(&self) -> Result<()> {
        let file = FleetFile {
            machines: self.machines.lock().clone(),
        };
        let content = toml::to_string_pretty(&file)
            .map_err(|e| Error::Internal(format!("fleet serialize: {}", e)))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

/// The built-in home-lab fleet, used until a fleet file is written.
fn default_fleet() -> BTreeMap<String, MachineEntry> {
    let entry = |callsign: &str, last: u8, geom: (u32, u32), ws, pos, scratch| MachineEntry {
        callsign: callsign.to_string(),
        address: format!("192.168.1.{}", last),
        credentials: "deck:changeme".to_string(),
        geometry: Geometry::new(geom.0, geom.1),
        workspace: ws,
        position: pos,
        scratchpad: scratch,
        enabled: true,
    };

    BTreeMap::from([
        ("vm20".to_string(), entry("ALPHA", 20, (957, 1042), 4, ScreenPosition::Left, false)),
        ("vm21".to_string(), entry("BRAVO", 21, (1717, 1402), 2, ScreenPosition::Left, true)),
        ("vm23".to_string(), entry("CHARLIE", 23, (1915, 1042), 1, ScreenPosition::Center, false)),
        ("vm24".to_string(), entry("DELTA", 24, (957, 1042), 4, ScreenPosition::Right, false)),
        ("vm25".to_string(), entry("ECHO", 25, (1717, 1402), 2, ScreenPosition::Right, true)),
        ("vm26".to_string(), entry("FOXTROT", 26, (1915, 1042), 3, ScreenPosition::Center, false)),
    ])
}
