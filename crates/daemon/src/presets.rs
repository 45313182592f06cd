//! Resolution presets
//!
//! Named width/height pairs for remote-desktop sessions, persisted to
//! a JSON file keyed by a normalized name. The file is rewritten
//! wholesale on every mutation.

use fleetdeck_common::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

/// A named, reusable session resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionPreset {
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub description: String,
}

/// User-mutable set of resolution presets.
pub struct PresetStore {
    path: PathBuf,
    presets: Mutex<BTreeMap<String, ResolutionPreset>>,
}

impl PresetStore {
    /// Load the store, seeding defaults on first run.
    pub fn load(path: PathBuf) -> Self {
        let presets = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, ResolutionPreset>>(&content)
            {
                Ok(map) => {
                    info!("Loaded {} resolution presets", map.len());
                    map
                }
                Err(e) => {
                    warn!("Preset file {} unreadable ({}), reseeding", path.display(), e);
                    default_presets()
                }
            },
            Err(_) => default_presets(),
        };

        let store = Self {
            path,
            presets: Mutex::new(presets),
        };
        // Make sure first-run defaults hit the disk
        if !store.path.exists() {
            if let Err(e) = store.save() {
                warn!("Failed to seed preset file: {}", e);
            }
        }
        store
    }

    pub fn all(&self) -> BTreeMap<String, ResolutionPreset> {
        self.presets.lock().clone()
    }

    pub fn get(&self, key: &str) -> Result<ResolutionPreset> {
        self.presets
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found("preset", key))
    }

    /// Add a preset under the normalized form of its name; returns the key.
    pub fn add(&self, name: &str, width: u32, height: u32, description: &str) -> Result<String> {
        if name.trim().is_empty() || width == 0 || height == 0 {
            return Err(Error::InvalidInput(
                "preset needs a name and nonzero dimensions".to_string(),
            ));
        }
        let key = normalize_key(name);
        self.presets.lock().insert(
            key.clone(),
            ResolutionPreset {
                name: name.to_string(),
                width,
                height,
                description: description.to_string(),
            },
        );
        self.save()?;
        info!("Added resolution preset {} ({}x{})", key, width, height);
        Ok(key)
    }

    /// Replace an existing preset by key.
    pub fn edit(&self, key: &str, name: &str, width: u32, height: u32, description: &str) -> Result<()> {
        let mut presets = self.presets.lock();
        if !presets.contains_key(key) {
            return Err(Error::not_found("preset", key));
        }
        presets.insert(
            key.to_string(),
            ResolutionPreset {
                name: name.to_string(),
                width,
                height,
                description: description.to_string(),
            },
        );
        drop(presets);
        self.save()
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        if self.presets.lock().remove(key).is_none() {
            return Err(Error::not_found("preset", key));
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&*self.presets.lock())?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

/// Lowercase, spaces and dashes collapsed to underscores.
pub fn normalize_key(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .replace([' ', '-'], "_")
}

fn default_presets() -> BTreeMap<String, ResolutionPreset> {
    let preset = |name: &str, w, h, desc: &str| ResolutionPreset {
        name: name.to_string(),
        width: w,
        height: h,
        description: desc.to_string(),
    };

    BTreeMap::from([
        ("full_hd".to_string(), preset("Full HD", 1920, 1080, "Standard 1080p resolution")),
        ("hd".to_string(), preset("HD", 1280, 720, "Standard 720p resolution")),
        ("4k".to_string(), preset("4K", 3840, 2160, "4K Ultra HD resolution")),
        ("wide".to_string(), preset("Wide", 1920, 1200, "Wide screen resolution")),
        ("compact".to_string(), preset("Compact", 1024, 768, "Compact resolution for smaller screens")),
        ("custom_wide".to_string(), preset("Custom Wide", 1918, 1040, "Custom wide format resolution")),
        ("tall_screen".to_string(), preset("Tall Screen", 1720, 1400, "Tall aspect ratio screen")),
        ("ultrawide".to_string(), preset("Ultrawide", 3438, 1400, "Ultrawide monitor resolution")),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, PresetStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PresetStore::load(dir.path().join("presets.json"));
        (dir, store)
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("Full HD"), "full_hd");
        assert_eq!(normalize_key("custom-wide"), "custom_wide");
        assert_eq!(normalize_key("  4K "), "4k");
    }

    #[test]
    fn test_defaults_seeded() {
        let (_dir, store) = temp_store();
        assert_eq!(store.get("full_hd").unwrap().width, 1920);
        assert_eq!(store.all().len(), 8);
    }

    #[test]
    fn test_add_fetch_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.json");

        let store = PresetStore::load(path.clone());
        let key = store.add("Lab Bench", 2100, 1300, "left bench monitor").unwrap();
        assert_eq!(key, "lab_bench");

        // Survives a reload from disk
        let reloaded = PresetStore::load(path);
        let p = reloaded.get("lab_bench").unwrap();
        assert_eq!((p.name.as_str(), p.width, p.height), ("Lab Bench", 2100, 1300));
        assert_eq!(p.description, "left bench monitor");

        reloaded.delete("lab_bench").unwrap();
        assert!(!reloaded.all().contains_key("lab_bench"));
        assert!(matches!(
            reloaded.get("lab_bench").unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn test_delete_unknown_preset() {
        let (_dir, store) = temp_store();
        assert!(matches!(
            store.delete("nope").unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn test_rejects_empty_input() {
        let (_dir, store) = temp_store();
        assert!(matches!(
            store.add("", 100, 100, "").unwrap_err(),
            Error::InvalidInput(_)
        ));
        assert!(matches!(
            store.add("zero", 0, 100, "").unwrap_err(),
            Error::InvalidInput(_)
        ));
    }
}
