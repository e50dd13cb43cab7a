//! Persistent serial -> (name, context) registry.
//!
//! Names are what users see in file names and settings files; contexts are the
//! small integers the acquisition loop routes frames by. Both stay stable across
//! runs as long as the registry file is kept.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

const CONTEXT_MASK: u32 = 0x00ff_ffff;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub context: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl CameraRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a registry file. A missing or unreadable file yields an empty registry.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Self::new(),
            Err(err) => {
                log::warn!("CameraRegistry: cannot read {}: {}", path.display(), err);
                return Self::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(registry) => registry,
            Err(err) => {
                log::warn!(
                    "CameraRegistry: ignoring invalid registry {}: {}",
                    path.display(),
                    err
                );
                Self::new()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, serial: &str) -> Option<&RegistryEntry> {
        self.entries.get(serial)
    }

    /// Name and context for `serial`, registering it if unseen.
    ///
    /// New cameras are named `cam{index:02}` by registration order.
    pub fn assign(&mut self, serial: &str) -> RegistryEntry {
        if let Some(entry) = self.entries.get(serial) {
            return entry.clone();
        }
        let mut name = format!("cam{:02}", self.entries.len());
        if self.entries.values().any(|e| e.name == name) {
            name.push_str("_2");
        }
        let entry = RegistryEntry {
            context: context_for_name(&name),
            name,
        };
        log::info!(
            "CameraRegistry: registered {} as {} (context {:#08x})",
            serial,
            entry.name,
            entry.context
        );
        self.entries.insert(serial.to_string(), entry.clone());
        entry
    }

    /// Give `serial` a new display name. The context follows the name.
    pub fn rename(&mut self, serial: &str, name: &str) -> RegistryEntry {
        let mut name = name.to_string();
        if self
            .entries
            .iter()
            .any(|(s, e)| s != serial && e.name == name)
        {
            name.push_str("_2");
        }
        let entry = RegistryEntry {
            context: context_for_name(&name),
            name,
        };
        self.entries.insert(serial.to_string(), entry.clone());
        entry
    }
}

/// Stable 24-bit context derived from a camera name.
pub fn context_for_name(name: &str) -> u32 {
    let digest = Sha256::digest(name.as_bytes());
    u32::from_be_bytes([0, digest[0], digest[1], digest[2]]) & CONTEXT_MASK
}
