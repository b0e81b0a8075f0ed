//! Identifier remapping manifest.
//!
//! A JSON record of what a run changed, written into the bundle so that
//! runtime helpers can translate identifiers back:
//!
//! ```json
//! {
//!   "team_ids": { "ABCDE12345": "ZZZZZ99999" },
//!   "main_bundle_id": { "original": "com.example.app", "replacement": "x3k.q0mzle0.ab9" },
//!   "identifiers": [
//!     { "original": "group.com.example", "replacement": "group.s8e.pkvam1q", "kind": "app-group", "registered": true }
//!   ]
//! }
//! ```

use crate::mapping::{IdentifierKind, MappingRegistry};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Default file name inside the app bundle.
pub const MANIFEST_FILE_NAME: &str = "zremap.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleIdPair {
    pub original: String,
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub original: String,
    pub replacement: String,
    pub kind: IdentifierKind,
    /// Confirmed by the registration service, hence patched into binaries.
    pub registered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapManifest {
    pub team_ids: BTreeMap<String, String>,
    pub main_bundle_id: BundleIdPair,
    pub identifiers: Vec<ManifestEntry>,
}

impl RemapManifest {
    pub fn from_registry(registry: &MappingRegistry) -> Self {
        let team_ids = registry
            .original_team_ids()
            .iter()
            .map(|team| (team.clone(), registry.new_team_id().to_string()))
            .collect();

        let identifiers = registry
            .mappings()
            .map(|m| ManifestEntry {
                original: m.original.clone(),
                replacement: m.replacement.clone(),
                kind: m.kind,
                registered: registry.is_registered(&m.original),
            })
            .collect();

        Self {
            team_ids,
            main_bundle_id: BundleIdPair {
                original: registry.original_main_bundle_id().to_string(),
                replacement: registry.new_main_bundle_id().to_string(),
            },
            identifiers,
        }
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    /// Replacement recorded for `original`.
    pub fn replacement_for(&self, original: &str) -> Option<&str> {
        if let Some(team) = self.team_ids.get(original) {
            return Some(team);
        }
        self.identifiers
            .iter()
            .find(|e| e.original == original)
            .map(|e| e.replacement.as_str())
    }
}
