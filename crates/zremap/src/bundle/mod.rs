//! App bundle discovery.
//!
//! This module provides functionality to:
//! - Walk an `.app` directory and list every signable component
//! - Read each component's identity (bundle ID, executable, entitlements)
//! - Collect the team IDs the original signer used
//!
//! # Component kinds
//!
//! | Kind | Found at | Primary |
//! |------|----------|---------|
//! | Main app | bundle root | yes |
//! | Nested app | `**/*.app` | yes |
//! | Extension | `**/*.appex` | yes |
//! | Framework | `**/*.framework` | no |
//! | Dylib | `**/*.dylib` | no |
//! | Plug-in bundle | `**/PlugIns/*.bundle` | no |
//!
//! Primary components get their bundle ID registered and their
//! entitlements rewritten; secondary components are only literal-patched.
//!
//! # Examples
//!
//! ```no_run
//! use zremap::bundle::BundleInspector;
//! use zremap::services::ComponentInspector;
//!
//! let inspector = BundleInspector::new();
//! for component in inspector.list_components("Payload/App.app".as_ref())? {
//!     println!("{} (depth {})", component.bundle_id, component.depth);
//! }
//! # Ok::<(), zremap::Error>(())
//! ```

use crate::codesign::embedded_entitlements;
use crate::macho::{is_macho, MachOFile};
use crate::mapping::entitlements::{APPLICATION_IDENTIFIER, TEAM_IDENTIFIER};
use crate::mapping::Entitlements;
use crate::services::ComponentInspector;
use crate::{Error, Result};
use log::{debug, warn};
use plist::{Dictionary, Value};
use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// What a component is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    MainApp,
    NestedApp,
    Extension,
    Framework,
    Dylib,
    PluginBundle,
}

impl ComponentKind {
    /// Whether components of this kind get full identity remapping.
    pub fn is_primary(self) -> bool {
        matches!(
            self,
            ComponentKind::MainApp | ComponentKind::NestedApp | ComponentKind::Extension
        )
    }
}

/// One signable unit of an app bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct AppComponent {
    /// Bundle directory (or dylib file) relative to the app root; empty for the main app.
    pub path: PathBuf,
    pub bundle_id: String,
    /// Executable relative to the app root.
    pub executable: PathBuf,
    pub entitlements: Entitlements,
    pub kind: ComponentKind,
    /// Number of bundle directories on the path; a loose dylib sits one
    /// level below its enclosing bundle.
    pub depth: usize,
}

impl AppComponent {
    pub fn is_primary(&self) -> bool {
        self.kind.is_primary()
    }

    /// Info.plist of a primary component.
    pub fn info_plist_path(&self, app_root: &Path) -> Option<PathBuf> {
        self.is_primary()
            .then(|| app_root.join(&self.path).join("Info.plist"))
    }
}

/// Filesystem-backed [`ComponentInspector`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BundleInspector;

impl BundleInspector {
    pub fn new() -> Self {
        Self
    }

    fn component_at(&self, app_root: &Path, path: &Path, kind: ComponentKind) -> Result<Option<AppComponent>> {
        let relative = path.strip_prefix(app_root).unwrap_or(path).to_path_buf();

        let (bundle_id, executable) = match kind {
            ComponentKind::Dylib => (file_stem(path), path.to_path_buf()),
            _ => {
                let info = read_info_plist(path).ok();
                if kind.is_primary() && info.is_none() {
                    warn!("no readable Info.plist in {}, skipping", path.display());
                    return Ok(None);
                }
                let bundle_id = info
                    .as_ref()
                    .and_then(|d| d.get("CFBundleIdentifier"))
                    .and_then(Value::as_string)
                    .map(str::to_string)
                    .unwrap_or_else(|| file_stem(path));
                let exec_name = info
                    .as_ref()
                    .and_then(|d| d.get("CFBundleExecutable"))
                    .and_then(Value::as_string)
                    .map(str::to_string)
                    .unwrap_or_else(|| file_stem(path));
                (bundle_id, path.join(exec_name))
            }
        };

        if !executable.is_file() {
            warn!("executable not found: {}", executable.display());
            return Ok(None);
        }

        let entitlements = match self.read_entitlements(&executable) {
            Ok(ents) => ents,
            Err(e) => {
                warn!("could not read entitlements of {}: {e}", executable.display());
                Entitlements::new()
            }
        };

        let mut depth = bundle_depth(&relative);
        if kind == ComponentKind::Dylib {
            depth += 1;
        }

        let executable = executable.strip_prefix(app_root).unwrap_or(&executable).to_path_buf();
        debug!("found {:?} {} at {}", kind, bundle_id, relative.display());
        Ok(Some(AppComponent {
            path: relative,
            bundle_id,
            executable,
            entitlements,
            kind,
            depth,
        }))
    }
}

impl ComponentInspector for BundleInspector {
    fn list_components(&self, app_root: &Path) -> Result<Vec<AppComponent>> {
        let mut components = Vec::new();
        if let Some(main) = self.component_at(app_root, app_root, ComponentKind::MainApp)? {
            components.push(main);
        } else {
            return Err(Error::InvalidBundle(format!(
                "{} has no main executable",
                app_root.display()
            )));
        }

        for entry in WalkDir::new(app_root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != "_CodeSignature")
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            let Some(kind) = classify_path(path, entry.file_type().is_dir()) else {
                continue;
            };
            if let Some(component) = self.component_at(app_root, path, kind)? {
                components.push(component);
            }
        }

        Ok(components)
    }

    fn read_entitlements(&self, executable: &Path) -> Result<Entitlements> {
        let macho = MachOFile::open(executable)?;
        match embedded_entitlements(&macho)? {
            Some(xml) => Entitlements::from_bytes(&xml),
            None => Ok(Entitlements::new()),
        }
    }

    fn main_bundle_id(&self, app_root: &Path) -> Result<String> {
        let info = read_info_plist(app_root)?;
        info.get("CFBundleIdentifier")
            .and_then(Value::as_string)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::InvalidBundle(format!(
                    "{} has no CFBundleIdentifier",
                    app_root.join("Info.plist").display()
                ))
            })
    }

    fn team_ids(&self, app_root: &Path) -> Result<Vec<String>> {
        self.team_ids_of(app_root, &self.list_components(app_root)?)
    }

    fn team_ids_of(&self, app_root: &Path, components: &[AppComponent]) -> Result<Vec<String>> {
        let mut team_ids = BTreeSet::new();
        for component in components {
            let info = match component.info_plist_path(app_root) {
                Some(path) => read_info_plist(path.parent().unwrap_or(app_root)).ok(),
                None => None,
            };
            let found = extract_team_ids(&component.entitlements, info.as_ref());
            if !found.is_empty() {
                debug!("team IDs in {}: {:?}", component.bundle_id, found);
            }
            team_ids.extend(found);
        }
        Ok(team_ids.into_iter().collect())
    }
}

/// Whether `id` looks like an Apple team ID (ten ASCII alphanumerics).
pub fn is_valid_team_id(id: &str) -> bool {
    id.len() == 10 && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Team IDs named by a component's entitlements and Info.plist.
pub fn extract_team_ids(entitlements: &Entitlements, info: Option<&Dictionary>) -> BTreeSet<String> {
    let mut candidates: Vec<&str> = Vec::new();

    if let Some(team) = entitlements.get_str(TEAM_IDENTIFIER) {
        candidates.push(team);
    }
    if let Some(prefix) = info
        .and_then(|d| d.get("AppIdentifierPrefix"))
        .and_then(Value::as_string)
    {
        candidates.push(prefix.trim_end_matches('.'));
    }
    if let Some(app_id) = entitlements.get_str(APPLICATION_IDENTIFIER) {
        candidates.extend(app_id.split('.').next());
    }
    for group in entitlements.keychain_access_groups() {
        candidates.extend(group.split('.').next());
    }

    candidates
        .into_iter()
        .filter(|c| is_valid_team_id(c))
        .map(str::to_string)
        .collect()
}

fn classify_path(path: &Path, is_dir: bool) -> Option<ComponentKind> {
    let ext = path.extension()?.to_string_lossy().to_lowercase();
    match (ext.as_str(), is_dir) {
        ("app", true) => Some(ComponentKind::NestedApp),
        ("appex", true) => Some(ComponentKind::Extension),
        ("framework", true) => Some(ComponentKind::Framework),
        ("bundle", true)
            if path.parent().and_then(Path::file_name).map_or(false, |p| p == "PlugIns") =>
        {
            Some(ComponentKind::PluginBundle)
        }
        ("dylib", false) if has_macho_magic(path) => Some(ComponentKind::Dylib),
        _ => None,
    }
}

/// Count bundle directories along a relative path.
fn bundle_depth(relative: &Path) -> usize {
    relative
        .iter()
        .filter(|c| {
            let c = c.to_string_lossy();
            c.ends_with(".app") || c.ends_with(".appex") || c.ends_with(".framework") || c.ends_with(".bundle")
        })
        .count()
}

fn has_macho_magic(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|_| is_macho(&magic))
        .unwrap_or(false)
}

/// Read `<bundle>/Info.plist` as a dictionary.
pub fn read_info_plist(bundle: &Path) -> Result<Dictionary> {
    let path = bundle.join("Info.plist");
    if !path.exists() {
        return Err(Error::InvalidBundle(format!("Info.plist not found in {}", bundle.display())));
    }
    let value: Value = plist::from_file(&path)?;
    value
        .into_dictionary()
        .ok_or_else(|| Error::InvalidBundle(format!("{} is not a dictionary", path.display())))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string())
}
