//! Collaborator interfaces a run depends on.
//!
//! The engine never talks to Apple or to a signing backend itself. It asks
//! three collaborators:
//!
//! - [`ComponentInspector`] lists the components of a bundle
//! - [`RegistrationService`] confirms identifiers exist on the developer account
//! - [`SigningService`] signs each component once it has been patched
//!
//! The implementations here work offline: [`AssumeRegistered`] confirms
//! everything, [`StaticRegistration`] confirms a fixed list, [`PlanOnlySigner`]
//! records nothing and [`ExternalSigner`] shells out to a signing program.

use crate::bundle::AppComponent;
use crate::mapping::Entitlements;
use crate::{Error, Result};
use log::{debug, info};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Identifier of an object on the remote developer account.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteId(pub String);

impl std::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Discovers the components of an app bundle.
pub trait ComponentInspector {
    fn list_components(&self, app_root: &Path) -> Result<Vec<AppComponent>>;
    fn read_entitlements(&self, executable: &Path) -> Result<Entitlements>;
    fn main_bundle_id(&self, app_root: &Path) -> Result<String>;
    fn team_ids(&self, app_root: &Path) -> Result<Vec<String>>;

    /// Team IDs of `components`, already listed from `app_root`.
    fn team_ids_of(&self, app_root: &Path, _components: &[AppComponent]) -> Result<Vec<String>> {
        self.team_ids(app_root)
    }
}

/// Confirms identifiers on the developer account.
///
/// Each `register_*` call returns `Ok(Some(_))` when the identifier now
/// exists remotely and `Ok(None)` when it could not be confirmed. `Err` is
/// reserved for failures that should stop the run.
pub trait RegistrationService {
    fn register_bundle_id(&mut self, team_id: &str, bundle_id: &str) -> Result<Option<RemoteId>>;

    fn register_app_group(&mut self, team_id: &str, group: &str) -> Result<Option<RemoteId>>;

    fn register_icloud_container(&mut self, team_id: &str, container: &str) -> Result<Option<RemoteId>>;

    /// Enable capabilities on a registered bundle ID.
    fn enable_capabilities(&mut self, _bundle: &RemoteId, _capabilities: &BTreeSet<String>) -> Result<()> {
        Ok(())
    }

    /// Provisioning profile for a registered bundle ID, embedded as
    /// `embedded.mobileprovision`.
    fn provisioning_profile(&mut self, _team_id: &str, _bundle_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Signs one component.
pub trait SigningService {
    fn sign(&mut self, binary: &Path, entitlements: Option<&Path>) -> Result<()>;
}

/// Treats every identifier as already registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeRegistered;

impl RegistrationService for AssumeRegistered {
    fn register_bundle_id(&mut self, _team_id: &str, bundle_id: &str) -> Result<Option<RemoteId>> {
        Ok(Some(RemoteId(bundle_id.to_string())))
    }

    fn register_app_group(&mut self, _team_id: &str, group: &str) -> Result<Option<RemoteId>> {
        Ok(Some(RemoteId(group.to_string())))
    }

    fn register_icloud_container(&mut self, _team_id: &str, container: &str) -> Result<Option<RemoteId>> {
        Ok(Some(RemoteId(container.to_string())))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RegisteredFile {
    List(Vec<String>),
    Object {
        identifiers: Vec<String>,
        #[serde(default)]
        profiles: Option<PathBuf>,
    },
}

/// Confirms only identifiers from a fixed list.
///
/// Profiles, when a directory is configured, are read from
/// `<dir>/<bundle id>.mobileprovision`.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistration {
    identifiers: BTreeSet<String>,
    profiles_dir: Option<PathBuf>,
}

impl StaticRegistration {
    pub fn new<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identifiers: identifiers.into_iter().map(Into::into).collect(),
            profiles_dir: None,
        }
    }

    /// Load from JSON: either an array of identifiers or
    /// `{"identifiers": [...], "profiles": "<dir>"}`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let parsed: RegisteredFile = serde_json::from_slice(&fs::read(path)?)?;
        let registration = match parsed {
            RegisteredFile::List(ids) => Self::new(ids),
            RegisteredFile::Object { identifiers, profiles } => {
                let base = path.parent().unwrap_or_else(|| Path::new("."));
                Self::new(identifiers).profiles_dir(profiles.map(|p| base.join(p)))
            }
        };
        debug!(
            "loaded {} registered identifiers from {}",
            registration.identifiers.len(),
            path.display()
        );
        Ok(registration)
    }

    pub fn profiles_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.profiles_dir = dir;
        self
    }

    fn confirm(&self, id: &str) -> Option<RemoteId> {
        self.identifiers
            .contains(id)
            .then(|| RemoteId(id.to_string()))
    }
}

impl RegistrationService for StaticRegistration {
    fn register_bundle_id(&mut self, _team_id: &str, bundle_id: &str) -> Result<Option<RemoteId>> {
        Ok(self.confirm(bundle_id))
    }

    fn register_app_group(&mut self, _team_id: &str, group: &str) -> Result<Option<RemoteId>> {
        Ok(self.confirm(group))
    }

    fn register_icloud_container(&mut self, _team_id: &str, container: &str) -> Result<Option<RemoteId>> {
        Ok(self.confirm(container))
    }

    fn provisioning_profile(&mut self, _team_id: &str, bundle_id: &str) -> Result<Option<Vec<u8>>> {
        let Some(dir) = &self.profiles_dir else {
            return Ok(None);
        };
        let path = dir.join(format!("{bundle_id}.mobileprovision"));
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }
}

/// Leaves binaries unsigned; the plan still lists what would be signed.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOnlySigner;

impl SigningService for PlanOnlySigner {
    fn sign(&mut self, binary: &Path, _entitlements: Option<&Path>) -> Result<()> {
        debug!("not signing {} (plan only)", binary.display());
        Ok(())
    }
}

/// Runs an external program per component.
///
/// The template is split on whitespace. `{binary}` is replaced with the
/// binary path and `{entitlements}` with the entitlements plist path; an
/// argument containing `{entitlements}` is dropped for components without
/// entitlements.
#[derive(Debug, Clone)]
pub struct ExternalSigner {
    template: Vec<String>,
}

impl ExternalSigner {
    pub fn new(template: &str) -> Result<Self> {
        let template: Vec<String> = template.split_whitespace().map(str::to_string).collect();
        if template.is_empty() {
            return Err(Error::Config("empty sign command".into()));
        }
        if !template.iter().any(|arg| arg.contains("{binary}")) {
            return Err(Error::Config("sign command must contain {binary}".into()));
        }
        Ok(Self { template })
    }

    fn arguments(&self, binary: &Path, entitlements: Option<&Path>) -> Vec<String> {
        let binary = binary.to_string_lossy();
        self.template
            .iter()
            .filter_map(|arg| {
                let arg = arg.replace("{binary}", &binary);
                if arg.contains("{entitlements}") {
                    let path = entitlements?.to_string_lossy();
                    return Some(arg.replace("{entitlements}", &path));
                }
                Some(arg)
            })
            .collect()
    }
}

impl SigningService for ExternalSigner {
    fn sign(&mut self, binary: &Path, entitlements: Option<&Path>) -> Result<()> {
        let args = self.arguments(binary, entitlements);
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| Error::Config("empty sign command".into()))?;

        info!("signing {}", binary.display());
        let output = Command::new(program).args(rest).output()?;
        if !output.status.success() {
            return Err(Error::Signing(format!(
                "{program} exited with {} for {}: {}",
                output.status,
                binary.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
