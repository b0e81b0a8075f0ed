//! ZRemap builder API
//!
//! Provides a builder pattern interface for remapping an app bundle or IPA
//! onto a new developer team.

use crate::bundle::{is_valid_team_id, BundleInspector};
use crate::capabilities::CapabilityPolicy;
use crate::ipa::{create_ipa, extract_ipa, strip_drm_leftovers, validate_ipa, CompressionLevel};
use crate::macho::BuildVersionTarget;
use crate::manifest::MANIFEST_FILE_NAME;
use crate::mapping::{ProfileKind, RemapPolicy};
use crate::orchestrator::{DylibInjection, InjectScope, Orchestrator, RunOptions, SigningPlan};
use crate::services::{RegistrationService, SigningService};
use crate::{Error, Result};
use log::info;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Identity remapping with builder pattern API.
///
/// # Example
///
/// ```no_run
/// use zremap::ZRemap;
/// use zremap::services::{ExternalSigner, StaticRegistration};
///
/// let mut registration = StaticRegistration::from_file("registered.json")?;
/// let mut signer = ExternalSigner::new("codesign -f -s - --entitlements {entitlements} {binary}")?;
///
/// ZRemap::new("ZZZZZ99999")
///     .allow_debugging(true)
///     .inject_dylib("tweak.dylib")
///     .manifest(true)
///     .remap_ipa("App.ipa", "App-remapped.ipa", &mut registration, &mut signer)?;
/// # Ok::<(), zremap::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct ZRemap {
    team_id: String,
    policy: RemapPolicy,
    patch_ids: bool,
    allow_debugging: bool,
    profile_kind: ProfileKind,
    injections: Vec<DylibInjection>,
    conflicting_dylibs: Vec<String>,
    build_version: Option<BuildVersionTarget>,
    manifest: Option<PathBuf>,
    capabilities: Option<PathBuf>,
    compression_level: CompressionLevel,
}

impl ZRemap {
    /// Create a builder targeting the team `team_id`.
    pub fn new(team_id: impl Into<String>) -> Self {
        Self {
            team_id: team_id.into(),
            policy: RemapPolicy::default(),
            patch_ids: true,
            allow_debugging: false,
            profile_kind: ProfileKind::default(),
            injections: Vec::new(),
            conflicting_dylibs: Vec::new(),
            build_version: None,
            manifest: None,
            capabilities: None,
            compression_level: CompressionLevel::DEFAULT,
        }
    }

    /// Generate fresh identifiers for IDs no known prefix covers.
    ///
    /// Default is `true`. With `false`, only team ID and main bundle ID
    /// prefixes are substituted.
    pub fn randomize_ids(mut self, randomize: bool) -> Self {
        self.policy.randomize_ids = randomize;
        self
    }

    /// Keep the original main bundle ID in the signed Info.plist.
    pub fn preserve_main_bundle_id(mut self, preserve: bool) -> Self {
        self.policy.preserve_main_bundle_id = preserve;
        self
    }

    /// Literal-patch confirmed identifiers into binaries and plists. Default is `true`.
    pub fn patch_ids(mut self, patch: bool) -> Self {
        self.patch_ids = patch;
        self
    }

    /// Set `get-task-allow` on primary components.
    pub fn allow_debugging(mut self, allow: bool) -> Self {
        self.allow_debugging = allow;
        self
    }

    /// Profile kind; drives `aps-environment` and capability filtering.
    pub fn profile_kind(mut self, kind: ProfileKind) -> Self {
        self.profile_kind = kind;
        self
    }

    /// Inject a dylib into every binary.
    pub fn inject_dylib(self, asset: impl AsRef<Path>) -> Self {
        self.inject_dylib_with_scope(asset, InjectScope::AllBinaries)
    }

    /// Inject a dylib with an explicit scope.
    pub fn inject_dylib_with_scope(mut self, asset: impl AsRef<Path>, scope: InjectScope) -> Self {
        self.injections
            .push(DylibInjection::new(asset.as_ref(), scope));
        self
    }

    /// Remove load commands whose path contains `fragment` before injecting.
    pub fn conflicting_dylib(mut self, fragment: impl Into<String>) -> Self {
        self.conflicting_dylibs.push(fragment.into());
        self
    }

    /// Rewrite `LC_BUILD_VERSION` in every patched binary.
    pub fn build_version(mut self, target: BuildVersionTarget) -> Self {
        self.build_version = Some(target);
        self
    }

    /// Write the remapping manifest into the bundle as `zremap.json`.
    pub fn manifest(mut self, enabled: bool) -> Self {
        self.manifest = enabled.then(|| PathBuf::from(MANIFEST_FILE_NAME));
        self
    }

    /// Write the remapping manifest at `relative` inside the bundle.
    pub fn manifest_path(mut self, relative: impl AsRef<Path>) -> Self {
        self.manifest = Some(relative.as_ref().to_path_buf());
        self
    }

    /// Capability metadata JSON used to drop unsupported entitlements.
    pub fn capabilities(mut self, path: impl AsRef<Path>) -> Self {
        self.capabilities = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set ZIP compression level for IPA output (0-9).
    pub fn compression_level(mut self, level: u32) -> Self {
        self.compression_level = CompressionLevel::new(level);
        self
    }

    /// Validate the configuration before anything is touched.
    ///
    /// Returns an error if:
    /// - The team ID is not ten ASCII alphanumerics
    /// - An injection asset does not exist
    /// - The manifest path is absolute
    pub fn validate(&self) -> Result<()> {
        if !is_valid_team_id(&self.team_id) {
            return Err(Error::Config(format!(
                "invalid team ID '{}': expected 10 alphanumeric characters",
                self.team_id
            )));
        }
        if let Some(manifest) = &self.manifest {
            if manifest.is_absolute() {
                return Err(Error::Config(format!(
                    "manifest path {} must be relative to the bundle",
                    manifest.display()
                )));
            }
        }
        self.run_options()?.check_assets()
    }

    fn run_options(&self) -> Result<RunOptions> {
        let mut options = RunOptions::new(self.team_id.clone());
        options.patch_ids = self.patch_ids;
        options.entitlements.allow_debugging = self.allow_debugging;
        options.entitlements.profile_kind = self.profile_kind;
        options.injections = self.injections.clone();
        options.conflicting_dylibs = self.conflicting_dylibs.clone();
        options.build_version = self.build_version;
        options.manifest = self.manifest.clone();
        options.capabilities = match &self.capabilities {
            Some(path) => Some(CapabilityPolicy::from_file(path, self.profile_kind)?),
            None => None,
        };
        Ok(options)
    }

    /// Remap an unpacked `.app` in place.
    pub fn remap_bundle(
        &self,
        app: impl AsRef<Path>,
        registration: &mut dyn RegistrationService,
        signer: &mut dyn SigningService,
    ) -> Result<SigningPlan> {
        let app = app.as_ref();
        self.validate()?;
        if !app.is_dir() {
            return Err(Error::InvalidBundle(format!("{} is not a directory", app.display())));
        }

        strip_drm_leftovers(app)?;
        let options = self.run_options()?;
        let plan = Orchestrator::new(BundleInspector::new(), registration, signer, options)
            .plan_and_apply(app, self.policy)?;
        info!("remapped {} ({} components)", app.display(), plan.steps.len());
        Ok(plan)
    }

    /// Extract `input`, remap its app and write the result to `output`.
    ///
    /// Paths in the returned plan point into the extraction directory, which
    /// is gone once this returns.
    pub fn remap_ipa(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        registration: &mut dyn RegistrationService,
        signer: &mut dyn SigningService,
    ) -> Result<SigningPlan> {
        self.validate()?;
        validate_ipa(input.as_ref())?;

        let work = TempDir::new()?;
        let app = extract_ipa(input.as_ref(), work.path())?;
        let plan = self.remap_bundle(&app, registration, signer)?;
        create_ipa(&app, output.as_ref(), self.compression_level)?;
        info!("wrote {}", output.as_ref().display());
        Ok(plan)
    }
}
