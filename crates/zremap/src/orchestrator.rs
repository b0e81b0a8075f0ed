//! Run orchestration.
//!
//! [`Orchestrator::plan_and_apply`] takes an unpacked `.app` through one
//! complete remapping run:
//!
//! 1. Discover components and reject encrypted binaries before any write
//! 2. Stage injection dylibs into `Frameworks/` and build a single [`MappingRegistry`]
//! 3. Resolve every primary component's bundle ID, app groups and containers
//! 4. Register app groups and iCloud containers, then bundle IDs
//! 5. Build the patch set from confirmed identifiers only
//! 6. Rewrite Info.plists, write the manifest, embed provisioning profiles
//! 7. Patch, inject and sign each component in signing order
//!
//! The registry is threaded through every step by `&mut`, so a group shared
//! by an app and its extension resolves to one replacement. The run is
//! strictly sequential.

use crate::bundle::{AppComponent, ComponentKind};
use crate::capabilities::CapabilityPolicy;
use crate::macho::{inject_dylib, reject_if_encrypted, rewrite_build_version, BuildVersionTarget, InjectOutcome, Injection};
use crate::manifest::RemapManifest;
use crate::mapping::{
    remap_entitlements, EntitlementOptions, IdentifierKind, IdentifierMapping, MappingRegistry, RemapPolicy,
};
use crate::patch::plist::remap_info_plist;
use crate::patch::{apply_patch_set, PatchSet};
use crate::services::{ComponentInspector, RegistrationService, RemoteId, SigningService};
use crate::{Error, Result};
use log::{debug, info, warn};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const FRAMEWORKS_DIR: &str = "Frameworks";
const EMBEDDED_PROFILE: &str = "embedded.mobileprovision";

/// Which binaries receive an injected load command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InjectScope {
    /// Every component binary except injected dylibs.
    #[default]
    AllBinaries,
    /// The main app executable only.
    MainBinary,
}

/// A dylib copied into `<app>/Frameworks/` and linked from existing binaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DylibInjection {
    pub asset: PathBuf,
    pub scope: InjectScope,
}

impl DylibInjection {
    pub fn new(asset: impl Into<PathBuf>, scope: InjectScope) -> Self {
        Self {
            asset: asset.into(),
            scope,
        }
    }

    /// File name inside `Frameworks/`.
    pub fn file_name(&self) -> Result<String> {
        self.asset
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::MissingDylibAsset(self.asset.clone()))
    }

    fn applies_to(&self, component: &AppComponent) -> bool {
        match self.scope {
            InjectScope::AllBinaries => true,
            InjectScope::MainBinary => component.kind == ComponentKind::MainApp,
        }
    }
}

/// Everything a run needs besides the bundle and its collaborators.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub new_team_id: String,
    /// Literal-patch binaries and plists with confirmed identifiers.
    pub patch_ids: bool,
    pub entitlements: EntitlementOptions,
    pub injections: Vec<DylibInjection>,
    /// Load path fragments removed before injecting.
    pub conflicting_dylibs: Vec<String>,
    pub build_version: Option<BuildVersionTarget>,
    /// Manifest location relative to the app root.
    pub manifest: Option<PathBuf>,
    pub capabilities: Option<CapabilityPolicy>,
}

impl RunOptions {
    pub fn new(new_team_id: impl Into<String>) -> Self {
        Self {
            new_team_id: new_team_id.into(),
            patch_ids: true,
            entitlements: EntitlementOptions::default(),
            injections: Vec::new(),
            conflicting_dylibs: Vec::new(),
            build_version: None,
            manifest: None,
            capabilities: None,
        }
    }

    /// Fail on missing injection assets before anything is touched.
    pub fn check_assets(&self) -> Result<()> {
        for injection in &self.injections {
            if !injection.asset.is_file() {
                return Err(Error::MissingDylibAsset(injection.asset.clone()));
            }
            injection.file_name()?;
        }
        Ok(())
    }
}

/// One signed component, in signing order.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    /// The component as discovered, with its original identity.
    pub component: AppComponent,
    /// Bundle ID the component is signed under.
    pub bundle_id: String,
    pub binary: PathBuf,
    /// Entitlements handed to the signing service.
    pub entitlements: Option<PathBuf>,
    /// Literal replacements applied to the binary.
    pub replacements: usize,
    /// Load paths added to the binary.
    pub injected: Vec<String>,
}

/// Outcome of [`Orchestrator::plan_and_apply`].
///
/// Owns the work directory holding the entitlements files; it is removed
/// when the plan is dropped.
#[derive(Debug)]
pub struct SigningPlan {
    pub app_root: PathBuf,
    pub steps: Vec<PlannedStep>,
    pub mappings: Vec<IdentifierMapping>,
    pub registered: BTreeSet<String>,
    pub patch_set: PatchSet,
    pub manifest: Option<PathBuf>,
    work_dir: TempDir,
}

impl SigningPlan {
    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    /// Replacement decided for `original`, if any.
    pub fn replacement_for(&self, original: &str) -> Option<&str> {
        self.mappings
            .iter()
            .find(|m| m.original == original)
            .map(|m| m.replacement.as_str())
    }
}

/// Order components for signing.
///
/// Secondary components come first: injected dylibs (in `injected` order),
/// then the rest deepest first. Primary components follow deepest first,
/// with the main app last. Ties keep discovery order.
pub fn signing_order<'c>(components: &'c [AppComponent], injected: &[String]) -> Vec<&'c AppComponent> {
    signing_indices(components, injected)
        .into_iter()
        .map(|i| &components[i])
        .collect()
}

fn signing_indices(components: &[AppComponent], injected: &[String]) -> Vec<usize> {
    let is_asset = |c: &AppComponent| injected.iter().any(|name| is_staged_asset(c, name));

    let mut order: Vec<usize> = injected
        .iter()
        .filter_map(|name| components.iter().position(|c| is_staged_asset(c, name)))
        .collect();

    let mut secondary: Vec<usize> = (0..components.len())
        .filter(|&i| !components[i].is_primary() && !is_asset(&components[i]))
        .collect();
    secondary.sort_by_key(|&i| Reverse(components[i].depth));

    let mut primary: Vec<usize> = (0..components.len())
        .filter(|&i| components[i].is_primary())
        .collect();
    primary.sort_by_key(|&i| (components[i].kind == ComponentKind::MainApp, Reverse(components[i].depth)));

    order.extend(secondary);
    order.extend(primary);
    order
}

fn is_staged_asset(component: &AppComponent, name: &str) -> bool {
    component.kind == ComponentKind::Dylib && component.path == Path::new(FRAMEWORKS_DIR).join(name)
}

/// Resolution results for one primary component.
#[derive(Debug)]
struct PrimaryPlan {
    bundle_id: String,
    capabilities: BTreeSet<String>,
    removals: BTreeSet<String>,
}

/// Drives one run over a bundle.
pub struct Orchestrator<'a, I> {
    inspector: I,
    registration: &'a mut dyn RegistrationService,
    signer: &'a mut dyn SigningService,
    options: RunOptions,
}

impl<'a, I: ComponentInspector> Orchestrator<'a, I> {
    pub fn new(
        inspector: I,
        registration: &'a mut dyn RegistrationService,
        signer: &'a mut dyn SigningService,
        options: RunOptions,
    ) -> Self {
        Self {
            inspector,
            registration,
            signer,
            options,
        }
    }

    /// Remap, patch and sign the bundle at `app_root`.
    pub fn plan_and_apply(&mut self, app_root: &Path, policy: RemapPolicy) -> Result<SigningPlan> {
        self.options.check_assets()?;

        let mut components = self.inspector.list_components(app_root)?;
        reject_encrypted_components(app_root, &components)?;

        let injected = self.stage_dylibs(app_root)?;
        if !injected.is_empty() {
            components = self.inspector.list_components(app_root)?;
        }

        let main_bundle_id = self.inspector.main_bundle_id(app_root)?;
        let team_ids = self.inspector.team_ids_of(app_root, &components)?;
        if team_ids.is_empty() {
            warn!("no team IDs found in {}; only bundle IDs will be remapped", app_root.display());
        }
        info!(
            "{} components, main bundle {}, team IDs {:?}",
            components.len(),
            main_bundle_id,
            team_ids
        );

        let mut registry = MappingRegistry::new(team_ids, self.options.new_team_id.clone(), main_bundle_id, policy);

        let (plans, groups, containers) = self.analyze(&components, &mut registry);
        let profiles = self.register(&components, &plans, &groups, &containers, &mut registry)?;

        let patch_set = if self.options.patch_ids {
            registry.build_patch_set()?
        } else {
            PatchSet::default()
        };
        info!("patch set has {} entries", patch_set.len());

        let mut signed_ids = BTreeMap::new();
        for (index, component) in components.iter().enumerate() {
            let Some(info_plist) = component.info_plist_path(app_root) else {
                continue;
            };
            let outcome = remap_info_plist(&info_plist, &mut registry, Some(&patch_set))?;
            if let Some(bundle_id) = outcome.bundle_id {
                signed_ids.insert(index, bundle_id);
            }
        }

        let manifest = match &self.options.manifest {
            Some(relative) => {
                let path = app_root.join(relative);
                RemapManifest::from_registry(&registry).write(&path)?;
                info!("wrote manifest {}", path.display());
                Some(path)
            }
            None => None,
        };

        for (index, profile) in profiles {
            let dir = app_root.join(&components[index].path);
            fs::write(dir.join(EMBEDDED_PROFILE), profile)?;
            debug!("embedded provisioning profile in {}", dir.display());
        }

        let work_dir = TempDir::new()?;
        let order = signing_indices(&components, &injected);
        info!(
            "signing order: {:?}",
            order.iter().map(|&i| components[i].bundle_id.as_str()).collect::<Vec<_>>()
        );

        let mut steps = Vec::with_capacity(order.len());
        for index in order {
            let step = self.process_component(
                app_root,
                &components[index],
                plans.get(&index),
                signed_ids.get(&index),
                &injected,
                &patch_set,
                &mut registry,
                work_dir.path(),
                steps.len(),
            )?;
            steps.push(step);
        }

        Ok(SigningPlan {
            app_root: app_root.to_path_buf(),
            steps,
            mappings: registry.mappings().cloned().collect(),
            registered: registry.registered().clone(),
            patch_set,
            manifest,
            work_dir,
        })
    }

    /// Copy injection assets into `<app>/Frameworks/`. Returns their file names.
    fn stage_dylibs(&self, app_root: &Path) -> Result<Vec<String>> {
        if self.options.injections.is_empty() {
            return Ok(Vec::new());
        }
        let frameworks = app_root.join(FRAMEWORKS_DIR);
        fs::create_dir_all(&frameworks)?;

        let mut names = Vec::new();
        for injection in &self.options.injections {
            let name = injection.file_name()?;
            fs::copy(&injection.asset, frameworks.join(&name))?;
            info!("staged {} into {}", name, frameworks.display());
            names.push(name);
        }
        Ok(names)
    }

    /// Resolve primary bundle IDs and collect the groups and containers to register.
    fn analyze(
        &self,
        components: &[AppComponent],
        registry: &mut MappingRegistry,
    ) -> (BTreeMap<usize, PrimaryPlan>, BTreeSet<String>, BTreeSet<String>) {
        let mut plans = BTreeMap::new();
        let mut groups = BTreeSet::new();
        let mut containers = BTreeSet::new();

        for (index, component) in components.iter().enumerate() {
            if !component.is_primary() {
                continue;
            }
            let bundle_id = signed_bundle_id(registry, &component.bundle_id);

            let (capabilities, removals) = match &self.options.capabilities {
                Some(policy) => policy.process(&component.entitlements),
                None => Default::default(),
            };

            for group in component.entitlements.app_groups() {
                groups.insert(registry.resolve(group, IdentifierKind::AppGroup));
            }
            for container in component.entitlements.icloud_containers() {
                containers.insert(registry.resolve(container, IdentifierKind::ICloud));
            }

            debug!("{} -> {}", component.bundle_id, bundle_id);
            plans.insert(
                index,
                PrimaryPlan {
                    bundle_id,
                    capabilities,
                    removals,
                },
            );
        }

        (plans, groups, containers)
    }

    /// Register groups and containers, then bundle IDs. Returns the
    /// provisioning profiles to embed, by component index.
    fn register(
        &mut self,
        components: &[AppComponent],
        plans: &BTreeMap<usize, PrimaryPlan>,
        groups: &BTreeSet<String>,
        containers: &BTreeSet<String>,
        registry: &mut MappingRegistry,
    ) -> Result<Vec<(usize, Vec<u8>)>> {
        let team = self.options.new_team_id.clone();

        for group in groups {
            let confirmed = self.registration.register_app_group(&team, group)?;
            confirm(registry, group, confirmed.as_ref(), "app group");
        }
        for container in containers {
            let confirmed = self.registration.register_icloud_container(&team, container)?;
            confirm(registry, container, confirmed.as_ref(), "iCloud container");
        }

        let mut profiles = Vec::new();
        for (&index, plan) in plans {
            let component = &components[index];
            let Some(remote) = self.registration.register_bundle_id(&team, &plan.bundle_id)? else {
                confirm(registry, &plan.bundle_id, None, "bundle ID");
                continue;
            };
            confirm(registry, &plan.bundle_id, Some(&remote), "bundle ID");

            let originals: Vec<String> = registry
                .original_team_ids()
                .iter()
                .filter(|t| component.bundle_id.contains(t.as_str()))
                .cloned()
                .collect();
            for original in originals {
                registry.register_as_confirmed(&original);
                registry.register_as_confirmed(&team);
            }

            if !plan.capabilities.is_empty() {
                info!("enabling {:?} on {}", plan.capabilities, plan.bundle_id);
                self.registration.enable_capabilities(&remote, &plan.capabilities)?;
            }
            if let Some(profile) = self.registration.provisioning_profile(&team, &plan.bundle_id)? {
                profiles.push((index, profile));
            }
        }

        Ok(profiles)
    }

    #[allow(clippy::too_many_arguments)]
    fn process_component(
        &mut self,
        app_root: &Path,
        component: &AppComponent,
        plan: Option<&PrimaryPlan>,
        signed_id: Option<&String>,
        injected: &[String],
        patch_set: &PatchSet,
        registry: &mut MappingRegistry,
        work_dir: &Path,
        position: usize,
    ) -> Result<PlannedStep> {
        let binary = app_root.join(&component.executable);
        let is_asset = injected.iter().any(|name| is_staged_asset(component, name));

        let (replacements, load_paths) = if is_asset {
            (0, Vec::new())
        } else {
            self.patch_binary(app_root, &binary, component, injected, patch_set)?
        };

        let bundle_id = match (signed_id, plan) {
            (Some(id), _) => id.clone(),
            (None, Some(plan)) => plan.bundle_id.clone(),
            (None, None) => component.bundle_id.clone(),
        };

        let entitlements = match plan {
            Some(plan) if !component.entitlements.is_empty() => {
                let remapped = remap_entitlements(
                    &component.entitlements,
                    registry,
                    &bundle_id,
                    self.options.entitlements,
                    &plan.removals,
                );
                let name = match component.kind {
                    ComponentKind::MainApp => "main".to_string(),
                    _ => component
                        .path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "component".to_string()),
                };
                let path = work_dir.join(format!("{position:02}-{name}.entitlements"));
                fs::write(&path, remapped.to_xml()?)?;
                Some(path)
            }
            _ => None,
        };

        self.signer.sign(&binary, entitlements.as_deref())?;

        Ok(PlannedStep {
            component: component.clone(),
            bundle_id,
            binary,
            entitlements,
            replacements,
            injected: load_paths,
        })
    }

    /// Literal-patch, inject and retarget one binary with a single write.
    fn patch_binary(
        &self,
        app_root: &Path,
        binary: &Path,
        component: &AppComponent,
        injected: &[String],
        patch_set: &PatchSet,
    ) -> Result<(usize, Vec<String>)> {
        let injections: Vec<&String> = self
            .options
            .injections
            .iter()
            .zip(injected)
            .filter(|(injection, _)| injection.applies_to(component))
            .map(|(_, name)| name)
            .collect();

        let mut data = fs::read(binary)?;
        reject_if_encrypted(&data).map_err(|e| e.with_path(binary))?;
        let mut changed = false;

        let replacements = apply_patch_set(patch_set, &mut data)?;
        changed |= replacements > 0;

        let mut load_paths = Vec::new();
        for name in injections {
            let outcome = inject_dylib(
                &mut data,
                Injection {
                    binary_path: binary,
                    bundle_root: app_root,
                    dylib_name: name,
                    conflicting: &self.options.conflicting_dylibs,
                },
            )
            .map_err(|e| e.with_path(binary))?;
            match outcome {
                InjectOutcome::Injected {
                    load_path,
                    slices_changed,
                    removed,
                } => {
                    changed |= slices_changed > 0 || removed > 0;
                    load_paths.push(load_path);
                }
                InjectOutcome::Skipped { removed } => changed |= removed > 0,
            }
        }

        if let Some(target) = self.options.build_version {
            changed |= rewrite_build_version(&mut data, target)? > 0;
        }

        if changed {
            fs::write(binary, &data)?;
            info!("{}: {} replacement(s), {} load path(s)", binary.display(), replacements, load_paths.len());
        }
        Ok((replacements, load_paths))
    }
}

/// Fail before anything is written if any component binary is encrypted.
fn reject_encrypted_components(app_root: &Path, components: &[AppComponent]) -> Result<()> {
    for component in components {
        let binary = app_root.join(&component.executable);
        let data = fs::read(&binary)?;
        reject_if_encrypted(&data).map_err(|e| e.with_path(&binary))?;
    }
    debug!("{} component binaries are decrypted", components.len());
    Ok(())
}

/// The identifier a primary component's Info.plist will carry.
fn signed_bundle_id(registry: &mut MappingRegistry, original: &str) -> String {
    let kind = registry.classify(original, None);
    if kind == IdentifierKind::Bundle && registry.policy().preserve_main_bundle_id {
        return original.to_string();
    }
    registry.resolve(original, kind)
}

fn confirm(registry: &mut MappingRegistry, id: &str, remote: Option<&RemoteId>, what: &str) {
    match remote {
        Some(remote) => {
            info!("registered {what} {id} ({remote})");
            registry.register_as_confirmed(id);
        }
        None => info!("{what} {id} not confirmed; it will not be patched into binaries"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Entitlements;

    fn component(kind: ComponentKind, path: &str, depth: usize) -> AppComponent {
        AppComponent {
            path: PathBuf::from(path),
            bundle_id: path.to_string(),
            executable: PathBuf::from(path).join("bin"),
            entitlements: Entitlements::new(),
            kind,
            depth,
        }
    }

    fn paths<'a>(order: &[&'a AppComponent]) -> Vec<&'a str> {
        order.iter().map(|c| c.path.to_str().unwrap()).collect()
    }

    #[test]
    fn test_secondaries_before_primaries() {
        let components = vec![
            component(ComponentKind::MainApp, "", 0),
            component(ComponentKind::Extension, "PlugIns/W.appex", 1),
            component(ComponentKind::Framework, "PlugIns/W.appex/Frameworks/K.framework", 2),
        ];
        let order = signing_order(&components, &[]);
        assert_eq!(
            paths(&order),
            vec!["PlugIns/W.appex/Frameworks/K.framework", "PlugIns/W.appex", ""]
        );
    }

    #[test]
    fn test_injected_dylibs_first_and_main_last() {
        let components = vec![
            component(ComponentKind::MainApp, "", 0),
            component(ComponentKind::Framework, "Frameworks/A.framework", 1),
            component(ComponentKind::Dylib, "Frameworks/tweak.dylib", 1),
            component(ComponentKind::NestedApp, "Watch/W.app", 1),
            component(ComponentKind::Extension, "Watch/W.app/PlugIns/E.appex", 2),
            component(ComponentKind::Framework, "Frameworks/A.framework/Frameworks/B.framework", 2),
        ];
        let order = signing_order(&components, &["tweak.dylib".to_string()]);
        assert_eq!(
            paths(&order),
            vec![
                "Frameworks/tweak.dylib",
                "Frameworks/A.framework/Frameworks/B.framework",
                "Frameworks/A.framework",
                "Watch/W.app/PlugIns/E.appex",
                "Watch/W.app",
                "",
            ]
        );
    }

    #[test]
    fn test_missing_asset() {
        let mut options = RunOptions::new("ZZZZZ99999");
        options
            .injections
            .push(DylibInjection::new("/nonexistent/tweak.dylib", InjectScope::MainBinary));
        assert!(matches!(options.check_assets(), Err(Error::MissingDylibAsset(_))));
    }

    #[test]
    fn test_injection_scope() {
        let main = component(ComponentKind::MainApp, "", 0);
        let ext = component(ComponentKind::Extension, "PlugIns/W.appex", 1);
        let only_main = DylibInjection::new("t.dylib", InjectScope::MainBinary);
        assert!(only_main.applies_to(&main));
        assert!(!only_main.applies_to(&ext));
        assert!(DylibInjection::new("t.dylib", InjectScope::AllBinaries).applies_to(&ext));
    }
}
