//! Run-scoped identifier mapping table.
//!
//! The registry owns every `original -> replacement` decision of a run, the
//! classifier and generator that produce them, and the set of identifiers
//! the registration service has confirmed. Only confirmed identifiers ever
//! make it into a [`PatchSet`].

use super::entitlements::Entitlements;
use super::generator::IdGenerator;
use super::kind::{Classifier, IdentifierKind, APP_GROUP_PREFIX, ICLOUD_PREFIX};
use crate::patch::{PatchEntry, PatchSet};
use crate::Result;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Identifier that is never remapped.
pub const APPLE_TOKEN: &str = "com.apple.token";

/// Per-run remapping policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapPolicy {
    /// Generate fresh segments for identifiers that match no known prefix.
    pub randomize_ids: bool,
    /// Keep the original main bundle ID in the signed Info.plist.
    pub preserve_main_bundle_id: bool,
}

impl Default for RemapPolicy {
    fn default() -> Self {
        Self {
            randomize_ids: true,
            preserve_main_bundle_id: false,
        }
    }
}

/// One resolved identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierMapping {
    pub original: String,
    pub replacement: String,
    pub kind: IdentifierKind,
}

/// Mapping table for one run.
#[derive(Debug)]
pub struct MappingRegistry {
    original_team_ids: Vec<String>,
    new_team_id: String,
    original_main_bundle_id: String,
    new_main_bundle_id: String,
    policy: RemapPolicy,
    mappings: BTreeMap<String, IdentifierMapping>,
    registered: BTreeSet<String>,
    classifier: Classifier,
    generator: IdGenerator,
}

impl MappingRegistry {
    /// Create a registry and resolve the main bundle ID up front.
    pub fn new(
        original_team_ids: Vec<String>,
        new_team_id: impl Into<String>,
        original_main_bundle_id: impl Into<String>,
        policy: RemapPolicy,
    ) -> Self {
        let new_team_id = new_team_id.into();
        let original_main_bundle_id = original_main_bundle_id.into();

        let mut original_team_ids = original_team_ids;
        original_team_ids.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        original_team_ids.dedup();

        let mut generator = IdGenerator::new(policy.randomize_ids);
        let new_main_bundle_id = generator.generate_id(&original_main_bundle_id, &new_team_id);

        let mut registry = Self {
            original_team_ids,
            new_team_id,
            original_main_bundle_id: original_main_bundle_id.clone(),
            new_main_bundle_id: new_main_bundle_id.clone(),
            policy,
            mappings: BTreeMap::new(),
            registered: BTreeSet::new(),
            classifier: Classifier::new(),
            generator,
        };
        if !original_main_bundle_id.is_empty() {
            registry.store(original_main_bundle_id, new_main_bundle_id, IdentifierKind::Bundle);
        }
        registry
    }

    pub fn new_team_id(&self) -> &str {
        &self.new_team_id
    }

    pub fn original_team_ids(&self) -> &[String] {
        &self.original_team_ids
    }

    pub fn original_main_bundle_id(&self) -> &str {
        &self.original_main_bundle_id
    }

    pub fn new_main_bundle_id(&self) -> &str {
        &self.new_main_bundle_id
    }

    pub fn policy(&self) -> RemapPolicy {
        self.policy
    }

    /// All mappings, ordered by original identifier.
    pub fn mappings(&self) -> impl Iterator<Item = &IdentifierMapping> {
        self.mappings.values()
    }

    pub fn get(&self, original: &str) -> Option<&IdentifierMapping> {
        self.mappings.get(original)
    }

    pub fn registered(&self) -> &BTreeSet<String> {
        &self.registered
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.registered.contains(id)
    }

    /// Classify `id`, optionally against the entitlements it came from.
    pub fn classify(&mut self, id: &str, context: Option<&Entitlements>) -> IdentifierKind {
        self.classifier.classify(id, context)
    }

    /// Classify `original` by shape and resolve it.
    pub fn resolve_classified(&mut self, original: &str) -> String {
        let kind = self.classifier.classify(original, None);
        self.resolve(original, kind)
    }

    /// Return the replacement for `original`, creating it on first request.
    ///
    /// Idempotent: once an identifier has a replacement, the same string is
    /// returned no matter which kind is asked for later. The replacement
    /// always has the byte length of `original`.
    pub fn resolve(&mut self, original: &str, kind: IdentifierKind) -> String {
        if original.is_empty() || original == APPLE_TOKEN {
            return original.to_string();
        }
        if let Some(existing) = self.mappings.get(original) {
            return existing.replacement.clone();
        }

        let candidate = match kind {
            IdentifierKind::Bundle => self.bundle_candidate(original),
            IdentifierKind::ICloud => self.icloud_candidate(original),
            IdentifierKind::Keychain => self.keychain_candidate(original),
            IdentifierKind::AppGroup => self.app_group_candidate(original),
        };

        let replacement = enforce_length(original, candidate);
        self.store(original.to_string(), replacement.clone(), kind);
        replacement
    }

    fn bundle_candidate(&mut self, original: &str) -> String {
        if let Some(rest) = self.strip_team_prefix(original) {
            return format!("{}{}", self.new_team_id, rest);
        }
        if !self.original_main_bundle_id.is_empty() {
            if let Some(suffix) = original.strip_prefix(self.original_main_bundle_id.as_str()) {
                return format!("{}{}", self.new_main_bundle_id, suffix);
            }
        }
        self.generator.generate_id(original, &self.new_team_id)
    }

    fn icloud_candidate(&mut self, original: &str) -> String {
        let base = match original.strip_prefix(ICLOUD_PREFIX) {
            Some(base) => base.to_string(),
            None => match self.strip_team_prefix(original) {
                Some(rest) => rest.strip_prefix('.').unwrap_or(rest).to_string(),
                None => original.to_string(),
            },
        };
        let generated = self.generator.generate_id(&base, &self.new_team_id);
        format!("{ICLOUD_PREFIX}{generated}")
    }

    fn keychain_candidate(&self, original: &str) -> String {
        match self.strip_team_prefix(original) {
            Some(rest) => format!("{}{}", self.new_team_id, rest),
            None => format!("{}.{}", self.new_team_id, original),
        }
    }

    fn app_group_candidate(&mut self, original: &str) -> String {
        let base = original.strip_prefix(APP_GROUP_PREFIX).unwrap_or(original);
        if let Some(rest) = self.strip_team_prefix(base) {
            return format!("{APP_GROUP_PREFIX}{}{}", self.new_team_id, rest);
        }
        let generated = self.generator.generate_id(base, &self.new_team_id);
        format!("{APP_GROUP_PREFIX}{generated}")
    }

    fn strip_team_prefix<'a>(&self, id: &'a str) -> Option<&'a str> {
        self.original_team_ids
            .iter()
            .filter(|team| !team.is_empty())
            .find_map(|team| id.strip_prefix(team.as_str()))
    }

    fn store(&mut self, original: String, replacement: String, kind: IdentifierKind) {
        self.classifier.remember(&original, kind);
        self.mappings.insert(
            original.clone(),
            IdentifierMapping {
                original,
                replacement,
                kind,
            },
        );
    }

    /// Mark `id` as confirmed by the registration service.
    ///
    /// When `id` is a replacement, its original is confirmed too.
    pub fn register_as_confirmed(&mut self, id: &str) {
        let originals: Vec<String> = self
            .mappings
            .values()
            .filter(|m| m.replacement == id && m.original != id)
            .map(|m| m.original.clone())
            .collect();

        debug!("confirmed identifier {id}");
        self.registered.insert(id.to_string());
        for original in originals {
            debug!("confirmed identifier {original} (original of {id})");
            self.registered.insert(original);
        }
    }

    /// Build the substitutions binaries and plists get patched with.
    ///
    /// Team IDs are always included. Every other mapping needs its original
    /// confirmed. In preserve-main-bundle-ID mode the main bundle ID mapping
    /// is dropped and [`filter_preserving_identity`] runs over the result.
    pub fn build_patch_set(&self) -> Result<PatchSet> {
        let mut pairs: Vec<(String, String)> = Vec::new();

        for team in &self.original_team_ids {
            if team.len() == self.new_team_id.len() && *team != self.new_team_id {
                pairs.push((team.clone(), self.new_team_id.clone()));
            }
        }

        let mut seen = BTreeSet::new();
        for mapping in self.mappings.values() {
            if !self.registered.contains(&mapping.original) {
                debug!(
                    "{} not confirmed, leaving it out of the patch set",
                    mapping.original
                );
                continue;
            }
            if mapping.original.len() != mapping.replacement.len()
                || mapping.original == mapping.replacement
            {
                continue;
            }
            if self.policy.preserve_main_bundle_id
                && mapping.original == self.original_main_bundle_id
            {
                continue;
            }
            if seen.insert(mapping.replacement.clone()) {
                pairs.push((mapping.original.clone(), mapping.replacement.clone()));
            }
        }

        if self.policy.preserve_main_bundle_id {
            pairs = filter_preserving_identity(
                pairs,
                &self.original_main_bundle_id,
                &self.original_team_ids,
            );
        }

        PatchSet::new(
            pairs
                .into_iter()
                .map(|(pattern, replacement)| PatchEntry::new(pattern, replacement))
                .collect(),
        )
    }
}

/// Keep only the substitutions that cannot touch the main bundle identity.
///
/// An entry survives when its original is an iCloud container or app group,
/// looks like a team ID (ten upper-case alphanumerics), contains an original
/// team ID, or does not start with the main bundle ID. The checks are
/// string-shape heuristics, so an unrelated identifier that happens to look
/// like a team ID passes as well.
pub fn filter_preserving_identity(
    pairs: Vec<(String, String)>,
    main_bundle_id: &str,
    team_ids: &[String],
) -> Vec<(String, String)> {
    pairs
        .into_iter()
        .filter(|(original, _)| {
            original.starts_with(ICLOUD_PREFIX)
                || original.starts_with(APP_GROUP_PREFIX)
                || looks_like_team_id(original)
                || team_ids.iter().any(|team| original.contains(team.as_str()))
                || (!main_bundle_id.is_empty() && !original.starts_with(main_bundle_id))
        })
        .collect()
}

fn looks_like_team_id(s: &str) -> bool {
    s.chars().count() == 10
        && s.chars().all(char::is_alphanumeric)
        && s.chars().any(char::is_uppercase)
        && !s.chars().any(char::is_lowercase)
}

fn enforce_length(original: &str, candidate: String) -> String {
    let target = original.len();
    if candidate.len() == target {
        return candidate;
    }

    warn!("identifier length mismatch: {original} -> {candidate}, repairing");
    let mut repaired = candidate;
    if repaired.len() > target {
        let mut cut = target;
        while !repaired.is_char_boundary(cut) {
            cut -= 1;
        }
        repaired.truncate(cut);
    }
    while repaired.len() < target {
        repaired.push('x');
    }
    repaired
}
