//! Identifier classification.

use super::entitlements::Entitlements;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Prefix every iCloud container identifier carries.
pub const ICLOUD_PREFIX: &str = "iCloud.";

/// Prefix every app group identifier carries.
pub const APP_GROUP_PREFIX: &str = "group.";

/// The family an identifier belongs to.
///
/// The family decides how a replacement is built: bundle IDs keep their
/// team or main-bundle prefix, containers and groups keep their syntactic
/// prefix, keychain groups are re-rooted on the new team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentifierKind {
    /// Application or component bundle identifier.
    Bundle,
    /// iCloud container identifier (`iCloud.…`).
    ICloud,
    /// Keychain access group (`TEAMID.…`).
    Keychain,
    /// Application group (`group.…`).
    AppGroup,
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdentifierKind::Bundle => "bundle",
            IdentifierKind::ICloud => "icloud",
            IdentifierKind::Keychain => "keychain",
            IdentifierKind::AppGroup => "app-group",
        };
        f.write_str(name)
    }
}

/// Classify an identifier by its shape alone.
///
/// Strings that match no known prefix are bundle identifiers.
pub fn classify_shape(id: &str) -> IdentifierKind {
    if id.starts_with(ICLOUD_PREFIX) {
        IdentifierKind::ICloud
    } else if id.starts_with(APP_GROUP_PREFIX) {
        IdentifierKind::AppGroup
    } else {
        IdentifierKind::Bundle
    }
}

/// Run-scoped identifier classifier.
///
/// Shape-based results are cached per input string for the lifetime of the
/// run. Entitlement context always wins over the cache: keychain groups are
/// conventionally `TEAMID.bundle.id` and cannot be told apart from bundle
/// IDs without it.
#[derive(Debug, Default)]
pub struct Classifier {
    cache: HashMap<String, IdentifierKind>,
}

impl Classifier {
    /// Create an empty classifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `id`, consulting `context` when supplied.
    ///
    /// Never fails; unclassifiable strings are [`IdentifierKind::Bundle`].
    pub fn classify(&mut self, id: &str, context: Option<&Entitlements>) -> IdentifierKind {
        if let Some(entitlements) = context {
            if let Some(kind) = classify_in_context(id, entitlements) {
                return kind;
            }
        }

        if let Some(kind) = self.cache.get(id) {
            return *kind;
        }

        let kind = classify_shape(id);
        self.cache.insert(id.to_string(), kind);
        kind
    }

    /// Record the kind an identifier was resolved as.
    pub(crate) fn remember(&mut self, id: &str, kind: IdentifierKind) {
        self.cache.insert(id.to_string(), kind);
    }
}

fn classify_in_context(id: &str, entitlements: &Entitlements) -> Option<IdentifierKind> {
    if entitlements.keychain_access_groups().contains(&id) {
        Some(IdentifierKind::Keychain)
    } else if entitlements.icloud_containers().contains(&id) {
        Some(IdentifierKind::ICloud)
    } else if entitlements.app_groups().contains(&id) {
        Some(IdentifierKind::AppGroup)
    } else {
        None
    }
}
