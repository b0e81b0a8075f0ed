//! Typed view over an entitlements dictionary and its identity remapping.

use super::kind::IdentifierKind;
use super::registry::MappingRegistry;
use crate::{Error, Result};
use plist::{Dictionary, Value};
use std::collections::BTreeSet;

pub const APPLICATION_IDENTIFIER: &str = "application-identifier";
pub const TEAM_IDENTIFIER: &str = "com.apple.developer.team-identifier";
pub const KEYCHAIN_ACCESS_GROUPS: &str = "keychain-access-groups";
pub const APS_ENVIRONMENT: &str = "aps-environment";
pub const GET_TASK_ALLOW: &str = "get-task-allow";
pub const UBIQUITY_KVSTORE_IDENTIFIER: &str = "com.apple.developer.ubiquity-kvstore-identifier";
pub const ASSOCIATED_DOMAINS: &str = "com.apple.developer.associated-domains";

/// Keys that hold app group identifiers.
pub const APP_GROUP_KEYS: [&str; 2] = ["com.apple.security.application-groups", "application-groups"];

/// Keys that hold iCloud container identifiers.
pub const ICLOUD_CONTAINER_KEYS: [&str; 3] = [
    "com.apple.developer.icloud-container-identifiers",
    "com.apple.developer.ubiquity-container-identifiers",
    "com.apple.developer.icloud-container-development-container-identifiers",
];

const STRING_KEYS: [&str; 4] = [
    APPLICATION_IDENTIFIER,
    TEAM_IDENTIFIER,
    APS_ENVIRONMENT,
    UBIQUITY_KVSTORE_IDENTIFIER,
];

/// Signing profile flavor; drives `aps-environment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProfileKind {
    #[default]
    Development,
    AdHoc,
}

impl ProfileKind {
    /// Value of `aps-environment` under this profile.
    pub fn aps_environment(self) -> &'static str {
        match self {
            ProfileKind::Development => "development",
            ProfileKind::AdHoc => "production",
        }
    }
}

impl std::str::FromStr for ProfileKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(ProfileKind::Development),
            "adhoc" | "ad-hoc" => Ok(ProfileKind::AdHoc),
            other => Err(Error::Config(format!(
                "unknown profile kind '{other}' (expected development or adhoc)"
            ))),
        }
    }
}

/// Entitlements of one component.
///
/// Wraps the raw plist dictionary. Construction checks that the identity
/// keys this crate rewrites have the shape it expects; every other key is
/// carried through untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entitlements {
    dict: Dictionary,
}

impl Entitlements {
    /// Empty entitlements.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a dictionary, validating identity-bearing keys.
    pub fn from_dictionary(dict: Dictionary) -> Result<Self> {
        for key in STRING_KEYS {
            if let Some(value) = dict.get(key) {
                if value.as_string().is_none() {
                    return Err(Error::InvalidEntitlements(format!("{key}: expected a string")));
                }
            }
        }

        let list_keys = std::iter::once(KEYCHAIN_ACCESS_GROUPS)
            .chain(APP_GROUP_KEYS)
            .chain(ICLOUD_CONTAINER_KEYS);
        for key in list_keys {
            if let Some(value) = dict.get(key) {
                if !is_string_or_string_array(value) {
                    return Err(Error::InvalidEntitlements(format!(
                        "{key}: expected a string or an array of strings"
                    )));
                }
            }
        }

        if let Some(value) = dict.get(GET_TASK_ALLOW) {
            if value.as_boolean().is_none() {
                return Err(Error::InvalidEntitlements(format!(
                    "{GET_TASK_ALLOW}: expected a boolean"
                )));
            }
        }

        Ok(Self { dict })
    }

    /// Parse entitlements from XML or binary plist bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let value: Value = plist::from_bytes(data)?;
        match value {
            Value::Dictionary(dict) => Self::from_dictionary(dict),
            _ => Err(Error::InvalidEntitlements(
                "entitlements root is not a dictionary".into(),
            )),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.dict.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.dict.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.dict.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.dict.get(key).and_then(Value::as_string)
    }

    /// Values under `key`, whether stored as one string or an array.
    pub fn strings(&self, key: &str) -> Vec<&str> {
        match self.dict.get(key) {
            Some(Value::String(s)) => vec![s.as_str()],
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_string).collect(),
            _ => Vec::new(),
        }
    }

    pub fn keychain_access_groups(&self) -> Vec<&str> {
        self.strings(KEYCHAIN_ACCESS_GROUPS)
    }

    /// App groups under both the modern and the legacy key.
    pub fn app_groups(&self) -> Vec<&str> {
        APP_GROUP_KEYS.iter().flat_map(|key| self.strings(key)).collect()
    }

    /// iCloud containers under any of the container keys.
    pub fn icloud_containers(&self) -> Vec<&str> {
        ICLOUD_CONTAINER_KEYS.iter().flat_map(|key| self.strings(key)).collect()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.dict.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.dict.remove(key)
    }

    pub fn as_dictionary(&self) -> &Dictionary {
        &self.dict
    }

    pub fn into_dictionary(self) -> Dictionary {
        self.dict
    }

    /// Serialize as an XML plist, the form signers expect on disk.
    pub fn to_xml(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        plist::to_writer_xml(&mut out, &self.dict)?;
        Ok(out)
    }
}

fn is_string_or_string_array(value: &Value) -> bool {
    match value {
        Value::String(_) => true,
        Value::Array(items) => items.iter().all(|item| item.as_string().is_some()),
        _ => false,
    }
}

/// Per-run switches for entitlement rewriting.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntitlementOptions {
    pub profile_kind: ProfileKind,
    pub allow_debugging: bool,
}

/// Rewrite every identity-bearing entitlement onto the new team.
///
/// `bundle_id` is the identifier the component's Info.plist ends up with; it
/// becomes the tail of `application-identifier` so the two always agree.
/// Keys in `removals` are dropped before anything else happens.
pub fn remap_entitlements(
    entitlements: &Entitlements,
    registry: &mut MappingRegistry,
    bundle_id: &str,
    options: EntitlementOptions,
    removals: &BTreeSet<String>,
) -> Entitlements {
    let mut result = entitlements.clone();
    for key in removals {
        if result.remove(key).is_some() {
            log::debug!("dropping entitlement {key}");
        }
    }

    let team = registry.new_team_id().to_string();

    if result.contains_key(APPLICATION_IDENTIFIER) {
        result.insert(
            APPLICATION_IDENTIFIER,
            Value::String(format!("{team}.{bundle_id}")),
        );
    }

    result.insert(TEAM_IDENTIFIER, Value::String(team.clone()));

    if result.contains_key(APS_ENVIRONMENT) {
        result.insert(
            APS_ENVIRONMENT,
            Value::String(options.profile_kind.aps_environment().to_string()),
        );
    }

    if result.contains_key(KEYCHAIN_ACCESS_GROUPS) {
        let groups: Vec<Value> = entitlements
            .keychain_access_groups()
            .into_iter()
            .map(|group| {
                let kind = registry.classify(group, Some(entitlements));
                Value::String(registry.resolve(group, kind))
            })
            .collect();
        result.insert(KEYCHAIN_ACCESS_GROUPS, Value::Array(groups));
    }

    for key in APP_GROUP_KEYS {
        if result.contains_key(key) {
            let groups = remap_list(&result, key, registry, IdentifierKind::AppGroup);
            result.insert(key, groups);
        }
    }

    for key in ICLOUD_CONTAINER_KEYS {
        if result.contains_key(key) {
            let containers = remap_list(&result, key, registry, IdentifierKind::ICloud);
            result.insert(key, containers);
        }
    }

    if let Some(kvstore) = result.get_str(UBIQUITY_KVSTORE_IDENTIFIER).map(str::to_string) {
        if let Some(mapped) = remap_kvstore(&kvstore, &team, registry) {
            result.insert(UBIQUITY_KVSTORE_IDENTIFIER, Value::String(mapped));
        }
    }

    if options.allow_debugging {
        result.insert(GET_TASK_ALLOW, Value::Boolean(true));
    } else {
        result.remove(GET_TASK_ALLOW);
    }

    result
}

fn remap_list(
    entitlements: &Entitlements,
    key: &str,
    registry: &mut MappingRegistry,
    kind: IdentifierKind,
) -> Value {
    Value::Array(
        entitlements
            .strings(key)
            .into_iter()
            .map(|id| Value::String(registry.resolve(id, kind)))
            .collect(),
    )
}

// `TEAM.x` keeps its one-character suffix; `TEAM.bundle.id` remaps the tail.
fn remap_kvstore(kvstore: &str, team: &str, registry: &mut MappingRegistry) -> Option<String> {
    let (_, tail) = kvstore.split_once('.')?;
    if tail.chars().count() == 1 {
        Some(format!("{team}.{tail}"))
    } else {
        let mapped = registry.resolve(tail, IdentifierKind::Bundle);
        Some(format!("{team}.{mapped}"))
    }
}
