//! Capability metadata from App Store Connect.
//!
//! The capability list (`GET /v1/capabilities` style JSON) says which
//! entitlement keys each capability grants. A component's entitlements are
//! split into capabilities to enable on the new bundle ID and keys that no
//! capability covers, which have to be dropped before signing.

use crate::mapping::entitlements::{APPLICATION_IDENTIFIER, KEYCHAIN_ACCESS_GROUPS, TEAM_IDENTIFIER};
use crate::mapping::{Entitlements, ProfileKind};
use crate::Result;
use log::debug;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Keys that are remapped, never removed.
const CORE_KEYS: [&str; 3] = [APPLICATION_IDENTIFIER, TEAM_IDENTIFIER, KEYCHAIN_ACCESS_GROUPS];

/// Keys that are always removed.
const BANNED_KEYS: [&str; 1] = ["com.apple.developer.in-app-payments"];

#[derive(Debug, Deserialize)]
struct CapabilityList {
    data: Vec<CapabilityRecord>,
}

#[derive(Debug, Deserialize)]
struct CapabilityRecord {
    id: String,
    #[serde(default)]
    attributes: Attributes,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Attributes {
    supported_sdks: Vec<DisplayValue>,
    distribution_types: Vec<DisplayValue>,
    entitlements: Vec<EntitlementRef>,
    settings: Vec<Setting>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DisplayValue {
    display_value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EntitlementRef {
    profile_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Setting {
    options: Vec<SettingOption>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingOption {
    entitlements: Vec<EntitlementRef>,
}

impl Attributes {
    fn supports(&self, profile_kind: ProfileKind) -> bool {
        let wanted = match profile_kind {
            ProfileKind::Development => "Development",
            ProfileKind::AdHoc => "Ad hoc",
        };
        let has = |values: &[DisplayValue], needle: &str| {
            values
                .iter()
                .any(|v| v.display_value.as_deref() == Some(needle))
        };
        has(&self.supported_sdks, "iOS") && has(&self.distribution_types, wanted)
    }

    fn profile_keys(&self) -> impl Iterator<Item = &str> {
        self.entitlements
            .iter()
            .chain(
                self.settings
                    .iter()
                    .flat_map(|s| s.options.iter())
                    .flat_map(|o| o.entitlements.iter()),
            )
            .filter_map(|e| e.profile_key.as_deref())
    }
}

/// Entitlement key to capability ID, for one profile kind.
#[derive(Debug, Clone, Default)]
pub struct CapabilityPolicy {
    by_key: BTreeMap<String, String>,
}

impl CapabilityPolicy {
    pub fn from_json(data: &[u8], profile_kind: ProfileKind) -> Result<Self> {
        let list: CapabilityList = serde_json::from_slice(data)?;
        let mut by_key = BTreeMap::new();
        for record in &list.data {
            if !record.attributes.supports(profile_kind) {
                continue;
            }
            for key in record.attributes.profile_keys() {
                by_key.insert(key.to_string(), record.id.clone());
            }
        }
        debug!("capability policy covers {} entitlement keys", by_key.len());
        Ok(Self { by_key })
    }

    pub fn from_file(path: impl AsRef<Path>, profile_kind: ProfileKind) -> Result<Self> {
        Self::from_json(&fs::read(path)?, profile_kind)
    }

    /// Capability granting `key`, if any.
    pub fn capability_for(&self, key: &str) -> Option<&str> {
        self.by_key.get(key).map(String::as_str)
    }

    /// Split `entitlements` into `(capabilities_to_enable, keys_to_remove)`.
    pub fn process(&self, entitlements: &Entitlements) -> (BTreeSet<String>, BTreeSet<String>) {
        let mut enable = BTreeSet::new();
        let mut remove = BTreeSet::new();

        for key in entitlements.keys() {
            if CORE_KEYS.contains(&key) {
                continue;
            }
            if BANNED_KEYS.contains(&key) {
                remove.insert(key.to_string());
                continue;
            }
            match self.capability_for(key) {
                Some(capability) => {
                    enable.insert(capability.to_string());
                }
                None => {
                    remove.insert(key.to_string());
                }
            }
        }

        (enable, remove)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plist::{Dictionary, Value};

    const CAPABILITIES: &str = r#"{
      "data": [
        {
          "id": "APP_GROUPS",
          "attributes": {
            "supportedSDKs": [{"displayValue": "iOS"}],
            "distributionTypes": [{"displayValue": "Development"}, {"displayValue": "Ad hoc"}],
            "entitlements": [{"profileKey": "com.apple.security.application-groups"}]
          }
        },
        {
          "id": "ICLOUD",
          "attributes": {
            "supportedSDKs": [{"displayValue": "iOS"}],
            "distributionTypes": [{"displayValue": "Development"}],
            "settings": [{"options": [{"entitlements": [
              {"profileKey": "com.apple.developer.icloud-container-identifiers"},
              {"profileKey": "com.apple.developer.ubiquity-kvstore-identifier"}
            ]}]}]
          }
        },
        {
          "id": "MAC_ONLY",
          "attributes": {
            "supportedSDKs": [{"displayValue": "macOS"}],
            "distributionTypes": [{"displayValue": "Development"}],
            "entitlements": [{"profileKey": "com.apple.security.app-sandbox"}]
          }
        },
        {
          "id": "IN_APP_PAY",
          "attributes": {
            "supportedSDKs": [{"displayValue": "iOS"}],
            "distributionTypes": [{"displayValue": "Development"}],
            "entitlements": [{"profileKey": "com.apple.developer.in-app-payments"}]
          }
        }
      ]
    }"#;

    fn entitlements(keys: &[&str]) -> Entitlements {
        let mut dict = Dictionary::new();
        for key in keys {
            dict.insert((*key).into(), Value::Boolean(true));
        }
        dict.insert(APPLICATION_IDENTIFIER.into(), Value::String("T.app".into()));
        Entitlements::from_dictionary(dict).unwrap()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_development_policy() {
        let policy = CapabilityPolicy::from_json(CAPABILITIES.as_bytes(), ProfileKind::Development).unwrap();
        let (enable, remove) = policy.process(&entitlements(&[
            "com.apple.developer.ubiquity-kvstore-identifier",
            "com.apple.security.app-sandbox",
            "com.apple.developer.in-app-payments",
        ]));
        assert_eq!(enable, set(&["ICLOUD"]));
        assert_eq!(
            remove,
            set(&["com.apple.developer.in-app-payments", "com.apple.security.app-sandbox"])
        );
    }

    #[test]
    fn test_adhoc_policy_filters_distribution() {
        let policy = CapabilityPolicy::from_json(CAPABILITIES.as_bytes(), ProfileKind::AdHoc).unwrap();
        assert_eq!(policy.capability_for("com.apple.security.application-groups"), Some("APP_GROUPS"));
        assert_eq!(policy.capability_for("com.apple.developer.icloud-container-identifiers"), None);
    }

    #[test]
    fn test_core_keys_survive() {
        let policy = CapabilityPolicy::default();
        let (enable, remove) = policy.process(&entitlements(&[]));
        assert!(enable.is_empty());
        assert!(remove.is_empty());
    }

    #[test]
    fn test_malformed_json() {
        assert!(CapabilityPolicy::from_json(b"{\"data\": 3}", ProfileKind::Development).is_err());
    }
}
