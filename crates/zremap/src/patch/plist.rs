//! Structured Info.plist remapping.
//!
//! Identity keys are rewritten through the registry first; the serialized
//! result then goes through the literal patch set so identifiers embedded in
//! free-form values (URL schemes, activity types) move with the rest. The
//! file is written once, in the format it was read in.

use super::{apply_patch_set, PatchSet};
use crate::mapping::{IdentifierKind, MappingRegistry};
use crate::{Error, Result};
use log::{debug, info};
use plist::Value;
use std::fs;
use std::io;
use std::path::Path;

pub const BUNDLE_IDENTIFIER_KEY: &str = "CFBundleIdentifier";

/// Identifier-bearing Info.plist keys remapped besides the bundle ID.
const REMAPPED_KEYS: [(&str, IdentifierKind); 3] = [
    ("com.apple.security.application-groups", IdentifierKind::AppGroup),
    ("keychain-access-groups", IdentifierKind::Keychain),
    ("com.apple.developer.icloud-container-identifiers", IdentifierKind::ICloud),
];

const BINARY_PLIST_MAGIC: &[u8] = b"bplist";

/// Result of remapping one Info.plist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoPlistOutcome {
    /// `CFBundleIdentifier` after remapping, if the key exists.
    pub bundle_id: Option<String>,
    /// Literal replacements applied to the serialized plist.
    pub replacements: usize,
}

/// Remap the identity keys of the Info.plist at `path`, then literal-patch it.
///
/// `CFBundleIdentifier` keeps its original value when it classifies as a
/// bundle ID and the registry preserves the main bundle ID.
pub fn remap_info_plist(
    path: &Path,
    registry: &mut MappingRegistry,
    patch_set: Option<&PatchSet>,
) -> Result<InfoPlistOutcome> {
    let data = fs::read(path)?;
    let binary = data.starts_with(BINARY_PLIST_MAGIC);
    let mut value: Value = plist::from_bytes(&data)?;

    let dict = value.as_dictionary_mut().ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is not a dictionary", path.display()),
        ))
    })?;

    let mut bundle_id = None;
    if let Some(original) = dict.get(BUNDLE_IDENTIFIER_KEY).and_then(Value::as_string) {
        let original = original.to_string();
        let kind = registry.classify(&original, None);
        let resolved = if kind == IdentifierKind::Bundle && registry.policy().preserve_main_bundle_id {
            info!("keeping bundle identifier {original}");
            original
        } else {
            let resolved = registry.resolve(&original, kind);
            debug!("bundle identifier {original} -> {resolved}");
            resolved
        };
        dict.insert(BUNDLE_IDENTIFIER_KEY.to_string(), Value::String(resolved.clone()));
        bundle_id = Some(resolved);
    }

    for (key, kind) in REMAPPED_KEYS {
        let remapped = match dict.get(key) {
            Some(Value::String(id)) => Some(Value::Array(vec![Value::String(registry.resolve(id, kind))])),
            Some(Value::Array(items)) => Some(Value::Array(
                items
                    .iter()
                    .map(|item| match item.as_string() {
                        Some(id) => Value::String(registry.resolve(id, kind)),
                        None => item.clone(),
                    })
                    .collect(),
            )),
            _ => None,
        };
        if let Some(remapped) = remapped {
            dict.insert(key.to_string(), remapped);
        }
    }

    let mut out = serialize(&value, binary, data.len())?;

    let replacements = match patch_set {
        Some(set) => apply_patch_set(set, &mut out)?,
        None => 0,
    };
    if replacements > 0 {
        info!("{}: {} replacement(s)", path.display(), replacements);
        if let Some(resolved) = &bundle_id {
            out = restore_bundle_id(out, resolved, binary)?;
        }
    }

    fs::write(path, &out)?;
    Ok(InfoPlistOutcome {
        bundle_id,
        replacements,
    })
}

fn serialize(value: &Value, binary: bool, capacity: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(capacity);
    if binary {
        plist::to_writer_binary(&mut out, value)?;
    } else {
        plist::to_writer_xml(&mut out, value)?;
    }
    Ok(out)
}

/// Put `resolved` back as `CFBundleIdentifier` if the literal pass changed it.
///
/// The resolved ID is what gets registered and what `application-identifier`
/// is built from, so the shipped Info.plist must carry it too.
fn restore_bundle_id(out: Vec<u8>, resolved: &str, binary: bool) -> Result<Vec<u8>> {
    let mut value: Value = plist::from_bytes(&out)?;
    let Some(dict) = value.as_dictionary_mut() else {
        return Ok(out);
    };
    if dict.get(BUNDLE_IDENTIFIER_KEY).and_then(Value::as_string) == Some(resolved) {
        return Ok(out);
    }
    debug!("literal pass rewrote {BUNDLE_IDENTIFIER_KEY}; restoring {resolved}");
    dict.insert(BUNDLE_IDENTIFIER_KEY.to_string(), Value::String(resolved.to_string()));
    serialize(&value, binary, out.len())
}
