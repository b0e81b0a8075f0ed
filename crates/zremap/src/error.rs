//! Error types for zremap operations.
//!
//! This module defines the [`enum@Error`] enum covering every failure a
//! remapping run can hit: I/O, plist and archive parsing, Mach-O surgery,
//! and the invariants the patch engine enforces on identifiers.
//!
//! Not every irregular condition is an error. An identifier the registration
//! service has not confirmed is simply left out of the patch set, and a binary
//! with no addressable `.app` ancestor is skipped during injection
//! ([`crate::macho::InjectOutcome::Skipped`]). Both are logged, not returned.
//!
//! # See Also
//!
//! - [`crate::Result`] - Convenience type alias using this error

use std::path::PathBuf;
use thiserror::Error;

/// Error type for zremap operations.
///
/// All public functions in this crate return [`crate::Result<T>`], which uses this error type.
///
/// # Examples
///
/// ```no_run
/// use zremap::{Error, ZRemap};
/// use zremap::services::{AssumeRegistered, PlanOnlySigner};
///
/// let result = ZRemap::new("ZZZZZ99999")
///     .remap_bundle("Payload/App.app", &mut AssumeRegistered, &mut PlanOnlySigner);
/// match result {
///     Ok(plan) => println!("{} components ready", plan.steps.len()),
///     Err(Error::EncryptedBinary { path, .. }) => eprintln!("decrypt first: {}", path.display()),
///     Err(e) => eprintln!("Other error: {e}"),
/// }
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Property list parsing or serialization failed.
    ///
    /// Covers `Info.plist`, entitlements and provisioning data.
    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    /// ZIP archive operation failed during IPA extraction or creation.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON input (capability metadata, registered identifiers) or manifest
    /// output failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or unsupported Mach-O binary format.
    #[error("Invalid Mach-O: {0}")]
    MachO(String),

    /// The app bundle is missing a required file or key.
    #[error("Invalid bundle: {0}")]
    InvalidBundle(String),

    /// Invalid run configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An identity-bearing entitlement has the wrong shape.
    #[error("Invalid entitlements: {0}")]
    InvalidEntitlements(String),

    /// A substitution would change the length of the bytes it replaces.
    ///
    /// Applying it would shift every offset after the match and corrupt the
    /// binary, so the run aborts.
    #[error("Replacement length mismatch: {pattern} ({} bytes) -> {replacement} ({} bytes); substitutions must preserve length", .pattern.len(), .replacement.len())]
    LengthMismatch {
        /// Original identifier.
        pattern: String,
        /// Replacement that violated the length invariant.
        replacement: String,
    },

    /// A slice carries FairPlay encryption metadata with a nonzero `cryptid`.
    ///
    /// The binary has to be decrypted upstream before any modification.
    #[error("Encrypted binary: {} (slice {slice}, cryptid {cryptid}); decrypt the app before patching", .path.display())]
    EncryptedBinary {
        /// Binary that was rejected.
        path: PathBuf,
        /// Index of the encrypted architecture slice.
        slice: usize,
        /// Value of the `cryptid` field.
        cryptid: u32,
    },

    /// A dylib configured for injection does not exist.
    #[error("Dylib asset not found: {}", .0.display())]
    MissingDylibAsset(PathBuf),

    /// Not enough padding between the load commands and the first section.
    #[error("No room for a new load command in {}: need {needed} bytes, {available} available", .path.display())]
    LoadCommandSpace {
        /// Binary being modified.
        path: PathBuf,
        /// Bytes the new command needs.
        needed: usize,
        /// Bytes of padding left after the existing commands.
        available: usize,
    },

    /// The registration service failed outright.
    #[error("Registration failed: {0}")]
    Registration(String),

    /// The signing service failed for a component.
    #[error("Signing failed: {0}")]
    Signing(String),
}

impl Error {
    /// Attach a file path to errors raised while working on an in-memory image.
    pub(crate) fn with_path(self, file: impl Into<PathBuf>) -> Self {
        match self {
            Error::EncryptedBinary { slice, cryptid, .. } => Error::EncryptedBinary {
                path: file.into(),
                slice,
                cryptid,
            },
            Error::LoadCommandSpace { needed, available, .. } => Error::LoadCommandSpace {
                path: file.into(),
                needed,
                available,
            },
            other => other,
        }
    }
}
