//! Identity remapping and Mach-O patch engine for re-signing iOS apps.
//!
//! A run takes a decrypted `.app` (or `.ipa`) signed by one developer team and
//! rewrites every identity it carries (bundle IDs, app groups, iCloud
//! containers, keychain groups, team IDs) onto a new team, keeping every
//! replacement the same byte length as the original so binaries can be
//! patched in place. Identifiers only reach the binaries once the
//! registration service has confirmed them.
//!
//! # Example
//!
//! ```no_run
//! use zremap::ZRemap;
//! use zremap::services::{AssumeRegistered, PlanOnlySigner};
//!
//! let plan = ZRemap::new("ZZZZZ99999")
//!     .remap_bundle("Payload/App.app", &mut AssumeRegistered, &mut PlanOnlySigner)?;
//! for step in &plan.steps {
//!     println!("{} -> {}", step.component.bundle_id, step.bundle_id);
//! }
//! # Ok::<(), zremap::Error>(())
//! ```

pub mod builder;
pub mod bundle;
pub mod capabilities;
pub mod codesign;
pub mod error;
pub mod ipa;
pub mod macho;
pub mod manifest;
pub mod mapping;
pub mod orchestrator;
pub mod patch;
pub mod services;

pub use builder::ZRemap;
pub use bundle::{AppComponent, BundleInspector, ComponentKind};
pub use error::Error;
pub use ipa::{create_ipa, extract_ipa, validate_ipa, CompressionLevel};
pub use mapping::{IdentifierKind, MappingRegistry, RemapPolicy};
pub use orchestrator::{Orchestrator, RunOptions, SigningPlan};
pub use patch::{apply_patch_set, PatchEntry, PatchSet};

pub type Result<T> = std::result::Result<T, Error>;
