//! Identifier remapping: classification, generation and the run registry.

pub mod entitlements;
pub mod generator;
pub mod kind;
pub mod registry;

pub use entitlements::{remap_entitlements, EntitlementOptions, Entitlements, ProfileKind};
pub use generator::{deterministic_segment, IdGenerator};
pub use kind::{classify_shape, Classifier, IdentifierKind};
pub use registry::{filter_preserving_identity, IdentifierMapping, MappingRegistry, RemapPolicy, APPLE_TOKEN};
