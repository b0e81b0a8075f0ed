//! Reading embedded code signatures.
//!
//! Only the read side is implemented: locating the SuperBlob referenced by
//! `LC_CODE_SIGNATURE` and pulling the XML entitlements out of it. Producing
//! signatures is the signing service's job.

pub mod constants;
pub mod superblob;

pub use superblob::{embedded_entitlements, SuperBlob};
