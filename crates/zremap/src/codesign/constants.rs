//! Apple code signature magic numbers and slot types used when reading an
//! embedded signature.

// =============================================================================
// Blob Magic Numbers
// =============================================================================

/// SuperBlob containing all signature components (embedded signature)
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;

/// CodeDirectory blob magic
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;

/// Embedded entitlements (XML plist format)
pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade7171;

/// Embedded DER entitlements (ASN.1 DER format)
pub const CSMAGIC_EMBEDDED_DER_ENTITLEMENTS: u32 = 0xfade7172;

// =============================================================================
// Slot Types (for SuperBlob index)
// =============================================================================

/// Main code directory slot
pub const CSSLOT_CODEDIRECTORY: u32 = 0x0000;

/// Entitlements slot (XML plist)
pub const CSSLOT_ENTITLEMENTS: u32 = 0x0005;

/// DER entitlements slot
pub const CSSLOT_DER_ENTITLEMENTS: u32 = 0x0007;
