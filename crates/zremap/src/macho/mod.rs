//! Mach-O parsing and load command editing.

pub mod inject;
pub mod load_commands;
pub mod parser;
#[cfg(test)]
pub(crate) mod testutil;

pub use inject::{compute_inject_path, inject_dylib, InjectOutcome, Injection};
pub use load_commands::{
    insert_load_dylib, parse_version, reject_if_encrypted, remove_conflicting_load_commands,
    rewrite_build_version, BuildVersionTarget, Platform,
};
pub use parser::{ArchSlice, MachOFile};

/// Whether `data` starts with a thin or fat Mach-O magic.
pub fn is_macho(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    matches!(
        u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
        0xfeedface | 0xcefaedfe | 0xfeedfacf | 0xcffaedfe | 0xcafebabe | 0xbebafeca
    )
}
