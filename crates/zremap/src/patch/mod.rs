//! Literal byte patching.
//!
//! A [`PatchSet`] is an ordered list of same-length substitutions. Applying
//! it never changes the size of the buffer, which is what keeps Mach-O
//! offsets, plist object tables and string tables valid after patching.

pub mod plist;

use crate::{Error, Result};
use log::debug;

/// One substitution. `pattern` and `replacement` must have equal length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchEntry {
    pub pattern: Vec<u8>,
    pub replacement: Vec<u8>,
}

impl PatchEntry {
    pub fn new(pattern: impl Into<Vec<u8>>, replacement: impl Into<Vec<u8>>) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }

    fn check(&self) -> Result<()> {
        if self.pattern.len() != self.replacement.len() {
            return Err(Error::LengthMismatch {
                pattern: String::from_utf8_lossy(&self.pattern).into_owned(),
                replacement: String::from_utf8_lossy(&self.replacement).into_owned(),
            });
        }
        Ok(())
    }
}

/// Ordered substitutions, longest pattern first.
///
/// Longest-first ordering keeps a short identifier from clobbering the
/// prefix of a longer one before the longer one gets its own replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSet {
    entries: Vec<PatchEntry>,
}

impl PatchSet {
    /// Validate and order `entries`.
    ///
    /// Ties keep their input order.
    pub fn new(mut entries: Vec<PatchEntry>) -> Result<Self> {
        for entry in &entries {
            entry.check()?;
        }
        entries.sort_by(|a, b| b.pattern.len().cmp(&a.pattern.len()));
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[PatchEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PatchEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Apply every entry of `set` to `target` in place.
///
/// Each entry scans left to right for non-overlapping occurrences. Later
/// entries see the output of earlier ones. Returns the total number of
/// replacements. All entries are checked before any byte is written, so a
/// length violation leaves `target` untouched.
pub fn apply_patch_set(set: &PatchSet, target: &mut [u8]) -> Result<usize> {
    for entry in set.iter() {
        entry.check()?;
    }

    let mut total = 0;
    for entry in set.iter() {
        let count = replace_all(target, &entry.pattern, &entry.replacement);
        if count > 0 {
            debug!(
                "replaced {} x {} -> {}",
                count,
                String::from_utf8_lossy(&entry.pattern),
                String::from_utf8_lossy(&entry.replacement)
            );
        }
        total += count;
    }
    Ok(total)
}

fn replace_all(target: &mut [u8], pattern: &[u8], replacement: &[u8]) -> usize {
    if pattern.is_empty() || pattern.len() > target.len() {
        return 0;
    }

    let mut count = 0;
    let mut pos = 0;
    while pos + pattern.len() <= target.len() {
        if &target[pos..pos + pattern.len()] == pattern {
            target[pos..pos + pattern.len()].copy_from_slice(replacement);
            pos += pattern.len();
            count += 1;
        } else {
            pos += 1;
        }
    }
    count
}
