//! IPA handling.
//!
//! Extraction to a working directory, App Store leftover cleanup, and
//! repacking once the bundle has been remapped.

pub mod archive;
pub mod extract;

pub use archive::{create_ipa, CompressionLevel};
pub use extract::{extract_ipa, find_app_bundle, validate_ipa};

use crate::Result;
use log::warn;
use std::fs;
use std::path::Path;

/// App Store FairPlay metadata directory.
pub const SC_INFO_DIR: &str = "SC_Info";

/// Remove App Store DRM leftovers from `app_root`.
///
/// `SC_Info` only makes sense next to an encrypted executable; a bundle that
/// is about to be re-signed must not carry it. Returns whether anything was
/// removed.
pub fn strip_drm_leftovers(app_root: &Path) -> Result<bool> {
    let sc_info = app_root.join(SC_INFO_DIR);
    if !sc_info.is_dir() {
        return Ok(false);
    }
    warn!(
        "removing App Store DRM metadata {}; the executable must already be decrypted",
        sc_info.display()
    );
    fs::remove_dir_all(&sc_info)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_strip_drm_leftovers() {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("Demo.app");
        fs::create_dir_all(app.join(SC_INFO_DIR)).unwrap();
        fs::write(app.join("SC_Info/Demo.sinf"), b"sinf").unwrap();

        assert!(strip_drm_leftovers(&app).unwrap());
        assert!(!app.join(SC_INFO_DIR).exists());
        assert!(!strip_drm_leftovers(&app).unwrap());
    }

    #[test]
    fn test_extract_then_repack() {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("src/Demo.app");
        fs::create_dir_all(&app).unwrap();
        fs::write(app.join("Demo"), b"bin").unwrap();
        fs::write(app.join("Info.plist"), b"<plist/>").unwrap();

        let ipa = dir.path().join("Demo.ipa");
        create_ipa(&app, &ipa, CompressionLevel::DEFAULT).unwrap();
        validate_ipa(&ipa).unwrap();

        let extracted = extract_ipa(&ipa, dir.path().join("work")).unwrap();
        assert_eq!(extracted.file_name().unwrap(), "Demo.app");
        assert_eq!(fs::read(extracted.join("Demo")).unwrap(), b"bin");
    }
}
