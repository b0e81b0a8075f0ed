//! IPA extraction.

use crate::{Error, Result};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use zip::result::ZipError;
use zip::ZipArchive;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Check that `ipa_path` exists and starts with a ZIP signature.
pub fn validate_ipa(ipa_path: impl AsRef<Path>) -> Result<()> {
    let ipa_path = ipa_path.as_ref();
    let mut magic = [0u8; 2];
    File::open(ipa_path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map_err(|e| {
            Error::Io(io::Error::new(
                e.kind(),
                format!("cannot read IPA {}: {e}", ipa_path.display()),
            ))
        })?;
    if &magic != b"PK" {
        return Err(Error::Zip(ZipError::InvalidArchive("not a ZIP/IPA file".into())));
    }
    Ok(())
}

/// Extract `ipa_path` into `dest_dir` and return the `Payload/*.app` path.
///
/// Entries escaping `dest_dir` are skipped. Unix modes and symlinks are
/// restored.
pub fn extract_ipa(ipa_path: impl AsRef<Path>, dest_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let dest_dir = dest_dir.as_ref();
    validate_ipa(&ipa_path)?;

    let mut archive = ZipArchive::new(File::open(ipa_path.as_ref())?)?;
    fs::create_dir_all(dest_dir)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let out = dest_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }

        let mode = entry.unix_mode();
        if mode.map_or(false, |m| m & S_IFMT == S_IFLNK) {
            let mut target = String::new();
            entry.read_to_string(&mut target)?;
            write_symlink(&target, &out)?;
            continue;
        }

        let mut file = File::create(&out)?;
        io::copy(&mut entry, &mut file)?;
        set_mode(&out, mode)?;
    }

    find_app_bundle(dest_dir)
}

/// First `.app` directory inside `<dir>/Payload`.
pub fn find_app_bundle(dir: impl AsRef<Path>) -> Result<PathBuf> {
    let payload = dir.as_ref().join("Payload");
    if !payload.is_dir() {
        return Err(Error::Zip(ZipError::InvalidArchive("no Payload directory in IPA".into())));
    }

    let mut apps: Vec<PathBuf> = fs::read_dir(&payload)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && p.extension().map_or(false, |ext| ext == "app"))
        .collect();
    apps.sort();
    apps.into_iter()
        .next()
        .ok_or(Error::Zip(ZipError::InvalidArchive("no .app bundle in Payload/".into())))
}

#[cfg(unix)]
fn write_symlink(target: &str, link: &Path) -> Result<()> {
    if link.symlink_metadata().is_ok() {
        fs::remove_file(link)?;
    }
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_symlink(target: &str, link: &Path) -> Result<()> {
    fs::write(link, target)?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}
