//! IPA repacking.
//!
//! Wraps a `.app` directory in `Payload/` inside a ZIP archive, keeping Unix
//! modes and symlinks.

use crate::{Error, Result};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Deflate level for repacked archives, 0 (stored) to 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    pub const NONE: CompressionLevel = CompressionLevel(0);
    pub const DEFAULT: CompressionLevel = CompressionLevel(6);
    pub const MAX: CompressionLevel = CompressionLevel(9);

    /// Levels above 9 are clamped.
    #[must_use]
    pub fn new(level: u32) -> Self {
        CompressionLevel(level.min(9))
    }

    #[must_use]
    pub fn level(&self) -> u32 {
        self.0
    }

    fn options(self) -> SimpleFileOptions {
        if self.0 == 0 {
            SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
        } else {
            SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(i64::from(self.0)))
        }
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<u32> for CompressionLevel {
    fn from(level: u32) -> Self {
        CompressionLevel::new(level)
    }
}

/// Write `app_bundle` to `output` as `Payload/<name>.app/...`.
pub fn create_ipa(
    app_bundle: impl AsRef<Path>,
    output: impl AsRef<Path>,
    level: CompressionLevel,
) -> Result<()> {
    let app_bundle = app_bundle.as_ref();
    let output = output.as_ref();

    if !app_bundle.is_dir() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("app bundle not found: {}", app_bundle.display()),
        )));
    }
    let app_name = app_bundle
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::InvalidBundle(format!("{} has no file name", app_bundle.display())))?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    let options = level.options();
    let mut zip = ZipWriter::new(File::create(output)?);
    zip.add_directory("Payload/", options)?;

    for entry in WalkDir::new(app_bundle).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(io::Error::other(e.to_string())))?;
        let relative = entry.path().strip_prefix(app_bundle).unwrap_or(entry.path());
        let mut name = format!("Payload/{app_name}");
        for part in relative.iter() {
            name.push('/');
            name.push_str(&part.to_string_lossy());
        }

        let file_type = entry.file_type();
        if file_type.is_dir() {
            zip.add_directory(format!("{name}/"), options)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            zip.add_symlink(name, target.to_string_lossy(), options)?;
        } else {
            zip.start_file(name, file_options(entry.path(), options)?)?;
            zip.write_all(&fs::read(entry.path())?)?;
        }
    }

    zip.finish()?;
    Ok(())
}

#[cfg(unix)]
fn file_options(path: &Path, options: SimpleFileOptions) -> Result<SimpleFileOptions> {
    use std::os::unix::fs::PermissionsExt;
    Ok(options.unix_permissions(fs::metadata(path)?.permissions().mode()))
}

#[cfg(not(unix))]
fn file_options(_path: &Path, options: SimpleFileOptions) -> Result<SimpleFileOptions> {
    Ok(options)
}
