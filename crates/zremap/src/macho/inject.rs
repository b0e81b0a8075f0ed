//! Dylib injection into a single binary.
//!
//! One injection runs through fixed stages over an in-memory image:
//! encryption check on every slice, removal of conflicting load commands,
//! computation of the `@loader_path` reference, and finally insertion. A
//! binary with no `.app` ancestor is skipped after conflicts are removed.

use super::load_commands::{insert_load_dylib, reject_if_encrypted, remove_conflicting_load_commands};
use crate::Result;
use log::{debug, info, warn};
use std::path::{Component, Path, PathBuf};

/// Result of injecting into one binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectOutcome {
    /// The load command is present in every slice.
    Injected {
        load_path: String,
        /// Slices that gained the command; zero when it was already there.
        slices_changed: usize,
        removed: usize,
    },
    /// No `.app` ancestor to anchor an `@loader_path` reference.
    Skipped { removed: usize },
}

/// Injection request for one binary.
#[derive(Debug, Clone, Copy)]
pub struct Injection<'a> {
    /// Binary being modified.
    pub binary_path: &'a Path,
    /// Root of the bundle being processed.
    pub bundle_root: &'a Path,
    /// File name of the dylib inside `<app>/Frameworks/`.
    pub dylib_name: &'a str,
    /// Substrings of load paths to strip before injecting.
    pub conflicting: &'a [String],
}

/// Run one injection over `data`. The buffer keeps its length.
pub fn inject_dylib(data: &mut [u8], request: Injection<'_>) -> Result<InjectOutcome> {
    reject_if_encrypted(data)?;

    let removed = remove_conflicting_load_commands(data, request.conflicting)?;

    let Some(load_path) =
        compute_inject_path(request.binary_path, request.bundle_root, request.dylib_name)
    else {
        warn!(
            "{}: no .app ancestor, skipping injection of {}",
            request.binary_path.display(),
            request.dylib_name
        );
        return Ok(InjectOutcome::Skipped { removed });
    };

    let slices_changed = insert_load_dylib(data, &load_path)?;
    if slices_changed > 0 {
        info!("{}: linked {}", request.binary_path.display(), load_path);
    } else {
        debug!("{}: {} already linked", request.binary_path.display(), load_path);
    }

    Ok(InjectOutcome::Injected {
        load_path,
        slices_changed,
        removed,
    })
}

/// `@loader_path` reference from `binary_path` to `Frameworks/<dylib_name>`
/// of its app.
///
/// The app is `bundle_root` when it is a `.app` containing the binary,
/// otherwise the outermost `.app` directory among the binary's ancestors.
/// Returns `None` when there is no such directory.
pub fn compute_inject_path(binary_path: &Path, bundle_root: &Path, dylib_name: &str) -> Option<String> {
    let binary_dir = binary_path.parent()?;
    let app_root = app_root_for(binary_dir, bundle_root)?;
    let relative = binary_dir.strip_prefix(&app_root).ok()?;

    let hops = relative
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count();

    let mut path = String::from("@loader_path/");
    for _ in 0..hops {
        path.push_str("../");
    }
    path.push_str("Frameworks/");
    path.push_str(dylib_name);
    Some(path)
}

fn app_root_for(dir: &Path, bundle_root: &Path) -> Option<PathBuf> {
    if is_app_dir(bundle_root) && dir.starts_with(bundle_root) {
        return Some(bundle_root.to_path_buf());
    }

    let mut current = PathBuf::new();
    for component in dir.components() {
        current.push(component);
        if is_app_dir(&current) {
            return Some(current);
        }
    }
    None
}

fn is_app_dir(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "app")
}
