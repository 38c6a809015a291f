use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Normalizes a `path` attribute into a directory relative to the save root.
///
/// - `.` components are dropped
/// - a leading `/` (or Windows prefix) is re-rooted under the save root,
///   and `..` at that root stays at the root
/// - `..` that would climb above a relative start is rejected
pub fn clean_relative_dir(raw: &str) -> Result<PathBuf, TransferError> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    let mut rooted = false;

    for component in Path::new(raw).components() {
        match component {
            Component::Prefix(_) | Component::RootDir => rooted = true,
            Component::CurDir => {}
            Component::ParentDir if depth > 0 => {
                out.pop();
                depth -= 1;
            }
            Component::ParentDir if rooted => {}
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {raw}"
                )));
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
        }
    }
    Ok(out)
}

/// Returns `true` if a relative symlink `target` placed in `dir` resolves to
/// somewhere inside the save root.
///
/// `dir` is a directory already cleaned by [`clean_relative_dir`]. Absolute
/// targets never qualify.
pub fn link_stays_inside(dir: &Path, target: &str) -> bool {
    if target.is_empty() || target.starts_with('/') || Path::new(target).is_absolute() {
        return false;
    }

    let mut depth = dir
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count();
    for component in Path::new(target).components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir if depth == 0 => return false,
            Component::ParentDir => depth -= 1,
            Component::CurDir => {}
            Component::Prefix(_) | Component::RootDir => return false,
        }
    }
    true
}
