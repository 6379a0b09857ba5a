//! Path helpers for configured locations.

use std::path::{Path, PathBuf};

/// Expand a leading `~` to the home directory.
///
/// Only `~` and `~/...` are expanded; `~user` forms are returned unchanged,
/// as is everything when no home directory is known.
///
/// # Example
/// ```ignore
/// let root = expand_home("~/.vault/store");
/// assert!(root.is_absolute());
/// ```
pub fn expand_home(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}
