//! Change applier: writes whole-file changes into the working tree.
//!
//! Every path is checked before the first write, so a plan with one escaping
//! path leaves the tree untouched.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::errors::PilotError;
use crate::plan::FileChange;

/// Writes plan changes under a fixed root.
pub struct ChangeApplier {
    root: PathBuf,
}

impl ChangeApplier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Apply `changes` in order. Later entries for the same path win.
    ///
    /// Returns the distinct files written.
    pub fn apply(&self, changes: &[FileChange]) -> Result<Vec<PathBuf>, PilotError> {
        let canon_root = self
            .root
            .canonicalize()
            .map_err(|e| PilotError::apply(self.root.display().to_string(), e.to_string()))?;

        let targets = changes
            .iter()
            .map(|change| resolve_within(&canon_root, &change.path))
            .collect::<Result<Vec<_>, _>>()?;

        let mut written = BTreeSet::new();
        for (change, target) in changes.iter().zip(targets) {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PilotError::apply(&change.path, e.to_string()))?;
            }
            std::fs::write(&target, &change.content)
                .map_err(|e| PilotError::apply(&change.path, e.to_string()))?;
            debug!(path = %change.path, bytes = change.content.len(), "Wrote file");
            written.insert(target);
        }

        info!(files = written.len(), entries = changes.len(), "Applied changes");
        Ok(written.into_iter().collect())
    }
}

/// Resolve `relative` under `canon_root` (already canonical).
///
/// `..` is folded lexically and may not climb above the root. Any `.git`
/// component is refused: git metadata is not part of the working tree.
/// Then the deepest existing ancestor is canonicalized, which catches
/// symlinks that point out of the tree.
pub fn resolve_within(canon_root: &Path, relative: &str) -> Result<PathBuf, PilotError> {
    let escape = |why: &str| PilotError::apply(relative, why);

    let mut folded = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => folded.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !folded.pop() {
                    return Err(escape("escapes the working tree"));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(escape("absolute paths are not allowed"));
            }
        }
    }
    if folded.as_os_str().is_empty() {
        return Err(escape("does not name a file"));
    }
    if folded
        .components()
        .any(|c| c.as_os_str().eq_ignore_ascii_case(".git"))
    {
        return Err(escape("writes into git metadata are not allowed"));
    }

    let candidate = canon_root.join(&folded);
    let mut probe = Some(candidate.as_path());
    while let Some(current) = probe {
        if current.symlink_metadata().is_ok() {
            let canon = current
                .canonicalize()
                .map_err(|e| escape(&format!("cannot resolve: {e}")))?;
            if !canon.starts_with(canon_root) {
                return Err(escape("resolves outside the working tree"));
            }
            break;
        }
        probe = current.parent();
    }

    Ok(candidate)
}
