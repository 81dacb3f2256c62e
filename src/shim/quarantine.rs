//! Reversible archive for soft-deleted paths.
//!
//! Layout: `<root>/<session-id>/<entry-id>` holds the moved file or tree and
//! `<root>/<session-id>/manifest.json` records where each entry came from.

use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const MANIFEST: &str = "manifest.json";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrashEntry {
    pub id: String,
    pub original_path: PathBuf,
    pub archived_path: PathBuf,
    pub deleted_at_ms: u64,
    pub is_dir: bool,
    pub restored: bool,
}

pub struct Quarantine {
    root: PathBuf,
    manifest_lock: Mutex<()>,
}

impl Quarantine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            manifest_lock: Mutex::new(()),
        }
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        if session_id.is_empty()
            || !session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(anyhow!("invalid session id for quarantine: {}", session_id));
        }
        Ok(self.root.join(session_id))
    }

    fn read_manifest(dir: &Path) -> Result<Vec<TrashEntry>> {
        let path = dir.join(MANIFEST);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("corrupt manifest {}", path.display()))
    }

    fn write_manifest(dir: &Path, entries: &[TrashEntry]) -> Result<()> {
        let path = dir.join(MANIFEST);
        let tmp = dir.join(format!("{}.tmp", MANIFEST));
        fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Moves `path` into the session's archive instead of deleting it. The
    /// manifest entry is written before the move and withdrawn if the move
    /// fails, so an archived path always has an entry.
    pub fn archive(&self, session_id: &str, path: &Path) -> Result<TrashEntry> {
        let dir = self.session_dir(session_id)?;
        let meta = fs::symlink_metadata(path)
            .with_context(|| format!("nothing to archive at {}", path.display()))?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create quarantine {}", dir.display()))?;

        let mut bytes = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut bytes);
        let base = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string());
        let id = format!("{}-{}", hex::encode(bytes), base);
        let archived_path = dir.join(&id);

        let entry = TrashEntry {
            id,
            original_path: path.to_path_buf(),
            archived_path,
            deleted_at_ms: crate::now_ms(),
            is_dir: meta.is_dir(),
            restored: false,
        };
        let _guard = self.manifest_lock.lock();
        let mut entries = Self::read_manifest(&dir)?;
        entries.push(entry.clone());
        Self::write_manifest(&dir, &entries)?;

        if let Err(err) = move_path(path, &entry.archived_path) {
            entries.pop();
            if let Err(rollback) = Self::write_manifest(&dir, &entries) {
                log::error!(
                    "failed to withdraw quarantine entry {}: {:#}",
                    entry.id,
                    rollback
                );
            }
            return Err(err);
        }
        log::info!(
            "archived {} to {}",
            entry.original_path.display(),
            entry.archived_path.display()
        );
        Ok(entry)
    }

    pub fn list(&self, session_id: &str) -> Result<Vec<TrashEntry>> {
        let dir = self.session_dir(session_id)?;
        let _guard = self.manifest_lock.lock();
        Self::read_manifest(&dir)
    }

    /// Moves an archived entry back. Refuses to overwrite anything that now
    /// occupies the original location.
    pub fn restore(&self, session_id: &str, entry_id: &str) -> Result<TrashEntry> {
        let dir = self.session_dir(session_id)?;
        let _guard = self.manifest_lock.lock();
        let mut entries = Self::read_manifest(&dir)?;
        let entry = entries
            .iter_mut()
            .find(|entry| entry.id == entry_id)
            .ok_or_else(|| anyhow!("no quarantine entry {} in {}", entry_id, session_id))?;
        if entry.restored {
            return Err(anyhow!("entry {} was already restored", entry_id));
        }
        if fs::symlink_metadata(&entry.original_path).is_ok() {
            return Err(anyhow!(
                "{} exists; refusing to overwrite",
                entry.original_path.display()
            ));
        }
        if let Some(parent) = entry.original_path.parent() {
            fs::create_dir_all(parent)?;
        }
        move_path(&entry.archived_path, &entry.original_path)?;
        entry.restored = true;
        let restored = entry.clone();
        Self::write_manifest(&dir, &entries)?;
        log::info!("restored {}", restored.original_path.display());
        Ok(restored)
    }
}

/// Rename, falling back to copy-and-remove across filesystems.
fn move_path(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(EXDEV) => {
            copy_recursive(from, to)?;
            let meta = fs::symlink_metadata(from)?;
            if meta.is_dir() {
                fs::remove_dir_all(from)?;
            } else {
                fs::remove_file(from)?;
            }
            Ok(())
        }
        Err(err) => Err(anyhow!(err)).with_context(|| {
            format!("failed to move {} to {}", from.display(), to.display())
        }),
    }
}

#[cfg(target_os = "linux")]
const EXDEV: i32 = libc::EXDEV;
#[cfg(not(target_os = "linux"))]
const EXDEV: i32 = 18;

fn copy_recursive(from: &Path, to: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(from)?;
    if meta.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        fs::copy(from, to)
            .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archived_file_can_be_restored() {
        let workspace = tempfile::tempdir().unwrap();
        let trash = tempfile::tempdir().unwrap();
        let file = workspace.path().join("data.txt");
        fs::write(&file, b"important").unwrap();

        let quarantine = Quarantine::new(trash.path());
        let entry = quarantine.archive("session-1", &file).unwrap();
        assert!(!file.exists());
        assert_eq!(fs::read(&entry.archived_path).unwrap(), b"important");
        assert_eq!(quarantine.list("session-1").unwrap().len(), 1);

        let restored = quarantine.restore("session-1", &entry.id).unwrap();
        assert!(restored.restored);
        assert_eq!(fs::read(&file).unwrap(), b"important");
        assert!(quarantine.restore("session-1", &entry.id).is_err());
    }

    #[test]
    fn restore_refuses_to_overwrite() {
        let workspace = tempfile::tempdir().unwrap();
        let trash = tempfile::tempdir().unwrap();
        let file = workspace.path().join("data.txt");
        fs::write(&file, b"old").unwrap();
        let quarantine = Quarantine::new(trash.path());
        let entry = quarantine.archive("s", &file).unwrap();
        fs::write(&file, b"new").unwrap();
        assert!(quarantine.restore("s", &entry.id).is_err());
        assert_eq!(fs::read(&file).unwrap(), b"new");
    }

    #[test]
    fn directories_are_archived_whole() {
        let workspace = tempfile::tempdir().unwrap();
        let trash = tempfile::tempdir().unwrap();
        let dir = workspace.path().join("build");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("nested/out.o"), b"x").unwrap();
        let quarantine = Quarantine::new(trash.path());
        let entry = quarantine.archive("s", &dir).unwrap();
        assert!(entry.is_dir);
        assert!(entry.archived_path.join("nested/out.o").exists());

        let other = workspace.path().join("other.txt");
        fs::write(&other, b"y").unwrap();
        assert!(quarantine.archive("../escape", &other).is_err());
        assert!(other.exists());
    }

    #[test]
    fn unreadable_manifest_leaves_the_file_in_place() {
        let workspace = tempfile::tempdir().unwrap();
        let trash = tempfile::tempdir().unwrap();
        let file = workspace.path().join("data.txt");
        fs::write(&file, b"keep").unwrap();
        fs::create_dir_all(trash.path().join("s")).unwrap();
        fs::write(trash.path().join("s").join(MANIFEST), b"not json").unwrap();

        let quarantine = Quarantine::new(trash.path());
        assert!(quarantine.archive("s", &file).is_err());
        assert_eq!(fs::read(&file).unwrap(), b"keep");
    }

    #[test]
    fn failed_move_withdraws_the_manifest_entry() {
        let workspace = tempfile::tempdir().unwrap();
        // Renaming a directory into its own subtree fails.
        let quarantine = Quarantine::new(workspace.path().join("trash"));
        assert!(quarantine.archive("s", workspace.path()).is_err());
        assert!(workspace.path().exists());
        assert!(quarantine.list("s").unwrap().is_empty());
    }
}
