//! Filesystem primitives used by the provisioning steps
//!
//! Every operation compares current state before mutating and reports what it
//! did, so re-running a step on a converged host changes nothing.
//!
//! Destinations are inspected without following symlinks. The data directory
//! belongs to the service account, so a link planted there must never redirect
//! a write or a chmod made as root.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use crate::error::FilesystemError;

/// What an ensure-style operation did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
    /// Left as found on purpose (e.g. an administrator-edited config)
    Preserved,
    Skipped,
}

impl Outcome {
    /// Combine the outcomes of two sub-operations, keeping the most significant
    pub fn merge(self, other: Outcome) -> Outcome {
        fn rank(o: Outcome) -> u8 {
            match o {
                Outcome::Skipped => 0,
                Outcome::Unchanged => 1,
                Outcome::Preserved => 2,
                Outcome::Updated => 3,
                Outcome::Created => 4,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Unchanged => "unchanged",
            Outcome::Preserved => "preserved",
            Outcome::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Permission bits of a file, without the file type
pub fn mode_of(meta: &fs::Metadata) -> u32 {
    meta.permissions().mode() & 0o7777
}

/// Look up metadata of `path` itself (not a symlink's target), mapping "not found" to `None`
pub fn metadata(path: &Path) -> Result<Option<fs::Metadata>, FilesystemError> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FilesystemError::io("inspect", path, e)),
    }
}

pub fn set_mode(path: &Path, mode: u32) -> Result<(), FilesystemError> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| FilesystemError::io("set permissions on", path, e))
}

/// Create `path` (and parents) with `mode`, or fix the mode of an existing directory.
pub fn ensure_dir(path: &Path, mode: u32) -> Result<Outcome, FilesystemError> {
    match metadata(path)? {
        Some(meta) if meta.is_dir() => {
            if mode_of(&meta) == mode {
                return Ok(Outcome::Unchanged);
            }
            set_mode(path, mode)?;
            Ok(Outcome::Updated)
        }
        Some(_) => Err(FilesystemError::PathConflict {
            path: path.to_path_buf(),
            expected: "directory",
        }),
        None => {
            fs::create_dir_all(path).map_err(|e| FilesystemError::io("create directory", path, e))?;
            set_mode(path, mode)?;
            Ok(Outcome::Created)
        }
    }
}

/// Set owner and group, skipping the call when they already match.
pub fn set_owner(path: &Path, uid: u32, gid: u32) -> Result<Outcome, FilesystemError> {
    let meta = fs::symlink_metadata(path).map_err(|e| FilesystemError::io("inspect", path, e))?;
    if meta.file_type().is_symlink() {
        return Err(FilesystemError::PathConflict {
            path: path.to_path_buf(),
            expected: "directory or file",
        });
    }
    if meta.uid() == uid && meta.gid() == gid {
        return Ok(Outcome::Unchanged);
    }

    std::os::unix::fs::chown(path, Some(uid), Some(gid))
        .map_err(|e| FilesystemError::io("change ownership of", path, e))?;
    Ok(Outcome::Updated)
}

/// SHA-256 of a file's contents
pub fn file_digest(path: &Path) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}

/// True when both files hold identical bytes
pub fn same_content(a: &Path, b: &Path) -> Result<bool, FilesystemError> {
    let len = |p: &Path| {
        fs::metadata(p)
            .map(|m| m.len())
            .map_err(|e| FilesystemError::io("inspect", p, e))
    };
    if len(a)? != len(b)? {
        return Ok(false);
    }

    let digest = |p: &Path| file_digest(p).map_err(|e| FilesystemError::io("read", p, e));
    Ok(digest(a)? == digest(b)?)
}

/// Counters for a recursive copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CopyStats {
    pub copied: usize,
    pub unchanged: usize,
    pub dirs_created: usize,
}

impl CopyStats {
    pub fn outcome(&self) -> Outcome {
        if self.copied > 0 || self.dirs_created > 0 {
            Outcome::Updated
        } else {
            Outcome::Unchanged
        }
    }
}

/// Recursively copy `src` to `dest`, skipping files whose content already matches.
///
/// Symlinks in `src` are followed; symlinks under `dest` are never written
/// through. A linked destination directory is a conflict and a linked
/// destination file is replaced by a regular one. Anything that is neither a
/// regular file nor a directory is ignored.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<CopyStats, FilesystemError> {
    let mut stats = CopyStats::default();
    copy_dir(src, dest, &mut stats)?;
    Ok(stats)
}

fn copy_dir(src: &Path, dest: &Path, stats: &mut CopyStats) -> Result<(), FilesystemError> {
    match metadata(dest)? {
        Some(meta) if meta.is_dir() => {}
        Some(_) => {
            return Err(FilesystemError::PathConflict {
                path: dest.to_path_buf(),
                expected: "directory",
            })
        }
        None => {
            fs::create_dir(dest).map_err(|e| FilesystemError::io("create directory", dest, e))?;
            stats.dirs_created += 1;
        }
    }

    for entry in sorted_entries(src)? {
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let meta = fs::metadata(&from).map_err(|e| FilesystemError::io("inspect", &from, e))?;

        if meta.is_dir() {
            copy_dir(&from, &to, stats)?;
        } else if meta.is_file() {
            copy_file(&from, &to, mode_of(&meta), stats)?;
        } else {
            tracing::debug!("Skipping special file {}", from.display());
        }
    }

    Ok(())
}

fn copy_file(from: &Path, to: &Path, mode: u32, stats: &mut CopyStats) -> Result<(), FilesystemError> {
    match metadata(to)? {
        Some(meta) if meta.is_dir() => {
            return Err(FilesystemError::PathConflict {
                path: to.to_path_buf(),
                expected: "file",
            })
        }
        Some(meta) if meta.is_file() && same_content(from, to)? => {
            stats.unchanged += 1;
            return Ok(());
        }
        _ => {}
    }

    // rename replaces a symlink itself rather than its target
    tracing::debug!("Copying {} -> {}", from.display(), to.display());
    replace_file(from, to, mode)?;
    stats.copied += 1;
    Ok(())
}

fn sorted_entries(dir: &Path) -> Result<Vec<fs::DirEntry>, FilesystemError> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| FilesystemError::io("read directory", dir, e))?
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| FilesystemError::io("read directory", dir, e))?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

/// Apply `mode` to `path` and everything below it (`chmod -R`). Returns how many entries changed.
///
/// Symlinks are skipped, never followed.
pub fn chmod_tree(path: &Path, mode: u32) -> Result<usize, FilesystemError> {
    let meta = fs::symlink_metadata(path).map_err(|e| FilesystemError::io("inspect", path, e))?;
    if meta.file_type().is_symlink() {
        tracing::debug!("Not following symlink {}", path.display());
        return Ok(0);
    }

    let mut changed = 0;

    if mode_of(&meta) != mode {
        set_mode(path, mode)?;
        changed += 1;
    }

    if meta.is_dir() {
        for entry in sorted_entries(path)? {
            changed += chmod_tree(&entry.path(), mode)?;
        }
    }

    Ok(changed)
}

/// Install a single file with an exact mode.
///
/// New content goes to a temporary file next to `dest` which is then renamed
/// over it, so a read-only destination can still be replaced.
pub fn install_file(src: &Path, dest: &Path, mode: u32) -> Result<Outcome, FilesystemError> {
    match metadata(dest)? {
        Some(meta) if meta.is_dir() => Err(FilesystemError::PathConflict {
            path: dest.to_path_buf(),
            expected: "file",
        }),
        Some(meta) if meta.is_file() && same_content(src, dest)? => {
            if mode_of(&meta) == mode {
                return Ok(Outcome::Unchanged);
            }
            set_mode(dest, mode)?;
            Ok(Outcome::Updated)
        }
        Some(_) => {
            replace_file(src, dest, mode)?;
            Ok(Outcome::Updated)
        }
        None => {
            replace_file(src, dest, mode)?;
            Ok(Outcome::Created)
        }
    }
}

fn replace_file(src: &Path, dest: &Path, mode: u32) -> Result<(), FilesystemError> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("/"));
    fs::create_dir_all(parent).map_err(|e| FilesystemError::io("create directory", parent, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FilesystemError::io("create temporary file in", parent, e))?;
    let mut input = File::open(src).map_err(|e| FilesystemError::io("open", src, e))?;
    io::copy(&mut input, tmp.as_file_mut()).map_err(|e| FilesystemError::io("write", tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FilesystemError::io("sync", tmp.path(), e))?;

    set_mode(tmp.path(), mode)?;
    tmp.persist(dest)
        .map_err(|e| FilesystemError::io("replace", dest, e.error))?;

    tracing::debug!("Installed {} ({:o})", dest.display(), mode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn mode(path: &Path) -> u32 {
        mode_of(&fs::metadata(path).unwrap())
    }

    #[test]
    fn ensure_dir_creates_then_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("var/log/receiptd");

        assert_eq!(ensure_dir(&dir, 0o755).unwrap(), Outcome::Created);
        assert!(dir.is_dir());
        assert_eq!(mode(&dir), 0o755);

        assert_eq!(ensure_dir(&dir, 0o755).unwrap(), Outcome::Unchanged);
        assert_eq!(mode(&dir), 0o755);
    }

    #[test]
    fn ensure_dir_fixes_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("data");
        fs::create_dir(&dir).unwrap();
        set_mode(&dir, 0o700).unwrap();

        assert_eq!(ensure_dir(&dir, 0o755).unwrap(), Outcome::Updated);
        assert_eq!(mode(&dir), 0o755);
    }

    #[test]
    fn ensure_dir_rejects_file_in_the_way() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("receiptd");
        fs::write(&path, "not a dir").unwrap();

        let err = ensure_dir(&path, 0o755).unwrap_err();
        assert!(matches!(err, FilesystemError::PathConflict { expected: "directory", .. }));
    }

    #[test]
    fn set_owner_to_current_owner_is_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let meta = fs::metadata(tmp.path()).unwrap();
        assert_eq!(
            set_owner(tmp.path(), meta.uid(), meta.gid()).unwrap(),
            Outcome::Unchanged
        );
    }

    #[test]
    fn copy_tree_copies_and_skips_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("fonts");
        fs::create_dir_all(src.join("extra")).unwrap();
        fs::write(src.join("NotoSans-Regular.ttf"), b"regular").unwrap();
        fs::write(src.join("extra/Other.ttf"), b"other").unwrap();
        let dest = tmp.path().join("out/fonts");
        fs::create_dir(tmp.path().join("out")).unwrap();

        let first = copy_tree(&src, &dest).unwrap();
        assert_eq!(first.copied, 2);
        assert_eq!(first.dirs_created, 2);
        assert_eq!(fs::read(dest.join("extra/Other.ttf")).unwrap(), b"other");

        let second = copy_tree(&src, &dest).unwrap();
        assert_eq!(second, CopyStats { copied: 0, unchanged: 2, dirs_created: 0 });
        assert_eq!(second.outcome(), Outcome::Unchanged);
    }

    #[test]
    fn copy_tree_overwrites_changed_file() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(src.join("a.ttf"), b"new").unwrap();
        fs::write(dest.join("a.ttf"), b"old").unwrap();

        let stats = copy_tree(&src, &dest).unwrap();
        assert_eq!(stats.copied, 1);
        assert_eq!(fs::read(dest.join("a.ttf")).unwrap(), b"new");
    }

    #[test]
    fn copy_tree_conflict_when_dest_is_file() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir(&src).unwrap();
        let dest = tmp.path().join("dest");
        fs::write(&dest, b"file").unwrap();

        assert!(matches!(
            copy_tree(&src, &dest),
            Err(FilesystemError::PathConflict { .. })
        ));
    }

    #[test]
    fn chmod_tree_is_recursive() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("fonts");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.ttf"), b"a").unwrap();
        fs::write(root.join("sub/b.ttf"), b"b").unwrap();
        set_mode(&root.join("a.ttf"), 0o600).unwrap();
        set_mode(&root.join("sub/b.ttf"), 0o644).unwrap();

        assert!(chmod_tree(&root, 0o755).unwrap() >= 2);
        assert_eq!(mode(&root.join("a.ttf")), 0o755);
        assert_eq!(mode(&root.join("sub/b.ttf")), 0o755);
        assert_eq!(mode(&root.join("sub")), 0o755);

        assert_eq!(chmod_tree(&root, 0o755).unwrap(), 0);
    }

    #[test]
    fn install_file_creates_with_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("receiptd.rc.d");
        fs::write(&src, "#!/bin/sh\n").unwrap();
        let dest = tmp.path().join("etc/rc.d/receiptd");

        assert_eq!(install_file(&src, &dest, 0o555).unwrap(), Outcome::Created);
        assert_eq!(mode(&dest), 0o555);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "#!/bin/sh\n");

        assert_eq!(install_file(&src, &dest, 0o555).unwrap(), Outcome::Unchanged);
    }

    #[test]
    fn install_file_replaces_read_only_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("template");
        let dest = tmp.path().join("script");
        fs::write(&src, "v2").unwrap();
        fs::write(&dest, "v1").unwrap();
        set_mode(&dest, 0o555).unwrap();

        assert_eq!(install_file(&src, &dest, 0o555).unwrap(), Outcome::Updated);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "v2");
        assert_eq!(mode(&dest), 0o555);
    }

    #[test]
    fn install_file_fixes_mode_of_identical_content() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("template");
        let dest = tmp.path().join("conf");
        fs::write(&src, "same").unwrap();
        fs::write(&dest, "same").unwrap();
        set_mode(&dest, 0o600).unwrap();

        assert_eq!(install_file(&src, &dest, 0o664).unwrap(), Outcome::Updated);
        assert_eq!(mode(&dest), 0o664);
    }

    #[test]
    fn outcome_merge_keeps_most_significant() {
        assert_eq!(Outcome::Unchanged.merge(Outcome::Updated), Outcome::Updated);
        assert_eq!(Outcome::Created.merge(Outcome::Unchanged), Outcome::Created);
        assert_eq!(Outcome::Skipped.merge(Outcome::Unchanged), Outcome::Unchanged);
    }

    #[test]
    fn copy_tree_refuses_symlinked_destination_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("a.ttf"), b"font").unwrap();
        let outside = tmp.path().join("outside");
        fs::create_dir(&outside).unwrap();
        let dest = tmp.path().join("fonts");
        symlink(&outside, &dest).unwrap();

        assert!(matches!(
            copy_tree(&src, &dest),
            Err(FilesystemError::PathConflict { expected: "directory", .. })
        ));
        assert!(!outside.join("a.ttf").exists());
    }

    #[test]
    fn copy_tree_replaces_symlinked_file_without_writing_through() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(src.join("a.ttf"), b"font").unwrap();
        let target = tmp.path().join("shadow");
        fs::write(&target, b"secret").unwrap();
        symlink(&target, dest.join("a.ttf")).unwrap();

        let stats = copy_tree(&src, &dest).unwrap();
        assert_eq!(stats.copied, 1);
        assert_eq!(fs::read(&target).unwrap(), b"secret");
        let meta = fs::symlink_metadata(dest.join("a.ttf")).unwrap();
        assert!(meta.is_file());
        assert_eq!(fs::read(dest.join("a.ttf")).unwrap(), b"font");
    }

    #[test]
    fn chmod_tree_does_not_follow_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("fonts");
        fs::create_dir(&root).unwrap();
        set_mode(&root, 0o755).unwrap();
        let outside = tmp.path().join("etc");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("master.passwd"), b"root:*:0:0").unwrap();
        set_mode(&outside.join("master.passwd"), 0o600).unwrap();
        symlink(&outside, root.join("etc")).unwrap();
        symlink(outside.join("master.passwd"), root.join("passwd")).unwrap();

        assert_eq!(chmod_tree(&root, 0o755).unwrap(), 0);
        assert_eq!(mode(&outside.join("master.passwd")), 0o600);
    }

    #[test]
    fn install_file_replaces_symlink_instead_of_following() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("logo.svg");
        fs::write(&src, "<svg/>").unwrap();
        let target = tmp.path().join("outside.svg");
        fs::write(&target, "<svg/>").unwrap();
        set_mode(&target, 0o600).unwrap();
        let dest = tmp.path().join("data/logo.svg");
        fs::create_dir(tmp.path().join("data")).unwrap();
        symlink(&target, &dest).unwrap();

        assert_eq!(install_file(&src, &dest, 0o644).unwrap(), Outcome::Updated);
        assert_eq!(mode(&target), 0o600);
        assert!(fs::symlink_metadata(&dest).unwrap().is_file());
        assert_eq!(mode(&dest), 0o644);
    }

    #[test]
    fn set_owner_refuses_symlink() {
        let tmp = tempfile::tempdir().unwrap();
        let link = tmp.path().join("link");
        symlink(tmp.path(), &link).unwrap();
        let meta = fs::metadata(tmp.path()).unwrap();

        assert!(matches!(
            set_owner(&link, meta.uid(), meta.gid()),
            Err(FilesystemError::PathConflict { .. })
        ));
    }
}
