//! Naive tree-walking diff support.
//!
//! Drivers without a native notion of "changes since parent" (such as
//! `vfs`) compare the two directory trees directly. Deletions travel in tar
//! streams as AUFS-style whiteout entries: an empty file `.wh.<name>` next
//! to the removed entry, or `.wh..wh..opq` to mark a directory opaque.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use strata_common::error::{Result, StrataError};
use walkdir::WalkDir;

use crate::driver::{Change, ChangeKind};

/// Prefix marking a deleted entry in a layer tar stream.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Entry name marking its directory as opaque (lower contents hidden).
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Computes the changes in `layer` relative to `parent`.
///
/// Without a parent every entry in `layer` is reported as added. The result
/// is sorted by path so that directories precede their contents.
///
/// # Errors
///
/// Returns an error if either tree cannot be walked.
pub fn changes(layer: &Path, parent: Option<&Path>) -> Result<Vec<Change>> {
    let mut out = BTreeSet::new();

    for entry in WalkDir::new(layer).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_error(layer, e))?;
        let rel = relative(layer, entry.path())?;
        let kind = match parent.map(|p| p.join(&rel)) {
            Some(lower) => match lower.symlink_metadata() {
                Ok(_) if entries_differ(entry.path(), &lower)? => Some(ChangeKind::Modified),
                Ok(_) => None,
                Err(e) if e.kind() == io::ErrorKind::NotFound => Some(ChangeKind::Added),
                Err(e) => return Err(StrataError::io(lower, e)),
            },
            None => Some(ChangeKind::Added),
        };
        if let Some(kind) = kind {
            let _ = out.insert(Change { path: rel, kind });
        }
    }

    if let Some(parent) = parent {
        let mut walker = WalkDir::new(parent).min_depth(1).sort_by_file_name().into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry.map_err(|e| walk_error(parent, e))?;
            let rel = relative(parent, entry.path())?;
            match layer.join(&rel).symlink_metadata() {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if entry.file_type().is_dir() {
                        walker.skip_current_dir();
                    }
                    let _ = out.insert(Change {
                        path: rel,
                        kind: ChangeKind::Deleted,
                    });
                }
                Err(e) => return Err(StrataError::io(layer.join(&rel), e)),
            }
        }
    }

    Ok(out.into_iter().collect())
}

/// Returns the total size of regular files added or modified by `changes`.
///
/// # Errors
///
/// Returns an error if a changed file cannot be inspected.
pub fn changes_size(root: &Path, changes: &[Change]) -> Result<u64> {
    let mut size = 0;
    for change in changes.iter().filter(|c| c.kind != ChangeKind::Deleted) {
        let path = root.join(&change.path);
        let meta = path
            .symlink_metadata()
            .map_err(|e| StrataError::io(&path, e))?;
        if meta.is_file() {
            size += meta.len();
        }
    }
    Ok(size)
}

/// Writes `changes` from `root` as a tar stream and returns a reader over it.
///
/// The archive is spooled to an anonymous temporary file.
///
/// # Errors
///
/// Returns an error if an entry cannot be archived.
pub fn export_changes(root: &Path, changes: &[Change]) -> Result<Box<dyn Read + Send>> {
    let spool = tempfile::tempfile().map_err(|e| StrataError::io(root, e))?;
    let mut builder = tar::Builder::new(spool);
    builder.follow_symlinks(false);

    for change in changes {
        match change.kind {
            ChangeKind::Deleted => {
                let name = change
                    .path
                    .file_name()
                    .ok_or_else(|| StrataError::Config {
                        message: format!("cannot whiteout {}", change.path.display()),
                    })?
                    .to_string_lossy();
                let whiteout = change
                    .path
                    .with_file_name(format!("{WHITEOUT_PREFIX}{name}"));
                let mut header = tar::Header::new_gnu();
                header.set_size(0);
                header.set_mode(0o644);
                header.set_entry_type(tar::EntryType::Regular);
                header.set_cksum();
                builder
                    .append_data(&mut header, &whiteout, io::empty())
                    .map_err(|e| StrataError::io(&whiteout, e))?;
            }
            ChangeKind::Added | ChangeKind::Modified => {
                let source = root.join(&change.path);
                builder
                    .append_path_with_name(&source, &change.path)
                    .map_err(|e| StrataError::io(&source, e))?;
            }
        }
    }

    let mut spool = builder.into_inner().map_err(|e| StrataError::io(root, e))?;
    let _ = spool
        .seek(SeekFrom::Start(0))
        .map_err(|e| StrataError::io(root, e))?;
    Ok(Box::new(spool))
}

/// Extracts a layer tar stream into `target`, honouring whiteouts.
///
/// Returns the number of content bytes unpacked.
///
/// # Errors
///
/// Returns an error if the stream is not a valid tar archive, an entry
/// would escape `target`, or extraction fails.
pub fn apply_tar(target: &Path, diff: &mut dyn Read) -> Result<u64> {
    let mut archive = tar::Archive::new(diff);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut size = 0;
    let entries = archive.entries().map_err(|e| StrataError::io(target, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| StrataError::io(target, e))?;
        let path = entry
            .path()
            .map_err(|e| StrataError::io(target, e))?
            .into_owned();
        if !is_contained(&path) {
            return Err(StrataError::Config {
                message: format!("tar entry escapes layer root: {}", path.display()),
            });
        }

        if let Some(link) = symlinked_parent(target, &path) {
            return Err(StrataError::Config {
                message: format!(
                    "tar entry {} resolves through symlink {}",
                    path.display(),
                    link.display()
                ),
            });
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = target.join(path.parent().unwrap_or_else(|| Path::new("")));

        if name == OPAQUE_WHITEOUT {
            clear_dir(&dir)?;
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            remove_any(&dir.join(hidden))?;
            continue;
        }

        let dest = target.join(&path);
        if entry.header().entry_type() != tar::EntryType::Directory {
            if let Ok(meta) = dest.symlink_metadata() {
                if meta.is_dir() {
                    fs::remove_dir_all(&dest).map_err(|e| StrataError::io(&dest, e))?;
                }
            }
        }

        size += entry.size();
        let _ = entry
            .unpack_in(target)
            .map_err(|e| StrataError::io(&dest, e))?;
    }

    tracing::debug!(root = %target.display(), size, "applied layer tar");
    Ok(size)
}

/// Recursively copies `src` into `dst`, preserving symlinks and modes.
///
/// # Errors
///
/// Returns an error if any entry cannot be copied.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_error(src, e))?;
        let rel = relative(src, entry.path())?;
        let dest = dst.join(&rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&dest).map_err(|e| StrataError::io(&dest, e))?;
            let perms = entry
                .metadata()
                .map_err(|e| walk_error(src, e))?
                .permissions();
            fs::set_permissions(&dest, perms).map_err(|e| StrataError::io(&dest, e))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(|e| StrataError::io(entry.path(), e))?;
            symlink(&link, &dest)?;
        } else {
            let _ = fs::copy(entry.path(), &dest).map_err(|e| StrataError::io(&dest, e))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(link: &Path, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, dest).map_err(|e| StrataError::io(dest, e))
}

#[cfg(not(unix))]
fn symlink(_link: &Path, dest: &Path) -> Result<()> {
    Err(StrataError::Config {
        message: format!("symlinks are not supported here: {}", dest.display()),
    })
}

#[cfg(unix)]
fn mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn mode(meta: &fs::Metadata) -> u32 {
    u32::from(meta.permissions().readonly())
}

/// Compares one entry in the upper tree with its counterpart below.
fn entries_differ(upper: &Path, lower: &Path) -> Result<bool> {
    let um = upper
        .symlink_metadata()
        .map_err(|e| StrataError::io(upper, e))?;
    let lm = lower
        .symlink_metadata()
        .map_err(|e| StrataError::io(lower, e))?;

    if um.file_type() != lm.file_type() || mode(&um) != mode(&lm) {
        return Ok(true);
    }
    if um.file_type().is_symlink() {
        let a = fs::read_link(upper).map_err(|e| StrataError::io(upper, e))?;
        let b = fs::read_link(lower).map_err(|e| StrataError::io(lower, e))?;
        return Ok(a != b);
    }
    if um.is_file() {
        if um.len() != lm.len() {
            return Ok(true);
        }
        return contents_differ(upper, lower);
    }
    Ok(false)
}

fn contents_differ(a: &Path, b: &Path) -> Result<bool> {
    let mut fa = File::open(a).map_err(|e| StrataError::io(a, e))?;
    let mut fb = File::open(b).map_err(|e| StrataError::io(b, e))?;
    let mut ba = [0u8; 8192];
    let mut bb = [0u8; 8192];
    loop {
        let na = read_full(&mut fa, &mut ba).map_err(|e| StrataError::io(a, e))?;
        let nb = read_full(&mut fb, &mut bb).map_err(|e| StrataError::io(b, e))?;
        if na != nb || ba[..na] != bb[..nb] {
            return Ok(true);
        }
        if na == 0 {
            return Ok(false);
        }
    }
}

fn read_full(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn clear_dir(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StrataError::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| StrataError::io(dir, e))?;
        remove_any(&entry.path())?;
    }
    Ok(())
}

fn remove_any(path: &Path) -> Result<()> {
    let result = match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StrataError::io(path, e)),
    }
}

fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// First parent directory of `path` under `root` that is a symlink.
///
/// Whiteouts and directory replacement remove entries by path, so a parent
/// planted as a symlink by an earlier entry would point them outside `root`.
fn symlinked_parent(root: &Path, path: &Path) -> Option<PathBuf> {
    let mut current = root.to_path_buf();
    for component in path.parent()?.components() {
        let Component::Normal(part) = component else {
            continue;
        };
        current.push(part);
        match current.symlink_metadata() {
            Ok(meta) if meta.file_type().is_symlink() => return Some(current),
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}

fn relative(root: &Path, path: &Path) -> Result<PathBuf> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|_| StrataError::Config {
            message: format!("{} is outside {}", path.display(), root.display()),
        })
}

fn walk_error(root: &Path, err: walkdir::Error) -> StrataError {
    let path = err.path().map_or_else(|| root.to_path_buf(), Path::to_path_buf);
    StrataError::io(path, err.into())
}
