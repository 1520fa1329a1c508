//! Tar layer utilities.
//!
//! A layer is an uncompressed tar delta using OCI whiteouts: `.wh.<name>`
//! deletes `<name>` from lower layers, `.wh..wh..opq` hides every lower entry
//! of its directory.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Applies one layer on top of the tree at `root`.
pub fn apply_layer(root: &Path, layer: impl Read) -> io::Result<()> {
    let preserve_owner = running_as_root();
    let mut archive = tar::Archive::new(layer);
    archive.set_preserve_ownerships(preserve_owner);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(relative) = sanitize(&path) else {
            warn!(path = %path.display(), "Skipping layer entry outside the root");
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }

        let file_name = relative.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let parent = relative.parent().map(Path::to_path_buf).unwrap_or_default();

        if file_name == OPAQUE_WHITEOUT {
            let dir = root.join(&parent);
            if dir.is_dir() {
                for child in fs::read_dir(&dir)? {
                    remove_path(&child?.path())?;
                }
            }
            continue;
        }

        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            remove_path(&root.join(&parent).join(hidden))?;
            continue;
        }

        let target = root.join(&relative);
        let is_dir = entry.header().entry_type().is_dir();
        if let Ok(existing) = fs::symlink_metadata(&target) {
            // A directory entry merges into an existing directory; anything else replaces.
            if !(is_dir && existing.is_dir()) {
                remove_path(&target)?;
            }
        }

        entry.set_preserve_permissions(true);
        entry.set_preserve_mtime(true);
        entry.set_unpack_xattrs(false);
        entry.unpack_in(root)?;
    }

    Ok(())
}

/// Normalizes an entry path, rejecting anything that escapes the root.
pub fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Symlink hops allowed while resolving a path inside a root.
const MAX_LINK_HOPS: usize = 40;

/// Resolves `relative` inside `root`, following symlinks as the root's own
/// filesystem would: absolute targets start again at `root` and `..` stops there.
///
/// Missing components are kept as written.
pub fn resolve_in_root(root: &Path, relative: &Path) -> io::Result<PathBuf> {
    fn push_reversed(pending: &mut Vec<std::ffi::OsString>, path: &Path) {
        for component in path.components().rev() {
            match component {
                Component::Normal(part) => pending.push(part.to_os_string()),
                Component::ParentDir => pending.push("..".into()),
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }
    }

    let mut pending = Vec::new();
    push_reversed(&mut pending, relative);
    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(part) = pending.pop() {
        if part == ".." {
            resolved.pop();
            continue;
        }
        let candidate = resolved.join(&part);
        match fs::symlink_metadata(root.join(&candidate)) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_LINK_HOPS {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("too many levels of symbolic links in {}", relative.display()),
                    ));
                }
                let target = fs::read_link(root.join(&candidate))?;
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                push_reversed(&mut pending, &target);
            }
            _ => resolved = candidate,
        }
    }

    Ok(resolved)
}

/// Like [`resolve_in_root`] for every component but the last, which is kept
/// as is so a final symlink stays a link.
pub fn resolve_parent(root: &Path, relative: &Path) -> io::Result<PathBuf> {
    match (relative.parent(), relative.file_name()) {
        (Some(parent), Some(name)) => Ok(resolve_in_root(root, parent)?.join(name)),
        _ => Ok(relative.to_path_buf()),
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

/// Type of a tree entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink(PathBuf),
    /// Sockets, fifos and devices; never packed.
    Special,
}

/// Metadata used to detect changes between two walks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    pub mtime_nsec: i64,
}

impl FileState {
    fn from_metadata(path: &Path, meta: &fs::Metadata) -> io::Result<Self> {
        let file_type = meta.file_type();
        let kind = if file_type.is_symlink() {
            FileKind::Symlink(fs::read_link(path)?)
        } else if file_type.is_dir() {
            FileKind::Dir
        } else if file_type.is_file() {
            FileKind::File
        } else {
            FileKind::Special
        };

        Ok(Self {
            kind,
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
        })
    }

    /// Directories only count as changed when their own attributes change.
    fn changed_from(&self, before: &FileState) -> bool {
        match (&self.kind, &before.kind) {
            (FileKind::Dir, FileKind::Dir) => {
                self.mode != before.mode || self.uid != before.uid || self.gid != before.gid
            }
            _ => self != before,
        }
    }
}

/// Entries of a tree keyed by root-relative path, parents before children.
#[derive(Debug, Clone, Default)]
pub struct TreeSnapshot {
    pub entries: BTreeMap<PathBuf, FileState>,
}

impl TreeSnapshot {
    pub fn capture(root: &Path) -> io::Result<Self> {
        let mut entries = BTreeMap::new();
        for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
            let entry = entry.map_err(io::Error::other)?;
            let relative = entry.path().strip_prefix(root).map_err(io::Error::other)?.to_path_buf();
            let meta = entry.metadata().map_err(io::Error::other)?;
            entries.insert(relative, FileState::from_metadata(entry.path(), &meta)?);
        }
        Ok(Self { entries })
    }
}

/// Produces the layer turning `before` into the current contents of `root`.
pub fn diff(before: &TreeSnapshot, root: &Path) -> io::Result<Vec<u8>> {
    let after = TreeSnapshot::capture(root)?;
    let mut builder = tar::Builder::new(Vec::new());
    let mut changed = 0usize;

    for (path, state) in &after.entries {
        let is_new = match before.entries.get(path) {
            Some(previous) => state.changed_from(previous),
            None => true,
        };
        if is_new {
            if append_entry(&mut builder, &root.join(path), path, None)? {
                changed += 1;
            }
        }
    }

    let mut deleted: Vec<&PathBuf> = Vec::new();
    for path in before.entries.keys() {
        if after.entries.contains_key(path) {
            continue;
        }
        // A whiteout on the topmost deleted directory covers its children.
        if deleted.iter().any(|d| path.starts_with(d)) {
            continue;
        }
        append_whiteout(&mut builder, path)?;
        deleted.push(path);
    }

    debug!(changed, deleted = deleted.len(), "Computed filesystem delta");
    builder.into_inner()
}

fn append_whiteout<W: Write>(builder: &mut tar::Builder<W>, path: &Path) -> io::Result<()> {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let whiteout = path.with_file_name(format!("{}{}", WHITEOUT_PREFIX, name));

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(0);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder.append_data(&mut header, whiteout, io::empty())
}

/// Ownership override for packed entries (`COPY --chown`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u64,
    pub gid: u64,
}

/// Appends the filesystem object at `source` under `name`.
///
/// Returns false for objects that cannot live in a layer (sockets, fifos, devices).
pub fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    source: &Path,
    name: &Path,
    owner: Option<Owner>,
) -> io::Result<bool> {
    let meta = fs::symlink_metadata(source)?;
    let file_type = meta.file_type();

    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(&meta, tar::HeaderMode::Complete);
    if let Some(owner) = owner {
        header.set_uid(owner.uid);
        header.set_gid(owner.gid);
    }

    if file_type.is_symlink() {
        let target = fs::read_link(source)?;
        header.set_size(0);
        builder.append_link(&mut header, name, target)?;
    } else if file_type.is_dir() {
        header.set_size(0);
        builder.append_data(&mut header, name, io::empty())?;
    } else if file_type.is_file() {
        let file = fs::File::open(source)?;
        builder.append_data(&mut header, name, file)?;
    } else {
        warn!(path = %source.display(), "Skipping special file");
        return Ok(false);
    }

    Ok(true)
}

/// Packs the whole tree at `root` into `out`, starting with a `./` entry.
pub fn pack_dir<W: Write>(root: &Path, out: W) -> io::Result<W> {
    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);

    let root_meta = fs::metadata(root)?;
    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(&root_meta, tar::HeaderMode::Complete);
    header.set_size(0);
    builder.append_data(&mut header, "./", io::empty())?;

    for entry in WalkDir::new(root).follow_links(false).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry.path().strip_prefix(root).map_err(io::Error::other)?;
        append_entry(&mut builder, entry.path(), relative, None)?;
    }

    builder.into_inner()
}

/// True if `path` is `prefix` or lies below it.
fn under(path: &Path, prefix: &Path) -> bool {
    path.starts_with(prefix)
}

/// Rewrites `layer` without any entry at or below `prefixes`.
///
/// Used to keep mount targets out of RUN deltas. Whiteouts for a stripped
/// path are dropped too.
pub fn strip_paths(layer: &[u8], prefixes: &[String]) -> io::Result<Vec<u8>> {
    let prefixes: Vec<PathBuf> = prefixes.iter().filter_map(|p| sanitize(Path::new(p))).collect();
    if prefixes.is_empty() {
        return Ok(layer.to_vec());
    }

    let mut archive = tar::Archive::new(layer);
    let mut builder = tar::Builder::new(Vec::new());
    let mut removed = 0usize;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let relative = sanitize(&path).unwrap_or_default();

        // `.wh.<name>` refers to `<name>`.
        let effective = match relative.file_name().and_then(|n| n.to_str()) {
            Some(name) if name != OPAQUE_WHITEOUT && name.starts_with(WHITEOUT_PREFIX) => {
                relative.with_file_name(&name[WHITEOUT_PREFIX.len()..])
            }
            _ => relative.clone(),
        };

        if prefixes.iter().any(|p| under(&effective, p)) {
            removed += 1;
            continue;
        }

        let mut header = entry.header().clone();
        let link = entry.link_name()?.map(|l| l.into_owned());
        match link {
            Some(target) if header.entry_type().is_symlink() || header.entry_type().is_hard_link() => {
                builder.append_link(&mut header, &path, target)?;
            }
            _ => {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                builder.append_data(&mut header, &path, data.as_slice())?;
            }
        }
    }

    if removed > 0 {
        debug!(removed, "Stripped mount targets from delta");
    }
    builder.into_inner()
}

/// Lists the entry paths of a layer.
pub fn entry_paths(layer: &[u8]) -> io::Result<Vec<PathBuf>> {
    let mut archive = tar::Archive::new(layer);
    let mut paths = Vec::new();
    for entry in archive.entries()? {
        paths.push(entry?.path()?.into_owned());
    }
    Ok(paths)
}

/// Matches a file name against a pattern with `*` and `?` wildcards.
fn wildcard_match(pattern: &[u8], name: &[u8]) -> bool {
    match (pattern.first(), name.first()) {
        (None, None) => true,
        (Some(b'*'), _) => wildcard_match(&pattern[1..], name) || (!name.is_empty() && wildcard_match(pattern, &name[1..])),
        (Some(b'?'), Some(_)) => wildcard_match(&pattern[1..], &name[1..]),
        (Some(p), Some(n)) if p == n => wildcard_match(&pattern[1..], &name[1..]),
        _ => false,
    }
}

/// Expands a COPY source against `root`. Wildcards are honoured in the last component.
///
/// Symlinks in leading components resolve inside `root`; a symlink named by
/// the source itself is returned as is and copied as a link.
pub fn expand_source(root: &Path, source: &str) -> io::Result<Vec<PathBuf>> {
    let relative = sanitize(Path::new(source)).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("source {} is outside the build root", source))
    })?;

    let name = relative.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if !name.contains(['*', '?']) {
        let relative = resolve_parent(root, &relative)?;
        fs::symlink_metadata(root.join(&relative)).map_err(|e| {
            io::Error::new(e.kind(), format!("COPY source {} not found: {}", source, e))
        })?;
        return Ok(vec![relative]);
    }

    let parent = resolve_in_root(root, relative.parent().unwrap_or(Path::new("")))?;
    let mut matches = Vec::new();
    for entry in fs::read_dir(root.join(&parent))? {
        let entry = entry?;
        let file_name = entry.file_name();
        if wildcard_match(name.as_bytes(), file_name.as_encoded_bytes()) {
            matches.push(parent.join(file_name));
        }
    }
    matches.sort();

    if matches.is_empty() {
        return Err(io::Error::new(io::ErrorKind::NotFound, format!("COPY source {} matched no files", source)));
    }
    Ok(matches)
}

/// Digest of the content COPY would read from `root`.
///
/// Covers paths, modes, symlink targets and file contents, not timestamps.
pub fn content_digest(root: &Path, sources: &[String]) -> io::Result<String> {
    let mut hasher = Sha256::new();

    for source in sources {
        hasher.update(source.as_bytes());
        hasher.update(b"\0");
        for relative in expand_source(root, source)? {
            for entry in WalkDir::new(root.join(&relative)).follow_links(false).sort_by_file_name() {
                let entry = entry.map_err(io::Error::other)?;
                let meta = entry.metadata().map_err(io::Error::other)?;
                let path = entry.path().strip_prefix(root).map_err(io::Error::other)?;

                hasher.update(path.as_os_str().as_encoded_bytes());
                hasher.update(format!("\0{:o}\0", meta.mode()).as_bytes());
                if meta.file_type().is_symlink() {
                    hasher.update(fs::read_link(entry.path())?.as_os_str().as_encoded_bytes());
                } else if meta.is_file() {
                    let mut file = fs::File::open(entry.path())?;
                    io::copy(&mut file, &mut hasher)?;
                }
                hasher.update(b"\n");
            }
        }
    }

    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// Builds the layer for `COPY <sources> <destination>` reading from `root`.
///
/// `destination` must be absolute. Directory sources copy their contents;
/// the destination is a directory when it ends in `/`, when there are
/// several sources, or when a source is a directory.
pub fn copy_layer(root: &Path, sources: &[String], destination: &str, owner: Option<Owner>) -> io::Result<Vec<u8>> {
    let dest = sanitize(Path::new(destination)).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid destination {}", destination))
    })?;

    let mut expanded = Vec::new();
    for source in sources {
        expanded.extend(expand_source(root, source)?);
    }

    let dest_is_dir = destination.ends_with('/')
        || expanded.len() > 1
        || expanded.iter().any(|p| fs::symlink_metadata(root.join(p)).map(|m| m.is_dir()).unwrap_or(false));

    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    for relative in expanded {
        let source = root.join(&relative);
        let meta = fs::symlink_metadata(&source)?;

        if meta.is_dir() {
            for entry in WalkDir::new(&source).follow_links(false).sort_by_file_name() {
                let entry = entry.map_err(io::Error::other)?;
                let inner = entry.path().strip_prefix(&source).map_err(io::Error::other)?;
                let name = if inner.as_os_str().is_empty() { dest.clone() } else { dest.join(inner) };
                if name.as_os_str().is_empty() {
                    // Copying into `/` itself; the root entry carries nothing.
                    continue;
                }
                append_entry(&mut builder, entry.path(), &name, owner)?;
            }
        } else {
            let name = if dest_is_dir {
                dest.join(relative.file_name().unwrap_or(relative.as_os_str()))
            } else {
                dest.clone()
            };
            append_entry(&mut builder, &source, &name, owner)?;
        }
    }

    builder.into_inner()
}
