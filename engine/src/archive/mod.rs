//! tar.gz packing and unpacking
//!
//! Blocking; callers run these under `spawn_blocking`.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use walkdir::WalkDir;

/// Entries skipped in uploaded sources by default
pub const DEFAULT_IGNORE: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "__pycache__",
    ".venv",
    "target",
    ".next",
    ".nuxt",
    ".cache",
    ".DS_Store",
];

/// Path filter. A pattern is either an exact path component (`node_modules`)
/// or a file suffix (`*.pyc`).
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    names: Vec<String>,
    suffixes: Vec<String>,
}

impl IgnoreList {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut list = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            match pattern.strip_prefix('*') {
                Some(suffix) => list.suffixes.push(suffix.to_string()),
                None => list.names.push(pattern.trim_matches('/').to_string()),
            }
        }
        list
    }

    /// Ignore nothing
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether a relative path is excluded
    pub fn is_ignored(&self, rel: &Path) -> bool {
        rel.components().any(|c| match c {
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                self.names.iter().any(|n| *n == part)
                    || self.suffixes.iter().any(|s| part.ends_with(s.as_str()))
            }
            _ => false,
        })
    }
}

/// Write `src`'s contents as a gzipped tar to `writer`. Paths in the archive are
/// relative to `src`. Returns the number of files written.
pub fn pack<W: Write>(src: &Path, writer: W, ignore: &IgnoreList) -> io::Result<usize> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut files = 0;
    let walker = WalkDir::new(src)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| match e.path().strip_prefix(src) {
            Ok(rel) => !ignore.is_ignored(rel),
            Err(_) => true,
        });

    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        if rel.as_os_str().is_empty() {
            continue;
        }

        let file_type = entry.file_type();
        if file_type.is_dir() {
            builder.append_dir(rel, entry.path())?;
        } else if file_type.is_file() || file_type.is_symlink() {
            builder.append_path_with_name(entry.path(), rel)?;
            files += 1;
        }
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?.flush()?;
    Ok(files)
}

/// Pack a directory into a file
pub fn pack_to_file(src: &Path, dest: &Path, ignore: &IgnoreList) -> io::Result<usize> {
    let file = fs::File::create(dest)?;
    let files = pack(src, io::BufWriter::new(file), ignore)?;
    Ok(files)
}

/// Pack a directory into memory
pub fn pack_to_bytes(src: &Path, ignore: &IgnoreList) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    pack(src, &mut out, ignore)?;
    Ok(out)
}

fn is_safe(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Unpack a gzipped tar into `dest`. Rejects absolute and parent-relative
/// entries; skips ignored ones. Returns the number of entries written.
pub fn unpack<R: Read>(reader: R, dest: &Path, ignore: &IgnoreList) -> io::Result<usize> {
    fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);

    let mut written = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if !is_safe(&path) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsafe path in archive: {}", path.display()),
            ));
        }
        if ignore.is_ignored(&path) {
            continue;
        }

        if entry.unpack_in(dest)? {
            written += 1;
        }
    }
    Ok(written)
}

pub fn unpack_file(src: &Path, dest: &Path, ignore: &IgnoreList) -> io::Result<usize> {
    let file = fs::File::open(src)?;
    unpack(io::BufReader::new(file), dest, ignore)
}
