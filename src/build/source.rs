//! Source materialisation for builds: shallow git clones, zip extraction
//! with hard resource limits, inline file operations, and build-context
//! resolution.
//!
//! Everything here works on a private temp directory owned by one build;
//! no path derived from user input may escape it.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};
use zip::ZipArchive;

use super::manifest::MANIFEST_FILE;
use crate::error::{GatewayError, Result};

const MAX_ZIP_ENTRIES: usize = 2000;
const MAX_ZIP_FILE_BYTES: u64 = 100 << 20;
const MAX_ZIP_TOTAL_BYTES: u64 = 500 << 20;
const MAX_ZIP_COMPRESSION_RATIO: u64 = 100;
const RATIO_CHECK_THRESHOLD: u64 = 1 << 20;

const MAX_INSPECT_FILES: usize = 400;
const MAX_INSPECT_FILE_BYTES: u64 = 200 * 1024;

const SKIPPED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "vendor",
    "dist",
    "build",
    "bin",
    "obj",
    "target",
    "__pycache__",
    ".venv",
    "venv",
];

#[derive(Debug, Clone, Deserialize)]
pub struct GitSource {
    pub url: String,
    #[serde(rename = "ref", default)]
    pub reference: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InlineFile {
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub remove: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectFile {
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content: String,
    pub editable: bool,
}

/// Shallow-clone a repository into `dest`. When a ref is given and the
/// branch clone fails (tags and commit ids are not clonable branches), the
/// repository is re-cloned plainly and the ref checked out.
pub fn clone_repo(git: &GitSource, dest: &Path) -> Result<()> {
    info!("Cloning {} into build context", git.url);

    if git.reference.is_empty() {
        shallow_clone(&git.url, None, dest)?;
        return Ok(());
    }

    match shallow_clone(&git.url, Some(&git.reference), dest) {
        Ok(_) => Ok(()),
        Err(_) => {
            reset_dir(dest)?;
            let repo = shallow_clone(&git.url, None, dest)?;
            checkout_ref(&repo, &git.reference)
        }
    }
}

fn shallow_clone(url: &str, branch: Option<&str>, dest: &Path) -> Result<git2::Repository> {
    let mut fetch = git2::FetchOptions::new();
    fetch.depth(1);
    let mut builder = git2::build::RepoBuilder::new();
    builder.fetch_options(fetch);
    if let Some(branch) = branch {
        builder.branch(branch);
    }
    builder
        .clone(url, dest)
        .map_err(|e| GatewayError::bad_request(format!("git clone failed: {}", e.message())))
}

fn checkout_ref(repo: &git2::Repository, reference: &str) -> Result<()> {
    let (object, resolved) = repo
        .revparse_ext(reference)
        .map_err(|e| GatewayError::bad_request(format!("git checkout failed: {}", e.message())))?;
    repo.checkout_tree(&object, None)
        .map_err(|e| GatewayError::bad_request(format!("git checkout failed: {}", e.message())))?;
    match resolved {
        Some(gref) => repo.set_head(gref.name().unwrap_or_default()),
        None => repo.set_head_detached(object.id()),
    }
    .map_err(|e| GatewayError::bad_request(format!("git checkout failed: {}", e.message())))
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(GatewayError::internal)?;
    }
    fs::create_dir_all(dir).map_err(GatewayError::internal)?;
    Ok(())
}

/// Extract a zip archive under `dest`, enforcing entry count, per-file and
/// total byte caps, the compression-ratio cap, the symlink ban, and path
/// confinement. Validation runs over the central directory first so a
/// malicious archive is rejected before anything lands on disk.
pub fn extract_zip(zip_path: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(zip_path)
        .map_err(|e| GatewayError::bad_request(format!("failed to open zip: {e}")))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| GatewayError::bad_request(format!("failed to open zip: {e}")))?;

    validate_zip_archive(&mut archive)?;

    let mut extracted_total: u64 = 0;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| GatewayError::bad_request(format!("failed to read zip entry: {e}")))?;
        let name = entry.name().to_string();
        let is_dir = entry.is_dir();
        extract_zip_entry(&mut entry, &name, is_dir, dest, &mut extracted_total)?;
    }

    Ok(())
}

fn validate_zip_archive<R: Read + std::io::Seek>(archive: &mut ZipArchive<R>) -> Result<()> {
    if archive.len() > MAX_ZIP_ENTRIES {
        return Err(GatewayError::bad_request(format!(
            "zip contains too many entries (max {MAX_ZIP_ENTRIES})"
        )));
    }

    let mut total: u64 = 0;
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| GatewayError::bad_request(format!("failed to read zip entry: {e}")))?;
        let name = entry.name().to_string();
        if name.is_empty() {
            return Err(GatewayError::bad_request("zip entry has empty name"));
        }
        if name.contains('\u{0}') || name.contains(':') {
            return Err(GatewayError::bad_request(format!(
                "zip entry has invalid name: {name}"
            )));
        }
        if let Some(mode) = entry.unix_mode() {
            if mode & 0o170000 == 0o120000 {
                return Err(GatewayError::bad_request(format!(
                    "zip entry uses symlink: {name}"
                )));
            }
        }
        if !entry.is_dir() && entry.size() > MAX_ZIP_FILE_BYTES {
            return Err(GatewayError::bad_request(format!(
                "zip entry too large: {name}"
            )));
        }
        if entry.compressed_size() > 0 && entry.size() > RATIO_CHECK_THRESHOLD {
            let ratio = entry.size() / entry.compressed_size();
            if ratio > MAX_ZIP_COMPRESSION_RATIO {
                return Err(GatewayError::bad_request(format!(
                    "zip entry compression ratio too high: {name}"
                )));
            }
        }
        total += entry.size();
        if total > MAX_ZIP_TOTAL_BYTES {
            return Err(GatewayError::bad_request(format!(
                "zip uncompressed size exceeds {MAX_ZIP_TOTAL_BYTES} bytes"
            )));
        }
    }

    Ok(())
}

fn extract_zip_entry<R: Read>(
    entry: &mut R,
    name: &str,
    is_dir: bool,
    dest: &Path,
    extracted_total: &mut u64,
) -> Result<()> {
    let path = safe_join(dest, name)?;

    if is_dir {
        fs::create_dir_all(&path).map_err(GatewayError::internal)?;
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(GatewayError::internal)?;
    }

    let mut out = fs::File::create(&path).map_err(GatewayError::internal)?;
    // hard stop one byte past the cap, in case the central directory lied
    let written = std::io::copy(&mut entry.take(MAX_ZIP_FILE_BYTES + 1), &mut out)
        .map_err(GatewayError::internal)?;
    if written > MAX_ZIP_FILE_BYTES {
        let _ = fs::remove_file(&path);
        return Err(GatewayError::bad_request(format!(
            "zip entry too large: {name}"
        )));
    }
    *extracted_total += written;
    if *extracted_total > MAX_ZIP_TOTAL_BYTES {
        let _ = fs::remove_file(&path);
        return Err(GatewayError::bad_request(format!(
            "zip uncompressed size exceeds {MAX_ZIP_TOTAL_BYTES} bytes"
        )));
    }

    Ok(())
}

/// Apply inline file operations relative to the context directory.
pub fn write_inline_files(base: &Path, files: &[InlineFile]) -> Result<()> {
    for file in files {
        if file.path.is_empty() {
            return Err(GatewayError::bad_request("inline file path is required"));
        }
        let path = safe_join(base, &file.path)?;
        if file.remove {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(GatewayError::bad_request(format!(
                        "failed to remove {}: {e}",
                        file.path
                    )))
                }
            }
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(GatewayError::internal)?;
        }
        fs::write(&path, &file.content).map_err(|e| {
            GatewayError::bad_request(format!("failed to write {}: {e}", file.path))
        })?;
    }
    Ok(())
}

/// Join `target` onto `base`, rejecting absolute paths, parent traversal,
/// drive-letter separators and backslash tricks.
pub fn safe_join(base: &Path, target: &str) -> Result<PathBuf> {
    let normalized = target.replace('\\', "/");
    if normalized.contains(':') {
        return Err(GatewayError::bad_request(format!("invalid path: {target}")));
    }

    let mut clean = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return Err(GatewayError::bad_request(format!("invalid path: {target}"))),
        }
    }

    Ok(base.join(clean))
}

/// When a directory holds exactly one subdirectory (the usual shape of an
/// unpacked archive), descend into it.
pub fn resolve_single_subdir(path: &Path) -> PathBuf {
    let Ok(entries) = fs::read_dir(path) else {
        return path.to_path_buf();
    };
    let entries: Vec<_> = entries.flatten().collect();
    if entries.len() == 1 && entries[0].path().is_dir() {
        return entries[0].path();
    }
    path.to_path_buf()
}

/// Breadth-first search for the directory holding the nearest manifest,
/// skipping VCS and build directories.
pub fn find_manifest_dir(root: &Path) -> Option<PathBuf> {
    let mut queue = std::collections::VecDeque::from([root.to_path_buf()]);
    while let Some(dir) = queue.pop_front() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let mut subdirs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() {
                if !should_skip_dir(&name) {
                    subdirs.push(path);
                }
            } else if name.eq_ignore_ascii_case(MANIFEST_FILE) {
                return Some(dir);
            }
        }
        subdirs.sort();
        queue.extend(subdirs);
    }
    None
}

pub fn should_skip_dir(name: &str) -> bool {
    SKIPPED_DIRS.contains(&name)
}

pub fn has_file(dir: &Path, name: &str) -> bool {
    dir.join(name).exists()
}

/// List the context's files for the inspect endpoint: at most 400 entries
/// sorted by path, with content only for reasonably small valid-UTF-8
/// files; everything else is listed as non-editable.
pub fn collect_source_files(root: &Path) -> Vec<InspectFile> {
    let mut files = Vec::new();
    walk_source_files(root, root, &mut files);
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

fn walk_source_files(root: &Path, dir: &Path, files: &mut Vec<InspectFile>) {
    if files.len() >= MAX_INSPECT_FILES {
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if files.len() >= MAX_INSPECT_FILES {
            return;
        }
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !should_skip_dir(&name) {
                walk_source_files(root, &path, files);
            }
            continue;
        }

        let rel = path
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();

        let mut inspect = InspectFile {
            path: rel,
            content: String::new(),
            editable: false,
        };
        if let Ok(metadata) = entry.metadata() {
            if metadata.len() <= MAX_INSPECT_FILE_BYTES {
                if let Ok(data) = fs::read(&path) {
                    if is_text_content(&data) {
                        inspect.content = String::from_utf8(data).unwrap_or_default();
                        inspect.editable = true;
                    }
                }
            }
        }
        files.push(inspect);
    }
}

fn is_text_content(data: &[u8]) -> bool {
    if data.is_empty() {
        return true;
    }
    if data.contains(&0) {
        return false;
    }
    std::str::from_utf8(data).is_ok()
}
