//! Job workspaces and output file finalization.
//!
//! Every job downloads into a private `job_<uuid>` directory that is removed
//! when the [`JobWorkspace`] is dropped, on success, error and cancellation
//! alike. Finalization picks the produced file out of the workspace and gives
//! it a sanitized, human-readable name.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Longest file stem handed to the delivery sink, in characters.
pub const MAX_FILENAME_CHARS: usize = 100;

/// Stem used when the title sanitizes to nothing.
pub const FALLBACK_STEM: &str = "media";

/// Extensions of extractor scratch files that are never the result.
const PARTIAL_EXTENSIONS: &[&str] = &["part", "ytdl", "tmp", "temp", "json", "txt"];

/// A job's private scratch directory.
#[derive(Debug)]
pub struct JobWorkspace {
    path: PathBuf,
}

impl JobWorkspace {
    /// Create `root/job_<uuid>`.
    pub fn create(root: &Path) -> io::Result<Self> {
        let path = root.join(format!("job_{}", Uuid::new_v4()));
        fs::create_dir_all(&path)?;
        debug!(path = %path.display(), "workspace created");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Empty the workspace, e.g. between download attempts.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::create_dir_all(&self.path)
    }

    /// Path for a file inside the workspace.
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "workspace removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove workspace"),
        }
    }
}

/// Turn a media title into a safe file stem.
///
/// Path separators, reserved characters and control characters become `_`,
/// whitespace runs collapse, leading/trailing dots and spaces are trimmed,
/// and the result is capped at [`MAX_FILENAME_CHARS`] characters.
pub fn sanitize_filename(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_space = false;
    for c in title.chars() {
        let c = match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => ' ',
            c => c,
        };
        if c.is_whitespace() {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(c);
            last_space = false;
        }
    }

    let capped: String = out
        .trim_matches(|c: char| c == '.' || c.is_whitespace())
        .chars()
        .take(MAX_FILENAME_CHARS)
        .collect();
    let capped = capped.trim_end_matches(|c: char| c == '.' || c.is_whitespace());
    if capped.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        capped.to_string()
    }
}

/// `{sanitized title}.{ext}`
pub fn output_file_name(title: Option<&str>, ext: &str) -> String {
    format!("{}.{}", sanitize_filename(title.unwrap_or("")), ext)
}

fn is_partial(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| PARTIAL_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Largest non-partial file under `dir`, if any.
pub fn find_downloaded_file(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && !is_partial(e.path()))
        .filter_map(|e| {
            let size = e.metadata().ok()?.len();
            (size > 0).then(|| (size, e.into_path()))
        })
        .max_by_key(|(size, _)| *size)
        .map(|(_, path)| path)
}

/// Move a file, falling back to copy + remove across filesystems.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_err() {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}

/// Rename `downloaded` to its final name next to it.
///
/// An existing file with that name gets a numeric suffix instead of being
/// overwritten.
pub fn finalize_file(downloaded: &Path, title: Option<&str>, ext: &str) -> io::Result<PathBuf> {
    let dir = downloaded.parent().unwrap_or_else(|| Path::new("."));
    let name = output_file_name(title, ext);
    let mut target = dir.join(&name);
    if target == downloaded {
        return Ok(target);
    }
    let stem = name
        .rsplit_once('.')
        .map(|(stem, _)| stem.to_string())
        .unwrap_or_else(|| name.clone());
    let mut n = 1;
    while target.exists() {
        target = dir.join(format!("{} ({}).{}", stem, n, ext));
        n += 1;
    }
    move_file(downloaded, &target)?;
    debug!(from = %downloaded.display(), to = %target.display(), "output finalized");
    Ok(target)
}
