//! Document folder enumeration.
//!
//! Walks `[files].folder` (top level only unless `recursive = true`),
//! applies include/exclude globs against the path relative to the folder,
//! and returns the matching files sorted for deterministic ordering.
//!
//! Only a missing folder fails the scan. An entry the walk cannot read is
//! logged and skipped.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::PathBuf;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::FilesConfig;

/// A file selected for extraction.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub size: u64,
}

pub fn scan_folder(files: &FilesConfig) -> Result<Vec<ScannedFile>> {
    let root = &files.folder;
    if !root.is_dir() {
        bail!("Document folder does not exist: {}", root.display());
    }

    let include_set = build_globset(&files.include_globs)?;

    let mut default_excludes = vec!["**/.git/**".to_string(), "**/~$*".to_string()];
    default_excludes.extend(files.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let max_depth = if files.recursive { usize::MAX } else { 1 };

    let mut out = Vec::new();
    for entry in WalkDir::new(root).max_depth(max_depth).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(
                    path = %e.path().map(|p| p.display().to_string()).unwrap_or_default(),
                    error = %e,
                    "skipping unreadable entry"
                );
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        out.push(ScannedFile {
            path: path.to_path_buf(),
            size,
        });
    }

    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn names(files: &[ScannedFile]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn top_level_only_by_default() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("b.txt"), "b").unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();
        fs::create_dir(tmp.path().join("nested")).unwrap();
        fs::write(tmp.path().join("nested").join("c.txt"), "c").unwrap();

        let files = scan_folder(&FilesConfig::new(tmp.path())).unwrap();
        assert_eq!(names(&files), vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn recursive_and_globs() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();
        fs::write(tmp.path().join("skip.log"), "x").unwrap();
        fs::write(tmp.path().join("~$lock.docx"), "x").unwrap();
        fs::create_dir(tmp.path().join("nested")).unwrap();
        fs::write(tmp.path().join("nested").join("c.txt"), "c").unwrap();

        let mut cfg = FilesConfig::new(tmp.path());
        cfg.recursive = true;
        cfg.exclude_globs = vec!["*.log".to_string()];
        let files = scan_folder(&cfg).unwrap();
        assert_eq!(names(&files), vec!["a.txt", "c.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_entries_do_not_abort_the_scan() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("gone.txt"), tmp.path().join("dangling.txt"))
            .unwrap();
        fs::create_dir(tmp.path().join("nested")).unwrap();
        fs::write(tmp.path().join("nested").join("c.txt"), "c").unwrap();
        std::os::unix::fs::symlink(tmp.path(), tmp.path().join("nested").join("loop")).unwrap();

        let files = scan_folder(&FilesConfig::new(tmp.path())).unwrap();
        assert_eq!(names(&files), vec!["a.txt"]);

        let mut cfg = FilesConfig::new(tmp.path());
        cfg.recursive = true;
        let files = scan_folder(&cfg).unwrap();
        assert_eq!(names(&files), vec!["a.txt", "c.txt"]);
    }

    #[test]
    fn missing_folder_is_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = FilesConfig::new(tmp.path().join("nope"));
        assert!(scan_folder(&cfg).is_err());
    }
}
