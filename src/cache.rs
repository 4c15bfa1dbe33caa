//! Process-wide document cache.
//!
//! Holds the latest extracted text per file behind a `RwLock<Arc<_>>`.
//! A refresh builds a complete replacement snapshot without holding the lock
//! and then swaps the pointer; readers only clone the `Arc`, so they never
//! wait on extraction and never observe a half-built map.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::FilesConfig;
use crate::extract::extract_file;
use crate::scan::scan_folder;

/// An immutable view of every extracted document at one point in time.
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    documents: BTreeMap<String, String>,
    pub generation: u64,
    /// When the folder was read. `None` until the first successful refresh.
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl DocumentSnapshot {
    pub fn empty() -> Self {
        Self {
            documents: BTreeMap::new(),
            generation: 0,
            refreshed_at: None,
        }
    }

    /// Builds a snapshot directly from `(path, text)` pairs.
    pub fn from_documents<I, P, T>(documents: I) -> Self
    where
        I: IntoIterator<Item = (P, T)>,
        P: Into<String>,
        T: Into<String>,
    {
        Self {
            documents: documents
                .into_iter()
                .map(|(p, t)| (p.into(), t.into()))
                .collect(),
            generation: 0,
            refreshed_at: None,
        }
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.documents.get(path).map(String::as_str)
    }

    /// Documents in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.documents
            .iter()
            .map(|(p, t)| (p.as_str(), t.as_str()))
    }

    pub fn paths(&self) -> Vec<String> {
        self.documents.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Counts from one refresh cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub loaded: usize,
    /// Unsupported formats and files over the size limit.
    pub skipped: usize,
    pub failed: usize,
    pub generation: u64,
}

pub struct DocumentCache {
    current: RwLock<Arc<DocumentSnapshot>>,
}

impl DocumentCache {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(DocumentSnapshot::empty())),
        }
    }

    /// The latest complete snapshot.
    pub fn snapshot(&self) -> Arc<DocumentSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replaces the current snapshot as a whole.
    pub fn replace(&self, mut snapshot: DocumentSnapshot) -> Arc<DocumentSnapshot> {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        snapshot.generation = guard.generation + 1;
        let snapshot = Arc::new(snapshot);
        *guard = snapshot.clone();
        snapshot
    }

    /// Rescans the folder and swaps in a new snapshot.
    ///
    /// Extraction runs on a blocking thread. If the folder cannot be scanned
    /// the previous snapshot stays in place and the error is returned.
    pub async fn refresh(&self, files: &FilesConfig) -> Result<(Arc<DocumentSnapshot>, RefreshReport)> {
        let files = files.clone();
        let (snapshot, mut report) = tokio::task::spawn_blocking(move || load_folder(&files)).await??;
        let snapshot = self.replace(snapshot);
        report.generation = snapshot.generation;
        info!(
            loaded = report.loaded,
            skipped = report.skipped,
            failed = report.failed,
            generation = report.generation,
            "document cache refreshed"
        );
        Ok((snapshot, report))
    }
}

impl Default for DocumentCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts every file in the folder into a fresh snapshot.
///
/// A file that fails to extract is left out; the rest of the cycle continues.
pub fn load_folder(files: &FilesConfig) -> Result<(DocumentSnapshot, RefreshReport)> {
    let mut report = RefreshReport::default();
    let mut documents = BTreeMap::new();

    for file in scan_folder(files)? {
        if file.size > files.max_file_bytes {
            warn!(
                path = %file.path.display(),
                size = file.size,
                limit = files.max_file_bytes,
                "skipping file over size limit"
            );
            report.skipped += 1;
            continue;
        }
        match extract_file(&file.path) {
            Ok(Some(text)) => {
                documents.insert(path_key(&file.path), text);
                report.loaded += 1;
            }
            Ok(None) => {
                debug!(path = %file.path.display(), "unsupported format, skipped");
                report.skipped += 1;
            }
            Err(e) => {
                warn!(path = %file.path.display(), error = %e, "failed to extract file");
                report.failed += 1;
            }
        }
    }

    Ok((
        DocumentSnapshot {
            documents,
            generation: 0,
            refreshed_at: Some(Utc::now()),
        },
        report,
    ))
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
