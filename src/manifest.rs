//! Durable ledger of ingested scans.
//!
//! The manifest is a JSON-lines file at the dataset root. Each append is a single
//! `\n`-terminated write followed by `sync_data`, so a crash can at worst leave an
//! unterminated last line. If that line still holds a whole entry (for example after a
//! hand edit) it is kept and terminated; otherwise the torn tail is dropped on the next
//! open and the file is rewritten through a temp file and rename. A complete line that
//! does not parse is never skipped: it fails the open with
//! [`IngestError::ManifestCorruption`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{IngestMode, ScanId, ScanRecord};
use crate::error::IngestError;
use crate::paths::ScanPath;

pub const DEFAULT_MANIFEST_NAME: &str = "images_manifest.jsonl";

/// How the manifest file ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    Clean,
    /// The last entry parsed but has no trailing newline.
    Unterminated,
    /// The last line is a partial write; only the first `valid_len` bytes are good.
    Torn { valid_len: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub scan_id: ScanId,
    pub project: String,
    pub candidate: String,
    pub visit: String,
    pub modality: String,
    pub filename: String,
    pub path: String,
    pub url: String,
    pub mode: IngestMode,
    pub ingested_at: DateTime<Utc>,
}

impl ManifestEntry {
    pub fn new(record: &ScanRecord, path: &ScanPath, mode: IngestMode) -> Self {
        Self {
            scan_id: record.scan.id.clone(),
            project: record.project.name.to_string(),
            candidate: record.subject.cand_id.to_string(),
            visit: record.session.label.to_string(),
            modality: path.modality.to_string(),
            filename: path.filename.clone(),
            path: path.relative_path().to_string(),
            url: record.scan.url.clone(),
            mode,
            ingested_at: Utc::now(),
        }
    }
}

/// Membership index built from the durable file: scan identities and the paths they claim.
#[derive(Debug, Default, Clone)]
pub struct ManifestIndex {
    ids: HashSet<ScanId>,
    paths: HashMap<String, ScanId>,
}

impl ManifestIndex {
    pub fn contains(&self, id: &ScanId) -> bool {
        self.ids.contains(id)
    }

    pub fn claimed_by(&self, path: &str) -> Option<&ScanId> {
        self.paths.get(path)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn insert(&mut self, entry: &ManifestEntry) -> bool {
        if !self.ids.insert(entry.scan_id.clone()) {
            return false;
        }
        self.paths.insert(entry.path.clone(), entry.scan_id.clone());
        true
    }
}

#[derive(Debug)]
pub struct ManifestStore {
    path: Utf8PathBuf,
    index: ManifestIndex,
    writer: Option<File>,
    read_only: bool,
}

impl ManifestStore {
    /// Loads the index from disk, repairing a torn final line if one is found.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, IngestError> {
        let path = path.into();
        let (index, tail) = Self::read_index(&path)?;
        match tail {
            Tail::Clean => {}
            Tail::Unterminated => {
                warn!(manifest = %path, "last manifest entry has no newline; terminating it");
                terminate_last_line(&path)?;
            }
            Tail::Torn { valid_len } => {
                warn!(manifest = %path, valid_len, "dropping torn manifest tail from an interrupted append");
                truncate_atomic(&path, valid_len)?;
            }
        }
        debug!(manifest = %path, entries = index.len(), "manifest loaded");
        Ok(Self {
            path,
            index,
            writer: None,
            read_only: false,
        })
    }

    /// Loads the index for planning. A torn tail is left in place and appends are refused.
    pub fn open_read_only(path: impl Into<Utf8PathBuf>) -> Result<Self, IngestError> {
        let path = path.into();
        let (index, _) = Self::read_index(&path)?;
        Ok(Self {
            path,
            index,
            writer: None,
            read_only: true,
        })
    }

    fn read_index(path: &Utf8Path) -> Result<(ManifestIndex, Tail), IngestError> {
        let mut index = ManifestIndex::default();
        let tail = read_entries(path, |line, entry| {
            let scan_id = entry.scan_id.clone();
            if index.insert(&entry) {
                Ok(())
            } else {
                Err(IngestError::ManifestCorruption {
                    path: path.as_std_path().to_path_buf(),
                    line,
                    message: format!("duplicate scan id {scan_id}"),
                })
            }
        })?;
        Ok((index, tail))
    }

    pub fn exists(&self, id: &ScanId) -> bool {
        self.index.contains(id)
    }

    pub fn claimed_by(&self, path: &str) -> Option<&ScanId> {
        self.index.claimed_by(path)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Appends one entry and syncs it to disk. The entry counts as ingested only once this returns `Ok`.
    pub fn append(&mut self, entry: &ManifestEntry) -> Result<(), IngestError> {
        if self.read_only {
            return Err(IngestError::Manifest(format!(
                "{} was opened read-only",
                self.path
            )));
        }
        if self.index.contains(&entry.scan_id) {
            return Err(IngestError::Manifest(format!(
                "scan {} is already recorded",
                entry.scan_id
            )));
        }
        let mut line =
            serde_json::to_vec(entry).map_err(|err| IngestError::Manifest(err.to_string()))?;
        line.push(b'\n');

        let path = self.path.clone();
        let writer = self.writer()?;
        let before = writer
            .metadata()
            .map_err(|err| IngestError::Manifest(format!("stat {path}: {err}")))?
            .len();

        let written = writer.write_all(&line).and_then(|_| writer.sync_data());
        if let Err(err) = written {
            // Roll back any partial bytes so the next append starts on a clean line.
            if let Err(rollback) = writer.set_len(before) {
                warn!(
                    manifest = %path,
                    len = before,
                    error = %rollback,
                    "could not roll back a failed append; the tail is repaired on next open"
                );
            }
            self.writer = None;
            return Err(IngestError::Manifest(format!("append to {path}: {err}")));
        }

        self.index.insert(entry);
        Ok(())
    }

    fn writer(&mut self) -> Result<&mut File, IngestError> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent.as_std_path())
                    .map_err(|err| IngestError::Filesystem(err.to_string()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path.as_std_path())
                .map_err(|err| IngestError::Manifest(format!("open {}: {err}", self.path)))?;
            self.writer = Some(file);
        }
        self.writer
            .as_mut()
            .ok_or_else(|| IngestError::Manifest("manifest writer unavailable".to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestStatus {
    pub manifest: String,
    pub total: usize,
    pub by_project: BTreeMap<String, usize>,
    pub by_mode: BTreeMap<String, usize>,
    pub torn_tail: bool,
}

/// Streams the manifest and counts entries per project and per ingestion mode.
pub fn summarize(path: &Utf8Path) -> Result<ManifestStatus, IngestError> {
    let mut seen = HashSet::new();
    let mut by_project = BTreeMap::new();
    let mut by_mode = BTreeMap::new();
    let tail = read_entries(path, |line, entry| {
        if !seen.insert(entry.scan_id.clone()) {
            return Err(IngestError::ManifestCorruption {
                path: path.as_std_path().to_path_buf(),
                line,
                message: format!("duplicate scan id {}", entry.scan_id),
            });
        }
        *by_project.entry(entry.project).or_insert(0) += 1;
        *by_mode.entry(entry.mode.to_string()).or_insert(0) += 1;
        Ok(())
    })?;
    Ok(ManifestStatus {
        manifest: path.to_string(),
        total: seen.len(),
        by_project,
        by_mode,
        torn_tail: matches!(tail, Tail::Torn { .. }),
    })
}

/// Visits every complete entry in order and reports how the file ends.
fn read_entries<F>(path: &Utf8Path, mut visit: F) -> Result<Tail, IngestError>
where
    F: FnMut(usize, ManifestEntry) -> Result<(), IngestError>,
{
    let file = match File::open(path.as_std_path()) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Tail::Clean),
        Err(err) => return Err(IngestError::Manifest(format!("open {path}: {err}"))),
    };
    let corrupt = |line: usize, message: String| IngestError::ManifestCorruption {
        path: path.as_std_path().to_path_buf(),
        line,
        message,
    };

    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut offset = 0u64;
    let mut line = 0usize;
    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .map_err(|err| IngestError::Manifest(format!("read {path}: {err}")))?;
        if read == 0 {
            return Ok(Tail::Clean);
        }
        line += 1;
        if buf.last() != Some(&b'\n') {
            let whole = std::str::from_utf8(&buf)
                .ok()
                .and_then(|text| serde_json::from_str::<ManifestEntry>(text.trim()).ok());
            return match whole {
                Some(entry) => {
                    visit(line, entry)?;
                    Ok(Tail::Unterminated)
                }
                None => Ok(Tail::Torn { valid_len: offset }),
            };
        }
        offset += read as u64;

        let text = std::str::from_utf8(&buf[..read - 1])
            .map_err(|err| corrupt(line, err.to_string()))?
            .trim();
        if text.is_empty() {
            continue;
        }
        let entry: ManifestEntry =
            serde_json::from_str(text).map_err(|err| corrupt(line, err.to_string()))?;
        visit(line, entry)?;
    }
}

fn terminate_last_line(path: &Utf8Path) -> Result<(), IngestError> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path.as_std_path())
        .map_err(|err| IngestError::Manifest(format!("open {path}: {err}")))?;
    file.write_all(b"\n")
        .and_then(|_| file.sync_data())
        .map_err(|err| IngestError::Manifest(format!("append to {path}: {err}")))
}

fn truncate_atomic(path: &Utf8Path, valid_len: u64) -> Result<(), IngestError> {
    let parent = path
        .parent()
        .ok_or_else(|| IngestError::Manifest(format!("manifest has no parent dir: {path}")))?;
    let source = File::open(path.as_std_path())
        .map_err(|err| IngestError::Manifest(format!("open {path}: {err}")))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".manifest")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    io::copy(&mut source.take(valid_len), temp.as_file_mut())
        .map_err(|err| IngestError::Manifest(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| IngestError::Manifest(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| IngestError::Manifest(err.to_string()))?;
    Ok(())
}
