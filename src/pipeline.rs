use std::collections::HashMap;
use std::fs;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalogue::{ApiSession, CatalogueClient};
use crate::domain::{IngestMode, ScanId, ScanRecord};
use crate::error::IngestError;
use crate::manifest::{ManifestEntry, ManifestStore};
use crate::paths::derive_path;
use crate::storage::{DEFAULT_COMMIT_MESSAGE, StorageAdapter, StorageBackend, StoreOutcome};
use crate::walk::{CatalogueWalker, SubtreeFailure, WalkItem};

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub dry_run: bool,
    pub commit: bool,
    pub commit_message: String,
    pub projects: Vec<String>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            commit: true,
            commit_message: DEFAULT_COMMIT_MESSAGE.to_string(),
            projects: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedScan {
    pub scan_id: String,
    pub path: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub mode: IngestMode,
    pub dry_run: bool,
    pub already_present: usize,
    pub registered: usize,
    pub fetched: usize,
    pub planned: usize,
    pub failed: Vec<FailedScan>,
    pub skipped_subtrees: Vec<SubtreeFailure>,
    pub committed: bool,
    pub commit_error: Option<String>,
    pub elapsed_ms: u64,
}

impl IngestSummary {
    fn new(mode: IngestMode, dry_run: bool) -> Self {
        Self {
            mode,
            dry_run,
            already_present: 0,
            registered: 0,
            fetched: 0,
            planned: 0,
            failed: Vec::new(),
            skipped_subtrees: Vec::new(),
            committed: false,
            commit_error: None,
            elapsed_ms: 0,
        }
    }

    /// Manifest rows appended during this run.
    pub fn newly_ingested(&self) -> usize {
        self.registered + self.fetched
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped_subtrees.is_empty() && self.commit_error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

fn emit(sink: &dyn ProgressSink, message: String) {
    sink.event(ProgressEvent {
        message,
        elapsed: None,
    });
}

/// Sequential ingestion: one scan at a time, in catalogue order, with the manifest
/// append as the only point where a scan becomes "done".
pub struct Ingestor<S: StorageBackend> {
    dataset_root: Utf8PathBuf,
    manifest: ManifestStore,
    storage: StorageAdapter<S>,
    options: IngestOptions,
    auth_generation: Option<u64>,
    planned: HashMap<String, ScanId>,
}

impl<S: StorageBackend> Ingestor<S> {
    pub fn new(
        dataset_root: Utf8PathBuf,
        manifest: ManifestStore,
        storage: StorageAdapter<S>,
        options: IngestOptions,
    ) -> Self {
        Self {
            dataset_root,
            manifest,
            storage,
            options,
            auth_generation: None,
            planned: HashMap::new(),
        }
    }

    pub fn into_parts(self) -> (ManifestStore, StorageAdapter<S>) {
        (self.manifest, self.storage)
    }

    pub fn run<C: CatalogueClient + ?Sized>(
        &mut self,
        client: &C,
        session: &mut ApiSession,
        sink: &dyn ProgressSink,
    ) -> Result<IngestSummary, IngestError> {
        let started = Instant::now();
        let mode = self.storage.mode();
        let dry_run = self.options.dry_run;
        let mut summary = IngestSummary::new(mode, dry_run);

        info!(
            dataset = %self.dataset_root,
            %mode,
            dry_run,
            known = self.manifest.len(),
            "starting ingest"
        );
        emit(sink, "phase=Resolve; walking catalogue".to_string());

        let mut walker =
            CatalogueWalker::new(client, session).with_projects(self.options.projects.clone());
        while let Some(item) = walker.next() {
            match item? {
                WalkItem::Skipped(failure) => {
                    let message = format!(
                        "skipped {} {}: {}",
                        failure.level, failure.identity, failure.reason
                    );
                    emit(sink, message);
                    summary.skipped_subtrees.push(failure);
                }
                WalkItem::Rejected(rejected) => {
                    emit(sink, format!("failed {}: {}", rejected.identity, rejected.reason));
                    summary.failed.push(FailedScan {
                        scan_id: rejected.identity,
                        path: None,
                        reason: rejected.reason,
                    });
                }
                WalkItem::Scan(record) => {
                    self.process(&record, walker.session(), &mut summary, sink)?
                }
            }
        }

        if !dry_run && self.options.commit && summary.newly_ingested() > 0 {
            emit(sink, "phase=Commit; saving dataset".to_string());
            match self.storage.commit(&self.options.commit_message) {
                Ok(()) => summary.committed = true,
                Err(err) => {
                    warn!(error = %err, "dataset commit failed; changes stay unsaved in the tree");
                    summary.commit_error = Some(err.to_string());
                }
            }
        }

        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            present = summary.already_present,
            registered = summary.registered,
            fetched = summary.fetched,
            planned = summary.planned,
            failed = summary.failed.len(),
            skipped = summary.skipped_subtrees.len(),
            "ingest finished"
        );
        sink.event(ProgressEvent {
            message: "phase=Done; ingest finished".to_string(),
            elapsed: Some(started.elapsed()),
        });
        Ok(summary)
    }

    /// Pushes the bearer token to the storage collaborator before its first use and again
    /// whenever the session has re-logged in.
    fn sync_authorization(&mut self, session: &ApiSession) -> Result<(), IngestError> {
        if self.auth_generation == Some(session.generation()) {
            return Ok(());
        }
        if let Some(token) = session.token() {
            debug!(generation = session.generation(), "refreshing storage authorization");
            self.storage.set_authorization(token)?;
        }
        self.auth_generation = Some(session.generation());
        Ok(())
    }

    fn process(
        &mut self,
        record: &ScanRecord,
        session: &ApiSession,
        summary: &mut IngestSummary,
        sink: &dyn ProgressSink,
    ) -> Result<(), IngestError> {
        let scan_id = &record.scan.id;
        if self.manifest.exists(scan_id) {
            debug!(scan = %scan_id, "already in manifest");
            summary.already_present += 1;
            emit(sink, format!("present {scan_id}"));
            return Ok(());
        }

        let path = derive_path(&record.project, &record.subject, &record.session, &record.scan);
        let relative = path.relative_path();

        let claimed = self
            .manifest
            .claimed_by(relative.as_str())
            .or_else(|| self.planned.get(relative.as_str()));
        if let Some(existing) = claimed {
            let err = IngestError::PathCollision {
                path: relative.to_string(),
                existing: existing.to_string(),
            };
            warn!(scan = %scan_id, error = %err, "scan maps onto a path owned by another scan");
            self.fail(summary, sink, record, Some(relative.as_str()), err);
            return Ok(());
        }

        if self.options.dry_run {
            self.planned.insert(relative.to_string(), scan_id.clone());
            summary.planned += 1;
            emit(sink, format!("planned {relative}"));
            return Ok(());
        }

        let dir = path.absolute_dir(&self.dataset_root);
        if let Err(err) = fs::create_dir_all(dir.as_std_path()) {
            let err = IngestError::Filesystem(format!("create {dir}: {err}"));
            self.fail(summary, sink, record, Some(relative.as_str()), err);
            return Ok(());
        }

        let phase = match self.storage.mode() {
            IngestMode::Reference => "Register",
            IngestMode::Eager => "Fetch",
        };
        emit(sink, format!("phase={phase}; {relative}"));
        match self.sync_authorization(session) {
            Ok(()) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(scan = %scan_id, error = %err, "could not pass the token to storage");
                self.fail(summary, sink, record, Some(relative.as_str()), err);
                return Ok(());
            }
        }

        match self.storage.ingest(&relative, &record.scan.url) {
            Ok(outcome) => {
                let entry = ManifestEntry::new(record, &path, self.storage.mode());
                self.manifest.append(&entry)?;
                match outcome {
                    StoreOutcome::Registered => {
                        summary.registered += 1;
                        emit(sink, format!("registered {relative}"));
                    }
                    StoreOutcome::Fetched => {
                        summary.fetched += 1;
                        emit(sink, format!("fetched {relative}"));
                    }
                }
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(
                    scan = %scan_id,
                    path = %relative,
                    error = %err,
                    "storage failed; scan will be retried next run"
                );
                self.fail(summary, sink, record, Some(relative.as_str()), err);
                Ok(())
            }
        }
    }

    fn fail(
        &self,
        summary: &mut IngestSummary,
        sink: &dyn ProgressSink,
        record: &ScanRecord,
        path: Option<&str>,
        err: IngestError,
    ) {
        emit(sink, format!("failed {}: {err}", record.scan.id));
        summary.failed.push(FailedScan {
            scan_id: record.scan.id.to_string(),
            path: path.map(|value| value.to_string()),
            reason: err.to_string(),
        });
    }
}
