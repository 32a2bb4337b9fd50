//! Depth-first walk of projects → subjects → sessions → scans.
//!
//! A session that cannot be dated or listed is skipped alone; a file entry that cannot be
//! parsed is rejected alone.
//!
//! Each level is listed only when its parent is reached, so at most one listing per
//! level is held in memory. Scans come out in catalogue order, which is also the order
//! in which manifest rows are appended.

use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::catalogue::{ApiSession, CatalogueClient, RejectedFile};
use crate::domain::{Label, Project, ScanRecord, Subject};
use crate::error::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Project,
    Subject,
    Session,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Project => write!(f, "project"),
            Level::Subject => write!(f, "subject"),
            Level::Session => write!(f, "session"),
        }
    }
}

/// A part of the catalogue that could not be listed and was skipped for this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubtreeFailure {
    pub level: Level,
    pub identity: String,
    pub reason: String,
}

#[derive(Debug)]
pub enum WalkItem {
    Scan(Box<ScanRecord>),
    /// A listing entry that could not become a scan.
    Rejected(RejectedFile),
    Skipped(SubtreeFailure),
}

pub struct CatalogueWalker<'a, C: CatalogueClient + ?Sized> {
    client: &'a C,
    session: &'a mut ApiSession,
    allow: Vec<String>,
    started: bool,
    finished: bool,
    projects: VecDeque<Project>,
    subjects: VecDeque<(Project, Subject)>,
    visits: VecDeque<(Project, Subject, Label)>,
    scans: VecDeque<ScanRecord>,
    rejected: VecDeque<RejectedFile>,
}

impl<'a, C: CatalogueClient + ?Sized> CatalogueWalker<'a, C> {
    pub fn new(client: &'a C, session: &'a mut ApiSession) -> Self {
        Self {
            client,
            session,
            allow: Vec::new(),
            started: false,
            finished: false,
            projects: VecDeque::new(),
            subjects: VecDeque::new(),
            visits: VecDeque::new(),
            scans: VecDeque::new(),
            rejected: VecDeque::new(),
        }
    }

    /// Restricts the walk to the named projects. An empty list means every project.
    pub fn with_projects(mut self, allow: Vec<String>) -> Self {
        self.allow = allow;
        self
    }

    pub fn session(&self) -> &ApiSession {
        &*self.session
    }

    fn fail(&mut self, err: IngestError) -> Option<Result<WalkItem, IngestError>> {
        self.finished = true;
        Some(Err(err))
    }

    fn skip(
        &mut self,
        level: Level,
        identity: String,
        err: IngestError,
    ) -> Option<Result<WalkItem, IngestError>> {
        if err.is_fatal() {
            return self.fail(err);
        }
        warn!(%level, identity = %identity, error = %err, "skipping catalogue sub-tree");
        Some(Ok(WalkItem::Skipped(SubtreeFailure {
            level,
            identity,
            reason: err.to_string(),
        })))
    }

    fn start(&mut self) -> Result<(), IngestError> {
        let mut projects = self.client.list_projects(self.session).map_err(|err| match err {
            IngestError::Auth(_) => err,
            other => IngestError::CatalogueRoot(Box::new(other)),
        })?;
        if !self.allow.is_empty() {
            for name in &self.allow {
                if !projects.iter().any(|project| project.name.as_str() == name) {
                    warn!(project = %name, "requested project is not listed by the catalogue");
                }
            }
            projects.retain(|project| self.allow.iter().any(|name| name == project.name.as_str()));
        }
        debug!(count = projects.len(), "projects listed");
        self.projects = projects.into();
        Ok(())
    }
}

impl<C: CatalogueClient + ?Sized> Iterator for CatalogueWalker<'_, C> {
    type Item = Result<WalkItem, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if !self.started {
            self.started = true;
            if let Err(err) = self.start() {
                return self.fail(err);
            }
        }

        loop {
            if let Some(rejected) = self.rejected.pop_front() {
                warn!(file = %rejected.identity, reason = %rejected.reason, "rejecting listed file");
                return Some(Ok(WalkItem::Rejected(rejected)));
            }
            if let Some(record) = self.scans.pop_front() {
                return Some(Ok(WalkItem::Scan(Box::new(record))));
            }

            if let Some((project, subject, label)) = self.visits.pop_front() {
                let listed = match self.client.describe_session(self.session, &subject, &label) {
                    Ok(visit) => self
                        .client
                        .list_scans(self.session, &visit)
                        .map(|listing| (visit, listing)),
                    Err(err) => Err(err),
                };
                match listed {
                    Ok((visit, listing)) => {
                        debug!(
                            candidate = %subject.cand_id,
                            visit = %visit.label,
                            count = listing.scans.len(),
                            rejected = listing.rejected.len(),
                            "scans listed"
                        );
                        self.rejected = listing.rejected.into();
                        self.scans = listing
                            .scans
                            .into_iter()
                            .map(|scan| ScanRecord {
                                project: project.clone(),
                                subject: subject.clone(),
                                session: visit.clone(),
                                scan,
                            })
                            .collect();
                        continue;
                    }
                    Err(err) => {
                        let identity = format!("{}/{}/{label}", project.name, subject.cand_id);
                        return self.skip(Level::Session, identity, err);
                    }
                }
            }

            if let Some((project, subject)) = self.subjects.pop_front() {
                match self.client.list_sessions(self.session, &subject) {
                    Ok(visits) => {
                        self.visits = visits
                            .into_iter()
                            .map(|label| (project.clone(), subject.clone(), label))
                            .collect();
                        continue;
                    }
                    Err(err) => {
                        let identity = format!("{}/{}", project.name, subject.cand_id);
                        return self.skip(Level::Subject, identity, err);
                    }
                }
            }

            if let Some(project) = self.projects.pop_front() {
                match self.client.list_subjects(self.session, &project) {
                    Ok(subjects) => {
                        debug!(project = %project.name, count = subjects.len(), "subjects listed");
                        self.subjects = subjects
                            .into_iter()
                            .map(|subject| (project.clone(), subject))
                            .collect();
                        continue;
                    }
                    Err(err) => {
                        let identity = project.name.to_string();
                        return self.skip(Level::Project, identity, err);
                    }
                }
            }

            self.finished = true;
            return None;
        }
    }
}
