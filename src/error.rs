use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("authentication failed: {0}")]
    #[diagnostic(help("check LORIS_USERNAME / LORIS_PASSWORD or the credentials you entered"))]
    Auth(String),

    #[error("catalogue request failed: {0}")]
    CatalogueHttp(String),

    #[error("catalogue returned status {status} for {url}: {message}")]
    CatalogueStatus {
        status: u16,
        url: String,
        message: String,
    },

    #[error("malformed catalogue record ({context}): {message}")]
    MalformedRecord { context: String, message: String },

    #[error("cannot list projects from the catalogue")]
    CatalogueRoot(#[source] Box<IngestError>),

    #[error("storage operation failed for {path}: {message}")]
    Storage { path: String, message: String },

    #[error("required tool not found: {0}")]
    #[diagnostic(help("install datalad and git-annex and make sure they are on PATH"))]
    MissingTool(String),

    #[error("path {path} is already claimed by scan {existing}")]
    PathCollision { path: String, existing: String },

    #[error("manifest {} is corrupt at line {line}: {message}", path.display())]
    #[diagnostic(help("the manifest is the record of ingested scans; repair or restore it before re-running"))]
    ManifestCorruption {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("missing setting `{0}` (pass it on the command line or in the config file)")]
    MissingSetting(&'static str),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid identifier: {0:?}")]
    InvalidLabel(String),
}

impl IngestError {
    /// Errors that end the whole run rather than a single sub-tree or scan.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::Auth(_)
                | IngestError::CatalogueRoot(_)
                | IngestError::ManifestCorruption { .. }
                | IngestError::MissingTool(_)
        )
    }
}
