use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::domain::IngestMode;
use crate::error::IngestError;

pub const DEFAULT_COMMIT_MESSAGE: &str =
    "Ingest LORIS images via API (multi-project, BIDS, incremental)";

/// The version-tracked large-file store that owns the dataset tree.
/// All paths are relative to the dataset root.
pub trait StorageBackend: Send + Sync {
    fn is_registered(&self, path: &Utf8Path) -> bool;
    fn register(&self, path: &Utf8Path, url: &str) -> Result<(), IngestError>;
    fn fetch(&self, path: &Utf8Path) -> Result<(), IngestError>;
    fn commit(&self, message: &str) -> Result<(), IngestError>;
    fn set_authorization(&self, token: &str) -> Result<(), IngestError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Registered,
    Fetched,
}

pub struct StorageAdapter<S: StorageBackend> {
    backend: S,
    mode: IngestMode,
}

impl<S: StorageBackend> StorageAdapter<S> {
    pub fn new(backend: S, mode: IngestMode) -> Self {
        Self { backend, mode }
    }

    pub fn mode(&self) -> IngestMode {
        self.mode
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    pub fn into_backend(self) -> S {
        self.backend
    }

    /// Registers `path` by URL without transferring bytes. An already present path is left alone.
    pub fn register(&self, path: &Utf8Path, url: &str) -> Result<(), IngestError> {
        if self.backend.is_registered(path) {
            debug!(%path, "already tracked; not registering again");
            return Ok(());
        }
        self.backend.register(path, url)
    }

    pub fn register_and_fetch(&self, path: &Utf8Path, url: &str) -> Result<(), IngestError> {
        self.register(path, url)?;
        self.backend.fetch(path)
    }

    /// Dispatches on the run's mode.
    pub fn ingest(&self, path: &Utf8Path, url: &str) -> Result<StoreOutcome, IngestError> {
        match self.mode {
            IngestMode::Reference => {
                self.register(path, url)?;
                Ok(StoreOutcome::Registered)
            }
            IngestMode::Eager => {
                self.register_and_fetch(path, url)?;
                Ok(StoreOutcome::Fetched)
            }
        }
    }

    pub fn commit(&self, message: &str) -> Result<(), IngestError> {
        self.backend.commit(message)
    }

    pub fn set_authorization(&self, token: &str) -> Result<(), IngestError> {
        self.backend.set_authorization(token)
    }
}

/// Drives `datalad` and `git annex` in the dataset root.
pub struct DataladStorage {
    root: Utf8PathBuf,
    git: Option<PathBuf>,
    git_annex: Option<PathBuf>,
    datalad: Option<PathBuf>,
    authorization: Mutex<Option<String>>,
}

impl DataladStorage {
    /// Storage rooted at `root` as given. Used for dry runs, where the directory may not exist.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self::with_tools(
            root,
            find_in_path("git"),
            find_in_path("git-annex"),
            find_in_path("datalad"),
        )
    }

    /// Creates the dataset directory if needed and anchors the storage at its canonical path.
    pub fn open(root: &Utf8Path) -> Result<Self, IngestError> {
        let root = absolute_root(root)?;
        Ok(Self::new(root))
    }

    fn with_tools(
        root: Utf8PathBuf,
        git: Option<PathBuf>,
        git_annex: Option<PathBuf>,
        datalad: Option<PathBuf>,
    ) -> Self {
        Self {
            root,
            git,
            git_annex,
            datalad,
            authorization: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn check_tools(&self) -> Result<(), IngestError> {
        self.require_git()?;
        self.require_datalad()?;
        if self.git_annex.is_none() {
            return Err(IngestError::MissingTool("git-annex".to_string()));
        }
        Ok(())
    }

    /// Creates the DataLad dataset in the root on first use.
    pub fn ensure_dataset(&self) -> Result<(), IngestError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| IngestError::Filesystem(format!("create {}: {err}", self.root)))?;
        if self.root.join(".datalad").as_std_path().exists() {
            return Ok(());
        }
        info!(dataset = %self.root, "creating DataLad dataset");
        let datalad = self.require_datalad()?;
        let args = vec![
            "create".to_string(),
            "-c".to_string(),
            "text2git".to_string(),
            "--force".to_string(),
            ".".to_string(),
        ];
        self.run_cmd(datalad, &args, self.root.as_str())
    }

    fn require_git(&self) -> Result<&PathBuf, IngestError> {
        self.git
            .as_ref()
            .ok_or_else(|| IngestError::MissingTool("git".to_string()))
    }

    fn require_datalad(&self) -> Result<&PathBuf, IngestError> {
        self.datalad
            .as_ref()
            .ok_or_else(|| IngestError::MissingTool("datalad".to_string()))
    }

    fn run_cmd(&self, program: &Path, args: &[String], subject: &str) -> Result<(), IngestError> {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(self.root.as_std_path());
        if let Ok(guard) = self.authorization.lock() {
            if let Some(token) = guard.as_ref() {
                cmd.env("GIT_ANNEX_URL_AUTHORIZATION", format!("Bearer {token}"));
            }
        }
        debug!(program = %program.display(), ?args, "running storage command");
        let output = cmd.output().map_err(|err| IngestError::Storage {
            path: subject.to_string(),
            message: format!("spawn {}: {err}", program.display()),
        })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("command failed: {} ({})", program.display(), output.status)
        } else {
            stderr
        };
        Err(IngestError::Storage {
            path: subject.to_string(),
            message,
        })
    }
}

impl StorageBackend for DataladStorage {
    fn is_registered(&self, path: &Utf8Path) -> bool {
        // Annexed files without content are dangling symlinks, so `exists()` is not enough.
        fs::symlink_metadata(self.root.join(path).as_std_path()).is_ok()
    }

    fn register(&self, path: &Utf8Path, url: &str) -> Result<(), IngestError> {
        let git = self.require_git()?;
        let args = vec![
            "annex".to_string(),
            "addurl".to_string(),
            url.to_string(),
            "--file".to_string(),
            path.to_string(),
            "--fast".to_string(),
            "--relaxed".to_string(),
        ];
        self.run_cmd(git, &args, path.as_str())
    }

    fn fetch(&self, path: &Utf8Path) -> Result<(), IngestError> {
        let datalad = self.require_datalad()?;
        let args = vec!["get".to_string(), path.to_string()];
        self.run_cmd(datalad, &args, path.as_str())
    }

    fn commit(&self, message: &str) -> Result<(), IngestError> {
        let datalad = self.require_datalad()?;
        let args = vec!["save".to_string(), "-m".to_string(), message.to_string()];
        self.run_cmd(datalad, &args, self.root.as_str())
    }

    fn set_authorization(&self, token: &str) -> Result<(), IngestError> {
        let git = self.require_git()?;
        let allow = vec![
            "config".to_string(),
            "annex.security.allowed-http-addresses".to_string(),
            "all".to_string(),
        ];
        self.run_cmd(git, &allow, self.root.as_str())?;
        let header = vec![
            "config".to_string(),
            "annex.http-headers".to_string(),
            format!("Authorization: Bearer {token}"),
        ];
        self.run_cmd(git, &header, self.root.as_str())?;
        let mut guard = self
            .authorization
            .lock()
            .map_err(|_| IngestError::Storage {
                path: self.root.to_string(),
                message: "authorization state poisoned".to_string(),
            })?;
        *guard = Some(token.to_string());
        Ok(())
    }
}

fn absolute_root(root: &Utf8Path) -> Result<Utf8PathBuf, IngestError> {
    fs::create_dir_all(root.as_std_path())
        .map_err(|err| IngestError::Filesystem(format!("create {root}: {err}")))?;
    root.canonicalize_utf8()
        .map_err(|err| IngestError::Filesystem(format!("resolve {root}: {err}")))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
