use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use loris_ingest::catalogue::{LorisHttpClient, login};
use loris_ingest::config::{ConfigLoader, ConfigOverrides, ResolvedConfig};
use loris_ingest::credentials::ChainedCredentials;
use loris_ingest::error::IngestError;
use loris_ingest::manifest::{ManifestStore, summarize};
use loris_ingest::output::{self, JsonOutput, OutputMode};
use loris_ingest::pipeline::{IngestOptions, Ingestor};
use loris_ingest::storage::{DataladStorage, StorageAdapter};
use loris_ingest::tui::Dashboard;

#[derive(Parser)]
#[command(name = "loris-ingest")]
#[command(about = "Incrementally mirror LORIS imaging catalogues into a DataLad dataset")]
#[command(version, author)]
struct Cli {
    /// Never prompt; print JSON instead of the dashboard.
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Walk the catalogue and add new scans to the dataset")]
    Ingest(IngestArgs),
    #[command(about = "Summarize the manifest of an existing dataset")]
    Status(StatusArgs),
}

#[derive(Args)]
struct IngestArgs {
    /// Path to the DataLad dataset (created if missing).
    #[arg(long)]
    dataset: Option<String>,

    /// LORIS API base URL, e.g. https://host/api/v0.0.3
    #[arg(long)]
    api_base: Option<String>,

    /// Fetch file content after registering it.
    #[arg(long)]
    get: bool,

    /// Walk the catalogue and report what would be ingested without touching the dataset.
    #[arg(long)]
    dry_run: bool,

    /// Only ingest this project (repeatable).
    #[arg(long = "project")]
    projects: Vec<String>,

    #[arg(long)]
    config: Option<String>,

    /// Manifest file name inside the dataset.
    #[arg(long)]
    manifest: Option<String>,

    /// Leave new files unsaved in the dataset.
    #[arg(long)]
    no_commit: bool,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long)]
    dataset: Option<String>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    manifest: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<IngestError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &IngestError) -> u8 {
    match error {
        IngestError::Auth(_) => 2,
        IngestError::CatalogueRoot(_) => 3,
        IngestError::ManifestCorruption { .. } => 4,
        IngestError::MissingCredentials(_)
        | IngestError::MissingSetting(_)
        | IngestError::ConfigRead(_)
        | IngestError::ConfigParse(_) => 5,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Ingest(args) => run_ingest(args, output_mode),
        Commands::Status(args) => run_status(args, output_mode),
    }
}

fn run_ingest(args: IngestArgs, output_mode: OutputMode) -> miette::Result<()> {
    let overrides = ConfigOverrides {
        api_base: args.api_base,
        dataset: args.dataset,
        get: args.get,
        manifest: args.manifest,
        projects: args.projects,
    };
    let resolved = ConfigLoader::resolve(args.config.as_deref(), overrides)?;
    let api_base = resolved.api_base()?.to_string();

    // Local prerequisites are checked before the catalogue is contacted.
    let (storage, manifest) = if args.dry_run {
        let storage = DataladStorage::new(resolved.dataset.clone());
        let manifest = ManifestStore::open_read_only(resolved.manifest_path())?;
        (storage, manifest)
    } else {
        let storage = DataladStorage::open(&resolved.dataset)?;
        storage.check_tools()?;
        storage.ensure_dataset()?;
        let manifest = ManifestStore::open(storage.root().join(&resolved.manifest_name))?;
        (storage, manifest)
    };
    let dataset_root = storage.root().to_path_buf();

    let interactive = output_mode == OutputMode::Interactive;
    let credentials = ChainedCredentials::standard(interactive).resolve()?;

    let client = LorisHttpClient::new(&api_base, resolved.http)?;
    let session = login(&client, credentials).map_err(|err| match err {
        IngestError::Auth(_) => err,
        other => IngestError::CatalogueRoot(Box::new(other)),
    })?;

    let options = IngestOptions {
        dry_run: args.dry_run,
        commit: !args.no_commit,
        commit_message: resolved.commit_message.clone(),
        projects: resolved.projects.clone(),
    };
    let mut ingestor = Ingestor::new(
        dataset_root.clone(),
        manifest,
        StorageAdapter::new(storage, resolved.mode),
        options,
    );
    info!(api = %api_base, dataset = %dataset_root, "ingest configured");

    match output_mode {
        OutputMode::Interactive => {
            let mut dashboard =
                Dashboard::new(dataset_root.to_string(), resolved.mode, args.dry_run);
            let summary = dashboard.run(move |sink| {
                let mut session = session;
                ingestor.run(&client, &mut session, sink)
            })?;
            output::print_summary(&summary, dataset_root.as_str());
        }
        OutputMode::NonInteractive => {
            let mut session = session;
            let summary = ingestor.run(&client, &mut session, &JsonOutput)?;
            JsonOutput::print_summary(&summary).into_diagnostic()?;
        }
    }
    Ok(())
}

fn run_status(args: StatusArgs, output_mode: OutputMode) -> miette::Result<()> {
    let overrides = ConfigOverrides {
        dataset: args.dataset,
        manifest: args.manifest,
        ..Default::default()
    };
    let resolved: ResolvedConfig = ConfigLoader::resolve(args.config.as_deref(), overrides)?;
    let status = summarize(&resolved.manifest_path())?;
    match output_mode {
        OutputMode::Interactive => output::print_status(&status),
        OutputMode::NonInteractive => JsonOutput::print_status(&status).into_diagnostic()?,
    }
    Ok(())
}
