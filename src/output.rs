use std::io::{self, Write};

use serde::Serialize;

use crate::manifest::ManifestStatus;
use crate::pipeline::{IngestSummary, ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(summary: &IngestSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_status(status: &ManifestStatus) -> io::Result<()> {
        Self::print_json(status)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Coloured end-of-run report for terminals.
pub fn print_summary(summary: &IngestSummary, dataset: &str) {
    const RESET: &str = "\x1b[0m";
    const GREEN: &str = "\x1b[32m";
    const YELLOW: &str = "\x1b[33m";
    const RED: &str = "\x1b[31m";
    const CYAN: &str = "\x1b[36m";
    const GRAY: &str = "\x1b[90m";

    let headline = if summary.dry_run {
        format!("{YELLOW}Dry run{RESET}")
    } else if summary.is_clean() {
        format!("{GREEN}Ingest complete{RESET}")
    } else {
        format!("{YELLOW}Ingest finished with problems{RESET}")
    };
    let seconds = summary.elapsed_ms as f64 / 1000.0;
    println!("{headline} {GRAY}({} mode, {seconds:.1}s){RESET}", summary.mode);
    println!("  dataset:          {CYAN}{dataset}{RESET}");
    println!("  already present:  {}", summary.already_present);
    if summary.dry_run {
        println!("  would ingest:     {}", summary.planned);
    } else {
        println!("  registered:       {GREEN}{}{RESET}", summary.registered);
        println!("  fetched:          {GREEN}{}{RESET}", summary.fetched);
    }

    if !summary.failed.is_empty() {
        println!("  failed:           {RED}{}{RESET}", summary.failed.len());
        for failure in &summary.failed {
            let path = failure.path.as_deref().unwrap_or("-");
            println!(
                "    {RED}x{RESET} {} {GRAY}{path}{RESET}: {}",
                failure.scan_id, failure.reason
            );
        }
    }
    if !summary.skipped_subtrees.is_empty() {
        let skipped = summary.skipped_subtrees.len();
        println!("  skipped:          {YELLOW}{skipped}{RESET}");
        for skipped in &summary.skipped_subtrees {
            println!(
                "    {YELLOW}!{RESET} {} {}: {}",
                skipped.level, skipped.identity, skipped.reason
            );
        }
    }

    if summary.committed {
        println!("  commit:           {GREEN}saved{RESET}");
    } else if let Some(err) = &summary.commit_error {
        println!("  commit:           {RED}failed{RESET} {GRAY}{err}{RESET}");
    }
}

pub fn print_status(status: &ManifestStatus) {
    const RESET: &str = "\x1b[0m";
    const CYAN: &str = "\x1b[36m";
    const YELLOW: &str = "\x1b[33m";

    println!("Manifest {CYAN}{}{RESET}: {} scans", status.manifest, status.total);
    for (project, count) in &status.by_project {
        println!("  {project:<24} {count}");
    }
    for (mode, count) in &status.by_mode {
        println!("  mode {mode:<19} {count}");
    }
    if status.torn_tail {
        println!("  {YELLOW}last line is incomplete; it will be dropped on the next ingest{RESET}");
    }
}
