//! Deterministic BIDS-style layout for ingested scans.
//!
//! `{project}/sub-{cand}/ses-{visit}_{YYYYMMDD}/{modality}/sub-{cand}_ses-{visit}_{YYYYMMDD}_{suffix}.{ext}`

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::{Project, Scan, Session, Subject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Anat,
    Fmap,
    Dwi,
    Func,
    Misc,
}

impl Modality {
    pub fn as_str(self) -> &'static str {
        match self {
            Modality::Anat => "anat",
            Modality::Fmap => "fmap",
            Modality::Dwi => "dwi",
            Modality::Func => "func",
            Modality::Misc => "misc",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown suffixes land in `misc` instead of failing the scan.
pub fn modality_dir(suffix: &str) -> Modality {
    match suffix {
        "T1w" | "T2w" | "FLAIR" | "PD" | "T2star" | "PDT2" => Modality::Anat,
        "epi" | "phasediff" | "magnitude" | "magnitude1" | "magnitude2" | "fieldmap" => {
            Modality::Fmap
        }
        "dwi" => Modality::Dwi,
        "bold" | "sbref" => Modality::Func,
        _ => Modality::Misc,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPath {
    pub relative_dir: Utf8PathBuf,
    pub filename: String,
    pub modality: Modality,
}

impl ScanPath {
    pub fn relative_path(&self) -> Utf8PathBuf {
        self.relative_dir.join(&self.filename)
    }

    pub fn absolute_dir(&self, dataset_root: &Utf8Path) -> Utf8PathBuf {
        dataset_root.join(&self.relative_dir)
    }
}

pub fn derive_path(project: &Project, subject: &Subject, session: &Session, scan: &Scan) -> ScanPath {
    let date = session.date.format("%Y%m%d");
    let sub = format!("sub-{}", subject.cand_id);
    let ses = format!("ses-{}_{date}", session.label);
    let modality = modality_dir(&scan.suffix);

    let relative_dir = Utf8PathBuf::from(project.name.as_str())
        .join(&sub)
        .join(&ses)
        .join(modality.as_str());
    let filename = format!("{sub}_{ses}_{}.{}", scan.suffix, scan.extension);

    ScanPath {
        relative_dir,
        filename,
        modality,
    }
}
