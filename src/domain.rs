use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 _.\-]*$").expect("label pattern is a valid regex")
});

/// An identifier that is safe to use as a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label(String);

impl Label {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Label {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if !LABEL_RE.is_match(trimmed) || trimmed.contains("..") {
            return Err(IngestError::InvalidLabel(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: Label,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub project: Label,
    pub cand_id: Label,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub cand_id: Label,
    pub label: Label,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(String);

impl ScanId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub id: ScanId,
    pub suffix: String,
    pub extension: String,
    pub source_filename: String,
    pub url: String,
    pub size: Option<u64>,
    pub checksum: Option<String>,
}

/// A scan with the project, subject and session it was listed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    pub project: Project,
    pub subject: Subject,
    pub session: Session,
    pub scan: Scan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Track the file by URL without transferring bytes.
    Reference,
    /// Track the file and transfer its bytes immediately.
    #[serde(rename = "fetched")]
    Eager,
}

impl IngestMode {
    pub fn from_get_flag(get: bool) -> Self {
        if get {
            IngestMode::Eager
        } else {
            IngestMode::Reference
        }
    }
}

impl fmt::Display for IngestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestMode::Reference => write!(f, "reference"),
            IngestMode::Eager => write!(f, "fetched"),
        }
    }
}

/// Normalises a LORIS acquisition protocol name (`t1`, `fieldmap_ap`, ...) to a BIDS suffix.
pub fn suffix_for_scan_type(scan_type: &str) -> String {
    let lowered = scan_type.trim().to_lowercase();
    let known = [
        ("t1", "T1w"),
        ("t2", "T2w"),
        ("flair", "FLAIR"),
        ("pd", "PD"),
        ("fieldmap", "epi"),
        ("fmap", "epi"),
        ("dwi", "dwi"),
        ("dti", "dwi"),
        ("bold", "bold"),
        ("fmri", "bold"),
    ];
    for (prefix, suffix) in known {
        if lowered.starts_with(prefix) {
            return suffix.to_string();
        }
    }
    let cleaned: String = lowered
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Splits the extension off a catalogue filename, keeping compressed double extensions whole.
pub fn file_extension(filename: &str) -> Option<String> {
    let lowered = filename.to_lowercase();
    for double in ["nii.gz", "mnc.gz"] {
        if lowered.len() > double.len() + 1 && lowered.ends_with(&format!(".{double}")) {
            return Some(double.to_string());
        }
    }
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || !ext.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Catalogue identifier order: numeric when both sides are all digits, lexical otherwise.
pub fn identifier_order(left: &str, right: &str) -> Ordering {
    let numeric = |value: &str| !value.is_empty() && value.chars().all(|ch| ch.is_ascii_digit());
    if numeric(left) && numeric(right) {
        let left_trimmed = left.trim_start_matches('0');
        let right_trimmed = right.trim_start_matches('0');
        return left_trimmed
            .len()
            .cmp(&right_trimmed.len())
            .then_with(|| left_trimmed.cmp(right_trimmed))
            .then_with(|| left.cmp(right));
    }
    left.cmp(right)
}
