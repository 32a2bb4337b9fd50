use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::credentials::Credentials;
use crate::domain::{
    Label, Project, Scan, ScanId, Session, Subject, file_extension, identifier_order,
    suffix_for_scan_type,
};
use crate::error::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

/// Per-run authentication context threaded through every catalogue call.
#[derive(Debug, Clone)]
pub struct ApiSession {
    credentials: Credentials,
    token: Option<String>,
    generation: u64,
}

impl ApiSession {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            token: None,
            generation: 0,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Bumped on every successful login so token consumers can tell when to refresh.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
        self.generation += 1;
    }
}

/// An image-listing entry that could not become a scan. Its siblings are unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedFile {
    pub identity: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanListing {
    pub scans: Vec<Scan>,
    pub rejected: Vec<RejectedFile>,
}

pub trait CatalogueClient: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> Result<String, IngestError>;
    fn list_projects(&self, session: &mut ApiSession) -> Result<Vec<Project>, IngestError>;
    fn list_subjects(
        &self,
        session: &mut ApiSession,
        project: &Project,
    ) -> Result<Vec<Subject>, IngestError>;
    /// Visit labels of a subject. Each one is resolved separately by `describe_session`.
    fn list_sessions(
        &self,
        session: &mut ApiSession,
        subject: &Subject,
    ) -> Result<Vec<Label>, IngestError>;
    fn describe_session(
        &self,
        session: &mut ApiSession,
        subject: &Subject,
        visit: &Label,
    ) -> Result<Session, IngestError>;
    fn list_scans(
        &self,
        session: &mut ApiSession,
        visit: &Session,
    ) -> Result<ScanListing, IngestError>;
}

/// Logs in once and returns the session context for the run.
pub fn login<C: CatalogueClient + ?Sized>(
    client: &C,
    credentials: Credentials,
) -> Result<ApiSession, IngestError> {
    let mut session = ApiSession::new(credentials);
    let token = client.authenticate(session.credentials())?;
    session.set_token(token);
    info!(user = %session.credentials().username, "logged in to catalogue");
    Ok(session)
}

#[derive(Clone)]
pub struct LorisHttpClient {
    client: Client,
    base_url: String,
    settings: HttpSettings,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default)]
    token: Option<String>,
}

impl LorisHttpClient {
    pub fn new(base_url: &str, settings: HttpSettings) -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("loris-ingest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| IngestError::CatalogueHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|err| IngestError::CatalogueHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            settings,
        })
    }

    /// Resolves a catalogue link against the API base; absolute links pass through.
    pub fn resolve(&self, link: &str) -> String {
        if link.starts_with("http://") || link.starts_with("https://") {
            return link.to_string();
        }
        if link.starts_with('/') {
            format!("{}{link}", self.base_url)
        } else {
            format!("{}/{link}", self.base_url)
        }
    }

    fn handle_status(response: Response, url: &str) -> Result<Response, IngestError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "catalogue request failed".to_string());
        Err(IngestError::CatalogueStatus {
            status,
            url: url.to_string(),
            message,
        })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, IngestError>
    where
        F: FnMut() -> RequestBuilder,
    {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            let can_retry = attempt + 1 < max_attempts;
            let backoff = 1u64 << attempt.min(16);
            let delay = Duration::from_millis(self.settings.base_delay_ms.saturating_mul(backoff));
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if can_retry && is_retryable_status(status) {
                        debug!(status, attempt, "retrying catalogue request");
                        thread::sleep(delay);
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if can_retry && is_retryable_error(&err) {
                        debug!(error = %err, attempt, "retrying catalogue request");
                        thread::sleep(delay);
                        attempt += 1;
                        continue;
                    }
                    return Err(IngestError::CatalogueHttp(err.to_string()));
                }
            }
        }
    }

    /// GETs a JSON document, re-authenticating at most once if the token is rejected.
    fn get_json(&self, session: &mut ApiSession, url: &str) -> Result<Value, IngestError> {
        let mut reauthenticated = false;
        loop {
            if session.token().is_none() {
                let token = self.authenticate(session.credentials())?;
                session.set_token(token);
            }
            let token = session.token().unwrap_or_default().to_string();
            let response = self.send_with_retries(|| self.client.get(url).bearer_auth(&token))?;

            if response.status() == StatusCode::UNAUTHORIZED {
                if reauthenticated {
                    return Err(IngestError::Auth(format!(
                        "token rejected again after re-authentication ({url})"
                    )));
                }
                warn!(url, "catalogue token rejected; re-authenticating once");
                let token = self.authenticate(session.credentials())?;
                session.set_token(token);
                reauthenticated = true;
                continue;
            }

            let response = Self::handle_status(response, url)?;
            return response.json::<Value>().map_err(|err| IngestError::MalformedRecord {
                context: url.to_string(),
                message: format!("response is not JSON: {err}"),
            });
        }
    }

    /// Follows `Links.next` until exhausted and returns every page in order.
    fn get_pages(&self, session: &mut ApiSession, url: &str) -> Result<Vec<Value>, IngestError> {
        let mut pages = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(url.to_string());
        while let Some(current) = next.take() {
            if !seen.insert(current.clone()) {
                warn!(url = %current, "pagination returned an already visited page; stopping");
                break;
            }
            let page = self.get_json(session, &current)?;
            next = next_link(&page).map(|link| self.resolve(link));
            pages.push(page);
        }
        Ok(pages)
    }
}

impl CatalogueClient for LorisHttpClient {
    fn authenticate(&self, credentials: &Credentials) -> Result<String, IngestError> {
        let url = format!("{}/login", self.base_url);
        let body = LoginRequest {
            username: &credentials.username,
            password: credentials.password(),
        };
        let response = self.send_with_retries(|| self.client.post(&url).json(&body))?;
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(IngestError::Auth(format!(
                "catalogue rejected credentials for {}",
                credentials.username
            )));
        }
        let response = Self::handle_status(response, &url)?;
        let payload: LoginResponse = response
            .json()
            .map_err(|err| IngestError::Auth(format!("unexpected login response: {err}")))?;
        payload
            .token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| IngestError::Auth("login succeeded but no token returned".to_string()))
    }

    fn list_projects(&self, session: &mut ApiSession) -> Result<Vec<Project>, IngestError> {
        let url = format!("{}/projects", self.base_url);
        let mut projects = Vec::new();
        for page in self.get_pages(session, &url)? {
            projects.extend(parse_projects(&page)?);
        }
        projects.sort_by(|a, b| identifier_order(a.name.as_str(), b.name.as_str()));
        projects.dedup();
        Ok(projects)
    }

    fn list_subjects(
        &self,
        session: &mut ApiSession,
        project: &Project,
    ) -> Result<Vec<Subject>, IngestError> {
        let url = format!("{}/projects/{}/candidates", self.base_url, project.name);
        let mut subjects = Vec::new();
        for page in self.get_pages(session, &url)? {
            subjects.extend(parse_candidates(&page, project)?);
        }
        subjects.sort_by(|a, b| identifier_order(a.cand_id.as_str(), b.cand_id.as_str()));
        subjects.dedup();
        Ok(subjects)
    }

    fn list_sessions(
        &self,
        session: &mut ApiSession,
        subject: &Subject,
    ) -> Result<Vec<Label>, IngestError> {
        let url = format!("{}/candidates/{}", self.base_url, subject.cand_id);
        let mut visits = Vec::new();
        for page in self.get_pages(session, &url)? {
            visits.extend(parse_visits(&page, subject)?);
        }
        visits.sort_by(|a, b| identifier_order(a.as_str(), b.as_str()));
        visits.dedup();
        Ok(visits)
    }

    fn describe_session(
        &self,
        session: &mut ApiSession,
        subject: &Subject,
        visit: &Label,
    ) -> Result<Session, IngestError> {
        let url = format!("{}/candidates/{}/{}", self.base_url, subject.cand_id, visit);
        let page = self.get_json(session, &url)?;
        Ok(Session {
            cand_id: subject.cand_id.clone(),
            label: visit.clone(),
            date: parse_visit_date(&page, subject, visit)?,
        })
    }

    fn list_scans(
        &self,
        session: &mut ApiSession,
        visit: &Session,
    ) -> Result<ScanListing, IngestError> {
        let url = format!(
            "{}/candidates/{}/{}/images",
            self.base_url, visit.cand_id, visit.label
        );
        let mut listing = ScanListing::default();
        for page in self.get_pages(session, &url)? {
            let parsed = parse_files(&page, visit, |link| self.resolve(link))?;
            listing.scans.extend(parsed.scans);
            listing.rejected.extend(parsed.rejected);
        }
        listing
            .scans
            .sort_by(|a, b| identifier_order(a.id.as_str(), b.id.as_str()));
        listing.scans.dedup_by(|a, b| a.id == b.id);
        Ok(listing)
    }
}

pub fn next_link(page: &Value) -> Option<&str> {
    page.get("Links")
        .or_else(|| page.get("links"))
        .and_then(|links| links.get("next"))
        .and_then(|next| next.as_str())
        .filter(|next| !next.trim().is_empty())
}

fn malformed(context: impl Into<String>, message: impl Into<String>) -> IngestError {
    IngestError::MalformedRecord {
        context: context.into(),
        message: message.into(),
    }
}

fn label_field(value: &str, context: &str) -> Result<Label, IngestError> {
    value
        .parse()
        .map_err(|_| malformed(context, format!("identifier {value:?} is not path-safe")))
}

/// Accepts string or numeric JSON scalars; LORIS sends CandIDs both ways.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub fn parse_projects(page: &Value) -> Result<Vec<Project>, IngestError> {
    let names: Vec<String> = match page.get("Projects") {
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                scalar_string(item)
                    .or_else(|| item.get("Name").and_then(scalar_string))
                    .ok_or_else(|| malformed("projects", "project entry without a name"))
            })
            .collect::<Result<_, _>>()?,
        _ => return Err(malformed("projects", "missing `Projects` field")),
    };
    names
        .iter()
        .map(|name| {
            Ok(Project {
                name: label_field(name, "projects")?,
            })
        })
        .collect()
}

pub fn parse_candidates(page: &Value, project: &Project) -> Result<Vec<Subject>, IngestError> {
    let context = format!("project {}", project.name);
    let items = page
        .get("Candidates")
        .and_then(|value| value.as_array())
        .ok_or_else(|| malformed(&context, "missing `Candidates` array"))?;
    items
        .iter()
        .map(|item| {
            let cand_id = item
                .get("CandID")
                .and_then(scalar_string)
                .ok_or_else(|| malformed(&context, "candidate without CandID"))?;
            Ok(Subject {
                project: project.name.clone(),
                cand_id: label_field(&cand_id, &context)?,
            })
        })
        .collect()
}

pub fn parse_visits(page: &Value, subject: &Subject) -> Result<Vec<Label>, IngestError> {
    let context = format!("candidate {}", subject.cand_id);
    let items = page
        .get("Visits")
        .and_then(|value| value.as_array())
        .ok_or_else(|| malformed(&context, "missing `Visits` array"))?;
    items
        .iter()
        .map(|item| {
            let visit = scalar_string(item)
                .ok_or_else(|| malformed(&context, "visit label is not a string"))?;
            label_field(&visit, &context)
        })
        .collect()
}

pub fn parse_visit_date(
    page: &Value,
    subject: &Subject,
    visit: &Label,
) -> Result<NaiveDate, IngestError> {
    let context = format!("candidate {} visit {visit}", subject.cand_id);
    let raw = page
        .get("Stages")
        .and_then(|stages| stages.get("Visit"))
        .and_then(|stage| stage.get("Date"))
        .and_then(|date| date.as_str())
        .ok_or_else(|| malformed(&context, "visit has no Stages.Visit.Date"))?;
    // Some instances return a full timestamp; the date part is what names the session.
    let date_part = raw.trim().get(..10).unwrap_or(raw.trim());
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map_err(|err| malformed(&context, format!("bad visit date {raw:?}: {err}")))
}

/// Parses one page of an image listing. A missing `Files` array fails the page; a bad
/// entry is rejected on its own and the rest of the page is kept.
pub fn parse_files<R>(page: &Value, visit: &Session, resolve: R) -> Result<ScanListing, IngestError>
where
    R: Fn(&str) -> String,
{
    let context = format!("candidate {} visit {}", visit.cand_id, visit.label);
    let items = page
        .get("Files")
        .and_then(|value| value.as_array())
        .ok_or_else(|| malformed(&context, "missing `Files` array"))?;

    let mut listing = ScanListing::default();
    for (index, item) in items.iter().enumerate() {
        match parse_file(item, visit, &resolve) {
            Ok(scan) => listing.scans.push(scan),
            Err(reason) => {
                let identity = item
                    .get("FileID")
                    .and_then(scalar_string)
                    .or_else(|| {
                        item.get("Filename")
                            .and_then(scalar_string)
                            .map(|name| format!("{}/{}/{name}", visit.cand_id, visit.label))
                    })
                    .unwrap_or_else(|| format!("{}/{}/#{index}", visit.cand_id, visit.label));
                listing.rejected.push(RejectedFile {
                    identity,
                    reason: malformed(&context, reason).to_string(),
                });
            }
        }
    }
    Ok(listing)
}

fn parse_file<R>(item: &Value, visit: &Session, resolve: &R) -> Result<Scan, String>
where
    R: Fn(&str) -> String,
{
    let filename = item
        .get("Filename")
        .and_then(scalar_string)
        .ok_or_else(|| "file without Filename".to_string())?;
    let protocol = item
        .get("AcquisitionProtocol")
        .or_else(|| item.get("ScanType"))
        .and_then(scalar_string)
        .unwrap_or_default();
    let extension =
        file_extension(&filename).ok_or_else(|| format!("{filename} has no extension"))?;
    let id = item
        .get("FileID")
        .and_then(scalar_string)
        .unwrap_or_else(|| format!("{}/{}/{filename}", visit.cand_id, visit.label));
    let url = match item.get("Link").and_then(|link| link.as_str()) {
        Some(link) => resolve(link),
        None => resolve(&format!(
            "/candidates/{}/{}/images/{filename}",
            visit.cand_id, visit.label
        )),
    };
    Ok(Scan {
        id: ScanId::new(id),
        suffix: suffix_for_scan_type(&protocol),
        extension,
        source_filename: filename,
        url,
        size: item.get("Size").and_then(|size| size.as_u64()),
        checksum: item
            .get("Checksum")
            .and_then(|sum| sum.as_str())
            .map(|sum| sum.to_string()),
    })
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn visit() -> Session {
        Session {
            cand_id: "963271".parse().unwrap(),
            label: "V1".parse().unwrap(),
            date: NaiveDate::from_ymd_opt(2010, 11, 25).unwrap(),
        }
    }

    #[test]
    fn files_get_identity_suffix_and_url() {
        let page = json!({
            "Files": [
                {"Filename": "demo_963271_V1_t1_001.mnc", "AcquisitionProtocol": "t1", "OutputType": "native"},
                {"Filename": "x.nii.gz", "AcquisitionProtocol": "bold", "FileID": 42,
                 "Link": "https://files.example.org/x.nii.gz", "Size": 1024}
            ]
        });
        let scans = parse_files(&page, &visit(), |link| format!("https://api{link}"))
            .unwrap()
            .scans;
        assert_eq!(scans[0].id.as_str(), "963271/V1/demo_963271_V1_t1_001.mnc");
        assert_eq!(scans[0].suffix, "T1w");
        assert_eq!(scans[0].extension, "mnc");
        assert_eq!(
            scans[0].url,
            "https://api/candidates/963271/V1/images/demo_963271_V1_t1_001.mnc"
        );
        assert_eq!(scans[1].id.as_str(), "42");
        assert_eq!(scans[1].extension, "nii.gz");
        assert_eq!(scans[1].size, Some(1024));
    }

    #[test]
    fn bad_file_entries_are_rejected_without_dropping_siblings() {
        let page = json!({
            "Files": [
                {"Filename": "README", "AcquisitionProtocol": "t1"},
                {"Filename": "demo_963271_V1_t1_001.mnc", "AcquisitionProtocol": "t1"},
                {"AcquisitionProtocol": "t2"}
            ]
        });
        let listing = parse_files(&page, &visit(), |link| link.to_string()).unwrap();
        assert_eq!(listing.scans.len(), 1);
        assert_eq!(listing.scans[0].source_filename, "demo_963271_V1_t1_001.mnc");
        let rejected: Vec<&str> = listing.rejected.iter().map(|r| r.identity.as_str()).collect();
        assert_eq!(rejected, vec!["963271/V1/README", "963271/V1/#2"]);
        assert!(listing.rejected[0].reason.contains("README has no extension"));
    }

    #[test]
    fn listing_without_files_array_is_malformed() {
        assert_matches!(
            parse_files(&json!({}), &visit(), |link| link.to_string()),
            Err(IngestError::MalformedRecord { .. })
        );
    }

    #[test]
    fn projects_accept_object_or_array() {
        let object = json!({"Projects": {"Pumpernickel": {}, "Rye": {}}});
        let array = json!({"Projects": ["Rye", {"Name": "Pumpernickel"}]});
        assert_eq!(parse_projects(&object).unwrap().len(), 2);
        assert_eq!(parse_projects(&array).unwrap().len(), 2);
        assert_matches!(
            parse_projects(&json!({"Projects": ["../etc"]})),
            Err(IngestError::MalformedRecord { .. })
        );
    }

    #[test]
    fn visit_date_accepts_timestamps() {
        let subject = Subject {
            project: "P".parse().unwrap(),
            cand_id: "963271".parse().unwrap(),
        };
        let label: Label = "V1".parse().unwrap();
        let page = json!({"Stages": {"Visit": {"Date": "2010-11-25 10:00:00"}}});
        assert_eq!(
            parse_visit_date(&page, &subject, &label).unwrap(),
            NaiveDate::from_ymd_opt(2010, 11, 25).unwrap()
        );
        assert_matches!(
            parse_visit_date(&json!({}), &subject, &label),
            Err(IngestError::MalformedRecord { .. })
        );
    }

    #[test]
    fn next_link_ignores_empty_values() {
        assert_eq!(next_link(&json!({"Links": {"next": "/p?page=2"}})), Some("/p?page=2"));
        assert_eq!(next_link(&json!({"Links": {"next": ""}})), None);
        assert_eq!(next_link(&json!({})), None);
    }
}
