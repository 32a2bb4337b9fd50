use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use assert_matches::assert_matches;
use chrono::NaiveDate;

use loris_ingest::catalogue::{
    ApiSession, CatalogueClient, HttpSettings, LorisHttpClient, login,
};
use loris_ingest::credentials::Credentials;
use loris_ingest::domain::{Project, Subject};
use loris_ingest::error::IngestError;

struct Request {
    method: String,
    path: String,
    authorization: Option<String>,
    body: String,
}

struct FakeServer {
    base: String,
    hits: Arc<Mutex<Vec<String>>>,
}

impl FakeServer {
    fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }

    fn count(&self, needle: &str) -> usize {
        self.hits().iter().filter(|hit| hit.as_str() == needle).count()
    }
}

fn serve<F>(handler: F) -> FakeServer
where
    F: Fn(&Request) -> (u16, String) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(Mutex::new(Vec::new()));
    let log = hits.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else {
                break;
            };
            let Some(request) = read_request(&stream) else {
                continue;
            };
            log.lock()
                .unwrap()
                .push(format!("{} {}", request.method, request.path));
            let (status, body) = handler(&request);
            let response = format!(
                "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                reason(status),
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
        }
    });
    FakeServer {
        base: format!("http://{addr}/api/v0.0.3"),
        hits,
    }
}

fn read_request(stream: &TcpStream) -> Option<Request> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut authorization = None;
    let mut length = 0usize;
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).ok()?;
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            match name.to_ascii_lowercase().as_str() {
                "authorization" => authorization = Some(value.trim().to_string()),
                "content-length" => length = value.trim().parse().unwrap_or(0),
                _ => {}
            }
        }
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).ok()?;
    Some(Request {
        method,
        path,
        authorization,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        401 => "Unauthorized",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

fn client(server: &FakeServer) -> LorisHttpClient {
    let settings = HttpSettings {
        timeout_secs: 5,
        max_attempts: 3,
        base_delay_ms: 1,
    };
    LorisHttpClient::new(&server.base, settings).unwrap()
}

fn creds() -> Credentials {
    Credentials::new("admin", "secret")
}

fn ok(body: &str) -> (u16, String) {
    (200, body.to_string())
}

#[test]
fn login_posts_credentials_and_stores_token() {
    let server = serve(|req| match (req.method.as_str(), req.path.as_str()) {
        ("POST", "/api/v0.0.3/login") if req.body.contains("\"admin\"") => {
            ok(r#"{"token":"abc"}"#)
        }
        _ => (404, "{}".to_string()),
    });
    let client = client(&server);

    let session = login(&client, creds()).unwrap();
    assert_eq!(session.token(), Some("abc"));
    assert_eq!(session.generation(), 1);
}

#[test]
fn rejected_login_is_an_auth_error() {
    let server = serve(|_| (401, r#"{"error":"bad credentials"}"#.to_string()));
    let client = client(&server);

    assert_matches!(login(&client, creds()), Err(IngestError::Auth(_)));
}

#[test]
fn pagination_follows_next_until_it_repeats() {
    let server = serve(|req| match req.path.as_str() {
        "/api/v0.0.3/login" => ok(r#"{"token":"abc"}"#),
        "/api/v0.0.3/projects/P/candidates" => ok(
            r#"{"Candidates":[{"CandID":"10"}],"Links":{"next":"/projects/P/candidates?page=2"}}"#,
        ),
        "/api/v0.0.3/projects/P/candidates?page=2" => ok(
            r#"{"Candidates":[{"CandID":2}],"Links":{"next":"/projects/P/candidates?page=2"}}"#,
        ),
        _ => (404, "{}".to_string()),
    });
    let client = client(&server);
    let mut session = login(&client, creds()).unwrap();
    let project = Project {
        name: "P".parse().unwrap(),
    };

    let subjects = client.list_subjects(&mut session, &project).unwrap();
    let ids: Vec<&str> = subjects.iter().map(|s| s.cand_id.as_str()).collect();
    assert_eq!(ids, vec!["2", "10"]);
    assert_eq!(server.count("GET /api/v0.0.3/projects/P/candidates"), 1);
    assert_eq!(server.count("GET /api/v0.0.3/projects/P/candidates?page=2"), 1);
}

#[test]
fn transient_503_is_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let server = serve(move |req| match req.path.as_str() {
        "/api/v0.0.3/login" => ok(r#"{"token":"abc"}"#),
        "/api/v0.0.3/projects" => {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                (503, "{}".to_string())
            } else {
                ok(r#"{"Projects":{"Rye":{},"Pumpernickel":{}}}"#)
            }
        }
        _ => (404, "{}".to_string()),
    });
    let client = client(&server);
    let mut session = login(&client, creds()).unwrap();

    let projects = client.list_projects(&mut session).unwrap();
    let names: Vec<&str> = projects.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["Pumpernickel", "Rye"]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn expired_token_triggers_one_relogin() {
    let logins = Arc::new(AtomicUsize::new(0));
    let counter = logins.clone();
    let server = serve(move |req| match req.path.as_str() {
        "/api/v0.0.3/login" => {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                ok(r#"{"token":"stale"}"#)
            } else {
                ok(r#"{"token":"fresh"}"#)
            }
        }
        "/api/v0.0.3/projects" if req.authorization.as_deref() == Some("Bearer fresh") => {
            ok(r#"{"Projects":["Rye"]}"#)
        }
        "/api/v0.0.3/projects" => (401, "{}".to_string()),
        _ => (404, "{}".to_string()),
    });
    let client = client(&server);
    let mut session = login(&client, creds()).unwrap();
    assert_eq!(session.token(), Some("stale"));

    let projects = client.list_projects(&mut session).unwrap();
    assert_eq!(projects.len(), 1);
    assert_eq!(session.token(), Some("fresh"));
    assert_eq!(session.generation(), 2);
    assert_eq!(logins.load(Ordering::SeqCst), 2);
}

#[test]
fn second_rejection_after_relogin_is_fatal() {
    let server = serve(|req| match req.path.as_str() {
        "/api/v0.0.3/login" => ok(r#"{"token":"t"}"#),
        _ => (401, "{}".to_string()),
    });
    let client = client(&server);
    let mut session = login(&client, creds()).unwrap();

    let err = client.list_projects(&mut session).unwrap_err();
    assert_matches!(err, IngestError::Auth(_));
    assert!(err.is_fatal());
    assert_eq!(server.count("POST /api/v0.0.3/login"), 2);
}

#[test]
fn visits_and_images_are_listed_with_dates_and_urls() {
    let server = serve(|req| match req.path.as_str() {
        "/api/v0.0.3/login" => ok(r#"{"token":"abc"}"#),
        "/api/v0.0.3/candidates/963271" => ok(r#"{"Meta":{"CandID":"963271"},"Visits":["V1"]}"#),
        "/api/v0.0.3/candidates/963271/V1" => {
            ok(r#"{"Stages":{"Visit":{"Date":"2010-11-25","Status":"Pass"}}}"#)
        }
        "/api/v0.0.3/candidates/963271/V1/images" => ok(
            r#"{"Files":[{"Filename":"demo_963271_V1_t1_001.mnc","AcquisitionProtocol":"t1"}]}"#,
        ),
        _ => (404, "{}".to_string()),
    });
    let client = client(&server);
    let mut session = login(&client, creds()).unwrap();
    let subject = Subject {
        project: "P".parse().unwrap(),
        cand_id: "963271".parse().unwrap(),
    };

    let visits = client.list_sessions(&mut session, &subject).unwrap();
    assert_eq!(visits.len(), 1);
    let visit = client
        .describe_session(&mut session, &subject, &visits[0])
        .unwrap();
    assert_eq!(visit.date, NaiveDate::from_ymd_opt(2010, 11, 25).unwrap());

    let scans = client.list_scans(&mut session, &visit).unwrap().scans;
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].suffix, "T1w");
    assert_eq!(
        scans[0].url,
        format!("{}/candidates/963271/V1/images/demo_963271_V1_t1_001.mnc", server.base)
    );
}

#[test]
fn an_undated_visit_does_not_hide_its_dated_sibling() {
    let server = serve(|req| match req.path.as_str() {
        "/api/v0.0.3/login" => ok(r#"{"token":"abc"}"#),
        "/api/v0.0.3/candidates/963271" => ok(r#"{"Visits":["V1","V2","V3"]}"#),
        "/api/v0.0.3/candidates/963271/V1" => ok(r#"{"Stages":{}}"#),
        "/api/v0.0.3/candidates/963271/V2" => {
            ok(r#"{"Stages":{"Visit":{"Date":"2011-01-02"}}}"#)
        }
        _ => (404, "{}".to_string()),
    });
    let client = client(&server);
    let mut session = login(&client, creds()).unwrap();
    let subject = Subject {
        project: "P".parse().unwrap(),
        cand_id: "963271".parse().unwrap(),
    };

    let visits = client.list_sessions(&mut session, &subject).unwrap();
    let labels: Vec<&str> = visits.iter().map(|v| v.as_str()).collect();
    assert_eq!(labels, vec!["V1", "V2", "V3"]);
    assert_matches!(
        client.describe_session(&mut session, &subject, &visits[0]),
        Err(IngestError::MalformedRecord { .. })
    );
    let dated = client
        .describe_session(&mut session, &subject, &visits[1])
        .unwrap();
    assert_eq!(dated.date, NaiveDate::from_ymd_opt(2011, 1, 2).unwrap());
    assert_matches!(
        client.describe_session(&mut session, &subject, &visits[2]),
        Err(IngestError::CatalogueStatus { status: 404, .. })
    );
}

#[test]
fn missing_resource_is_a_status_error_without_retry() {
    let server = serve(|req| match req.path.as_str() {
        "/api/v0.0.3/login" => ok(r#"{"token":"abc"}"#),
        _ => (404, r#"{"error":"not found"}"#.to_string()),
    });
    let client = client(&server);
    let mut session: ApiSession = login(&client, creds()).unwrap();

    let err = client.list_projects(&mut session).unwrap_err();
    assert_matches!(err, IngestError::CatalogueStatus { status: 404, .. });
    assert!(!err.is_fatal());
    assert_eq!(server.count("GET /api/v0.0.3/projects"), 1);
}
