//! Remote position store.
//!
//! The wire protocol is two calls per book: `GET` the stored position and
//! `PUT` a newer one. The server may refuse a `PUT` when it already holds an
//! equal-or-newer record, which is reported as [`PutOutcome::Conflict`]
//! rather than as an error.

use crate::progress::UnifiedProgress;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode remote position: {0}")]
    Decode(String),

    #[error("could not encode position: {0}")]
    Encode(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        RemoteError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Accepted,
    /// Server already holds an equal-or-newer record.
    Conflict,
}

pub trait RemoteProgressStore: Send + Sync {
    fn get_position(&self, book_id: &str) -> Result<Option<UnifiedProgress>, RemoteError>;

    fn put_position(
        &self,
        book_id: &str,
        progress: &UnifiedProgress,
    ) -> Result<PutOutcome, RemoteError>;
}

#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

/// [`RemoteProgressStore`] over `{base_url}/books/{id}/position`.
#[derive(Debug, Clone)]
pub struct HttpProgressStore {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpProgressStore {
    pub fn new(config: HttpStoreConfig) -> Result<Self, RemoteError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn position_url(&self, book_id: &str) -> String {
        format!(
            "{}/books/{}/position",
            self.base_url,
            utf8_percent_encode(book_id, NON_ALPHANUMERIC)
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl RemoteProgressStore for HttpProgressStore {
    fn get_position(&self, book_id: &str) -> Result<Option<UnifiedProgress>, RemoteError> {
        let url = self.position_url(book_id);
        debug!(%url, "Fetching remote position");
        let response = self.authorize(self.client.get(&url)).send()?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response.text()?;
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(None);
        }
        let progress = serde_json::from_str::<UnifiedProgress>(&body)
            .map_err(|err| RemoteError::Decode(err.to_string()))?;
        Ok(Some(progress.normalized()))
    }

    fn put_position(
        &self,
        book_id: &str,
        progress: &UnifiedProgress,
    ) -> Result<PutOutcome, RemoteError> {
        let url = self.position_url(book_id);
        let payload =
            serde_json::to_vec(progress).map_err(|err| RemoteError::Encode(err.to_string()))?;
        let response = self
            .authorize(self.client.put(&url))
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .send()?;
        let status = response.status();
        if status == StatusCode::CONFLICT || status == StatusCode::PRECONDITION_FAILED {
            return Ok(PutOutcome::Conflict);
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(%url, last_updated = progress.last_updated, "Remote accepted position");
        Ok(PutOutcome::Accepted)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Mutex;
    use std::thread::{self, JoinHandle};

    /// In-process store with server semantics: refuses anything not newer.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub records: Mutex<HashMap<String, UnifiedProgress>>,
        pub puts: Mutex<Vec<UnifiedProgress>>,
        pub fail_puts: bool,
    }

    impl MemoryStore {
        pub fn with_record(book_id: &str, progress: UnifiedProgress) -> Self {
            let store = Self::default();
            if let Ok(mut records) = store.records.lock() {
                records.insert(book_id.to_string(), progress);
            }
            store
        }
    }

    impl RemoteProgressStore for MemoryStore {
        fn get_position(&self, book_id: &str) -> Result<Option<UnifiedProgress>, RemoteError> {
            let records = self.records.lock().expect("records lock");
            Ok(records.get(book_id).cloned())
        }

        fn put_position(
            &self,
            book_id: &str,
            progress: &UnifiedProgress,
        ) -> Result<PutOutcome, RemoteError> {
            self.puts.lock().expect("puts lock").push(progress.clone());
            if self.fail_puts {
                return Err(RemoteError::Transport("connection refused".into()));
            }
            let mut records = self.records.lock().expect("records lock");
            let newer = records
                .get(book_id)
                .is_none_or(|held| held.last_updated < progress.last_updated);
            if !newer {
                return Ok(PutOutcome::Conflict);
            }
            records.insert(book_id.to_string(), progress.clone());
            Ok(PutOutcome::Accepted)
        }
    }

    #[test]
    fn position_url_escapes_book_id() {
        let store = HttpProgressStore::new(HttpStoreConfig {
            base_url: "http://127.0.0.1:8080/api/".into(),
            token: Some("  ".into()),
            timeout: Duration::from_secs(1),
        })
        .expect("client");
        assert_eq!(
            store.position_url("moby dick/1"),
            "http://127.0.0.1:8080/api/books/moby%20dick%2F1/position"
        );
        assert!(store.token.is_none());
    }

    #[test]
    fn memory_store_refuses_older_records() {
        let store = MemoryStore::default();
        let newer = UnifiedProgress {
            last_updated: 2_000,
            ..UnifiedProgress::default()
        };
        let older = UnifiedProgress {
            last_updated: 1_000,
            ..UnifiedProgress::default()
        };
        assert_eq!(store.put_position("b", &newer).ok(), Some(PutOutcome::Accepted));
        assert_eq!(store.put_position("b", &older).ok(), Some(PutOutcome::Conflict));
        let held = store.get_position("b").ok().flatten().expect("record");
        assert_eq!(held.last_updated, 2_000);
    }

    /// Answer exactly one request with `status` and `body`; the handle yields
    /// the raw request text.
    fn serve_once(status: &'static str, body: &'static str) -> (HttpProgressStore, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let request = read_request(&mut stream);
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).expect("write response");
            request
        });
        let store = HttpProgressStore::new(HttpStoreConfig {
            base_url: format!("http://{addr}/api"),
            token: Some("secret".into()),
            timeout: Duration::from_secs(5),
        })
        .expect("client");
        (store, handle)
    }

    fn read_request(stream: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let read = stream.read(&mut chunk).expect("read request");
            if read == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..read]);
            let text = String::from_utf8_lossy(&data);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        if name.trim().eq_ignore_ascii_case("content-length") {
                            value.trim().parse::<usize>().ok()
                        } else {
                            None
                        }
                    })
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    fn sample_progress() -> UnifiedProgress {
        UnifiedProgress {
            chapter_index: 1,
            audio_timestamp_ms: 1_500,
            last_updated: 1_700_000_000_000,
            ..UnifiedProgress::default()
        }
    }

    #[test]
    fn get_missing_position_is_absent() {
        let (store, server) = serve_once("404 Not Found", "");
        assert!(matches!(store.get_position("moby dick"), Ok(None)));
        let request = server.join().expect("server").to_ascii_lowercase();
        assert!(request.starts_with("get /api/books/moby%20dick/position "));
        assert!(request.contains("authorization: bearer secret"));
    }

    #[test]
    fn get_decodes_and_normalizes_the_stored_position() {
        let (store, server) = serve_once("200 OK", r#"{"chapterIndex":2,"lastUpdated":1700000000}"#);
        let held = store.get_position("sample").expect("get").expect("record");
        assert_eq!(held.chapter_index, 2);
        assert_eq!(held.last_updated, 1_700_000_000_000);
        server.join().expect("server");
    }

    #[test]
    fn get_with_empty_body_is_absent() {
        let (store, server) = serve_once("200 OK", "");
        assert!(matches!(store.get_position("sample"), Ok(None)));
        server.join().expect("server");
    }

    #[test]
    fn get_server_error_reports_status_and_body() {
        let (store, server) = serve_once("500 Internal Server Error", "boom");
        match store.get_position("sample") {
            Err(RemoteError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected status error, got {other:?}"),
        }
        server.join().expect("server");
    }

    #[test]
    fn get_with_garbage_body_is_a_decode_error() {
        let (store, server) = serve_once("200 OK", "{not json");
        assert!(matches!(store.get_position("sample"), Err(RemoteError::Decode(_))));
        server.join().expect("server");
    }

    #[test]
    fn put_sends_json_and_reports_acceptance() {
        let (store, server) = serve_once("200 OK", "");
        assert_eq!(
            store.put_position("sample", &sample_progress()).ok(),
            Some(PutOutcome::Accepted)
        );
        let request = server.join().expect("server");
        assert!(request.starts_with("PUT /api/books/sample/position "));
        assert!(request.contains(r#""audioTimestampMs":1500"#));
    }

    #[test]
    fn put_refusals_are_conflicts_not_errors() {
        for status in ["409 Conflict", "412 Precondition Failed"] {
            let (store, server) = serve_once(status, "newer record held");
            assert_eq!(
                store.put_position("sample", &sample_progress()).ok(),
                Some(PutOutcome::Conflict),
                "{status}"
            );
            server.join().expect("server");
        }
    }

    #[test]
    fn put_server_error_reports_status() {
        let (store, server) = serve_once("503 Service Unavailable", "maintenance");
        match store.put_position("sample", &sample_progress()) {
            Err(RemoteError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("expected status error, got {other:?}"),
        }
        server.join().expect("server");
    }
}
