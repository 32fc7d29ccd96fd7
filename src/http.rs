//! HTTP transport posting staged batches to the collector.
//!
//! A batch is first staged into a temporary file holding the concatenated
//! newline-delimited JSON frames, then posted as the request body. The staged
//! file lives exactly as long as its [`StagedPayload`]; dropping the payload
//! deletes it, whatever the outcome of the request.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{Client, Url};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::DeliveryError;
use crate::transport::Transport;

/// Extra request headers supplied by the caller.
pub type Headers = BTreeMap<String, String>;

/// Header carrying the application identifier.
pub const APP_ID_HEADER: &str = "App-ID";

/// Header carrying the static API token.
pub const AUTHENTICATION_HEADER: &str = "Authentication";

/// Content type of a newline-delimited JSON body.
const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Maximum number of response body bytes kept in an error.
const MAX_ERROR_BODY_LEN: usize = 512;

/// One flush batch written to disk for a POST.
#[derive(Debug)]
pub struct StagedPayload {
    file: NamedTempFile,
}

impl StagedPayload {
    /// Write `frames` into a fresh temporary file under `dir`.
    ///
    /// This is blocking file I/O; async callers run it on the blocking pool
    /// through [`StagedPayload::stage`].
    pub fn write(dir: &Path, frames: &[Vec<u8>]) -> Result<Self, DeliveryError> {
        let mut file = tempfile::Builder::new()
            .prefix("logstash_")
            .suffix(".log")
            .tempfile_in(dir)
            .map_err(|e| DeliveryError::Staging(e.to_string()))?;

        for frame in frames {
            file.write_all(frame)
                .map_err(|e| DeliveryError::Staging(e.to_string()))?;
        }
        file.flush()
            .map_err(|e| DeliveryError::Staging(e.to_string()))?;

        Ok(Self { file })
    }

    /// Stage `frames` without blocking the async runtime.
    pub async fn stage(dir: PathBuf, frames: Vec<Vec<u8>>) -> Result<Self, DeliveryError> {
        tokio::task::spawn_blocking(move || Self::write(&dir, &frames))
            .await
            .map_err(|e| DeliveryError::Staging(e.to_string()))?
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Delete the staged file now.
    pub fn discard(self) {
        let path: PathBuf = self.file.path().to_path_buf();
        if let Err(e) = self.file.close() {
            warn!(path = %path.display(), error = %e, "Failed to remove staged payload");
        }
    }
}

/// HTTP transport to a collector endpoint.
///
/// Cloning is cheap and shares the underlying connection pool.
#[derive(Clone)]
pub struct HttpTransport {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// Collector endpoint
    url: Url,

    /// Value of the `App-ID` header
    app_id: String,

    /// Requests currently in flight
    in_flight: Arc<AtomicUsize>,
}

impl HttpTransport {
    /// Create a transport posting to `url`.
    pub fn new(url: Url, app_id: impl Into<String>) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| DeliveryError::Request(e.to_string()))?;

        Ok(Self {
            client,
            url,
            app_id: app_id.into(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// POST the staged file at `payload` to `url`.
    ///
    /// Resolves once, on any terminal outcome. Network failures and non-2xx
    /// responses are both errors.
    pub async fn post(
        &self,
        url: &Url,
        headers: &Headers,
        payload: &Path,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        let body = tokio::fs::read(payload)
            .await
            .map_err(|e| DeliveryError::Staging(e.to_string()))?;
        let file_name = payload
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        debug!(
            url = %url,
            bytes = body.len(),
            file = %file_name,
            "Posting staged payload"
        );

        let request = self
            .client
            .post(url.clone())
            .timeout(timeout)
            .headers(self.request_headers(headers, token, &file_name)?)
            .body(body);

        let _guard = InFlight::enter(&self.in_flight);
        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            info!(url = %url, status = status.as_u16(), "Posted log batch");
            Ok(())
        } else {
            let mut body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            if body.len() > MAX_ERROR_BODY_LEN {
                let mut end = MAX_ERROR_BODY_LEN;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

impl HttpTransport {
    /// Merge caller headers with the ones this transport sets.
    ///
    /// `App-ID`, `Content-Type`, `Content-Disposition` and, when a token is
    /// set, `Authentication` replace any caller value under the same name.
    fn request_headers(
        &self,
        headers: &Headers,
        token: Option<&str>,
        file_name: &str,
    ) -> Result<HeaderMap, DeliveryError> {
        let mut map = HeaderMap::with_capacity(headers.len() + 4);
        for (name, value) in headers {
            map.insert(header_name(name)?, header_value(value)?);
        }

        if let Some(token) = token.filter(|token| !token.is_empty()) {
            map.insert(
                header_name(AUTHENTICATION_HEADER)?,
                header_value(&format!("Basic {}", token))?,
            );
        }
        map.insert(header_name(APP_ID_HEADER)?, header_value(&self.app_id)?);
        map.insert(CONTENT_TYPE, HeaderValue::from_static(NDJSON_CONTENT_TYPE));
        map.insert(
            CONTENT_DISPOSITION,
            header_value(&format!("attachment; filename={}", file_name))?,
        );
        Ok(map)
    }
}

fn header_name(name: &str) -> Result<HeaderName, DeliveryError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| DeliveryError::Request(format!("invalid header name {:?}: {}", name, e)))
}

fn header_value(value: &str) -> Result<HeaderValue, DeliveryError> {
    HeaderValue::from_str(value)
        .map_err(|e| DeliveryError::Request(format!("invalid header value: {}", e)))
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Transport for HttpTransport {
    /// A request is in flight.
    fn is_connected(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    fn is_secure(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// Connections are opened per request by the pooled client.
    fn connect(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    /// Requests already sent run to completion.
    fn disconnect(&self) {
        debug!(in_flight = self.in_flight.load(Ordering::SeqCst), "HTTP transport disconnect requested");
    }

    fn disconnect_after_pending_writes(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn file_name_of(path: &Path) -> String {
        path.file_name().unwrap().to_string_lossy().into_owned()
    }

    #[test]
    fn test_transport_creation() {
        let transport = HttpTransport::new(url("https://collector.example.com/bulk"), "my-app");
        assert!(transport.is_ok());

        let transport = transport.unwrap();
        assert!(transport.is_secure());
        assert!(!transport.is_connected());
        assert!(transport.connect().is_ok());
    }

    #[test]
    fn test_plain_http_is_not_secure() {
        let transport = HttpTransport::new(url("http://localhost:8080"), "my-app").unwrap();
        assert!(!transport.is_secure());
    }

    #[test]
    fn test_reserved_headers_replace_caller_values() {
        let transport = HttpTransport::new(url("http://localhost:8080"), "my-app").unwrap();
        let mut headers = Headers::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());
        headers.insert("App-ID".to_string(), "someone-else".to_string());
        headers.insert("Authentication".to_string(), "Bearer other".to_string());
        headers.insert("X-Request-Source".to_string(), "tests".to_string());

        let map = transport
            .request_headers(&headers, Some("secret"), "logstash_1.log")
            .unwrap();

        assert_eq!(map.get_all(CONTENT_TYPE).iter().count(), 1);
        assert_eq!(map[CONTENT_TYPE], NDJSON_CONTENT_TYPE);
        assert_eq!(map.get_all("app-id").iter().count(), 1);
        assert_eq!(map["app-id"], "my-app");
        assert_eq!(map.get_all("authentication").iter().count(), 1);
        assert_eq!(map["authentication"], "Basic secret");
        assert_eq!(map[CONTENT_DISPOSITION], "attachment; filename=logstash_1.log");
        assert_eq!(map["x-request-source"], "tests");
    }

    #[test]
    fn test_caller_authentication_kept_without_token() {
        let transport = HttpTransport::new(url("http://localhost:8080"), "my-app").unwrap();
        let mut headers = Headers::new();
        headers.insert("Authentication".to_string(), "Basic caller".to_string());

        let map = transport.request_headers(&headers, None, "logstash_1.log").unwrap();
        assert_eq!(map["authentication"], "Basic caller");
    }

    #[test]
    fn test_invalid_caller_header_is_request_error() {
        let transport = HttpTransport::new(url("http://localhost:8080"), "my-app").unwrap();
        let mut headers = Headers::new();
        headers.insert("bad header".to_string(), "x".to_string());

        let result = transport.request_headers(&headers, None, "logstash_1.log");
        assert!(matches!(result, Err(DeliveryError::Request(_))));
    }

    #[test]
    fn test_staged_payload_concatenates_frames() {
        let dir = tempfile::tempdir().unwrap();
        let frames = vec![b"{\"a\":1}\n".to_vec(), b"{\"b\":2}\n".to_vec()];

        let staged = StagedPayload::write(dir.path(), &frames).unwrap();
        let name = file_name_of(staged.path());
        assert!(name.starts_with("logstash_"));
        assert!(name.ends_with(".log"));

        let contents = std::fs::read(staged.path()).unwrap();
        assert_eq!(contents, b"{\"a\":1}\n{\"b\":2}\n");
    }

    #[tokio::test]
    async fn test_stage_runs_off_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let frames = vec![b"{}\n".to_vec()];

        let staged = StagedPayload::stage(dir.path().to_path_buf(), frames)
            .await
            .unwrap();
        assert_eq!(std::fs::read(staged.path()).unwrap(), b"{}\n");
    }

    #[test]
    fn test_staged_payload_removed_on_discard_and_drop() {
        let dir = tempfile::tempdir().unwrap();
        let frames = vec![b"{}\n".to_vec()];

        let staged = StagedPayload::write(dir.path(), &frames).unwrap();
        let path = staged.path().to_path_buf();
        assert!(path.exists());
        staged.discard();
        assert!(!path.exists());

        let staged = StagedPayload::write(dir.path(), &frames).unwrap();
        let path = staged.path().to_path_buf();
        drop(staged);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_staging_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let result = StagedPayload::stage(missing, vec![b"{}\n".to_vec()]).await;
        assert!(matches!(result, Err(DeliveryError::Staging(_))));
    }
}
