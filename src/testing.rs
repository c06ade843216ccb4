//! Helpers shared by unit tests: fixture keys, fast configuration, and an
//! in-process fake of the storage service.

use axum::extract::Query;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

use crate::client::Storage;
use crate::config::{ClientConfig, CredentialsKind, RetryConfig};
use crate::credentials::Credentials;

/// Service account key used to produce the golden signatures.
pub const TEST_SERVICE_ACCOUNT_JSON: &str = include_str!("../testdata/service_account.json");

/// Serve `app` on an ephemeral local port and return its base URL.
pub async fn spawn_fake_service(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Configuration pointing at `endpoint` with anonymous credentials and
/// millisecond backoff.
pub fn test_config(endpoint: &str) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.project_id = Some("test-project".to_string());
    config.api.endpoint = endpoint.to_string();
    config.api.request_timeout_secs = 10;
    config.credentials.kind = CredentialsKind::Anonymous;
    config.retry = RetryConfig {
        initial_delay_ms: 5,
        max_retry_delay_ms: 20,
        total_timeout_ms: 10_000,
        ..RetryConfig::default()
    };
    config
}

/// A client against `endpoint` built from [`test_config`].
pub fn test_storage(endpoint: &str) -> Storage {
    Storage::new(test_config(endpoint), Credentials::anonymous()).unwrap()
}

/// A request seen by a recording service.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub type Recorder = Arc<Mutex<Vec<RecordedRequest>>>;

/// `status` with a JSON body.
pub fn json_response(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

/// Serve every path with `respond`, recording each request.
pub async fn spawn_recording_service<F>(respond: F) -> (String, Recorder)
where
    F: Fn(&RecordedRequest) -> Response + Send + Sync + 'static,
{
    let recorder: Recorder = Arc::new(Mutex::new(Vec::new()));
    let respond = Arc::new(respond);
    let log = recorder.clone();
    let app = Router::new().fallback(
        move |method: Method,
              uri: Uri,
              Query(query): Query<HashMap<String, String>>,
              headers: HeaderMap,
              body: Bytes| {
            let respond = respond.clone();
            let log = log.clone();
            async move {
                let req = RecordedRequest {
                    method,
                    path: uri.path().to_string(),
                    query,
                    headers,
                    body,
                };
                let resp = respond(&req);
                log.lock().unwrap().push(req);
                resp
            }
        },
    );
    (spawn_fake_service(app).await, recorder)
}
