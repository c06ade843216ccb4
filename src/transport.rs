//! HTTP plumbing shared by every resource.
//!
//! A [`Transport`] owns the `reqwest` client, credentials, endpoint and
//! retry policy.  Resource handles describe calls as [`ApiRequest`]s; the
//! transport attaches authentication and client headers, runs each call
//! through the retry engine, and maps error responses to
//! [`StorageError`].
//!
//! Every attempt of one logical call carries the same
//! `gccl-invocation-id` and an incrementing `gccl-attempt-count` in the
//! `x-goog-api-client` header.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::{Method, StatusCode};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::credentials::Credentials;
use crate::errors::{Result, StorageError};
use crate::metrics;
use crate::model::ListPage;
use crate::retry::{Idempotency, RetryPolicy};

/// Crate version reported in client headers.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Header identifying the client library and the attempt.
pub const API_CLIENT_HEADER: &str = "x-goog-api-client";

/// Characters left literal in a path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Characters left literal in an XML API object path.
const XML_OBJECT_PATH: &AsciiSet = &PATH_SEGMENT.remove(b'/');

/// Percent-encode a bucket or object name for use as one path segment.
pub fn encode_path_segment(name: &str) -> String {
    utf8_percent_encode(name, PATH_SEGMENT).to_string()
}

/// Body of an [`ApiRequest`].
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Bytes { data: Bytes, content_type: String },
}

/// One logical API call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: RequestBody,
    /// Name used in not-found errors.
    pub resource: String,
    /// Name used in logs and retry metrics.
    pub operation: &'static str,
    pub idempotency: Idempotency,
    pub cancel: Option<CancellationToken>,
}

impl ApiRequest {
    /// Reads are idempotent; everything else starts as a conditional call
    /// without a precondition.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        let idempotency = if method == Method::GET || method == Method::HEAD {
            Idempotency::Idempotent
        } else {
            Idempotency::conditional(false)
        };
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            resource: String::new(),
            operation: "request",
            idempotency,
            cancel: None,
        }
    }

    pub fn query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    pub fn query_opt<V: ToString>(self, name: &str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.query(name, v),
            None => self,
        }
    }

    pub fn query_pairs<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: ToString,
        V: ToString,
    {
        self.query
            .extend(pairs.into_iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.body = RequestBody::Json(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn bytes(mut self, data: Bytes, content_type: impl Into<String>) -> Self {
        self.body = RequestBody::Bytes {
            data,
            content_type: content_type.into(),
        };
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn operation(mut self, operation: &'static str) -> Self {
        self.operation = operation;
        self
    }

    pub fn idempotency(mut self, idempotency: Idempotency) -> Self {
        self.idempotency = idempotency;
        self
    }

    pub fn cancel_on(mut self, token: Option<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }
}

/// Shared HTTP state for one client.
#[derive(Debug)]
pub struct Transport {
    client: reqwest::Client,
    credentials: Credentials,
    endpoint: String,
    user_project: Option<String>,
    user_agent: String,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl Transport {
    pub fn new(config: &ClientConfig, client: reqwest::Client, credentials: Credentials) -> Self {
        let user_agent = match &config.api.user_agent {
            Some(extra) => format!("gcsclient/{CLIENT_VERSION} {extra}"),
            None => format!("gcsclient/{CLIENT_VERSION}"),
        };
        Self {
            client,
            credentials,
            endpoint: config.api.endpoint.trim_end_matches('/').to_string(),
            user_project: config.api.user_project.clone(),
            user_agent,
            retry: RetryPolicy::new(config.retry.clone()),
            request_timeout: config.api.request_timeout(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// `{endpoint}/storage/v1{path}`.
    pub fn json_url(&self, path: &str) -> String {
        format!("{}/storage/v1{path}", self.endpoint)
    }

    /// `{endpoint}/upload/storage/v1{path}`.
    pub fn upload_url(&self, path: &str) -> String {
        format!("{}/upload/storage/v1{path}", self.endpoint)
    }

    /// Path-style XML API URL of an object.
    pub fn xml_url(&self, bucket: &str, object: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint,
            encode_path_segment(bucket),
            utf8_percent_encode(object, XML_OBJECT_PATH)
        )
    }

    /// Public download URL of an object.
    pub fn public_url(&self, bucket: &str, object: &str) -> String {
        self.xml_url(bucket, object)
    }

    /// Send one attempt.  The response is returned whatever its status.
    pub async fn send_attempt(
        &self,
        req: &ApiRequest,
        invocation_id: &str,
        attempt: u32,
    ) -> Result<reqwest::Response> {
        let mut builder = self
            .client
            .request(req.method.clone(), &req.url)
            .timeout(self.request_timeout)
            .headers(req.headers.clone())
            .header(USER_AGENT, &self.user_agent)
            .header(
                API_CLIENT_HEADER,
                format!(
                    "gccl/{CLIENT_VERSION} gccl-invocation-id/{invocation_id} gccl-attempt-count/{attempt}"
                ),
            );

        let mut query = req.query.clone();
        if let Some(project) = &self.user_project {
            if !query.iter().any(|(k, _)| k == "userProject") {
                query.push(("userProject".to_string(), project.clone()));
            }
        }
        if !query.is_empty() {
            builder = builder.query(&query);
        }

        if let Some(auth) = self.credentials.authorization().await? {
            builder = builder.header(AUTHORIZATION, auth);
        }

        builder = match &req.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Bytes { data, content_type } => builder
                .header(CONTENT_TYPE, content_type.as_str())
                .body(data.clone()),
        };

        debug!(
            "{} {} {} (attempt {})",
            req.operation, req.method, req.url, attempt
        );
        let started = Instant::now();
        let resp = builder.send().await?;
        metrics::record_request(req.method.as_str(), resp.status().as_u16(), started.elapsed());

        if resp.status() == StatusCode::UNAUTHORIZED {
            self.credentials.invalidate().await;
        }
        Ok(resp)
    }

    /// Run `req` with retries, handing each successful response to `read`.
    ///
    /// `read` runs inside the retry loop, so a body that fails mid-stream
    /// is re-requested.
    pub async fn run<T, F, Fut>(&self, req: &ApiRequest, read: F) -> Result<T>
    where
        F: Fn(reqwest::Response) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let invocation_id = Uuid::new_v4().to_string();
        let read = &read;
        let invocation_id = invocation_id.as_str();
        self.retry
            .run(req.operation, req.idempotency, req.cancel.as_ref(), |attempt| async move {
                let resp = self.send_attempt(req, invocation_id, attempt).await?;
                let resp = check_response(resp, &req.resource).await?;
                read(resp).await
            })
            .await
    }

    /// Run `req` and return the successful response with its body unread.
    pub async fn execute(&self, req: ApiRequest) -> Result<reqwest::Response> {
        self.run(&req, |resp| async move { Ok(resp) }).await
    }

    /// Run `req` and decode a JSON response.
    pub async fn json<T: DeserializeOwned>(&self, req: ApiRequest) -> Result<T> {
        self.run(&req, |resp| async move { Ok(resp.json::<T>().await?) })
            .await
    }

    /// Run `req` and discard the response body.
    pub async fn empty(&self, req: ApiRequest) -> Result<()> {
        self.run(&req, |_| async { Ok(()) }).await
    }

    /// Fetch one page of a list call.
    pub async fn list_page<T: DeserializeOwned>(
        &self,
        req: ApiRequest,
        page_token: Option<&str>,
    ) -> Result<ListPage<T>> {
        self.json(req.query_opt("pageToken", page_token)).await
    }

    /// Follow `nextPageToken` until the listing is exhausted or `limit`
    /// items have been collected.
    pub async fn list_all<T: DeserializeOwned>(
        &self,
        req: ApiRequest,
        limit: Option<usize>,
    ) -> Result<ListPage<T>> {
        let mut all = ListPage::default();
        let mut token: Option<String> = None;
        loop {
            let page: ListPage<T> = self.list_page(req.clone(), token.as_deref()).await?;
            all.items.extend(page.items);
            for prefix in page.prefixes {
                if !all.prefixes.contains(&prefix) {
                    all.prefixes.push(prefix);
                }
            }
            if let Some(limit) = limit {
                if all.items.len() >= limit {
                    all.items.truncate(limit);
                    all.next_page_token = page.next_page_token;
                    return Ok(all);
                }
            }
            match page.next_page_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => return Ok(all),
            }
        }
    }
}

/// Turn a non-success response into an error carrying any `Retry-After`.
pub async fn check_response(resp: reqwest::Response, resource: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = parse_retry_after(resp.headers(), SystemTime::now());
    let body = resp.text().await.unwrap_or_default();
    Err(StorageError::from_response(status, &body, resource).with_retry_after(retry_after))
}

/// Parse `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    Some(when.duration_since(now).unwrap_or(Duration::ZERO))
}
