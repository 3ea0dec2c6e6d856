//! Per-call request surface: what endpoint builders hand to `execute`, and what they get back.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TransportError};
use crate::events::RequestId;
use crate::sender::{Method, RawResponse};

/// The `(method, path, querystring, body)` tuple produced by an endpoint builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestParams {
    /// Method.
    pub method: Method,
    /// Path, starting with `/`.
    pub path: String,
    /// Unencoded query parameters, in order.
    pub querystring: Vec<(String, String)>,
    /// Request body.
    pub body: Option<Bytes>,
}

impl RequestParams {
    /// Creates params for `method path`.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            querystring: Vec::new(),
            body: None,
        }
    }

    /// Appends a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.querystring.push((key.into(), value.into()));
        self
    }

    /// Sets a raw body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serializes `value` as the JSON body.
    pub fn json<T: Serialize>(mut self, value: &T) -> Result<Self> {
        self.body = Some(Bytes::from(serde_json::to_vec(value)?));
        Ok(self)
    }

    /// Percent-encoded query string, or `None` when there are no parameters.
    pub fn encoded_querystring(&self) -> Option<String> {
        encode_querystring(&self.querystring)
    }
}

/// Encodes `key=value` pairs joined by `&`.
pub fn encode_querystring(pairs: &[(String, String)]) -> Option<String> {
    if pairs.is_empty() {
        return None;
    }
    let encoded = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    Some(encoded)
}

/// Per-call overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Per-attempt timeout; defaults to the transport's request timeout.
    pub request_timeout: Option<Duration>,
    /// Retry budget; defaults to the transport's `max_retries`.
    pub max_retries: Option<u32>,
    /// Extra headers, overriding defaults with the same name.
    pub headers: Vec<(String, String)>,
    /// Status codes returned as successful responses instead of errors.
    pub ignore_status_codes: Vec<u16>,
    /// Overall budget for the logical request across all attempts.
    pub deadline: Option<Duration>,
    /// Sent as `x-opaque-id`.
    pub opaque_id: Option<String>,
}

impl RequestOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-attempt timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the retry budget.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Adds a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Treats `status` as a non-error response.
    pub fn ignore(mut self, status: u16) -> Self {
        self.ignore_status_codes.push(status);
        self
    }

    /// Sets the overall deadline.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the opaque id header.
    pub fn opaque_id(mut self, id: impl Into<String>) -> Self {
        self.opaque_id = Some(id.into());
        self
    }

    pub(crate) fn validate(&self, params: &RequestParams) -> Result<()> {
        if !params.path.starts_with('/') {
            return Err(TransportError::Configuration(format!(
                "path must start with '/': {:?}",
                params.path
            )));
        }
        if params.method == Method::Head && params.body.is_some() {
            return Err(TransportError::Configuration(
                "HEAD requests cannot carry a body".to_string(),
            ));
        }
        if self.request_timeout == Some(Duration::ZERO) {
            return Err(TransportError::Configuration(
                "request_timeout must be greater than zero".to_string(),
            ));
        }
        if self.deadline == Some(Duration::ZERO) {
            return Err(TransportError::Configuration(
                "deadline must be greater than zero".to_string(),
            ));
        }
        if let (Some(timeout), Some(deadline)) = (self.request_timeout, self.deadline) {
            if timeout > deadline {
                return Err(TransportError::Configuration(format!(
                    "request_timeout {}ms exceeds deadline {}ms",
                    timeout.as_millis(),
                    deadline.as_millis()
                )));
            }
        }
        for (name, _) in &self.headers {
            if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == ':') {
                return Err(TransportError::Configuration(format!(
                    "invalid header name {:?}",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Status codes that mean "this node cannot serve traffic right now".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryableStatusCodes(BTreeSet<u16>);

impl RetryableStatusCodes {
    /// Builds the set from a list of codes.
    pub fn new(codes: impl IntoIterator<Item = u16>) -> Self {
        Self(codes.into_iter().collect())
    }

    /// True when `status` marks the node dead.
    pub fn contains(&self, status: u16) -> bool {
        self.0.contains(&status)
    }
}

impl Default for RetryableStatusCodes {
    fn default() -> Self {
        Self::new([502, 503, 504])
    }
}

/// Where and how a response was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    /// Opaque id of the logical request.
    pub request_id: RequestId,
    /// Connection that produced the response.
    pub connection_id: String,
    /// Physical attempts made, including the successful one.
    pub attempts: u32,
}

/// A response from the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
    warnings: Vec<String>,
    meta: ResponseMeta,
}

impl Response {
    pub(crate) fn from_raw(raw: RawResponse, meta: ResponseMeta) -> Self {
        let warnings = raw
            .headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("warning"))
            .map(|(_, value)| value.clone())
            .collect();
        Self {
            status: raw.status,
            headers: raw.headers,
            body: raw.body,
            warnings,
            meta,
        }
    }

    /// HTTP status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// True for 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// All headers.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First value of header `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Deprecation warnings sent by the node.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Raw body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body as UTF-8 text, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Request bookkeeping.
    pub fn meta(&self) -> &ResponseMeta {
        &self.meta
    }
}
