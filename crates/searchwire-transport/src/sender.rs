//! Byte-level sender abstraction.
//!
//! The transport never talks to the network itself. It hands an [`OutgoingRequest`] to an
//! [`HttpSender`] and interprets the [`RawResponse`] or [`SendError`] it gets back.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::Connection;
use crate::error::TransportError;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// GET
    Get,
    /// HEAD
    Head,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
    /// PATCH
    Patch,
}

impl Method {
    /// Canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "PATCH" => Ok(Method::Patch),
            other => Err(TransportError::Configuration(format!(
                "unsupported method {}",
                other
            ))),
        }
    }
}

/// A fully prepared request, ready to be sent to any connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRequest {
    /// Method.
    pub method: Method,
    /// Absolute path, starting with `/`.
    pub path: String,
    /// Encoded query string without the leading `?`.
    pub querystring: Option<String>,
    /// Header names are lower-case.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<Bytes>,
}

impl OutgoingRequest {
    /// Creates a request with no headers, query or body.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            querystring: None,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Liveness probe used by the ping resurrect strategy.
    pub fn ping() -> Self {
        Self::new(Method::Head, "/")
    }
}

/// What a node sent back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Header names are lower-case; repeated headers appear repeatedly.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Bytes,
}

impl RawResponse {
    /// Response with an empty body and no headers.
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }
}

/// Kind of connection-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendErrorKind {
    /// Nothing listening at the address.
    ConnectionRefused,
    /// The peer dropped the connection.
    ConnectionReset,
    /// Host name could not be resolved.
    Dns,
    /// The attempt did not finish in time.
    Timeout,
    /// Anything else below HTTP.
    Other,
}

impl fmt::Display for SendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SendErrorKind::ConnectionRefused => "connection refused",
            SendErrorKind::ConnectionReset => "connection reset",
            SendErrorKind::Dns => "dns",
            SendErrorKind::Timeout => "timeout",
            SendErrorKind::Other => "transport",
        };
        f.write_str(name)
    }
}

/// A transport-level failure reported by a sender.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct SendError {
    /// Failure class.
    pub kind: SendErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl SendError {
    /// Creates a send error.
    pub fn new(kind: SendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Attempt timeout after `timeout`.
    pub fn timeout(timeout: Duration) -> Self {
        Self::new(
            SendErrorKind::Timeout,
            format!("no response within {}ms", timeout.as_millis()),
        )
    }
}

/// Capability to send one request to one node.
#[async_trait]
pub trait HttpSender: Send + Sync + 'static {
    /// Sends `request` to `connection`, giving up after `timeout`.
    async fn send(
        &self,
        connection: &Connection,
        request: &OutgoingRequest,
        timeout: Duration,
    ) -> Result<RawResponse, SendError>;
}
