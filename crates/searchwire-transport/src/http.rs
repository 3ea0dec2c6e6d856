//! [`HttpSender`] implementation backed by `reqwest`.

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::connection::Connection;
use crate::error::{Result, TransportError};
use crate::sender::{HttpSender, Method, OutgoingRequest, RawResponse, SendError, SendErrorKind};

/// Sends requests with a shared `reqwest::Client` (connection reuse across nodes).
#[derive(Debug, Clone)]
pub struct ReqwestSender {
    client: reqwest::Client,
}

impl ReqwestSender {
    /// Creates a sender with default client settings.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Configuration(format!("http client: {}", e)))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
        Method::Patch => reqwest::Method::PATCH,
    }
}

/// Maps a reqwest failure onto the transport's failure classes.
fn classify(err: reqwest::Error) -> SendError {
    if err.is_timeout() {
        return SendError::new(SendErrorKind::Timeout, err.to_string());
    }

    let mut kind = SendErrorKind::Other;
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            kind = match io.kind() {
                std::io::ErrorKind::ConnectionRefused => SendErrorKind::ConnectionRefused,
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                    SendErrorKind::ConnectionReset
                }
                std::io::ErrorKind::TimedOut => SendErrorKind::Timeout,
                _ => kind,
            };
            break;
        }
        if cause.to_string().contains("dns error") {
            kind = SendErrorKind::Dns;
            break;
        }
        source = cause.source();
    }
    if kind == SendErrorKind::Other && err.is_connect() {
        kind = SendErrorKind::ConnectionRefused;
    }

    let mut message = err.to_string();
    if let Some(cause) = err.source() {
        message.push_str(": ");
        message.push_str(&cause.to_string());
    }
    SendError::new(kind, message)
}

#[async_trait]
impl HttpSender for ReqwestSender {
    async fn send(
        &self,
        connection: &Connection,
        request: &OutgoingRequest,
        timeout: Duration,
    ) -> std::result::Result<RawResponse, SendError> {
        let url = connection.request_url(&request.path, request.querystring.as_deref());
        trace!("{} {}", request.method, url);

        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &url)
            .timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await.map_err(classify)?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}
