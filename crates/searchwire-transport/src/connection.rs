//! Cluster node addressing: descriptors, roles and the immutable [`Connection`] handle.
//!
//! Health state (alive/dead, dead count, resurrect timer) is not stored here; it is owned
//! by [`crate::pool::ConnectionPool`] and only changes through its mark operations.

use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Capability tags reported by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roles {
    /// Eligible for cluster management.
    pub master: bool,
    /// Holds data.
    pub data: bool,
    /// Runs ingest pipelines.
    pub ingest: bool,
    /// Runs machine learning jobs.
    pub ml: bool,
}

impl Default for Roles {
    fn default() -> Self {
        Self {
            master: true,
            data: true,
            ingest: true,
            ml: false,
        }
    }
}

impl Roles {
    /// Builds roles from the role names a node reports (`data_hot`, `data_content`, ... count as data).
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let mut roles = Roles {
            master: false,
            data: false,
            ingest: false,
            ml: false,
        };
        for name in names {
            match name.as_ref() {
                "master" => roles.master = true,
                "ingest" => roles.ingest = true,
                "ml" => roles.ml = true,
                n if n == "data" || n.starts_with("data_") => roles.data = true,
                _ => {}
            }
        }
        roles
    }

    /// True when the node can only do cluster management.
    pub fn is_master_only(&self) -> bool {
        self.master && !self.data && !self.ingest
    }
}

/// Health status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Eligible for normal selection.
    #[default]
    Alive,
    /// Quarantined until its resurrect timeout elapses.
    Dead,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Alive => write!(f, "alive"),
            ConnectionStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Node description used to build connections, either configured or discovered by sniffing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Base URL of the node.
    pub url: String,
    /// Stable identifier; defaults to the normalized URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Roles; defaults to [`Roles::default`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Roles>,
}

impl NodeDescriptor {
    /// Creates a descriptor for the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            id: None,
            roles: None,
        }
    }

    /// Sets the identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the roles.
    pub fn with_roles(mut self, roles: Roles) -> Self {
        self.roles = Some(roles);
        self
    }
}

/// An addressable cluster node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    id: String,
    url: Url,
    roles: Roles,
}

impl Connection {
    /// Builds a connection from a descriptor, normalizing its URL.
    pub fn from_descriptor(descriptor: &NodeDescriptor) -> Result<Self> {
        let url = normalize_url(&descriptor.url)?;
        let id = descriptor
            .id
            .clone()
            .unwrap_or_else(|| url.as_str().to_string());
        if id.is_empty() {
            return Err(TransportError::Configuration(format!(
                "empty connection id for {}",
                url
            )));
        }
        Ok(Self {
            id,
            url,
            roles: descriptor.roles.unwrap_or_default(),
        })
    }

    /// Identifier, unique within a pool.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Base URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Capability tags.
    pub fn roles(&self) -> Roles {
        self.roles
    }

    /// Full URL for a request path, keeping any path prefix of the base URL.
    pub fn request_url(&self, path: &str, querystring: Option<&str>) -> String {
        let base = self.url.as_str().trim_end_matches('/');
        let mut full = String::with_capacity(base.len() + path.len() + 1);
        full.push_str(base);
        if !path.starts_with('/') {
            full.push('/');
        }
        full.push_str(path);
        if let Some(qs) = querystring.filter(|qs| !qs.is_empty()) {
            full.push('?');
            full.push_str(qs);
        }
        full
    }

    /// Descriptor that would recreate this connection.
    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            url: self.url.to_string(),
            id: Some(self.id.clone()),
            roles: Some(self.roles),
        }
    }

    pub(crate) fn with_id(&self, id: &str) -> Self {
        Self {
            id: id.to_string(),
            url: self.url.clone(),
            roles: self.roles,
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.url)
    }
}

/// Parses a node URL, assuming `http://` when no scheme is given.
pub fn normalize_url(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(TransportError::Configuration("empty node url".to_string()));
    }
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };
    let url = Url::parse(&with_scheme)
        .map_err(|e| TransportError::Configuration(format!("invalid node url {}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(TransportError::Configuration(format!(
                "unsupported scheme {} in {}",
                other, raw
            )))
        }
    }
    if url.host_str().is_none() {
        return Err(TransportError::Configuration(format!(
            "node url {} has no host",
            raw
        )));
    }
    Ok(url)
}
