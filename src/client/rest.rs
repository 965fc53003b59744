//! Shared plumbing for the blocking `ureq` clients.
//!
//! - Agents never turn HTTP statuses into errors; callers map statuses
//!   themselves (a 404 is an answer for the identity lookup, not a failure).
//! - Every request is bounded by a global timeout.
//! - JSON bodies are decoded through `serde_path_to_error` so a malformed
//!   response names the offending field.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::StatusCode;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};

use crate::models::c8y::ServiceUser;

#[derive(Debug)]
pub enum ClientError {
    Timeout,
    Transport(String),
    Http { status: u16, message: String },
    Json { path: String, message: String },
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl core::fmt::Display for ClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ClientError::Timeout => write!(f, "request timed out"),
            ClientError::Transport(s) => write!(f, "transport error: {}", s),
            ClientError::Http { status, message } => write!(f, "http {}: {}", status, message),
            ClientError::Json { path, message } => write!(f, "json error at `{}`: {}", path, message),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ureq::Error> for ClientError {
    fn from(value: ureq::Error) -> Self {
        match value {
            ureq::Error::Timeout(_) => ClientError::Timeout,
            other => ClientError::Transport(other.to_string()),
        }
    }
}

/// Build an agent whose requests fail after `timeout` in total.
pub fn agent(timeout: Duration) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build();
    ureq::Agent::new_with_config(config)
}

/// Timeout for one request: `timeout`, shortened to what is left until `deadline`.
pub fn budget(timeout: Duration, deadline: Instant) -> Result<Duration, ClientError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(ClientError::Timeout);
    }
    Ok(timeout.min(left))
}

/// `Authorization` header value for a Cumulocity user (`tenant/user:password`).
pub fn basic_auth(user: &ServiceUser) -> String {
    let raw = format!("{}/{}:{}", user.tenant.0, user.name, user.password);
    format!("Basic {}", STANDARD.encode(raw))
}

/// Status and body text of a completed exchange.
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub body: String,
}

impl Reply {
    pub fn read(result: Result<http::Response<ureq::Body>, ureq::Error>) -> Result<Reply, ClientError> {
        let mut res = result?;
        let status = res.status();
        let body = res.body_mut().read_to_string()?;
        Ok(Reply { status, body })
    }

    /// Turn any non-2xx status into `ClientError::Http`.
    pub fn success(self) -> Result<Reply, ClientError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(self.into_error())
        }
    }

    pub fn into_error(self) -> ClientError {
        let message = if self.body.trim().is_empty() {
            String::from("<no body>")
        } else {
            self.body
        };
        ClientError::Http {
            status: self.status.as_u16(),
            message,
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        decode_json(&self.body)
    }
}

pub fn decode_json<T: DeserializeOwned>(body: &str) -> Result<T, ClientError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(de).map_err(|e| ClientError::Json {
        path: e.path().to_string(),
        message: e.inner().to_string(),
    })
}
