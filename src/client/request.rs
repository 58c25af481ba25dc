//! Request description and the single HTTP round trip
//!
//! A [`RequestSpec`] is immutable once built. It knows where it goes
//! (scheme, host, path with query) and what it carries (method, headers,
//! body), and [`RequestSpec::perform`] runs it exactly once on a connection
//! that the caller already checked out of the pool.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use url::Url;
use uuid::Uuid;

use super::pool::{Connection, PoolKey, RawResponse, TransportError};
use super::{is_auth_header, WireLog};
use crate::config::defaults::{DEFAULT_BASE_URL, DEFAULT_TIMEOUT_SECS, NOT_READY_WAIT};
use crate::error::{ClientError, Result};

/// HTTP verbs the engine is allowed to send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `HEAD`
    Head,
    /// `DELETE`
    Delete,
    /// `COPY` (object storage extension)
    Copy,
    /// `MOVE` (object storage extension)
    Move,
}

impl Method {
    /// Every accepted verb, in wire order
    pub const ALL: [Self; 7] = [
        Self::Get,
        Self::Post,
        Self::Put,
        Self::Head,
        Self::Delete,
        Self::Copy,
        Self::Move,
    ];

    /// Upper-case wire name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Head => "HEAD",
            Self::Delete => "DELETE",
            Self::Copy => "COPY",
            Self::Move => "MOVE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ClientError;

    fn from_str(value: &str) -> Result<Self> {
        let wanted = value.to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|method| method.as_str() == wanted)
            .ok_or_else(|| ClientError::new(format!("Invalid http method {value}")))
    }
}

/// One fully-resolved HTTP request
#[derive(Debug, Clone)]
pub struct RequestSpec {
    id: Uuid,
    method: Method,
    url: String,
    scheme: String,
    host: String,
    path: String,
    headers: BTreeMap<String, String>,
    body: Option<Vec<u8>>,
    timeout: Duration,
    wire_log: WireLog,
}

impl RequestSpec {
    /// Resolve `base_url` + `path` + `params` into a request
    ///
    /// Params without a value are rendered as a bare key (`?shared`).
    ///
    /// # Errors
    ///
    /// Returns a status-0 [`ClientError`] if the assembled URL cannot be parsed
    /// or has no host.
    pub fn new(
        method: Method,
        base_url: &str,
        path: &str,
        params: &[(String, Option<String>)],
        headers: BTreeMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> Result<Self> {
        let url = build_url(base_url, path, params);
        let parsed =
            Url::parse(&url).map_err(|e| ClientError::new(format!("Invalid URL {url}: {e}")))?;

        let host = parsed
            .host_str()
            .ok_or_else(|| ClientError::new(format!("Invalid URL {url}: no host")))?;
        let host = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let request_path = raw_path(&url)
            .ok_or_else(|| ClientError::new(format!("Invalid URL {url}: no authority")))?;

        Ok(Self {
            id: Uuid::now_v7(),
            method,
            scheme: parsed.scheme().to_string(),
            host,
            path: request_path,
            url,
            headers,
            body,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            wire_log: WireLog::default(),
        })
    }

    /// Replace the not-ready wait budget
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the wire logging switches
    #[must_use]
    pub const fn with_wire_log(mut self, wire_log: WireLog) -> Self {
        self.wire_log = wire_log;
        self
    }

    /// Correlation id printed on every send/recv log line
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// HTTP verb
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Full URL as assembled, before splitting
    pub fn url(&self) -> &str {
        &self.url
    }

    /// `http` or `https`
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// `host[:port]`
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Path including the encoded query string
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Request headers, keys as given by the caller
    pub const fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Request body, if any
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Total time allowed for the response to become ready
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wire logging switches in effect for this request
    pub const fn wire_log(&self) -> WireLog {
        self.wire_log
    }

    /// Pool key this request's connection is scoped to
    pub fn pool_key(&self) -> PoolKey {
        PoolKey::new(&self.scheme, &self.host)
    }

    /// Send the request on `connection` and wait for its response
    ///
    /// Only the "response not ready" condition is retried, sleeping a
    /// jittered interval between reads until the wait budget is spent.
    /// Every other transport failure is returned immediately.
    ///
    /// # Errors
    ///
    /// Returns a status-0 [`ClientError`] on transport failure or when the
    /// wait budget runs out.
    pub fn perform(&self, connection: &mut dyn Connection) -> Result<RawResponse> {
        connection
            .send(self)
            .map_err(|e| ClientError::new(e.to_string()))?;
        self.dump_log();

        let mut budget = self.timeout;
        loop {
            match connection.read_response() {
                Ok(response) => return Ok(response),
                Err(TransportError::NotReady) if budget.is_zero() => break,
                Err(TransportError::NotReady) => {
                    let wait = NOT_READY_WAIT.mul_f64(rand::random::<f64>());
                    std::thread::sleep(wait);
                    budget = budget.saturating_sub(wait);
                }
                Err(TransportError::Failed(reason)) => return Err(ClientError::new(reason)),
            }
        }

        tracing::debug!(
            target: "nimbus::recv",
            "Timeout {} {}\t[{}]",
            self.method,
            self.path,
            self.id
        );
        Err(ClientError::new(format!(
            "HTTP response took longer than {}s - client timeout",
            self.timeout.as_secs_f64()
        )))
    }

    fn dump_log(&self) {
        let id = self.id;
        tracing::info!(
            target: "nimbus::send",
            "{} {}://{}{}\t[{id}]",
            self.method,
            self.scheme,
            self.host,
            self.path
        );
        for (name, value) in &self.headers {
            if !self.wire_log.log_token && is_auth_header(name) {
                continue;
            }
            tracing::info!(target: "nimbus::send", "  {name}: {value}\t[{id}]");
        }
        let size = self.body.as_ref().map_or(0, Vec::len);
        tracing::info!(target: "nimbus::send", "data size:{size}\t[{id}]");
        if self.wire_log.log_data {
            if let Some(body) = &self.body {
                tracing::info!(target: "nimbus::send", "{}", String::from_utf8_lossy(body));
            }
        }
    }
}

/// Join base URL, path and query parameters into one URL string
fn build_url(base_url: &str, path: &str, params: &[(String, Option<String>)]) -> String {
    let mut url = if base_url.is_empty() {
        DEFAULT_BASE_URL.to_string()
    } else {
        encode_path(base_url)
    };
    if !url.ends_with('/') {
        url.push('/');
    }
    url.push_str(&encode_path(path.strip_prefix('/').unwrap_or(path)));

    let mut delim = if url.contains('?') { '&' } else { '?' };
    for (key, value) in params {
        url.push(delim);
        url.push_str(key);
        if let Some(value) = value.as_deref().filter(|value| !value.is_empty()) {
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        delim = '&';
    }
    url
}

/// Path and query exactly as assembled, i.e. everything after the authority
///
/// Dot segments and backslashes are object-name text here, not URL syntax.
fn raw_path(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("://")?;
    let path = match rest.find(['/', '?']) {
        Some(start) => &rest[start..],
        None => "",
    };
    Some(if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    })
}

/// Percent-encode non-ASCII and whitespace characters, leaving URL syntax alone
fn encode_path(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_graphic() {
            encoded.push(ch);
        } else {
            let mut buf = [0_u8; 4];
            for byte in ch.encode_utf8(&mut buf).bytes() {
                encoded.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    encoded
}
