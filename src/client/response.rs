//! Lazily materialized HTTP response
//!
//! Building a [`LazyResponse`] costs nothing on the network. The call runs
//! on the first [`LazyResponse::materialize`] (or any accessor) and its
//! outcome, success or failure, is memoized for the life of the value.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;

use super::is_auth_header;
use super::pool::{ConnectionPool, RawResponse};
use super::request::RequestSpec;
use crate::error::{ClientError, Result};

#[derive(Debug)]
struct Materialized {
    status_code: u16,
    status: String,
    headers: BTreeMap<String, String>,
    content: Vec<u8>,
}

/// Response handle returned by every [`super::Client`] call
#[derive(Debug)]
pub struct LazyResponse {
    request: RequestSpec,
    pool: Arc<ConnectionPool>,
    pool_size: Option<usize>,
    outcome: OnceCell<Result<Materialized>>,
}

impl LazyResponse {
    /// Wrap `request`; nothing is sent until the response is read
    pub const fn new(request: RequestSpec, pool: Arc<ConnectionPool>, pool_size: Option<usize>) -> Self {
        Self {
            request,
            pool,
            pool_size,
            outcome: OnceCell::new(),
        }
    }

    /// The request backing this response
    pub const fn request(&self) -> &RequestSpec {
        &self.request
    }

    /// Whether the network call has already happened
    pub fn is_materialized(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// Perform the call if it has not run yet
    ///
    /// # Errors
    ///
    /// Returns a status-0 [`ClientError`] if connecting or performing the
    /// request failed. The same error is returned on every later call.
    pub fn materialize(&self) -> Result<()> {
        self.state().map(|_| ())
    }

    /// HTTP status code
    ///
    /// # Errors
    ///
    /// See [`LazyResponse::materialize`].
    pub fn status_code(&self) -> Result<u16> {
        self.state().map(|state| state.status_code)
    }

    /// Reason phrase, percent-decoded
    ///
    /// # Errors
    ///
    /// See [`LazyResponse::materialize`].
    pub fn status(&self) -> Result<&str> {
        self.state().map(|state| state.status.as_str())
    }

    /// Response headers, values percent-decoded
    ///
    /// # Errors
    ///
    /// See [`LazyResponse::materialize`].
    pub fn headers(&self) -> Result<&BTreeMap<String, String>> {
        self.state().map(|state| &state.headers)
    }

    /// Look up one header, ignoring ASCII case
    ///
    /// # Errors
    ///
    /// See [`LazyResponse::materialize`].
    pub fn header(&self, name: &str) -> Result<Option<&str>> {
        Ok(self
            .headers()?
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str()))
    }

    /// Raw response body
    ///
    /// # Errors
    ///
    /// See [`LazyResponse::materialize`].
    pub fn content(&self) -> Result<&[u8]> {
        self.state().map(|state| state.content.as_slice())
    }

    /// Response body as text, invalid UTF-8 replaced
    ///
    /// # Errors
    ///
    /// See [`LazyResponse::materialize`].
    pub fn text(&self) -> Result<Cow<'_, str>> {
        self.content().map(String::from_utf8_lossy)
    }

    /// Decode the body as JSON
    ///
    /// # Errors
    ///
    /// Returns a status-0 [`ClientError`] if the body is not valid JSON for
    /// `T`, or see [`LazyResponse::materialize`].
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(self.content()?)
            .map_err(|e| ClientError::new(format!("Response not formatted in JSON - {e}")))
    }

    fn state(&self) -> Result<&Materialized> {
        self.outcome
            .get_or_init(|| self.perform())
            .as_ref()
            .map_err(Clone::clone)
    }

    fn perform(&self) -> Result<Materialized> {
        let key = self.request.pool_key();
        let attempt = self
            .pool
            .checkout(&key, self.pool_size)
            .and_then(|mut connection| {
                let result = connection
                    .connection()
                    .and_then(|conn| self.request.perform(conn));
                if result.is_err() {
                    connection.discard();
                }
                result
            });

        match attempt {
            Ok(raw) => Ok(self.record(raw)),
            Err(err) => {
                tracing::debug!(
                    target: "nimbus::recv",
                    "{} {} failed\t[{}]: {}",
                    self.request.method(),
                    self.request.url(),
                    self.request.id(),
                    err.message().trim_end()
                );
                Err(ClientError::new(format!(
                    "Failed while http-connecting to {} ({})",
                    self.request.url(),
                    err.message().trim_end()
                )))
            }
        }
    }

    fn record(&self, raw: RawResponse) -> Materialized {
        let id = self.request.id();
        let wire_log = self.request.wire_log();
        let status = unquote(&raw.reason);
        tracing::info!(target: "nimbus::recv", "{} {}\t[{id}]", raw.status, status);

        let mut headers = BTreeMap::new();
        for (name, value) in raw.headers {
            let value = unquote(&value);
            if wire_log.log_token || !is_auth_header(&name) {
                tracing::info!(target: "nimbus::recv", "  {name}: {value}\t[{id}]");
            }
            let _ = headers.insert(name, value);
        }

        tracing::info!(target: "nimbus::recv", "data size: {}\t[{id}]", raw.body.len());
        if wire_log.log_data && !raw.body.is_empty() {
            tracing::info!(target: "nimbus::recv", "{}\t[{id}]", String::from_utf8_lossy(&raw.body));
        }

        Materialized {
            status_code: raw.status,
            status,
            headers,
            content: raw.body,
        }
    }
}

fn unquote(value: &str) -> String {
    urlencoding::decode(value).map_or_else(|_| value.to_string(), Cow::into_owned)
}
