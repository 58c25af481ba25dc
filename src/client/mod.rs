//! HTTP engine shared by every Nimbus service wrapper
//!
//! Provides the [`Client`] base that service wrappers call into, the
//! lazily-performed [`LazyResponse`], the immutable [`RequestSpec`] and the
//! keyed connection pool underneath them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::defaults::{DEFAULT_MAX_THREADS, DEFAULT_TIMEOUT_SECS};
use crate::error::{ClientError, Result};
use crate::parallel::{self, AsyncTask, ThreadLimit};

#[cfg(test)]
pub(crate) mod mock;
pub mod pool;
pub mod request;
pub mod response;

pub use pool::{
    Connection, ConnectionPool, Connector, HttpConnector, PoolKey, PooledConnection, RawResponse,
    TransportError,
};
pub use request::{Method, RequestSpec};
pub use response::LazyResponse;

/// Header carrying the session token
pub const AUTH_HEADER: &str = "X-Auth-Token";

pub(crate) fn is_auth_header(name: &str) -> bool {
    name.eq_ignore_ascii_case(AUTH_HEADER)
}

/// Switches for logging sensitive request/response data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WireLog {
    /// Log `X-Auth-Token` header values
    pub log_token: bool,
    /// Log request and response bodies
    pub log_data: bool,
}

/// Knobs injected into a [`Client`] at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    /// Wait budget for a response that is not ready yet
    pub timeout: Duration,
    /// Pool-size hint applied when a call gives none
    pub pool_size: Option<usize>,
    /// Cap for the adaptive thread limit
    pub max_threads: usize,
    /// Sensitive-data logging switches
    pub wire_log: WireLog,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            pool_size: None,
            max_threads: DEFAULT_MAX_THREADS,
            wire_log: WireLog::default(),
        }
    }
}

/// Which response statuses count as success
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Success {
    /// Materialize immediately and fail unless the status is one of these
    Expect(Vec<u16>),
    /// Return the response unperformed; the caller inspects it
    Unchecked,
}

impl Success {
    /// Whether `status` satisfies this expectation
    pub fn accepts(&self, status: u16) -> bool {
        match self {
            Self::Expect(expected) => expected.contains(&status),
            Self::Unchecked => true,
        }
    }
}

impl Default for Success {
    fn default() -> Self {
        Self::Expect(vec![200])
    }
}

impl From<u16> for Success {
    fn from(status: u16) -> Self {
        Self::Expect(vec![status])
    }
}

impl<const N: usize> From<[u16; N]> for Success {
    fn from(statuses: [u16; N]) -> Self {
        Self::Expect(statuses.to_vec())
    }
}

impl From<Vec<u16>> for Success {
    fn from(statuses: Vec<u16>) -> Self {
        Self::Expect(statuses)
    }
}

impl From<Option<u16>> for Success {
    fn from(status: Option<u16>) -> Self {
        status.map_or(Self::Unchecked, Self::from)
    }
}

/// Everything one call carries besides method and path
///
/// Built fresh for each call; nothing in it survives into the next one.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    headers: BTreeMap<String, String>,
    params: Vec<(String, Option<String>)>,
    body: Option<Vec<u8>>,
    json: Option<Value>,
    success: Success,
    pool_size: Option<usize>,
}

impl RequestOptions {
    /// Empty options: no extra headers or params, expect `200`
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header, replacing any earlier value for the same name
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        let _ = self.headers.insert(name.into(), value.to_string());
        self
    }

    /// Add a query parameter, replacing any earlier value for the same key
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        set_param(&mut self.params, name.into(), Some(value.to_string()));
        self
    }

    /// Add a value-less query parameter (`?name`)
    #[must_use]
    pub fn flag(mut self, name: impl Into<String>) -> Self {
        set_param(&mut self.params, name.into(), None);
        self
    }

    /// Raw request body
    #[must_use]
    pub fn data(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// JSON request body; takes precedence over [`RequestOptions::data`]
    #[must_use]
    pub fn json(mut self, value: Value) -> Self {
        self.json = Some(value);
        self
    }

    /// Expected status or statuses
    #[must_use]
    pub fn success(mut self, success: impl Into<Success>) -> Self {
        self.success = success.into();
        self
    }

    /// Skip the status check and return the response unperformed
    #[must_use]
    pub fn unchecked(mut self) -> Self {
        self.success = Success::Unchecked;
        self
    }

    /// Pool-size hint for this call
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Lay these options over staged headers/params; these win on conflict
    fn over(mut self, staged: Staged) -> Self {
        let mut headers = staged.headers;
        headers.append(&mut self.headers);
        self.headers = headers;

        let mut params = staged.params;
        for (name, value) in self.params {
            set_param(&mut params, name, value);
        }
        self.params = params;
        self
    }
}

fn set_param(params: &mut Vec<(String, Option<String>)>, name: String, value: Option<String>) {
    match params.iter_mut().find(|(key, _)| *key == name) {
        Some(slot) => slot.1 = value,
        None => params.push((name, value)),
    }
}

#[derive(Debug, Clone, Default)]
struct Staged {
    headers: BTreeMap<String, String>,
    params: Vec<(String, Option<String>)>,
}

impl Staged {
    fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.params.is_empty()
    }
}

/// Base client every service wrapper builds on
///
/// Owns the service URL, the session token, the next call's staged
/// headers/params and the adaptive thread limit for fanned-out batches.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    token: String,
    pool: Arc<ConnectionPool>,
    settings: ClientSettings,
    staged: Staged,
    limiter: ThreadLimit,
}

impl Clone for Client {
    /// Clones share the pool and copy the thread limit; staged state is not cloned
    fn clone(&self) -> Self {
        Self {
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            pool: Arc::clone(&self.pool),
            settings: self.settings,
            staged: Staged::default(),
            limiter: self.limiter,
        }
    }
}

impl Client {
    /// Client over the real HTTP transport with default settings
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` or `token` is empty, or the HTTP
    /// transport cannot be built.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        Self::with_settings(base_url, token, ClientSettings::default())
    }

    /// Client over the real HTTP transport
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` or `token` is empty, or the HTTP
    /// transport cannot be built.
    pub fn with_settings(
        base_url: impl Into<String>,
        token: impl Into<String>,
        settings: ClientSettings,
    ) -> Result<Self> {
        let pool = Arc::new(ConnectionPool::http(settings.timeout)?);
        Self::with_pool(base_url, token, settings, pool)
    }

    /// Client over an existing pool
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` or `token` is empty.
    pub fn with_pool(
        base_url: impl Into<String>,
        token: impl Into<String>,
        settings: ClientSettings,
        pool: Arc<ConnectionPool>,
    ) -> Result<Self> {
        let base_url = base_url.into();
        let token = token.into();
        if base_url.is_empty() {
            return Err(ClientError::new("No base_url for client"));
        }
        if token.is_empty() {
            return Err(ClientError::new(format!("No token for client of {base_url}")));
        }

        Ok(Self {
            base_url,
            token,
            pool,
            settings,
            staged: Staged::default(),
            limiter: ThreadLimit::new(settings.max_threads),
        })
    }

    /// Service base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Current session token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Replace the session token used by later calls
    ///
    /// An empty token keeps the current one.
    pub fn set_token(&mut self, token: impl Into<String>) {
        let token = token.into();
        if !token.is_empty() {
            self.token = token;
        }
    }

    /// Settings injected at construction
    pub const fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Connection pool shared by this client and its clones
    pub const fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Stage a header for the next call only
    ///
    /// Names are case-sensitive keys: staging `x-mode` and passing `X-Mode`
    /// in the call's options sends both.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl ToString) {
        let _ = self.staged.headers.insert(name.into(), value.to_string());
    }

    /// Stage a header if `value` is present and `iff` holds
    pub fn set_header_if<V: ToString>(&mut self, name: impl Into<String>, value: Option<V>, iff: bool) {
        if let Some(value) = value.filter(|_| iff) {
            self.set_header(name, value);
        }
    }

    /// Stage a query parameter for the next call only, if `iff` holds
    ///
    /// A `None` value stages a bare key (`?name`).
    pub fn set_param<V: ToString>(&mut self, name: impl Into<String>, value: Option<V>, iff: bool) {
        if iff {
            set_param(
                &mut self.staged.params,
                name.into(),
                value.map(|value| value.to_string()),
            );
        }
    }

    /// Whether any header or param is waiting for the next call
    pub fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    /// Issue `method path` with the staged headers/params merged under `options`
    ///
    /// Staged state is consumed before anything else happens, so it never
    /// leaks into the following call whether this one succeeds or fails.
    ///
    /// # Errors
    ///
    /// Returns a status-0 [`ClientError`] on transport failure, or one carrying
    /// the response status when it is not among the expected statuses.
    pub fn request(&mut self, method: Method, path: &str, options: RequestOptions) -> Result<LazyResponse> {
        let staged = std::mem::take(&mut self.staged);
        self.execute(method, path, options.over(staged))
    }

    /// Issue `method path` ignoring staged state
    ///
    /// Takes `&self`, so concurrent tasks can share one client.
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn execute(&self, method: Method, path: &str, options: RequestOptions) -> Result<LazyResponse> {
        let RequestOptions {
            mut headers,
            params,
            body,
            json,
            success,
            pool_size,
        } = options;

        if !headers.keys().any(|name| is_auth_header(name)) {
            let _ = headers.insert(AUTH_HEADER.to_string(), self.token.clone());
        }
        let body = match json {
            Some(value) => {
                if !has_header(&headers, "Content-Type") {
                    let _ = headers.insert("Content-Type".to_string(), "application/json".to_string());
                }
                Some(serde_json::to_vec(&value)?)
            }
            None => body,
        };
        if let Some(body) = body.as_ref().filter(|body| !body.is_empty()) {
            if !has_header(&headers, "Content-Length") {
                let _ = headers.insert("Content-Length".to_string(), body.len().to_string());
            }
        }

        let spec = RequestSpec::new(method, &self.base_url, path, &params, headers, body)?
            .with_timeout(self.settings.timeout)
            .with_wire_log(self.settings.wire_log);
        let response = LazyResponse::new(
            spec,
            Arc::clone(&self.pool),
            pool_size.or(self.settings.pool_size),
        );

        if let Success::Expect(_) = success {
            let status = response.status_code()?;
            if !success.accepts(status) {
                return Err(status_error(&response, status));
            }
        }
        Ok(response)
    }

    /// `GET path`
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn get(&mut self, path: &str, options: RequestOptions) -> Result<LazyResponse> {
        self.request(Method::Get, path, options)
    }

    /// `POST path`
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn post(&mut self, path: &str, options: RequestOptions) -> Result<LazyResponse> {
        self.request(Method::Post, path, options)
    }

    /// `PUT path`
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn put(&mut self, path: &str, options: RequestOptions) -> Result<LazyResponse> {
        self.request(Method::Put, path, options)
    }

    /// `HEAD path`
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn head(&mut self, path: &str, options: RequestOptions) -> Result<LazyResponse> {
        self.request(Method::Head, path, options)
    }

    /// `DELETE path`
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn delete(&mut self, path: &str, options: RequestOptions) -> Result<LazyResponse> {
        self.request(Method::Delete, path, options)
    }

    /// `COPY path`
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn copy(&mut self, path: &str, options: RequestOptions) -> Result<LazyResponse> {
        self.request(Method::Copy, path, options)
    }

    /// `MOVE path`
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn r#move(&mut self, path: &str, options: RequestOptions) -> Result<LazyResponse> {
        self.request(Method::Move, path, options)
    }

    /// Current adaptive thread limit
    pub const fn thread_limit(&self) -> usize {
        self.limiter.limit()
    }

    /// Restart the adaptive thread limit from `limit`
    ///
    /// # Errors
    ///
    /// Returns an error if `limit` is zero.
    pub fn init_thread_limit(&mut self, limit: usize) -> Result<()> {
        self.limiter = ThreadLimit::with_limit(limit, self.settings.max_threads)?;
        Ok(())
    }

    /// Feed the in-flight batch through the adaptive thread limit
    ///
    /// Returns the tasks that were joined (all of `in_flight`, now empty) or
    /// nothing if the batch may still grow.
    pub fn watch_thread_limit<T: Send + 'static>(
        &mut self,
        in_flight: &mut Vec<AsyncTask<T>>,
    ) -> Vec<AsyncTask<T>> {
        self.limiter.watch(in_flight)
    }

    /// Run `jobs` concurrently under this client's adaptive thread limit
    pub fn run_throttled<T, F, I>(&mut self, jobs: I) -> Vec<AsyncTask<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
        I: IntoIterator<Item = F>,
    {
        parallel::run_throttled(&mut self.limiter, jobs)
    }
}

fn has_header(headers: &BTreeMap<String, String>, name: &str) -> bool {
    headers.keys().any(|key| key.eq_ignore_ascii_case(name))
}

/// Build the error for an unexpected status from the response's status line and body
fn status_error(response: &LazyResponse, status: u16) -> ClientError {
    let reason = response.status().unwrap_or_default();
    let message = match response.text() {
        Ok(text) => format!("{reason} {text}\n"),
        Err(err) => format!("{reason} {err}\n"),
    };
    ClientError::with_status(message, status)
}
