//! Keyed connection pool and the transport seam
//!
//! Connections are scoped to `(scheme, host)`. A [`PooledConnection`] is
//! checked out for one request/response cycle and handed back when it is
//! dropped, whatever happened in between.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use thiserror::Error;

use super::request::RequestSpec;
use crate::config::defaults::default_pool_size;
use crate::error::{ClientError, Result};

/// Transport-level outcome of reading from a connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The request went out but the response headers are not available yet
    #[error("response not ready")]
    NotReady,

    /// Connecting, sending or reading failed
    #[error("{0}")]
    Failed(String),
}

/// Response exactly as read off the wire
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status code
    pub status: u16,
    /// Reason phrase, possibly percent-encoded
    pub reason: String,
    /// Header pairs in arrival order
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
}

/// An open transport connection to one `(scheme, host)`
pub trait Connection: Send {
    /// Start sending `request`; must not wait for the response
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Failed`] if the request cannot be dispatched.
    fn send(&mut self, request: &RequestSpec) -> std::result::Result<(), TransportError>;

    /// Read the response of the last request sent
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotReady`] while the response is still in
    /// flight and [`TransportError::Failed`] on any other failure.
    fn read_response(&mut self) -> std::result::Result<RawResponse, TransportError>;
}

/// Opens new connections for the pool
pub trait Connector: Send + Sync {
    /// Open a connection to `key`
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Failed`] if the connection cannot be opened.
    fn connect(&self, key: &PoolKey) -> std::result::Result<Box<dyn Connection>, TransportError>;
}

/// Pool scope: one bucket of connections per scheme and `host[:port]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// `http` or `https`
    pub scheme: String,
    /// `host[:port]`
    pub host: String,
}

impl PoolKey {
    /// Build a key from its parts
    pub fn new(scheme: &str, host: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)
    }
}

#[derive(Default)]
struct Bucket {
    idle: Vec<Box<dyn Connection>>,
    checked_out: usize,
}

/// Thread-safe keyed connection pool
///
/// Share it as `Arc<ConnectionPool>`; every [`super::Client`] clone and every
/// [`super::LazyResponse`] holds one.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    default_size: usize,
    buckets: Mutex<HashMap<PoolKey, Bucket>>,
    released: Condvar,
}

impl ConnectionPool {
    /// Create an empty pool that opens connections through `connector`
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            default_size: default_pool_size(),
            buckets: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Pool backed by the real HTTP transport
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn http(request_timeout: Duration) -> Result<Self> {
        Ok(Self::new(Arc::new(HttpConnector::new(request_timeout)?)))
    }

    /// Override the per-key size used when a caller gives no hint
    #[must_use]
    pub fn with_default_size(mut self, size: usize) -> Self {
        self.default_size = size.max(1);
        self
    }

    /// Per-key size used when a caller gives no hint
    pub const fn default_size(&self) -> usize {
        self.default_size
    }

    /// Check out a connection for `key`, blocking while the key is at capacity
    ///
    /// # Errors
    ///
    /// Returns a status-0 [`ClientError`] if a new connection cannot be opened.
    pub fn checkout(self: &Arc<Self>, key: &PoolKey, size_hint: Option<usize>) -> Result<PooledConnection> {
        let limit = size_hint.unwrap_or(self.default_size).max(1);

        let mut buckets = self.buckets.lock();
        let reused = loop {
            {
                let bucket = buckets.entry(key.clone()).or_default();
                if bucket.checked_out < limit {
                    bucket.checked_out += 1;
                    break bucket.idle.pop();
                }
            }
            self.released.wait(&mut buckets);
        };
        drop(buckets);

        let connection = match reused {
            Some(connection) => connection,
            None => match self.connector.connect(key) {
                Ok(connection) => connection,
                Err(err) => {
                    self.release(key, None);
                    return Err(ClientError::new(format!("Failed to connect to {key}: {err}")));
                }
            },
        };

        Ok(PooledConnection {
            pool: Arc::clone(self),
            key: key.clone(),
            connection: Some(connection),
            reusable: true,
        })
    }

    /// Idle connections currently parked for `key`
    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.buckets.lock().get(key).map_or(0, |bucket| bucket.idle.len())
    }

    /// Connections currently checked out for `key`
    pub fn checked_out(&self, key: &PoolKey) -> usize {
        self.buckets.lock().get(key).map_or(0, |bucket| bucket.checked_out)
    }

    fn release(&self, key: &PoolKey, connection: Option<Box<dyn Connection>>) {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.clone()).or_default();
        bucket.checked_out = bucket.checked_out.saturating_sub(1);
        if let Some(connection) = connection {
            if bucket.idle.len() < self.default_size {
                bucket.idle.push(connection);
            }
        }
        drop(buckets);
        let _ = self.released.notify_all();
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("default_size", &self.default_size)
            .field("keys", &self.buckets.lock().len())
            .finish_non_exhaustive()
    }
}

/// RAII guard over a checked-out connection
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    key: PoolKey,
    connection: Option<Box<dyn Connection>>,
    reusable: bool,
}

impl PooledConnection {
    /// The underlying connection
    ///
    /// # Errors
    ///
    /// Never fails while the guard is alive; the `Result` covers a guard
    /// whose connection was already handed back.
    pub fn connection(&mut self) -> Result<&mut dyn Connection> {
        match self.connection.as_mut() {
            Some(connection) => Ok(connection.as_mut()),
            None => Err(ClientError::new(format!("Connection to {} already released", self.key))),
        }
    }

    /// Drop the connection instead of parking it when the guard goes away
    pub fn discard(&mut self) {
        self.reusable = false;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let connection = self.connection.take().filter(|_| self.reusable);
        self.pool.release(&self.key, connection);
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("key", &self.key)
            .field("reusable", &self.reusable)
            .finish_non_exhaustive()
    }
}

/// Opens [`HttpConnection`]s that share one reqwest client
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: HttpClient,
}

impl HttpConnector {
    /// Create a connector for requests waited on for up to `request_timeout`
    ///
    /// Transport workers themselves give up at twice that, so the caller's
    /// wait budget always runs out first.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be built (e.g., TLS backend failure).
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = HttpClient::builder()
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true) // Disable Nagle's algorithm (lower latency)
            .pool_max_idle_per_host(default_pool_size())
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout.saturating_mul(2))
            .build()?;
        Ok(Self { client })
    }
}

impl Connector for HttpConnector {
    fn connect(&self, key: &PoolKey) -> std::result::Result<Box<dyn Connection>, TransportError> {
        Ok(Box::new(HttpConnection {
            client: self.client.clone(),
            origin: key.to_string(),
            pending: None,
        }))
    }
}

type Delivery = std::result::Result<RawResponse, String>;

/// reqwest-backed connection
///
/// `send` hands the request to a worker thread; `read_response` reports
/// [`TransportError::NotReady`] until that worker has read the whole response.
#[derive(Debug)]
pub struct HttpConnection {
    client: HttpClient,
    origin: String,
    pending: Option<Receiver<Delivery>>,
}

impl Connection for HttpConnection {
    fn send(&mut self, request: &RequestSpec) -> std::result::Result<(), TransportError> {
        if self.pending.is_some() {
            return Err(TransportError::Failed(format!(
                "A request is already in flight on {}",
                self.origin
            )));
        }

        let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
            .map_err(|e| TransportError::Failed(e.to_string()))?;
        // a raw backslash would be read as a separator by the URL parser
        let path = request.path().replace('\\', "%5C");
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.origin));
        for (name, value) in request.headers() {
            // reqwest derives it from the body
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body() {
            builder = builder.body(body.to_vec());
        }

        let (tx, rx) = mpsc::channel();
        let _ = thread::Builder::new()
            .name(format!("nimbus-http-{}", request.id()))
            .spawn(move || {
                let _ = tx.send(execute(builder));
            })
            .map_err(|e| TransportError::Failed(format!("Failed to start transport worker: {e}")))?;

        self.pending = Some(rx);
        Ok(())
    }

    fn read_response(&mut self) -> std::result::Result<RawResponse, TransportError> {
        let rx = self
            .pending
            .as_ref()
            .ok_or_else(|| TransportError::Failed("No request in flight".to_string()))?;

        match rx.try_recv() {
            Ok(delivery) => {
                self.pending = None;
                delivery.map_err(TransportError::Failed)
            }
            Err(TryRecvError::Empty) => Err(TransportError::NotReady),
            Err(TryRecvError::Disconnected) => {
                self.pending = None;
                Err(TransportError::Failed(
                    "Transport worker exited without a response".to_string(),
                ))
            }
        }
    }
}

fn execute(builder: RequestBuilder) -> Delivery {
    let response = builder.send().map_err(|e| e.to_string())?;
    let status = response.status();
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
    let body = response.bytes().map_err(|e| e.to_string())?.to_vec();

    Ok(RawResponse {
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or_default().to_string(),
        headers,
        body,
    })
}
