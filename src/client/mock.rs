//! In-memory transport for engine tests
//!
//! Each `send` pops the next scripted [`Reply`] and records what was sent,
//! so tests can count network calls and inspect requests without sockets.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::pool::{Connection, ConnectionPool, Connector, PoolKey, RawResponse, TransportError};
use super::request::{Method, RequestSpec};

/// Scripted outcome of one request
#[derive(Debug, Clone)]
pub enum Reply {
    /// Report not-ready `usize` times, then deliver the response
    Ready(usize, RawResponse),
    /// Fail the read with this reason
    Fail(String),
    /// Never become ready
    Stall,
}

impl Reply {
    pub fn ok(status: u16, body: &str) -> Self {
        Self::after(0, status, body)
    }

    pub fn after(not_ready: usize, status: u16, body: &str) -> Self {
        Self::Ready(
            not_ready,
            RawResponse {
                status,
                reason: reason(status).to_string(),
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: body.as_bytes().to_vec(),
            },
        )
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        409 => "Conflict",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// A request as the transport saw it
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub method: Method,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<Reply>,
    sent: Vec<SentRequest>,
    connects: usize,
    refuse: bool,
}

#[derive(Debug, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connector whose every connect attempt fails
    pub fn refusing() -> Arc<Self> {
        let connector = Self::default();
        connector.script.lock().refuse = true;
        Arc::new(connector)
    }

    pub fn pool(self: &Arc<Self>) -> Arc<ConnectionPool> {
        let connector: Arc<dyn Connector> = Arc::<Self>::clone(self);
        Arc::new(ConnectionPool::new(connector))
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().replies.push_back(reply);
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.script.lock().sent.clone()
    }

    pub fn send_count(&self) -> usize {
        self.script.lock().sent.len()
    }

    pub fn connects(&self) -> usize {
        self.script.lock().connects
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, _key: &PoolKey) -> Result<Box<dyn Connection>, TransportError> {
        let mut script = self.script.lock();
        if script.refuse {
            return Err(TransportError::Failed("connection refused".to_string()));
        }
        script.connects += 1;
        Ok(Box::new(ScriptedConnection {
            script: Arc::clone(&self.script),
            current: None,
        }))
    }
}

struct ScriptedConnection {
    script: Arc<Mutex<Script>>,
    current: Option<Reply>,
}

impl Connection for ScriptedConnection {
    fn send(&mut self, request: &RequestSpec) -> Result<(), TransportError> {
        let mut script = self.script.lock();
        script.sent.push(SentRequest {
            method: request.method(),
            scheme: request.scheme().to_string(),
            host: request.host().to_string(),
            path: request.path().to_string(),
            headers: request.headers().clone(),
            body: request.body().map(<[u8]>::to_vec),
        });
        self.current = Some(
            script
                .replies
                .pop_front()
                .unwrap_or_else(|| Reply::Fail("no scripted reply".to_string())),
        );
        Ok(())
    }

    fn read_response(&mut self) -> Result<RawResponse, TransportError> {
        match self.current.take() {
            Some(Reply::Ready(0, response)) => Ok(response),
            Some(Reply::Ready(remaining, response)) => {
                self.current = Some(Reply::Ready(remaining - 1, response));
                Err(TransportError::NotReady)
            }
            Some(Reply::Stall) => {
                self.current = Some(Reply::Stall);
                Err(TransportError::NotReady)
            }
            Some(Reply::Fail(reason)) => Err(TransportError::Failed(reason)),
            None => Err(TransportError::Failed("nothing sent".to_string())),
        }
    }
}
