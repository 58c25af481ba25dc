//! Identity service wrapper
//!
//! Resolves a session token into the user info the identity service holds
//! for it, caching one entry per token.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::client::{Client, RequestOptions};
use crate::error::Result;

const AUTHENTICATE_PATH: &str = "/im/authenticate";

/// Client for the identity service
#[derive(Debug, Clone)]
pub struct IdentityClient {
    client: Client,
    cache: BTreeMap<String, Value>,
}

impl IdentityClient {
    /// Wrap an engine client pointed at the identity service
    pub const fn new(client: Client) -> Self {
        Self {
            client,
            cache: BTreeMap::new(),
        }
    }

    /// Underlying engine client
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// Authenticate `token` (or the current token) and cache the user info
    ///
    /// A given token becomes the client's token for later calls; an empty
    /// one is treated as absent.
    ///
    /// # Errors
    ///
    /// Returns the service error (e.g., 401 for a bad token) or a decode
    /// error if the body is not JSON.
    pub fn authenticate(&mut self, token: Option<&str>) -> Result<&Value> {
        if let Some(token) = token.filter(|token| !token.is_empty()) {
            self.client.set_token(token);
        }
        let token = self.client.token().to_string();

        let info: Value = self
            .client
            .get(AUTHENTICATE_PATH, RequestOptions::new())?
            .json()?;
        tracing::debug!(target: "nimbus::client", "authenticated token for {}", self.client.base_url());

        let slot = self.cache.entry(token).or_default();
        *slot = info;
        Ok(slot)
    }

    /// Cached user info for `token`, authenticating on a miss
    ///
    /// # Errors
    ///
    /// See [`IdentityClient::authenticate`].
    pub fn user_info(&mut self, token: Option<&str>) -> Result<&Value> {
        let key = token
            .filter(|token| !token.is_empty())
            .unwrap_or_else(|| self.client.token())
            .to_string();
        if self.cache.contains_key(&key) {
            return Ok(&self.cache[&key]);
        }
        self.authenticate(Some(&key))
    }

    /// One field of the user info for `token`
    ///
    /// Returns `None` if the service did not report that field.
    ///
    /// # Errors
    ///
    /// See [`IdentityClient::authenticate`].
    pub fn term(&mut self, key: &str, token: Option<&str>) -> Result<Option<Value>> {
        Ok(self.user_info(token)?.get(key).cloned())
    }

    /// Every cached user info entry
    pub fn list(&self) -> Vec<&Value> {
        self.cache.values().collect()
    }
}
