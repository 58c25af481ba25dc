//! Credential section of the config file

use serde::{Deserialize, Serialize};

/// Authentication configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Session token sent as `X-Auth-Token`
    #[serde(default)]
    pub token: String,
}

impl AuthConfig {
    /// Check if a token is configured
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        !self.token.trim().is_empty()
    }

    /// Token with everything but the last four characters masked
    #[must_use]
    pub fn masked_token(&self) -> String {
        let count = self.token.chars().count();
        if count <= 4 {
            return "*".repeat(count);
        }
        let tail: String = self.token.chars().skip(count - 4).collect();
        format!("{}{tail}", "*".repeat(count - 4))
    }

    /// Clear authentication data
    pub fn clear(&mut self) {
        self.token.clear();
    }
}
