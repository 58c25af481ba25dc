#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

//! ## Architecture
//!
//! - **[`error`]** - `ClientError`, the single engine error type
//! - **[`client`]** - `Client`, `RequestSpec`, `LazyResponse` and the connection pool
//! - **[`parallel`]** - `AsyncTask` and the adaptive `ThreadLimit`
//! - **[`identity`]** - identity service wrapper
//! - **[`config`]** - configuration management and credential storage
//! - **[`logging`]** - tracing subscriber bootstrap
//! - **[`cli`]** - command-line argument parsing

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod logging;
pub mod parallel;

/// Error type alias for convenience
pub use error::{ClientError, ConfigError, Result};

/// Configuration type alias for convenience
pub use config::Config;

pub use client::{Client, ClientSettings, LazyResponse, Method, RequestOptions, RequestSpec, Success};
pub use parallel::{AsyncTask, ThreadLimit};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = "nimbus";
