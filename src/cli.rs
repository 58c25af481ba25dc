//! Command-line interface argument parsing
//!
//! Defines all CLI commands and their arguments using Clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::client::{Method, RequestOptions, Success};
use crate::error::{ClientError, Result};

/// Nimbus CLI - command-line client for Nimbus cloud services
#[derive(Parser, Debug)]
#[command(name = "nimbus")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Command-line client for Nimbus cloud services")]
#[command(long_about = concat!(
    "Nimbus CLI (v", env!("CARGO_PKG_VERSION"), ")\n",
    "Command-line client for Nimbus cloud services.\n\n",
    "Use 'request' for raw calls through the HTTP engine, 'whoami' to check\n",
    "the configured token, and 'config' to manage the service URL and token."
))]
pub struct Cli {
    /// Increase log verbosity (-v wire logs, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Service base URL (overrides config and NIMBUS_URL)
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// Session token (overrides config and NIMBUS_TOKEN)
    #[arg(long, global = true)]
    pub token: Option<String>,

    /// Config file to use instead of ~/.config/nimbus/config.toml
    #[arg(long = "config", global = true)]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Issue a raw request through the HTTP engine
    ///
    /// Examples:
    ///   nimbus request GET /servers
    ///   nimbus request GET /container -p format=json -p shared
    ///   nimbus request POST /servers --json '{"server": {"name": "vm"}}' --success 202
    ///   nimbus request COPY /c/o -H Destination:/c/o2 --success 201
    #[command(display_order = 1)]
    Request {
        /// HTTP method (GET, POST, PUT, HEAD, DELETE, COPY, MOVE)
        #[arg(value_parser = parse_method)]
        method: Method,

        /// Path relative to the service URL
        path: String,

        /// Extra header, as name:value
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Query parameter, as key=value or a bare key
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, Option<String>)>,

        /// Raw request body
        #[arg(long, conflicts_with = "json")]
        data: Option<String>,

        /// JSON request body
        #[arg(long)]
        json: Option<String>,

        /// Expected status code (repeatable, default 200)
        #[arg(long = "success")]
        success: Vec<u16>,

        /// Accept any status
        #[arg(long, conflicts_with = "success")]
        unchecked: bool,

        /// Print response headers
        #[arg(short, long)]
        include: bool,
    },

    /// Show the user the configured token belongs to
    ///
    /// Examples:
    ///   nimbus whoami
    #[command(display_order = 2)]
    Whoami,

    /// Manage the config file
    #[command(display_order = 3)]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// `config` subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration (token masked)
    Show,

    /// Save the session token
    SetToken {
        /// Token value
        #[arg(value_name = "TOKEN")]
        value: String,
    },

    /// Save the service base URL
    SetUrl {
        /// Base URL
        #[arg(value_name = "URL")]
        value: String,
    },
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        <Self as Parser>::parse()
    }
}

/// Parse an HTTP method name
///
/// # Errors
///
/// Returns an error for methods the engine does not support.
pub fn parse_method(value: &str) -> Result<Method> {
    value.parse()
}

/// Parse `name:value` into a header pair
///
/// # Errors
///
/// Returns an error if there is no `:` or the name is empty.
pub fn parse_header(value: &str) -> Result<(String, String)> {
    match value.split_once(':') {
        Some((name, header)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), header.trim().to_string()))
        }
        _ => Err(ClientError::new(format!("Invalid header {value}, expected name:value"))),
    }
}

/// Parse `key=value` or `key` into a query parameter
///
/// # Errors
///
/// Returns an error if the key is empty.
pub fn parse_param(value: &str) -> Result<(String, Option<String>)> {
    let (key, param) = match value.split_once('=') {
        Some((key, param)) => (key, Some(param.to_string())),
        None => (value, None),
    };
    if key.is_empty() {
        return Err(ClientError::new(format!("Invalid parameter {value}, expected key[=value]")));
    }
    Ok((key.to_string(), param))
}

/// Build engine options from `request` arguments
///
/// # Errors
///
/// Returns an error if `json` is not valid JSON.
pub fn request_options(
    headers: Vec<(String, String)>,
    params: Vec<(String, Option<String>)>,
    data: Option<String>,
    json: Option<&str>,
    success: Vec<u16>,
    unchecked: bool,
) -> Result<RequestOptions> {
    let mut options = RequestOptions::new();
    for (name, value) in headers {
        options = options.header(name, value);
    }
    for (key, value) in params {
        options = match value {
            Some(value) => options.param(key, value),
            None => options.flag(key),
        };
    }
    if let Some(json) = json {
        options = options.json(serde_json::from_str(json)?);
    } else if let Some(data) = data {
        options = options.data(data);
    }
    options = if unchecked {
        options.unchecked()
    } else if success.is_empty() {
        options.success(Success::default())
    } else {
        options.success(success)
    };
    Ok(options)
}
