//! Nimbus CLI - command-line client for Nimbus cloud services
//!
//! Thin dispatcher over the `nimbus_cli` HTTP engine.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use nimbus_cli::cli::{self, Cli, Commands, ConfigAction};
use nimbus_cli::client::{Client, Method, RequestOptions};
use nimbus_cli::identity::IdentityClient;
use nimbus_cli::{logging, ClientError, Config};

fn main() {
    let exit_code = run();
    std::process::exit(exit_code);
}

/// Main application entry point
fn run() -> i32 {
    let cli = Cli::parse_args();

    match execute(cli) {
        Ok(()) => 0,
        Err(err) => report(&err),
    }
}

/// Print `err` and pick the exit code
fn report(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ClientError>() {
        Some(client_error) => {
            eprintln!("{} {}", style("Error:").red().bold(), client_error.message().trim_end());
            for detail in client_error.details() {
                eprintln!("  {detail}");
            }
            client_error.exit_code()
        }
        None => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            1
        }
    }
}

/// Execute the requested command
fn execute(cli: Cli) -> Result<()> {
    let config_path = match &cli.config_file {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };
    let mut config = Config::load_or_default(Some(config_path.as_path()))?;
    config.apply_env();
    if let Some(url) = &cli.url {
        config.url.clone_from(url);
    }
    if let Some(token) = &cli.token {
        config.auth.token.clone_from(token);
    }

    logging::init(cli.verbose, config.log_file.as_deref());
    tracing::debug!(target: "nimbus::client", "Nimbus CLI v{}", nimbus_cli::VERSION);

    match cli.command {
        Commands::Request {
            method,
            path,
            headers,
            params,
            data,
            json,
            success,
            unchecked,
            include,
        } => {
            let options =
                cli::request_options(headers, params, data, json.as_deref(), success, unchecked)?;
            handle_request(&config, method, &path, options, include)
        }
        Commands::Whoami => handle_whoami(&config),
        Commands::Config { action } => handle_config(config, &config_path, action),
    }
}

/// Build an engine client from the effective config
fn connect(config: &Config) -> Result<Client> {
    config.validate()?;
    if !config.auth.is_authenticated() {
        anyhow::bail!("No token configured. Run 'nimbus config set-token' or set NIMBUS_TOKEN");
    }
    Ok(Client::with_settings(
        config.url.as_str(),
        config.auth.token.as_str(),
        config.client_settings(),
    )?)
}

/// Handle request command
fn handle_request(
    config: &Config,
    method: Method,
    path: &str,
    options: RequestOptions,
    include: bool,
) -> Result<()> {
    let mut client = connect(config)?;
    let response = client.request(method, path, options)?;

    let code = response.status_code()?;
    let status = format!("{code} {}", response.status()?);
    if code < 400 {
        println!("{}", style(status).green());
    } else {
        println!("{}", style(status).red());
    }
    if include {
        for (name, value) in response.headers()? {
            println!("{}: {value}", style(name).dim());
        }
    }
    let body = response.text()?;
    if !body.is_empty() {
        println!("{body}");
    }
    Ok(())
}

/// Handle whoami command
fn handle_whoami(config: &Config) -> Result<()> {
    let mut identity = IdentityClient::new(connect(config)?);
    let info = identity.authenticate(None)?;
    println!("{}", serde_json::to_string_pretty(info)?);
    Ok(())
}

/// Handle config subcommands
fn handle_config(config: Config, path: &Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let mut shown = config;
            shown.auth.token = shown.auth.masked_token();
            println!("{}", style(format!("# {}", path.display())).dim());
            print!("{}", toml::to_string_pretty(&shown)?);
            Ok(())
        }
        ConfigAction::SetToken { value } => update_config(path, |stored| stored.auth.token = value),
        ConfigAction::SetUrl { value } => update_config(path, |stored| stored.url = value),
    }
}

/// Apply `change` to the stored config (not the env/flag-merged one) and save it
fn update_config(path: &Path, change: impl FnOnce(&mut Config)) -> Result<()> {
    let mut stored = Config::load_or_default(Some(path))?;
    change(&mut stored);
    stored.validate()?;
    stored
        .save_to(path)
        .with_context(|| format!("saving {}", path.display()))?;
    println!("{} Saved {}", style("✓").green(), path.display());
    Ok(())
}
