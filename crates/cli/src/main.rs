// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 OpenVPN Manager Contributors

// OpenVPN Manager - CLI Client
// Command-line front end for the connection controller

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use dialoguer::{Confirm, Input, Password};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use openvpn_manager_common::{
    delete_config, discover_configs, find_config, import_config, user_configs_dir,
    ConnectionState, ControllerEvent, Credentials, OutputStream, VpnConfig,
};
use openvpn_manager_controller::{
    ConnectRequest, ConnectionController, ControllerConfig, ControllerError, CredentialStore,
    DeleteOutcome, KeyringStore, PermissionVerifier,
};

const DEFAULT_LOG_FILTER: &str = "openvpn_manager_controller=info,ovpn_manager=info";

#[derive(Parser)]
#[command(name = "ovpn-manager")]
#[command(about = "OpenVPN Manager CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Controller configuration file (default: ~/.config/openvpn-manager/controller.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available VPN configurations
    List {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Copy an .ovpn/.conf file into the user configuration directory
    Import {
        /// Path to the configuration file
        file: String,
    },

    /// Delete an imported configuration and its saved credentials
    Delete {
        /// Configuration id (file name without extension)
        id: String,

        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Check that the helper script can run without a sudo password
    Check,

    /// Connect and stay in the foreground until Ctrl+C
    Connect {
        /// Configuration id
        id: String,

        /// Username; the password is then asked before connecting
        #[arg(short, long)]
        username: Option<String>,

        /// Save the credentials in the system keyring once connected
        #[arg(short, long)]
        save: bool,

        /// Print the VPN client output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Remove saved credentials for a configuration
    Forget {
        /// Configuration id
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::List { json } => list_configs(&config, json)?,
        Commands::Import { file } => import(&file)?,
        Commands::Delete { id, yes } => delete(&config, &id, yes).await?,
        Commands::Check => check(&config).await?,
        Commands::Connect {
            id,
            username,
            save,
            verbose,
        } => connect(config, &id, username, save, verbose).await?,
        Commands::Forget { id } => forget(config, &id).await?,
    }

    Ok(())
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

fn load_config(path: Option<&str>) -> Result<ControllerConfig> {
    match path {
        Some(path) => ControllerConfig::load_from(&expand_path(path)),
        None => ControllerConfig::load(),
    }
}

fn keyring() -> Arc<dyn CredentialStore> {
    Arc::new(KeyringStore::default())
}

fn list_configs(config: &ControllerConfig, json: bool) -> Result<()> {
    let configs = discover_configs(&config.config_dirs)?;

    if configs.is_empty() {
        println!("{}", "No VPN configurations found.".yellow());
        println!("Import one with: {}", "ovpn-manager import <file.ovpn>".cyan());
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&configs)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Id").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("File").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Location").add_attribute(Attribute::Bold).fg(Color::Cyan),
    ]);

    for vpn in &configs {
        let location = vpn
            .path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(&vpn.id).fg(Color::Green),
            Cell::new(&vpn.name),
            Cell::new(location).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{}", table);
    println!();
    println!("{} configuration(s) found", configs.len().to_string().cyan());
    println!();
    Ok(())
}

fn import(file: &str) -> Result<()> {
    let source = expand_path(file);
    let user_dir = user_configs_dir()?;
    let vpn = import_config(&source, &user_dir)
        .with_context(|| format!("Failed to import {}", source.display()))?;

    println!("{}", format!("✓ Imported '{}'", vpn.id).green().bold());
    println!("  Stored at: {}", vpn.path.display().to_string().dimmed());
    Ok(())
}

async fn delete(config: &ControllerConfig, id: &str, yes: bool) -> Result<()> {
    let vpn = find_config(&config.config_dirs, id)?;

    if !yes {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "Delete configuration '{}'? Saved credentials are removed too",
                vpn.name.yellow()
            ))
            .default(false)
            .interact()?;
        if !confirm {
            println!("{}", "Deletion cancelled".dimmed());
            return Ok(());
        }
    }

    delete_config(&vpn, &user_configs_dir()?)?;
    if let Err(e) = keyring().delete(&vpn.id).await {
        warn!("Saved credentials were not removed: {}", e);
    }

    println!("{}", format!("Configuration '{}' deleted", vpn.id).green());
    Ok(())
}

async fn check(config: &ControllerConfig) -> Result<()> {
    let report = PermissionVerifier::from_config(config)
        .check(&config.helper_path)
        .await;

    if report.ok {
        println!(
            "{}",
            format!("✓ {} can be run without a password", report.helper_path)
                .green()
                .bold()
        );
        return Ok(());
    }

    println!("{}", "✗ Passwordless sudo is not configured".red().bold());
    println!();
    println!("{}", report.remediation_text);
    anyhow::bail!("Permission check failed for {}", report.helper_path)
}

async fn forget(config: ControllerConfig, id: &str) -> Result<()> {
    let controller = ConnectionController::new(config, keyring())?;
    match controller.forget_credentials(id).await? {
        DeleteOutcome::Deleted => {
            println!("{}", format!("✓ Removed credentials for '{}'", id).green())
        }
        DeleteOutcome::NotFound => {
            println!("{}", format!("No saved credentials for '{}'", id).dimmed())
        }
    }
    Ok(())
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner:.cyan} {msg}")?);
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    Ok(bar)
}

/// Ask for whatever part of the credentials is missing
async fn prompt_credentials(config_id: String, username: Option<String>) -> Result<Credentials> {
    tokio::task::spawn_blocking(move || -> Result<Credentials> {
        let username = match username {
            Some(username) => username,
            None => Input::<String>::new()
                .with_prompt("Username")
                .interact_text()
                .context("Failed to read username")?,
        };
        let password = Password::new()
            .with_prompt("Password")
            .interact()
            .context("Failed to read password")?;
        Ok(Credentials::new(config_id, username, password))
    })
    .await
    .context("Credential prompt was interrupted")?
}

async fn connect(
    config: ControllerConfig,
    id: &str,
    username: Option<String>,
    save: bool,
    verbose: bool,
) -> Result<()> {
    let vpn: VpnConfig = find_config(&config.config_dirs, id)?;
    let controller = ConnectionController::new(config, keyring())?;

    let mut request = ConnectRequest::new(vpn.clone());
    if let Some(username) = username.clone() {
        let credentials = prompt_credentials(vpn.id.clone(), Some(username)).await?;
        request = request.with_credentials(credentials, save);
    }

    println!("{}", format!("Connecting with '{}'", vpn.name).green().bold());

    let mut events = controller.subscribe();
    let mut logs = controller.subscribe_logs();
    let mut logs_open = verbose;
    let session = match controller.connect(request).await {
        Ok(session) => session,
        Err(ControllerError::PermissionDenied { remediation }) => {
            println!("{}", remediation.yellow());
            anyhow::bail!("The helper script cannot be run without a sudo password");
        }
        Err(e) => return Err(e.into()),
    };

    let mut progress = Some(spinner("Starting OpenVPN...")?);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let final_state = loop {
        let event = tokio::select! {
            _ = &mut ctrl_c => {
                if let Some(bar) = progress.take() {
                    bar.finish_and_clear();
                }
                println!("{}", "Disconnecting...".yellow());
                match controller.disconnect().await {
                    Ok(()) => {}
                    Err(ControllerError::StopTimeout) => {
                        println!("{}", "OpenVPN did not stop in time and was killed".yellow());
                    }
                    Err(e) => return Err(e.into()),
                }
                break ConnectionState::Disconnected;
            }
            event = events.recv() => match event {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    warn!("Missed {} controller events, re-reading the session state", n);
                    match controller.status() {
                        Some(snapshot) if snapshot.session_id == session.session_id => {
                            if snapshot.state.is_terminal() {
                                break snapshot.state;
                            }
                            if let Some(bar) = &progress {
                                bar.set_message(format!("{}...", snapshot.state));
                            }
                            continue;
                        }
                        // Session already gone
                        _ => break controller
                            .last_outcome()
                            .filter(|outcome| outcome.session_id == session.session_id)
                            .map(|outcome| outcome.state)
                            .unwrap_or(ConnectionState::Disconnected),
                    }
                }
                Err(RecvError::Closed) => break ConnectionState::Disconnected,
            },
            line = logs.recv(), if logs_open => {
                match line {
                    Ok(line) if line.session_id == session.session_id => {
                        let text = match line.stream {
                            OutputStream::Stdout => line.line.normal(),
                            OutputStream::Stderr => line.line.yellow(),
                        };
                        match &progress {
                            Some(bar) => bar.println(text.to_string()),
                            None => println!("{}", text),
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => debug!("Skipped {} VPN client log lines", n),
                    Err(RecvError::Closed) => logs_open = false,
                }
                continue;
            }
        };

        if event.session_id().is_some_and(|sid| sid != session.session_id) {
            continue;
        }

        match event {
            ControllerEvent::StateChanged { state, .. } => {
                if let Some(bar) = &progress {
                    bar.set_message(format!("{}...", state));
                }
                if state.is_terminal() {
                    break state;
                }
            }
            ControllerEvent::CredentialsRequired { config_id, .. } => {
                if let Some(bar) = progress.take() {
                    bar.finish_and_clear();
                }
                println!("{}", format!("Credentials required for '{}'", config_id).bold());
                let credentials = prompt_credentials(config_id, username.clone()).await?;
                if let Err(e) = controller.provide_credentials(credentials, save).await {
                    eprintln!("{}", format!("Could not submit credentials: {}", e).red());
                }
                progress = Some(spinner("Authenticating...")?);
            }
            ControllerEvent::Connected {
                interface, address, ..
            } => {
                if let Some(bar) = progress.take() {
                    bar.finish_and_clear();
                }
                println!();
                println!(
                    "{}",
                    format!(
                        "✓ Connected! Interface {} with address {}",
                        interface.as_deref().unwrap_or("?"),
                        address.as_deref().unwrap_or("?")
                    )
                    .green()
                    .bold()
                );
                println!();
                println!("{}", "VPN is running. Press Ctrl+C to disconnect".dimmed());
            }
            ControllerEvent::Error { kind, message, .. } => {
                let text = format!("Error ({}): {}", kind, message).red();
                match &progress {
                    Some(bar) => bar.println(text.to_string()),
                    None => eprintln!("{}", text),
                }
            }
            _ => {}
        }
    };

    if let Some(bar) = progress.take() {
        bar.finish_and_clear();
    }

    match final_state {
        ConnectionState::Failed(kind) => anyhow::bail!("Connection failed: {}", kind),
        _ => {
            println!("{}", "✓ Disconnected".green().bold());
            Ok(())
        }
    }
}
