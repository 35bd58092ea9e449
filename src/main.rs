//! web2ssh CLI - serves the browser terminal bridge and manages its
//! settings and saved hosts.
//!
//! This is the main binary entry point. See the `web2ssh` library for the
//! core functionality.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use web2ssh::constants::{DEFAULT_BIND_ADDR, DEFAULT_LISTEN_PORT, DEFAULT_SSH_PORT, WS_PATH};
use web2ssh::{BridgeServer, Profile, ProfileStore, ServerConfig, SettingsStore, SshConnector};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "web2ssh")]
#[command(version)]
#[command(about = "Browser terminal bridge to remote SSH shells")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the browser terminal, its API and the WebSocket bridge
    Serve {
        /// Address to bind
        #[arg(long, default_value = DEFAULT_BIND_ADDR)]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = DEFAULT_LISTEN_PORT)]
        port: u16,
    },
    /// Show or change settings (e.g. "ssh.keepAliveInterval 60")
    Settings {
        key: Option<String>,
        value: Option<String>,
    },
    /// Manage saved connection profiles
    Sessions {
        #[command(subcommand)]
        action: SessionsCommand,
    },
}

#[derive(Subcommand)]
enum SessionsCommand {
    /// List saved profiles
    List,
    /// Save a new profile
    Add {
        /// Display name
        name: String,
        /// Remote host
        host: String,
        /// Login user
        user: String,
        #[arg(long, default_value_t = DEFAULT_SSH_PORT)]
        port: u16,
        #[arg(long)]
        auth_type: Option<String>,
        #[arg(long)]
        key_path: Option<String>,
    },
    /// Delete a profile by id
    Remove { id: String },
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    if let Ok(path) = std::env::var("WEB2SSH_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.format_timestamp_secs().init();
    Ok(())
}

fn serve(bind: String, port: u16) -> Result<()> {
    let config = ServerConfig {
        bind_addr: bind,
        port,
        ws_path: WS_PATH.to_string(),
    };
    let settings = Arc::new(SettingsStore::open_default()?);
    let profiles = Arc::new(ProfileStore::open_default()?);
    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;

    runtime.block_on(async {
        let server =
            BridgeServer::start(config, Arc::new(SshConnector::new()), settings, profiles).await?;
        println!(
            "web2ssh v{} listening on http://{} (WebSocket at {})",
            env!("CARGO_PKG_VERSION"),
            server.local_addr(),
            WS_PATH
        );

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;

        println!("Shutting down...");
        server.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
}

fn settings_command(key: Option<String>, value: Option<String>) -> Result<()> {
    let store = SettingsStore::open_default()?;
    let mut settings = store.load()?;

    match (key, value) {
        (None, _) => println!("{}", serde_json::to_string_pretty(&settings)?),
        (Some(key), None) => println!("{}", settings.get_key(&key)?),
        (Some(key), Some(value)) => {
            settings.set_key(&key, &value)?;
            settings.validate()?;
            store.save(&settings)?;
            println!("{key} = {}", settings.get_key(&key)?);
        }
    }
    Ok(())
}

fn sessions_command(action: SessionsCommand) -> Result<()> {
    let store = ProfileStore::open_default()?;

    match action {
        SessionsCommand::List => {
            let profiles = store.list()?;
            if profiles.is_empty() {
                println!("No saved sessions.");
            }
            for p in profiles {
                println!("{}  {}  {}@{}:{}", p.id, p.name, p.user, p.host, p.port);
            }
        }
        SessionsCommand::Add {
            name,
            host,
            user,
            port,
            auth_type,
            key_path,
        } => {
            let saved = store.add(Profile {
                id: String::new(),
                name,
                host,
                port,
                user,
                auth_type,
                key_path,
            })?;
            println!("Saved session {}", saved.id);
        }
        SessionsCommand::Remove { id } => {
            store.remove(&id)?;
            println!("Removed session {id}");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, port } => serve(bind, port)?,
        Commands::Settings { key, value } => settings_command(key, value)?,
        Commands::Sessions { action } => sessions_command(action)?,
    }

    Ok(())
}
