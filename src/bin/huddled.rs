use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use huddle::server::{Server, ServerConfig};

const DEFAULT_CONFIG_PATH: &str = "huddled.toml";

/// Exit code for a fatal listener bind failure.
const EXIT_BIND_FAILURE: u8 = 1;
/// Exit code for an unrecoverable internal error.
const EXIT_INTERNAL_ERROR: u8 = 2;

#[derive(Parser)]
#[command(name = "huddled", version, about = "Conferencing server daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the server using a TOML configuration file.
    Serve {
        /// Path to the configuration file; built-in defaults apply when the
        /// file does not exist.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Inspect or initialize the server configuration.
    Config {
        /// Path to the configuration file.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,
        /// Write a config populated with the defaults.
        #[arg(long)]
        init: bool,
        /// Overwrite an existing config when used with --init.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(&config).await,
        Command::Config { path, init, force } => {
            let result = if init {
                init_config(&path, force)
            } else {
                show_config(&path)
            };
            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    eprintln!("{err}");
                    ExitCode::from(EXIT_INTERNAL_ERROR)
                }
            }
        }
    }
}

async fn serve(config_path: &Path) -> ExitCode {
    init_tracing();
    let cfg = match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!(config = %config_path.display(), error = %err, "invalid configuration");
            return ExitCode::from(EXIT_INTERNAL_ERROR);
        }
    };
    tracing::info!(
        config = %config_path.display(),
        host = %cfg.host,
        tcp_port = cfg.tcp_port,
        udp_port = cfg.udp_port,
        "starting huddled"
    );

    let bound = match Server::new(cfg).bind().await {
        Ok(bound) => bound,
        Err(err) => {
            tracing::error!(error = %err, "failed to bind listeners");
            return ExitCode::from(EXIT_BIND_FAILURE);
        }
    };

    let mut handle = tokio::spawn(async move { bound.run().await });

    tokio::select! {
        result = &mut handle => {
            match result {
                Ok(Ok(())) => ExitCode::SUCCESS,
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "server failed");
                    ExitCode::from(EXIT_INTERNAL_ERROR)
                }
                Err(err) => {
                    tracing::error!(error = %err, "server task panicked");
                    ExitCode::from(EXIT_INTERNAL_ERROR)
                }
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown requested");
            handle.abort();
            ExitCode::SUCCESS
        }
    }
}

fn load_config(path: &Path) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        Ok(ServerConfig::from_toml_str(&contents)?)
    } else {
        Ok(ServerConfig::default())
    }
}

fn show_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Config path: {}", path.display());
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        println!("{contents}");
    } else {
        println!("Config file not found. Use `huddled config --init` to create one.");
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() && !force {
        return Err(format!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        )
        .into());
    }
    let toml = toml::to_string_pretty(&ServerConfig::default())?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, toml)?;
    println!("Wrote config to {}", path.display());
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
