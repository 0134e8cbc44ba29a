//! termgate
//!
//! Command-line client for a termgate backend: interactive shells, file
//! commands, uploads and resource monitoring over one connection.

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use gateway::config::{default_config_path, Config};
use gateway::logging::init_logging;
use gateway::{Gateway, GatewayEvent, Geometry, Session, WebSocketTransport};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};

/// Byte that detaches from an interactive shell (Ctrl-]).
const DETACH_BYTE: u8 = 0x1d;

/// How often the local terminal size is polled during a shell.
const RESIZE_POLL: Duration = Duration::from_millis(250);

/// termgate - terminal sessions and file access through a gateway backend.
#[derive(Parser, Debug)]
#[command(name = "termgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Backend URL (overrides the configuration)
    #[arg(long, global = true, value_name = "URL")]
    pub url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Open an interactive shell (Ctrl-] detaches)
    Shell {
        /// Server to connect to
        server: String,
    },

    /// List a remote directory
    Ls {
        server: String,
        #[arg(default_value = ".")]
        path: String,
    },

    /// Print a remote text file
    Cat { server: String, path: String },

    /// Download a remote file
    Get {
        server: String,
        remote: String,
        /// Local destination (defaults to stdout)
        local: Option<PathBuf>,
    },

    /// Upload a local file
    Put {
        server: String,
        local: PathBuf,
        remote: String,
    },

    /// Delete a remote file
    Rm { server: String, path: String },

    /// Rename or move a remote path
    Mv {
        server: String,
        from: String,
        to: String,
    },

    /// Stream resource samples
    Monitor {
        server: String,
        /// Stop after this many samples
        #[arg(long, short = 'n', default_value = "10")]
        count: usize,
    },

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl Commands {
    fn server(&self) -> Option<&str> {
        match self {
            Commands::Shell { server }
            | Commands::Ls { server, .. }
            | Commands::Cat { server, .. }
            | Commands::Get { server, .. }
            | Commands::Put { server, .. }
            | Commands::Rm { server, .. }
            | Commands::Mv { server, .. }
            | Commands::Monitor { server, .. } => Some(server.as_str()),
            Commands::InitConfig { .. } => None,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    if let Commands::InitConfig { force } = cli.command {
        if config_path.exists() && !force {
            anyhow::bail!(
                "{} already exists (use --force to overwrite)",
                config_path.display()
            );
        }
        Config::default().save(&config_path)?;
        println!("Wrote {}", config_path.display());
        return Ok(());
    }

    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    if let Some(url) = &cli.url {
        config.transport.url = url.clone();
    }
    if cli.verbose {
        config.log.level = "debug".to_string();
    }
    config.validate()?;

    // Keep the shell's terminal clean unless logs go to a file.
    let interactive = matches!(cli.command, Commands::Shell { .. });
    let level = if interactive && config.log.file.is_none() && !cli.verbose {
        "warn"
    } else {
        config.log.level.as_str()
    };
    let _log_guard = init_logging(level, config.log.file.as_deref())?;

    let server = cli
        .command
        .server()
        .context("command needs a server")?
        .to_string();

    let transport = WebSocketTransport::connect(&config.transport.url, config.transport.compression)
        .await
        .with_context(|| format!("connecting to {}", config.transport.url))?;
    let gateway = Gateway::new(transport, config.gateway_options());

    let geometry = crossterm::terminal::size()
        .ok()
        .filter(|_| interactive)
        .map(|(cols, rows)| Geometry::new(cols, rows));
    let session = gateway.open(&server, geometry).await?;
    let result = match session.wait_ready().await {
        Ok(()) => run_command(&gateway, &session, cli.command).await,
        Err(e) => Err(e.into()),
    };

    gateway.shutdown().await;
    result
}

async fn run_command(gateway: &Gateway, session: &Session, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Shell { .. } => run_shell(session).await,
        Commands::Ls { path, .. } => {
            let mut entries = session.list(&path).await?;
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            for entry in entries {
                let suffix = if entry.is_directory { "/" } else { "" };
                println!(
                    "{:<11} {:>12}  {}{}",
                    entry.permissions, entry.size_bytes, entry.name, suffix
                );
            }
            Ok(())
        }
        Commands::Cat { path, .. } => {
            let text = session.read(&path).await?;
            print!("{text}");
            Ok(())
        }
        Commands::Get { remote, local, .. } => {
            let bytes = session.download(&remote).await?;
            match local {
                Some(local) => {
                    tokio::fs::write(&local, &bytes)
                        .await
                        .with_context(|| format!("writing {}", local.display()))?;
                    eprintln!("{} -> {} ({} bytes)", remote, local.display(), bytes.len());
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&bytes).await?;
                    stdout.flush().await?;
                }
            }
            Ok(())
        }
        Commands::Put { local, remote, .. } => {
            let progress = spawn_progress(gateway.subscribe(), remote.clone());
            let outcome = session.upload_file(&local, &remote).await;
            progress.abort();
            eprintln!();
            let outcome = outcome?;
            println!(
                "{} -> {} ({} bytes in {} chunks, sha256 {})",
                local.display(),
                outcome.path,
                outcome.bytes,
                outcome.chunks,
                hex::encode(&outcome.checksum)
            );
            Ok(())
        }
        Commands::Rm { path, .. } => {
            session.delete(&path).await?;
            println!("removed {path}");
            Ok(())
        }
        Commands::Mv { from, to, .. } => {
            session.rename(&from, &to).await?;
            println!("{from} -> {to}");
            Ok(())
        }
        Commands::Monitor { count, .. } => run_monitor(gateway, session, count).await,
        Commands::InitConfig { .. } => Ok(()),
    }
}

/// Print upload progress for `path` to stderr until aborted.
fn spawn_progress(
    mut events: broadcast::Receiver<GatewayEvent>,
    path: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(GatewayEvent::UploadProgress {
                    path: p,
                    bytes_acknowledged,
                    total_bytes,
                    ..
                }) if p == path => {
                    let pct = if total_bytes == 0 {
                        100
                    } else {
                        bytes_acknowledged * 100 / total_bytes
                    };
                    eprint!("\r{path}: {pct:>3}% ({bytes_acknowledged}/{total_bytes})");
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn run_monitor(gateway: &Gateway, session: &Session, count: usize) -> anyhow::Result<()> {
    let mut events = gateway.subscribe();
    session.start_monitoring().await?;

    let mut seen = 0;
    while seen < count {
        match events.recv().await {
            Ok(GatewayEvent::Sample { session_id, sample }) if session_id == session.id() => {
                seen += 1;
                println!(
                    "cpu {:>5.1}%  mem {}/{} MiB  disk {:>5.1}%  net up {} B/s down {} B/s",
                    sample.cpu_percent,
                    sample.mem_used_kb / 1024,
                    sample.mem_total_kb / 1024,
                    sample.disk_percent,
                    sample.net_up_bytes_per_sec,
                    sample.net_down_bytes_per_sec
                );
            }
            Ok(GatewayEvent::StateChanged { session_id, state })
                if session_id == session.id() && state.is_closed() =>
            {
                anyhow::bail!("session closed while monitoring");
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    session.stop_monitoring().await?;
    Ok(())
}

/// Restores cooked mode when dropped.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> anyhow::Result<Self> {
        crossterm::terminal::enable_raw_mode().context("enabling raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

async fn run_shell(session: &Session) -> anyhow::Result<()> {
    let raw = RawModeGuard::enable()?;
    let mut output = session.output();
    let mut states = session.state_changes();

    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::task::spawn_blocking(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if input_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    let mut size = crossterm::terminal::size().ok();
    let mut ticker = tokio::time::interval(RESIZE_POLL);

    loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Ok(bytes) => {
                    stdout.write_all(&bytes).await?;
                    stdout.flush().await?;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "terminal output lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            input = input_rx.recv() => match input {
                Some(bytes) if bytes.contains(&DETACH_BYTE) => break,
                Some(bytes) => session.send_data(bytes).await?,
                None => break,
            },
            _ = ticker.tick() => {
                let current = crossterm::terminal::size().ok();
                if current != size {
                    if let Some((cols, rows)) = current {
                        session.resize(cols, rows).await?;
                    }
                    size = current;
                }
            }
            changed = states.changed() => {
                if changed.is_err() || states.borrow().is_closed() {
                    break;
                }
            }
        }
    }

    drop(raw);
    eprintln!("\r\n[termgate: {} {}]", session.id(), session.state());
    Ok(())
}
