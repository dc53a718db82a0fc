//! Termhub daemon and command-line client.
//!
//! `termhub start` serves sessions; every other command talks to a running
//! daemon over its control socket or streaming endpoint.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::client::{ClientEvent, ClientState, IpcSessionDirectory, ReconnectPolicy, StreamClient};
use daemon::config::Config;
use daemon::ipc::{get_daemon_pid, get_socket_path, IpcClient, IpcResponse, DEFAULT_READ_BYTES};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use protocol::{ClientMessage, ServerMessage, SessionSummary};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Byte that detaches an interactive attach (Ctrl-]).
const DETACH_BYTE: u8 = 0x1d;

/// Termhub - multiplexed, reconnectable terminal sessions.
#[derive(Parser, Debug)]
#[command(name = "termhub")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the daemon in the foreground
    Start,

    /// Stop the running daemon
    Stop {
        /// Seconds to wait for the daemon to exit
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Attach this terminal to a session
    Attach {
        /// Session ID to attach to
        session_id: String,

        /// Streaming endpoint base URL (defaults to the configured bind address)
        #[arg(long, value_name = "WS_URL")]
        url: Option<String>,
    },
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List live sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Create a session
    Create {
        /// Shell command to run instead of the default shell
        #[arg(long)]
        shell: Option<String>,
    },

    /// Close a session
    Close {
        /// Session ID to close
        session_id: String,
    },

    /// Write input to a session
    Write {
        /// Session ID to write to
        session_id: String,

        /// Text to send; escapes are not interpreted
        data: String,
    },

    /// Drain buffered output from a session
    Read {
        /// Session ID to read from
        session_id: String,

        /// Maximum bytes to return
        #[arg(long, default_value_t = DEFAULT_READ_BYTES)]
        max_bytes: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    let interactive = matches!(cli.command, Commands::Attach { .. });
    let _log_guard = init_logging(&config, cli.verbose, interactive)?;

    if let Some(path) = &cli.config {
        tracing::debug!("Using config file: {:?}", path);
    }

    match cli.command {
        Commands::Start => {
            let pid_path = config.pid_file_path();
            if let Some(pid) = get_daemon_pid(&pid_path) {
                eprintln!("Error: Daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  termhub stop");
                std::process::exit(1);
            }

            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_foreground(&mut orchestrator).await?;
        }
        Commands::Stop { timeout } => {
            graceful_stop_daemon(&config, timeout).await?;
            println!("Daemon stopped successfully");
        }
        Commands::Status => {
            let mut client = connect().await?;
            let health = client.health().await?;
            let pid = get_daemon_pid(&config.pid_file_path());

            println!("Daemon Status: {}", health.status);
            if let Some(pid) = pid {
                println!("  PID:      {}", pid);
            }
            println!("  Version:  {}", health.version);
            println!("  Uptime:   {}", format_duration(health.uptime_seconds));
            println!("  Sessions: {}", health.active_session_count);
        }
        Commands::Sessions(cmd) => run_sessions_command(cmd).await?,
        Commands::Attach { session_id, url } => {
            let server = url.unwrap_or_else(|| format!("ws://{}", config.server.bind_addr));
            run_attach(&config, &server, session_id).await?;
        }
    }

    Ok(())
}

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over the configured level. With `daemon.log_file` set,
/// output goes to a daily-rotated file; the returned guard flushes it.
fn init_logging(
    config: &Config,
    verbose: bool,
    interactive: bool,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else if interactive {
        "warn"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.daemon.log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("log_file has no file name: {}", path.display()))?;
            std::fs::create_dir_all(&directory)
                .with_context(|| format!("Failed to create {}", directory.display()))?;

            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

async fn connect() -> anyhow::Result<IpcClient> {
    let socket_path = get_socket_path();
    IpcClient::connect(&socket_path)
        .await
        .with_context(|| format!("Daemon is not running (cannot connect to {:?})", socket_path))
}

async fn run_sessions_command(cmd: SessionsCommands) -> anyhow::Result<()> {
    let mut client = connect().await?;

    match cmd {
        SessionsCommands::List { json } => {
            let sessions = client.list_sessions().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions_table(&sessions);
            }
        }
        SessionsCommands::Create { shell } => {
            let session_id = client.create_session(shell).await?;
            println!("{}", session_id);
        }
        SessionsCommands::Close { session_id } => {
            client.close_session(&session_id).await?;
            println!("Session {} closed", session_id);
        }
        SessionsCommands::Write { session_id, data } => {
            let written = client.write_session(&session_id, &data).await?;
            tracing::debug!(bytes = written, "Wrote input");
        }
        SessionsCommands::Read {
            session_id,
            max_bytes,
        } => {
            let data = client.read_session(&session_id, Some(max_bytes)).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(data.as_bytes()).await?;
            stdout.flush().await?;
        }
    }

    Ok(())
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    let id_width = sessions.iter().map(|s| s.id.len()).max().unwrap_or(8).max(8);

    println!(
        "{:<id_width$}  {:<8}  {:>10}  {:>9}  SHELL",
        "ID",
        "STATE",
        "IDLE",
        "SIZE",
        id_width = id_width
    );
    println!("{}", "-".repeat(id_width + 42));

    for session in sessions {
        println!(
            "{:<id_width$}  {:<8}  {:>10}  {:>9}  {}",
            session.id,
            format!("{:?}", session.state).to_lowercase(),
            format_duration(session.idle_time),
            format!("{}x{}", session.cols, session.rows),
            truncate_str(&session.shell_command, 30),
            id_width = id_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Truncate a string to a maximum length in characters, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Gracefully stop the daemon via IPC.
///
/// Sends a stop request and waits for the daemon's pid file to go away.
async fn graceful_stop_daemon(config: &Config, timeout_secs: u64) -> anyhow::Result<()> {
    let mut client = connect().await?;

    println!("Sending shutdown request...");
    match client.stop().await.context("Failed to send stop request")? {
        IpcResponse::Stopping => {
            println!("Shutdown acknowledged, waiting for daemon to exit...");
        }
        other => anyhow::bail!("Unexpected response from daemon: {:?}", other),
    }

    let pid_path = config.pid_file_path();
    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if get_daemon_pid(&pid_path).is_none() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// Run the daemon until a signal or a stop request.
async fn run_foreground(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    if let Some(addr) = orchestrator.local_addr() {
        tracing::info!("Termhub daemon ready on ws://{}", addr);
    }

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::SessionCreated { session_id } => {
                    tracing::debug!("Session created: {}", session_id);
                }
                OrchestratorEvent::SessionClosed { session_id, reason } => {
                    tracing::debug!("Session closed: {} ({})", session_id, reason);
                }
            }
        }
    });

    let stop_requested = orchestrator.stop_requested();
    tokio::select! {
        result = wait_for_shutdown_signal() => result?,
        _ = stop_requested.cancelled() => {
            tracing::info!("Stop requested by client");
        }
    }

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Restores cooked mode when dropped.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> anyhow::Result<Self> {
        crossterm::terminal::enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

/// Attach the local terminal to a session until detach (Ctrl-]) or the
/// session ends.
async fn run_attach(config: &Config, server: &str, session_id: String) -> anyhow::Result<()> {
    let directory = Arc::new(IpcSessionDirectory::new(get_socket_path()));
    let mut client = StreamClient::new(
        server,
        session_id,
        ReconnectPolicy::from(&config.client),
        directory,
    )?;
    let cancel = client.cancel_token();

    let (input_tx, input_rx) = mpsc::channel(64);
    let (events_tx, events_rx) = mpsc::channel(256);

    let raw_mode = RawModeGuard::enable()?;

    if let Ok((cols, rows)) = crossterm::terminal::size() {
        let _ = input_tx.send(ClientMessage::Resize { rows, cols }).await;
    }

    let stdin_task = tokio::spawn(forward_stdin(input_tx.clone(), cancel.clone()));
    let resize_task = tokio::spawn(forward_resizes(input_tx));
    let printer = tokio::spawn(print_events(events_rx));

    let result = client.run(input_rx, events_tx).await;

    stdin_task.abort();
    resize_task.abort();
    let _ = printer.await;
    drop(raw_mode);

    match result {
        Ok(()) => {
            eprintln!("\n[termhub] detached");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn forward_stdin(input: mpsc::Sender<ClientMessage>, cancel: CancellationToken) {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];

    loop {
        let n = match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = &buf[..n];

        let (chunk, detach) = match chunk.iter().position(|&b| b == DETACH_BYTE) {
            Some(i) => (&chunk[..i], true),
            None => (chunk, false),
        };
        if !chunk.is_empty() {
            let data = String::from_utf8_lossy(chunk).into_owned();
            if input.send(ClientMessage::Input { data }).await.is_err() {
                break;
            }
        }
        if detach {
            break;
        }
    }

    cancel.cancel();
}

async fn forward_resizes(input: mpsc::Sender<ClientMessage>) {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(mut winch) = signal(SignalKind::window_change()) else {
        return;
    };
    while winch.recv().await.is_some() {
        if let Ok((cols, rows)) = crossterm::terminal::size() {
            if input.send(ClientMessage::Resize { rows, cols }).await.is_err() {
                break;
            }
        }
    }
}

async fn print_events(mut events: mpsc::Receiver<ClientEvent>) {
    let mut stdout = tokio::io::stdout();

    while let Some(event) = events.recv().await {
        let text = match event {
            ClientEvent::Message(ServerMessage::Output { data }) => data,
            ClientEvent::Message(ServerMessage::Error { message, .. }) => {
                format!("\r\n[termhub] {}\r\n", message)
            }
            ClientEvent::Message(ServerMessage::AssistResponse {
                content,
                is_loading: false,
                ..
            }) => format!("\r\n[assist] {}\r\n", content.replace('\n', "\r\n")),
            ClientEvent::StateChanged(ClientState::Reconnecting) => {
                "\r\n[termhub] connection lost, reconnecting...\r\n".to_string()
            }
            ClientEvent::RetryScheduled { attempt, delay } => {
                format!("[termhub] retry {} in {:?}\r\n", attempt, delay)
            }
            _ => continue,
        };

        if stdout.write_all(text.as_bytes()).await.is_err() {
            break;
        }
        let _ = stdout.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["termhub", "start"]).unwrap();
        assert!(matches!(cli.command, Commands::Start));
        assert!(!cli.verbose);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_stop_default_timeout() {
        let cli = Cli::try_parse_from(["termhub", "stop"]).unwrap();
        match cli.command {
            Commands::Stop { timeout } => assert_eq!(timeout, 30),
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_stop_with_timeout() {
        let cli = Cli::try_parse_from(["termhub", "stop", "--timeout", "5"]).unwrap();
        match cli.command {
            Commands::Stop { timeout } => assert_eq!(timeout, 5),
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_status_command() {
        let cli = Cli::try_parse_from(["termhub", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_sessions_list() {
        let cli = Cli::try_parse_from(["termhub", "sessions", "list"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::List { json }) => assert!(!json),
            _ => panic!("Expected Sessions List command"),
        }
    }

    #[test]
    fn test_sessions_list_json() {
        let cli = Cli::try_parse_from(["termhub", "sessions", "list", "--json"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::List { json }) => assert!(json),
            _ => panic!("Expected Sessions List command"),
        }
    }

    #[test]
    fn test_sessions_create_with_shell() {
        let cli =
            Cli::try_parse_from(["termhub", "sessions", "create", "--shell", "/bin/bash -l"])
                .unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Create { shell }) => {
                assert_eq!(shell.as_deref(), Some("/bin/bash -l"));
            }
            _ => panic!("Expected Sessions Create command"),
        }
    }

    #[test]
    fn test_sessions_create_default_shell() {
        let cli = Cli::try_parse_from(["termhub", "sessions", "create"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Create { shell }) => assert!(shell.is_none()),
            _ => panic!("Expected Sessions Create command"),
        }
    }

    #[test]
    fn test_sessions_close() {
        let cli = Cli::try_parse_from(["termhub", "sessions", "close", "abc-123"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Close { session_id }) => {
                assert_eq!(session_id, "abc-123");
            }
            _ => panic!("Expected Sessions Close command"),
        }
    }

    #[test]
    fn test_sessions_write() {
        let cli = Cli::try_parse_from(["termhub", "sessions", "write", "abc", "ls -la"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Write { session_id, data }) => {
                assert_eq!(session_id, "abc");
                assert_eq!(data, "ls -la");
            }
            _ => panic!("Expected Sessions Write command"),
        }
    }

    #[test]
    fn test_sessions_read_default_max_bytes() {
        let cli = Cli::try_parse_from(["termhub", "sessions", "read", "abc"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Read {
                session_id,
                max_bytes,
            }) => {
                assert_eq!(session_id, "abc");
                assert_eq!(max_bytes, 1024);
            }
            _ => panic!("Expected Sessions Read command"),
        }
    }

    #[test]
    fn test_sessions_read_max_bytes() {
        let cli =
            Cli::try_parse_from(["termhub", "sessions", "read", "abc", "--max-bytes", "64"])
                .unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Read { max_bytes, .. }) => {
                assert_eq!(max_bytes, 64);
            }
            _ => panic!("Expected Sessions Read command"),
        }
    }

    #[test]
    fn test_attach_with_url() {
        let cli = Cli::try_parse_from([
            "termhub",
            "attach",
            "abc",
            "--url",
            "ws://10.0.0.2:8767",
        ])
        .unwrap();
        match cli.command {
            Commands::Attach { session_id, url } => {
                assert_eq!(session_id, "abc");
                assert_eq!(url.as_deref(), Some("ws://10.0.0.2:8767"));
            }
            _ => panic!("Expected Attach command"),
        }
    }

    #[test]
    fn test_attach_requires_id() {
        assert!(Cli::try_parse_from(["termhub", "attach"]).is_err());
    }

    #[test]
    fn test_sessions_close_requires_id() {
        assert!(Cli::try_parse_from(["termhub", "sessions", "close"]).is_err());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["termhub", "-v", "-c", "/etc/termhub.toml", "status"])
            .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/termhub.toml")));
    }

    #[test]
    fn test_global_flags_after_command() {
        let cli = Cli::try_parse_from(["termhub", "status", "--verbose", "--config", "x.toml"])
            .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
    }

    #[test]
    fn test_invalid_command_fails() {
        assert!(Cli::try_parse_from(["termhub", "invalid"]).is_err());
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["termhub"]).is_err());
    }

    #[test]
    fn test_sessions_without_subcommand_fails() {
        assert!(Cli::try_parse_from(["termhub", "sessions"]).is_err());
    }

    #[test]
    fn test_help_available() {
        let err = Cli::try_parse_from(["termhub", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(61), "1m 1s");
        assert_eq!(format_duration(3600), "1h 0m 0s");
        assert_eq!(format_duration(3725), "1h 2m 5s");
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("/usr/local/bin/fish", 10), "/usr/lo...");
        assert_eq!(truncate_str("ééééé", 4), "é...");
    }
}
