//! fleetd-kernelsvc - privileged opcode execution service.
//!
//! Runs as a daemon listening on a local Unix socket, executing one
//! request per connection, strictly sequentially. A `--once <opcode>
//! <request_id>` mode executes a single opcode and prints the signed
//! response JSON to stdout; it is held behind the same operator flag as
//! the relay's process-spawn fallback, because an ungated one-shot mode
//! would be an open privilege-escalation path for anything that can
//! execute this binary. All logging goes to stderr (or a file) so the
//! `--once` stdout is pure JSON.
//!
//! # Fork safety
//!
//! Daemonization via `fork()` MUST happen before the Tokio runtime
//! starts. `fork()` in a multi-threaded process duplicates only the
//! calling thread; mutexes held by other threads stay locked forever in
//! the child. This binary therefore uses a synchronous `fn main()` that
//! forks in a single-threaded context and only then constructs the
//! runtime via `block_on()`.

use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use fleetd_core::crypto::Signer;
use fleetd_core::fs_safe;
use fleetd_core::ipc::KernelRequest;

use fleetd_kernelsvc::config::KernelConfig;
use fleetd_kernelsvc::executor::OpcodeExecutor;
use fleetd_kernelsvc::ops::SystemdOps;
use fleetd_kernelsvc::server::IpcServer;
use fleetd_kernelsvc::update::UpdateManager;

/// fleetd kernel service - privileged device operations
#[derive(Parser, Debug)]
#[command(name = "fleetd-kernelsvc")]
#[command(version, about, long_about = None)]
struct Args {
    /// Execute one opcode and print the signed response JSON to stdout.
    /// Requires FLEETD_ALLOW_EXEC_FALLBACK=1.
    #[arg(long, num_args = 2, value_names = ["OPCODE", "REQUEST_ID"])]
    once: Option<Vec<String>>,

    /// Run in foreground (don't daemonize)
    #[arg(long)]
    no_daemon: bool,

    /// IPC socket path (overrides FLEETD_IPC_SOCKET)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Synchronous entry point so daemonization happens before any runtime
/// thread exists.
fn main() -> Result<()> {
    let args = Args::parse();

    // One-shot mode stays in the foreground; its caller reads stdout.
    if args.once.is_none() && !args.no_daemon {
        match daemonize() {
            Ok(_) => {}
            Err(err) => {
                // Tracing is not initialized yet.
                eprintln!("daemonization failed: {err}");
                return Err(err);
            }
        }
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

/// Double-fork daemonization.
///
/// # Safety
///
/// Safe only while the process is single-threaded, which is why this is
/// called before `Runtime::new()`. The first fork's parent exits,
/// `setsid()` drops the controlling terminal, and the second fork keeps
/// the daemon from ever reacquiring one.
#[allow(unsafe_code)]
fn daemonize() -> Result<bool> {
    #[cfg(unix)]
    {
        use nix::unistd::{ForkResult, fork, setsid};

        // SAFETY: no runtime exists yet, so this process has exactly one
        // thread; fork() is well-defined here.
        match unsafe { fork() }? {
            ForkResult::Parent { .. } => std::process::exit(0),
            ForkResult::Child => {}
        }

        setsid()?;

        // SAFETY: still the single thread inherited from the first fork.
        match unsafe { fork() }? {
            ForkResult::Parent { .. } => std::process::exit(0),
            ForkResult::Child => {}
        }

        // Don't pin the startup directory for the daemon's lifetime.
        std::env::set_current_dir("/")?;

        Ok(true)
    }

    #[cfg(not(unix))]
    {
        Ok(false)
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        // stderr, never stdout: --once owns stdout.
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

fn write_pid_file(pid_path: &std::path::Path) -> Result<()> {
    fs_safe::atomic_write(pid_path, std::process::id().to_string().as_bytes())
        .context("failed to write PID file")?;
    info!(pid_path = %pid_path.display(), "PID file written");
    Ok(())
}

fn remove_pid_file(pid_path: &std::path::Path) {
    if pid_path.exists() {
        if let Err(err) = std::fs::remove_file(pid_path) {
            warn!(error = %err, "failed to remove PID file");
        }
    }
}

/// Resolves when SIGTERM or SIGINT arrives.
async fn shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigint.recv() => info!("SIGINT received"),
    }
    Ok(())
}

async fn async_main(args: Args) -> Result<()> {
    init_logging(&args)?;

    let mut config = KernelConfig::from_env();
    if let Some(socket) = &args.socket {
        config.socket_path.clone_from(socket);
    }

    // A missing signing key degrades to integrity-only stamps instead of
    // refusing to serve; verifiers can tell the difference.
    let signer: Option<Signer> = match config.kernel_key.load() {
        Ok(signer) => Some(signer),
        Err(err) => {
            warn!(
                error = %err,
                "kernel signing key unavailable; responses will carry integrity stamps only"
            );
            None
        }
    };
    let signing = if signer.is_some() { "ed25519" } else { "blake3" };

    let updates = UpdateManager::new(&config.update_root);
    let mut executor =
        OpcodeExecutor::new(SystemdOps::default(), updates).with_dangerous_ops(config.allow_dangerous_ops);
    if let Some(signer) = signer {
        executor = executor.with_signer(signer);
    }

    if let Some(once) = &args.once {
        return run_once(&config, &executor, &once[0], &once[1]).await;
    }

    write_pid_file(&config.pid_path())?;
    let server = IpcServer::bind(&config.socket_path).context("failed to bind IPC socket")?;

    info!(
        pid = std::process::id(),
        socket = %config.socket_path.display(),
        update_root = %config.update_root.display(),
        dangerous_ops = config.allow_dangerous_ops,
        signing,
        "kernel service started"
    );

    tokio::select! {
        result = server.serve(&executor) => result.context("IPC server terminated")?,
        result = shutdown_signal() => {
            result?;
            info!("shutting down");
        }
    }

    remove_pid_file(&config.pid_path());
    Ok(())
}

/// One-shot execution for the relay's gated process-spawn fallback: the
/// response JSON is the only stdout output, exit code 0.
async fn run_once(
    config: &KernelConfig,
    executor: &OpcodeExecutor<SystemdOps>,
    opcode: &str,
    request_id: &str,
) -> Result<()> {
    if !config.allow_exec_fallback {
        tracing::error!("--once mode disabled: FLEETD_ALLOW_EXEC_FALLBACK is not set");
        bail!("--once mode requires FLEETD_ALLOW_EXEC_FALLBACK=1");
    }

    let request = KernelRequest {
        opcode: opcode.to_string(),
        request_id: request_id.to_string(),
        params: None,
        policy_hash: None,
        command_message_id: None,
    };
    let response = executor.execute(&request).await;
    let text = serde_json::to_string(&response).context("failed to serialize response")?;
    println!("{text}");
    Ok(())
}
