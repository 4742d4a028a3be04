//! fleetd-agent - the unprivileged device agent.
//!
//! Connects to the fleet backend, authenticates, and services commands
//! for as long as the connection lasts. When a session ends for any
//! reason the agent waits briefly and reconnects; transient failures
//! never terminate the process. Only unusable configuration or an
//! unreadable signing key abort startup.
//!
//! Privileged work is never done here: anything beyond diagnostics is
//! relayed to fleetd-kernelsvc over its local socket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fleetd_agent::config::AgentConfig;
use fleetd_agent::dispatch::CommandDispatcher;
use fleetd_agent::relay::{KernelRelay, RelayConfig};
use fleetd_agent::session::{Session, SessionConfig};
use fleetd_agent::transport;
use fleetd_core::crypto::Signer;
use fleetd_core::envelope::body::AgentInfo;
use fleetd_core::envelope::{EnvelopeBuilder, EnvelopeVerifier};
use fleetd_core::fs_safe;
use fleetd_core::sequence::SequenceCounter;
use fleetd_core::state::AgentState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Pause between reconnect attempts after a session ends.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Maximum tolerated clock skew on inbound backend envelopes, seconds.
const MAX_BACKEND_SKEW_SECS: i64 = 300;

/// fleetd device agent
#[derive(Parser, Debug)]
#[command(name = "fleetd-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Backend endpoint, overriding FLEETD_ENDPOINT
    #[arg(long)]
    endpoint: Option<String>,

    /// Device id, overriding FLEETD_DEVICE_ID
    #[arg(long)]
    device_id: Option<String>,
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
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

/// Installation facts reported in `AUTH`.
///
/// The hardware id is a digest of the device id until a real hardware
/// probe is wired in; the backend only requires it to be stable.
fn agent_info(device_id: &str) -> AgentInfo {
    AgentInfo {
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        attestation_hash: None,
        hwid_hash: blake3::hash(device_id.as_bytes()).to_hex().to_string(),
        os_build: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
    }
}

async fn run_session(
    config: &AgentConfig,
    signer: &Arc<Signer>,
    sequence: &Arc<SequenceCounter>,
    state: &AgentState,
) -> Result<()> {
    let backend = transport::connect(&config.endpoint).await?;

    let mut relay_config = RelayConfig::new(&config.kernel_socket);
    if let Some(key) = config.kernel_pubkey {
        relay_config = relay_config.with_kernel_verifying_key(key);
    }
    if config.allow_exec_fallback {
        relay_config = relay_config.with_exec_fallback(&config.kernelsvc_binary);
    }
    let dispatcher = CommandDispatcher::new(state.clone(), KernelRelay::new(relay_config));

    let builder =
        EnvelopeBuilder::new(&config.device_id, Arc::clone(signer), Arc::clone(sequence));
    let verifier = config
        .backend_pubkey
        .map(|key| EnvelopeVerifier::new(key).with_max_skew_secs(MAX_BACKEND_SKEW_SECS));

    let session_config = SessionConfig::new(&config.auth_token, agent_info(&config.device_id));
    let mut session = Session::new(backend, builder, dispatcher, state.clone(), session_config)
        .with_verifier(verifier);
    session.run().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut config = AgentConfig::from_env().context("agent configuration incomplete")?;
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(device_id) = args.device_id {
        config.device_id = device_id;
    }

    fs_safe::ensure_private_dir(&config.state_dir).context("state directory unusable")?;
    let signer = Arc::new(
        config
            .agent_key
            .load()
            .context("agent signing key unavailable")?,
    );
    let sequence = Arc::new(SequenceCounter::load(config.sequence_path()));
    let state = AgentState::new(&config.device_id);

    info!(
        device_id = %config.device_id,
        endpoint = %config.endpoint,
        public_key = %signer.verifying_key_b64(),
        backend_verification = config.backend_pubkey.is_some(),
        "fleetd-agent starting"
    );

    loop {
        match run_session(&config, &signer, &sequence, &state).await {
            Ok(()) => info!("session ended; reconnecting"),
            Err(err) => warn!(error = %err, "session failed; reconnecting"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
