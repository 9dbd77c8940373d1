//! # Reflex Cortex Runtime
//!
//! The decision side: elects a leader among brain replicas, gates strategy
//! signals into signed intents, and posts fills into the ledger. Imports
//! only the shared schema and the bus; the Motor is invisible except
//! through its events.
//!
//! Exit codes: 0 success, 1 usage, 2 configuration, 3 runtime failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rx_01_credential_vault::CredentialVault;
use rx_02_leader_elector::{FileTermStore, LeaderElector, SystemTimeSource, TermStore, TimeSource};
use rx_05_signal_gate::{
    ApprovalPorts, FileDedupStore, OpenPorts, SignalGate, SignalGateDependencies,
};
use rx_06_ledger::{FileKVStore, Ledger, LedgerConsumer};
use shared_bus::{subjects, AclMatrix, FileCursorStore, Identity, MessageBus};
use shared_types::CanonicalPolicy;

#[derive(Parser)]
#[command(name = "reflex-cortex", about = "Reflex decision brain", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the Cortex until interrupted.
    Start,
}

struct CortexEnv {
    master_secret: String,
    data_dir: PathBuf,
    policy_path: PathBuf,
    identity: String,
    account: String,
}

impl CortexEnv {
    fn from_env() -> anyhow::Result<Self> {
        let master_secret =
            std::env::var("REFLEX_MASTER_SECRET").context("REFLEX_MASTER_SECRET is not set")?;
        let policy_path =
            std::env::var("REFLEX_POLICY_PATH").context("REFLEX_POLICY_PATH is not set")?;
        Ok(Self {
            master_secret,
            data_dir: PathBuf::from(
                std::env::var("REFLEX_DATA_DIR").unwrap_or_else(|_| "./reflex-data".to_string()),
            ),
            policy_path: PathBuf::from(policy_path),
            identity: std::env::var("REFLEX_IDENTITY").unwrap_or_else(|_| "brain-a".to_string()),
            account: std::env::var("REFLEX_ACCOUNT").unwrap_or_else(|_| "main".to_string()),
        })
    }
}

async fn start(env: &CortexEnv) -> anyhow::Result<()> {
    let policy = Arc::new(
        CanonicalPolicy::load(&env.policy_path)
            .with_context(|| format!("loading policy {}", env.policy_path.display()))?,
    );
    let vault = CredentialVault::open(&env.data_dir.join("credentials.vault"), &env.master_secret)
        .context("opening vault")?;
    let issuer_secret = vault
        .get("brain-hmac")
        .ok_or_else(|| anyhow!("vault has no brain-hmac entry"))?
        .secret
        .clone()
        .into_bytes();
    drop(vault);

    let identity = Identity::new(&env.identity);
    let motor = Identity::new("motor");
    let operator = Identity::new("operator");
    let strategies = [Identity::new("strategy")];
    let acl = AclMatrix::reflex_default(
        &motor,
        std::slice::from_ref(&identity),
        &operator,
        &strategies,
    );
    let cursors = FileCursorStore::open(env.data_dir.join("cortex-cursors.bin"))
        .map_err(|e| anyhow!("cursor store: {e}"))?;
    let bus = Arc::new(MessageBus::new(acl, Arc::new(cursors)));

    // Leader election with a durable fencing term.
    let term_store = Arc::new(FileTermStore::new(env.data_dir.join("leader.term")));
    let elector = LeaderElector::new(
        &env.identity,
        identity.clone(),
        Arc::clone(&bus),
        Arc::clone(&term_store) as Arc<dyn TermStore>,
        Arc::new(SystemTimeSource) as Arc<dyn TimeSource>,
    )
    .map_err(|e| anyhow!("elector: {e}"))?;
    let elector_handle = elector.handle(&env.identity);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let elector_task = tokio::spawn(elector.run(shutdown_rx.clone()));

    // Signal gate.
    let gate = Arc::new(SignalGate::new(SignalGateDependencies {
        bus: Arc::clone(&bus),
        identity: identity.clone(),
        elector: elector_handle,
        policy: Arc::clone(&policy),
        dedup: Arc::new(
            FileDedupStore::open(env.data_dir.join("signal-dedup.bin"))
                .map_err(|e| anyhow!("dedup store: {e}"))?,
        ),
        nonce_store: Arc::new(FileTermStore::new(env.data_dir.join("issuer.nonce")))
            as Arc<dyn TermStore>,
        ports: ApprovalPorts {
            strategies: OpenPorts,
            flow: OpenPorts,
            regime: OpenPorts,
        },
        issuer_secret,
        equity: Decimal::new(1_000_000, 0),
    }));
    let signals = bus
        .subscribe(&identity, &format!("{}-signals", env.identity), subjects::SIGNAL_PREFIX)
        .map_err(|e| anyhow!("signal subscription: {e}"))?;
    let policy_ads = bus
        .subscribe(&identity, &format!("{}-policy", env.identity), subjects::EXECUTION_POLICY)
        .map_err(|e| anyhow!("policy subscription: {e}"))?;
    let gate_task = {
        let gate = Arc::clone(&gate);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { gate.run(signals, policy_ads, shutdown).await })
    };

    // Ledger + consumer.
    let store = Arc::new(
        FileKVStore::open(env.data_dir.join("ledger.kv")).map_err(|e| anyhow!("ledger store: {e}"))?,
    );
    let ledger = Arc::new(Ledger::new(store, &env.account));
    let consumer = Arc::new(LedgerConsumer::new(
        Arc::clone(&ledger),
        Arc::clone(&bus),
        identity.clone(),
    ));
    let fills = bus
        .subscribe(&identity, &format!("{}-fills", env.identity), subjects::EXECUTION_FILL)
        .map_err(|e| anyhow!("fill subscription: {e}"))?;
    let ledger_task = {
        let consumer = Arc::clone(&consumer);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { consumer.run(fills, shutdown).await })
    };

    info!(
        identity = %identity,
        policy_hash = %gate.policy_hash(),
        "Cortex running; ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("Shutting down");
    shutdown_tx.send(true).ok();

    let _ = elector_task.await;
    let _ = gate_task.await;
    let _ = ledger_task.await;
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().expect("valid directive")))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let env = match CortexEnv::from_env() {
        Ok(env) => env,
        Err(e) => {
            error!("configuration: {e:#}");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("runtime init: {e}");
            return ExitCode::from(3);
        }
    };

    match runtime.block_on(async {
        match cli.command {
            Command::Start => start(&env).await,
        }
    }) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let message = format!("{e:#}");
            error!("{message}");
            if message.contains("policy") || message.contains("vault") {
                ExitCode::from(2)
            } else {
                ExitCode::from(3)
            }
        }
    }
}
