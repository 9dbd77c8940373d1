//! Wiring and command execution.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{info, warn};

use rx_01_credential_vault::CredentialVault;
use rx_03_motor_gate::adapters::{BusEventSink, FileStateStore, PaperExchange};
use rx_03_motor_gate::{
    MotorConfig, MotorDependencies, MotorService, StaticKeyProvider, SystemTimeSource,
};
use rx_04_shadow_state::{DriftSink, Reconciler, ShadowBook};
use shared_bus::{AclMatrix, FileCursorStore, Identity, MessageBus};
use shared_types::{ArmedState, BreakerState, CanonicalPolicy, DriftEvent, OperatorAction, OperatorCommand};

use crate::config::MotorEnv;

/// Vault service names for the HMAC secrets.
const BRAIN_SECRET_SERVICE: &str = "brain-hmac";
const OPERATOR_SECRET_SERVICE: &str = "operator-hmac";

type Motor = MotorService<PaperExchange, BusEventSink, StaticKeyProvider>;

struct MotorDrift {
    motor: Arc<Motor>,
}

#[async_trait::async_trait]
impl DriftSink for MotorDrift {
    async fn report(&self, event: DriftEvent) {
        if let Err(e) = self.motor.on_drift(event).await {
            warn!(error = %e, "Drift handling failed");
        }
    }
}

fn load_policy(env: &MotorEnv) -> anyhow::Result<Arc<CanonicalPolicy>> {
    let policy = CanonicalPolicy::load(&env.policy_path)
        .with_context(|| format!("loading policy {}", env.policy_path.display()))?;
    Ok(Arc::new(policy))
}

fn open_vault(env: &MotorEnv) -> anyhow::Result<CredentialVault> {
    CredentialVault::open(&env.vault_path(), &env.master_secret)
        .with_context(|| format!("opening vault {}", env.vault_path().display()))
}

fn build_bus(env: &MotorEnv) -> anyhow::Result<(Arc<MessageBus>, Identity)> {
    let motor = Identity::new(&env.identity);
    let brains = [Identity::new("brain-a"), Identity::new("brain-b")];
    let operator = Identity::new("operator");
    let strategies = [Identity::new("strategy")];
    let acl = AclMatrix::reflex_default(&motor, &brains, &operator, &strategies);
    let cursors = FileCursorStore::open(env.cursor_path())
        .map_err(|e| anyhow!("cursor store: {e}"))?;
    Ok((Arc::new(MessageBus::new(acl, Arc::new(cursors))), motor))
}

fn build_motor(
    env: &MotorEnv,
    policy: Arc<CanonicalPolicy>,
    vault: &CredentialVault,
    bus: Arc<MessageBus>,
    identity: Identity,
    venue: Arc<PaperExchange>,
) -> anyhow::Result<Arc<Motor>> {
    let brain_secret = vault
        .get(BRAIN_SECRET_SERVICE)
        .ok_or_else(|| anyhow!("vault has no {BRAIN_SECRET_SERVICE} entry"))?
        .secret
        .clone()
        .into_bytes();
    let operator_secret = vault
        .get(OPERATOR_SECRET_SERVICE)
        .ok_or_else(|| anyhow!("vault has no {OPERATOR_SECRET_SERVICE} entry"))?
        .secret
        .clone()
        .into_bytes();

    let mut issuers = HashMap::new();
    issuers.insert("brain-a".to_string(), brain_secret.clone());
    issuers.insert("brain-b".to_string(), brain_secret);

    let state_store = Arc::new(
        FileStateStore::open(env.state_dir()).map_err(|e| anyhow!("state store: {e}"))?,
    );
    let book = Arc::new(
        ShadowBook::load_snapshot(&env.account, &env.shadow_snapshot_path())
            .map_err(|e| anyhow!("shadow snapshot: {e}"))?,
    );

    let motor = MotorService::new(MotorDependencies {
        config: MotorConfig {
            account: env.account.clone(),
            exchange: "paper".to_string(),
            identity: env.identity.clone(),
        },
        policy,
        exchange: venue,
        sink: Arc::new(BusEventSink::new(bus, identity)),
        keys: StaticKeyProvider::new(issuers, operator_secret),
        state_store,
        time: Arc::new(SystemTimeSource),
        book,
    })
    .map_err(|e| anyhow!("motor construction: {e}"))?;
    Ok(Arc::new(motor))
}

/// `start`: run the Motor until ctrl-c.
pub async fn start(env: &MotorEnv) -> anyhow::Result<()> {
    let policy = load_policy(env)?;
    let vault = open_vault(env)?;
    let (bus, identity) = build_bus(env)?;
    let venue = Arc::new(PaperExchange::auto_filling(Decimal::new(1_000_000, 0)));
    for symbol in policy.symbols.keys() {
        venue.set_mark(symbol, Decimal::new(100, 0));
    }
    let mut fill_feed = venue.fills();

    let motor = build_motor(env, Arc::clone(&policy), &vault, Arc::clone(&bus), identity.clone(), Arc::clone(&venue))?;
    drop(vault);

    info!(
        identity = %identity,
        policy_hash = %motor.policy_hash(),
        armed = %motor.armed_state(),
        breaker = %motor.breaker_state(),
        "Motor starting"
    );
    motor.advertise_policy().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Command consumer.
    let commands = bus
        .subscribe(&identity, &format!("{}-commands", identity.0), "reflex.cmd.")
        .map_err(|e| anyhow!("command subscription: {e}"))?;
    let command_task = {
        let motor = Arc::clone(&motor);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { motor.run(commands, shutdown).await })
    };

    // Reconciler. Each pass also re-evaluates the daily-loss thresholds,
    // so a loss crossing a cap between fills still trips the breaker on
    // the next tick.
    let reconciler = Reconciler::new(
        motor.book(),
        Arc::clone(&venue),
        Arc::new(MotorDrift {
            motor: Arc::clone(&motor),
        }),
        Arc::clone(&policy),
    );
    let reconciler_task = {
        let motor = Arc::clone(&motor);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let interval =
                std::time::Duration::from_millis(shared_types::RECONCILE_INTERVAL_MS);
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = reconciler.reconcile_once(shared_types::now_ms()).await {
                            warn!(error = %e, "Reconciliation pass failed; will retry");
                        }
                        if let Err(e) = motor.evaluate_daily_loss().await {
                            warn!(error = %e, "Daily-loss evaluation failed");
                        }
                    }
                }
            }
        })
    };

    // Fill ingestion from the venue.
    let fill_task = {
        let motor = Arc::clone(&motor);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    fill = fill_feed.recv() => {
                        let Some(fill) = fill else { return };
                        if let Err(e) = motor.ingest_fill(fill).await {
                            // Invariant-class failure: exit nonzero rather
                            // than continue in an unknown state.
                            panic!("fill ingestion invariant: {e}");
                        }
                    }
                }
            }
        })
    };

    info!("Motor running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("Shutting down");
    shutdown_tx.send(true).ok();

    let _ = command_task.await;
    let _ = reconciler_task.await;
    let _ = fill_task.await;

    motor
        .book()
        .save_snapshot(&env.shadow_snapshot_path())
        .await
        .map_err(|e| anyhow!("shadow snapshot: {e}"))?;
    Ok(())
}

/// `arm` / `disarm` / `halt`: sign and apply an operator command against
/// the local durable state. Requires the Motor to be stopped (the state
/// directory lock is exclusive).
pub async fn operator(env: &MotorEnv, action: OperatorAction) -> anyhow::Result<()> {
    let policy = load_policy(env)?;
    let vault = open_vault(env)?;
    let operator_secret = vault
        .get(OPERATOR_SECRET_SERVICE)
        .ok_or_else(|| anyhow!("vault has no {OPERATOR_SECRET_SERVICE} entry"))?
        .secret
        .clone()
        .into_bytes();

    let (bus, identity) = build_bus(env)?;
    let venue = Arc::new(PaperExchange::ack_only(Decimal::new(1_000_000, 0)));
    let motor = build_motor(env, policy, &vault, bus, identity, venue)?;
    drop(vault);

    let actor = std::env::var("USER").unwrap_or_else(|_| "operator".to_string());
    let command =
        OperatorCommand::signed(action, &actor, shared_types::now_ms(), &operator_secret);
    motor
        .handle_operator_command(&command)
        .await
        .map_err(|e| anyhow!("{e}"))?;
    println!("{action}: ok (armed={}, breaker={})", motor.armed_state(), motor.breaker_state());
    Ok(())
}

/// `reconcile-now`: one reconciliation pass, then exit.
pub async fn reconcile_now(env: &MotorEnv) -> anyhow::Result<()> {
    let policy = load_policy(env)?;
    let vault = open_vault(env)?;
    let (bus, identity) = build_bus(env)?;
    let venue = Arc::new(PaperExchange::ack_only(Decimal::new(1_000_000, 0)));
    let motor = build_motor(env, Arc::clone(&policy), &vault, bus, identity, Arc::clone(&venue))?;
    drop(vault);

    let reconciler = Reconciler::new(
        motor.book(),
        venue,
        Arc::new(MotorDrift {
            motor: Arc::clone(&motor),
        }),
        policy,
    );
    let drifts = reconciler
        .reconcile_once(shared_types::now_ms())
        .await
        .map_err(|e| anyhow!("{e}"))?;
    println!("reconciled: {} drift(s)", drifts.len());
    motor
        .book()
        .save_snapshot(&env.shadow_snapshot_path())
        .await
        .map_err(|e| anyhow!("shadow snapshot: {e}"))?;
    Ok(())
}

/// `show-state`: read the durable files without taking the Motor lock.
pub async fn show_state(env: &MotorEnv) -> anyhow::Result<()> {
    let dir = env.state_dir();
    let armed: ArmedState = read_state(&dir.join("armed.state"))?.unwrap_or_default();
    let breaker: BreakerState = read_state(&dir.join("breaker.state"))?.unwrap_or_default();
    println!("armed:   {armed}");
    println!("breaker: {breaker}");

    match ShadowBook::load_snapshot(&env.account, &env.shadow_snapshot_path()) {
        Ok(book) => {
            for position in book.all_positions().await {
                println!(
                    "shadow:  {} size={} avg={} realized={}",
                    position.symbol, position.size, position.avg_entry_price, position.realized_pnl
                );
            }
        }
        Err(e) => println!("shadow:  unreadable ({e})"),
    }
    Ok(())
}

fn read_state<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> anyhow::Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(
            bincode::deserialize(&bytes).map_err(|e| anyhow!("{}: {e}", path.display()))?,
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow!("{}: {e}", path.display())),
    }
}
