//! # Reflex Motor Runtime
//!
//! Entry point for the execution side of the organism. The Motor owns the
//! exchange; everything reaches it through the signed bus, and this binary
//! is also the operator console for the interlock.
//!
//! Exit codes: 0 success, 1 usage, 2 configuration, 3 runtime failure.

mod app;
mod config;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use shared_types::OperatorAction;

use crate::config::MotorEnv;

#[derive(Parser)]
#[command(name = "reflex-motor", about = "Reflex execution gate", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the Motor until interrupted.
    Start,
    /// Sign and apply an arm transition.
    Arm,
    /// Sign and apply a disarm transition.
    Disarm,
    /// Sign and apply an emergency halt (flatten, then disarm).
    Halt,
    /// Run one reconciliation pass and exit.
    ReconcileNow,
    /// Print the durable Motor state.
    ShowState,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().expect("valid directive")))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Usage problems (including --help/--version) exit 1/0.
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let env = match MotorEnv::from_env() {
        Ok(env) => env,
        Err(e) => {
            error!("configuration: {e}");
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

    let result = runtime.block_on(async {
        match cli.command {
            Command::Start => app::start(&env).await,
            Command::Arm => app::operator(&env, OperatorAction::Arm).await,
            Command::Disarm => app::operator(&env, OperatorAction::Disarm).await,
            Command::Halt => app::operator(&env, OperatorAction::Halt).await,
            Command::ReconcileNow => app::reconcile_now(&env).await,
            Command::ShowState => app::show_state(&env).await,
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Configuration-shaped failures (vault, policy) exit 2; the
            // rest are runtime failures.
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
