// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod cleanup;
pub mod discover;
pub mod failback;
pub mod failover;
pub mod masking;
pub mod run;
pub mod status;
pub mod validate;

use {
    cleanup::CleanupArgs, discover::DiscoverArgs, failback::FailbackArgs,
    failover::FailoverArgs, masking::MaskingArgs, status::StatusArgs,
};

use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::cluster::Cluster;
use crate::config::Config;
use crate::remote::{Executor, SshExecutor};
use crate::state::State;

/// A `HandledError` represents an error that has already been handled. When you call a function
/// that returns a `HandledError` or `HandledResult`, you don't need to do anything with that error,
/// other than just be aware that it happened, and return it on to your caller.
///
/// `main()` has a special responsibility: since its "caller" is, in a certain sense, the operating
/// system, `main()` must return a nonzero exit status when it gets a `HandledError`.
///
/// The primary way to construct a `HandledError` is with the `handle_err()` function, which turns a
/// generic error into a `HandledError`, and also runs some caller-provided code to handle the
/// error. That provided code would normally do something like report the error to stderr.
///
/// A `HandledError` inentionally has no data about what the specific error was; the process of
/// handling the error "consumes" that information, and it is no longer needed as the error was
/// already appropriately handled.
#[derive(Debug, PartialEq)]
pub struct HandledError {}

pub type HandledResult<T> = std::result::Result<T, HandledError>;

pub fn handled_error() -> HandledResult<()> {
    HandledResult::Err(HandledError {})
}

pub trait Handle<T, F> {
    fn handle_err(self, handler: F) -> HandledResult<T>;
}

impl<T, E, F: FnOnce(E)> Handle<T, F> for std::result::Result<T, E> {
    /// Handle an error by running the provided `handler` code, giving it the error.
    ///
    /// Then, return a `HandledResult`, so that transitive callers of this function know that they
    /// do not need to do anything further to handle the error.
    fn handle_err(self, handler: F) -> HandledResult<T> {
        self.map_err(|e| {
            handler(e);
            HandledError {}
        })
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: $CUTTLE_CONFIG or /etc/cuttle/cuttle.conf).
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Fault journal (default: $CUTTLE_STATEFILE or /etc/cuttle/cuttle.state).
    #[arg(long, global = true)]
    pub statefile: Option<String>,

    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute the configured steps in order, then clean up.
    Run,
    /// Probe a cluster over ssh and print a config skeleton.
    Discover(DiscoverArgs),
    /// Show every gateway's ANA view of the group.
    Status(StatusArgs),
    /// Fail gateways and verify the takeover.
    Failover(FailoverArgs),
    /// Restore gateways and verify the group heals.
    Failback(FailbackArgs),
    /// Run a single namespace-masking operation.
    Masking(MaskingArgs),
    /// Check the config file without touching the cluster.
    Validate,
    /// Tear down whatever the config's cleanup list names.
    Cleanup(CleanupArgs),
}

fn load_config(cli: &Cli) -> HandledResult<Config> {
    let path = cli.config.clone().unwrap_or_else(crate::default_config_path);
    let config = Config::load(&path).handle_err(|e| eprintln!("Could not load {path}: {e}"))?;
    config.validate().handle_err(|e| eprintln!("{path}: {e}"))?;
    Ok(config)
}

fn open_state(cli: &Cli) -> HandledResult<State> {
    let path = cli
        .statefile
        .clone()
        .unwrap_or_else(crate::default_statefile_path);
    State::new(&path).handle_err(|e| eprintln!("Could not open statefile {path}: {e}"))
}

async fn connect(config: Config) -> HandledResult<Cluster> {
    let exec: Arc<dyn Executor> = Arc::new(SshExecutor::new(&config.cluster.ssh_user));
    Cluster::connect(config, exec)
        .await
        .handle_err(|e| eprintln!("Could not connect to the cluster: {e}"))
}

pub fn main(cli: &Cli) -> HandledResult<()> {
    if let Commands::Validate = &cli.command {
        return validate::validate(cli);
    }

    let rt = tokio::runtime::Runtime::new()
        .handle_err(|e| eprintln!("Error launching tokio runtime: {e}"))?;

    rt.block_on(async {
        match &cli.command {
            Commands::Run => run::run(cli).await,
            Commands::Discover(args) => discover::discover(args).await,
            Commands::Status(args) => status::status(cli, args).await,
            Commands::Failover(args) => failover::failover(cli, args).await,
            Commands::Failback(args) => failback::failback(cli, args).await,
            Commands::Masking(args) => masking::masking(cli, args).await,
            Commands::Cleanup(args) => cleanup::cleanup(cli, args).await,
            Commands::Validate => unreachable!(),
        }
    })
}
