// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::commands::{connect, load_config, open_state, Cli, Handle, HandledResult};
use crate::ha::{Ha, HaOutcome};
use crate::io::{validate_io, ValidateOpts};

#[derive(Args, Debug, Clone)]
pub struct FailoverArgs {
    /// Gateway nodes to fail, by node id.
    #[arg(required = true)]
    pub nodes: Vec<String>,

    /// Also check that IO keeps landing on the moved namespaces.
    #[arg(long)]
    pub validate_io: bool,
}

pub async fn failover(cli: &Cli, args: &FailoverArgs) -> HandledResult<()> {
    let config = load_config(cli)?;
    let state = open_state(cli)?;
    let cluster = connect(config).await?;

    let ha = Ha {
        exec: &cluster.exec,
        orch: &cluster.orch,
        group: &cluster.group,
        initiators: &cluster.initiators,
        state: &state,
        conf: &cluster.config.ha,
    };

    let outcome = ha
        .failover(&args.nodes)
        .await
        .handle_err(|e| eprintln!("Failover failed: {e}"))?;
    print_moves(&outcome);

    if args.validate_io {
        let opts = ValidateOpts::from_config(&cluster.config.io);
        validate_io(&cluster.orch, &outcome.namespaces(), false, &opts)
            .await
            .handle_err(|e| eprintln!("IO validation failed: {e}"))?;
        println!("io kept flowing to every moved namespace");
    }

    Ok(())
}

pub fn print_moves(outcome: &HaOutcome) {
    for (gw, namespaces) in &outcome.affected {
        let served = outcome
            .groups
            .get(gw)
            .and_then(|gid| outcome.serving.get(gid));
        match served {
            Some(node) => println!("{gw}: {} namespaces now on {node}", namespaces.len()),
            None => println!("{gw}: {} namespaces", namespaces.len()),
        }
    }
}
