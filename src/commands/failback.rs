// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::commands::{connect, load_config, open_state, Cli, Handle, HandledResult};
use crate::ha::Ha;
use crate::io::{validate_io, ValidateOpts};

#[derive(Args, Debug, Clone)]
pub struct FailbackArgs {
    /// Gateway nodes to bring back, by node id.
    #[arg(required = true)]
    pub nodes: Vec<String>,

    /// Also check that IO keeps landing on the returned namespaces.
    #[arg(long)]
    pub validate_io: bool,
}

pub async fn failback(cli: &Cli, args: &FailbackArgs) -> HandledResult<()> {
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
        .failback(&args.nodes)
        .await
        .handle_err(|e| eprintln!("Failback failed: {e}"))?;
    for (gw, namespaces) in &outcome.affected {
        println!("{gw}: serving its {} namespaces again", namespaces.len());
    }

    if args.validate_io {
        let opts = ValidateOpts::from_config(&cluster.config.io);
        validate_io(&cluster.orch, &outcome.namespaces(), false, &opts)
            .await
            .handle_err(|e| eprintln!("IO validation failed: {e}"))?;
        println!("io kept flowing to every returned namespace");
    }

    Ok(())
}
