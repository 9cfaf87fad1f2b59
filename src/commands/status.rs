// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::ana::{AnaReport, Availability};
use crate::commands::{connect, load_config, Cli, Handle, HandledResult};

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Only show gateways that are not AVAILABLE.
    #[arg(short = 'x')]
    exclude_available: bool,
}

pub async fn status(cli: &Cli, args: &StatusArgs) -> HandledResult<()> {
    let config = load_config(cli)?;
    let cluster = connect(config).await?;

    let report = cluster
        .orch
        .ana_report(&cluster.group.pool, &cluster.group.name)
        .await
        .handle_err(|e| eprintln!("Could not fetch the ana report: {e}"))?;

    print_report(&report, args);
    Ok(())
}

fn print_report(report: &AnaReport, args: &StatusArgs) {
    for gw in &report.gateways {
        if args.exclude_available && gw.availability == Availability::Available {
            continue;
        }
        let states: Vec<String> = gw
            .states
            .iter()
            .map(|(gid, state)| format!("{gid}: {state}"))
            .collect();
        println!("{}: {} [{}]", gw.availability, gw.gw_id, states.join(", "));
    }
    println!("overall: {}", report.worst_availability());
}
