// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::commands::{connect, handled_error, load_config, open_state, Cli, HandledResult};
use crate::config::CleanupItem;

#[derive(Args, Debug, Clone)]
pub struct CleanupArgs {
    /// Tear everything down, not just the config's cleanup list.
    #[arg(long)]
    pub all: bool,
}

pub async fn cleanup(cli: &Cli, args: &CleanupArgs) -> HandledResult<()> {
    let config = load_config(cli)?;
    let state = open_state(cli)?;
    let cluster = connect(config).await?;

    let items = if args.all {
        vec![
            CleanupItem::Initiators,
            CleanupItem::Subsystems,
            CleanupItem::Service,
            CleanupItem::Pool,
        ]
    } else {
        cluster.config.cleanup.clone()
    };
    if items.is_empty() {
        println!("nothing to clean up: the config lists no cleanup items");
        return Ok(());
    }

    let failed = cluster.cleanup(&items, &state.delta()).await;
    if failed > 0 {
        eprintln!("{failed} cleanup actions failed");
        return handled_error();
    }
    println!("cleanup ok");
    Ok(())
}
