// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::commands::{load_config, Cli, HandledResult};
use crate::config::{AuthMode, CleanupItem, Config, Release};

pub fn validate(cli: &Cli) -> HandledResult<()> {
    let config = load_config(cli)?;
    print_summary(&config);
    Ok(())
}

fn print_summary(config: &Config) {
    let release = match config.cluster.release {
        Release::Reef => "reef",
        Release::Squid => "squid",
    };
    println!(
        "cluster: {} nodes, release {release}, installer {}",
        config.cluster.nodes.len(),
        config.cluster.installer
    );

    println!(
        "group {} in pool {}: gateways [{}]",
        config.group.name,
        config.group.pool,
        config.group.gateways.join(", ")
    );
    for sub in &config.group.subsystems {
        let access = if sub.allow_any_host {
            "open".to_string()
        } else {
            format!("{} hosts", sub.hosts.len())
        };
        println!(
            "  {}: {} namespaces, listener {}, {access}",
            sub.nqn, sub.namespaces, sub.listener_port
        );
    }

    let initiators: Vec<&str> = config.initiators.iter().map(|i| i.node.as_str()).collect();
    println!("initiators: [{}]", initiators.join(", "));

    let auth = match config.auth.mode {
        AuthMode::None => "none",
        AuthMode::Unidirectional => "unidirectional",
        AuthMode::Bidirectional => "bidirectional",
    };
    println!("auth: {auth}");

    let steps: Vec<&str> = config.steps.iter().map(|s| s.name()).collect();
    println!("steps: [{}]", steps.join(", "));

    let cleanup: Vec<&str> = config
        .cleanup
        .iter()
        .map(|item| match item {
            CleanupItem::Initiators => "initiators",
            CleanupItem::Subsystems => "subsystems",
            CleanupItem::Service => "service",
            CleanupItem::Pool => "pool",
        })
        .collect();
    println!("cleanup: [{}]", cleanup.join(", "));

    println!("config ok");
}
