// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Probe a live cluster and print a config skeleton on stdout. The output
//! is a starting point: subsystems and steps still want editing, but the
//! node table, addresses, and group placement come from the cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use clap::Args;
use log::{debug, warn};
use serde::Deserialize;

use crate::commands::{handled_error, Handle, HandledResult};
use crate::config::{
    AuthConfig, ClusterConfig, Config, GroupConfig, HaConfig, InitiatorConfig, IoConfig,
    NodeConfig, Release, Step, SubsystemConfig,
};
use crate::gwcli::{dialect_for, Dialect, GwCli};
use crate::node::Node;
use crate::orch::Orch;
use crate::remote::{parse_json, Executor, SshExecutor};

#[derive(Args, Debug, Clone)]
pub struct DiscoverArgs {
    /// Node carrying the admin keyring.
    #[arg(long)]
    pub installer: String,

    /// Initiator hostnames.
    #[arg()]
    pub initiators: Vec<String>,

    /// Cluster release: reef or squid.
    #[arg(long, default_value = "squid")]
    pub release: String,

    #[arg(long)]
    pub ssh_user: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ServiceEntry {
    #[serde(default)]
    service_name: String,
}

pub async fn discover(args: &DiscoverArgs) -> HandledResult<()> {
    let release = match args.release.as_str() {
        "reef" => Release::Reef,
        "squid" => Release::Squid,
        other => {
            eprintln!("Unknown release '{other}': expected reef or squid.");
            return handled_error();
        }
    };
    let ssh_user = args.ssh_user.clone().unwrap_or_else(crate::default_ssh_user);
    let exec: Arc<dyn Executor> = Arc::new(SshExecutor::new(&ssh_user));
    let dialect = dialect_for(release);

    let mut installer = Node::new(&node_id(&args.installer), &args.installer, &args.installer);
    installer.addr = resolve_addr(exec.as_ref(), &installer, &args.installer).await;
    let orch = Orch::new(exec.clone(), dialect.clone(), installer.clone());

    let (pool, group_name) = find_service(&orch).await;
    let daemons = orch
        .daemons()
        .await
        .handle_err(|e| eprintln!("Could not list daemons via {}: {e}", args.installer))?;
    let mut gateway_hosts: Vec<String> = daemons.iter().map(|d| d.hostname.clone()).collect();
    gateway_hosts.sort();
    gateway_hosts.dedup();
    if gateway_hosts.is_empty() {
        eprintln!("No nvmeof daemons found; emitting a skeleton group to fill in.");
    }

    let mut nodes = BTreeMap::new();
    let mut add_node = |node: &Node| {
        nodes.entry(node.id.clone()).or_insert(NodeConfig {
            id: node.id.clone(),
            hostname: node.hostname.clone(),
            addr: node.addr.clone(),
        });
    };
    add_node(&installer);
    for hostname in gateway_hosts.iter().chain(args.initiators.iter()) {
        let mut node = Node::new(&node_id(hostname), hostname, hostname);
        node.addr = resolve_addr(exec.as_ref(), &installer, hostname).await;
        add_node(&node);
    }

    for hostname in &args.initiators {
        let node = Node::new(&node_id(hostname), hostname, hostname);
        if node
            .run(exec.as_ref(), "cat /etc/nvme/hostnqn")
            .await
            .is_err()
        {
            warn!("{hostname} has no /etc/nvme/hostnqn; install nvme-cli before running");
        }
    }

    let subsystems = match gateway_hosts.first() {
        Some(gw) => {
            let addr = nodes
                .values()
                .find(|n| &n.hostname == gw)
                .map(|n| n.addr.clone())
                .unwrap_or_else(|| gw.clone());
            probe_subsystems(&exec, &dialect, gw, &addr).await
        }
        None => None,
    };

    let config = Config {
        cluster: ClusterConfig {
            installer: installer.id.clone(),
            release,
            ssh_user,
            cli_image: crate::default_cli_image(),
            nodes: nodes.into_values().collect(),
        },
        group: GroupConfig {
            name: group_name,
            pool,
            gateways: gateway_hosts.iter().map(|h| node_id(h)).collect(),
            subsystems: subsystems.unwrap_or_else(|| vec![skeleton_subsystem()]),
            gw_port: 5500,
            mtls: false,
        },
        initiators: args
            .initiators
            .iter()
            .map(|h| InitiatorConfig { node: node_id(h) })
            .collect(),
        auth: AuthConfig::default(),
        io: IoConfig::default(),
        ha: HaConfig::default(),
        steps: vec![Step::Configure, Step::Connect, Step::RunIo { negative: false }],
        cleanup: Vec::new(),
    };

    let rendered = toml::to_string_pretty(&config)
        .handle_err(|e| eprintln!("Could not render the config: {e}"))?;
    println!("{rendered}");
    Ok(())
}

fn node_id(hostname: &str) -> String {
    hostname.split('.').next().unwrap_or(hostname).to_string()
}

async fn resolve_addr(exec: &dyn Executor, through: &Node, hostname: &str) -> String {
    match through.run(exec, &format!("getent hosts {hostname}")).await {
        Ok(out) => out
            .stdout
            .split_whitespace()
            .next()
            .unwrap_or(hostname)
            .to_string(),
        Err(err) => {
            warn!("could not resolve {hostname}: {err}; using the hostname as addr");
            hostname.to_string()
        }
    }
}

/// Pool and group from `orch ls`, falling back to placeholders when no
/// nvmeof service exists yet.
async fn find_service(orch: &Orch) -> (String, String) {
    let fallback = ("rbd".to_string(), "group1".to_string());
    let raw = match orch
        .ceph(&["orch", "ls", "--service-type", "nvmeof", "--format", "json"])
        .await
    {
        Ok(raw) => raw,
        Err(err) => {
            debug!("no nvmeof service listing: {err}");
            return fallback;
        }
    };
    let services: Vec<ServiceEntry> = match parse_json("orch ls nvmeof", &raw) {
        Ok(services) => services,
        Err(err) => {
            debug!("unparseable service listing: {err}");
            return fallback;
        }
    };
    match services.first() {
        // "nvmeof.<pool>" or "nvmeof.<pool>.<group>"
        Some(entry) => {
            let mut parts = entry.service_name.splitn(3, '.');
            let _ = parts.next();
            let pool = parts.next().unwrap_or("rbd").to_string();
            let group = parts.next().unwrap_or("group1").to_string();
            (pool, group)
        }
        None => fallback,
    }
}

async fn probe_subsystems(
    exec: &Arc<dyn Executor>,
    dialect: &Arc<dyn Dialect>,
    hostname: &str,
    addr: &str,
) -> Option<Vec<SubsystemConfig>> {
    let node = Node::new(&node_id(hostname), hostname, addr);
    let cli = GwCli::new(
        exec.clone(),
        dialect.clone(),
        node,
        &crate::default_cli_image(),
        5500,
    );
    match cli.subsystem_list().await {
        Ok(listed) if !listed.is_empty() => Some(
            listed
                .iter()
                .enumerate()
                .map(|(idx, info)| SubsystemConfig {
                    nqn: info.nqn.clone(),
                    serial: idx as u32 + 1,
                    listener_port: 4420,
                    max_namespaces: info.max_namespaces.unwrap_or(400),
                    allow_any_host: true,
                    hosts: Vec::new(),
                    namespaces: info.namespace_count.unwrap_or(0),
                    image_size: "1G".to_string(),
                })
                .collect(),
        ),
        Ok(_) => None,
        Err(err) => {
            debug!("no subsystem listing from {hostname}: {err}");
            None
        }
    }
}

fn skeleton_subsystem() -> SubsystemConfig {
    SubsystemConfig {
        nqn: "nqn.2016-06.io.spdk:cnode1".to_string(),
        serial: 1,
        listener_port: 4420,
        max_namespaces: 400,
        allow_any_host: true,
        hosts: Vec::new(),
        namespaces: 4,
        image_size: "1G".to_string(),
    }
}
