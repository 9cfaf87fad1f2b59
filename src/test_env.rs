// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Test support: an in-process `Executor` that emulates the whole test bed.
//!
//! `MockCluster` answers every remote command the workflows issue, from
//! `cephadm shell` and the gateway CLI container down to `nvme list` and
//! `fio` on the initiators, against one shared in-memory model. Tests drive
//! the real workflow code against it and then inspect the model or the
//! command history.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::config::{
    AuthConfig, AuthMode, CleanupItem, ClusterConfig, Config, GroupConfig, HaConfig,
    InitiatorConfig, IoConfig, NodeConfig, Release, SubsystemConfig,
};
use crate::remote::{ExecError, Executor, RawOutput};

/// Given a relative `path` in the test directory, prepend the
/// full path to the test directory.
fn test_path(path: &str) -> String {
    std::env::var("CARGO_MANIFEST_DIR").unwrap() + "/tests/" + path
}

/// A fresh statefile path for a test named `test_id`. Leftovers from a
/// previous run are removed so every run starts from an empty journal.
pub fn statefile(test_id: &str) -> String {
    std::fs::create_dir_all(test_path("test_output")).unwrap();
    let path = test_path(&format!("test_output/{test_id}.state"));
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => panic!("could not clean up statefile '{path}': {e}"),
    }
    path
}

/// The standard test bed config: one installer, two gateways, two
/// initiators, two subsystems with two namespaces each. Timings are dialed
/// down so polls and retries resolve within a test run.
pub fn config() -> Config {
    let node = |id: &str, hostname: &str, addr: &str| NodeConfig {
        id: id.to_string(),
        hostname: hostname.to_string(),
        addr: addr.to_string(),
    };
    let subsystem = |n: u32| SubsystemConfig {
        nqn: format!("nqn.2016-06.io.spdk:cnode{n}"),
        serial: n,
        listener_port: 4420,
        max_namespaces: 16,
        allow_any_host: true,
        hosts: Vec::new(),
        namespaces: 2,
        image_size: "1G".to_string(),
    };
    Config {
        cluster: ClusterConfig {
            installer: "node1".to_string(),
            release: Release::Squid,
            ssh_user: "root".to_string(),
            cli_image: "quay.io/ceph/nvmeof-cli:latest".to_string(),
            nodes: vec![
                node("node1", "ceph-node1", "10.0.210.11"),
                node("node6", "ceph-node6", "10.0.210.16"),
                node("node7", "ceph-node7", "10.0.210.17"),
                node("node10", "ceph-node10", "10.0.210.20"),
                node("node11", "ceph-node11", "10.0.210.21"),
            ],
        },
        group: GroupConfig {
            name: "group1".to_string(),
            pool: "rbd".to_string(),
            gateways: vec!["node6".to_string(), "node7".to_string()],
            subsystems: vec![subsystem(1), subsystem(2)],
            gw_port: 5500,
            mtls: false,
        },
        initiators: vec![
            InitiatorConfig {
                node: "node10".to_string(),
            },
            InitiatorConfig {
                node: "node11".to_string(),
            },
        ],
        auth: AuthConfig {
            mode: AuthMode::None,
            update_dhchap_key: false,
        },
        io: IoConfig {
            fio_runtime_secs: 5,
            sample_interval_secs: 0,
            retries: 2,
            retry_delay_secs: 0,
            workers: 2,
        },
        ha: HaConfig {
            method: crate::config::FaultMethod::Systemctl,
            poll_attempts: 5,
            poll_delay_secs: 0,
        },
        steps: Vec::new(),
        cleanup: vec![CleanupItem::Initiators, CleanupItem::Subsystems],
    }
}

struct MockGateway {
    node_id: String,
    hostname: String,
    addr: String,
    daemon: String,
    ana_group_id: u32,
    up: bool,
}

struct MockInitiator {
    hostname: String,
    nqn: String,
    /// Subsystem NQNs this host currently has controllers for.
    connected: HashSet<String>,
}

struct HostGrant {
    nqn: String,
    key: Option<String>,
}

struct MockNamespace {
    nsid: u32,
    pool: String,
    image: String,
    lb_group: u32,
    auto_visible: bool,
    hosts: Vec<String>,
    used_bytes: u64,
    writing: bool,
    rw_ios_per_second: Option<u64>,
    rw_mbytes_per_second: Option<u64>,
    r_mbytes_per_second: Option<u64>,
    w_mbytes_per_second: Option<u64>,
}

struct MockSubsystem {
    nqn: String,
    serial_number: String,
    max_namespaces: u32,
    dhchap_key: Option<String>,
    hosts: Vec<HostGrant>,
    namespaces: Vec<MockNamespace>,
}

struct MockState {
    release: Release,
    pool: String,
    group: String,
    nodes: Vec<NodeConfig>,
    installer: String,
    gateways: Vec<MockGateway>,
    initiators: Vec<MockInitiator>,
    subsystems: Vec<MockSubsystem>,
    listeners: HashMap<(String, String), u16>,
    deployed: bool,
    serial_seq: u32,
    keys_generated: u32,
    tree_listing: bool,
    usage_frozen: bool,
    commands: Vec<(String, String)>,
}

/// Backing images start with a little allocated so `rbd du` never reports
/// an empty image, and grow by this much per poll while writes run.
const BASE_USED: u64 = 4 << 20;
const GROWTH: u64 = 1 << 20;

/// In-memory stand-in for every node of the test bed.
pub struct MockCluster {
    state: Mutex<MockState>,
}

impl std::fmt::Debug for MockCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "MockCluster")
    }
}

#[async_trait]
impl Executor for MockCluster {
    async fn exec(&self, hostname: &str, cmd: &str) -> Result<RawOutput, ExecError> {
        let mut state = self.state.lock().unwrap();
        state.commands.push((hostname.to_string(), cmd.to_string()));
        Ok(state.dispatch(hostname, cmd))
    }
}

impl MockCluster {
    /// Build a mock matching `config`'s topology, with the nvmeof service
    /// already deployed and every gateway up.
    pub fn from_config(config: &Config) -> Self {
        let node = |id: &str| {
            config
                .cluster
                .nodes
                .iter()
                .find(|n| n.id == id)
                .unwrap_or_else(|| panic!("config has no node '{id}'"))
        };
        let gateways = config
            .group
            .gateways
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let n = node(id);
                let label = n.hostname.split('.').next().unwrap().to_string();
                let daemon = match config.cluster.release {
                    Release::Reef => format!("nvmeof.{}.{label}.mk{i:02}", config.group.pool),
                    Release::Squid => format!(
                        "nvmeof.{}.{}.{label}.mk{i:02}",
                        config.group.pool, config.group.name
                    ),
                };
                MockGateway {
                    node_id: id.clone(),
                    hostname: n.hostname.clone(),
                    addr: n.addr.clone(),
                    daemon,
                    ana_group_id: i as u32 + 1,
                    up: true,
                }
            })
            .collect();
        let initiators = config
            .initiators
            .iter()
            .enumerate()
            .map(|(i, conf)| MockInitiator {
                hostname: node(&conf.node).hostname.clone(),
                nqn: format!("nqn.2014-08.org.nvmexpress:uuid:0000-{:04}", i + 1),
                connected: HashSet::new(),
            })
            .collect();
        MockCluster {
            state: Mutex::new(MockState {
                release: config.cluster.release,
                pool: config.group.pool.clone(),
                group: config.group.name.clone(),
                nodes: config.cluster.nodes.clone(),
                installer: node(&config.cluster.installer).hostname.clone(),
                gateways,
                initiators,
                subsystems: Vec::new(),
                listeners: HashMap::new(),
                deployed: true,
                serial_seq: 0,
                keys_generated: 0,
                tree_listing: false,
                usage_frozen: false,
                commands: Vec::new(),
            }),
        }
    }

    /// Every command issued so far, as (hostname, command) pairs.
    pub fn history(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Commands matching a substring, in issue order.
    pub fn commands_containing(&self, needle: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(_, cmd)| cmd.contains(needle))
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    pub fn is_up(&self, node_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .gateways
            .iter()
            .find(|gw| gw.node_id == node_id)
            .map(|gw| gw.up)
            .unwrap_or(false)
    }

    pub fn namespace_count(&self, nqn: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .subsystems
            .iter()
            .find(|sub| sub.nqn == nqn)
            .map(|sub| sub.namespaces.len())
            .unwrap_or(0)
    }

    /// Render `nvme list` in the nested per-subsystem layout newer
    /// nvme-cli releases emit.
    pub fn use_tree_listing(&self) {
        self.state.lock().unwrap().tree_listing = true;
    }

    /// Stop backing images from growing even while fio jobs run, so usage
    /// watches see a stall.
    pub fn freeze_usage(&self) {
        self.state.lock().unwrap().usage_frozen = true;
    }
}

/// Build a mock from `config` and connect a `Cluster` against it. The
/// mock handle stays available for knobs and history checks.
pub async fn mock_cluster(config: Config) -> (std::sync::Arc<MockCluster>, crate::cluster::Cluster) {
    let mock = std::sync::Arc::new(MockCluster::from_config(&config));
    let exec: std::sync::Arc<dyn Executor> = mock.clone();
    let cluster = crate::cluster::Cluster::connect(config, exec)
        .await
        .expect("mock cluster connect");
    (mock, cluster)
}

fn ok(stdout: impl Into<String>) -> RawOutput {
    RawOutput {
        status: Some(0),
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn fail(status: i32, stderr: impl Into<String>) -> RawOutput {
    RawOutput {
        status: Some(status),
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

/// The gateway CLI reports command errors in its reply rather than its
/// exit status.
fn reply_ok() -> RawOutput {
    ok(r#"{"status": 0, "error_message": "success"}"#)
}

fn reply_err(message: &str) -> RawOutput {
    ok(json!({"status": 2, "error_message": message}).to_string())
}

fn opt(tokens: &[&str], flag: &str) -> Option<String> {
    tokens
        .iter()
        .position(|t| *t == flag)
        .and_then(|i| tokens.get(i + 1))
        .map(|v| v.trim_matches('\'').to_string())
}

fn switch(tokens: &[&str], flag: &str) -> bool {
    tokens.contains(&flag)
}

/// Device paths encode the subsystem's position and the NSID:
/// "/dev/nvme3n2" is subsystem index 2, nsid 2.
fn parse_device(path: &str) -> Option<(usize, u32)> {
    let rest = path.trim().strip_prefix("/dev/nvme")?;
    let (ctrl, nsid) = rest.split_once('n')?;
    Some((ctrl.parse().ok()?, nsid.parse().ok()?))
}

impl MockNamespace {
    fn visible_to(&self, hostnqn: &str) -> bool {
        self.auto_visible || self.hosts.iter().any(|h| h == hostnqn)
    }
}

impl MockState {
    fn dispatch(&mut self, hostname: &str, cmd: &str) -> RawOutput {
        if let Some(rest) = cmd.strip_prefix("cephadm shell -- ") {
            if hostname != self.installer {
                return fail(127, format!("{hostname}: cephadm: command not found"));
            }
            return self.cephadm(rest);
        }
        if let Some((input, rest)) = cmd.split_once(" | cephadm shell -- ") {
            if hostname != self.installer {
                return fail(127, format!("{hostname}: cephadm: command not found"));
            }
            let doc = input
                .strip_prefix("echo '")
                .and_then(|s| s.strip_suffix('\''))
                .unwrap_or(input);
            return self.cephadm_stdin(doc, rest);
        }
        if cmd.starts_with("podman run --quiet --rm ") {
            return self.gateway_cli(hostname, cmd);
        }
        self.node_command(hostname, cmd)
    }

    fn serving_gateway(&self, ana_group_id: u32) -> Option<&MockGateway> {
        let owner = self
            .gateways
            .iter()
            .find(|gw| gw.ana_group_id == ana_group_id)?;
        if owner.up {
            return Some(owner);
        }
        self.gateways
            .iter()
            .filter(|gw| gw.up)
            .min_by_key(|gw| gw.ana_group_id)
    }

    fn next_lb_group(&self) -> u32 {
        let total: usize = self
            .subsystems
            .iter()
            .map(|sub| sub.namespaces.len())
            .sum();
        let count = self.gateways.len().max(1);
        (total % count) as u32 + 1
    }

    // -- cephadm shell ----------------------------------------------------

    fn cephadm(&mut self, cmd: &str) -> RawOutput {
        let tokens: Vec<&str> = cmd.split_whitespace().collect();
        match tokens.as_slice() {
            ["ceph", "orch", "apply", "nvmeof", ..] => {
                self.deployed = true;
                for gw in &mut self.gateways {
                    gw.up = true;
                }
                ok("Scheduled nvmeof update...\n")
            }
            ["ceph", "orch", "rm", _service] => {
                self.deployed = false;
                self.subsystems.clear();
                self.listeners.clear();
                for gw in &mut self.gateways {
                    gw.up = false;
                }
                ok("Removed service\n")
            }
            ["ceph", "orch", "ps", "--daemon-type", "nvmeof", "--format", "json"] => {
                if !self.deployed {
                    return ok("[]");
                }
                let daemons: Vec<_> = self
                    .gateways
                    .iter()
                    .map(|gw| {
                        json!({
                            "daemon_name": gw.daemon,
                            "daemon_type": "nvmeof",
                            "hostname": gw.hostname,
                            "status_desc": if gw.up { "running" } else { "stopped" },
                        })
                    })
                    .collect();
                ok(json!(daemons).to_string())
            }
            ["ceph", "orch", "ls", "--service-type", "nvmeof", "--format", "json"] => {
                if !self.deployed {
                    return ok("[]");
                }
                let name = match self.release {
                    Release::Reef => format!("nvmeof.{}", self.pool),
                    Release::Squid => format!("nvmeof.{}.{}", self.pool, self.group),
                };
                ok(json!([{"service_name": name}]).to_string())
            }
            ["ceph", "orch", "daemon", action, daemon] => {
                let Some(gw) = self.gateways.iter_mut().find(|gw| gw.daemon == *daemon) else {
                    return fail(2, format!("Error ENOENT: daemon {daemon} not found"));
                };
                gw.up = matches!(*action, "start" | "restart");
                ok("")
            }
            ["ceph", "nvme-gw", "show", _pool, _group] => {
                if !self.deployed {
                    return fail(2, "Error ENOENT: nvmeof service not found");
                }
                let report = self.render_ana_report();
                ok(report)
            }
            ["ceph", "osd", "pool", "delete", pool, _, "--yes-i-really-really-mean-it"] => {
                ok(format!("pool '{pool}' removed\n"))
            }
            ["ceph", ..] => ok("cluster ok\n"),
            ["rbd", "du", "--format", "json", spec] => self.rbd_du(spec),
            _ => fail(127, format!("cephadm: unhandled command '{cmd}'")),
        }
    }

    /// `cephadm shell` invocations fed a document on stdin.
    fn cephadm_stdin(&mut self, doc: &str, cmd: &str) -> RawOutput {
        if cmd != "ceph orch apply -i -" {
            return fail(127, format!("cephadm: unhandled command '{cmd}'"));
        }
        if !doc.contains("service_type: nvmeof") {
            return fail(22, "Error EINVAL: unrecognized service spec");
        }
        self.deployed = true;
        for gw in &mut self.gateways {
            gw.up = true;
        }
        ok("Scheduled nvmeof update...\n")
    }

    fn render_ana_report(&self) -> String {
        let group_ids: Vec<u32> = self.gateways.iter().map(|gw| gw.ana_group_id).collect();
        let entries: Vec<serde_json::Value> = self
            .gateways
            .iter()
            .map(|gw| {
                let states: Vec<String> = group_ids
                    .iter()
                    .map(|gid| {
                        let serving = gw.up
                            && self
                                .serving_gateway(*gid)
                                .map(|s| s.node_id == gw.node_id)
                                .unwrap_or(false);
                        let state = if serving { "ACTIVE" } else { "STANDBY" };
                        format!(" {gid}: {state} ")
                    })
                    .collect();
                json!({
                    "gw-id": format!("client.{}", gw.daemon),
                    "anagrp-id": gw.ana_group_id,
                    "performed-full-startup": 1,
                    "Availability": if gw.up { "AVAILABLE" } else { "UNAVAILABLE" },
                    "ana states": states.join(","),
                })
            })
            .collect();
        match self.release {
            Release::Squid => json!({ "Created Gateways:": entries }).to_string(),
            Release::Reef => {
                let mut out = format!("num gws {}\n", entries.len());
                for entry in entries {
                    out.push_str(&entry.to_string());
                    out.push('\n');
                }
                out
            }
        }
    }

    fn rbd_du(&mut self, spec: &str) -> RawOutput {
        let Some((pool, image)) = spec.split_once('/') else {
            return fail(2, format!("rbd: invalid spec '{spec}'"));
        };
        let found = self.subsystems.iter().enumerate().find_map(|(si, sub)| {
            sub.namespaces
                .iter()
                .position(|ns| ns.pool == pool && ns.image == image)
                .map(|ni| (si, ni))
        });
        let Some((si, ni)) = found else {
            return fail(
                2,
                format!("rbd: error opening image {image}: (2) No such file or directory"),
            );
        };
        // Writes land only while some connected host can still see the
        // namespace; fio against a masked-away device goes nowhere.
        let reachable = {
            let sub = &self.subsystems[si];
            let ns = &sub.namespaces[ni];
            self.initiators
                .iter()
                .any(|ini| ini.connected.contains(&sub.nqn) && ns.visible_to(&ini.nqn))
        };
        let frozen = self.usage_frozen;
        let ns = &mut self.subsystems[si].namespaces[ni];
        if ns.writing && reachable && !frozen {
            ns.used_bytes += GROWTH;
        }
        ok(json!({
            "images": [{"name": image, "provisioned_size": 1 << 30, "used_size": ns.used_bytes}],
            "total_provisioned_size": 1 << 30,
            "total_used_size": ns.used_bytes,
        })
        .to_string())
    }

    // -- gateway CLI ------------------------------------------------------

    fn gateway_cli(&mut self, hostname: &str, cmd: &str) -> RawOutput {
        let up = self
            .gateways
            .iter()
            .find(|gw| gw.hostname == hostname)
            .map(|gw| gw.up);
        match up {
            Some(true) => {}
            Some(false) => return fail(1, format!("{hostname}: gateway gRPC is not listening")),
            None => return fail(1, format!("{hostname} runs no gateway")),
        }
        // Everything after the output-format flag is the CLI invocation.
        let args = ["--format json ", "--output json "]
            .iter()
            .find_map(|marker| cmd.split_once(marker).map(|(_, rest)| rest));
        let Some(args) = args else {
            return fail(2, "gateway CLI called without an output format");
        };
        let tokens: Vec<&str> = args.split_whitespace().collect();
        match tokens.as_slice() {
            ["subsystem", "add", ..] => self.subsystem_add(&tokens),
            ["subsystem", "list"] => self.subsystem_list(),
            ["subsystem", "del", ..] => self.subsystem_del(&tokens),
            ["subsystem", "change_key", ..] => self.subsystem_change_key(&tokens),
            ["host", "add", ..] => self.host_add(&tokens),
            ["host", "change_key", ..] => self.host_change_key(&tokens),
            ["namespace", "add", ..] => self.namespace_add(&tokens),
            ["namespace", "list", ..] => self.namespace_list(&tokens),
            ["namespace", "add_host", ..] => self.namespace_grant(&tokens, true),
            ["namespace", "del_host", ..] => self.namespace_grant(&tokens, false),
            ["namespace", "change_visibility", ..] => self.namespace_change_visibility(&tokens),
            ["namespace", "set_qos", ..] => self.namespace_set_qos(&tokens),
            ["listener", "add", ..] => self.listener_add(&tokens),
            _ => reply_err(&format!("unknown gateway command: {args}")),
        }
    }

    fn subsystem(&mut self, tokens: &[&str]) -> Result<&mut MockSubsystem, RawOutput> {
        let Some(nqn) = opt(tokens, "--subsystem") else {
            return Err(reply_err("--subsystem is required"));
        };
        self.subsystems
            .iter_mut()
            .find(|sub| sub.nqn == nqn)
            .ok_or_else(|| reply_err(&format!("no subsystem {nqn}")))
    }

    fn subsystem_add(&mut self, tokens: &[&str]) -> RawOutput {
        let Some(nqn) = opt(tokens, "--subsystem") else {
            return reply_err("--subsystem is required");
        };
        if self.subsystems.iter().any(|sub| sub.nqn == nqn) {
            return reply_err(&format!("subsystem {nqn} already exists"));
        }
        self.serial_seq += 1;
        self.subsystems.push(MockSubsystem {
            nqn,
            serial_number: format!("Ceph{:011}", self.serial_seq),
            max_namespaces: opt(tokens, "--max-namespaces")
                .and_then(|v| v.parse().ok())
                .unwrap_or(400),
            dhchap_key: None,
            hosts: Vec::new(),
            namespaces: Vec::new(),
        });
        reply_ok()
    }

    fn subsystem_list(&self) -> RawOutput {
        let subsystems: Vec<_> = self
            .subsystems
            .iter()
            .map(|sub| {
                json!({
                    "nqn": sub.nqn,
                    "serial_number": sub.serial_number,
                    "max_namespaces": sub.max_namespaces,
                    "namespace_count": sub.namespaces.len(),
                })
            })
            .collect();
        ok(json!({ "subsystems": subsystems }).to_string())
    }

    fn subsystem_del(&mut self, tokens: &[&str]) -> RawOutput {
        let force = switch(tokens, "--force");
        let nqn = match self.subsystem(tokens) {
            Ok(sub) => {
                if !sub.namespaces.is_empty() && !force {
                    return reply_err("subsystem has namespaces; use --force");
                }
                sub.nqn.clone()
            }
            Err(out) => return out,
        };
        self.subsystems.retain(|sub| sub.nqn != nqn);
        self.listeners.retain(|(_, s), _| *s != nqn);
        reply_ok()
    }

    fn subsystem_change_key(&mut self, tokens: &[&str]) -> RawOutput {
        let key = opt(tokens, "--dhchap-key");
        match self.subsystem(tokens) {
            Ok(sub) => {
                sub.dhchap_key = key;
                reply_ok()
            }
            Err(out) => out,
        }
    }

    fn host_add(&mut self, tokens: &[&str]) -> RawOutput {
        let Some(host) = opt(tokens, "--host") else {
            return reply_err("--host is required");
        };
        let key = opt(tokens, "--dhchap-key");
        match self.subsystem(tokens) {
            Ok(sub) => {
                sub.hosts.retain(|grant| grant.nqn != host);
                sub.hosts.push(HostGrant { nqn: host, key });
                reply_ok()
            }
            Err(out) => out,
        }
    }

    fn host_change_key(&mut self, tokens: &[&str]) -> RawOutput {
        let Some(host) = opt(tokens, "--host") else {
            return reply_err("--host is required");
        };
        let key = opt(tokens, "--dhchap-key");
        match self.subsystem(tokens) {
            Ok(sub) => match sub.hosts.iter_mut().find(|grant| grant.nqn == host) {
                Some(grant) => {
                    grant.key = key;
                    reply_ok()
                }
                None => reply_err(&format!("host {host} was never added")),
            },
            Err(out) => out,
        }
    }

    fn namespace_add(&mut self, tokens: &[&str]) -> RawOutput {
        let pool = opt(tokens, "--rbd-pool").unwrap_or_default();
        let image = opt(tokens, "--rbd-image").unwrap_or_default();
        let lb_group = opt(tokens, "--load-balancing-group")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| self.next_lb_group());
        let no_auto_visible = switch(tokens, "--no-auto-visible");
        match self.subsystem(tokens) {
            Ok(sub) => {
                if sub.namespaces.len() as u32 >= sub.max_namespaces {
                    return reply_err("subsystem is at max-namespaces");
                }
                let nsid = sub.namespaces.iter().map(|ns| ns.nsid).max().unwrap_or(0) + 1;
                sub.namespaces.push(MockNamespace {
                    nsid,
                    pool,
                    image,
                    lb_group,
                    auto_visible: !no_auto_visible,
                    hosts: Vec::new(),
                    used_bytes: BASE_USED,
                    writing: false,
                    rw_ios_per_second: None,
                    rw_mbytes_per_second: None,
                    r_mbytes_per_second: None,
                    w_mbytes_per_second: None,
                });
                reply_ok()
            }
            Err(out) => out,
        }
    }

    fn namespace_list(&mut self, tokens: &[&str]) -> RawOutput {
        match self.subsystem(tokens) {
            Ok(sub) => {
                let namespaces: Vec<_> = sub
                    .namespaces
                    .iter()
                    .map(|ns| {
                        json!({
                            "nsid": ns.nsid,
                            "rbd_image_name": ns.image,
                            "rbd_pool_name": ns.pool,
                            "load_balancing_group": ns.lb_group,
                            "auto_visible": ns.auto_visible,
                            "hosts": ns.hosts,
                            "rw_ios_per_second": ns.rw_ios_per_second,
                            "rw_mbytes_per_second": ns.rw_mbytes_per_second,
                            "r_mbytes_per_second": ns.r_mbytes_per_second,
                            "w_mbytes_per_second": ns.w_mbytes_per_second,
                        })
                    })
                    .collect();
                ok(json!({ "namespaces": namespaces }).to_string())
            }
            Err(out) => out,
        }
    }

    fn namespace<'a>(
        sub: &'a mut MockSubsystem,
        tokens: &[&str],
    ) -> Result<&'a mut MockNamespace, RawOutput> {
        let nsid: u32 = match opt(tokens, "--nsid").and_then(|v| v.parse().ok()) {
            Some(nsid) => nsid,
            None => return Err(reply_err("--nsid is required")),
        };
        sub.namespaces
            .iter_mut()
            .find(|ns| ns.nsid == nsid)
            .ok_or_else(|| reply_err(&format!("no namespace {nsid}")))
    }

    fn namespace_grant(&mut self, tokens: &[&str], grant: bool) -> RawOutput {
        let Some(host) = opt(tokens, "--host") else {
            return reply_err("--host is required");
        };
        let sub = match self.subsystem(tokens) {
            Ok(sub) => sub,
            Err(out) => return out,
        };
        let ns = match Self::namespace(sub, tokens) {
            Ok(ns) => ns,
            Err(out) => return out,
        };
        if ns.auto_visible {
            return reply_err("namespace is auto-visible");
        }
        if grant {
            if ns.hosts.contains(&host) {
                return reply_err(&format!("host {host} is already added"));
            }
            ns.hosts.push(host);
        } else {
            if !ns.hosts.contains(&host) {
                return reply_err(&format!("host {host} was never added"));
            }
            ns.hosts.retain(|h| *h != host);
        }
        reply_ok()
    }

    fn namespace_change_visibility(&mut self, tokens: &[&str]) -> RawOutput {
        let auto_visible = match opt(tokens, "--auto-visible").as_deref() {
            Some("true") => true,
            Some("false") => false,
            _ => return reply_err("--auto-visible must be true or false"),
        };
        let force = switch(tokens, "--force");
        let sub = match self.subsystem(tokens) {
            Ok(sub) => sub,
            Err(out) => return out,
        };
        let ns = match Self::namespace(sub, tokens) {
            Ok(ns) => ns,
            Err(out) => return out,
        };
        if auto_visible && !ns.hosts.is_empty() && !force {
            return reply_err("namespace has hosts added; use --force");
        }
        ns.auto_visible = auto_visible;
        if auto_visible {
            ns.hosts.clear();
        }
        reply_ok()
    }

    fn namespace_set_qos(&mut self, tokens: &[&str]) -> RawOutput {
        let iops = opt(tokens, "--rw-ios-per-second").and_then(|v| v.parse().ok());
        let rw = opt(tokens, "--rw-megabytes-per-second").and_then(|v| v.parse().ok());
        let r = opt(tokens, "--r-megabytes-per-second").and_then(|v| v.parse().ok());
        let w = opt(tokens, "--w-megabytes-per-second").and_then(|v| v.parse().ok());
        let sub = match self.subsystem(tokens) {
            Ok(sub) => sub,
            Err(out) => return out,
        };
        let ns = match Self::namespace(sub, tokens) {
            Ok(ns) => ns,
            Err(out) => return out,
        };
        // The gateway rounds IOPS limits up to the next multiple of 1000.
        if let Some(iops) = iops {
            ns.rw_ios_per_second = Some(crate::qos::round_up_iops(iops));
        }
        if let Some(rw) = rw {
            ns.rw_mbytes_per_second = Some(rw);
        }
        if let Some(r) = r {
            ns.r_mbytes_per_second = Some(r);
        }
        if let Some(w) = w {
            ns.w_mbytes_per_second = Some(w);
        }
        reply_ok()
    }

    fn listener_add(&mut self, tokens: &[&str]) -> RawOutput {
        let Some(nqn) = opt(tokens, "--subsystem") else {
            return reply_err("--subsystem is required");
        };
        let Some(gw_hostname) = opt(tokens, "--host-name") else {
            return reply_err("--host-name is required");
        };
        let port: u16 = opt(tokens, "--trsvcid")
            .and_then(|v| v.parse().ok())
            .unwrap_or(4420);
        if !self.subsystems.iter().any(|sub| sub.nqn == nqn) {
            return reply_err(&format!("no subsystem {nqn}"));
        }
        self.listeners.insert((gw_hostname, nqn), port);
        reply_ok()
    }

    // -- initiator and plain node commands --------------------------------

    fn node_command(&mut self, hostname: &str, cmd: &str) -> RawOutput {
        if cmd == "cat /etc/nvme/hostnqn" {
            return match self.initiators.iter().find(|i| i.hostname == hostname) {
                Some(initiator) => ok(format!("{}\n", initiator.nqn)),
                None => fail(1, "cat: /etc/nvme/hostnqn: No such file or directory"),
            };
        }
        if cmd.starts_with("nvme discover") {
            let tokens: Vec<&str> = cmd.split_whitespace().collect();
            let addr = opt(&tokens, "-a").unwrap_or_default();
            return match self.gateways.iter().find(|gw| gw.addr == addr) {
                Some(gw) if gw.up => ok("Discovery Log Number of Records 2\n"),
                _ => fail(1, format!("Failed to connect to {addr}: Connection refused")),
            };
        }
        if cmd.starts_with("nvme connect-all") || cmd.starts_with("nvme connect ") {
            return self.nvme_connect(hostname, cmd);
        }
        if cmd == "nvme disconnect-all" {
            if let Some(initiator) = self.initiators.iter_mut().find(|i| i.hostname == hostname) {
                initiator.connected.clear();
            }
            return ok("");
        }
        if cmd == "nvme list --output-format=json" {
            return self.nvme_list(hostname);
        }
        if cmd.starts_with("nvme list-subsys") {
            let device = cmd
                .split_whitespace()
                .nth(2)
                .unwrap_or_default()
                .to_string();
            return self.nvme_list_subsys(hostname, &device);
        }
        if cmd.starts_with("nvme gen-dhchap-key") {
            self.keys_generated += 1;
            return ok(format!("DHHC-1:00:mockkey{:04}:\n", self.keys_generated));
        }
        if cmd == "lsblk -I 8,259 -o name,wwn --json" {
            return self.lsblk(hostname);
        }
        if cmd.starts_with("fio ") {
            return self.fio(hostname, cmd);
        }
        if cmd.starts_with("iostat ") {
            return self.iostat(hostname, cmd);
        }
        if cmd.starts_with("systemctl ") {
            return self.systemctl(hostname, cmd);
        }
        if cmd == "uptime" {
            return ok(" 12:00:00 up 42 days,  1 user,  load average: 0.10, 0.10, 0.10\n");
        }
        if cmd == "free -m" {
            return ok("              total        used        free\nMem:          64000        8000       56000\n");
        }
        if let Some(host) = cmd.strip_prefix("getent hosts ") {
            let label = host.trim().split('.').next().unwrap_or(host);
            return match self
                .nodes
                .iter()
                .find(|n| n.hostname.split('.').next() == Some(label))
            {
                Some(n) => ok(format!("{} {}\n", n.addr, n.hostname)),
                None => fail(2, ""),
            };
        }
        fail(127, format!("{hostname}: unhandled command '{cmd}'"))
    }

    fn nvme_connect(&mut self, hostname: &str, cmd: &str) -> RawOutput {
        let tokens: Vec<&str> = cmd.split_whitespace().collect();
        let addr = opt(&tokens, "-a").unwrap_or_default();
        let host_secret = opt(&tokens, "--dhchap-secret");
        let ctrl_secret = opt(&tokens, "--dhchap-ctrl-secret");
        let one = opt(&tokens, "-n");

        let Some(gw) = self.gateways.iter().find(|gw| gw.addr == addr) else {
            return fail(1, format!("Failed to connect to {addr}: No route to host"));
        };
        if !gw.up {
            return fail(1, format!("Failed to connect to {addr}: Connection refused"));
        }
        let gw_hostname = gw.hostname.clone();
        let hostnqn = match self.initiators.iter().find(|i| i.hostname == hostname) {
            Some(initiator) => initiator.nqn.clone(),
            None => return fail(1, format!("{hostname} is not an initiator")),
        };

        let targets: Vec<String> = match &one {
            Some(nqn) => vec![nqn.clone()],
            None => self.subsystems.iter().map(|sub| sub.nqn.clone()).collect(),
        };
        let mut connected = Vec::new();
        for nqn in targets {
            let Some(sub) = self.subsystems.iter().find(|sub| sub.nqn == nqn) else {
                return fail(1, format!("no controller found for subsystem {nqn}"));
            };
            if one.is_some() && !self.listeners.contains_key(&(gw_hostname.clone(), nqn.clone())) {
                return fail(1, format!("connect to {nqn} at {addr}: Connection refused"));
            }
            let grant = sub
                .hosts
                .iter()
                .find(|grant| grant.nqn == "*" || grant.nqn == hostnqn);
            let Some(grant) = grant else {
                if one.is_some() {
                    return fail(1, "could not add new controller: access denied");
                }
                continue;
            };
            if grant.key.is_some() && grant.key.as_deref() != host_secret.as_deref() {
                return fail(1, "could not add new controller: authentication failed");
            }
            if let (Some(want), Some(got)) = (sub.dhchap_key.as_deref(), ctrl_secret.as_deref()) {
                if want != got {
                    return fail(1, "could not add new controller: authentication failed");
                }
            }
            connected.push(nqn);
        }
        let initiator = self
            .initiators
            .iter_mut()
            .find(|i| i.hostname == hostname)
            .unwrap();
        initiator.connected.extend(connected);
        ok("")
    }

    /// Devices an initiator currently exposes: (subsystem index, serial,
    /// nsid) per visible namespace of every connected subsystem.
    fn devices_on(&self, hostname: &str) -> Vec<(usize, String, u32)> {
        let Some(initiator) = self.initiators.iter().find(|i| i.hostname == hostname) else {
            return Vec::new();
        };
        let mut devices = Vec::new();
        for (si, sub) in self.subsystems.iter().enumerate() {
            if !initiator.connected.contains(&sub.nqn) {
                continue;
            }
            for ns in &sub.namespaces {
                if ns.visible_to(&initiator.nqn) {
                    devices.push((si + 1, sub.serial_number.clone(), ns.nsid));
                }
            }
        }
        devices
    }

    fn nvme_list(&self, hostname: &str) -> RawOutput {
        let devices = self.devices_on(hostname);
        if devices.is_empty() {
            return ok("{}");
        }
        if self.tree_listing {
            let mut subsystems: HashMap<usize, (String, Vec<serde_json::Value>)> = HashMap::new();
            for (ctrl, serial, nsid) in devices {
                subsystems
                    .entry(ctrl)
                    .or_insert_with(|| (serial, Vec::new()))
                    .1
                    .push(json!({"NameSpace": format!("nvme{ctrl}n{nsid}"), "NSID": nsid}));
            }
            let mut entries: Vec<_> = subsystems.into_iter().collect();
            entries.sort_by_key(|(ctrl, _)| *ctrl);
            let subsystems: Vec<_> = entries
                .into_iter()
                .map(|(ctrl, (serial, namespaces))| {
                    json!({
                        "Subsystem": format!("nvme-subsys{ctrl}"),
                        "Controllers": [{"Controller": format!("nvme{ctrl}"), "SerialNumber": serial}],
                        "Namespaces": namespaces,
                    })
                })
                .collect();
            return ok(json!({"Devices": [{"Subsystems": subsystems}]}).to_string());
        }
        let entries: Vec<_> = devices
            .into_iter()
            .map(|(ctrl, serial, nsid)| {
                json!({
                    "NameSpace": nsid,
                    "DevicePath": format!("/dev/nvme{ctrl}n{nsid}"),
                    "ModelNumber": "Ceph bdev Controller",
                    "SerialNumber": serial,
                    "PhysicalSize": 1u64 << 30,
                })
            })
            .collect();
        ok(json!({ "Devices": entries }).to_string())
    }

    fn nvme_list_subsys(&self, hostname: &str, device: &str) -> RawOutput {
        let Some((ctrl, nsid)) = parse_device(device) else {
            return fail(1, format!("cannot parse device '{device}'"));
        };
        let Some(sub) = self.subsystems.get(ctrl - 1) else {
            return fail(1, format!("{device}: no such device"));
        };
        let Some(ns) = sub.namespaces.iter().find(|ns| ns.nsid == nsid) else {
            return fail(1, format!("{device}: no such device"));
        };
        let serving = self.serving_gateway(ns.lb_group).map(|gw| gw.node_id.clone());
        let paths: Vec<_> = self
            .gateways
            .iter()
            .filter(|gw| {
                self.listeners
                    .contains_key(&(gw.hostname.clone(), sub.nqn.clone()))
            })
            .map(|gw| {
                let port = self.listeners[&(gw.hostname.clone(), sub.nqn.clone())];
                let optimized = serving.as_deref() == Some(gw.node_id.as_str());
                json!({
                    "Name": format!("nvme{}", gw.ana_group_id),
                    "Transport": "tcp",
                    "Address": format!("traddr={},trsvcid={port}", gw.addr),
                    "State": if gw.up { "live" } else { "connecting" },
                    "ANAState": if optimized { "optimized" } else { "inaccessible" },
                })
            })
            .collect();
        let hostnqn = self
            .initiators
            .iter()
            .find(|i| i.hostname == hostname)
            .map(|i| i.nqn.clone())
            .unwrap_or_default();
        ok(json!([{
            "HostNQN": hostnqn,
            "Subsystems": [{"Name": format!("nvme-subsys{ctrl}"), "NQN": sub.nqn, "Paths": paths}],
        }])
        .to_string())
    }

    fn lsblk(&self, hostname: &str) -> RawOutput {
        let mut entries = vec![json!({"name": "sda", "wwn": null})];
        for (ctrl, serial, nsid) in self.devices_on(hostname) {
            entries.push(json!({
                "name": format!("nvme{ctrl}n{nsid}"),
                "wwn": format!("uuid.{}-{nsid}", serial.to_lowercase()),
            }));
        }
        ok(json!({ "blockdevices": entries }).to_string())
    }

    fn fio(&mut self, hostname: &str, cmd: &str) -> RawOutput {
        let filename = cmd
            .split_whitespace()
            .find_map(|t| t.strip_prefix("--filename="))
            .unwrap_or_default()
            .to_string();
        let visible = self
            .devices_on(hostname)
            .into_iter()
            .any(|(ctrl, _, nsid)| format!("/dev/nvme{ctrl}n{nsid}") == filename);
        if !visible {
            return fail(
                1,
                format!("fio: file:filesetup.c: {filename}: No such file or directory"),
            );
        }
        let (ctrl, nsid) = parse_device(&filename).unwrap();
        let ns = self.subsystems[ctrl - 1]
            .namespaces
            .iter_mut()
            .find(|ns| ns.nsid == nsid)
            .unwrap();
        ns.writing = true;
        ok("fio: job completed\n")
    }

    fn iostat(&self, hostname: &str, cmd: &str) -> RawOutput {
        let device = cmd.split_whitespace().nth(5).unwrap_or_default();
        let name = device.trim_start_matches("/dev/");
        let parsed = parse_device(device);
        let visible = parsed
            .map(|(ctrl, nsid)| {
                self.devices_on(hostname)
                    .into_iter()
                    .any(|(c, _, n)| c == ctrl && n == nsid)
            })
            .unwrap_or(false);
        if !visible {
            return fail(1, format!("iostat: cannot find disk data for {name}"));
        }
        let (ctrl, nsid) = parsed.unwrap();
        let ns = self.subsystems[ctrl - 1]
            .namespaces
            .iter()
            .find(|ns| ns.nsid == nsid)
            .unwrap();
        // Writes run at the tightest cap, or at 90 MB/s unthrottled.
        let cap = ns
            .w_mbytes_per_second
            .into_iter()
            .chain(ns.rw_mbytes_per_second)
            .min();
        let rate = match (ns.writing, cap) {
            (false, _) => 0.0,
            (true, Some(mb)) => (mb * 1024) as f64,
            (true, None) => 92160.0,
        };
        let sample = |kb: f64| json!({"disk": [{"disk_device": name, "kB_wrtn/s": kb, "kB_read/s": 0.0}]});
        ok(json!({
            "sysstat": {"hosts": [{"nodename": hostname, "statistics": [sample(rate * 1.5), sample(rate)]}]}
        })
        .to_string())
    }

    fn systemctl(&mut self, hostname: &str, cmd: &str) -> RawOutput {
        let tokens: Vec<&str> = cmd.split_whitespace().collect();
        let verb = tokens.get(1).copied().unwrap_or_default();
        let unit = tokens.get(2).copied().unwrap_or_default().trim_matches('\'');
        let daemon = unit
            .strip_prefix("ceph-*@")
            .and_then(|u| u.strip_suffix(".service"))
            .unwrap_or_default()
            .to_string();
        let gw = self
            .gateways
            .iter_mut()
            .find(|gw| gw.hostname == hostname && gw.daemon == daemon);
        match (gw, verb) {
            (Some(gw), "stop") => {
                gw.up = false;
                ok("")
            }
            (Some(gw), "start" | "restart") => {
                gw.up = true;
                ok("")
            }
            (Some(_), other) => fail(1, format!("systemctl: unknown verb '{other}'")),
            (None, _) => fail(4, format!("Unit ceph-*@{daemon}.service not loaded")),
        }
    }
}
