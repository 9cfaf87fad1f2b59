// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Typed facade over the NVMe-oF gateway CLI. One `GwCli` exists per
//! gateway and runs the CLI container on that gateway's node, pointed at
//! the local gRPC endpoint. Release differences (report format, service
//! naming, CLI invocation) live behind the `Dialect` chosen when the
//! cluster is assembled.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::ana::{self, AnaReport};
use crate::config::Release;
use crate::node::Node;
use crate::remote::{parse_json, ExecError, Executor};

/// Release-dependent shape of the cluster interfaces. One implementation
/// per supported release range, selected once at construction.
pub trait Dialect: Send + Sync + fmt::Debug {
    /// Orchestrator service name for a gateway deployment.
    fn service_name(&self, pool: &str, group: &str) -> String;
    /// Arguments for `ceph orch apply nvmeof`.
    fn apply_args(&self, pool: &str, group: &str, placement: &[String]) -> Vec<String>;
    /// Arguments for `ceph nvme-gw show`.
    fn show_args(&self, pool: &str, group: &str) -> Vec<String>;
    /// Service spec document for `ceph orch apply -i`, the only apply form
    /// that can switch on mTLS.
    fn service_spec(&self, pool: &str, group: &str, placement: &[String]) -> String;
    /// Parse the ANA report this release emits.
    fn parse_ana_report(&self, raw: &str) -> Result<AnaReport, ExecError>;
    /// Base command for the gateway CLI on a gateway node.
    fn cli_base(&self, image: &str, addr: &str, port: u16) -> String;
    /// Extra flags for `subsystem add`.
    fn subsystem_add_flags(&self) -> &'static [&'static str];
}

/// 7.x: ungrouped services, fragment report, `--output json`.
#[derive(Debug)]
pub struct Reef;

/// 8.x and later: gateway groups, JSON report, `--format json`.
#[derive(Debug)]
pub struct Squid;

impl Dialect for Reef {
    fn service_name(&self, pool: &str, _group: &str) -> String {
        format!("nvmeof.{pool}")
    }

    fn apply_args(&self, pool: &str, _group: &str, placement: &[String]) -> Vec<String> {
        vec![
            "orch".to_string(),
            "apply".to_string(),
            "nvmeof".to_string(),
            pool.to_string(),
            format!("--placement={}", placement.join(",")),
        ]
    }

    fn show_args(&self, pool: &str, _group: &str) -> Vec<String> {
        // The group argument exists but must be passed empty.
        vec![
            "nvme-gw".to_string(),
            "show".to_string(),
            pool.to_string(),
            "''".to_string(),
        ]
    }

    fn service_spec(&self, pool: &str, _group: &str, placement: &[String]) -> String {
        let mut lines = vec![
            "service_type: nvmeof".to_string(),
            format!("service_id: {pool}"),
            "mtls: true".to_string(),
            "placement:".to_string(),
            "  hosts:".to_string(),
        ];
        lines.extend(placement.iter().map(|host| format!("  - {host}")));
        lines.push("spec:".to_string());
        lines.push(format!("  pool: {pool}"));
        lines.push("  enable_auth: true".to_string());
        lines.join("\n")
    }

    fn parse_ana_report(&self, raw: &str) -> Result<AnaReport, ExecError> {
        ana::parse_report_fragments(raw)
    }

    fn cli_base(&self, image: &str, addr: &str, port: u16) -> String {
        format!("podman run --quiet --rm {image} --server-address {addr} --server-port {port} --output json")
    }

    fn subsystem_add_flags(&self) -> &'static [&'static str] {
        &[]
    }
}

impl Dialect for Squid {
    fn service_name(&self, pool: &str, group: &str) -> String {
        format!("nvmeof.{pool}.{group}")
    }

    fn apply_args(&self, pool: &str, group: &str, placement: &[String]) -> Vec<String> {
        vec![
            "orch".to_string(),
            "apply".to_string(),
            "nvmeof".to_string(),
            pool.to_string(),
            group.to_string(),
            format!("--placement={}", placement.join(",")),
        ]
    }

    fn show_args(&self, pool: &str, group: &str) -> Vec<String> {
        vec![
            "nvme-gw".to_string(),
            "show".to_string(),
            pool.to_string(),
            group.to_string(),
        ]
    }

    fn service_spec(&self, pool: &str, group: &str, placement: &[String]) -> String {
        let mut lines = vec![
            "service_type: nvmeof".to_string(),
            format!("service_id: {pool}.{group}"),
            "mtls: true".to_string(),
            "placement:".to_string(),
            "  hosts:".to_string(),
        ];
        lines.extend(placement.iter().map(|host| format!("  - {host}")));
        lines.push("spec:".to_string());
        lines.push(format!("  pool: {pool}"));
        lines.push(format!("  group: {group}"));
        lines.push("  enable_auth: true".to_string());
        lines.join("\n")
    }

    fn parse_ana_report(&self, raw: &str) -> Result<AnaReport, ExecError> {
        ana::parse_report_json(raw)
    }

    fn cli_base(&self, image: &str, addr: &str, port: u16) -> String {
        format!("podman run --quiet --rm {image} --server-address {addr} --server-port {port} --format json")
    }

    fn subsystem_add_flags(&self) -> &'static [&'static str] {
        &["--no-group-append"]
    }
}

pub fn dialect_for(release: Release) -> Arc<dyn Dialect> {
    match release {
        Release::Reef => Arc::new(Reef),
        Release::Squid => Arc::new(Squid),
    }
}

/// Subsystem entry from `subsystem list`.
#[derive(Deserialize, Debug, Clone)]
pub struct SubsystemInfo {
    #[serde(default)]
    pub nqn: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub max_namespaces: Option<u32>,
    #[serde(default)]
    pub namespace_count: Option<u32>,
}

#[derive(Deserialize, Debug, Default)]
struct SubsystemListOut {
    #[serde(default)]
    subsystems: Vec<SubsystemInfo>,
}

/// Namespace entry from `namespace list`.
#[derive(Deserialize, Debug, Clone)]
pub struct NamespaceInfo {
    pub nsid: u32,
    #[serde(default)]
    pub rbd_image_name: String,
    #[serde(default)]
    pub rbd_pool_name: String,
    #[serde(default)]
    pub load_balancing_group: u32,
    #[serde(default = "default_true")]
    pub auto_visible: bool,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub rw_ios_per_second: Option<u64>,
    #[serde(default)]
    pub rw_mbytes_per_second: Option<u64>,
    #[serde(default)]
    pub r_mbytes_per_second: Option<u64>,
    #[serde(default)]
    pub w_mbytes_per_second: Option<u64>,
}

#[derive(Deserialize, Debug, Default)]
struct NamespaceListOut {
    #[serde(default)]
    namespaces: Vec<NamespaceInfo>,
}

fn default_true() -> bool {
    true
}

/// QoS limits the CLI can set on a namespace. Flag names spell
/// "megabytes"; the listing reports the same values as "mbytes" fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QosSpec {
    pub rw_ios_per_second: Option<u64>,
    pub rw_mbytes_per_second: Option<u64>,
    pub r_mbytes_per_second: Option<u64>,
    pub w_mbytes_per_second: Option<u64>,
}

impl QosSpec {
    pub fn as_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let flags = [
            ("--rw-ios-per-second", self.rw_ios_per_second),
            ("--rw-megabytes-per-second", self.rw_mbytes_per_second),
            ("--r-megabytes-per-second", self.r_mbytes_per_second),
            ("--w-megabytes-per-second", self.w_mbytes_per_second),
        ];
        for (flag, value) in flags {
            if let Some(v) = value {
                args.push(flag.to_string());
                args.push(v.to_string());
            }
        }
        args
    }

    pub fn is_empty(&self) -> bool {
        self.as_args().is_empty()
    }
}

/// Replies from mutating commands carry a status and error message.
#[derive(Deserialize, Default)]
struct ReplyStatus {
    #[serde(default)]
    status: Option<i64>,
    #[serde(default)]
    error_message: Option<String>,
}

fn check_reply(cmd: &str, raw: &str) -> Result<(), ExecError> {
    let Ok(reply) = serde_json::from_str::<ReplyStatus>(raw) else {
        return Ok(());
    };
    match reply.status {
        Some(code) if code != 0 => Err(ExecError::Failed {
            cmd: cmd.to_string(),
            status: Some(code as i32),
            stderr: reply.error_message.unwrap_or_default(),
        }),
        _ => Ok(()),
    }
}

/// Values passed through a remote shell get quoted; "*" is a legal host.
fn shq(s: &str) -> String {
    format!("'{s}'")
}

/// Command handle for one gateway.
#[derive(Debug, Clone)]
pub struct GwCli {
    exec: Arc<dyn Executor>,
    dialect: Arc<dyn Dialect>,
    node: Node,
    image: String,
    port: u16,
}

impl GwCli {
    pub fn new(
        exec: Arc<dyn Executor>,
        dialect: Arc<dyn Dialect>,
        node: Node,
        image: &str,
        port: u16,
    ) -> Self {
        GwCli {
            exec,
            dialect,
            node,
            image: image.to_string(),
            port,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    fn command(&self, args: &[String]) -> String {
        format!(
            "{} {}",
            self.dialect.cli_base(&self.image, &self.node.addr, self.port),
            args.join(" ")
        )
    }

    async fn call(&self, args: &[String]) -> Result<String, ExecError> {
        let cmd = self.command(args);
        let out = self.exec.run(&self.node.hostname, &cmd).await?;
        check_reply(&cmd, &out.stdout)?;
        Ok(out.stdout)
    }

    pub async fn subsystem_add(&self, nqn: &str, max_namespaces: u32) -> Result<(), ExecError> {
        let mut args = vec![
            "subsystem".to_string(),
            "add".to_string(),
            "--subsystem".to_string(),
            nqn.to_string(),
            "--max-namespaces".to_string(),
            max_namespaces.to_string(),
        ];
        args.extend(
            self.dialect
                .subsystem_add_flags()
                .iter()
                .map(|s| s.to_string()),
        );
        self.call(&args).await.map(|_| ())
    }

    pub async fn subsystem_list(&self) -> Result<Vec<SubsystemInfo>, ExecError> {
        let args = vec!["subsystem".to_string(), "list".to_string()];
        let cmd = self.command(&args);
        let raw = self.call(&args).await?;
        Ok(parse_json::<SubsystemListOut>(&cmd, &raw)?.subsystems)
    }

    pub async fn subsystem_del(&self, nqn: &str, force: bool) -> Result<(), ExecError> {
        let mut args = vec![
            "subsystem".to_string(),
            "del".to_string(),
            "--subsystem".to_string(),
            nqn.to_string(),
        ];
        if force {
            args.push("--force".to_string());
        }
        self.call(&args).await.map(|_| ())
    }

    pub async fn subsystem_change_key(&self, nqn: &str, key: &str) -> Result<(), ExecError> {
        let args = vec![
            "subsystem".to_string(),
            "change_key".to_string(),
            "--subsystem".to_string(),
            nqn.to_string(),
            "--dhchap-key".to_string(),
            shq(key),
        ];
        self.call(&args).await.map(|_| ())
    }

    pub async fn host_add(
        &self,
        subsystem: &str,
        host: &str,
        dhchap_key: Option<&str>,
    ) -> Result<(), ExecError> {
        let mut args = vec![
            "host".to_string(),
            "add".to_string(),
            "--subsystem".to_string(),
            subsystem.to_string(),
            "--host".to_string(),
            shq(host),
        ];
        if let Some(key) = dhchap_key {
            args.push("--dhchap-key".to_string());
            args.push(shq(key));
        }
        self.call(&args).await.map(|_| ())
    }

    pub async fn host_change_key(
        &self,
        subsystem: &str,
        host: &str,
        key: &str,
    ) -> Result<(), ExecError> {
        let args = vec![
            "host".to_string(),
            "change_key".to_string(),
            "--subsystem".to_string(),
            subsystem.to_string(),
            "--host".to_string(),
            shq(host),
            "--dhchap-key".to_string(),
            shq(key),
        ];
        self.call(&args).await.map(|_| ())
    }

    pub async fn namespace_add(
        &self,
        subsystem: &str,
        pool: &str,
        image: &str,
        size: &str,
        load_balancing_group: Option<u32>,
        no_auto_visible: bool,
    ) -> Result<(), ExecError> {
        let mut args = vec![
            "namespace".to_string(),
            "add".to_string(),
            "--subsystem".to_string(),
            subsystem.to_string(),
            "--rbd-pool".to_string(),
            pool.to_string(),
            "--rbd-image".to_string(),
            image.to_string(),
            "--rbd-create-image".to_string(),
            "--size".to_string(),
            size.to_string(),
        ];
        if let Some(group) = load_balancing_group {
            args.push("--load-balancing-group".to_string());
            args.push(group.to_string());
        }
        if no_auto_visible {
            args.push("--no-auto-visible".to_string());
        }
        self.call(&args).await.map(|_| ())
    }

    pub async fn namespace_list(&self, subsystem: &str) -> Result<Vec<NamespaceInfo>, ExecError> {
        let args = vec![
            "namespace".to_string(),
            "list".to_string(),
            "--subsystem".to_string(),
            subsystem.to_string(),
        ];
        let cmd = self.command(&args);
        let raw = self.call(&args).await?;
        Ok(parse_json::<NamespaceListOut>(&cmd, &raw)?.namespaces)
    }

    pub async fn namespace_add_host(
        &self,
        subsystem: &str,
        nsid: u32,
        host: &str,
    ) -> Result<(), ExecError> {
        let args = vec![
            "namespace".to_string(),
            "add_host".to_string(),
            "--subsystem".to_string(),
            subsystem.to_string(),
            "--nsid".to_string(),
            nsid.to_string(),
            "--host".to_string(),
            shq(host),
        ];
        self.call(&args).await.map(|_| ())
    }

    pub async fn namespace_del_host(
        &self,
        subsystem: &str,
        nsid: u32,
        host: &str,
    ) -> Result<(), ExecError> {
        let args = vec![
            "namespace".to_string(),
            "del_host".to_string(),
            "--subsystem".to_string(),
            subsystem.to_string(),
            "--nsid".to_string(),
            nsid.to_string(),
            "--host".to_string(),
            shq(host),
        ];
        self.call(&args).await.map(|_| ())
    }

    pub async fn namespace_change_visibility(
        &self,
        subsystem: &str,
        nsid: u32,
        auto_visible: bool,
        force: bool,
    ) -> Result<(), ExecError> {
        let mut args = vec![
            "namespace".to_string(),
            "change_visibility".to_string(),
            "--subsystem".to_string(),
            subsystem.to_string(),
            "--nsid".to_string(),
            nsid.to_string(),
            "--auto-visible".to_string(),
            auto_visible.to_string(),
        ];
        if force {
            args.push("--force".to_string());
        }
        self.call(&args).await.map(|_| ())
    }

    pub async fn namespace_set_qos(
        &self,
        subsystem: &str,
        nsid: u32,
        qos: &QosSpec,
    ) -> Result<(), ExecError> {
        let mut args = vec![
            "namespace".to_string(),
            "set_qos".to_string(),
            "--subsystem".to_string(),
            subsystem.to_string(),
            "--nsid".to_string(),
            nsid.to_string(),
        ];
        args.extend(qos.as_args());
        self.call(&args).await.map(|_| ())
    }

    pub async fn listener_add(
        &self,
        subsystem: &str,
        gw_hostname: &str,
        traddr: &str,
        trsvcid: u16,
    ) -> Result<(), ExecError> {
        let args = vec![
            "listener".to_string(),
            "add".to_string(),
            "--subsystem".to_string(),
            subsystem.to_string(),
            "--host-name".to_string(),
            gw_hostname.to_string(),
            "--traddr".to_string(),
            traddr.to_string(),
            "--trsvcid".to_string(),
            trsvcid.to_string(),
        ];
        self.call(&args).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialects_disagree_on_service_naming() {
        assert_eq!(Squid.service_name("rbd", "group1"), "nvmeof.rbd.group1");
        assert_eq!(Reef.service_name("rbd", "group1"), "nvmeof.rbd");
    }

    #[test]
    fn squid_apply_includes_the_group() {
        let placement = vec!["node6".to_string(), "node7".to_string()];
        let args = Squid.apply_args("rbd", "group1", &placement);
        assert_eq!(
            args,
            vec!["orch", "apply", "nvmeof", "rbd", "group1", "--placement=node6,node7"]
        );
        let args = Reef.apply_args("rbd", "group1", &placement);
        assert!(!args.contains(&"group1".to_string()));
    }

    #[test]
    fn cli_base_output_flag_differs() {
        let squid = Squid.cli_base("img", "10.0.0.1", 5500);
        let reef = Reef.cli_base("img", "10.0.0.1", 5500);
        assert!(squid.ends_with("--format json"));
        assert!(reef.ends_with("--output json"));
    }

    #[test]
    fn qos_args_spell_megabytes() {
        let qos = QosSpec {
            rw_ios_per_second: Some(2000),
            rw_mbytes_per_second: None,
            r_mbytes_per_second: Some(20),
            w_mbytes_per_second: None,
        };
        assert_eq!(
            qos.as_args(),
            vec!["--rw-ios-per-second", "2000", "--r-megabytes-per-second", "20"]
        );
    }

    #[test]
    fn reply_status_failures_surface() {
        assert!(check_reply("cmd", "{\"status\": 0, \"error_message\": \"success\"}").is_ok());
        assert!(check_reply("cmd", "{\"subsystems\": []}").is_ok());
        assert!(check_reply("cmd", "not json at all").is_ok());
        let err = check_reply("cmd", "{\"status\": 2, \"error_message\": \"no such subsystem\"}")
            .unwrap_err();
        assert!(err.to_string().contains("no such subsystem"));
    }

    #[test]
    fn wildcard_hosts_are_quoted() {
        assert_eq!(shq("*"), "'*'");
    }
}
