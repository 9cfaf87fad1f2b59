// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Thin facade over the Ceph orchestrator and rbd CLIs, run through
//! `cephadm shell` on the installer node. No logic of its own beyond
//! argument shaping and output parsing.

use std::sync::Arc;

use log::info;
use serde::Deserialize;

use crate::gwcli::Dialect;
use crate::node::Node;
use crate::remote::{parse_json, ExecError, Executor};

/// One nvmeof daemon as listed by `ceph orch ps`.
#[derive(Deserialize, Debug, Clone)]
pub struct DaemonInfo {
    #[serde(default)]
    pub daemon_name: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub status_desc: String,
}

impl DaemonInfo {
    pub fn running(&self) -> bool {
        self.status_desc == "running"
    }
}

#[derive(Deserialize, Debug)]
struct RbdDuImage {
    #[serde(default)]
    used_size: u64,
}

#[derive(Deserialize, Debug, Default)]
struct RbdDuOut {
    #[serde(default)]
    images: Vec<RbdDuImage>,
    #[serde(default)]
    total_used_size: u64,
}

fn parse_rbd_du(cmd: &str, raw: &str) -> Result<u64, ExecError> {
    let du: RbdDuOut = parse_json(cmd, raw)?;
    if du.images.is_empty() && du.total_used_size == 0 {
        return Err(ExecError::parse(cmd, "du listed no images"));
    }
    Ok(du.total_used_size)
}

#[derive(Debug, Clone)]
pub struct Orch {
    exec: Arc<dyn Executor>,
    dialect: Arc<dyn Dialect>,
    installer: Node,
}

impl Orch {
    pub fn new(exec: Arc<dyn Executor>, dialect: Arc<dyn Dialect>, installer: Node) -> Self {
        Orch {
            exec,
            dialect,
            installer,
        }
    }

    /// Run an arbitrary command inside `cephadm shell` on the installer.
    pub async fn shell(&self, args: &[String]) -> Result<String, ExecError> {
        let cmd = format!("cephadm shell -- {}", args.join(" "));
        Ok(self
            .exec
            .run(&self.installer.hostname, &cmd)
            .await?
            .stdout)
    }

    pub async fn ceph(&self, args: &[&str]) -> Result<String, ExecError> {
        let mut full = vec!["ceph".to_string()];
        full.extend(args.iter().map(|s| s.to_string()));
        self.shell(&full).await
    }

    /// Deploy the nvmeof service for a pool/group onto the given hosts.
    pub async fn apply(
        &self,
        pool: &str,
        group: &str,
        placement: &[String],
    ) -> Result<(), ExecError> {
        let mut args = vec!["ceph".to_string()];
        args.extend(self.dialect.apply_args(pool, group, placement));
        info!(
            "deploying {} on {}",
            self.dialect.service_name(pool, group),
            placement.join(",")
        );
        self.shell(&args).await.map(|_| ())
    }

    /// Deploy from a rendered service spec fed to `orch apply -i` on
    /// stdin.
    pub async fn apply_spec(&self, spec: &str) -> Result<(), ExecError> {
        let cmd = format!("echo '{spec}' | cephadm shell -- ceph orch apply -i -");
        self.exec
            .run(&self.installer.hostname, &cmd)
            .await
            .map(|_| ())
    }

    pub async fn remove_service(&self, pool: &str, group: &str) -> Result<(), ExecError> {
        let service = self.dialect.service_name(pool, group);
        info!("removing service {service}");
        self.ceph(&["orch", "rm", &service]).await.map(|_| ())
    }

    /// All nvmeof daemons the orchestrator knows about.
    pub async fn daemons(&self) -> Result<Vec<DaemonInfo>, ExecError> {
        let raw = self
            .ceph(&["orch", "ps", "--daemon-type", "nvmeof", "--format", "json"])
            .await?;
        parse_json("ceph orch ps", &raw)
    }

    /// `ceph orch daemon <start|stop|restart> <daemon>`.
    pub async fn daemon_action(&self, action: &str, daemon: &str) -> Result<(), ExecError> {
        self.ceph(&["orch", "daemon", action, daemon])
            .await
            .map(|_| ())
    }

    /// Fresh ANA report for the group, parsed per the release dialect.
    pub async fn ana_report(
        &self,
        pool: &str,
        group: &str,
    ) -> Result<crate::ana::AnaReport, ExecError> {
        let args: Vec<String> = std::iter::once("ceph".to_string())
            .chain(self.dialect.show_args(pool, group))
            .collect();
        let raw = self.shell(&args).await?;
        self.dialect.parse_ana_report(&raw)
    }

    /// Cumulative usage of a backing image in bytes.
    pub async fn rbd_du(&self, pool: &str, image: &str) -> Result<u64, ExecError> {
        let spec = format!("{pool}/{image}");
        let args: Vec<String> = ["rbd", "du", "--format", "json", &spec]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let raw = self.shell(&args).await?;
        parse_rbd_du(&format!("rbd du {spec}"), &raw)
    }

    pub async fn delete_pool(&self, pool: &str) -> Result<(), ExecError> {
        self.ceph(&[
            "osd",
            "pool",
            "delete",
            pool,
            pool,
            "--yes-i-really-really-mean-it",
        ])
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rbd_du_output() {
        let raw = r#"{
            "images": [
                {"name": "img1", "provisioned_size": 1073741824, "used_size": 209715200}
            ],
            "total_provisioned_size": 1073741824,
            "total_used_size": 209715200
        }"#;
        assert_eq!(parse_rbd_du("rbd du", raw).unwrap(), 209715200);
    }

    #[test]
    fn empty_du_is_an_error() {
        let raw = r#"{"images": [], "total_provisioned_size": 0, "total_used_size": 0}"#;
        assert!(parse_rbd_du("rbd du", raw).is_err());
    }

    #[test]
    fn parses_daemon_listing() {
        let raw = r#"[
            {"daemon_name": "nvmeof.rbd.group1.node6.abcdef", "daemon_type": "nvmeof",
             "hostname": "ceph-node6", "status": 1, "status_desc": "running"},
            {"daemon_name": "nvmeof.rbd.group1.node7.ghijkl", "daemon_type": "nvmeof",
             "hostname": "ceph-node7", "status": 0, "status_desc": "stopped"}
        ]"#;
        let daemons: Vec<DaemonInfo> = parse_json("ceph orch ps", raw).unwrap();
        assert_eq!(daemons.len(), 2);
        assert!(daemons[0].running());
        assert!(!daemons[1].running());
    }
}
