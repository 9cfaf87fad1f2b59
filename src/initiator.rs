// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Client-host model: connects to gateways, enumerates the devices the OS
//! actually exposes, and reads per-path ANA state back from nvme-cli.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

use log::{debug, info};
use serde::Deserialize;

use crate::check::{ensure, WorkflowError};
use crate::node::Node;
use crate::remote::{parse_json, ExecError, Executor};

/// Discovery service port exposed by every gateway.
pub const DISCOVERY_PORT: u16 = 8009;

/// Keep reconnect attempts going through long failover windows.
const CTRL_LOSS_TMO: u32 = 3600;

#[derive(Debug, Clone)]
pub enum ConnectMode {
    /// `nvme connect-all` against the discovery service.
    All,
    /// Connect one explicit subsystem/port pair.
    One { subsystem: String, port: u16 },
}

/// Everything one connect call needs; secrets are filled in per the
/// configured auth mode (host key only for unidirectional, both for
/// bidirectional).
#[derive(Debug, Clone)]
pub struct ConnectSpec {
    pub traddr: String,
    pub mode: ConnectMode,
    pub host_key: Option<String>,
    pub ctrl_key: Option<String>,
}

impl ConnectSpec {
    pub fn all(traddr: &str) -> Self {
        ConnectSpec {
            traddr: traddr.to_string(),
            mode: ConnectMode::All,
            host_key: None,
            ctrl_key: None,
        }
    }
}

/// A namespace block device as the initiator's OS sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvmeDevice {
    pub path: String,
    pub nsid: u32,
    /// Subsystem serial number, the key that maps a device back to the
    /// subsystem it came from.
    pub serial: String,
}

/// Addresses reported per path for one device, bucketed by ANA state. A
/// path counts as optimized only when it is live and ANA-optimized;
/// everything else, a downed gateway's connecting path included, is
/// inaccessible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathStates {
    pub optimized: Vec<String>,
    pub inaccessible: Vec<String>,
}

#[derive(Debug)]
pub struct Initiator {
    pub node: Node,
    exec: Arc<dyn Executor>,
    nqn: OnceLock<String>,
}

impl Initiator {
    pub fn new(node: Node, exec: Arc<dyn Executor>) -> Self {
        Initiator {
            node,
            exec,
            nqn: OnceLock::new(),
        }
    }

    /// The host NQN this node connects with. Read once from the node.
    pub async fn hostnqn(&self) -> Result<String, ExecError> {
        if let Some(nqn) = self.nqn.get() {
            return Ok(nqn.clone());
        }
        let out = self
            .node
            .run(self.exec.as_ref(), "cat /etc/nvme/hostnqn")
            .await?;
        let nqn = out.stdout.trim().to_string();
        if nqn.is_empty() {
            return Err(ExecError::parse("cat /etc/nvme/hostnqn", "empty hostnqn"));
        }
        let _ = self.nqn.set(nqn.clone());
        Ok(nqn)
    }

    pub async fn discover(&self, traddr: &str) -> Result<(), ExecError> {
        let cmd = format!("nvme discover -t tcp -a {traddr} -s {DISCOVERY_PORT}");
        let out = self.node.run(self.exec.as_ref(), &cmd).await?;
        debug!("{}: discovery:\n{}", self.node.id, out.stdout.trim_end());
        Ok(())
    }

    /// Discover and connect. Either connects every discovered subsystem or
    /// one explicit target, attaching DHCHAP secrets when configured.
    pub async fn connect_targets(&self, spec: &ConnectSpec) -> Result<(), ExecError> {
        self.discover(&spec.traddr).await?;
        let mut cmd = match &spec.mode {
            ConnectMode::All => format!(
                "nvme connect-all -t tcp -a {} -s {DISCOVERY_PORT}",
                spec.traddr
            ),
            ConnectMode::One { subsystem, port } => format!(
                "nvme connect -t tcp -a {} -s {port} -n {subsystem}",
                spec.traddr
            ),
        };
        cmd.push_str(&format!(" --ctrl-loss-tmo {CTRL_LOSS_TMO}"));
        if let Some(key) = &spec.host_key {
            cmd.push_str(&format!(" --dhchap-secret '{key}'"));
        }
        if let Some(key) = &spec.ctrl_key {
            cmd.push_str(&format!(" --dhchap-ctrl-secret '{key}'"));
        }
        info!("{}: connecting to {}", self.node.id, spec.traddr);
        self.node.run(self.exec.as_ref(), &cmd).await.map(|_| ())
    }

    /// Drop every nvme connection. Exit status is ignored; there may be
    /// nothing connected.
    pub async fn disconnect_all(&self) -> Result<(), ExecError> {
        self.exec
            .exec(&self.node.hostname, "nvme disconnect-all")
            .await
            .map(|_| ())
    }

    /// Namespace devices the OS currently exposes.
    pub async fn list_devices(&self) -> Result<Vec<NvmeDevice>, ExecError> {
        let cmd = "nvme list --output-format=json";
        let out = self.node.run(self.exec.as_ref(), cmd).await?;
        parse_nvme_list(cmd, &out.stdout)
    }

    /// Block devices with their WWNs, for sanity-checking fio targets.
    pub async fn block_devices(&self) -> Result<Vec<BlockDevice>, ExecError> {
        let cmd = "lsblk -I 8,259 -o name,wwn --json";
        let out = self.node.run(self.exec.as_ref(), cmd).await?;
        parse_lsblk(cmd, &out.stdout)
    }

    /// Per-path ANA state for one device.
    pub async fn fetch_anastate(&self, device: &str) -> Result<PathStates, ExecError> {
        let cmd = format!("nvme list-subsys {device} --output-format=json");
        let out = self.node.run(self.exec.as_ref(), &cmd).await?;
        parse_list_subsys(&cmd, &out.stdout)
    }

    /// Enforce the path invariants for one device: exactly one optimized
    /// path, at the expected gateway, and when a gateway was failed its
    /// address must be among the inaccessible paths.
    pub async fn validate_paths(
        &self,
        device: &str,
        expect_optimized: &str,
        expect_failed: Option<&str>,
    ) -> Result<(), WorkflowError> {
        let states = self.fetch_anastate(device).await?;
        ensure(states.optimized.len() == 1, || {
            format!(
                "{}: {device} reports {} optimized paths ({:?}), want exactly 1",
                self.node.id,
                states.optimized.len(),
                states.optimized
            )
        })?;
        ensure(states.optimized[0] == expect_optimized, || {
            format!(
                "{}: {device} optimized at {}, want {expect_optimized}",
                self.node.id, states.optimized[0]
            )
        })?;
        if let Some(failed) = expect_failed {
            ensure(states.inaccessible.iter().any(|addr| addr == failed), || {
                format!(
                    "{}: {device} does not list failed gateway {failed} as inaccessible ({:?})",
                    self.node.id, states.inaccessible
                )
            })?;
        }
        Ok(())
    }
}

impl fmt::Display for Initiator {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "initiator {}", self.node)
    }
}

/// NSIDs of a subsystem's devices present in a device listing.
pub fn visible_nsids(devices: &[NvmeDevice], serial: &str) -> HashSet<u32> {
    devices
        .iter()
        .filter(|dev| dev.serial == serial)
        .map(|dev| dev.nsid)
        .collect()
}

pub fn find_device<'a>(
    devices: &'a [NvmeDevice],
    serial: &str,
    nsid: u32,
) -> Option<&'a NvmeDevice> {
    devices
        .iter()
        .find(|dev| dev.serial == serial && dev.nsid == nsid)
}

#[derive(Deserialize)]
struct NvmeListOut {
    #[serde(rename = "Devices", default)]
    devices: Vec<DeviceEntry>,
}

/// nvme-cli changed its list layout: older releases emit a flat device
/// array, newer ones nest namespaces under subsystems. Both must parse.
#[derive(Deserialize)]
#[serde(untagged)]
enum DeviceEntry {
    Flat {
        #[serde(rename = "DevicePath")]
        path: String,
        #[serde(rename = "SerialNumber", default)]
        serial: String,
        #[serde(rename = "NameSpace", default)]
        nsid: u32,
    },
    Tree {
        #[serde(rename = "Subsystems", default)]
        subsystems: Vec<SubsysEntry>,
    },
}

#[derive(Deserialize)]
struct SubsysEntry {
    #[serde(rename = "Controllers", default)]
    controllers: Vec<CtrlEntry>,
    #[serde(rename = "Namespaces", default)]
    namespaces: Vec<NsEntry>,
}

#[derive(Deserialize)]
struct CtrlEntry {
    #[serde(rename = "SerialNumber", default)]
    serial: String,
}

#[derive(Deserialize)]
struct NsEntry {
    #[serde(rename = "NameSpace")]
    name: String,
    #[serde(rename = "NSID")]
    nsid: u32,
}

fn parse_nvme_list(cmd: &str, raw: &str) -> Result<Vec<NvmeDevice>, ExecError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: NvmeListOut = parse_json(cmd, raw)?;
    let mut devices = Vec::new();
    for entry in parsed.devices {
        match entry {
            DeviceEntry::Flat { path, serial, nsid } => {
                devices.push(NvmeDevice { path, nsid, serial })
            }
            DeviceEntry::Tree { subsystems } => {
                for sub in subsystems {
                    let serial = sub
                        .controllers
                        .first()
                        .map(|c| c.serial.clone())
                        .unwrap_or_default();
                    for ns in sub.namespaces {
                        devices.push(NvmeDevice {
                            path: format!("/dev/{}", ns.name),
                            nsid: ns.nsid,
                            serial: serial.clone(),
                        });
                    }
                }
            }
        }
    }
    Ok(devices)
}

#[derive(Deserialize, Debug, Clone)]
pub struct BlockDevice {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub wwn: Option<String>,
}

#[derive(Deserialize)]
struct LsblkOut {
    #[serde(default)]
    blockdevices: Vec<BlockDevice>,
}

fn parse_lsblk(cmd: &str, raw: &str) -> Result<Vec<BlockDevice>, ExecError> {
    Ok(parse_json::<LsblkOut>(cmd, raw)?.blockdevices)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListSubsysOut {
    Many(Vec<ListSubsysHost>),
    One(ListSubsysHost),
}

#[derive(Deserialize)]
struct ListSubsysHost {
    #[serde(rename = "Subsystems", default)]
    subsystems: Vec<SubsysPaths>,
}

#[derive(Deserialize)]
struct SubsysPaths {
    #[serde(rename = "Paths", default)]
    paths: Vec<PathEntry>,
}

#[derive(Deserialize)]
struct PathEntry {
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "ANAState", default)]
    ana_state: String,
}

fn parse_list_subsys(cmd: &str, raw: &str) -> Result<PathStates, ExecError> {
    let parsed: ListSubsysOut = parse_json(cmd, raw)?;
    let hosts = match parsed {
        ListSubsysOut::Many(hosts) => hosts,
        ListSubsysOut::One(host) => vec![host],
    };
    let mut states = PathStates::default();
    for host in hosts {
        for sub in host.subsystems {
            for path in sub.paths {
                let Some(addr) = parse_traddr(&path.address) else {
                    continue;
                };
                if path.state == "live" && path.ana_state == "optimized" {
                    states.optimized.push(addr);
                } else {
                    states.inaccessible.push(addr);
                }
            }
        }
    }
    Ok(states)
}

/// Pull the transport address out of an "traddr=...,trsvcid=..." string.
fn parse_traddr(address: &str) -> Option<String> {
    let rest = address.split("traddr=").nth(1)?;
    let addr: String = rest
        .chars()
        .take_while(|c| *c != ',' && !c.is_whitespace())
        .collect();
    (!addr.is_empty()).then_some(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLAT_LIST: &str = r#"{
        "Devices": [
            {"NameSpace": 1, "DevicePath": "/dev/nvme1n1", "Firmware": "25.01",
             "Index": 1, "ModelNumber": "Ceph bdev Controller",
             "SerialNumber": "Ceph30487335301", "UsedBytes": 0,
             "MaximumLBA": 2097152, "PhysicalSize": 1073741824, "SectorSize": 512},
            {"NameSpace": 2, "DevicePath": "/dev/nvme1n2", "Firmware": "25.01",
             "Index": 1, "ModelNumber": "Ceph bdev Controller",
             "SerialNumber": "Ceph30487335301", "UsedBytes": 0,
             "MaximumLBA": 2097152, "PhysicalSize": 1073741824, "SectorSize": 512}
        ]
    }"#;

    const TREE_LIST: &str = r#"{
        "Devices": [
            {
                "HostNQN": "nqn.2014-08.org.nvmexpress:uuid:1111",
                "HostID": "2222",
                "Subsystems": [
                    {
                        "Subsystem": "nvme-subsys1",
                        "SubsystemNQN": "nqn.2016-06.io.spdk:cnode1",
                        "Controllers": [
                            {"Controller": "nvme1", "SerialNumber": "Ceph30487335301",
                             "ModelNumber": "Ceph bdev Controller"}
                        ],
                        "Namespaces": [
                            {"NameSpace": "nvme1n1", "Generic": "ng1n1", "NSID": 1},
                            {"NameSpace": "nvme1n2", "Generic": "ng1n2", "NSID": 2}
                        ]
                    }
                ]
            }
        ]
    }"#;

    #[test]
    fn both_list_shapes_parse_to_the_same_devices() {
        let flat = parse_nvme_list("nvme list", FLAT_LIST).unwrap();
        let tree = parse_nvme_list("nvme list", TREE_LIST).unwrap();
        assert_eq!(flat, tree);
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].path, "/dev/nvme1n1");
        assert_eq!(flat[1].nsid, 2);
        assert_eq!(flat[0].serial, "Ceph30487335301");
    }

    #[test]
    fn empty_listing_means_no_devices() {
        assert!(parse_nvme_list("nvme list", "").unwrap().is_empty());
        assert!(parse_nvme_list("nvme list", "{}").unwrap().is_empty());
    }

    #[test]
    fn list_subsys_buckets_paths_by_ana_state() {
        let raw = r#"[
            {
                "HostNQN": "nqn.2014-08.org.nvmexpress:uuid:1111",
                "Subsystems": [
                    {
                        "Name": "nvme-subsys1",
                        "NQN": "nqn.2016-06.io.spdk:cnode1",
                        "Paths": [
                            {"Name": "nvme1", "Transport": "tcp",
                             "Address": "traddr=10.0.210.16,trsvcid=4420",
                             "State": "live", "ANAState": "optimized"},
                            {"Name": "nvme2", "Transport": "tcp",
                             "Address": "traddr=10.0.210.17,trsvcid=4420",
                             "State": "live", "ANAState": "inaccessible"},
                            {"Name": "nvme3", "Transport": "tcp",
                             "Address": "traddr=10.0.210.18,trsvcid=4420",
                             "State": "connecting", "ANAState": "optimized"}
                        ]
                    }
                ]
            }
        ]"#;
        let states = parse_list_subsys("nvme list-subsys", raw).unwrap();
        assert_eq!(states.optimized, vec!["10.0.210.16"]);
        // A connecting path never counts as optimized, whatever its ANA state.
        assert_eq!(states.inaccessible, vec!["10.0.210.17", "10.0.210.18"]);
    }

    #[test]
    fn traddr_parses_with_and_without_trailing_fields() {
        assert_eq!(
            parse_traddr("traddr=10.0.210.16,trsvcid=4420").as_deref(),
            Some("10.0.210.16")
        );
        assert_eq!(
            parse_traddr("traddr=10.0.210.16 trsvcid=4420").as_deref(),
            Some("10.0.210.16")
        );
        assert_eq!(parse_traddr("trsvcid=4420"), None);
    }

    #[test]
    fn visible_nsids_filters_by_serial() {
        let devices = parse_nvme_list("nvme list", FLAT_LIST).unwrap();
        assert_eq!(
            visible_nsids(&devices, "Ceph30487335301"),
            HashSet::from([1, 2])
        );
        assert!(visible_nsids(&devices, "other").is_empty());
        assert!(find_device(&devices, "Ceph30487335301", 2).is_some());
    }

    #[test]
    fn lsblk_parses_wwns() {
        let raw = r#"{
            "blockdevices": [
                {"name": "sda", "wwn": null},
                {"name": "nvme1n1", "wwn": "uuid.8c268812-c2ac-4f64-9bcd-26010c3b3678"}
            ]
        }"#;
        let devs = parse_lsblk("lsblk", raw).unwrap();
        assert_eq!(devs.len(), 2);
        assert_eq!(devs[0].wwn, None);
        assert!(devs[1].wwn.as_deref().unwrap().starts_with("uuid."));
    }
}
