// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Config, along with its children, is the model for a test bed used in the
/// cuttle configuration file. The config file is deserialized into a Config
/// object and validated once, before any workflow runs.
///
/// The model used in the config file is intentionally different from the
/// model used to track the cluster in memory (see cluster.rs). Since they
/// are decoupled, the dynamic model can change without a config format bump.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub group: GroupConfig,
    #[serde(default)]
    pub initiators: Vec<InitiatorConfig>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub io: IoConfig,
    #[serde(default)]
    pub ha: HaConfig,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub cleanup: Vec<CleanupItem>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClusterConfig {
    /// Node that carries the admin keyring and runs `cephadm shell`.
    pub installer: String,
    pub release: Release,
    #[serde(default = "crate::default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "crate::default_cli_image")]
    pub cli_image: String,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeConfig {
    pub id: String,
    pub hostname: String,
    pub addr: String,
}

/// Supported cluster release ranges. The release picks the dialect: ANA
/// report format, orchestrator service naming, and gateway CLI invocation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Release {
    /// 7.x: ungrouped nvmeof services, fragment-style ANA report.
    Reef,
    /// 8.x and later: gateway groups, JSON ANA report.
    Squid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GroupConfig {
    pub name: String,
    pub pool: String,
    /// Node ids running gateway daemons, in deployment order.
    pub gateways: Vec<String>,
    pub subsystems: Vec<SubsystemConfig>,
    #[serde(default = "default_gw_port")]
    pub gw_port: u16,
    /// Deploy from a service spec with mTLS between gateway and CLI.
    #[serde(default)]
    pub mtls: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubsystemConfig {
    pub nqn: String,
    /// Numeric suffix convention for generated artifacts, not the wire
    /// serial number (that comes back from the subsystem listing).
    pub serial: u32,
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
    #[serde(default = "default_max_namespaces")]
    pub max_namespaces: u32,
    #[serde(default = "default_true")]
    pub allow_any_host: bool,
    /// Explicit host-NQN grants, used when allow_any_host is off.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Namespaces provisioned up front by the configure step.
    #[serde(default)]
    pub namespaces: u32,
    #[serde(default = "default_image_size")]
    pub image_size: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InitiatorConfig {
    pub node: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    /// Rotate the subsystem key even if one was already generated.
    #[serde(default)]
    pub update_dhchap_key: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            mode: AuthMode::None,
            update_dhchap_key: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    None,
    /// Host secret only.
    Unidirectional,
    /// Host and controller secrets.
    Bidirectional,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IoConfig {
    #[serde(default = "default_fio_runtime")]
    pub fio_runtime_secs: u64,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
    #[serde(default = "default_io_retries")]
    pub retries: u32,
    #[serde(default = "default_io_retry_delay")]
    pub retry_delay_secs: u64,
    /// Fan-out width for per-namespace work.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        IoConfig {
            fio_runtime_secs: default_fio_runtime(),
            sample_interval_secs: default_sample_interval(),
            retries: default_io_retries(),
            retry_delay_secs: default_io_retry_delay(),
            workers: default_workers(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HaConfig {
    #[serde(default)]
    pub method: FaultMethod,
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
    #[serde(default = "default_poll_delay")]
    pub poll_delay_secs: u64,
}

impl Default for HaConfig {
    fn default() -> Self {
        HaConfig {
            method: FaultMethod::Systemctl,
            poll_attempts: default_poll_attempts(),
            poll_delay_secs: default_poll_delay(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FaultMethod {
    /// Stop the daemon's systemd unit on the gateway node.
    #[default]
    Systemctl,
    /// Stop the daemon through `ceph orch daemon stop`.
    OrchDaemon,
}

/// One step of a run. Steps execute in order; each carries exactly the
/// fields it needs and nothing is patched in later.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Deploy the gateway service if needed and provision subsystems,
    /// hosts, namespaces, and listeners.
    Configure,
    /// Connect every configured initiator to the group.
    Connect,
    /// Start fio on visible devices and check usage progress.
    RunIo {
        #[serde(default)]
        negative: bool,
    },
    Failover {
        nodes: Vec<String>,
    },
    Failback {
        nodes: Vec<String>,
    },
    MaskingAdd {
        namespaces: u32,
        #[serde(default)]
        no_auto_visible: bool,
        #[serde(default = "default_image_size")]
        image_size: String,
    },
    MaskingAddHost {
        #[serde(default)]
        validate_node: Option<String>,
    },
    MaskingDelHost {
        #[serde(default)]
        validate_node: Option<String>,
    },
    MaskingChangeVisibility {
        auto_visible: bool,
        #[serde(default)]
        force: bool,
    },
    Qos {
        #[serde(default)]
        rw_ios_per_second: Option<u64>,
        #[serde(default)]
        rw_mbytes_per_second: Option<u64>,
        #[serde(default)]
        r_mbytes_per_second: Option<u64>,
        #[serde(default)]
        w_mbytes_per_second: Option<u64>,
    },
    RotateKeys,
}

impl Step {
    /// The step's config-file tag, for logs and summaries.
    pub fn name(&self) -> &'static str {
        match self {
            Step::Configure => "configure",
            Step::Connect => "connect",
            Step::RunIo { .. } => "run_io",
            Step::Failover { .. } => "failover",
            Step::Failback { .. } => "failback",
            Step::MaskingAdd { .. } => "masking_add",
            Step::MaskingAddHost { .. } => "masking_add_host",
            Step::MaskingDelHost { .. } => "masking_del_host",
            Step::MaskingChangeVisibility { .. } => "masking_change_visibility",
            Step::Qos { .. } => "qos",
            Step::RotateKeys => "rotate_keys",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CleanupItem {
    Initiators,
    Subsystems,
    Service,
    Pool,
}

fn default_listener_port() -> u16 {
    4420
}

fn default_gw_port() -> u16 {
    5500
}

fn default_max_namespaces() -> u32 {
    400
}

fn default_true() -> bool {
    true
}

fn default_image_size() -> String {
    "1G".to_string()
}

fn default_fio_runtime() -> u64 {
    600
}

fn default_sample_interval() -> u64 {
    10
}

fn default_io_retries() -> u32 {
    7
}

fn default_io_retry_delay() -> u64 {
    2
}

fn default_workers() -> usize {
    4
}

fn default_poll_attempts() -> u32 {
    30
}

fn default_poll_delay() -> u64 {
    5
}

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    UnknownNode(String),
    DuplicateNode(String),
    BadNqn(String),
    UnevenSplit { namespaces: u32, subsystems: u32 },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "could not read config: {e}"),
            ConfigError::Parse(e) => write!(f, "could not parse config: {e}"),
            ConfigError::UnknownNode(n) => write!(f, "node '{n}' is not in [cluster.nodes]"),
            ConfigError::DuplicateNode(n) => write!(f, "node '{n}' is declared twice"),
            ConfigError::BadNqn(n) => write!(f, "'{n}' is not a valid NQN"),
            ConfigError::UnevenSplit {
                namespaces,
                subsystems,
            } => write!(
                f,
                "{namespaces} namespaces do not divide evenly across {subsystems} subsystems"
            ),
            ConfigError::Invalid(what) => write!(f, "invalid config: {what}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// NQNs are dot-separated, at most 223 bytes, and limited to a small
/// charset. The gateway rejects anything else, so catch it at load time.
pub fn nqn_ok(nqn: &str) -> bool {
    if nqn.len() > 223 || !nqn.starts_with("nqn.") {
        return false;
    }
    nqn.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-' | '_'))
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(format!("'{path}': {e}")))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn node(&self, id: &str) -> Result<&NodeConfig, ConfigError> {
        self.cluster
            .nodes
            .iter()
            .find(|n| n.id == id)
            .ok_or_else(|| ConfigError::UnknownNode(id.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for node in &self.cluster.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ConfigError::DuplicateNode(node.id.clone()));
            }
        }

        self.node(&self.cluster.installer)?;
        for id in &self.group.gateways {
            self.node(id)?;
        }
        for init in &self.initiators {
            self.node(&init.node)?;
        }

        if self.group.gateways.is_empty() {
            return Err(ConfigError::Invalid("no gateway nodes".to_string()));
        }
        if self.group.subsystems.is_empty() {
            return Err(ConfigError::Invalid("no subsystems".to_string()));
        }

        let mut serials = HashSet::new();
        for sub in &self.group.subsystems {
            if !nqn_ok(&sub.nqn) {
                return Err(ConfigError::BadNqn(sub.nqn.clone()));
            }
            if !serials.insert(sub.serial) {
                return Err(ConfigError::Invalid(format!(
                    "subsystem serial {} is used twice",
                    sub.serial
                )));
            }
            for host in &sub.hosts {
                if !nqn_ok(host) {
                    return Err(ConfigError::BadNqn(host.clone()));
                }
            }
        }

        for step in &self.steps {
            self.validate_step(step)?;
        }

        Ok(())
    }

    fn validate_step(&self, step: &Step) -> Result<(), ConfigError> {
        let subsystems = self.group.subsystems.len() as u32;
        match step {
            Step::Failover { nodes } | Step::Failback { nodes } => {
                for id in nodes {
                    if !self.group.gateways.contains(id) {
                        return Err(ConfigError::UnknownNode(id.clone()));
                    }
                }
                if nodes.len() >= self.group.gateways.len() {
                    return Err(ConfigError::Invalid(
                        "fault would stop every gateway in the group".to_string(),
                    ));
                }
            }
            Step::MaskingAdd { namespaces, .. } => {
                if *namespaces == 0 || namespaces % subsystems != 0 {
                    return Err(ConfigError::UnevenSplit {
                        namespaces: *namespaces,
                        subsystems,
                    });
                }
            }
            Step::MaskingAddHost { validate_node, .. }
            | Step::MaskingDelHost { validate_node, .. } => {
                if self.initiators.is_empty() {
                    return Err(ConfigError::Invalid(
                        "masking host commands need at least one initiator".to_string(),
                    ));
                }
                if let Some(node) = validate_node {
                    if !self.initiators.iter().any(|i| &i.node == node) {
                        return Err(ConfigError::UnknownNode(node.clone()));
                    }
                }
            }
            Step::Connect | Step::RunIo { .. } => {
                if self.initiators.is_empty() {
                    return Err(ConfigError::Invalid(
                        "step needs at least one initiator".to_string(),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> String {
        r#"
[cluster]
installer = "node1"
release = "squid"

[[cluster.nodes]]
id = "node1"
hostname = "ceph-node1"
addr = "10.0.210.11"

[[cluster.nodes]]
id = "node6"
hostname = "ceph-node6"
addr = "10.0.210.16"

[[cluster.nodes]]
id = "node7"
hostname = "ceph-node7"
addr = "10.0.210.17"

[[cluster.nodes]]
id = "node10"
hostname = "ceph-node10"
addr = "10.0.210.20"

[group]
name = "group1"
pool = "rbd"
gateways = ["node6", "node7"]

[[group.subsystems]]
nqn = "nqn.2016-06.io.spdk:cnode1"
serial = 1
namespaces = 2

[[initiators]]
node = "node10"

[[steps]]
op = "configure"

[[steps]]
op = "failover"
nodes = ["node6"]
"#
        .to_string()
    }

    #[test]
    fn parses_and_validates() {
        let config = Config::parse(&sample()).unwrap();
        assert_eq!(config.cluster.release, Release::Squid);
        assert_eq!(config.group.subsystems[0].listener_port, 4420);
        assert!(config.group.subsystems[0].allow_any_host);
        assert_eq!(config.io.retries, 7);
        assert_eq!(config.ha.method, FaultMethod::Systemctl);
    }

    #[test]
    fn rejects_unknown_gateway_node() {
        let raw = sample().replace("gateways = [\"node6\", \"node7\"]", "gateways = [\"node9\"]");
        assert_eq!(
            Config::parse(&raw).unwrap_err(),
            ConfigError::UnknownNode("node9".to_string())
        );
    }

    #[test]
    fn rejects_fault_on_every_gateway() {
        let raw = sample().replace(
            "nodes = [\"node6\"]",
            "nodes = [\"node6\", \"node7\"]",
        );
        assert!(matches!(
            Config::parse(&raw).unwrap_err(),
            ConfigError::Invalid(_)
        ));
    }

    #[test]
    fn rejects_uneven_masking_split() {
        let raw = sample()
            + r#"
[[steps]]
op = "masking_add"
namespaces = 3

[[group.subsystems]]
nqn = "nqn.2016-06.io.spdk:cnode2"
serial = 2
"#;
        assert_eq!(
            Config::parse(&raw).unwrap_err(),
            ConfigError::UnevenSplit {
                namespaces: 3,
                subsystems: 2
            }
        );
    }

    #[test]
    fn rejects_bad_nqn() {
        let raw = sample().replace("nqn.2016-06.io.spdk:cnode1", "iqn.bad name");
        assert!(matches!(
            Config::parse(&raw).unwrap_err(),
            ConfigError::BadNqn(_)
        ));
    }

    #[test]
    fn nqn_charset() {
        assert!(nqn_ok("nqn.2016-06.io.spdk:cnode1"));
        assert!(!nqn_ok("nqn.2016-06.io.spdk:cnode 1"));
        assert!(!nqn_ok("subsys1"));
    }
}
