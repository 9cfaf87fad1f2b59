// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use rand::{distributions::Alphanumeric, Rng};

use crate::ana::Availability;
use crate::config::SubsystemConfig;
use crate::gwcli::GwCli;
use crate::node::Node;
use crate::orch::Orch;
use crate::remote::ExecError;
use crate::session::fan_out;

/// One NVMe-oF gateway daemon. The ANA group id is assigned when the
/// service is deployed and never changes for the daemon's lifetime;
/// availability is whatever the latest report says, never a cached copy.
#[derive(Debug)]
pub struct Gateway {
    pub node: Node,
    pub ana_group_id: u32,
    /// Orchestrator daemon name, the handle fault injection works on.
    pub daemon: String,
    cli: GwCli,
}

impl Gateway {
    pub fn new(node: Node, ana_group_id: u32, daemon: String, cli: GwCli) -> Self {
        Gateway {
            node,
            ana_group_id,
            daemon,
            cli,
        }
    }

    pub fn cli(&self) -> &GwCli {
        &self.cli
    }

    pub async fn availability(
        &self,
        orch: &Orch,
        pool: &str,
        group: &str,
    ) -> Result<Availability, ExecError> {
        let report = orch.ana_report(pool, group).await?;
        Ok(report
            .find_by_hostname(&self.node.hostname)
            .map(|gw| gw.availability)
            .unwrap_or(Availability::Unknown))
    }

    /// Namespaces currently load-balanced to any of `groups`, read through
    /// this gateway's CLI. An empty filter returns everything.
    pub async fn fetch_namespaces(&self, groups: &[u32]) -> Result<Vec<NamespaceRef>, ExecError> {
        let mut found = Vec::new();
        for sub in self.cli.subsystem_list().await? {
            for ns in self.cli.namespace_list(&sub.nqn).await? {
                if groups.is_empty() || groups.contains(&ns.load_balancing_group) {
                    found.push(NamespaceRef {
                        subsystem: sub.nqn.clone(),
                        nsid: ns.nsid,
                        pool: ns.rbd_pool_name,
                        image: ns.rbd_image_name,
                        lb_group: ns.load_balancing_group,
                    });
                }
            }
        }
        for ns in &found {
            debug!("{}: serves {ns}", self.node.id);
        }
        Ok(found)
    }
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{} anagrp {}", self.node, self.ana_group_id)
    }
}

/// A namespace as recorded before a fault, enough to find it again from
/// every initiator afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceRef {
    pub subsystem: String,
    pub nsid: u32,
    pub pool: String,
    pub image: String,
    pub lb_group: u32,
}

impl fmt::Display for NamespaceRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            "{}|nsid-{}|{}|{}",
            self.subsystem, self.nsid, self.pool, self.image
        )
    }
}

/// A named set of gateways sharing a pool and subsystem configuration.
/// Subsystems, hosts, and namespaces are provisioned once per group;
/// listeners are per-gateway because they bind a gateway's address.
#[derive(Debug)]
pub struct GatewayGroup {
    pub name: String,
    pub pool: String,
    pub gateways: Vec<Arc<Gateway>>,
    /// NQNs already provisioned, so configure is idempotent per subsystem.
    configured: Mutex<HashSet<String>>,
}

impl GatewayGroup {
    pub fn new(name: &str, pool: &str, gateways: Vec<Arc<Gateway>>) -> Self {
        GatewayGroup {
            name: name.to_string(),
            pool: pool.to_string(),
            gateways,
            configured: Mutex::new(HashSet::new()),
        }
    }

    /// The gateway provisioning runs through. Any member works; the
    /// objects are shared group-wide.
    pub fn lead(&self) -> Result<&Arc<Gateway>, ExecError> {
        self.gateways
            .first()
            .ok_or_else(|| ExecError::parse("gateway group", "group has no gateways"))
    }

    pub fn find(&self, node_id: &str) -> Option<&Arc<Gateway>> {
        self.gateways.iter().find(|gw| gw.node.id == node_id)
    }

    /// Split members into (to fail, still running) by node id.
    pub fn categorize(&self, fail_ids: &[String]) -> (Vec<Arc<Gateway>>, Vec<Arc<Gateway>>) {
        let mut fail = Vec::new();
        let mut running = Vec::new();
        for gw in &self.gateways {
            if fail_ids.iter().any(|id| id == &gw.node.id) {
                fail.push(Arc::clone(gw));
            } else {
                running.push(Arc::clone(gw));
            }
        }
        (fail, running)
    }

    /// Provision every subsystem that is not already registered: create it,
    /// grant host access, then create its backing namespaces with one task
    /// per namespace. A failed create cancels the sibling creates and
    /// surfaces as the error.
    pub async fn configure_subsystems(
        &self,
        subsystems: &[SubsystemConfig],
        workers: usize,
    ) -> Result<(), ExecError> {
        let lead = self.lead()?;
        for sub in subsystems {
            if self.configured.lock().unwrap().contains(&sub.nqn) {
                debug!("{}: already configured, skipping", sub.nqn);
                continue;
            }
            info!("creating subsystem {}", sub.nqn);
            lead.cli().subsystem_add(&sub.nqn, sub.max_namespaces).await?;

            if sub.allow_any_host {
                lead.cli().host_add(&sub.nqn, "*", None).await?;
            } else {
                for host in &sub.hosts {
                    lead.cli().host_add(&sub.nqn, host, None).await?;
                }
            }

            fan_out(workers, 0..sub.namespaces, |i| {
                let cli = lead.cli().clone();
                let nqn = sub.nqn.clone();
                let pool = self.pool.clone();
                let size = sub.image_size.clone();
                let image = unique_image(sub.serial, i + 1);
                async move {
                    cli.namespace_add(&nqn, &pool, &image, &size, None, false)
                        .await
                }
            })
            .await?;

            self.configured.lock().unwrap().insert(sub.nqn.clone());
        }
        Ok(())
    }

    /// Add one listener per (gateway, subsystem) pair on the subsystem's
    /// configured port.
    pub async fn configure_listeners(
        &self,
        subsystems: &[SubsystemConfig],
    ) -> Result<(), ExecError> {
        for gw in &self.gateways {
            for sub in subsystems {
                info!("listener for {} on {}", sub.nqn, gw.node);
                gw.cli()
                    .listener_add(&sub.nqn, &gw.node.hostname, &gw.node.addr, sub.listener_port)
                    .await?;
            }
        }
        Ok(())
    }

    /// Tear down every subsystem the group currently reports.
    pub async fn delete_subsystems(&self) -> Result<(), ExecError> {
        let lead = self.lead()?;
        for sub in lead.cli().subsystem_list().await? {
            info!("deleting subsystem {}", sub.nqn);
            lead.cli().subsystem_del(&sub.nqn, true).await?;
        }
        self.configured.lock().unwrap().clear();
        Ok(())
    }
}

/// Backing image names only need to be unique per run; a short random
/// suffix keeps reruns from colliding with leftovers.
pub(crate) fn unique_image(serial: u32, index: u32) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect();
    format!("image-{serial}-{index}-{}", suffix.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_ref_formats_like_the_gateway_log() {
        let ns = NamespaceRef {
            subsystem: "nqn.2016-06.io.spdk:cnode1".to_string(),
            nsid: 3,
            pool: "rbd".to_string(),
            image: "image-1-3-ab12".to_string(),
            lb_group: 2,
        };
        assert_eq!(
            ns.to_string(),
            "nqn.2016-06.io.spdk:cnode1|nsid-3|rbd|image-1-3-ab12"
        );
    }

    #[test]
    fn unique_image_embeds_serial_and_index() {
        let name = unique_image(2, 7);
        assert!(name.starts_with("image-2-7-"));
        assert_eq!(name.len(), "image-2-7-".len() + 4);
        assert_ne!(unique_image(2, 7), unique_image(2, 7));
    }
}
