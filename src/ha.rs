// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Failover and failback: stop gateway daemons on purpose, wait for the
//! survivors to take over the orphaned ANA groups, then prove from every
//! initiator that each affected namespace still has exactly one optimized
//! path and that it points where it should.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::ana::{AnaReport, Availability, GatewayReport};
use crate::check::{ensure, CheckError, WorkflowError};
use crate::config::{ConfigError, FaultMethod, HaConfig};
use crate::gateway::{Gateway, GatewayGroup, NamespaceRef};
use crate::gwcli::GwCli;
use crate::initiator::{find_device, Initiator};
use crate::orch::Orch;
use crate::remote::{retry, ExecError, Executor, RetryPolicy};
use crate::state::{Event, State};

/// Errors while waiting for the cluster to converge. Pending conditions are
/// retried within the poll budget; spending the budget on one makes it a
/// validation failure, not a command failure.
#[derive(Debug)]
enum PollError {
    Exec(ExecError),
    Pending(String),
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PollError::Exec(err) => write!(f, "{err}"),
            PollError::Pending(what) => write!(f, "{what}"),
        }
    }
}

impl PollError {
    fn into_workflow(self, what: &str) -> WorkflowError {
        match self {
            PollError::Exec(err) => WorkflowError::Exec(err),
            PollError::Pending(msg) => {
                WorkflowError::Check(CheckError::new(format!("{what} did not complete: {msg}")))
            }
        }
    }
}

/// What a failover or failback touched, for reporting and for driving IO
/// validation afterwards.
#[derive(Debug, Default)]
pub struct HaOutcome {
    /// Affected namespaces keyed by the gateway that owned their group.
    pub affected: HashMap<String, Vec<NamespaceRef>>,
    /// ANA group owned by each named gateway.
    pub groups: HashMap<String, u32>,
    /// Gateway node now serving each of those groups.
    pub serving: HashMap<u32, String>,
}

impl HaOutcome {
    pub fn namespaces(&self) -> Vec<NamespaceRef> {
        self.affected.values().flatten().cloned().collect()
    }
}

/// Borrowed context for one HA workflow run.
pub struct Ha<'a> {
    pub exec: &'a Arc<dyn Executor>,
    pub orch: &'a Orch,
    pub group: &'a GatewayGroup,
    pub initiators: &'a [Initiator],
    pub state: &'a State,
    pub conf: &'a HaConfig,
}

impl Ha<'_> {
    fn poll_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.conf.poll_attempts,
            Duration::from_secs(self.conf.poll_delay_secs),
        )
    }

    fn method_name(&self) -> &'static str {
        match self.conf.method {
            FaultMethod::Systemctl => "systemctl",
            FaultMethod::OrchDaemon => "orch-daemon",
        }
    }

    /// Stop or start a gateway daemon. The systemd unit embeds the cluster
    /// fsid, so the unit name is globbed around the daemon id.
    async fn set_daemon(&self, gw: &Gateway, start: bool) -> Result<(), ExecError> {
        let verb = if start { "start" } else { "stop" };
        match self.conf.method {
            FaultMethod::Systemctl => {
                let cmd = format!("systemctl {verb} 'ceph-*@{}.service'", gw.daemon);
                gw.node.run(self.exec.as_ref(), &cmd).await.map(|_| ())
            }
            FaultMethod::OrchDaemon => self.orch.daemon_action(verb, &gw.daemon).await,
        }
    }

    /// Namespace inventory for the ANA groups owned by `targets`, read from
    /// a gateway that is up.
    async fn collect_affected(
        &self,
        source: &Gateway,
        targets: &[Arc<Gateway>],
    ) -> Result<HashMap<String, Vec<NamespaceRef>>, ExecError> {
        let groups: Vec<u32> = targets.iter().map(|gw| gw.ana_group_id).collect();
        let namespaces = source.fetch_namespaces(&groups).await?;
        let mut affected = HashMap::new();
        for gw in targets {
            let owned: Vec<NamespaceRef> = namespaces
                .iter()
                .filter(|ns| ns.lb_group == gw.ana_group_id)
                .cloned()
                .collect();
            info!(
                "{} namespaces ride on anagrp {} ({})",
                owned.len(),
                gw.ana_group_id,
                gw.node.id
            );
            affected.insert(gw.node.id.clone(), owned);
        }
        Ok(affected)
    }

    fn resolve(&self, entry: &GatewayReport) -> Option<&Arc<Gateway>> {
        self.group
            .gateways
            .iter()
            .find(|gw| entry.is_on(&gw.node.hostname))
    }

    /// For each group, the single gateway the report says is ACTIVE for it.
    /// More or fewer than one is a validation failure.
    fn serving_map(
        &self,
        report: &AnaReport,
        groups: &HashMap<String, u32>,
    ) -> Result<HashMap<u32, Arc<Gateway>>, WorkflowError> {
        let mut serving = HashMap::new();
        for (id, gid) in groups {
            let active = report.active_for(*gid);
            ensure(active.len() == 1, || {
                format!(
                    "anagrp {gid} (owned by {id}) is ACTIVE on {} gateways, want exactly 1",
                    active.len()
                )
            })?;
            let gw = self.resolve(active[0]).ok_or_else(|| {
                CheckError::new(format!(
                    "gateway {} serving anagrp {gid} is not in the configured group",
                    active[0].gw_id
                ))
            })?;
            serving.insert(*gid, gw.clone());
        }
        Ok(serving)
    }

    async fn subsystem_serials(&self, cli: &GwCli) -> Result<HashMap<String, String>, ExecError> {
        Ok(cli
            .subsystem_list()
            .await?
            .into_iter()
            .map(|sub| (sub.nqn, sub.serial_number))
            .collect())
    }

    /// Check the path state of every affected namespace from one initiator.
    /// Violations here are hard failures; nothing in this pass is retried.
    async fn validate_initiator(
        &self,
        initiator: &Initiator,
        affected: &HashMap<String, Vec<NamespaceRef>>,
        serials: &HashMap<String, String>,
        serving: &HashMap<u32, Arc<Gateway>>,
        failed_addr: &HashMap<u32, String>,
    ) -> Result<(), WorkflowError> {
        let devices = initiator.list_devices().await?;
        for ns in affected.values().flatten() {
            let serial = serials.get(&ns.subsystem).ok_or_else(|| {
                CheckError::new(format!("no serial number known for {}", ns.subsystem))
            })?;
            let device = find_device(&devices, serial, ns.nsid).ok_or_else(|| {
                CheckError::new(format!("{}: {ns} is not visible", initiator.node.id))
            })?;
            let target = serving.get(&ns.lb_group).ok_or_else(|| {
                CheckError::new(format!("no gateway serves anagrp {}", ns.lb_group))
            })?;
            initiator
                .validate_paths(
                    &device.path,
                    &target.node.addr,
                    failed_addr.get(&ns.lb_group).map(|addr| addr.as_str()),
                )
                .await?;
        }
        Ok(())
    }

    /// Poll until every failed gateway's availability has left AVAILABLE.
    async fn await_takeover(&self, fail: &[Arc<Gateway>]) -> Result<AnaReport, WorkflowError> {
        retry(self.poll_policy(), || async {
            let report = self
                .orch
                .ana_report(&self.group.pool, &self.group.name)
                .await
                .map_err(PollError::Exec)?;
            for gw in fail {
                let avail = report
                    .find_by_hostname(&gw.node.hostname)
                    .map(|entry| entry.availability)
                    .unwrap_or(Availability::Unknown);
                if avail == Availability::Available {
                    return Err(PollError::Pending(format!(
                        "{} is still AVAILABLE",
                        gw.node.id
                    )));
                }
            }
            Ok(report)
        })
        .await
        .map_err(|err| err.into_workflow("takeover"))
    }

    /// Poll until every restored gateway is AVAILABLE again and ACTIVE for
    /// its own group.
    async fn await_failback(&self, restore: &[Arc<Gateway>]) -> Result<AnaReport, WorkflowError> {
        retry(self.poll_policy(), || async {
            let report = self
                .orch
                .ana_report(&self.group.pool, &self.group.name)
                .await
                .map_err(PollError::Exec)?;
            for gw in restore {
                let entry = report.find_by_hostname(&gw.node.hostname).ok_or_else(|| {
                    PollError::Pending(format!("{} is not in the report yet", gw.node.id))
                })?;
                if entry.availability != Availability::Available {
                    return Err(PollError::Pending(format!(
                        "{} is {}",
                        gw.node.id, entry.availability
                    )));
                }
                let back = report
                    .active_for(gw.ana_group_id)
                    .iter()
                    .any(|e| e.is_on(&gw.node.hostname));
                if !back {
                    return Err(PollError::Pending(format!(
                        "anagrp {} is not back on {}",
                        gw.ana_group_id, gw.node.id
                    )));
                }
            }
            Ok(report)
        })
        .await
        .map_err(|err| err.into_workflow("failback"))
    }

    /// Fail the named gateways and prove the group absorbed it.
    pub async fn failover(&self, nodes: &[String]) -> Result<HaOutcome, WorkflowError> {
        if nodes.is_empty() {
            return Err(ConfigError::Invalid("failover names no gateways".to_string()).into());
        }
        let (fail, running) = self.group.categorize(nodes);
        ensure(fail.len() == nodes.len(), || {
            format!("target list {nodes:?} names gateways outside the group")
        })?;
        let survivor = running
            .first()
            .ok_or_else(|| CheckError::new("failover would stop every gateway"))?;

        let affected = self.collect_affected(survivor, &fail).await?;
        let groups: HashMap<String, u32> = fail
            .iter()
            .map(|gw| (gw.node.id.clone(), gw.ana_group_id))
            .collect();
        let serials = self.subsystem_serials(survivor.cli()).await?;

        for gw in &fail {
            info!("failing {gw} via {}", self.method_name());
            self.set_daemon(gw, false).await?;
            self.state
                .record(Event::Fail, &gw.node.id, Some(self.method_name().to_string()))?;
        }

        let report = self.await_takeover(&fail).await?;
        let serving = self.serving_map(&report, &groups)?;
        let failed_addr: HashMap<u32, String> = fail
            .iter()
            .map(|gw| (gw.ana_group_id, gw.node.addr.clone()))
            .collect();

        for initiator in self.initiators {
            self.validate_initiator(initiator, &affected, &serials, &serving, &failed_addr)
                .await?;
        }

        info!("failover of {nodes:?} complete");
        Ok(HaOutcome {
            affected,
            groups,
            serving: serving
                .into_iter()
                .map(|(gid, gw)| (gid, gw.node.id.clone()))
                .collect(),
        })
    }

    /// Start the named gateways again and prove each took its own group
    /// back.
    pub async fn failback(&self, nodes: &[String]) -> Result<HaOutcome, WorkflowError> {
        if nodes.is_empty() {
            return Err(ConfigError::Invalid("failback names no gateways".to_string()).into());
        }
        let (restore, _) = self.group.categorize(nodes);
        ensure(restore.len() == nodes.len(), || {
            format!("target list {nodes:?} names gateways outside the group")
        })?;

        for gw in &restore {
            info!("restoring {gw} via {}", self.method_name());
            self.set_daemon(gw, true).await?;
            self.state.record(
                Event::Restore,
                &gw.node.id,
                Some(self.method_name().to_string()),
            )?;
        }

        let report = self.await_failback(&restore).await?;
        let groups: HashMap<String, u32> = restore
            .iter()
            .map(|gw| (gw.node.id.clone(), gw.ana_group_id))
            .collect();
        let serving = self.serving_map(&report, &groups)?;
        for gw in &restore {
            let target = &serving[&gw.ana_group_id];
            ensure(target.node.id == gw.node.id, || {
                format!(
                    "anagrp {} failed back to {}, want {}",
                    gw.ana_group_id, target.node.id, gw.node.id
                )
            })?;
        }

        let lead = restore
            .first()
            .ok_or_else(|| CheckError::new("nothing to restore"))?;
        let affected = self.collect_affected(lead, &restore).await?;
        let serials = self.subsystem_serials(lead.cli()).await?;

        // Nothing is down anymore, so no inaccessible address is required;
        // the exactly-one-optimized rule still applies.
        for initiator in self.initiators {
            self.validate_initiator(initiator, &affected, &serials, &serving, &HashMap::new())
                .await?;
        }

        info!("failback of {nodes:?} complete");
        Ok(HaOutcome {
            affected,
            groups,
            serving: serving
                .into_iter()
                .map(|(gid, gw)| (gid, gw.node.id.clone()))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_polls_become_check_failures() {
        let pending = PollError::Pending("node-2 is still AVAILABLE".to_string());
        match pending.into_workflow("takeover") {
            WorkflowError::Check(err) => {
                assert!(err.what.contains("takeover"));
                assert!(err.what.contains("node-2"));
            }
            other => panic!("wrong error: {other:?}"),
        }

        let exec = PollError::Exec(ExecError::parse("nvme-gw show", "bad json"));
        assert!(matches!(
            exec.into_workflow("takeover"),
            WorkflowError::Exec(_)
        ));
    }

    #[test]
    fn outcome_flattens_namespaces() {
        let mut affected = HashMap::new();
        affected.insert(
            "node-2".to_string(),
            vec![NamespaceRef {
                subsystem: "nqn.2016-06.io.spdk:cnode1".to_string(),
                nsid: 1,
                pool: "rbd".to_string(),
                image: "image-1".to_string(),
                lb_group: 2,
            }],
        );
        let outcome = HaOutcome {
            affected,
            groups: HashMap::from([("node-2".to_string(), 2)]),
            serving: HashMap::from([(2, "node-1".to_string())]),
        };
        assert_eq!(outcome.namespaces().len(), 1);
        assert_eq!(outcome.serving[&2], "node-1");
    }
}
