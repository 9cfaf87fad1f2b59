// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! In-memory model of the test bed: the Ceph cluster, its gateway group,
//! and the initiator hosts. Built from the declarative config plus what
//! the orchestrator actually reports, so a half-deployed cluster still
//! connects and can be converged or cleaned up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::check::WorkflowError;
use crate::config::{CleanupItem, Config, ConfigError};
use crate::dhchap::AuthManager;
use crate::gateway::{Gateway, GatewayGroup};
use crate::gwcli::{dialect_for, Dialect, GwCli};
use crate::initiator::{ConnectMode, ConnectSpec, Initiator};
use crate::node::Node;
use crate::orch::Orch;
use crate::remote::{retry, ExecError, Executor, RetryPolicy};
use crate::state::{Delta, Event, State};

#[derive(Debug)]
pub struct Cluster {
    pub config: Config,
    pub exec: Arc<dyn Executor>,
    pub dialect: Arc<dyn Dialect>,
    pub orch: Orch,
    pub group: GatewayGroup,
    pub initiators: Vec<Initiator>,
    pub auth: AuthManager,
}

impl Cluster {
    /// Connect to the cluster the config describes. Gateways are matched
    /// against the daemons and ANA identities the orchestrator reports; a
    /// node without a live daemon is simply absent until `deploy` brings
    /// it up.
    pub async fn connect(config: Config, exec: Arc<dyn Executor>) -> Result<Self, WorkflowError> {
        let dialect = dialect_for(config.cluster.release);
        let installer = Node::from_config(config.node(&config.cluster.installer)?);
        let orch = Orch::new(exec.clone(), dialect.clone(), installer.clone());

        let group = Self::discover_group(&config, &exec, &dialect, &orch).await?;
        info!(
            "connected: {}/{} gateways up in group {}",
            group.gateways.len(),
            config.group.gateways.len(),
            config.group.name
        );

        let initiators = config
            .initiators
            .iter()
            .map(|conf| -> Result<Initiator, ConfigError> {
                let node = config.node(&conf.node)?;
                Ok(Initiator::new(Node::from_config(node), exec.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let auth = AuthManager::new(
            config.auth.mode,
            config.auth.update_dhchap_key,
            exec.clone(),
            installer,
        );

        Ok(Cluster {
            config,
            exec,
            dialect,
            orch,
            group,
            initiators,
            auth,
        })
    }

    async fn discover_group(
        config: &Config,
        exec: &Arc<dyn Executor>,
        dialect: &Arc<dyn Dialect>,
        orch: &Orch,
    ) -> Result<GatewayGroup, WorkflowError> {
        let conf = &config.group;
        let daemons = orch.daemons().await.unwrap_or_else(|err| {
            debug!("no nvmeof daemons listed: {err}");
            Vec::new()
        });
        let report = match orch.ana_report(&conf.pool, &conf.name).await {
            Ok(report) => report,
            Err(err) => {
                // Before the service is deployed the show command fails;
                // that just means an empty group.
                debug!("no ANA report for {}/{}: {err}", conf.pool, conf.name);
                Default::default()
            }
        };

        let mut gateways = Vec::new();
        for id in &conf.gateways {
            let node = Node::from_config(config.node(id)?);
            let Some(daemon) = daemons.iter().find(|d| d.hostname == node.hostname) else {
                debug!("{id}: no nvmeof daemon on {}", node.hostname);
                continue;
            };
            let Some(entry) = report.find_by_hostname(&node.hostname) else {
                warn!("{id}: daemon present but not in the ANA report yet");
                continue;
            };
            let cli = GwCli::new(
                exec.clone(),
                dialect.clone(),
                node.clone(),
                &config.cluster.cli_image,
                conf.gw_port,
            );
            gateways.push(Arc::new(Gateway::new(
                node,
                entry.ana_group_id,
                daemon.daemon_name.clone(),
                cli,
            )));
        }
        Ok(GatewayGroup::new(&conf.name, &conf.pool, gateways))
    }

    /// Deploy (or converge) the nvmeof service and wait until every
    /// configured gateway node carries a daemon with an ANA identity.
    pub async fn deploy(&mut self) -> Result<(), WorkflowError> {
        let conf = &self.config.group;
        let placement = conf
            .gateways
            .iter()
            .map(|id| Ok(self.config.node(id)?.hostname.clone()))
            .collect::<Result<Vec<String>, ConfigError>>()?;
        info!("deploying nvmeof for {}/{} on {placement:?}", conf.pool, conf.name);
        if conf.mtls {
            let spec = self.dialect.service_spec(&conf.pool, &conf.name, &placement);
            self.orch.apply_spec(&spec).await?;
        } else {
            self.orch.apply(&conf.pool, &conf.name, &placement).await?;
        }

        let policy = RetryPolicy::new(
            self.config.ha.poll_attempts,
            Duration::from_secs(self.config.ha.poll_delay_secs),
        );
        let want = conf.gateways.len();
        let group = retry(policy, || async {
            let group =
                Self::discover_group(&self.config, &self.exec, &self.dialect, &self.orch).await;
            match group {
                Ok(group) if group.gateways.len() == want => Ok(group),
                Ok(group) => Err(ExecError::parse(
                    "orch apply nvmeof",
                    format!("{}/{want} gateways up", group.gateways.len()),
                )),
                Err(err) => Err(ExecError::parse("orch apply nvmeof", err.to_string())),
            }
        })
        .await?;
        self.group = group;
        Ok(())
    }

    /// Provision subsystems, listeners, and namespaces per the config, plus
    /// auth wiring when a DHCHAP mode is on.
    pub async fn configure(&self) -> Result<(), WorkflowError> {
        let subs = &self.config.group.subsystems;
        self.group
            .configure_subsystems(subs, self.config.io.workers)
            .await?;
        self.group.configure_listeners(subs).await?;

        if self.auth.enabled() {
            if subs.iter().any(|s| s.allow_any_host) {
                return Err(ConfigError::Invalid(
                    "auth modes need allow_any_host = false on every subsystem".to_string(),
                )
                .into());
            }
            let hostnqns = self.hostnqns().await?;
            let lead = self.group.lead()?;
            for sub in subs {
                self.auth.apply(lead.cli(), &sub.nqn, &hostnqns).await?;
            }
        }
        Ok(())
    }

    /// Host NQNs of the configured initiators, in config order.
    pub async fn hostnqns(&self) -> Result<Vec<String>, ExecError> {
        let mut nqns = Vec::new();
        for initiator in &self.initiators {
            nqns.push(initiator.hostnqn().await?);
        }
        Ok(nqns)
    }

    /// Connect calls one initiator needs: a single discovery connect-all
    /// without auth, or one explicit connect per subsystem with its
    /// secrets when DHCHAP is on.
    pub async fn connect_specs(
        &self,
        initiator: &Initiator,
    ) -> Result<Vec<ConnectSpec>, WorkflowError> {
        let gw = self.group.lead()?;
        if !self.auth.enabled() {
            return Ok(vec![ConnectSpec::all(&gw.node.addr)]);
        }
        let hostnqn = initiator.hostnqn().await?;
        let mut specs = Vec::new();
        for sub in &self.config.group.subsystems {
            let (host_key, ctrl_key) = self.auth.secrets_for(&sub.nqn, &hostnqn).await?;
            specs.push(ConnectSpec {
                traddr: gw.node.addr.clone(),
                mode: ConnectMode::One {
                    subsystem: sub.nqn.clone(),
                    port: sub.listener_port,
                },
                host_key,
                ctrl_key,
            });
        }
        Ok(specs)
    }

    /// The connect calls for every initiator, keyed by node id.
    pub async fn connect_spec_map(
        &self,
    ) -> Result<HashMap<String, Vec<ConnectSpec>>, WorkflowError> {
        let mut map = HashMap::new();
        for initiator in &self.initiators {
            map.insert(
                initiator.node.id.clone(),
                self.connect_specs(initiator).await?,
            );
        }
        Ok(map)
    }

    pub async fn connect_initiators(&self) -> Result<(), WorkflowError> {
        for initiator in &self.initiators {
            for spec in self.connect_specs(initiator).await? {
                initiator.connect_targets(&spec).await?;
            }
        }
        Ok(())
    }

    /// Replace every DHCHAP key and reconnect the initiators with the new
    /// secrets.
    pub async fn rotate_keys(&self, state: &State) -> Result<(), WorkflowError> {
        let lead = self.group.lead()?;
        let hostnqns = self.hostnqns().await?;
        for sub in &self.config.group.subsystems {
            self.auth.rotate(lead.cli(), &sub.nqn, &hostnqns).await?;
            state.record(Event::KeyRotate, &sub.nqn, None)?;
        }
        for initiator in &self.initiators {
            initiator.disconnect_all().await?;
        }
        self.connect_initiators().await
    }

    /// Best-effort evidence collection after a failure. Never fails; every
    /// error is logged and swallowed so the original failure stays on top.
    pub async fn diagnostics(&self) {
        for args in [
            vec!["-s"],
            vec!["health", "detail"],
            vec!["df"],
            vec!["orch", "ps", "--daemon-type", "nvmeof"],
        ] {
            match self.orch.ceph(&args).await {
                Ok(out) => info!("ceph {}:\n{}", args.join(" "), out.trim_end()),
                Err(err) => warn!("diagnostics: ceph {}: {err}", args.join(" ")),
            }
        }
        for node in &self.config.cluster.nodes {
            for cmd in ["uptime", "free -m"] {
                match self.exec.run(&node.hostname, cmd).await {
                    Ok(out) => info!("{}: {cmd}: {}", node.id, out.stdout.trim_end()),
                    Err(err) => warn!("diagnostics: {}: {cmd}: {err}", node.id),
                }
            }
        }
    }

    /// Tear down what a run built, in the order the config lists. Also
    /// restarts any gateway daemon an interrupted run left stopped, so the
    /// cluster is healthy before anything is deleted. Returns how many
    /// directives failed; failures are logged and do not stop the rest.
    pub async fn cleanup(&self, items: &[CleanupItem], delta: &Delta) -> usize {
        let mut failed = 0;

        for id in delta.failed_gateways() {
            let Some(gw) = self.group.find(&id) else {
                warn!("cleanup: {id} was left failed but is not in the group");
                failed += 1;
                continue;
            };
            info!("cleanup: restarting {}", gw.daemon);
            if let Err(err) = self.orch.daemon_action("start", &gw.daemon).await {
                warn!("cleanup: could not restart {}: {err}", gw.daemon);
                failed += 1;
            }
        }

        for item in items {
            let result = match item {
                CleanupItem::Initiators => self.disconnect_initiators().await,
                CleanupItem::Subsystems => self.group.delete_subsystems().await,
                CleanupItem::Service => {
                    self.orch
                        .remove_service(&self.config.group.pool, &self.config.group.name)
                        .await
                }
                CleanupItem::Pool => self.orch.delete_pool(&self.config.group.pool).await,
            };
            if let Err(err) = result {
                warn!("cleanup: {item:?} failed: {err}");
                failed += 1;
            }
        }
        failed
    }

    async fn disconnect_initiators(&self) -> Result<(), ExecError> {
        for initiator in &self.initiators {
            initiator.disconnect_all().await?;
        }
        Ok(())
    }
}
