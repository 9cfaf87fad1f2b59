// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The `run` command: execute the config's step list in order against a
//! live cluster. Any step failure stops the run, collects diagnostics,
//! and still goes through cleanup, so a broken cluster is not left
//! holding namespaces and fio jobs.

use std::collections::{HashMap, HashSet};

use log::info;

use crate::check::WorkflowError;
use crate::cluster::Cluster;
use crate::commands::{connect, handled_error, load_config, open_state, Cli, HandledResult};
use crate::config::Step;
use crate::gwcli::QosSpec;
use crate::ha::Ha;
use crate::io::{spawn_workload, validate_io, ValidateOpts};
use crate::masking::{Masking, Visibility};
use crate::qos;
use crate::session::IoSession;
use crate::state::State;

pub async fn run(cli: &Cli) -> HandledResult<()> {
    let config = load_config(cli)?;
    let state = open_state(cli)?;
    let mut cluster = connect(config).await?;

    let mut session = IoSession::new(cluster.config.io.workers);
    let result = drive(&mut cluster, &state, &mut session).await;
    session.shutdown().await;

    if let Err(err) = &result {
        eprintln!("Run failed: {err}");
        cluster.diagnostics().await;
    }

    let items = cluster.config.cleanup.clone();
    let failed = cluster.cleanup(&items, &state.delta()).await;
    if failed > 0 {
        eprintln!("{failed} cleanup actions failed");
    }

    match result {
        Ok(()) if failed == 0 => {
            println!("run complete: {} steps", cluster.config.steps.len());
            Ok(())
        }
        _ => handled_error(),
    }
}

async fn drive(
    cluster: &mut Cluster,
    state: &State,
    session: &mut IoSession,
) -> Result<(), WorkflowError> {
    let steps = cluster.config.steps.clone();
    for (idx, step) in steps.iter().enumerate() {
        info!("step {}/{}: {}", idx + 1, steps.len(), step.name());
        execute_step(cluster, state, session, step).await?;
    }
    Ok(())
}

fn masking(cluster: &Cluster) -> Masking<'_> {
    Masking {
        group: &cluster.group,
        initiators: &cluster.initiators,
        workers: cluster.config.io.workers,
    }
}

/// Execute one step. Used by `run` for the configured sequence and by the
/// one-shot subcommands that map onto a single step.
pub(crate) async fn execute_step(
    cluster: &mut Cluster,
    state: &State,
    session: &mut IoSession,
    step: &Step,
) -> Result<(), WorkflowError> {
    match step {
        Step::Configure => {
            cluster.deploy().await?;
            cluster.configure().await
        }
        Step::Connect => cluster.connect_initiators().await,
        Step::RunIo { negative } => run_io(cluster, session, *negative).await,
        Step::Failover { nodes } => {
            let outcome = ha(cluster, state).failover(nodes).await?;
            let opts = ValidateOpts::from_config(&cluster.config.io);
            validate_io(&cluster.orch, &outcome.namespaces(), false, &opts).await
        }
        Step::Failback { nodes } => {
            let outcome = ha(cluster, state).failback(nodes).await?;
            let opts = ValidateOpts::from_config(&cluster.config.io);
            validate_io(&cluster.orch, &outcome.namespaces(), false, &opts).await
        }
        Step::MaskingAdd {
            namespaces,
            no_auto_visible,
            image_size,
        } => {
            let subs = &cluster.config.group.subsystems;
            let m = masking(cluster);
            m.add(subs, *namespaces, *no_auto_visible, image_size).await?;
            m.validate_namespaces(subs, !*no_auto_visible, None).await?;
            masking_io(cluster, session).await
        }
        Step::MaskingAddHost { validate_node } => {
            let subs = &cluster.config.group.subsystems;
            let m = masking(cluster);
            m.add_host(subs).await?;
            let owners = cluster.hostnqns().await?;
            m.validate_namespaces(subs, false, Some(&owners)).await?;
            let specs = cluster.connect_spec_map().await?;
            m.validate_initiators(subs, &specs, Visibility::OwnShare, validate_node.as_deref())
                .await?;
            masking_io(cluster, session).await
        }
        Step::MaskingDelHost { validate_node } => {
            let subs = &cluster.config.group.subsystems;
            let m = masking(cluster);
            m.del_host(subs).await?;
            m.validate_namespaces(subs, false, Some(&[])).await?;
            let specs = cluster.connect_spec_map().await?;
            m.validate_initiators(subs, &specs, Visibility::Nothing, validate_node.as_deref())
                .await?;
            masking_io(cluster, session).await
        }
        Step::MaskingChangeVisibility { auto_visible, force } => {
            let subs = &cluster.config.group.subsystems;
            let m = masking(cluster);
            m.change_visibility(subs, *auto_visible, *force).await?;
            m.validate_namespaces(subs, *auto_visible, None).await?;
            let specs = cluster.connect_spec_map().await?;
            let want = if *auto_visible {
                Visibility::All
            } else {
                Visibility::Nothing
            };
            m.validate_initiators(subs, &specs, want, None).await?;
            masking_io(cluster, session).await
        }
        Step::Qos {
            rw_ios_per_second,
            rw_mbytes_per_second,
            r_mbytes_per_second,
            w_mbytes_per_second,
        } => {
            let spec = QosSpec {
                rw_ios_per_second: *rw_ios_per_second,
                rw_mbytes_per_second: *rw_mbytes_per_second,
                r_mbytes_per_second: *r_mbytes_per_second,
                w_mbytes_per_second: *w_mbytes_per_second,
            };
            let lead = cluster.group.lead()?;
            for sub in &cluster.config.group.subsystems {
                qos::apply_and_verify(lead.cli(), &sub.nqn, &spec).await?;
            }
            Ok(())
        }
        Step::RotateKeys => cluster.rotate_keys(state).await,
    }
}

fn ha<'a>(cluster: &'a Cluster, state: &'a State) -> Ha<'a> {
    Ha {
        exec: &cluster.exec,
        orch: &cluster.orch,
        group: &cluster.group,
        initiators: &cluster.initiators,
        state,
        conf: &cluster.config.ha,
    }
}

/// Start writers on every device each initiator can see, then prove the
/// backing images are (or are not) growing.
async fn run_io(
    cluster: &Cluster,
    session: &mut IoSession,
    negative: bool,
) -> Result<(), WorkflowError> {
    for initiator in &cluster.initiators {
        let devices = initiator.list_devices().await?;
        let paths: Vec<String> = devices.iter().map(|dev| dev.path.clone()).collect();
        info!(
            "starting fio on {} devices from {}",
            paths.len(),
            initiator.node.id
        );
        spawn_workload(
            session,
            cluster.exec.clone(),
            &initiator.node.hostname,
            &paths,
            &cluster.config.io,
        );
    }

    let namespaces = cluster.group.lead()?.fetch_namespaces(&[]).await?;
    let opts = ValidateOpts::from_config(&cluster.config.io);
    validate_io(&cluster.orch, &namespaces, negative, &opts).await
}

/// Operational proof of a masking change: write from every initiator to
/// whatever it can see, then require growth on exactly those namespaces
/// and none on the rest.
async fn masking_io(
    cluster: &Cluster,
    session: &mut IoSession,
) -> Result<(), WorkflowError> {
    let lead = cluster.group.lead()?;
    let mut nqn_of: HashMap<String, String> = HashMap::new();
    for sub in lead.cli().subsystem_list().await? {
        nqn_of.insert(sub.serial_number.clone(), sub.nqn.clone());
    }

    let mut writable: HashSet<(String, u32)> = HashSet::new();
    for initiator in &cluster.initiators {
        let devices = initiator.list_devices().await?;
        if devices.is_empty() {
            continue;
        }
        let paths: Vec<String> = devices.iter().map(|dev| dev.path.clone()).collect();
        info!(
            "starting fio on {} devices from {}",
            paths.len(),
            initiator.node.id
        );
        spawn_workload(
            session,
            cluster.exec.clone(),
            &initiator.node.hostname,
            &paths,
            &cluster.config.io,
        );
        for dev in devices {
            if let Some(nqn) = nqn_of.get(&dev.serial) {
                writable.insert((nqn.clone(), dev.nsid));
            }
        }
    }

    let namespaces = lead.fetch_namespaces(&[]).await?;
    let (growing, masked): (Vec<_>, Vec<_>) = namespaces
        .into_iter()
        .partition(|ns| writable.contains(&(ns.subsystem.clone(), ns.nsid)));

    let opts = ValidateOpts::from_config(&cluster.config.io);
    validate_io(&cluster.orch, &growing, false, &opts).await?;
    validate_io(&cluster.orch, &masked, true, &opts).await
}
