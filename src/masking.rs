// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Namespace masking: restricted namespaces, per-host grants, and the
//! checks that the gateway and every initiator agree on who may see what.
//!
//! Grants split each subsystem's namespaces into contiguous equal shares,
//! one per initiator, by integer division. Namespaces left over after the
//! split belong to nobody and must stay invisible.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use log::info;

use crate::check::{ensure, CheckError, WorkflowError};
use crate::config::{ConfigError, SubsystemConfig};
use crate::gateway::{unique_image, GatewayGroup};
use crate::initiator::{visible_nsids, ConnectSpec, Initiator};
use crate::remote::{retry, RetryPolicy};
use crate::session::fan_out;

/// Devices take a moment to appear after a reconnect.
const LIST_RETRY: RetryPolicy = RetryPolicy {
    attempts: 4,
    delay: Duration::from_secs(3),
};

/// NSIDs the host at `host_index` owns when `total` namespaces are shared
/// by `host_count` hosts.
pub fn expected_nsids(total: u32, host_count: usize, host_index: usize) -> Vec<u32> {
    if host_count == 0 || host_index >= host_count {
        return Vec::new();
    }
    let per_host = total / host_count as u32;
    let start = per_host * host_index as u32 + 1;
    (start..start + per_host).collect()
}

/// Which host owns an NSID, if any. NSIDs past the last full share have no
/// owner.
pub fn owner_of(total: u32, host_count: usize, nsid: u32) -> Option<usize> {
    if host_count == 0 || nsid == 0 {
        return None;
    }
    let per_host = total / host_count as u32;
    if per_host == 0 || nsid > per_host * host_count as u32 {
        return None;
    }
    Some(((nsid - 1) / per_host) as usize)
}

/// What a device listing on an initiator should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Every namespace, on every host.
    All,
    /// Nothing, on any host.
    Nothing,
    /// Exactly the host's own contiguous share.
    OwnShare,
}

/// Borrowed context for masking workflows.
pub struct Masking<'a> {
    pub group: &'a GatewayGroup,
    pub initiators: &'a [Initiator],
    pub workers: usize,
}

impl Masking<'_> {
    /// Create `total` namespaces spread evenly across the subsystems,
    /// restricted when `no_auto_visible` is set. Appends after whatever
    /// NSIDs already exist and returns how many namespaces were created.
    pub async fn add(
        &self,
        subsystems: &[SubsystemConfig],
        total: u32,
        no_auto_visible: bool,
        image_size: &str,
    ) -> Result<u32, WorkflowError> {
        if subsystems.is_empty() || total % subsystems.len() as u32 != 0 {
            return Err(ConfigError::UnevenSplit {
                namespaces: total,
                subsystems: subsystems.len() as u32,
            }
            .into());
        }
        let per_subsystem = total / subsystems.len() as u32;
        let lead = self.group.lead()?;
        for sub in subsystems {
            let base = lead.cli().namespace_list(&sub.nqn).await?.len() as u32;
            info!(
                "adding {per_subsystem} namespaces to {} (restricted: {no_auto_visible})",
                sub.nqn
            );
            fan_out(self.workers, 0..per_subsystem, |i| {
                let cli = lead.cli().clone();
                let nqn = sub.nqn.clone();
                let pool = self.group.pool.clone();
                let image = unique_image(sub.serial, base + i + 1);
                let size = image_size.to_string();
                async move {
                    cli.namespace_add(&nqn, &pool, &image, &size, None, no_auto_visible)
                        .await
                }
            })
            .await?;
        }
        Ok(per_subsystem * subsystems.len() as u32)
    }

    /// Grant each initiator its share of every subsystem's namespaces.
    pub async fn add_host(&self, subsystems: &[SubsystemConfig]) -> Result<(), WorkflowError> {
        self.change_grants(subsystems, true).await
    }

    /// Revoke the grants `add_host` made.
    pub async fn del_host(&self, subsystems: &[SubsystemConfig]) -> Result<(), WorkflowError> {
        self.change_grants(subsystems, false).await
    }

    async fn change_grants(
        &self,
        subsystems: &[SubsystemConfig],
        grant: bool,
    ) -> Result<(), WorkflowError> {
        let lead = self.group.lead()?;
        let verb = if grant { "granting" } else { "revoking" };
        for sub in subsystems {
            let total = lead.cli().namespace_list(&sub.nqn).await?.len() as u32;
            for (idx, initiator) in self.initiators.iter().enumerate() {
                let hostnqn = initiator.hostnqn().await?;
                let nsids = expected_nsids(total, self.initiators.len(), idx);
                info!(
                    "{verb} nsids {:?} of {} for {}",
                    nsids, sub.nqn, initiator.node.id
                );
                for nsid in nsids {
                    if grant {
                        lead.cli()
                            .namespace_add_host(&sub.nqn, nsid, &hostnqn)
                            .await?;
                    } else {
                        lead.cli()
                            .namespace_del_host(&sub.nqn, nsid, &hostnqn)
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Flip auto_visible on every namespace of every subsystem. `force` is
    /// required by the gateway when a namespace already has host grants.
    pub async fn change_visibility(
        &self,
        subsystems: &[SubsystemConfig],
        auto_visible: bool,
        force: bool,
    ) -> Result<(), WorkflowError> {
        let lead = self.group.lead()?;
        for sub in subsystems {
            for ns in lead.cli().namespace_list(&sub.nqn).await? {
                lead.cli()
                    .namespace_change_visibility(&sub.nqn, ns.nsid, auto_visible, force)
                    .await?;
            }
        }
        Ok(())
    }

    /// Gateway-side check: every namespace carries the wanted visibility
    /// flag, and when `owners` is given, exactly the owning host's NQN.
    /// Pass an empty owner list to require that no grants remain.
    pub async fn validate_namespaces(
        &self,
        subsystems: &[SubsystemConfig],
        auto_visible: bool,
        owners: Option<&[String]>,
    ) -> Result<(), WorkflowError> {
        let lead = self.group.lead()?;
        for sub in subsystems {
            let namespaces = lead.cli().namespace_list(&sub.nqn).await?;
            let total = namespaces.len() as u32;
            for ns in &namespaces {
                ensure(ns.auto_visible == auto_visible, || {
                    format!(
                        "{}: nsid {} has auto_visible {}, want {auto_visible}",
                        sub.nqn, ns.nsid, ns.auto_visible
                    )
                })?;
                let Some(owners) = owners else { continue };
                let expect: Vec<String> = owner_of(total, owners.len(), ns.nsid)
                    .map(|idx| vec![owners[idx].clone()])
                    .unwrap_or_default();
                ensure(ns.hosts == expect, || {
                    format!(
                        "{}: nsid {} is granted to {:?}, want {:?}",
                        sub.nqn, ns.nsid, ns.hosts, expect
                    )
                })?;
            }
        }
        Ok(())
    }

    /// Initiator-side check: reconnect each initiator and compare the NSIDs
    /// its kernel exposes against what the masking rules allow. With
    /// `validate_node` set, only that initiator is checked.
    pub async fn validate_initiators(
        &self,
        subsystems: &[SubsystemConfig],
        specs: &HashMap<String, Vec<ConnectSpec>>,
        visibility: Visibility,
        validate_node: Option<&str>,
    ) -> Result<(), WorkflowError> {
        let lead = self.group.lead()?;

        // Wire serial and namespace count per subsystem, keyed by NQN.
        let listed = lead.cli().subsystem_list().await?;
        let mut inventory = Vec::new();
        for sub in subsystems {
            let serial = listed
                .iter()
                .find(|s| s.nqn == sub.nqn)
                .map(|s| s.serial_number.clone())
                .ok_or_else(|| {
                    CheckError::new(format!("{} is not on the gateway", sub.nqn))
                })?;
            let total = lead.cli().namespace_list(&sub.nqn).await?.len() as u32;
            inventory.push((sub.nqn.clone(), serial, total));
        }

        for (idx, initiator) in self.initiators.iter().enumerate() {
            if let Some(only) = validate_node {
                if initiator.node.id != only {
                    continue;
                }
            }
            // Reconnect so the kernel re-enumerates what it may see now.
            initiator.disconnect_all().await?;
            let node_specs = specs.get(&initiator.node.id).ok_or_else(|| {
                CheckError::new(format!("no connect spec for {}", initiator.node.id))
            })?;
            for spec in node_specs {
                initiator.connect_targets(spec).await?;
            }
            let devices = retry(LIST_RETRY, || initiator.list_devices()).await?;

            for (nqn, serial, total) in &inventory {
                let visible = visible_nsids(&devices, serial);
                let expect: HashSet<u32> = match visibility {
                    Visibility::All => (1..=*total).collect(),
                    Visibility::Nothing => HashSet::new(),
                    Visibility::OwnShare => {
                        expected_nsids(*total, self.initiators.len(), idx)
                            .into_iter()
                            .collect()
                    }
                };
                ensure(visible == expect, || {
                    format!(
                        "{}: {nqn} exposes nsids {:?}, want {:?}",
                        initiator.node.id,
                        sorted(&visible),
                        sorted(&expect)
                    )
                })?;
            }
        }
        Ok(())
    }
}

fn sorted(set: &HashSet<u32>) -> Vec<u32> {
    let mut v: Vec<u32> = set.iter().copied().collect();
    v.sort_unstable();
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_are_contiguous_and_leave_the_remainder_unowned() {
        // 10 namespaces over 3 hosts: 3 each, nsid 10 owned by nobody.
        assert_eq!(expected_nsids(10, 3, 0), vec![1, 2, 3]);
        assert_eq!(expected_nsids(10, 3, 1), vec![4, 5, 6]);
        assert_eq!(expected_nsids(10, 3, 2), vec![7, 8, 9]);

        assert_eq!(owner_of(10, 3, 1), Some(0));
        assert_eq!(owner_of(10, 3, 6), Some(1));
        assert_eq!(owner_of(10, 3, 9), Some(2));
        assert_eq!(owner_of(10, 3, 10), None);
    }

    #[test]
    fn every_granted_nsid_has_a_matching_owner() {
        for (total, hosts) in [(10u32, 3usize), (12, 4), (7, 2), (5, 8)] {
            for idx in 0..hosts {
                for nsid in expected_nsids(total, hosts, idx) {
                    assert_eq!(owner_of(total, hosts, nsid), Some(idx), "{total}/{hosts}");
                }
            }
        }
    }

    #[test]
    fn degenerate_splits_own_nothing() {
        // More hosts than namespaces: every share is empty.
        assert_eq!(expected_nsids(5, 8, 0), Vec::<u32>::new());
        assert_eq!(owner_of(5, 8, 3), None);
        assert_eq!(expected_nsids(10, 0, 0), Vec::<u32>::new());
        assert_eq!(owner_of(10, 0, 1), None);
        assert_eq!(owner_of(10, 3, 0), None);
        assert_eq!(expected_nsids(10, 3, 5), Vec::<u32>::new());
    }
}
