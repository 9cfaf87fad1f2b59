// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! ANA report parsing. The cluster reports gateway availability and
//! per-group active/standby state; the shape of that report changed across
//! releases, so both forms parse into the same snapshot here. Snapshots are
//! never cached: every validation decision polls a fresh one.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

use crate::remote::ExecError;

/// Availability of one gateway as reported by the cluster. Ordered worst
/// first so the minimum of a set is the state an operator cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Availability {
    Unknown,
    Unavailable,
    Deleting,
    Created,
    Available,
}

impl Availability {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "AVAILABLE" => Availability::Available,
            "UNAVAILABLE" => Availability::Unavailable,
            "CREATED" => Availability::Created,
            "DELETING" => Availability::Deleting,
            _ => Availability::Unknown,
        }
    }

    /// Worst availability across a set of gateways.
    pub fn get_worst(states: impl Iterator<Item = Availability>) -> Availability {
        states.min().unwrap_or(Availability::Unknown)
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            "{}",
            match self {
                Availability::Unknown => "UNKNOWN",
                Availability::Unavailable => "UNAVAILABLE",
                Availability::Deleting => "DELETING",
                Availability::Created => "CREATED",
                Availability::Available => "AVAILABLE",
            }
        )
    }
}

/// One ANA group's state as seen from one gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupState {
    Active,
    Standby,
    /// Transitional states like WAIT_FAILBACK_PREPARED show up mid-failover.
    Other(String),
}

impl GroupState {
    fn parse(s: &str) -> Self {
        match s {
            "ACTIVE" => GroupState::Active,
            "STANDBY" => GroupState::Standby,
            other => GroupState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match self {
            GroupState::Active => write!(f, "ACTIVE"),
            GroupState::Standby => write!(f, "STANDBY"),
            GroupState::Other(s) => write!(f, "{s}"),
        }
    }
}

/// One gateway's entry in the report.
#[derive(Debug, Clone)]
pub struct GatewayReport {
    /// Daemon identity, e.g. "client.nvmeof.rbd.group1.node6.xyzabc".
    pub gw_id: String,
    pub ana_group_id: u32,
    pub availability: Availability,
    /// ANA group id -> state from this gateway's perspective.
    pub states: BTreeMap<u32, GroupState>,
}

impl GatewayReport {
    /// Whether this entry belongs to the daemon on `hostname`. The gw-id
    /// embeds the bare hostname as one dot-separated segment, so match on
    /// the first label of a possibly fully qualified name.
    pub fn is_on(&self, hostname: &str) -> bool {
        let label = hostname.split('.').next().unwrap_or(hostname);
        self.gw_id.split('.').any(|seg| seg == label)
    }
}

/// Point-in-time view of every gateway in a group.
#[derive(Debug, Clone, Default)]
pub struct AnaReport {
    pub gateways: Vec<GatewayReport>,
}

impl AnaReport {
    pub fn find_by_hostname(&self, hostname: &str) -> Option<&GatewayReport> {
        self.gateways.iter().find(|gw| gw.is_on(hostname))
    }

    /// Gateways currently serving `ana_group_id`: available and ACTIVE for
    /// that group. Exactly one entry is the healthy answer.
    pub fn active_for(&self, ana_group_id: u32) -> Vec<&GatewayReport> {
        self.gateways
            .iter()
            .filter(|gw| {
                gw.availability == Availability::Available
                    && gw.states.get(&ana_group_id) == Some(&GroupState::Active)
            })
            .collect()
    }

    pub fn worst_availability(&self) -> Availability {
        Availability::get_worst(self.gateways.iter().map(|gw| gw.availability))
    }
}

#[derive(Deserialize)]
struct RawReport {
    #[serde(rename = "Created Gateways:", default)]
    created: Vec<RawGateway>,
}

#[derive(Deserialize)]
struct RawGateway {
    #[serde(rename = "gw-id")]
    gw_id: String,
    #[serde(rename = "anagrp-id")]
    ana_group_id: u32,
    #[serde(rename = "Availability")]
    availability: String,
    #[serde(rename = "ana states", default)]
    ana_states: String,
}

impl RawGateway {
    fn into_report(self) -> Result<GatewayReport, ExecError> {
        Ok(GatewayReport {
            states: parse_states(&self.ana_states)?,
            gw_id: self.gw_id,
            ana_group_id: self.ana_group_id,
            availability: Availability::parse(&self.availability),
        })
    }
}

/// Parse an "ana states" string of "id: STATE" pairs, e.g.
/// " 1: ACTIVE , 2: STANDBY".
fn parse_states(raw: &str) -> Result<BTreeMap<u32, GroupState>, ExecError> {
    let mut states = BTreeMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((id, state)) = pair.split_once(':') else {
            return Err(ExecError::parse(
                "ceph nvme-gw show",
                format!("ana state pair '{pair}' has no ':'"),
            ));
        };
        let id = id.trim().parse::<u32>().map_err(|_| {
            ExecError::parse(
                "ceph nvme-gw show",
                format!("ana group id '{}' is not a number", id.trim()),
            )
        })?;
        states.insert(id, GroupState::parse(state.trim()));
    }
    Ok(states)
}

/// Newer report: one JSON object with the gateway list keyed
/// "Created Gateways:".
pub fn parse_report_json(raw: &str) -> Result<AnaReport, ExecError> {
    let parsed: RawReport = serde_json::from_str(raw)
        .map_err(|e| ExecError::parse("ceph nvme-gw show", e.to_string()))?;
    let gateways = parsed
        .created
        .into_iter()
        .map(RawGateway::into_report)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(AnaReport { gateways })
}

/// Older report: free text with one brace-delimited JSON fragment per
/// gateway. Fragments do not nest.
pub fn parse_report_fragments(raw: &str) -> Result<AnaReport, ExecError> {
    let mut gateways = Vec::new();
    let mut rest = raw;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let fragment = &rest[start..start + len + 1];
        let gw: RawGateway = serde_json::from_str(fragment)
            .map_err(|e| ExecError::parse("ceph nvme-gw show", e.to_string()))?;
        gateways.push(gw.into_report()?);
        rest = &rest[start + len + 1..];
    }
    Ok(AnaReport { gateways })
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON_REPORT: &str = r#"{
        "Created Gateways:": [
            {
                "gw-id": "client.nvmeof.rbd.group1.node6.qwerty",
                "anagrp-id": 1,
                "performed-full-startup": 1,
                "Availability": "AVAILABLE",
                "ana states": " 1: ACTIVE , 2: STANDBY"
            },
            {
                "gw-id": "client.nvmeof.rbd.group1.node7.asdfgh",
                "anagrp-id": 2,
                "performed-full-startup": 1,
                "Availability": "UNAVAILABLE",
                "ana states": " 1: STANDBY , 2: STANDBY"
            }
        ]
    }"#;

    const FRAGMENT_REPORT: &str = r#"
num gws 2
{"gw-id": "client.nvmeof.rbd.group1.node6.qwerty", "anagrp-id": 1,
 "Availability": "AVAILABLE", "ana states": "1: ACTIVE, 2: STANDBY"}
{"gw-id": "client.nvmeof.rbd.group1.node7.asdfgh", "anagrp-id": 2,
 "Availability": "UNAVAILABLE", "ana states": "1: STANDBY, 2: STANDBY"}
"#;

    #[test]
    fn both_formats_parse_to_the_same_snapshot() {
        let new = parse_report_json(JSON_REPORT).unwrap();
        let old = parse_report_fragments(FRAGMENT_REPORT).unwrap();
        for report in [&new, &old] {
            assert_eq!(report.gateways.len(), 2);
            let gw6 = report.find_by_hostname("node6").unwrap();
            assert_eq!(gw6.ana_group_id, 1);
            assert_eq!(gw6.availability, Availability::Available);
            assert_eq!(gw6.states.get(&1), Some(&GroupState::Active));
            assert_eq!(gw6.states.get(&2), Some(&GroupState::Standby));
            assert_eq!(
                report.find_by_hostname("node7").unwrap().availability,
                Availability::Unavailable
            );
        }
    }

    #[test]
    fn active_for_reports_serving_gateway() {
        let report = parse_report_json(JSON_REPORT).unwrap();
        let active = report.active_for(1);
        assert_eq!(active.len(), 1);
        assert!(active[0].is_on("node6"));
        // Group 2's owner is down and nobody took over in this snapshot.
        assert!(report.active_for(2).is_empty());
    }

    #[test]
    fn matches_fully_qualified_hostnames() {
        let report = parse_report_json(JSON_REPORT).unwrap();
        assert!(report.find_by_hostname("node6.example.com").is_some());
        assert!(report.find_by_hostname("node9").is_none());
    }

    #[test]
    fn worst_availability_ranks_unavailable_first() {
        let report = parse_report_json(JSON_REPORT).unwrap();
        assert_eq!(report.worst_availability(), Availability::Unavailable);
        assert_eq!(
            Availability::get_worst([Availability::Available, Availability::Created].into_iter()),
            Availability::Created
        );
    }

    #[test]
    fn rejects_garbled_state_pairs() {
        assert!(parse_states("1 ACTIVE").is_err());
        assert!(parse_states("x: ACTIVE").is_err());
        assert!(parse_states("").unwrap().is_empty());
    }
}
