// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! QoS limits: push them onto every namespace of a subsystem, then read
//! them back and confirm the gateway applied what was asked. The gateway
//! rounds IOPS limits up to the next multiple of 1000, so the verify side
//! expects the rounded value.

use log::info;
use serde::Deserialize;

use crate::check::{ensure, CheckError, WorkflowError};
use crate::config::ConfigError;
use crate::gwcli::{GwCli, NamespaceInfo, QosSpec};
use crate::remote::{parse_json, ExecError, Executor};

/// Throughput may wobble around a cap; tolerate this much overshoot.
const RATE_SLACK: f64 = 1.1;

pub fn round_up_iops(v: u64) -> u64 {
    (v + 999) / 1000 * 1000
}

/// The limits the gateway is expected to report back for a requested spec.
pub fn expected_limits(spec: &QosSpec) -> QosSpec {
    QosSpec {
        rw_ios_per_second: spec.rw_ios_per_second.map(round_up_iops),
        ..*spec
    }
}

fn limits_match(ns: &NamespaceInfo, expect: &QosSpec) -> Option<String> {
    let fields = [
        ("rw-ios-per-second", expect.rw_ios_per_second, ns.rw_ios_per_second),
        ("rw-megabytes-per-second", expect.rw_mbytes_per_second, ns.rw_mbytes_per_second),
        ("r-megabytes-per-second", expect.r_mbytes_per_second, ns.r_mbytes_per_second),
        ("w-megabytes-per-second", expect.w_mbytes_per_second, ns.w_mbytes_per_second),
    ];
    for (name, want, got) in fields {
        if let Some(want) = want {
            if got != Some(want) {
                return Some(format!(
                    "nsid {} reports {name} {:?}, want {want}",
                    ns.nsid, got
                ));
            }
        }
    }
    None
}

/// Apply one spec to every namespace of a subsystem and verify the gateway
/// reports the expected limits back.
pub async fn apply_and_verify(
    cli: &GwCli,
    subsystem: &str,
    spec: &QosSpec,
) -> Result<usize, WorkflowError> {
    if spec.is_empty() {
        return Err(ConfigError::Invalid("qos step sets no limits".to_string()).into());
    }
    let namespaces = cli.namespace_list(subsystem).await?;
    info!(
        "applying qos limits to {} namespaces of {subsystem}",
        namespaces.len()
    );
    for ns in &namespaces {
        cli.namespace_set_qos(subsystem, ns.nsid, spec).await?;
    }

    let expect = expected_limits(spec);
    for ns in cli.namespace_list(subsystem).await? {
        if let Some(what) = limits_match(&ns, &expect) {
            return Err(CheckError::new(format!("{subsystem}: {what}")).into());
        }
    }
    Ok(namespaces.len())
}

#[derive(Deserialize)]
struct IostatOut {
    sysstat: Sysstat,
}

#[derive(Deserialize)]
struct Sysstat {
    hosts: Vec<IostatHost>,
}

#[derive(Deserialize)]
struct IostatHost {
    statistics: Vec<IostatSample>,
}

#[derive(Deserialize)]
struct IostatSample {
    #[serde(default)]
    disk: Vec<DiskStat>,
}

#[derive(Deserialize)]
struct DiskStat {
    #[serde(default)]
    disk_device: String,
    #[serde(rename = "kB_wrtn/s", default)]
    write_kb_s: f64,
}

fn parse_iostat(cmd: &str, raw: &str, device: &str) -> Result<f64, ExecError> {
    let parsed: IostatOut = parse_json(cmd, raw)?;
    // iostat emits one statistics block per interval; the first covers
    // boot-to-now, the last covers the most recent interval.
    let sample = parsed
        .sysstat
        .hosts
        .first()
        .and_then(|h| h.statistics.last())
        .ok_or_else(|| ExecError::parse(cmd, "no statistics in iostat output"))?;
    let name = device.trim_start_matches("/dev/");
    sample
        .disk
        .iter()
        .find(|d| d.disk_device == name)
        .map(|d| d.write_kb_s)
        .ok_or_else(|| ExecError::parse(cmd, format!("no stats for {name}")))
}

/// Measured write rate of a device on an initiator, in kB/s over a one
/// second interval.
pub async fn write_rate(
    exec: &dyn Executor,
    hostname: &str,
    device: &str,
) -> Result<f64, ExecError> {
    let cmd = format!("iostat -d -o JSON -k {device} 1 2");
    let out = exec.run(hostname, &cmd).await?;
    parse_iostat(&cmd, &out.stdout, device)
}

/// Confirm a write cap holds on the initiator side while IO is running.
pub async fn verify_write_cap(
    exec: &dyn Executor,
    hostname: &str,
    device: &str,
    limit_mb_s: u64,
) -> Result<(), WorkflowError> {
    let rate = write_rate(exec, hostname, device).await?;
    let cap = (limit_mb_s * 1024) as f64 * RATE_SLACK;
    ensure(rate <= cap, || {
        format!("{hostname}: {device} writes at {rate:.0} kB/s, cap is {limit_mb_s} MB/s")
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iops_round_up_to_the_next_thousand() {
        assert_eq!(round_up_iops(1), 1000);
        assert_eq!(round_up_iops(999), 1000);
        assert_eq!(round_up_iops(1000), 1000);
        assert_eq!(round_up_iops(1001), 2000);
        assert_eq!(round_up_iops(0), 0);
    }

    #[test]
    fn expected_limits_round_only_iops() {
        let spec = QosSpec {
            rw_ios_per_second: Some(2500),
            rw_mbytes_per_second: Some(30),
            r_mbytes_per_second: None,
            w_mbytes_per_second: None,
        };
        let expect = expected_limits(&spec);
        assert_eq!(expect.rw_ios_per_second, Some(3000));
        assert_eq!(expect.rw_mbytes_per_second, Some(30));
    }

    #[test]
    fn mismatched_limits_are_reported_per_field() {
        let ns = NamespaceInfo {
            nsid: 3,
            rbd_image_name: "image-1".to_string(),
            rbd_pool_name: "rbd".to_string(),
            load_balancing_group: 1,
            auto_visible: true,
            hosts: Vec::new(),
            rw_ios_per_second: Some(3000),
            rw_mbytes_per_second: Some(20),
            r_mbytes_per_second: None,
            w_mbytes_per_second: None,
        };
        let want = QosSpec {
            rw_ios_per_second: Some(3000),
            rw_mbytes_per_second: Some(30),
            r_mbytes_per_second: None,
            w_mbytes_per_second: None,
        };
        let msg = limits_match(&ns, &want).unwrap();
        assert!(msg.contains("rw-megabytes-per-second"));
        assert!(limits_match(&ns, &QosSpec::default()).is_none());
    }

    #[test]
    fn iostat_output_yields_the_last_interval() {
        let raw = r#"{
            "sysstat": {
                "hosts": [
                    {
                        "nodename": "client-1",
                        "statistics": [
                            {"disk": [{"disk_device": "nvme1n1", "kB_wrtn/s": 91000.0, "kB_read/s": 0.0}]},
                            {"disk": [{"disk_device": "nvme1n1", "kB_wrtn/s": 30720.0, "kB_read/s": 0.0}]}
                        ]
                    }
                ]
            }
        }"#;
        let rate = parse_iostat("iostat", raw, "/dev/nvme1n1").unwrap();
        assert!((rate - 30720.0).abs() < f64::EPSILON);
        assert!(parse_iostat("iostat", raw, "/dev/nvme9n9").is_err());
    }
}
