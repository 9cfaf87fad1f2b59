// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Workload generation and IO validation. fio writes through the devices an
//! initiator exposes while `rbd du` on the cluster side proves the bytes
//! actually land in the backing images.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::check::{CheckError, WorkflowError};
use crate::config::IoConfig;
use crate::gateway::NamespaceRef;
use crate::orch::Orch;
use crate::remote::{retry, ExecError, Executor, RetryPolicy};
use crate::session::{fan_out, IoSession};

static JOB_COUNT: AtomicU32 = AtomicU32::new(0);

/// One fio invocation. Jobs get unique names so overlapping runs against
/// the same device stay tellable apart in logs.
#[derive(Debug, Clone)]
pub struct FioJob {
    pub name: String,
    pub filename: String,
    pub rw: String,
    pub blocksize: String,
    pub iodepth: u32,
    pub numjobs: u32,
    pub runtime_secs: u64,
}

impl FioJob {
    pub fn new(filename: &str, runtime_secs: u64) -> Self {
        let n = JOB_COUNT.fetch_add(1, Ordering::SeqCst);
        FioJob {
            name: format!("cuttle-job-{n}"),
            filename: filename.to_string(),
            rw: "randwrite".to_string(),
            blocksize: "4k".to_string(),
            iodepth: 4,
            numjobs: 1,
            runtime_secs,
        }
    }

    pub fn with_rw(mut self, rw: &str) -> Self {
        self.rw = rw.to_string();
        self
    }

    pub fn with_blocksize(mut self, blocksize: &str) -> Self {
        self.blocksize = blocksize.to_string();
        self
    }

    pub fn with_iodepth(mut self, iodepth: u32) -> Self {
        self.iodepth = iodepth;
        self
    }

    pub fn with_numjobs(mut self, numjobs: u32) -> Self {
        self.numjobs = numjobs;
        self
    }

    pub fn as_args(&self) -> Vec<String> {
        vec![
            format!("--name={}", self.name),
            format!("--filename={}", self.filename),
            format!("--rw={}", self.rw),
            format!("--bs={}", self.blocksize),
            format!("--iodepth={}", self.iodepth),
            format!("--numjobs={}", self.numjobs),
            "--direct=1".to_string(),
            "--time_based".to_string(),
            format!("--runtime={}", self.runtime_secs),
            "--group_reporting".to_string(),
        ]
    }

    pub fn command(&self) -> String {
        format!("fio {}", self.as_args().join(" "))
    }
}

/// Start a fio job on an initiator as a detached session task. The job runs
/// for its configured runtime; shutting the session down aborts whatever is
/// still writing.
pub fn spawn_fio(session: &mut IoSession, exec: Arc<dyn Executor>, hostname: &str, job: FioJob) {
    let label = format!("{hostname}:{}", job.name);
    let host = hostname.to_string();
    session.spawn(&label, async move {
        info!("{host}: starting {} against {}", job.name, job.filename);
        match exec.exec(&host, &job.command()).await {
            Ok(out) if out.status == Some(0) => debug!("{host}: {} finished", job.name),
            Ok(out) => warn!(
                "{host}: {} exited with {:?}: {}",
                job.name,
                out.status,
                out.stderr.trim_end()
            ),
            Err(err) => warn!("{host}: {} did not run: {err}", job.name),
        }
    });
}

/// Start one write job per device.
pub fn spawn_workload(
    session: &mut IoSession,
    exec: Arc<dyn Executor>,
    hostname: &str,
    devices: &[String],
    conf: &IoConfig,
) {
    for device in devices {
        spawn_fio(
            session,
            exec.clone(),
            hostname,
            FioJob::new(device, conf.fio_runtime_secs),
        );
    }
}

#[derive(Debug)]
pub enum IoError {
    Exec(ExecError),
    /// Usage samples did not strictly increase while writes were expected
    /// to land.
    Stalled { image: String, samples: Vec<u64> },
    /// Usage grew although the namespace was expected to take no writes.
    Progressed { image: String, samples: Vec<u64> },
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IoError::Exec(err) => write!(f, "{err}"),
            IoError::Stalled { image, samples } => {
                write!(f, "usage of {image} did not strictly increase: {samples:?}")
            }
            IoError::Progressed { image, samples } => {
                write!(f, "usage of {image} grew while no writes were expected: {samples:?}")
            }
        }
    }
}

impl From<IoError> for WorkflowError {
    fn from(err: IoError) -> WorkflowError {
        match err {
            IoError::Exec(err) => WorkflowError::Exec(err),
            other => WorkflowError::Check(CheckError::new(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ValidateOpts {
    pub samples: usize,
    pub interval: Duration,
    pub retry: RetryPolicy,
    pub workers: usize,
}

impl ValidateOpts {
    pub fn from_config(conf: &IoConfig) -> Self {
        ValidateOpts {
            samples: 3,
            interval: Duration::from_secs(conf.sample_interval_secs),
            retry: RetryPolicy::new(conf.retries, Duration::from_secs(conf.retry_delay_secs)),
            workers: conf.workers,
        }
    }
}

/// Prove IO is (or is not) flowing to every namespace by sampling image
/// usage. Each namespace is watched independently and the whole watch is
/// retried within the budget, so a slow fio ramp or a transient `rbd du`
/// failure gets another window before it counts.
pub async fn validate_io(
    orch: &Orch,
    namespaces: &[NamespaceRef],
    negative: bool,
    opts: &ValidateOpts,
) -> Result<(), WorkflowError> {
    if namespaces.is_empty() {
        return Ok(());
    }
    info!(
        "validating io on {} namespaces, {} samples {:?} apart{}",
        namespaces.len(),
        opts.samples,
        opts.interval,
        if negative { ", expecting no growth" } else { "" }
    );
    fan_out(opts.workers, namespaces, |ns| async move {
        retry(opts.retry, || watch_usage(orch, ns, negative, opts)).await
    })
    .await
    .map(drop)
    .map_err(WorkflowError::from)
}

async fn watch_usage(
    orch: &Orch,
    ns: &NamespaceRef,
    negative: bool,
    opts: &ValidateOpts,
) -> Result<(), IoError> {
    let mut samples = Vec::with_capacity(opts.samples);
    for i in 0..opts.samples {
        if i > 0 {
            tokio::time::sleep(opts.interval).await;
        }
        let used = orch
            .rbd_du(&ns.pool, &ns.image)
            .await
            .map_err(IoError::Exec)?;
        debug!("{ns}: {used} bytes used");
        samples.push(used);
    }
    if negative {
        if any_growth(&samples) {
            return Err(IoError::Progressed {
                image: ns.image.clone(),
                samples,
            });
        }
    } else if !strictly_increasing(&samples) {
        return Err(IoError::Stalled {
            image: ns.image.clone(),
            samples,
        });
    }
    Ok(())
}

fn strictly_increasing(samples: &[u64]) -> bool {
    samples.windows(2).all(|w| w[1] > w[0])
}

fn any_growth(samples: &[u64]) -> bool {
    samples.windows(2).any(|w| w[1] > w[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_checks() {
        assert!(strictly_increasing(&[100, 150, 220]));
        assert!(!strictly_increasing(&[100, 100, 220]));
        assert!(!strictly_increasing(&[100, 150, 150]));
        assert!(!strictly_increasing(&[100, 90, 220]));

        assert!(!any_growth(&[100, 100, 100]));
        assert!(any_growth(&[100, 100, 120]));
        assert!(!any_growth(&[100, 90, 80]));
    }

    #[test]
    fn fio_jobs_get_unique_names_and_full_args() {
        let a = FioJob::new("/dev/nvme1n1", 600);
        let b = FioJob::new("/dev/nvme1n2", 600);
        assert_ne!(a.name, b.name);

        let cmd = a.with_iodepth(8).with_numjobs(2).command();
        assert!(cmd.starts_with("fio --name=cuttle-job-"));
        assert!(cmd.contains("--filename=/dev/nvme1n1"));
        assert!(cmd.contains("--rw=randwrite"));
        assert!(cmd.contains("--iodepth=8"));
        assert!(cmd.contains("--numjobs=2"));
        assert!(cmd.contains("--runtime=600"));
    }

    #[test]
    fn stalls_become_check_failures_and_exec_stays_transient() {
        let stalled = IoError::Stalled {
            image: "image-1".to_string(),
            samples: vec![100, 100, 100],
        };
        assert!(matches!(
            WorkflowError::from(stalled),
            WorkflowError::Check(_)
        ));

        let exec = IoError::Exec(ExecError::parse("rbd du", "bad json"));
        assert!(matches!(WorkflowError::from(exec), WorkflowError::Exec(_)));
    }
}
