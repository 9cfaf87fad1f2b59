// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Task ownership for a workflow run. Long-running IO generators are
//! spawned detached but every handle lands in an `IoSession`, which is
//! drained at scoped shutdown on success and failure paths alike. Short
//! fan-outs go through `fan_out`, where the first failure cancels the
//! in-flight siblings and surfaces as the single aggregated error.

use std::future::Future;

use futures::stream::{self, StreamExt, TryStreamExt};
use log::{debug, warn};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct IoSession {
    tasks: Vec<(String, JoinHandle<()>)>,
    /// Fan-out width used for per-namespace work in this run.
    pub workers: usize,
}

impl IoSession {
    pub fn new(workers: usize) -> Self {
        IoSession {
            tasks: Vec::new(),
            workers: workers.max(1),
        }
    }

    /// Spawn a detached task and keep its handle for shutdown.
    pub fn spawn<F>(&mut self, label: &str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!("spawning {label}");
        self.tasks.push((label.to_string(), tokio::spawn(fut)));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Abort and reap every tracked task. Remote processes the tasks
    /// started are not reached from here; cleanup of those is the
    /// workflows' teardown job.
    pub async fn shutdown(&mut self) {
        for (label, handle) in self.tasks.drain(..) {
            handle.abort();
            match handle.await {
                Ok(()) => debug!("{label}: finished"),
                Err(e) if e.is_cancelled() => debug!("{label}: cancelled"),
                Err(e) => warn!("{label}: panicked: {e}"),
            }
        }
    }
}

impl Drop for IoSession {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            warn!(
                "io session dropped with {} live tasks, aborting them",
                self.tasks.len()
            );
            for (_, handle) in &self.tasks {
                handle.abort();
            }
        }
    }
}

/// Run one future per item with at most `workers` in flight, collecting
/// every result. On the first error the remaining futures are dropped and
/// that error is returned.
pub async fn fan_out<T, E, I, F, Fut>(workers: usize, items: I, op: F) -> Result<Vec<T>, E>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    stream::iter(items.into_iter().map(op))
        .buffer_unordered(workers.max(1))
        .try_collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };
    use std::time::{Duration, Instant};

    use tokio::runtime::Runtime;

    #[test]
    fn fan_out_collects_every_result() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let done = Arc::new(AtomicU32::new(0));
            let results = fan_out(2, 0..5u32, |n| {
                let done = Arc::clone(&done);
                async move {
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok::<u32, String>(n * 2)
                }
            })
            .await
            .unwrap();
            assert_eq!(results.len(), 5);
            assert_eq!(done.load(Ordering::SeqCst), 5);
        });
    }

    #[test]
    fn fan_out_failure_cancels_siblings() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let started = Instant::now();
            let res = fan_out(8, 0..8u32, |n| async move {
                if n == 0 {
                    Err(format!("unit {n} failed"))
                } else {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(n)
                }
            })
            .await;
            assert_eq!(res.unwrap_err(), "unit 0 failed");
            assert!(started.elapsed() < Duration::from_secs(2));
        });
    }

    #[test]
    fn shutdown_reaps_stuck_tasks() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut session = IoSession::new(4);
            session.spawn("stuck", async {
                tokio::time::sleep(Duration::from_secs(600)).await;
            });
            assert_eq!(session.len(), 1);
            session.shutdown().await;
            assert!(session.is_empty());
        });
    }
}
