//! Worker supervision.
//!
//! The supervisor starts one loop per pool plus the disk, snapshot and host
//! selector workers, then sweeps them every `supervisor_delay_secs`. A
//! worker whose task has finished, for any reason, is started again.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use warmpool_state::keys;

use crate::context::Context;
use crate::error::ManagerResult;
use crate::orchestrator::PoolOrchestrator;
use crate::tasks::TaskQueue;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Pool(String),
    Disk,
    Snapshot,
    HostSelector,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pool(name) => write!(f, "pool:{name}"),
            Self::Disk => f.write_str(TaskQueue::Disk.worker_name()),
            Self::Snapshot => f.write_str(TaskQueue::Snapshot.worker_name()),
            Self::HostSelector => f.write_str("host_selector"),
        }
    }
}

pub struct Supervisor {
    ctx: Arc<Context>,
    workers: HashMap<WorkerKind, JoinHandle<()>>,
    /// Iteration bound handed to every worker loop.
    worker_iterations: Option<u64>,
    restarts: u64,
}

impl Supervisor {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            workers: HashMap::new(),
            worker_iterations: None,
            restarts: 0,
        }
    }

    /// Bound every worker loop to `iterations` ticks.
    pub fn with_worker_iterations(mut self, iterations: Option<u64>) -> Self {
        self.worker_iterations = iterations;
        self
    }

    /// Every worker the configuration calls for.
    pub fn expected_workers(&self) -> Vec<WorkerKind> {
        let mut kinds = vec![WorkerKind::Disk, WorkerKind::Snapshot, WorkerKind::HostSelector];
        kinds.extend(
            self.ctx
                .config
                .pools
                .iter()
                .map(|p| WorkerKind::Pool(p.name.clone())),
        );
        kinds
    }

    /// Workers restarted after their first start.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Clear admission state left behind by a previous process.
    pub fn reset_admission(&self) -> ManagerResult<()> {
        let store = &self.ctx.store;
        let stale_clones = store.counter(keys::CLONE_TASKS)?;
        store.set_counter(keys::CLONE_TASKS, 0)?;
        store.del(keys::MIGRATIONS)?;
        store.del(keys::HOST_SELECTION_GUARD)?;
        if stale_clones > 0 {
            info!(stale_clones, "reset clone admission counter");
        }
        Ok(())
    }

    fn spawn(&self, kind: &WorkerKind, shutdown: watch::Receiver<bool>) -> ManagerResult<JoinHandle<()>> {
        let ctx = self.ctx.clone();
        let iterations = self.worker_iterations;
        let handle = match kind {
            WorkerKind::Pool(pool) => {
                let orchestrator = PoolOrchestrator::new(ctx, pool)?;
                tokio::spawn(async move { orchestrator.run(shutdown, iterations).await })
            }
            WorkerKind::Disk => tokio::spawn(TaskQueue::Disk.run(ctx, shutdown, iterations)),
            WorkerKind::Snapshot => tokio::spawn(TaskQueue::Snapshot.run(ctx, shutdown, iterations)),
            WorkerKind::HostSelector => {
                tokio::spawn(async move { ctx.hosts.run(shutdown, iterations).await })
            }
        };
        Ok(handle)
    }

    /// Start missing workers and restart finished ones. Returns how many
    /// were started.
    pub fn sweep(&mut self, shutdown: &watch::Receiver<bool>) -> usize {
        let mut started = 0;
        for kind in self.expected_workers() {
            let restart = match self.workers.get(&kind) {
                None => false,
                Some(handle) if handle.is_finished() => true,
                Some(_) => continue,
            };
            if restart {
                warn!(worker = %kind, "worker exited, restarting");
            }
            match self.spawn(&kind, shutdown.clone()) {
                Ok(handle) => {
                    debug!(worker = %kind, "worker started");
                    self.workers.insert(kind, handle);
                    if restart {
                        self.restarts += 1;
                    }
                    started += 1;
                }
                Err(e) => error!(worker = %kind, error = %e, "failed to start worker"),
            }
        }
        match self.ctx.store.purge_expired() {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "expired keys purged"),
            Err(e) => warn!(error = %e, "failed to purge expired keys"),
        }
        started
    }

    /// Supervise until shutdown or `max_sweeps`.
    ///
    /// On shutdown, running workers are awaited so in-flight ticks finish;
    /// when `max_sweeps` is reached they are aborted instead.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>, max_sweeps: Option<u64>) -> ManagerResult<()> {
        self.reset_admission()?;
        let interval = Duration::from_secs(self.ctx.config.config.supervisor_delay_secs);
        info!(
            pools = self.ctx.config.pools.len(),
            interval_secs = interval.as_secs(),
            "supervisor started"
        );

        let mut sweeps = 0u64;
        let graceful = loop {
            self.sweep(&shutdown);
            sweeps += 1;
            if max_sweeps.is_some_and(|max| sweeps >= max) {
                break false;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break true,
            }
        };

        if graceful {
            info!("supervisor shutting down, waiting for workers");
            for (kind, handle) in self.workers.drain() {
                if let Err(e) = handle.await
                    && e.is_panic()
                {
                    error!(worker = %kind, "worker panicked during shutdown");
                }
            }
        } else {
            for (_, handle) in self.workers.drain() {
                handle.abort();
            }
        }
        self.ctx.dispatcher.wait_idle().await;
        info!(restarts = self.restarts, "supervisor stopped");
        Ok(())
    }
}
