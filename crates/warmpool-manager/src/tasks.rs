//! Disk and snapshot task workers.
//!
//! Requests arrive as `"<machine>:<parameter>"` members of a task set. The
//! pool, and through it the provider, is resolved from the machine record.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};
use warmpool_state::keys;

use crate::context::Context;
use crate::error::{ManagerError, ManagerResult};
use crate::lifecycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskQueue {
    /// `tasks:disk`, parameter is a size in GB.
    Disk,
    /// `tasks:snapshot` and `tasks:snapshot-revert`, parameter is a
    /// snapshot name.
    Snapshot,
}

#[derive(Debug, Clone, Copy)]
enum TaskKind {
    AttachDisk,
    CreateSnapshot,
    RevertSnapshot,
}

impl TaskKind {
    fn queue_key(self) -> &'static str {
        match self {
            Self::AttachDisk => keys::DISK_TASKS,
            Self::CreateSnapshot => keys::SNAPSHOT_TASKS,
            Self::RevertSnapshot => keys::REVERT_TASKS,
        }
    }

    fn operation(self) -> &'static str {
        match self {
            Self::AttachDisk => "attach_disk",
            Self::CreateSnapshot => "create_snapshot",
            Self::RevertSnapshot => "revert_snapshot",
        }
    }
}

impl TaskQueue {
    pub fn worker_name(self) -> &'static str {
        match self {
            Self::Disk => "disk_manager",
            Self::Snapshot => "snapshot_manager",
        }
    }

    fn kinds(self) -> &'static [TaskKind] {
        match self {
            Self::Disk => &[TaskKind::AttachDisk],
            Self::Snapshot => &[TaskKind::CreateSnapshot, TaskKind::RevertSnapshot],
        }
    }

    /// Pop at most one request from each of this worker's task sets and
    /// dispatch it. Returns how many requests were dispatched.
    ///
    /// A request that cannot be parsed or resolved is logged and dropped.
    pub fn tick(self, ctx: &Arc<Context>) -> ManagerResult<usize> {
        let mut dispatched = 0;
        for kind in self.kinds() {
            let Some(item) = ctx.store.spop(kind.queue_key())? else {
                continue;
            };
            match dispatch_task(ctx, *kind, &item) {
                Ok(()) => dispatched += 1,
                Err(e) => error!(worker = self.worker_name(), %item, error = %e, "dropping task"),
            }
        }
        Ok(dispatched)
    }

    /// Drain the task sets every `task_queue_delay_secs` until shutdown or
    /// `max_iterations`.
    pub async fn run(self, ctx: Arc<Context>, mut shutdown: watch::Receiver<bool>, max_iterations: Option<u64>) {
        let interval = Duration::from_secs(ctx.config.config.task_queue_delay_secs);
        info!(worker = self.worker_name(), "task worker started");
        let mut iterations = 0u64;
        loop {
            if let Err(e) = self.tick(&ctx) {
                error!(worker = self.worker_name(), error = %e, "task worker tick failed");
            }
            iterations += 1;
            if max_iterations.is_some_and(|max| iterations >= max) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!(worker = self.worker_name(), "task worker shutting down");
                    break;
                }
            }
        }
    }
}

fn dispatch_task(ctx: &Arc<Context>, kind: TaskKind, item: &str) -> ManagerResult<()> {
    let (machine, param) = item
        .split_once(':')
        .filter(|(m, p)| !m.is_empty() && !p.is_empty())
        .ok_or_else(|| ManagerError::MalformedTask {
            queue: kind.queue_key().to_string(),
            item: item.to_string(),
        })?;
    let pool = ctx
        .store
        .machine(machine)?
        .and_then(|r| r.pool().map(str::to_string))
        .ok_or_else(|| ManagerError::UnknownPool(machine.to_string()))?;
    let provider = ctx.provider_for(&pool)?;

    let task_ctx = ctx.clone();
    let machine = machine.to_string();
    let param = param.to_string();
    let name = machine.clone();
    ctx.dispatcher.spawn(kind.operation(), name, async move {
        let provider = provider.as_ref();
        match kind {
            TaskKind::AttachDisk => {
                lifecycle::attach_disk(&task_ctx, &pool, provider, &machine, &param).await?;
            }
            TaskKind::CreateSnapshot => {
                lifecycle::create_snapshot(&task_ctx, &pool, provider, &machine, &param).await?;
            }
            TaskKind::RevertSnapshot => {
                lifecycle::revert_snapshot(&pool, provider, &machine, &param).await?;
            }
        }
        Ok(())
    });
    Ok(())
}
