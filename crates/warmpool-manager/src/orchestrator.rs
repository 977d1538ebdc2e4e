//! One pool's reconciliation loop.
//!
//! A tick lists the provider inventory once, checks each queue against it,
//! then clones until pending + ready reaches the pool size. Per-machine work
//! is handed to the [`Dispatcher`](crate::Dispatcher) and never awaited by
//! the tick itself.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use warmpool_core::PoolSettings;
use warmpool_provider::Provider;
use warmpool_state::{Queue, keys};

use crate::admission::CloneSlot;
use crate::backoff::{LoopDelay, WakeReason, sleep_or_wake};
use crate::context::Context;
use crate::error::{ManagerError, ManagerResult};
use crate::{lifecycle, migration};

/// Empty-pool transitions, reported once per change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyTransition {
    BecameEmpty,
    Refilled,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub discovered: usize,
    pub checked_running: usize,
    pub checked_ready: usize,
    pub checked_pending: usize,
    pub destroyed: usize,
    pub migrated: usize,
    pub cloned: usize,
    pub empty_transition: Option<EmptyTransition>,
}

impl TickSummary {
    /// Whether the pool is still converging: new clones, machines still
    /// booting, or machines found outside every queue.
    pub fn is_active(&self) -> bool {
        self.cloned > 0 || self.checked_pending > 0 || self.discovered > 0
    }
}

struct Queues {
    pending: HashSet<String>,
    ready: HashSet<String>,
    running: HashSet<String>,
    completed: HashSet<String>,
    discovered: HashSet<String>,
    migrating: HashSet<String>,
}

impl Queues {
    fn load(ctx: &Context, pool: &str) -> ManagerResult<Self> {
        let set = |queue: Queue| -> ManagerResult<HashSet<String>> {
            Ok(ctx.store.smembers(&queue.key(pool))?.into_iter().collect())
        };
        Ok(Self {
            pending: set(Queue::Pending)?,
            ready: set(Queue::Ready)?,
            running: set(Queue::Running)?,
            completed: set(Queue::Completed)?,
            discovered: set(Queue::Discovered)?,
            migrating: set(Queue::Migrating)?,
        })
    }

    fn tracks(&self, machine: &str) -> bool {
        self.pending.contains(machine)
            || self.ready.contains(machine)
            || self.running.contains(machine)
            || self.completed.contains(machine)
            || self.discovered.contains(machine)
            || self.migrating.contains(machine)
    }
}

pub struct PoolOrchestrator {
    ctx: Arc<Context>,
    pool: PoolSettings,
    provider: Arc<dyn Provider>,
}

impl PoolOrchestrator {
    pub fn new(ctx: Arc<Context>, pool: &str) -> ManagerResult<Self> {
        let settings = ctx.pool(pool)?.clone();
        let provider = ctx.provider_for(pool)?;
        Ok(Self {
            ctx,
            pool: settings,
            provider,
        })
    }

    pub fn pool(&self) -> &str {
        &self.pool.name
    }

    /// Reconcile the pool once.
    ///
    /// An inventory listing failure skips the whole tick. A failing step is
    /// logged and the remaining steps still run.
    pub async fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();
        let inventory: HashSet<String> = match self.provider.machines_in_pool(&self.pool.name).await {
            Ok(names) => names.into_iter().collect(),
            Err(source) => {
                let e = ManagerError::InventoryListing {
                    pool: self.pool.name.clone(),
                    source,
                };
                error!(error = %e, "skipping pool tick");
                return summary;
            }
        };

        summary.discovered = self.step("inventory", self.record_discovered(&inventory));
        summary.checked_running = self.step("running", self.check_running(&inventory));
        summary.checked_ready = self.step("ready", self.check_ready(&inventory));
        summary.checked_pending = self.step("pending", self.check_pending(&inventory));
        summary.destroyed = self.step("completed", self.check_completed(&inventory));
        self.step("discovered", self.settle_discovered());
        summary.migrated = self.step("migrating", self.check_migrating(&inventory));
        match self.repopulate().await {
            Ok((cloned, transition)) => {
                summary.cloned = cloned;
                summary.empty_transition = transition;
            }
            Err(e) => error!(pool = %self.pool.name, step = "repopulate", error = %e, "pool step failed"),
        }
        summary
    }

    fn step(&self, step: &'static str, result: ManagerResult<usize>) -> usize {
        result.unwrap_or_else(|e| {
            error!(pool = %self.pool.name, step, error = %e, "pool step failed");
            0
        })
    }

    fn dispatch<F, Fut>(&self, operation: &'static str, machine: &str, op: F)
    where
        F: FnOnce(Arc<Context>, PoolSettings, Arc<dyn Provider>, String) -> Fut,
        Fut: Future<Output = ManagerResult<()>> + Send + 'static,
    {
        let fut = op(
            self.ctx.clone(),
            self.pool.clone(),
            self.provider.clone(),
            machine.to_string(),
        );
        self.ctx.dispatcher.spawn(operation, machine, fut);
    }

    /// Log a failure for one machine without stopping its queue.
    fn isolate(&self, step: &'static str, machine: &str, result: ManagerResult<bool>) -> usize {
        match result {
            Ok(counted) => usize::from(counted),
            Err(e) => {
                error!(pool = %self.pool.name, step, %machine, error = %e, "machine step failed");
                0
            }
        }
    }

    fn record_discovered(&self, inventory: &HashSet<String>) -> ManagerResult<usize> {
        let queues = Queues::load(&self.ctx, &self.pool.name)?;
        let key = Queue::Discovered.key(&self.pool.name);
        let mut found = 0;
        for machine in inventory.iter().filter(|m| !queues.tracks(m)) {
            let result = self.ctx.store.sadd(&key, machine).map_err(ManagerError::from);
            if let Ok(true) = result {
                info!(pool = %self.pool.name, %machine, "discovered untracked machine");
            }
            found += self.isolate("inventory", machine, result);
        }
        Ok(found)
    }

    /// Dispatch lifetime retirement for expired running machines.
    fn check_running(&self, inventory: &HashSet<String>) -> ManagerResult<usize> {
        let mut checked = 0;
        for machine in self.ctx.store.smembers(&Queue::Running.key(&self.pool.name))? {
            let result = if !inventory.contains(&machine) {
                self.retire_missing(Queue::Running, &machine).map(|_| false)
            } else {
                lifecycle::running_expired(&self.ctx, &self.pool, &machine).map(|expired| {
                    if expired {
                        self.dispatch("check_running", &machine, |ctx, pool, provider, machine| async move {
                            lifecycle::check_running(&ctx, &pool, provider.as_ref(), &machine).await
                        });
                    }
                    expired
                })
            };
            checked += self.isolate("running", &machine, result);
        }
        Ok(checked)
    }

    /// Dispatch health checks for ready machines whose check is due.
    fn check_ready(&self, inventory: &HashSet<String>) -> ManagerResult<usize> {
        let mut checked = 0;
        for machine in self.ctx.store.smembers(&Queue::Ready.key(&self.pool.name))? {
            let result = if !inventory.contains(&machine) {
                self.retire_missing(Queue::Ready, &machine).map(|_| false)
            } else {
                lifecycle::ready_check_due(&self.ctx, &self.pool.name, &machine).map(|due| {
                    if due {
                        self.dispatch("check_ready", &machine, |ctx, pool, provider, machine| async move {
                            lifecycle::check_ready(&ctx, &pool, provider.as_ref(), &machine).await
                        });
                    }
                    due
                })
            };
            checked += self.isolate("ready", &machine, result);
        }
        Ok(checked)
    }

    fn check_pending(&self, inventory: &HashSet<String>) -> ManagerResult<usize> {
        let mut checked = 0;
        for machine in self.ctx.store.smembers(&Queue::Pending.key(&self.pool.name))? {
            if inventory.contains(&machine) {
                self.dispatch("check_pending", &machine, |ctx, pool, provider, machine| async move {
                    lifecycle::check_pending(&ctx, &pool, provider.as_ref(), &machine).await
                });
                checked += 1;
            } else {
                self.dispatch("fail_pending", &machine, |ctx, pool, _, machine| async move {
                    lifecycle::fail_pending(&ctx, &pool, &machine, false).await.map(|_| ())
                });
            }
        }
        Ok(checked)
    }

    fn check_completed(&self, inventory: &HashSet<String>) -> ManagerResult<usize> {
        let mut destroyed = 0;
        for machine in self.ctx.store.smembers(&Queue::Completed.key(&self.pool.name))? {
            if inventory.contains(&machine) {
                self.dispatch("destroy", &machine, |ctx, pool, provider, machine| async move {
                    lifecycle::destroy_machine(&ctx, &pool, provider.as_ref(), &machine).await
                });
                destroyed += 1;
            } else {
                let result = lifecycle::purge_machine(&self.ctx, &self.pool.name, &machine);
                self.isolate("completed", &machine, result.map(|_| false));
            }
        }
        Ok(destroyed)
    }

    fn retire_missing(&self, from: Queue, machine: &str) -> ManagerResult<()> {
        let pool = &self.pool.name;
        if self.ctx.store.smove(&from.key(pool), &Queue::Completed.key(pool), machine)? {
            info!(%pool, %machine, %from, "not found in inventory, moved to completed");
        }
        Ok(())
    }

    /// Drop discovered entries already tracked elsewhere; retire the rest.
    fn settle_discovered(&self) -> ManagerResult<usize> {
        let pool = &self.pool.name;
        let queues = Queues::load(&self.ctx, pool)?;
        let key = Queue::Discovered.key(pool);
        let mut settled = 0;
        for machine in &queues.discovered {
            let tracked = queues.pending.contains(machine)
                || queues.ready.contains(machine)
                || queues.running.contains(machine)
                || queues.completed.contains(machine)
                || queues.migrating.contains(machine);
            let result = if tracked {
                self.ctx.store.srem(&key, machine)
            } else {
                self.ctx
                    .store
                    .smove(&key, &Queue::Completed.key(pool), machine)
                    .inspect(|moved| {
                        if *moved {
                            info!(%pool, %machine, "moved discovered machine to completed");
                        }
                    })
            };
            settled += self.isolate("discovered", machine, result.map_err(ManagerError::from));
        }
        Ok(settled)
    }

    /// Hand present migrating machines to the migration workflow; requests
    /// for machines no longer in inventory are dropped.
    fn check_migrating(&self, inventory: &HashSet<String>) -> ManagerResult<usize> {
        let key = Queue::Migrating.key(&self.pool.name);
        let mut dispatched = 0;
        for machine in self.ctx.store.smembers(&key)? {
            if inventory.contains(&machine) {
                self.dispatch("migrate", &machine, |ctx, pool, provider, machine| async move {
                    migration::migrate_machine(&ctx, &pool, provider.as_ref(), &machine)
                        .await
                        .map(|_| ())
                });
                dispatched += 1;
            } else {
                let result = self.ctx.store.srem(&key, &machine).map(|_| false);
                self.isolate("migrating", &machine, result.map_err(ManagerError::from));
            }
        }
        Ok(dispatched)
    }

    async fn repopulate(&self) -> ManagerResult<(usize, Option<EmptyTransition>)> {
        let pool = &self.pool.name;
        let store = &self.ctx.store;
        let ready = store.scard(&Queue::Ready.key(pool))?;
        let pending = store.scard(&Queue::Pending.key(pool))?;
        let running = store.scard(&Queue::Running.key(pool))?;

        self.ctx.metrics.gauge(&format!("ready.{pool}"), ready as u64).await;
        self.ctx.metrics.gauge(&format!("running.{pool}"), running as u64).await;

        let empty_key = keys::empty_flag(pool);
        let transition = if ready == 0 && self.pool.size > 0 {
            if store.set_if_absent(&empty_key, "1")? {
                warn!(%pool, "pool is empty");
                Some(EmptyTransition::BecameEmpty)
            } else {
                None
            }
        } else if store.del(&empty_key)? {
            info!(%pool, ready, "pool is no longer empty");
            Some(EmptyTransition::Refilled)
        } else {
            None
        };

        let mut total = ready + pending;
        let mut cloned = 0;
        while total < self.pool.size as usize {
            let Some(slot) = CloneSlot::acquire(store, self.ctx.config.config.task_limit)? else {
                debug!(%pool, "clone task limit reached");
                break;
            };
            let machine = lifecycle::register_clone(&self.ctx, pool)?;
            self.dispatch("clone", &machine, move |ctx, pool, provider, machine| async move {
                lifecycle::finish_clone(&ctx, &pool, provider.as_ref(), &machine, slot).await
            });
            total += 1;
            cloned += 1;
        }
        Ok((cloned, transition))
    }

    /// Tick until shutdown or `max_iterations`, pacing with [`LoopDelay`]
    /// and waking early when the ready queue changes size.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, max_iterations: Option<u64>) {
        let global = &self.ctx.config.config;
        let mut delay = LoopDelay::new(self.pool.loop_delay(global));
        let poll = Duration::from_millis(global.wakeup_poll_millis);
        let ready_key = Queue::Ready.key(&self.pool.name);
        info!(pool = %self.pool.name, size = self.pool.size, "pool loop started");

        let mut iterations = 0u64;
        loop {
            let summary = self.tick().await;
            iterations += 1;
            if max_iterations.is_some_and(|max| iterations >= max) {
                break;
            }
            let sleep = delay.next(summary.is_active());
            let ready_before = self.ctx.store.scard(&ready_key).unwrap_or(0);
            debug!(pool = %self.pool.name, ?summary, delay_secs = sleep.as_secs_f64(), "pool tick done");

            let store = &self.ctx.store;
            let wake = || store.scard(&ready_key).is_ok_and(|n| n != ready_before);
            if sleep_or_wake(sleep, poll, wake, &mut shutdown).await == WakeReason::Shutdown {
                info!(pool = %self.pool.name, "pool loop shutting down");
                break;
            }
        }
    }
}
