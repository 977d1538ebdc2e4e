//! Rebalancing checked-out machines onto lightly loaded hosts.

use std::time::Instant;

use tracing::{debug, info, warn};
use warmpool_core::{PoolSettings, epoch_secs, format_secs, parse_timestamp};
use warmpool_provider::Provider;
use warmpool_state::record::field;
use warmpool_state::{Queue, keys};

use crate::admission::MigrationSlot;
use crate::context::Context;
use crate::error::ManagerResult;

/// What happened to one migration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    Disabled,
    LimitReached,
    /// Another migration of the same machine holds its slot.
    AlreadyInFlight,
    /// Already on the selected host.
    InPlace { host: String },
    Moved { from: String, to: String },
}

/// Consume a machine from the migrating queue and relocate it if a better
/// host is available.
///
/// The machine leaves the migrating queue before anything else happens, so
/// a request is never retried. Limits are checked before the provider is
/// contacted.
pub async fn migrate_machine(
    ctx: &Context,
    pool: &PoolSettings,
    provider: &dyn Provider,
    machine: &str,
) -> ManagerResult<MigrationOutcome> {
    ctx.store.srem(&Queue::Migrating.key(&pool.name), machine)?;

    let Some(limit) = ctx.config.config.migration_limit() else {
        info!(pool = %pool.name, %machine, "migration disabled, leaving machine in place");
        return Ok(MigrationOutcome::Disabled);
    };
    let Some(_slot) = MigrationSlot::acquire(&ctx.store, machine, limit)? else {
        if ctx.store.sismember(keys::MIGRATIONS, machine)? {
            info!(pool = %pool.name, %machine, "migration already in flight");
            return Ok(MigrationOutcome::AlreadyInFlight);
        }
        info!(pool = %pool.name, %machine, limit, "migration limit reached, leaving machine in place");
        return Ok(MigrationOutcome::LimitReached);
    };

    let placement = provider.machine_placement(&pool.name, machine).await?;
    let target = ctx
        .hosts
        .next_host(&placement.cluster, &placement.compat_class)
        .await?;
    if target == placement.host {
        debug!(pool = %pool.name, %machine, host = %target, "already on a selected host");
        return Ok(MigrationOutcome::InPlace { host: target });
    }

    let started = Instant::now();
    provider.relocate(machine, &target).await?;
    let elapsed = started.elapsed();
    let finish = format_secs(elapsed);

    ctx.metrics.timing(&format!("migrate.{}", pool.name), elapsed).await;
    ctx.metrics.increment(&format!("migrate_from.{}", placement.host)).await;
    ctx.metrics.increment(&format!("migrate_to.{target}")).await;

    let record_key = keys::machine(machine);
    ctx.store.hset(&record_key, field::MIGRATION_TIME, &finish)?;
    if let Some(raw) = ctx.store.hget(&keys::active(&pool.name), machine)? {
        match parse_timestamp(&raw) {
            Ok(checked_out) => {
                let since = epoch_secs().saturating_sub(checked_out);
                ctx.store.hset(
                    &record_key,
                    field::CHECKOUT_TO_MIGRATION,
                    &format_secs(std::time::Duration::from_secs(since)),
                )?;
            }
            Err(e) => warn!(pool = %pool.name, %machine, error = %e, "malformed checkout time"),
        }
    }
    info!(
        pool = %pool.name,
        %machine,
        from = %placement.host,
        to = %target,
        secs = %finish,
        "migrated"
    );
    Ok(MigrationOutcome::Moved {
        from: placement.host,
        to: target,
    })
}
