//! Per-machine lifecycle operations.
//!
//! Each function handles one machine and is dispatched by the orchestrator
//! or a task worker as its own unit. Queue moves are single `smove` calls;
//! a move that finds the machine already gone is not an error.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use warmpool_core::{PoolSettings, epoch_secs, format_secs, parse_timestamp, today};
use warmpool_provider::{PowerState, Provider};
use warmpool_state::record::field;
use warmpool_state::{Queue, keys};

use crate::admission::CloneSlot;
use crate::context::Context;
use crate::error::{ManagerError, ManagerResult};

const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const NAME_SUFFIX_LEN: usize = 15;

fn minutes_since(stamp: u64, now: u64) -> f64 {
    now.saturating_sub(stamp) as f64 / 60.0
}

fn move_queue(ctx: &Context, pool: &str, machine: &str, from: Queue, to: Queue, reason: &str) -> ManagerResult<bool> {
    let moved = ctx.store.smove(&from.key(pool), &to.key(pool), machine)?;
    if moved {
        info!(%pool, %machine, %from, %to, "{reason}");
    }
    Ok(moved)
}

// ── Pending ────────────────────────────────────────────────────────

/// Promote a pending machine once it exists and is ready, otherwise apply
/// the pending timeout.
pub async fn check_pending(
    ctx: &Context,
    pool: &PoolSettings,
    provider: &dyn Provider,
    machine: &str,
) -> ManagerResult<()> {
    let Some(attrs) = provider.get_machine(&pool.name, machine).await? else {
        fail_pending(ctx, pool, machine, false).await?;
        return Ok(());
    };
    let ready = provider.is_ready(&pool.name, machine).await?;
    if ready && attrs.hostname.as_deref() == Some(machine) {
        move_pending_to_ready(ctx, &pool.name, machine).await?;
    } else {
        fail_pending(ctx, pool, machine, true).await?;
    }
    Ok(())
}

/// Fail a pending machine whose clone started longer ago than the pool's
/// timeout: moved to completed if it `exists`, purged otherwise.
///
/// An absent machine with no clone stamp has nothing to wait for and is
/// purged at once. Returns whether the machine left the pending queue. A
/// malformed clone stamp is logged and treated as "no action".
pub async fn fail_pending(ctx: &Context, pool: &PoolSettings, machine: &str, exists: bool) -> ManagerResult<bool> {
    let record = ctx.store.machine(machine)?;
    let started = match record.as_ref().map(|r| r.clone_started()).transpose() {
        Ok(started) => started.flatten(),
        Err(e) => {
            warn!(pool = %pool.name, %machine, error = %e, "cannot evaluate pending machine");
            return Ok(false);
        }
    };

    let Some(started) = started else {
        if exists {
            return Ok(false);
        }
        purge_pending(ctx, &pool.name, machine)?;
        return Ok(true);
    };

    let timeout = pool.timeout_minutes(&ctx.config.config);
    if minutes_since(started, epoch_secs()) <= timeout as f64 {
        return Ok(false);
    }
    if exists {
        let reason = format!("marked as failed after {timeout} minutes");
        if move_queue(ctx, &pool.name, machine, Queue::Pending, Queue::Completed, &reason)? {
            ctx.metrics.increment(&format!("failed.{}", pool.name)).await;
        }
    } else {
        purge_pending(ctx, &pool.name, machine)?;
    }
    Ok(true)
}

fn purge_pending(ctx: &Context, pool: &str, machine: &str) -> ManagerResult<()> {
    if ctx.store.srem(&Queue::Pending.key(pool), machine)? {
        ctx.store.del(&keys::machine(machine))?;
        info!(%pool, %machine, "no longer exists, removed from pending");
    }
    Ok(())
}

/// Move a pending machine to ready and record its clone-to-ready time.
///
/// Without a clone stamp no boot sample is written.
pub async fn move_pending_to_ready(ctx: &Context, pool: &str, machine: &str) -> ManagerResult<bool> {
    let started = match ctx.store.machine(machine)? {
        Some(record) => record.clone_started().unwrap_or_else(|e| {
            warn!(%pool, %machine, error = %e, "ignoring malformed clone stamp");
            None
        }),
        None => None,
    };
    if !move_queue(ctx, pool, machine, Queue::Pending, Queue::Ready, "moved from pending to ready")? {
        return Ok(false);
    }
    if let Some(started) = started {
        let elapsed = Duration::from_secs(epoch_secs().saturating_sub(started));
        ctx.store.hset(
            &keys::boot_timings(&today()),
            &format!("{pool}:{machine}"),
            &format_secs(elapsed),
        )?;
        ctx.metrics.timing(&format!("clonetoready.{pool}"), elapsed).await;
    }
    Ok(true)
}

// ── Ready ──────────────────────────────────────────────────────────

/// Whether a ready machine's last health check is older than the check
/// interval. A malformed stamp counts as due.
pub fn ready_check_due(ctx: &Context, pool: &str, machine: &str) -> ManagerResult<bool> {
    let Some(record) = ctx.store.machine(machine)? else {
        return Ok(true);
    };
    match record.last_checked() {
        Ok(Some(checked)) => {
            let interval = ctx.config.config.check_interval().as_secs();
            Ok(epoch_secs().saturating_sub(checked) > interval)
        }
        Ok(None) => Ok(true),
        Err(e) => {
            warn!(%pool, %machine, error = %e, "ignoring malformed check stamp");
            Ok(true)
        }
    }
}

/// Health-check a ready machine, at most once per check interval.
pub async fn check_ready(
    ctx: &Context,
    pool: &PoolSettings,
    provider: &dyn Provider,
    machine: &str,
) -> ManagerResult<()> {
    if !ready_check_due(ctx, &pool.name, machine)? {
        return Ok(());
    }
    let now = epoch_secs();

    let Some(attrs) = provider.get_machine(&pool.name, machine).await? else {
        if ctx.store.srem(&Queue::Ready.key(&pool.name), machine)? {
            info!(pool = %pool.name, %machine, "not found in inventory, removed from ready");
        }
        return Ok(());
    };

    let ttl = pool.ready_ttl_minutes();
    if ttl > 0
        && let Some(boot) = attrs.boot_time
        && minutes_since(boot, now) > ttl as f64
    {
        let reason = format!("reached end of TTL after {ttl} minutes, removed from ready");
        move_queue(ctx, &pool.name, machine, Queue::Ready, Queue::Completed, &reason)?;
        return Ok(());
    }

    if attrs.power_state != PowerState::PoweredOn {
        move_queue(ctx, &pool.name, machine, Queue::Ready, Queue::Completed, "appears to be powered off, removed from ready")?;
        return Ok(());
    }

    if attrs.hostname.as_deref() != Some(machine) {
        move_queue(ctx, &pool.name, machine, Queue::Ready, Queue::Completed, "has mismatched hostname, removed from ready")?;
        return Ok(());
    }

    let reachable = match provider.is_ready(&pool.name, machine).await {
        Ok(ready) => ready,
        Err(e) => {
            debug!(pool = %pool.name, %machine, error = %e, "readiness probe failed");
            false
        }
    };
    if !reachable {
        move_queue(ctx, &pool.name, machine, Queue::Ready, Queue::Completed, "is unreachable, removed from ready")?;
        return Ok(());
    }

    ctx.store.hset(&keys::machine(machine), field::CHECK, &now.to_string())?;
    Ok(())
}

// ── Running ────────────────────────────────────────────────────────

fn lifetime_hours(ctx: &Context, pool: &PoolSettings, machine: &str) -> ManagerResult<u64> {
    Ok(ctx
        .store
        .machine(machine)?
        .and_then(|r| r.lifetime_hours())
        .unwrap_or_else(|| pool.lifetime_hours(&ctx.config.config)))
}

/// Whether a checked-out machine has run for its lifetime: the record's
/// override, else the pool's, else the global default. Whole hours since
/// checkout are compared, and a zero lifetime never expires.
pub fn running_expired(ctx: &Context, pool: &PoolSettings, machine: &str) -> ManagerResult<bool> {
    let lifetime = lifetime_hours(ctx, pool, machine)?;
    if lifetime == 0 {
        return Ok(false);
    }
    let Some(raw) = ctx.store.hget(&keys::active(&pool.name), machine)? else {
        return Ok(false);
    };
    let checkout = match parse_timestamp(&raw) {
        Ok(checkout) => checkout,
        Err(e) => {
            warn!(pool = %pool.name, %machine, error = %e, "cannot evaluate running machine");
            return Ok(false);
        }
    };
    Ok(epoch_secs().saturating_sub(checkout) / 3600 >= lifetime)
}

/// Retire a checked-out machine once it has run for its lifetime.
pub async fn check_running(
    ctx: &Context,
    pool: &PoolSettings,
    provider: &dyn Provider,
    machine: &str,
) -> ManagerResult<()> {
    if provider.get_machine(&pool.name, machine).await?.is_none() {
        return Ok(());
    }
    if running_expired(ctx, pool, machine)? {
        let lifetime = lifetime_hours(ctx, pool, machine)?;
        let reason = format!("reached end of TTL after {lifetime} hours");
        move_queue(ctx, &pool.name, machine, Queue::Running, Queue::Completed, &reason)?;
    }
    Ok(())
}

// ── Clone ──────────────────────────────────────────────────────────

/// A fresh `{prefix}{15 × [a-z0-9]}` name with no record in the store.
pub fn generate_name(ctx: &Context) -> ManagerResult<String> {
    loop {
        let mut bytes = [0u8; NAME_SUFFIX_LEN];
        getrandom::getrandom(&mut bytes).map_err(|e| ManagerError::Entropy(e.to_string()))?;
        let suffix: String = bytes
            .iter()
            .map(|b| NAME_ALPHABET[*b as usize % NAME_ALPHABET.len()] as char)
            .collect();
        let name = format!("{}{suffix}", ctx.config.config.prefix);
        if ctx.store.machine(&name)?.is_none() {
            return Ok(name);
        }
    }
}

/// Reserve a fresh name in `pool`'s pending queue ahead of the provider call.
///
/// The record is written before the queue entry so a pending machine always
/// carries its clone stamp.
pub fn register_clone(ctx: &Context, pool: &str) -> ManagerResult<String> {
    let machine = generate_name(ctx)?;
    let stamp = epoch_secs().to_string();
    ctx.store.hset_many(
        &keys::machine(&machine),
        &[(field::POOL, pool), (field::CLONE, stamp.as_str())],
    )?;
    ctx.store.sadd(&Queue::Pending.key(pool), &machine)?;
    debug!(%pool, %machine, "registered clone");
    Ok(machine)
}

/// Create a registered machine, holding `slot` until done.
///
/// On provider failure the machine is deregistered and the error returned.
pub async fn finish_clone(
    ctx: &Context,
    pool: &PoolSettings,
    provider: &dyn Provider,
    machine: &str,
    slot: CloneSlot,
) -> ManagerResult<()> {
    let _slot = slot;
    let record_key = keys::machine(machine);

    let started = Instant::now();
    if let Err(e) = provider.create_machine(&pool.name, machine).await {
        ctx.store.srem(&Queue::Pending.key(&pool.name), machine)?;
        ctx.store.del(&record_key)?;
        return Err(e.into());
    }
    let elapsed = started.elapsed();
    let finish = format_secs(elapsed);

    ctx.store.hset(
        &keys::clone_timings(&today()),
        &format!("{}:{machine}", pool.name),
        &finish,
    )?;
    ctx.store.hset(&record_key, field::CLONE_TIME, &finish)?;
    ctx.metrics.timing(&format!("clone.{}", pool.name), elapsed).await;
    info!(pool = %pool.name, %machine, secs = %finish, "cloned");
    Ok(())
}

/// Register and create one machine in `pool`.
pub async fn clone_machine(
    ctx: &Context,
    pool: &PoolSettings,
    provider: &dyn Provider,
    slot: CloneSlot,
) -> ManagerResult<String> {
    let machine = register_clone(ctx, &pool.name)?;
    finish_clone(ctx, pool, provider, &machine, slot).await?;
    Ok(machine)
}

// ── Destroy ────────────────────────────────────────────────────────

/// Destroy a completed machine, keeping its metadata for `data_ttl_hours`.
pub async fn destroy_machine(
    ctx: &Context,
    pool: &PoolSettings,
    provider: &dyn Provider,
    machine: &str,
) -> ManagerResult<()> {
    let record_key = keys::machine(machine);
    ctx.store.srem(&Queue::Completed.key(&pool.name), machine)?;
    ctx.store.hdel(&keys::active(&pool.name), machine)?;
    ctx.store.hset(&record_key, field::DESTROY, &epoch_secs().to_string())?;
    ctx.store.expire(&record_key, ctx.config.config.data_ttl())?;

    let started = Instant::now();
    provider.destroy_machine(&pool.name, machine).await?;
    let elapsed = started.elapsed();

    ctx.metrics.timing(&format!("destroy.{}", pool.name), elapsed).await;
    info!(pool = %pool.name, %machine, secs = %format_secs(elapsed), "destroyed");
    Ok(())
}

/// Drop every trace of a completed machine the provider no longer reports.
pub fn purge_machine(ctx: &Context, pool: &str, machine: &str) -> ManagerResult<()> {
    ctx.store.srem(&Queue::Completed.key(pool), machine)?;
    ctx.store.hdel(&keys::active(pool), machine)?;
    ctx.store.del(&keys::machine(machine))?;
    info!(%pool, %machine, "not found in inventory, removed from completed");
    Ok(())
}

// ── Disks and snapshots ────────────────────────────────────────────

pub async fn attach_disk(
    ctx: &Context,
    pool: &str,
    provider: &dyn Provider,
    machine: &str,
    size: &str,
) -> ManagerResult<bool> {
    let size_gb = size
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| ManagerError::InvalidDiskSize(size.to_string()))?;

    info!(%pool, %machine, size_gb, "attaching disk");
    let started = Instant::now();
    let attached = provider.attach_disk(pool, machine, size_gb).await?;
    let finish = format_secs(started.elapsed());

    if attached {
        let mut disks = ctx
            .store
            .machine(machine)?
            .map(|r| r.disks())
            .unwrap_or_default();
        disks.push(format!("+{size_gb}gb"));
        ctx.store.hset(&keys::machine(machine), field::DISK, &disks.join(":"))?;
        info!(%pool, %machine, size_gb, secs = %finish, "disk attached");
    } else {
        warn!(%pool, %machine, size_gb, "failed to attach disk");
    }
    Ok(attached)
}

pub async fn create_snapshot(
    ctx: &Context,
    pool: &str,
    provider: &dyn Provider,
    machine: &str,
    snapshot: &str,
) -> ManagerResult<bool> {
    let started = Instant::now();
    let created = provider.create_snapshot(pool, machine, snapshot).await?;
    if created {
        ctx.store.hset(
            &keys::machine(machine),
            &format!("{}{snapshot}", field::SNAPSHOT_PREFIX),
            &epoch_secs().to_string(),
        )?;
        info!(%pool, %machine, %snapshot, secs = %format_secs(started.elapsed()), "snapshot created");
    } else {
        warn!(%pool, %machine, %snapshot, "failed to create snapshot");
    }
    Ok(created)
}

pub async fn revert_snapshot(
    pool: &str,
    provider: &dyn Provider,
    machine: &str,
    snapshot: &str,
) -> ManagerResult<bool> {
    let started = Instant::now();
    let reverted = provider.revert_snapshot(pool, machine, snapshot).await?;
    if reverted {
        info!(%pool, %machine, %snapshot, secs = %format_secs(started.elapsed()), "reverted to snapshot");
    } else {
        warn!(%pool, %machine, %snapshot, "failed to revert snapshot");
    }
    Ok(reverted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use warmpool_core::Config;
    use warmpool_provider::{DummyProvider, MachineAttrs};
    use warmpool_state::InventoryStore;

    const POOL: &str = "debian";

    fn setup(configure: impl FnOnce(&mut PoolSettings)) -> (Arc<Context>, Arc<DummyProvider>) {
        let provider = Arc::new(DummyProvider::new("dummy"));
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert("dummy".into(), provider.clone());
        let mut pool = PoolSettings::new(POOL, 2, "dummy");
        configure(&mut pool);
        let mut config = Config::default();
        config.pools.push(pool);
        let ctx = Context::new(config, InventoryStore::open_in_memory().unwrap(), providers).unwrap();
        (ctx, provider)
    }

    fn pool(ctx: &Context) -> PoolSettings {
        ctx.config.pools[0].clone()
    }

    fn members(ctx: &Context, queue: Queue) -> Vec<String> {
        ctx.store.smembers(&queue.key(POOL)).unwrap()
    }

    #[tokio::test]
    async fn clone_registers_and_records() {
        let (ctx, provider) = setup(|_| {});
        let slot = CloneSlot::acquire(&ctx.store, 10).unwrap().unwrap();
        let name = clone_machine(&ctx, &pool(&ctx), provider.as_ref(), slot)
            .await
            .unwrap();

        assert!(name.starts_with("poolvm-"));
        assert_eq!(name.len(), "poolvm-".len() + NAME_SUFFIX_LEN);
        assert_eq!(members(&ctx, Queue::Pending), vec![name.clone()]);
        let record = ctx.store.machine(&name).unwrap().unwrap();
        assert_eq!(record.pool(), Some(POOL));
        assert!(record.get(field::CLONE_TIME).is_some());
        assert_eq!(ctx.store.counter(keys::CLONE_TASKS).unwrap(), 0);
        assert_eq!(ctx.metrics.timing_count("clone.debian").await, 1);
    }

    #[tokio::test]
    async fn failed_clone_deregisters() {
        let (ctx, provider) = setup(|_| {});
        provider.fail_creates(1).await;
        let slot = CloneSlot::acquire(&ctx.store, 10).unwrap().unwrap();
        let result = clone_machine(&ctx, &pool(&ctx), provider.as_ref(), slot).await;

        assert!(matches!(result, Err(ManagerError::Provider(_))));
        assert!(members(&ctx, Queue::Pending).is_empty());
        assert_eq!(ctx.store.counter(keys::CLONE_TASKS).unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_promotes_when_ready() {
        let (ctx, provider) = setup(|_| {});
        provider.insert_machine(POOL, MachineAttrs::running("vm-1", epoch_secs())).await;
        ctx.store.sadd(&Queue::Pending.key(POOL), "vm-1").unwrap();
        ctx.store
            .hset("vm:vm-1", field::CLONE, &(epoch_secs() - 30).to_string())
            .unwrap();

        check_pending(&ctx, &pool(&ctx), provider.as_ref(), "vm-1").await.unwrap();
        assert_eq!(members(&ctx, Queue::Ready), vec!["vm-1"]);
        assert!(members(&ctx, Queue::Pending).is_empty());
        let boot = ctx.store.hgetall(&keys::boot_timings(&today())).unwrap();
        assert!(boot.contains_key("debian:vm-1"));
    }

    #[tokio::test]
    async fn pending_not_ready_waits_then_fails() {
        let (ctx, provider) = setup(|p| p.timeout_minutes = Some(15));
        provider.insert_machine(POOL, MachineAttrs::running("vm-1", epoch_secs())).await;
        provider.set_ready(POOL, "vm-1", false).await;
        ctx.store.sadd(&Queue::Pending.key(POOL), "vm-1").unwrap();
        ctx.store
            .hset("vm:vm-1", field::CLONE, &(epoch_secs() - 60).to_string())
            .unwrap();

        check_pending(&ctx, &pool(&ctx), provider.as_ref(), "vm-1").await.unwrap();
        assert_eq!(members(&ctx, Queue::Pending), vec!["vm-1"]);

        ctx.store
            .hset("vm:vm-1", field::CLONE, &(epoch_secs() - 16 * 60).to_string())
            .unwrap();
        check_pending(&ctx, &pool(&ctx), provider.as_ref(), "vm-1").await.unwrap();
        assert!(members(&ctx, Queue::Pending).is_empty());
        assert_eq!(members(&ctx, Queue::Completed), vec!["vm-1"]);
    }

    #[tokio::test]
    async fn malformed_clone_stamp_is_no_action() {
        let (ctx, _) = setup(|_| {});
        ctx.store.sadd(&Queue::Pending.key(POOL), "vm-1").unwrap();
        ctx.store.hset("vm:vm-1", field::CLONE, "yesterday").unwrap();

        let left = fail_pending(&ctx, &pool(&ctx), "vm-1", false).await.unwrap();
        assert!(!left);
        assert_eq!(members(&ctx, Queue::Pending), vec!["vm-1"]);
    }

    #[tokio::test]
    async fn ready_check_is_throttled() {
        let (ctx, provider) = setup(|_| {});
        ctx.store.sadd(&Queue::Ready.key(POOL), "vm-1").unwrap();
        ctx.store
            .hset("vm:vm-1", field::CHECK, &epoch_secs().to_string())
            .unwrap();

        // Absent from the provider, but checked too recently to notice.
        check_ready(&ctx, &pool(&ctx), provider.as_ref(), "vm-1").await.unwrap();
        assert_eq!(members(&ctx, Queue::Ready), vec!["vm-1"]);
        assert_eq!(provider.calls("get_machine").await, 0);
    }

    #[tokio::test]
    async fn ready_absent_is_dropped_without_completing() {
        let (ctx, provider) = setup(|_| {});
        ctx.store.sadd(&Queue::Ready.key(POOL), "vm-1").unwrap();
        check_ready(&ctx, &pool(&ctx), provider.as_ref(), "vm-1").await.unwrap();
        assert!(members(&ctx, Queue::Ready).is_empty());
        assert!(members(&ctx, Queue::Completed).is_empty());
    }

    #[tokio::test]
    async fn ready_failures_complete_the_machine() {
        let (ctx, provider) = setup(|_| {});
        for name in ["off", "renamed", "unreachable", "fine"] {
            provider.insert_machine(POOL, MachineAttrs::running(name, epoch_secs())).await;
            ctx.store.sadd(&Queue::Ready.key(POOL), name).unwrap();
        }
        provider
            .update_machine(POOL, "off", |m| m.power_state = PowerState::PoweredOff)
            .await;
        provider
            .update_machine(POOL, "renamed", |m| m.hostname = Some("other".into()))
            .await;
        provider.set_ready(POOL, "unreachable", false).await;

        for name in ["off", "renamed", "unreachable", "fine"] {
            check_ready(&ctx, &pool(&ctx), provider.as_ref(), name).await.unwrap();
        }
        assert_eq!(members(&ctx, Queue::Ready), vec!["fine"]);
        assert_eq!(members(&ctx, Queue::Completed), vec!["off", "renamed", "unreachable"]);
        assert!(ctx.store.hget("vm:fine", field::CHECK).unwrap().is_some());
        assert!(ctx.store.hget("vm:off", field::CHECK).unwrap().is_none());
    }

    #[tokio::test]
    async fn running_past_lifetime_completes() {
        let (ctx, provider) = setup(|p| p.vm_lifetime_hours = Some(2));
        for name in ["old", "young", "override"] {
            provider.insert_machine(POOL, MachineAttrs::running(name, epoch_secs())).await;
            ctx.store.sadd(&Queue::Running.key(POOL), name).unwrap();
        }
        let three_hours_ago = (epoch_secs() - 3 * 3600).to_string();
        ctx.store.hset(&keys::active(POOL), "old", &three_hours_ago).unwrap();
        ctx.store
            .hset(&keys::active(POOL), "young", &epoch_secs().to_string())
            .unwrap();
        ctx.store.hset(&keys::active(POOL), "override", &three_hours_ago).unwrap();
        ctx.store.hset("vm:override", field::LIFETIME, "24").unwrap();

        for name in ["old", "young", "override"] {
            check_running(&ctx, &pool(&ctx), provider.as_ref(), name).await.unwrap();
        }
        assert_eq!(members(&ctx, Queue::Completed), vec!["old"]);
        assert_eq!(members(&ctx, Queue::Running), vec!["override", "young"]);
    }

    #[tokio::test]
    async fn destroy_sets_expiry() {
        let (ctx, provider) = setup(|_| {});
        provider.insert_machine(POOL, MachineAttrs::running("vm-1", epoch_secs())).await;
        ctx.store.sadd(&Queue::Completed.key(POOL), "vm-1").unwrap();
        ctx.store.hset(&keys::active(POOL), "vm-1", "1").unwrap();
        ctx.store.hset("vm:vm-1", field::POOL, POOL).unwrap();

        destroy_machine(&ctx, &pool(&ctx), provider.as_ref(), "vm-1").await.unwrap();
        assert!(members(&ctx, Queue::Completed).is_empty());
        assert!(ctx.store.hget(&keys::active(POOL), "vm-1").unwrap().is_none());
        assert!(ctx.store.hget("vm:vm-1", field::DESTROY).unwrap().is_some());
        assert!(ctx.store.ttl("vm:vm-1").unwrap().is_some());
        assert!(provider.machine_names(POOL).await.is_empty());
    }

    #[tokio::test]
    async fn disk_attach_validates_and_appends() {
        let (ctx, provider) = setup(|_| {});
        provider.insert_machine(POOL, MachineAttrs::running("vm-1", epoch_secs())).await;

        for bad in ["", "0", "-4", "ten"] {
            let err = attach_disk(&ctx, POOL, provider.as_ref(), "vm-1", bad).await;
            assert!(matches!(err, Err(ManagerError::InvalidDiskSize(_))));
        }
        assert_eq!(provider.calls("attach_disk").await, 0);

        attach_disk(&ctx, POOL, provider.as_ref(), "vm-1", "10").await.unwrap();
        attach_disk(&ctx, POOL, provider.as_ref(), "vm-1", "20").await.unwrap();
        assert_eq!(
            ctx.store.hget("vm:vm-1", field::DISK).unwrap().as_deref(),
            Some("+10gb:+20gb")
        );
    }

    #[tokio::test]
    async fn snapshot_records_timestamp() {
        let (ctx, provider) = setup(|_| {});
        provider.insert_machine(POOL, MachineAttrs::running("vm-1", epoch_secs())).await;
        assert!(create_snapshot(&ctx, POOL, provider.as_ref(), "vm-1", "base").await.unwrap());
        let record = ctx.store.machine("vm-1").unwrap().unwrap();
        assert!(record.snapshots().contains_key("base"));
        assert!(revert_snapshot(POOL, provider.as_ref(), "vm-1", "base").await.unwrap());
        assert!(!revert_snapshot(POOL, provider.as_ref(), "vm-1", "missing").await.unwrap());
    }
}
