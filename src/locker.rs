/*
 *
 *  *
 *  *      Copyright (c) 2018-2025, SnackCloud All rights reserved.
 *  *
 *  *   Redistribution and use in source and binary forms, with or without
 *  *   modification, are permitted provided that the following conditions are met:
 *  *
 *  *   Redistributions of source code must retain the above copyright notice,
 *  *   this list of conditions and the following disclaimer.
 *  *   Redistributions in binary form must reproduce the above copyright
 *  *   notice, this list of conditions and the following disclaimer in the
 *  *   documentation and/or other materials provided with the distribution.
 *  *   Neither the name of the www.snackcloud.cn developer nor the names of its
 *  *   contributors may be used to endorse or promote products derived from
 *  *   this software without specific prior written permission.
 *  *   Author: SnackCloud
 *  *
 *
 */
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LockerConfig;
use crate::errors::{LockerError, LockerResult};
use crate::gate::{Gate, GateTable, Holder};
use crate::invalidation;
use crate::keys::keyname;
use crate::scripts::{ACQUIRE_SCRIPT, EXTEND_SCRIPT, RELEASE_SCRIPT};
use crate::util::{calculate_drift, lock_token, num_milliseconds};

/// State shared between the facade, the holder tasks and the invalidation
/// router.
pub(crate) struct Shared {
    pub prefix: String,
    pub validity: Duration,
    pub interval: Duration,
    pub timeout: Duration,
    pub majority: usize,
    pub totalcnt: usize,
    pub setpx: bool,
    pub no_loop_tracking: bool,
    pub drift: Duration,
    pub gates: GateTable,
    pub conn: ConnectionManager,
    pub closed: CancellationToken,
}

/// A distributed lock manager over a Redis-compatible store.
///
/// Each lock name is replicated across `2 * majority - 1` slot keys; an
/// acquisition must win a majority of them to hold the lock. While held,
/// a background task keeps the slot keys extended, and (in the default
/// tracking mode) server-side invalidation pushes both wake waiters the
/// moment a remote holder releases and detect loss of the majority.
///
/// Lockers are instance-scoped: two lockers in one process are fully
/// independent and may safely contend for the same names.
pub struct Locker {
    shared: Arc<Shared>,
    client: Client,
}

/// Handle of one successful acquisition.
///
/// The guard does not carry the lock itself; the lease token does. The
/// token is canceled when the caller's context is canceled, when the slot
/// majority is lost, or when the locker closes, and the background holder
/// task then releases the slot keys and hands the gate to the next
/// waiter. Dropping the guard is equivalent to [`LockGuard::release`].
pub struct LockGuard {
    lease: CancellationToken,
}

impl LockGuard {
    /// Cancellation token of the current lease. It fires when the lock is
    /// no longer held for any reason; protected work should stop then.
    pub fn lease(&self) -> CancellationToken {
        self.lease.clone()
    }

    pub fn is_valid(&self) -> bool {
        !self.lease.is_cancelled()
    }

    /// Release the lock. The slot keys are deleted in the background and
    /// the next local waiter is signaled.
    pub fn release(self) {
        self.lease.cancel();
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lease.cancel();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl Locker {
    /// Build a locker from the configuration: connect the shared
    /// multiplexed connection (RESP3 when tracking is in use), enable
    /// server-assisted invalidation and start the router.
    pub async fn new(config: LockerConfig) -> LockerResult<Self> {
        config.validate()?;
        let tracking = !config.fallback_setpx;

        let info = config.connection_info(tracking)?;
        let client = match &config.client_builder {
            Some(builder) => builder(info)?,
            None => Client::open(info)?,
        };

        let mut push_rx = None;
        let conn = if tracking {
            let (tx, rx) = mpsc::unbounded_channel();
            push_rx = Some(rx);
            let manager_config = ConnectionManagerConfig::new().set_push_sender(tx);
            client.get_connection_manager_with_config(manager_config).await?
        } else {
            client.get_connection_manager().await?
        };

        let shared = Arc::new(Shared {
            prefix: config.key_prefix.clone(),
            validity: config.key_validity,
            interval: config.interval(),
            timeout: config.try_next_after,
            majority: config.key_majority as usize,
            totalcnt: config.total_slots() as usize,
            setpx: config.fallback_setpx,
            no_loop_tracking: config.no_loop_tracking,
            drift: calculate_drift(config.key_validity, config.drift_factor),
            gates: GateTable::new(config.total_slots() as usize),
            conn,
            closed: CancellationToken::new(),
        });

        if let Some(rx) = push_rx {
            let mut conn = shared.conn.clone();
            invalidation::enable_tracking(&mut conn, &shared.prefix, shared.no_loop_tracking)
                .await?;
            invalidation::spawn(Arc::downgrade(&shared), rx);
        }

        debug!(prefix = %shared.prefix, slots = shared.totalcnt, majority = shared.majority, "locker ready");
        Ok(Self { shared, client })
    }

    /// Acquire the lock named `name`, retrying until it is held, the
    /// caller's token is canceled, or the locker closes.
    pub async fn with_context(
        &self,
        ctx: &CancellationToken,
        name: &str,
    ) -> LockerResult<LockGuard> {
        if ctx.is_cancelled() {
            return Err(LockerError::Canceled);
        }
        let (gate, fresh) = self.shared.gates.reserve(name)?;
        let mut attempt_now = fresh;
        loop {
            if !attempt_now {
                // Waiters normally sleep until an invalidation or a local
                // hand-off wakes them; the timed arm is the polling
                // fallback in SETPX mode and a liveness backstop
                // otherwise. A woken waiter always re-checks Redis state,
                // so a spurious wake costs one extra attempt.
                let backstop = if self.shared.setpx {
                    self.shared.interval
                } else {
                    self.shared.validity
                };
                tokio::select! {
                    _ = ctx.cancelled() => {
                        self.shared.gates.release(name, &gate);
                        return Err(LockerError::Canceled);
                    }
                    _ = self.shared.closed.cancelled() => {
                        self.shared.gates.release(name, &gate);
                        return Err(LockerError::LockerClosed);
                    }
                    _ = gate.notify.notified() => {}
                    _ = tokio::time::sleep(backstop) => {}
                }
            }
            attempt_now = false;

            if self.shared.closed.is_cancelled() {
                self.shared.gates.release(name, &gate);
                return Err(LockerError::LockerClosed);
            }
            if ctx.is_cancelled() {
                self.shared.gates.release(name, &gate);
                return Err(LockerError::Canceled);
            }
            if gate.state.lock().holder.is_some() {
                continue;
            }
            match self.attempt(ctx, &gate, name).await {
                Ok(guard) => return Ok(guard),
                Err(LockerError::NotLocked) => continue,
                Err(e) => {
                    self.shared.gates.release(name, &gate);
                    return Err(e);
                }
            }
        }
    }

    /// Single-shot acquisition: fails with [`LockerError::NotLocked`]
    /// when the majority was not obtained or any local caller is already
    /// engaged with this name.
    pub async fn try_with_context(
        &self,
        ctx: &CancellationToken,
        name: &str,
    ) -> LockerResult<LockGuard> {
        if ctx.is_cancelled() {
            return Err(LockerError::Canceled);
        }
        let Some(gate) = self.shared.gates.try_reserve(name)? else {
            return Err(LockerError::NotLocked);
        };
        match self.attempt(ctx, &gate, name).await {
            Ok(guard) => Ok(guard),
            Err(e) => {
                self.shared.gates.release(name, &gate);
                Err(e)
            }
        }
    }

    /// One acquisition attempt: write every slot concurrently, tally the
    /// majority within the drift-adjusted validity window, and either
    /// install the holder or roll back the partial success.
    async fn attempt(
        &self,
        ctx: &CancellationToken,
        gate: &Arc<Gate>,
        name: &str,
    ) -> LockerResult<LockGuard> {
        let token = lock_token();
        let start = Instant::now();
        let results = command_all(&self.shared, name, &token).await;

        let won: Vec<u32> = results
            .iter()
            .filter(|(_, outcome)| *outcome == Some(true))
            .map(|(slot, _)| *slot)
            .collect();

        if won.len() >= self.shared.majority
            && start.elapsed() + self.shared.drift < self.shared.validity
        {
            let lease = ctx.child_token();
            {
                let mut state = gate.state.lock();
                if !self.shared.setpx {
                    for slot in &won {
                        state.csc[*slot as usize] = true;
                    }
                }
                state.holder = Some(Holder {
                    lease: lease.clone(),
                    token: token.clone(),
                });
            }
            debug!(name, slots = won.len(), "acquired slot majority");
            spawn_holder(
                self.shared.clone(),
                gate.clone(),
                name.to_string(),
                token,
                lease.clone(),
            );
            Ok(LockGuard { lease })
        } else {
            debug!(name, slots = won.len(), "slot majority not obtained");
            if !won.is_empty() {
                let shared = self.shared.clone();
                let name = name.to_string();
                tokio::spawn(async move {
                    release_slots(&shared, &name, &token, &won).await;
                });
            }
            Err(LockerError::NotLocked)
        }
    }

    /// Whether a majority of the slot keys of `name` currently exist,
    /// regardless of which process holds them.
    pub async fn is_locked(&self, name: &str) -> LockerResult<bool> {
        if self.shared.gates.is_closed() {
            return Err(LockerError::LockerClosed);
        }
        let mut conn = self.shared.conn.clone();
        let mut existing = 0usize;
        for slot in 0..self.shared.totalcnt as u32 {
            let key = keyname(&self.shared.prefix, name, slot);
            let found: i64 = redis::cmd("EXISTS").arg(&key).query_async(&mut conn).await?;
            existing += found as usize;
        }
        Ok(existing >= self.shared.majority)
    }

    /// Delete every slot key of `name` unconditionally, ignoring holder
    /// tokens. Administrative unstick; the rightful holder, if any, will
    /// observe the loss through its lease.
    pub async fn force_release(&self, name: &str) -> LockerResult<u64> {
        if self.shared.gates.is_closed() {
            return Err(LockerError::LockerClosed);
        }
        let mut conn = self.shared.conn.clone();
        let mut cmd = redis::cmd("DEL");
        for slot in 0..self.shared.totalcnt as u32 {
            cmd.arg(keyname(&self.shared.prefix, name, slot));
        }
        let deleted: u64 = cmd.query_async(&mut conn).await?;
        Ok(deleted)
    }

    /// The underlying Redis client, unchanged.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// A handle to the shared multiplexed connection.
    pub fn connection(&self) -> ConnectionManager {
        self.shared.conn.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.gates.is_closed()
    }

    /// Close the locker. Pending and subsequent acquisitions fail with
    /// [`LockerError::LockerClosed`]; every held lease is canceled and its
    /// slot keys are released in the background. Idempotent.
    pub fn close(&self) {
        let gates = self.shared.gates.close();
        self.shared.closed.cancel();
        for gate in gates {
            let mut state = gate.state.lock();
            if let Some(holder) = state.holder.take() {
                holder.lease.cancel();
            }
            for bit in state.csc.iter_mut() {
                *bit = false;
            }
            drop(state);
            gate.notify.notify_waiters();
        }
        debug!("locker closed");
    }
}

/// Issue the per-slot acquisition command to every slot concurrently,
/// each bounded by the per-slot timeout. `Some(true)` is a win,
/// `Some(false)` a refusal, `None` a transport error (counted as a
/// refusal by callers).
async fn command_all(shared: &Arc<Shared>, name: &str, token: &str) -> Vec<(u32, Option<bool>)> {
    let px = num_milliseconds(&shared.validity);
    let mut tasks = Vec::with_capacity(shared.totalcnt);
    for slot in 0..shared.totalcnt as u32 {
        let conn = shared.conn.clone();
        let key = keyname(&shared.prefix, name, slot);
        let token = token.to_string();
        let cmd_timeout = shared.timeout;
        let setpx = shared.setpx;
        tasks.push(tokio::spawn(async move {
            (slot, slot_command(conn, key, token, px, cmd_timeout, setpx).await)
        }));
    }
    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        if let Ok(result) = task.await {
            results.push(result);
        }
    }
    results
}

async fn slot_command(
    mut conn: ConnectionManager,
    key: String,
    token: String,
    px: u64,
    cmd_timeout: Duration,
    setpx: bool,
) -> Option<bool> {
    let outcome = if setpx {
        tokio::time::timeout(cmd_timeout, async {
            let reply: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(px)
                .query_async(&mut conn)
                .await?;
            Ok::<_, redis::RedisError>(reply.is_some())
        })
        .await
    } else {
        tokio::time::timeout(cmd_timeout, async {
            let granted: i64 = ACQUIRE_SCRIPT
                .key(&key)
                .arg(&token)
                .arg(px)
                .invoke_async(&mut conn)
                .await?;
            Ok::<_, redis::RedisError>(granted == 1)
        })
        .await
    };
    match outcome {
        Ok(Ok(ok)) => Some(ok),
        Ok(Err(e)) => {
            debug!(key = %key, error = %e, "slot command failed");
            None
        }
        Err(_) => {
            debug!(key = %key, "slot command timed out");
            None
        }
    }
}

/// The holder task: run the extension loop until the lease ends for any
/// reason, then tear the acquisition down exactly once.
fn spawn_holder(
    shared: Arc<Shared>,
    gate: Arc<Gate>,
    name: String,
    token: String,
    lease: CancellationToken,
) {
    tokio::spawn(async move {
        extension_loop(&shared, &gate, &name, &token, &lease).await;
        lease.cancel();
        teardown(&shared, &gate, &name, &token).await;
    });
}

/// Background renewal of the acquired majority. Every `interval` a
/// token-guarded TTL refresh is issued to all slots; a slot that was
/// deleted, expired or overwritten stays lost. `interval < validity`
/// keeps owned keys refreshed before they can lapse. Returns when the
/// lease is canceled, the locker closes, or the majority could not be
/// extended.
async fn extension_loop(
    shared: &Arc<Shared>,
    gate: &Arc<Gate>,
    name: &str,
    token: &str,
    lease: &CancellationToken,
) {
    let mut ticker = tokio::time::interval(shared.interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = lease.cancelled() => return,
            _ = shared.closed.cancelled() => return,
            _ = ticker.tick() => {
                let results = extend_all(shared, name, token).await;
                let mut extended = 0;
                {
                    let mut state = gate.state.lock();
                    match &state.holder {
                        Some(holder) if holder.token == token => {}
                        _ => return,
                    }
                    for (slot, outcome) in &results {
                        match outcome {
                            Some(true) => {
                                extended += 1;
                                if !shared.setpx {
                                    state.csc[*slot as usize] = true;
                                }
                            }
                            Some(false) => {
                                if !shared.setpx {
                                    state.csc[*slot as usize] = false;
                                }
                            }
                            None => {}
                        }
                    }
                }
                if extended < shared.majority {
                    warn!(name, extended, "lock lease lost during extension");
                    return;
                }
            }
        }
    }
}

/// Refresh the validity of every slot still carrying `token`, all slots
/// concurrently. Same outcome encoding as the acquisition fan-out; an
/// absent or foreign-valued slot reports `Some(false)`.
async fn extend_all(shared: &Arc<Shared>, name: &str, token: &str) -> Vec<(u32, Option<bool>)> {
    let px = num_milliseconds(&shared.validity);
    let mut tasks = Vec::with_capacity(shared.totalcnt);
    for slot in 0..shared.totalcnt as u32 {
        let mut conn = shared.conn.clone();
        let key = keyname(&shared.prefix, name, slot);
        let token = token.to_string();
        let cmd_timeout = shared.timeout;
        tasks.push(tokio::spawn(async move {
            let reply = tokio::time::timeout(
                cmd_timeout,
                EXTEND_SCRIPT
                    .key(&key)
                    .arg(&token)
                    .arg(px)
                    .invoke_async::<i64>(&mut conn),
            )
            .await;
            let outcome = match reply {
                Ok(Ok(refreshed)) => Some(refreshed == 1),
                Ok(Err(e)) => {
                    debug!(key = %key, error = %e, "slot extension failed");
                    None
                }
                Err(_) => {
                    debug!(key = %key, "slot extension timed out");
                    None
                }
            };
            (slot, outcome)
        }));
    }
    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        if let Ok(result) = task.await {
            results.push(result);
        }
    }
    results
}

/// Post-lease cleanup: clear the holder, delete the slot keys with the
/// token guard, signal the gate and drop the holder's reservation.
async fn teardown(shared: &Arc<Shared>, gate: &Arc<Gate>, name: &str, token: &str) {
    {
        let mut state = gate.state.lock();
        if state.holder.as_ref().is_some_and(|h| h.token == token) {
            state.holder = None;
            for bit in state.csc.iter_mut() {
                *bit = false;
            }
        }
    }
    let slots: Vec<u32> = (0..shared.totalcnt as u32).collect();
    release_slots(shared, name, token, &slots).await;
    gate.notify.notify_one();
    shared.gates.release(name, gate);
    debug!(name, "lock released");
}

/// Best-effort token-guarded deletion of slot keys; errors are discarded,
/// the token guard keeps stray deletes harmless.
pub(crate) async fn release_slots(shared: &Arc<Shared>, name: &str, token: &str, slots: &[u32]) {
    let mut tasks = Vec::with_capacity(slots.len());
    for slot in slots {
        let mut conn = shared.conn.clone();
        let key = keyname(&shared.prefix, name, *slot);
        let token = token.to_string();
        let cmd_timeout = shared.timeout;
        tasks.push(tokio::spawn(async move {
            let _ = tokio::time::timeout(
                cmd_timeout,
                RELEASE_SCRIPT
                    .key(&key)
                    .arg(&token)
                    .invoke_async::<i64>(&mut conn),
            )
            .await;
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const ADDRESS: &str = "redis://127.0.0.1:6379";

    fn test_config() -> LockerConfig {
        LockerConfig::new([ADDRESS]).with_try_next_after(Duration::from_secs(1))
    }

    async fn new_locker(config: LockerConfig) -> Locker {
        Locker::new(config).await.expect("redis reachable")
    }

    fn unique_name(tag: &str) -> String {
        format!("{tag}-{}", lock_token())
    }

    async fn external_connection() -> redis::aio::MultiplexedConnection {
        redis::Client::open(ADDRESS)
            .unwrap()
            .get_multiplexed_async_connection()
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn acquire_release_round_trip() {
        let locker = new_locker(test_config()).await;
        let name = unique_name("roundtrip");
        let ctx = CancellationToken::new();

        let guard = locker.with_context(&ctx, &name).await.unwrap();
        assert!(guard.is_valid());
        assert!(locker.is_locked(&name).await.unwrap());

        guard.release();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!locker.is_locked(&name).await.unwrap());
        assert_eq!(locker.shared.gates.len(), 0);
        locker.close();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn mutual_exclusion_across_lockers() {
        let name = unique_name("mx");
        let counter = Arc::new(AtomicUsize::new(0));
        let busy = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let name = name.clone();
            let counter = counter.clone();
            let busy = busy.clone();
            handles.push(tokio::spawn(async move {
                let locker = new_locker(test_config()).await;
                for _ in 0..20 {
                    let ctx = CancellationToken::new();
                    let guard = locker.with_context(&ctx, &name).await.unwrap();
                    assert!(!busy.swap(true, Ordering::SeqCst), "two holders at once");
                    counter.fetch_add(1, Ordering::SeqCst);
                    busy.store(false, Ordering::SeqCst);
                    guard.release();
                }
                locker.close();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 60);
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn fan_out_within_one_process() {
        let locker = Arc::new(new_locker(test_config()).await);
        let name = unique_name("fanout");
        let counter = Arc::new(AtomicUsize::new(0));
        let busy = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let locker = locker.clone();
            let name = name.clone();
            let counter = counter.clone();
            let busy = busy.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let ctx = CancellationToken::new();
                    let guard = locker.with_context(&ctx, &name).await.unwrap();
                    assert!(!busy.swap(true, Ordering::SeqCst), "two holders at once");
                    counter.fetch_add(1, Ordering::SeqCst);
                    busy.store(false, Ordering::SeqCst);
                    guard.release();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(locker.shared.gates.len(), 0);
        locker.close();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn external_delete_cancels_lease() {
        let locker = new_locker(test_config()).await;
        let name = unique_name("deleted");
        let ctx = CancellationToken::new();
        let guard = locker.with_context(&ctx, &name).await.unwrap();

        let mut conn = external_connection().await;
        for slot in 0..2 {
            let key = keyname(&locker.shared.prefix, &name, slot);
            let _: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(3), guard.lease().cancelled_owned())
            .await
            .expect("lease should be canceled after losing the majority");
        drop(guard);
        locker.close();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn setpx_external_delete_cancels_lease_within_validity() {
        let config = test_config()
            .with_fallback_setpx(true)
            .with_key_validity(Duration::from_secs(1))
            .with_extend_interval(Duration::from_millis(300));
        let locker = new_locker(config).await;
        let name = unique_name("setpx-deleted");
        let ctx = CancellationToken::new();
        let guard = locker.with_context(&ctx, &name).await.unwrap();

        let mut conn = external_connection().await;
        for slot in 0..2 {
            let key = keyname(&locker.shared.prefix, &name, slot);
            let _: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await.unwrap();
        }

        // No invalidations in SETPX mode; the next extension tick finds
        // the slots gone and surrenders the lease.
        tokio::time::timeout(Duration::from_secs(2), guard.lease().cancelled_owned())
            .await
            .expect("extension must not re-grab deleted slots");
        drop(guard);
        locker.close();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn external_pexpire_is_extended_back() {
        let locker = new_locker(test_config()).await;
        let name = unique_name("pexpire");
        let ctx = CancellationToken::new();
        let guard = locker.with_context(&ctx, &name).await.unwrap();

        let mut conn = external_connection().await;
        for slot in 0..2 {
            let key = keyname(&locker.shared.prefix, &name, slot);
            let _: i64 = redis::cmd("PEXPIRE")
                .arg(&key)
                .arg(100)
                .query_async(&mut conn)
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(guard.is_valid(), "holder should have re-extended the slots");
        guard.release();
        locker.close();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn lease_survives_beyond_validity_by_auto_extension() {
        let config = test_config()
            .with_key_validity(Duration::from_secs(2))
            .with_extend_interval(Duration::from_secs(1));
        let locker = new_locker(config).await;
        let name = unique_name("autoextend");
        let ctx = CancellationToken::new();
        let guard = locker.with_context(&ctx, &name).await.unwrap();

        for _ in 0..2 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            assert!(guard.is_valid(), "lease should outlive validity while extending");
        }
        guard.release();
        locker.close();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn setpx_mode_auto_extends_and_hands_off() {
        let config = test_config()
            .with_fallback_setpx(true)
            .with_key_validity(Duration::from_secs(1))
            .with_extend_interval(Duration::from_millis(300));
        let locker = Arc::new(new_locker(config).await);
        let name = unique_name("setpx");
        let ctx = CancellationToken::new();
        let guard = locker.with_context(&ctx, &name).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(guard.is_valid());

        let waiter = {
            let locker = locker.clone();
            let name = name.clone();
            tokio::spawn(async move {
                let ctx = CancellationToken::new();
                locker.with_context(&ctx, &name).await
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        guard.release();

        let handed_off = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap()
            .unwrap();
        handed_off.release();
        locker.close();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn dead_context_is_rejected() {
        let locker = new_locker(test_config()).await;
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = locker
            .with_context(&ctx, &unique_name("dead"))
            .await
            .unwrap_err();
        assert!(matches!(err, LockerError::Canceled));
        locker.close();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn canceling_context_releases_waiters_and_holder() {
        let locker = Arc::new(new_locker(test_config()).await);
        let name = unique_name("cancel");
        let ctx = CancellationToken::new();
        let guard = locker.with_context(&ctx, &name).await.unwrap();

        let mut waiters = Vec::new();
        for _ in 0..5 {
            let locker = locker.clone();
            let name = name.clone();
            let child = ctx.child_token();
            waiters.push(tokio::spawn(async move {
                locker.with_context(&child, &name).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        ctx.cancel();

        for waiter in waiters {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(matches!(err, LockerError::Canceled));
        }
        tokio::time::timeout(Duration::from_secs(1), guard.lease().cancelled_owned())
            .await
            .expect("holder lease follows the parent context");
        drop(guard);

        // The gate entry disappears once the holder teardown has run.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(locker.shared.gates.len(), 0);

        let ctx = CancellationToken::new();
        let reacquired = locker.try_with_context(&ctx, &name).await.unwrap();
        reacquired.release();
        locker.close();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn try_with_context_reports_contention() {
        let locker = new_locker(test_config()).await;
        let other = new_locker(test_config()).await;
        let name = unique_name("try");
        let ctx = CancellationToken::new();

        let guard = locker.try_with_context(&ctx, &name).await.unwrap();

        // Local contention short-circuits on the engaged gate.
        let err = locker.try_with_context(&ctx, &name).await.unwrap_err();
        assert!(matches!(err, LockerError::NotLocked));
        // Remote contention fails on the slot majority.
        let err = other.try_with_context(&ctx, &name).await.unwrap_err();
        assert!(matches!(err, LockerError::NotLocked));

        guard.release();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let reacquired = other.try_with_context(&ctx, &name).await.unwrap();
        reacquired.release();
        locker.close();
        other.close();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn close_is_final() {
        let locker = Arc::new(new_locker(test_config()).await);
        let name = unique_name("close");
        let ctx = CancellationToken::new();
        let guard = locker.with_context(&ctx, &name).await.unwrap();

        let mut waiters = Vec::new();
        for _ in 0..5 {
            let locker = locker.clone();
            let name = name.clone();
            waiters.push(tokio::spawn(async move {
                let ctx = CancellationToken::new();
                locker.with_context(&ctx, &name).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        locker.close();

        for waiter in waiters {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(matches!(err, LockerError::LockerClosed));
        }
        tokio::time::timeout(Duration::from_secs(1), guard.lease().cancelled_owned())
            .await
            .expect("holder lease is canceled on close");

        let err = locker
            .with_context(&CancellationToken::new(), &name)
            .await
            .unwrap_err();
        assert!(matches!(err, LockerError::LockerClosed));
        assert!(locker.is_closed());
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn flushall_cancels_holders_and_recovers() {
        let locker = new_locker(test_config()).await;
        let name = unique_name("flush");
        let ctx = CancellationToken::new();
        let guard = locker.with_context(&ctx, &name).await.unwrap();

        let mut conn = external_connection().await;
        let _: String = redis::cmd("FLUSHALL").query_async(&mut conn).await.unwrap();

        tokio::time::timeout(Duration::from_secs(3), guard.lease().cancelled_owned())
            .await
            .expect("flush invalidates every tracked slot");
        drop(guard);

        let reacquired = locker
            .with_context(&ctx, &unique_name("flush-after"))
            .await
            .unwrap();
        reacquired.release();
        locker.close();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn force_release_unsticks_a_name() {
        let locker = new_locker(test_config()).await;
        let other = new_locker(test_config()).await;
        let name = unique_name("force");
        let ctx = CancellationToken::new();

        let _guard = locker.with_context(&ctx, &name).await.unwrap();
        let deleted = other.force_release(&name).await.unwrap();
        assert!(deleted >= locker.shared.majority as u64);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let reacquired = other.try_with_context(&ctx, &name).await.unwrap();
        reacquired.release();
        locker.close();
        other.close();
    }
}
