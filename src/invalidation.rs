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
use std::sync::{Arc, Weak};
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{PushInfo, PushKind, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use crate::errors::LockerResult;
use crate::gate::Gate;
use crate::keys::{keyname, parse_key};
use crate::locker::Shared;
use crate::scripts::EXTEND_SCRIPT;
use crate::util::num_milliseconds;

/// Install server-assisted invalidation for every key under our prefix.
/// Broadcast mode keeps the subscription connection-wide, so a single
/// `CLIENT TRACKING` covers all slot keys past and future.
pub(crate) async fn enable_tracking(
    conn: &mut ConnectionManager,
    prefix: &str,
    no_loop: bool,
) -> LockerResult<()> {
    let mut cmd = redis::cmd("CLIENT");
    cmd.arg("TRACKING")
        .arg("ON")
        .arg("BCAST")
        .arg("PREFIX")
        .arg(format!("{prefix}:"));
    if no_loop {
        cmd.arg("NOLOOP");
    }
    cmd.query_async::<()>(conn).await?;
    Ok(())
}

/// Spawn the router task draining server pushes. It holds only a weak
/// reference to the locker internals and exits when the locker is dropped,
/// closed, or the push channel ends.
pub(crate) fn spawn(shared: Weak<Shared>, rx: UnboundedReceiver<PushInfo>) {
    tokio::spawn(run(shared, rx));
}

async fn run(weak: Weak<Shared>, mut rx: UnboundedReceiver<PushInfo>) {
    while let Some(push) = rx.recv().await {
        let Some(shared) = weak.upgrade() else { break };
        if shared.closed.is_cancelled() {
            break;
        }
        match push.kind {
            PushKind::Invalidate => on_invalidations(&shared, push.data),
            PushKind::Disconnection => {
                debug!("connection lost, treating all tracked slots as invalidated");
                sentinel(&shared);
                spawn_retrack(&shared);
            }
            _ => {}
        }
    }
    debug!("invalidation router stopped");
}

/// Dispatch one invalidation push. A `nil` payload is the sentinel for
/// "tracking lost" (FLUSHALL, FLUSHDB); a key array is routed per gate.
pub(crate) fn on_invalidations(shared: &Arc<Shared>, data: Vec<Value>) {
    let mut keys = Vec::new();
    let mut lost_all = data.is_empty();
    for value in data {
        match value {
            Value::Nil => lost_all = true,
            Value::Array(items) | Value::Set(items) => {
                for item in items {
                    if let Some(key) = value_to_key(item) {
                        keys.push(key);
                    }
                }
            }
            other => {
                if let Some(key) = value_to_key(other) {
                    keys.push(key);
                }
            }
        }
    }
    if lost_all {
        sentinel(shared);
        return;
    }
    for key in keys {
        route_key(shared, &key);
    }
}

fn value_to_key(value: Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Value::SimpleString(s) => Some(s),
        _ => None,
    }
}

/// One changed slot key: clear its tracked flag, then either let the
/// holder race to win the slot back or wake a sleeping waiter.
fn route_key(shared: &Arc<Shared>, key: &str) {
    let Some((name, slot)) = parse_key(&shared.prefix, key) else {
        debug!(key = %key, "ignoring invalidation for foreign key");
        return;
    };
    let Some(gate) = shared.gates.lookup(name) else { return };

    let held = {
        let mut state = gate.state.lock();
        if (slot as usize) < state.csc.len() {
            state.csc[slot as usize] = false;
        }
        state.holder.is_some()
    };
    if held {
        // The slot may have been PEXPIREd, overwritten, or merely be the
        // echo of the holder's own write. A token-guarded re-extension
        // settles it: still ours means the flag (and the TTL) come back,
        // gone means the loss is confirmed and the lease falls with the
        // majority.
        tokio::spawn(reextend_holder(shared.clone(), gate, name.to_string()));
    } else {
        gate.notify.notify_one();
    }
}

/// Re-extend the untracked slots of a held gate. Slots still carrying the
/// holder's token get a fresh validity and their `csc` bit back; slots
/// that are gone stay cleared, and the lease is canceled once fewer than
/// a majority remain.
async fn reextend_holder(shared: Arc<Shared>, gate: Arc<Gate>, name: String) {
    let (token, cleared) = {
        let state = gate.state.lock();
        let Some(holder) = &state.holder else { return };
        let cleared: Vec<u32> = (0..state.csc.len() as u32)
            .filter(|slot| !state.csc[*slot as usize])
            .collect();
        (holder.token.clone(), cleared)
    };

    let px = num_milliseconds(&shared.validity);
    let mut regained = Vec::new();
    for slot in cleared {
        let key = keyname(&shared.prefix, &name, slot);
        let mut conn = shared.conn.clone();
        let reply = tokio::time::timeout(
            shared.timeout,
            EXTEND_SCRIPT
                .key(&key)
                .arg(&token)
                .arg(px)
                .invoke_async::<i64>(&mut conn),
        )
        .await;
        if let Ok(Ok(1)) = reply {
            regained.push(slot);
        }
    }

    let mut state = gate.state.lock();
    if !state.holder.as_ref().is_some_and(|h| h.token == token) {
        return;
    }
    for slot in &regained {
        state.csc[*slot as usize] = true;
    }
    if state.tracked() < shared.majority {
        debug!(name = %name, "slot majority lost while holding, canceling lease");
        if let Some(holder) = &state.holder {
            holder.lease.cancel();
        }
    }
}

/// Connection or tracking lost: every tracked flag is void, every holder
/// has lost its lease, and every gate gets a wake so waiters re-attempt.
pub(crate) fn sentinel(shared: &Arc<Shared>) {
    for gate in shared.gates.snapshot() {
        let mut state = gate.state.lock();
        for bit in state.csc.iter_mut() {
            *bit = false;
        }
        if let Some(holder) = &state.holder {
            holder.lease.cancel();
        }
        drop(state);
        gate.notify.notify_one();
    }
}

/// Re-arm `CLIENT TRACKING` after the manager reconnects, retrying on a
/// short backoff until it sticks or the locker closes.
fn spawn_retrack(shared: &Arc<Shared>) {
    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
        loop {
            let Some(shared) = weak.upgrade() else { return };
            if shared.closed.is_cancelled() {
                return;
            }
            let mut conn = shared.conn.clone();
            match enable_tracking(&mut conn, &shared.prefix, shared.no_loop_tracking).await {
                Ok(()) => {
                    debug!("re-enabled client tracking after reconnect");
                    return;
                }
                Err(e) => warn!(error = %e, "failed to re-enable client tracking, retrying"),
            }
            drop(shared);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
}
