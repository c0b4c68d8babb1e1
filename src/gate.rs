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
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::errors::{LockerError, LockerResult};

/// The current local holder of a gate: its lease token plus the random
/// value written into the slot keys, which guards release and extension.
pub(crate) struct Holder {
    pub lease: CancellationToken,
    pub token: String,
}

/// Mutable gate state, guarded by one small lock. `csc` records which
/// slots are known to be server-side tracked for the current holder;
/// `holder` is cleared on release so no reference cycle forms.
pub(crate) struct GateState {
    pub csc: Vec<bool>,
    pub holder: Option<Holder>,
}

impl GateState {
    pub fn tracked(&self) -> usize {
        self.csc.iter().filter(|b| **b).count()
    }
}

/// In-process rendezvous for every local caller of one lock name.
///
/// `notify` is the edge-triggered wake signal: `notify_one` stores at most
/// one permit, so redundant signals are a legal no-op and a woken waiter
/// always re-checks Redis state.
pub(crate) struct Gate {
    pub notify: Notify,
    pub state: Mutex<GateState>,
}

impl Gate {
    fn new(totalcnt: usize) -> Arc<Self> {
        Arc::new(Self {
            notify: Notify::new(),
            state: Mutex::new(GateState {
                csc: vec![false; totalcnt],
                holder: None,
            }),
        })
    }
}

struct GateSlot {
    w: usize,
    gate: Arc<Gate>,
}

/// Process-local map `name -> Gate`, reference-counting in-process
/// waiters. `None` means the locker is closed; every reservation fails
/// from then on.
pub(crate) struct GateTable {
    gates: RwLock<Option<HashMap<String, GateSlot>>>,
    totalcnt: usize,
}

impl GateTable {
    pub fn new(totalcnt: usize) -> Self {
        Self {
            gates: RwLock::new(Some(HashMap::new())),
            totalcnt,
        }
    }

    /// Register one waiter. Returns the gate and whether it was freshly
    /// created; a fresh creator may attempt acquisition immediately while
    /// joiners must wait for a wake signal.
    pub fn reserve(&self, name: &str) -> LockerResult<(Arc<Gate>, bool)> {
        let mut guard = self.gates.write();
        let map = guard.as_mut().ok_or(LockerError::LockerClosed)?;
        match map.get_mut(name) {
            Some(slot) => {
                // A leftover entry with w == 0 is reclaimable; reuse it.
                let fresh = slot.w == 0;
                slot.w += 1;
                Ok((slot.gate.clone(), fresh))
            }
            None => {
                let gate = Gate::new(self.totalcnt);
                map.insert(name.to_string(), GateSlot { w: 1, gate: gate.clone() });
                Ok((gate, true))
            }
        }
    }

    /// Single-shot reservation: refuses when any local caller is already
    /// engaged with this name.
    pub fn try_reserve(&self, name: &str) -> LockerResult<Option<Arc<Gate>>> {
        let mut guard = self.gates.write();
        let map = guard.as_mut().ok_or(LockerError::LockerClosed)?;
        match map.get_mut(name) {
            Some(slot) if slot.w > 0 => Ok(None),
            Some(slot) => {
                slot.w += 1;
                Ok(Some(slot.gate.clone()))
            }
            None => {
                let gate = Gate::new(self.totalcnt);
                map.insert(name.to_string(), GateSlot { w: 1, gate: gate.clone() });
                Ok(Some(gate))
            }
        }
    }

    /// Unregister one waiter; the entry is removed once the count reaches
    /// zero. Pointer identity protects against unreserving a same-named
    /// successor gate. No-op after close.
    pub fn release(&self, name: &str, gate: &Arc<Gate>) {
        let mut guard = self.gates.write();
        let Some(map) = guard.as_mut() else { return };
        if let Some(slot) = map.get_mut(name) {
            if !Arc::ptr_eq(&slot.gate, gate) {
                return;
            }
            slot.w = slot.w.saturating_sub(1);
            if slot.w == 0 {
                map.remove(name);
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Gate>> {
        self.gates
            .read()
            .as_ref()
            .and_then(|map| map.get(name).map(|slot| slot.gate.clone()))
    }

    /// Snapshot of every live gate, for sentinel invalidations.
    pub fn snapshot(&self) -> Vec<Arc<Gate>> {
        self.gates
            .read()
            .as_ref()
            .map(|map| map.values().map(|slot| slot.gate.clone()).collect())
            .unwrap_or_default()
    }

    /// Transition to the closed state, handing back the gates that still
    /// need their holders canceled and waiters woken.
    pub fn close(&self) -> Vec<Arc<Gate>> {
        self.gates
            .write()
            .take()
            .map(|map| map.into_values().map(|slot| slot.gate).collect())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.gates.read().is_none()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.gates.read().as_ref().map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_counts_waiters_and_release_cleans_up() {
        let table = GateTable::new(3);
        let (g1, fresh1) = table.reserve("k").unwrap();
        let (g2, fresh2) = table.reserve("k").unwrap();
        assert!(fresh1);
        assert!(!fresh2);
        assert!(Arc::ptr_eq(&g1, &g2));
        assert_eq!(table.len(), 1);

        table.release("k", &g1);
        assert_eq!(table.len(), 1);
        table.release("k", &g2);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn try_reserve_refuses_engaged_names() {
        let table = GateTable::new(3);
        let gate = table.try_reserve("k").unwrap().unwrap();
        assert!(table.try_reserve("k").unwrap().is_none());
        table.release("k", &gate);
        assert!(table.try_reserve("k").unwrap().is_some());
    }

    #[test]
    fn release_ignores_replaced_gate() {
        let table = GateTable::new(3);
        let (old, _) = table.reserve("k").unwrap();
        table.release("k", &old);
        let (new, fresh) = table.reserve("k").unwrap();
        assert!(fresh);
        // Releasing through the stale handle must not drop the new entry.
        table.release("k", &old);
        assert_eq!(table.len(), 1);
        table.release("k", &new);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn close_fails_later_reservations() {
        let table = GateTable::new(3);
        let (gate, _) = table.reserve("k").unwrap();
        let gates = table.close();
        assert_eq!(gates.len(), 1);
        assert!(Arc::ptr_eq(&gates[0], &gate));
        assert!(matches!(table.reserve("k"), Err(LockerError::LockerClosed)));
        assert!(matches!(table.try_reserve("k"), Err(LockerError::LockerClosed)));
        assert!(table.is_closed());
    }

    #[test]
    fn tracked_counts_set_bits() {
        let table = GateTable::new(3);
        let (gate, _) = table.reserve("k").unwrap();
        {
            let mut state = gate.state.lock();
            state.csc[0] = true;
            state.csc[2] = true;
            assert_eq!(state.tracked(), 2);
        }
        table.release("k", &gate);
    }
}
