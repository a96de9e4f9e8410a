//! Resumable waiters.
//!
//! A waiter is one suspended unit of work (a stalled lookup, a transaction
//! waiting on flushes, a buffered request). Its `usecount` is the number of
//! readiness conditions it is still enqueued on; it resolves exactly once,
//! when the count returns to zero, carrying the first error reported by
//! any of those conditions.

use std::collections::HashMap;

use arbor_types::{ClientId, KvsError};

/// Opaque handle to a waiter record.
pub type WaitId = u64;

/// One suspended unit of work carrying an engine-defined action payload.
#[derive(Debug)]
pub struct Waiter<A> {
    action: A,
    usecount: u32,
    errnum: Option<KvsError>,
    client: Option<ClientId>,
}

/// Registry of waiters, keyed by [`WaitId`].
#[derive(Debug)]
pub struct WaitMgr<A> {
    next_id: WaitId,
    waiters: HashMap<WaitId, Waiter<A>>,
}

impl<A> Default for WaitMgr<A> {
    fn default() -> Self {
        Self { next_id: 1, waiters: HashMap::new() }
    }
}

impl<A> WaitMgr<A> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter with usecount zero.
    ///
    /// `client` tags the waiter for disconnect cleanup.
    pub fn create(&mut self, action: A, client: Option<ClientId>) -> WaitId {
        let id = self.next_id;
        self.next_id += 1;
        self.waiters.insert(id, Waiter { action, usecount: 0, errnum: None, client });
        id
    }

    /// Bump the usecount: the waiter was enqueued on one more condition.
    pub fn incref(&mut self, id: WaitId) {
        if let Some(waiter) = self.waiters.get_mut(&id) {
            waiter.usecount += 1;
        }
    }

    /// Outstanding condition count, or 0 for an unknown id.
    pub fn usecount(&self, id: WaitId) -> u32 {
        self.waiters.get(&id).map(|w| w.usecount).unwrap_or(0)
    }

    /// Number of live waiters.
    pub fn count(&self) -> usize {
        self.waiters.len()
    }

    /// Resolve one condition for each id, with an optional error.
    ///
    /// Waiters whose usecount reaches zero are removed and returned with
    /// the first error any of their conditions reported. Stale ids (already
    /// destroyed, e.g. by disconnect) are ignored.
    pub fn complete(
        &mut self,
        ids: impl IntoIterator<Item = WaitId>,
        errnum: Option<KvsError>,
    ) -> Vec<(A, Option<KvsError>)> {
        let mut done = Vec::new();
        for id in ids {
            let Some(waiter) = self.waiters.get_mut(&id) else {
                continue;
            };
            if waiter.errnum.is_none() {
                waiter.errnum = errnum;
            }
            waiter.usecount = waiter.usecount.saturating_sub(1);
            if waiter.usecount == 0 {
                let waiter = self.waiters.remove(&id).expect("waiter present");
                done.push((waiter.action, waiter.errnum));
            }
        }
        done
    }

    /// Destroy a waiter that was never enqueued anywhere.
    pub fn abandon(&mut self, id: WaitId) -> Option<A> {
        self.waiters.remove(&id).map(|w| w.action)
    }

    /// Destroy every waiter tagged with `client`, returning the destroyed
    /// ids so the caller can purge them from cache entry queues.
    pub fn remove_client(&mut self, client: ClientId) -> std::collections::HashSet<WaitId> {
        let ids: std::collections::HashSet<WaitId> = self
            .waiters
            .iter()
            .filter(|(_, w)| w.client == Some(client))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.waiters.remove(id);
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiter_fires_when_last_condition_resolves() {
        let mut mgr: WaitMgr<u32> = WaitMgr::new();
        let w = mgr.create(7, None);
        mgr.incref(w);
        mgr.incref(w);
        assert!(mgr.complete([w], None).is_empty());
        let done = mgr.complete([w], None);
        assert_eq!(done, vec![(7, None)]);
        assert_eq!(mgr.count(), 0);
    }

    #[test]
    fn first_error_wins() {
        let mut mgr: WaitMgr<()> = WaitMgr::new();
        let w = mgr.create((), None);
        mgr.incref(w);
        mgr.incref(w);
        mgr.complete([w], Some(KvsError::NotSup));
        let done = mgr.complete([w], Some(KvsError::Perm));
        assert_eq!(done, vec![((), Some(KvsError::NotSup))]);
    }

    #[test]
    fn remove_client_destroys_tagged_waiters() {
        let mut mgr: WaitMgr<u32> = WaitMgr::new();
        let keep = mgr.create(1, Some(ClientId(1)));
        let drop1 = mgr.create(2, Some(ClientId(2)));
        let drop2 = mgr.create(3, Some(ClientId(2)));
        mgr.incref(keep);
        mgr.incref(drop1);
        mgr.incref(drop2);

        let removed = mgr.remove_client(ClientId(2));
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&drop1) && removed.contains(&drop2));
        // stale ids are ignored on completion
        assert!(mgr.complete([drop1, drop2], None).is_empty());
        assert_eq!(mgr.complete([keep], None), vec![(1, None)]);
    }
}
