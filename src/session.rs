/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Sessions: one connection to a repository
//!
//! A session owns the revision cache and the package registry shared by
//! its views, and serialises the application of invalidations (remote and
//! local commit notifications) to those views.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use crate::branch::{BranchId, BranchPoint};
use crate::error::{Error, Result, StoreError};
use crate::package::{PackageRegistry, PackageState, PackageUnit};
use crate::revision::Revision;
use crate::revision_manager::RevisionManager;
use crate::state_machine::StateMachine;
use crate::store::{Invalidation, RevisionStore, SessionId};
use crate::transaction::{Transaction, TransactionOptions};
use crate::view::{InvalidationTarget, View, ViewCore, ViewEvent, ViewId};

/// Session options
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Apply remote commits to open views. When false, remote commits only
    /// update the revision cache.
    pub passive_updates: bool,
    /// Apply invalidations strictly in commit order, buffering early
    /// arrivals and dropping duplicates
    pub enforce_invalidation_order: bool,
    /// Versions kept per object and branch in the revision cache
    pub revision_cache_versions: usize,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            passive_updates: true,
            enforce_invalidation_order: true,
            revision_cache_versions: 16,
        }
    }
}

// Everything guarded by the session's invalidation lock
pub(crate) struct InvalidationState {
    pub last_update_time: i64,
    next_sequence: u64,
    // sequence numbers of our own commits not yet reached
    own: BTreeSet<u64>,
    pending: BTreeMap<u64, Invalidation>,
}

impl InvalidationState {
    fn new(last_sequence: u64, last_update_time: i64) -> InvalidationState {
        InvalidationState {
            last_update_time,
            next_sequence: last_sequence + 1,
            own: BTreeSet::new(),
            pending: BTreeMap::new(),
        }
    }

    // Accept a remote invalidation; return those now ready, in order
    fn accept(&mut self, inv: Invalidation, enforce: bool) -> Vec<Invalidation> {
        if !enforce {
            self.next_sequence = self.next_sequence.max(inv.sequence + 1);
            return vec![inv];
        }
        if inv.sequence < self.next_sequence || self.own.contains(&inv.sequence)
            || self.pending.contains_key(&inv.sequence)
        {
            warn!("Dropping duplicate or stale invalidation {} (expecting {})",
                    inv.sequence, self.next_sequence);
            return vec![];
        }
        self.pending.insert(inv.sequence, inv);
        self.drain()
    }

    // Record a local commit; return invalidations it unblocked
    fn own_commit(&mut self, sequence: u64, enforce: bool) -> Vec<Invalidation> {
        if !enforce {
            self.next_sequence = self.next_sequence.max(sequence + 1);
            return vec![];
        }
        if sequence >= self.next_sequence {
            self.own.insert(sequence);
        }
        self.drain()
    }

    fn drain(&mut self) -> Vec<Invalidation> {
        let mut ready = vec![];
        loop {
            if self.own.remove(&self.next_sequence) {
                self.next_sequence += 1;
                continue;
            }
            match self.pending.remove(&self.next_sequence) {
                Some(inv) => {
                    ready.push(inv);
                    self.next_sequence += 1;
                }
                None => break,
            }
        }
        if !self.pending.is_empty() {
            debug!("{} invalidations waiting for sequence {}", self.pending.len(), self.next_sequence);
        }
        ready
    }
}

type Notification = (Arc<dyn InvalidationTarget>, Vec<ViewEvent>);

pub(crate) struct SessionInner {
    pub id: SessionId,
    pub store: Arc<dyn RevisionStore>,
    pub config: SessionConfig,
    pub state_machine: StateMachine,
    pub revisions: RevisionManager,
    pub packages: Mutex<PackageRegistry>,
    invalidation: Mutex<InvalidationState>,
    views: Mutex<Vec<(ViewId, Weak<dyn InvalidationTarget>)>>,
    receiver: Mutex<Option<Receiver<Invalidation>>>,
    next_view: AtomicU64,
}

impl SessionInner {
    pub fn invalidation_lock(&self) -> MutexGuard<InvalidationState> {
        self.invalidation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn packages(&self) -> MutexGuard<PackageRegistry> {
        self.packages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn views(&self) -> MutexGuard<Vec<(ViewId, Weak<dyn InvalidationTarget>)>> {
        self.views.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_view_id(&self) -> ViewId {
        ViewId(self.next_view.fetch_add(1, Ordering::SeqCst))
    }

    pub fn register_view(&self, target: Weak<dyn InvalidationTarget>, id: ViewId) {
        self.views().push((id, target));
    }

    pub fn deregister_view(&self, id: ViewId) {
        self.views().retain(|&(v, _)| v != id);
    }

    fn live_views(&self, exclude: Option<ViewId>) -> Vec<Arc<dyn InvalidationTarget>> {
        let mut views = self.views();
        views.retain(|(_, w)| w.strong_count() > 0);
        views.iter()
            .filter(|&&(id, _)| Some(id) != exclude)
            .filter_map(|(_, w)| w.upgrade())
            .collect()
    }

    // Update cache and registry, then distribute to views (except `exclude`)
    fn apply_invalidation(&self, guard: &mut InvalidationState, inv: &Invalidation,
            exclude: Option<ViewId>, new_revisions: Vec<Revision>) -> Vec<Notification>
    {
        trace!("Session {}: applying invalidation {} ({} dirty, {} detached)",
                self.id, inv.sequence, inv.dirty.len(), inv.detached.len());
        let revised = inv.timestamp - 1;
        for &(id, _) in &inv.dirty {
            self.revisions.mark_revised(id, inv.branch, revised);
        }
        for &id in &inv.detached {
            self.revisions.mark_revised(id, inv.branch, revised);
        }
        for rev in new_revisions {
            self.revisions.add_revision(rev);
        }
        if !inv.new_packages.is_empty() {
            let mut packages = self.packages();
            for unit in &inv.new_packages {
                let mut unit = unit.clone();
                unit.state = PackageState::Loaded;
                packages.register(unit);
            }
        }
        guard.last_update_time = guard.last_update_time.max(inv.timestamp);

        if exclude.is_none() && !self.config.passive_updates {
            return vec![];
        }
        self.live_views(exclude).into_iter()
            .filter_map(|target| {
                let events = target.invalidate(inv);
                if events.is_empty() { None } else { Some((target, events)) }
            })
            .collect()
    }

    /// Handle a remote invalidation
    pub fn handle_invalidation(&self, inv: Invalidation) {
        let notifications = {
            let mut guard = self.invalidation_lock();
            let ready = guard.accept(inv, self.config.enforce_invalidation_order);
            let mut notifications = vec![];
            for inv in &ready {
                notifications.extend(self.apply_invalidation(&mut guard, inv, None, vec![]));
            }
            notifications
        };
        deliver(notifications);
    }

    /// Apply the notification of a local commit. The caller holds the
    /// invalidation lock; the returned notifications must be delivered after
    /// releasing it.
    pub fn commit_notification(&self, guard: &mut InvalidationState, inv: &Invalidation,
            committer: ViewId, new_revisions: Vec<Revision>) -> Vec<Notification>
    {
        let mut notifications = self.apply_invalidation(guard, inv, Some(committer), new_revisions);
        let ready = guard.own_commit(inv.sequence, self.config.enforce_invalidation_order);
        for inv in &ready {
            notifications.extend(self.apply_invalidation(guard, inv, None, vec![]));
        }
        notifications
    }

    fn take_receiver(&self) -> Option<Receiver<Invalidation>> {
        self.receiver.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Deliver events collected under the session's locks
pub(crate) fn deliver(notifications: Vec<Notification>) {
    for (target, events) in notifications {
        target.notify(events);
    }
}

/// A session: one client connection to a repository
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Open a session on a repository
    pub fn open(store: Arc<dyn RevisionStore>, config: SessionConfig) -> Session {
        let id = store.open_session();
        let subscription = store.subscribe(id);
        let revisions = RevisionManager::new(store.clone(), config.revision_cache_versions);
        info!("Opened session {} on repository {}", id, store.name());
        Session {
            inner: Arc::new(SessionInner {
                id,
                store,
                config,
                state_machine: StateMachine::new(),
                revisions,
                packages: Mutex::new(PackageRegistry::new()),
                invalidation: Mutex::new(InvalidationState::new(
                        subscription.last_sequence, subscription.last_commit_time)),
                views: Mutex::new(vec![]),
                receiver: Mutex::new(Some(subscription.receiver)),
                next_view: AtomicU64::new(1),
            }),
        }
    }

    pub fn id(&self) -> SessionId { self.inner.id }
    pub fn config(&self) -> &SessionConfig { &self.inner.config }
    pub fn store(&self) -> &Arc<dyn RevisionStore> { &self.inner.store }

    /// The session's revision cache
    pub fn revision_manager(&self) -> &RevisionManager { &self.inner.revisions }

    /// The object state machine shared by the session's views
    pub fn state_machine(&self) -> &StateMachine { &self.inner.state_machine }

    /// Open a read-only view. Views at the head of a branch follow remote
    /// commits; views at a fixed time never change.
    pub fn open_view(&self, point: BranchPoint) -> Result<View> {
        if !self.inner.revisions.branches().contains(point.branch) {
            return Err(StoreError::UnknownBranch(point.branch.0).into());
        }
        let core = Arc::new(ViewCore::new(self.inner.next_view_id(), self.inner.clone(), point));
        let weak: Weak<ViewCore> = Arc::downgrade(&core);
        self.inner.register_view(weak, core.id);
        debug!("Session {}: opened view {} at {}", self.inner.id, core.id, point);
        Ok(View::new(core))
    }

    /// Open a transaction on the head of `branch` with default options
    pub fn open_transaction(&self, branch: BranchId) -> Result<Transaction> {
        self.open_transaction_with(branch, TransactionOptions::default())
    }

    /// Open a transaction on the head of `branch`
    pub fn open_transaction_with(&self, branch: BranchId, options: TransactionOptions) -> Result<Transaction> {
        if !self.inner.revisions.branches().contains(branch) {
            return Err(StoreError::UnknownBranch(branch.0).into());
        }
        let tx = Transaction::new(self.inner.clone(), branch, options);
        debug!("Session {}: opened transaction {} on branch {}", self.inner.id, tx.id(), branch);
        Ok(tx)
    }

    /// Register a package unit. Units registered here are sent with the
    /// first commit which creates instances of their classes.
    pub fn register_package(&self, unit: PackageUnit) {
        self.inner.packages().register(unit);
    }

    pub fn package_state(&self, uri: &str) -> Option<PackageState> {
        self.inner.packages().state(uri)
    }

    /// Handle an invalidation received by other means than the session's
    /// own subscription
    pub fn handle_invalidation(&self, inv: Invalidation) {
        self.inner.handle_invalidation(inv);
    }

    /// Apply all invalidations received so far. Returns the number
    /// received. Does nothing while a listener thread is running.
    pub fn process_invalidations(&self) -> usize {
        let received: Vec<Invalidation> = {
            let receiver = self.inner.receiver.lock().unwrap_or_else(PoisonError::into_inner);
            match *receiver {
                Some(ref r) => r.try_iter().collect(),
                None => vec![],
            }
        };
        let n = received.len();
        for inv in received {
            self.inner.handle_invalidation(inv);
        }
        n
    }

    /// Apply invalidations on a background thread as they arrive. The
    /// thread stops when the session is closed or dropped.
    pub fn spawn_invalidation_listener(&self) -> Result<thread::JoinHandle<()>> {
        let receiver = self.inner.take_receiver()
            .ok_or_else(|| Error::illegal("invalidation listener already running"))?;
        let weak = Arc::downgrade(&self.inner);
        let name = format!("invalidations-{}", self.inner.id);
        let handle = thread::Builder::new().name(name).spawn(move || {
            for inv in receiver.iter() {
                match weak.upgrade() {
                    Some(session) => session.handle_invalidation(inv),
                    None => break,
                }
            }
            debug!("Invalidation listener stopped");
        })?;
        Ok(handle)
    }

    /// Time of the last commit applied to this session
    pub fn last_update_time(&self) -> i64 {
        self.inner.invalidation_lock().last_update_time
    }

    /// Stop receiving invalidations and release all locks held by the
    /// session's transactions
    pub fn close(&self) {
        self.inner.store.unsubscribe(self.inner.id);
        info!("Closed session {}", self.inner.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inv(sequence: u64) -> Invalidation {
        Invalidation {
            sequence,
            timestamp: sequence as i64 * 10,
            branch: BranchId::MAIN,
            committer: SessionId(9),
            new_packages: vec![],
            dirty: vec![],
            detached: vec![],
            deltas: vec![],
        }
    }

    #[test]
    fn orders_invalidations() {
        let mut state = InvalidationState::new(3, 0);
        assert!(state.accept(inv(5), true).is_empty());
        assert!(state.accept(inv(6), true).is_empty());
        let ready: Vec<u64> = state.accept(inv(4), true).iter().map(|i| i.sequence).collect();
        assert_eq!(ready, vec![4, 5, 6]);
        // duplicate and stale
        assert!(state.accept(inv(5), true).is_empty());
        assert!(state.accept(inv(2), true).is_empty());
    }

    #[test]
    fn skips_own_commits() {
        let mut state = InvalidationState::new(0, 0);
        assert!(state.accept(inv(2), true).is_empty());
        let ready: Vec<u64> = state.own_commit(1, true).iter().map(|i| i.sequence).collect();
        assert_eq!(ready, vec![2]);
        assert!(state.own_commit(4, true).is_empty());
        let ready: Vec<u64> = state.accept(inv(3), true).iter().map(|i| i.sequence).collect();
        assert_eq!(ready, vec![3]);
        assert_eq!(state.next_sequence, 5);
    }

    #[test]
    fn unordered_mode_delivers_immediately() {
        let mut state = InvalidationState::new(0, 0);
        assert_eq!(state.accept(inv(3), false).len(), 1);
        assert_eq!(state.accept(inv(2), false).len(), 1);
    }
}
