/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The repository interface
//!
//! Sessions talk to a repository only through `RevisionStore`. Transport,
//! persistence and server-side mapping are the implementor's business;
//! `MemoryStore` is a complete in-process implementation.

mod memory;

pub use self::memory::MemoryStore;

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use chrono::Utc;

use crate::branch::{BranchId, BranchManager, BranchPoint, BranchVersion};
use crate::delta::RevisionDelta;
use crate::error::{Result, StoreError};
use crate::id::{IdMapper, ObjectId};
use crate::package::PackageUnit;
use crate::revision::Revision;
use crate::revision_info::RevisionInfo;
use crate::view::ViewId;

/// Identifies a session within a repository
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Holder of write locks and author of commits: one view of one session
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct LockOwner {
    pub session: SessionId,
    pub view: ViewId,
}

/// Everything a transaction sends to the repository on commit
#[derive(Clone, Debug)]
pub struct CommitRequest {
    pub owner: LockOwner,
    pub branch: BranchId,
    pub comment: Option<String>,
    /// Package units not yet known to the repository
    pub new_packages: Vec<PackageUnit>,
    /// Revisions of new objects, carrying temporary identifiers
    pub new_revisions: Vec<Revision>,
    /// Changes to persistent objects
    pub deltas: Vec<RevisionDelta>,
    /// Detached objects with the version the transaction last saw
    pub detached: Vec<(ObjectId, BranchVersion)>,
    /// Release all locks of `owner` on success
    pub release_locks: bool,
}

/// The repository's answer to a successful commit
#[derive(Clone, Debug, PartialEq)]
pub struct CommitResult {
    /// Position of this commit in the repository's commit order
    pub sequence: u64,
    /// Commit time, milliseconds since the UNIX epoch
    pub timestamp: i64,
    /// Persistent identifiers assigned to new objects
    pub id_mappings: IdMapper,
}

/// Notification that a commit changed objects
#[derive(Clone, Debug, PartialEq)]
pub struct Invalidation {
    /// Position of the commit in the repository's commit order
    pub sequence: u64,
    pub timestamp: i64,
    pub branch: BranchId,
    /// The session which committed
    pub committer: SessionId,
    pub new_packages: Vec<PackageUnit>,
    /// Changed objects with the version each had before the commit
    pub dirty: Vec<(ObjectId, BranchVersion)>,
    pub detached: Vec<ObjectId>,
    /// The changes, identifiers already mapped to persistent ones
    pub deltas: Vec<RevisionDelta>,
}

impl Invalidation {
    /// True if the commit changed nothing
    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty() && self.detached.is_empty() && self.new_packages.is_empty()
    }
}

/// A session's registration for invalidations
pub struct Subscription {
    pub receiver: Receiver<Invalidation>,
    /// Sequence number of the last commit before subscribing
    pub last_sequence: u64,
    /// Time of the last commit before subscribing
    pub last_commit_time: i64,
}

/// Source of commit timestamps
pub trait Clock: Send + Sync {
    /// The current time in milliseconds since the UNIX epoch. The default
    /// implementation uses `chrono::Utc::now()`.
    fn now(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// The system clock
#[derive(Debug, Default)]
pub struct SystemClock;
impl Clock for SystemClock {}

/// A deterministic clock: each reading returns the next millisecond
#[derive(Debug)]
pub struct ManualClock {
    time: AtomicI64,
}

impl ManualClock {
    /// Create, starting at `start`
    pub fn new(start: i64) -> ManualClock {
        ManualClock { time: AtomicI64::new(start) }
    }
    /// Jump forward (or back)
    pub fn set(&self, time: i64) {
        self.time.store(time, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.time.fetch_add(1, Ordering::SeqCst)
    }
}

/// The repository as seen by sessions
pub trait RevisionStore: Send + Sync {
    /// Repository name
    fn name(&self) -> &str;

    /// Branch topology
    fn branches(&self) -> Arc<BranchManager>;

    /// Register a new session
    fn open_session(&self) -> SessionId;

    /// Resolve `id` at `point`. Returns the resolved revision (`None` if the
    /// object does not exist there) and, if `with_synthetics`, the pointer
    /// or detached marker describing how it was resolved.
    fn revision(&self, id: ObjectId, point: BranchPoint, with_synthetics: bool)
            -> Result<(Option<Revision>, Option<Revision>)>;

    /// Get one exact revision
    fn revision_by_version(&self, id: ObjectId, bv: BranchVersion) -> Result<Option<Revision>>;

    /// Execute a batch of lookups in one round trip
    fn load_revisions(&self, infos: &mut [RevisionInfo]) -> Result<()> {
        for info in infos.iter_mut() {
            info.execute(self)?;
        }
        Ok(())
    }

    /// Apply a commit. Fails with `StoreError::Conflict` if any delta or
    /// detachment was made against a version which is no longer current,
    /// or `StoreError::Locked` if another owner holds a lock on an object.
    fn commit(&self, request: CommitRequest) -> Result<CommitResult, StoreError>;

    /// Take write locks. All or nothing.
    fn lock_objects(&self, owner: LockOwner, branch: BranchId, ids: &[ObjectId]) -> Result<(), StoreError>;

    /// Release write locks: the given ones, or all held by `owner`
    fn unlock_objects(&self, owner: LockOwner, branch: BranchId, ids: Option<&[ObjectId]>);

    /// Receive invalidations for commits made by other sessions
    fn subscribe(&self, session: SessionId) -> Subscription;

    /// Stop receiving invalidations and release the session's locks
    fn unsubscribe(&self, session: SessionId);
}
