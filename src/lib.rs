/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! CDO core library
//!
//! Client-side transactions over a versioned object repository. Objects are
//! stored as immutable *revisions*, identified by object, branch and
//! version. Clients read revisions into *views*, modify them locally in
//! *transactions* and commit the changes optimistically: the repository
//! refuses changes made against a version which is no longer current.
//!
//! Remote commits reach open views as *invalidations*. Locally modified
//! objects which were changed remotely enter conflict; conflicts must be
//! resolved (see `conflict`) before the transaction can commit.
//!
//! Terminology:
//!
//! *   **revision** — the state of one object at one version on one branch
//! *   **delta** — a list of feature changes relative to a base revision
//! *   **savepoint** — a position in a transaction's change log which can be
//!     rolled back to
//! *   **branch point** — a branch and a time; the head of a branch if the
//!     time is unspecified
//!
//! ### Relationship between structs and traits
//!
//! Traits for the user to implement (useful implementations are provided):
//!
//! *   RevisionStore (the repository; `MemoryStore` is provided)
//! *   ConflictResolver and ThreeWayMerge
//! *   TransactionHandler, CommitStrategy and ViewListener (hooks)
//!
//! Library structures:
//!
//! *   Session (uses a RevisionStore, owns the revision cache)
//! *   View and Transaction (yielded by a Session, hold CdoObject handles)

#[macro_use]
extern crate log;

pub use crate::branch::{Branch, BranchId, BranchManager, BranchPoint, BranchVersion, UNSPECIFIED_DATE};
pub use crate::conflict::{ConflictResolver, DiscardLocalChanges, MergeLocalChangesPerFeature,
        ResolveContext, TakeRemoteChangesThenApplyLocalChanges, ThreeWayMerge};
pub use crate::delta::{FeatureDelta, RevisionDelta};
pub use crate::error::{Error, Result};
pub use crate::id::{IdMapper, ObjectId};
pub use crate::object::{CdoObject, ObjectState};
pub use crate::package::{PackageState, PackageUnit};
pub use crate::revision::{ClassRef, Feature, Revision, RevisionKind, Value};
pub use crate::revision_info::{RevisionInfo, RevisionInfoType};
pub use crate::revision_manager::RevisionManager;
pub use crate::savepoint::SavepointHandle;
pub use crate::session::{Session, SessionConfig};
pub use crate::state_machine::{ObjectEvent, StateMachine};
pub use crate::store::{MemoryStore, RevisionStore};
pub use crate::transaction::{CommitContext, CommitInfo, CommitStrategy, DefaultCommitStrategy,
        Transaction, TransactionHandler, TransactionOptions};
pub use crate::view::{FinishedKind, View, ViewEvent, ViewId, ViewListener};

pub mod branch;
pub mod conflict;
pub mod delta;
pub mod error;
pub mod id;
pub mod object;
pub mod package;
pub mod readwrite;
pub mod revision;
pub mod revision_info;
pub mod revision_manager;
mod savepoint;
pub mod session;
pub mod state_machine;
pub mod store;
pub mod transaction;
pub mod view;

/// Version. The low 16 bits are patch number, next 16 are the minor version
/// number, the next are the major version number. The top 16 are zero.
pub const LIB_VERSION: u64 = 0x0000_0001_0000;
