/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Branches, branch points and branch versions
//!
//! Every branch except the main branch has a *base*: the branch point on its
//! parent branch from which it was forked. Objects untouched on a branch
//! since it was forked resolve to the revision visible at the base.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result, StoreError};

/// Timestamp meaning "the latest state of the branch"
pub const UNSPECIFIED_DATE: i64 = 0;

/// Identifies a branch
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct BranchId(pub i32);

impl BranchId {
    /// The main branch
    pub const MAIN: BranchId = BranchId(0);

    /// True if this is the main branch
    pub fn is_main(self) -> bool { self == BranchId::MAIN }

    /// Shortcut: a branch point on this branch
    pub fn point(self, time: i64) -> BranchPoint {
        BranchPoint { branch: self, time }
    }
    /// Shortcut: the head of this branch
    pub fn head(self) -> BranchPoint {
        BranchPoint { branch: self, time: UNSPECIFIED_DATE }
    }
    /// Shortcut: a version on this branch
    pub fn version(self, version: u32) -> BranchVersion {
        BranchVersion { branch: self, version }
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A (branch, time) coordinate: "as of when, on which branch".
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct BranchPoint {
    /// The branch
    pub branch: BranchId,
    /// Time in milliseconds since the UNIX epoch, or `UNSPECIFIED_DATE`
    pub time: i64,
}

impl BranchPoint {
    /// True if this refers to the latest state of the branch
    pub fn is_head(&self) -> bool { self.time == UNSPECIFIED_DATE }
}

impl fmt::Display for BranchPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_head() {
            write!(f, "{}@head", self.branch)
        } else {
            write!(f, "{}@{}", self.branch, self.time)
        }
    }
}

/// A (branch, version) pair addressing one revision of an object.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct BranchVersion {
    /// The branch
    pub branch: BranchId,
    /// Version number within the branch; the first version is 1
    pub version: u32,
}

impl fmt::Display for BranchVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}v{}", self.branch, self.version)
    }
}

/// A named line of revision history
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Branch {
    id: BranchId,
    name: String,
    base: Option<BranchPoint>,
}

impl Branch {
    /// The branch identifier
    pub fn id(&self) -> BranchId { self.id }
    /// The branch name
    pub fn name(&self) -> &str { &self.name }
    /// The point this branch was forked from (`None` for the main branch)
    pub fn base(&self) -> Option<BranchPoint> { self.base }
}

/// Knows the branch topology of one repository. Shared by the repository
/// and all sessions connected to it.
#[derive(Debug)]
pub struct BranchManager {
    branches: Mutex<HashMap<BranchId, Branch>>,
}

impl BranchManager {
    /// Create, containing only the main branch
    pub fn new() -> BranchManager {
        let mut branches = HashMap::new();
        branches.insert(BranchId::MAIN, Branch {
            id: BranchId::MAIN,
            name: "MAIN".to_string(),
            base: None,
        });
        BranchManager { branches: Mutex::new(branches) }
    }

    fn lock(&self) -> MutexGuard<HashMap<BranchId, Branch>> {
        self.branches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a sub-branch of `base.branch`, forked at `base.time`.
    ///
    /// The base time must be specified: a branch cannot be forked from a
    /// moving head.
    pub fn create_branch(&self, name: &str, base: BranchPoint) -> Result<Branch> {
        if base.is_head() {
            return Err(Error::arg("branch base time must be specified"));
        }
        let mut branches = self.lock();
        if !branches.contains_key(&base.branch) {
            return Err(StoreError::UnknownBranch(base.branch.0).into());
        }
        let id = BranchId(branches.keys().map(|b| b.0).max().unwrap_or(0) + 1);
        let branch = Branch { id, name: name.to_string(), base: Some(base) };
        info!("Creating branch {} ({}) with base {}", id, name, base);
        branches.insert(id, branch.clone());
        Ok(branch)
    }

    /// Get a branch
    pub fn branch(&self, id: BranchId) -> Result<Branch> {
        self.lock().get(&id).cloned()
            .ok_or_else(|| StoreError::UnknownBranch(id.0).into())
    }

    /// True if the branch exists
    pub fn contains(&self, id: BranchId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Get the base point of a branch, `None` for main (or unknown) branches
    pub fn base(&self, id: BranchId) -> Option<BranchPoint> {
        self.lock().get(&id).and_then(|b| b.base)
    }

    /// List the branch points to try, in order, when resolving an object at
    /// `point`: first `point` itself, then the base of its branch, then the
    /// base of that branch, and so on up to the main branch.
    pub fn path_to_main(&self, point: BranchPoint) -> Vec<BranchPoint> {
        let branches = self.lock();
        let mut path = vec![point];
        let mut current = point.branch;
        while let Some(base) = branches.get(&current).and_then(|b| b.base) {
            path.push(base);
            current = base.branch;
        }
        path
    }
}

impl Default for BranchManager {
    fn default() -> Self { BranchManager::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_branch_path() {
        let mgr = BranchManager::new();
        let b1 = mgr.create_branch("b1", BranchId::MAIN.point(100)).expect("create b1");
        let b2 = mgr.create_branch("b2", b1.id().point(200)).expect("create b2");
        assert!(b1.id() != b2.id());

        let path = mgr.path_to_main(b2.id().head());
        assert_eq!(path, vec![b2.id().head(), b1.id().point(200), BranchId::MAIN.point(100)]);
        assert_eq!(mgr.base(BranchId::MAIN), None);
    }

    #[test]
    fn head_base_is_rejected() {
        let mgr = BranchManager::new();
        assert!(mgr.create_branch("b", BranchId::MAIN.head()).is_err());
        assert!(mgr.create_branch("b", BranchId(7).point(5)).is_err());
    }
}
