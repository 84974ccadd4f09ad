/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Revision lookup requests
//!
//! A `RevisionInfo` describes one object to be resolved at a requested branch
//! point, together with whatever the requester already has cached for it.
//! The requester sends it to the repository only if `is_load_needed()`; the
//! repository `execute`s it and writes the result back, referring to the
//! requester's cached revision instead of resending it where possible.

use crate::branch::{BranchPoint, BranchVersion, UNSPECIFIED_DATE};
use crate::error::{ReadError, Result};
use crate::id::ObjectId;
use crate::readwrite::{DataInput, DataOutput};
use crate::revision::Revision;
use crate::revision_manager::RevisionManager;
use crate::store::RevisionStore;

const NO_RESULT: u8 = 0;
const POINTER_RESULT: u8 = 1;
const DETACHED_RESULT: u8 = 2;
const NORMAL_RESULT: u8 = 3;

/// Kinds of lookup request; the discriminants are the wire tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionInfoType {
    /// A normal revision is cached
    AvailableNormal = 0,
    /// A pointer revision is cached
    AvailablePointer = 1,
    /// A detached revision is cached
    AvailableDetached = 2,
    /// Nothing is cached
    Missing = 3,
}

#[derive(Debug, Clone, PartialEq)]
enum Availability {
    Normal,
    Pointer { target: Option<BranchVersion>, has_target: bool },
    Detached,
}

/// A per-object lookup request and, once executed, its response
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionInfo {
    id: ObjectId,
    requested: BranchPoint,
    available: Option<(BranchVersion, Availability)>,
    // Requester side only: the cached revisions behind `available`
    available_revision: Option<Revision>,
    target_revision: Option<Revision>,
    result: Option<Revision>,
    synthetic: Option<Revision>,
    synthetic_target: Option<Revision>,
}

impl RevisionInfo {
    /// Nothing known about `id`
    pub fn missing(id: ObjectId, requested: BranchPoint) -> RevisionInfo {
        RevisionInfo {
            id,
            requested,
            available: None,
            available_revision: None,
            target_revision: None,
            result: None,
            synthetic: None,
            synthetic_target: None,
        }
    }

    /// A cached revision is available. For a pointer, `target` is the cached
    /// target revision, if the pointer has a target and it is cached.
    pub fn available(requested: BranchPoint, revision: Revision, target: Option<Revision>) -> RevisionInfo {
        let availability = if revision.is_pointer() {
            Availability::Pointer { target: revision.target(), has_target: target.is_some() }
        } else if revision.is_detached() {
            Availability::Detached
        } else {
            Availability::Normal
        };
        let mut info = RevisionInfo::missing(revision.id(), requested);
        info.available = Some((revision.branch_version(), availability));
        info.available_revision = Some(revision);
        info.target_revision = target;
        info
    }

    pub fn id(&self) -> ObjectId { self.id }
    pub fn requested(&self) -> BranchPoint { self.requested }

    pub fn info_type(&self) -> RevisionInfoType {
        match self.available {
            None => RevisionInfoType::Missing,
            Some((_, Availability::Normal)) => RevisionInfoType::AvailableNormal,
            Some((_, Availability::Pointer { .. })) => RevisionInfoType::AvailablePointer,
            Some((_, Availability::Detached)) => RevisionInfoType::AvailableDetached,
        }
    }

    /// Branch version of the cached revision
    pub fn available_branch_version(&self) -> Option<BranchVersion> {
        self.available.as_ref().map(|a| a.0)
    }

    /// True if the cached revision is on the requested branch
    pub fn is_direct(&self) -> bool {
        match self.available {
            Some((bv, _)) => bv.branch == self.requested.branch,
            None => false,
        }
    }

    /// For pointers: the target branch version
    pub fn target_branch_version(&self) -> Option<BranchVersion> {
        match self.available {
            Some((_, Availability::Pointer { target, .. })) => target,
            _ => None,
        }
    }

    /// For pointers: true if the target revision is cached
    pub fn has_target(&self) -> bool {
        match self.available {
            Some((_, Availability::Pointer { has_target, .. })) => has_target,
            _ => false,
        }
    }

    /// True unless the cached data is provably what a fresh lookup would
    /// return.
    pub fn is_load_needed(&self) -> bool {
        match self.available {
            None => true,
            Some((_, Availability::Pointer { has_target, .. })) => {
                if self.requested.branch.is_main() {
                    return false;
                }
                !self.is_direct() || !has_target
            }
            Some(_) => !self.is_direct(),
        }
    }

    /// The resolved revision. A direct normal request resolves to the cached
    /// revision without a lookup.
    pub fn result(&self) -> Option<&Revision> {
        if let Some((_, Availability::Normal)) = self.available {
            if self.is_direct() {
                return self.available_revision.as_ref().or(self.result.as_ref());
            }
        }
        self.result.as_ref()
    }

    /// Pointer or detached marker produced by the lookup
    pub fn synthetic(&self) -> Option<&Revision> { self.synthetic.as_ref() }

    /// Perform the lookup against a repository
    pub fn execute<S: RevisionStore + ?Sized>(&mut self, store: &S) -> Result<()> {
        let (result, synthetic) = store.revision(self.id, self.requested, true)?;
        trace!("Executed lookup of {} at {}: {:?} / {:?}", self.id, self.requested,
                result.as_ref().map(|r| r.branch_version()),
                synthetic.as_ref().map(|r| r.branch_version()));
        self.result = result;
        self.synthetic = synthetic;
        Ok(())
    }

    /// Add results to the cache and return the resolved revision (`None` if
    /// missing or detached).
    pub fn process_result(&mut self, manager: &RevisionManager) -> Option<Revision> {
        if !self.is_load_needed() {
            match self.available {
                Some((_, Availability::Normal)) => {
                    self.result = self.available_revision.clone();
                }
                Some((_, Availability::Pointer { .. })) => {
                    if let Some(ref target) = self.target_revision {
                        self.result = Some(target.clone());
                    }
                    self.synthetic = self.available_revision.clone();
                }
                Some((_, Availability::Detached)) => {
                    self.synthetic = self.available_revision.clone();
                }
                None => {}
            }
        }

        if let Some(ref result) = self.result {
            manager.add_revision(result.clone());
        }
        if let Some(ref synthetic) = self.synthetic {
            manager.add_revision(synthetic.clone());
        }
        if let Some(ref target) = self.synthetic_target {
            if self.result.as_ref() != Some(target) {
                manager.add_revision(target.clone());
            }
        }

        match self.result {
            Some(ref rev) if !rev.is_detached() => Some(rev.clone()),
            _ => None,
        }
    }

    /// Write the request
    pub fn write(&self, out: &mut DataOutput) -> Result<()> {
        out.write_u8(self.info_type() as u8)?;
        out.write_id(self.id)?;
        if let Some((bv, ref availability)) = self.available {
            out.write_branch_version(bv)?;
            if let Availability::Pointer { target, has_target } = *availability {
                out.write_bool(target.is_some())?;
                if let Some(target) = target {
                    out.write_branch_version(target)?;
                    out.write_bool(has_target)?;
                }
            }
        }
        Ok(())
    }

    /// Read a request. The requested branch point is known from context.
    pub fn read(input: &mut DataInput, requested: BranchPoint) -> Result<RevisionInfo> {
        let tag = input.read_u8()?;
        let id = input.read_id()?;
        let mut info = RevisionInfo::missing(id, requested);
        let availability = match tag {
            0 => Availability::Normal,
            1 => Availability::Pointer { target: None, has_target: false },
            2 => Availability::Detached,
            3 => return Ok(info),
            _ => return ReadError::err("invalid revision info type", input.pos(), (0, 1)),
        };
        let bv = input.read_branch_version()?;
        let availability = match availability {
            Availability::Pointer { .. } => {
                if input.read_bool()? {
                    let target = input.read_branch_version()?;
                    let has_target = input.read_bool()?;
                    Availability::Pointer { target: Some(target), has_target }
                } else {
                    Availability::Pointer { target: None, has_target: false }
                }
            }
            a => a,
        };
        info.available = Some((bv, availability));
        Ok(info)
    }

    /// Write the lookup result. Where the result is the requester's cached
    /// revision, a flag is sent instead.
    pub fn write_result(&self, out: &mut DataOutput) -> Result<()> {
        match self.available {
            Some((bv, _)) => {
                let use_available = match self.result {
                    Some(ref r) => r.branch_version() == bv,
                    None => false,
                };
                out.write_bool(use_available)?;
                if !use_available {
                    out.write_revision(self.result.as_ref())?;
                }
            }
            None => out.write_revision(self.result.as_ref())?,
        }
        self.write_synthetic(out, self.synthetic.as_ref())
    }

    fn write_synthetic(&self, out: &mut DataOutput, revision: Option<&Revision>) -> Result<()> {
        let revision = match revision {
            None => return out.write_u8(NO_RESULT),
            Some(rev) => rev,
        };
        if revision.is_pointer() {
            out.write_u8(POINTER_RESULT)?;
            out.write_i64(revision.revised())?;
            let target = revision.target().and_then(|bv| {
                self.result.iter().chain(self.synthetic_target.iter())
                    .find(|r| r.branch_version() == bv)
            });
            match target {
                Some(target) => self.write_synthetic(out, Some(target)),
                None => out.write_u8(NO_RESULT),
            }
        } else if revision.is_detached() {
            out.write_u8(DETACHED_RESULT)?;
            out.write_i64(revision.created())?;
            out.write_i32(revision.version() as i32)
        } else {
            out.write_u8(NORMAL_RESULT)?;
            out.write_revision(Some(revision))
        }
    }

    /// Read the lookup result written by `write_result`
    pub fn read_result(&mut self, input: &mut DataInput) -> Result<()> {
        if self.available.is_some() {
            if input.read_bool()? {
                match self.available_revision {
                    Some(ref rev) => self.result = Some(rev.clone()),
                    None => return input.err("available revision is not known here", 1),
                }
            } else {
                self.result = input.read_revision()?;
            }
        } else {
            self.result = input.read_revision()?;
        }
        let (synthetic, target) = self.read_synthetic(input)?;
        self.synthetic = synthetic;
        self.synthetic_target = target;
        Ok(())
    }

    // Returns the synthetic revision and, for pointers, the target revision.
    fn read_synthetic(&self, input: &mut DataInput) -> Result<(Option<Revision>, Option<Revision>)> {
        match input.read_u8()? {
            NO_RESULT => Ok((None, None)),
            POINTER_RESULT => {
                let revised = input.read_i64()?;
                let (target, _) = self.read_synthetic(input)?;
                let pointer = Revision::pointer(self.id, self.requested.branch, UNSPECIFIED_DATE,
                        revised, target.as_ref().map(|t| t.branch_version()));
                Ok((Some(pointer), target))
            }
            DETACHED_RESULT => {
                let time = input.read_i64()?;
                let version = input.read_i32()?;
                if version < 0 {
                    return input.err("negative version", 4);
                }
                let bv = self.requested.branch.version(version as u32);
                Ok((Some(Revision::detached(self.id, bv, time, UNSPECIFIED_DATE)), None))
            }
            NORMAL_RESULT => Ok((input.read_revision()?, None)),
            _ => input.err("invalid synthetic type", 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchId;
    use crate::revision::ClassRef;

    fn normal(branch: BranchId, version: u32) -> Revision {
        Revision::new(ObjectId::Persistent(42), branch.version(version), 100, ClassRef::new("p", "C"))
    }

    fn reread(info: &RevisionInfo) -> RevisionInfo {
        let mut buf = Vec::new();
        info.write(&mut DataOutput::new(&mut buf)).unwrap();
        let mut r = &buf[..];
        RevisionInfo::read(&mut DataInput::new(&mut r), info.requested()).unwrap()
    }

    #[test]
    fn load_needed_by_variant() {
        let sub = BranchId(1);
        let direct = RevisionInfo::available(sub.head(), normal(sub, 1), None);
        assert!(!direct.is_load_needed());
        assert_eq!(direct.result().map(|r| r.branch_version()), Some(sub.version(1)));
        let foreign = RevisionInfo::available(sub.head(), normal(BranchId::MAIN, 3), None);
        assert!(foreign.is_load_needed());

        let ptr = Revision::pointer(ObjectId::Persistent(42), sub, 0, 0, Some(BranchId::MAIN.version(3)));
        let with_target = RevisionInfo::available(sub.head(), ptr.clone(), Some(normal(BranchId::MAIN, 3)));
        assert!(!with_target.is_load_needed());
        let no_target = RevisionInfo::available(sub.head(), ptr.clone(), None);
        assert!(no_target.is_load_needed());
        let other_branch = RevisionInfo::available(BranchId(2).head(), ptr, None);
        assert!(other_branch.is_load_needed());

        let main_ptr = Revision::pointer(ObjectId::Persistent(42), BranchId::MAIN, 0, 0, None);
        assert!(!RevisionInfo::available(BranchId::MAIN.head(), main_ptr, None).is_load_needed());

        assert!(RevisionInfo::missing(ObjectId::Persistent(42), sub.head()).is_load_needed());
    }

    #[test]
    fn request_survives_the_wire() {
        let sub = BranchId(1);
        let ptr = Revision::pointer(ObjectId::Persistent(42), sub, 0, 0, Some(BranchId::MAIN.version(3)));
        let infos = vec![
            RevisionInfo::available(sub.head(), normal(sub, 2), None),
            RevisionInfo::available(sub.head(), normal(BranchId::MAIN, 2), None),
            RevisionInfo::available(sub.head(), ptr.clone(), Some(normal(BranchId::MAIN, 3))),
            RevisionInfo::available(sub.head(), ptr, None),
            RevisionInfo::available(sub.point(500),
                    Revision::detached(ObjectId::Persistent(42), sub.version(3), 400, 0), None),
            RevisionInfo::missing(ObjectId::Persistent(42), sub.head()),
        ];
        for info in &infos {
            let read = reread(info);
            assert_eq!(read.info_type(), info.info_type());
            assert_eq!(read.is_load_needed(), info.is_load_needed());
            assert_eq!(read.available_branch_version(), info.available_branch_version());
            assert_eq!(read.target_branch_version(), info.target_branch_version());
        }
    }

    #[test]
    fn result_refers_to_available() {
        let main = BranchId::MAIN;
        let cached = normal(main, 2);
        let mut client = RevisionInfo::available(main.point(150), cached.clone(), None);

        // server side: knows only the branch version, finds the same branch
        let mut server = reread(&client);
        server.result = Some(cached.clone());
        let mut buf = Vec::new();
        server.write_result(&mut DataOutput::new(&mut buf)).unwrap();
        // flag plus "no synthetic"
        assert_eq!(buf, vec![1u8, NO_RESULT]);

        let mut r = &buf[..];
        client.read_result(&mut DataInput::new(&mut r)).unwrap();
        assert_eq!(client.result(), Some(&cached));
    }

    #[test]
    fn pointer_and_detached_results() {
        let sub = BranchId(1);
        let target = normal(BranchId::MAIN, 3);
        let mut server = RevisionInfo::missing(ObjectId::Persistent(42), sub.head());
        server.result = Some(target.clone());
        server.synthetic = Some(Revision::pointer(ObjectId::Persistent(42), sub, 0, 0,
                Some(target.branch_version())));
        let mut buf = Vec::new();
        server.write_result(&mut DataOutput::new(&mut buf)).unwrap();

        let mut client = RevisionInfo::missing(ObjectId::Persistent(42), sub.head());
        let mut r = &buf[..];
        client.read_result(&mut DataInput::new(&mut r)).unwrap();
        assert_eq!(client.result(), Some(&target));
        let pointer = client.synthetic().expect("pointer");
        assert!(pointer.is_pointer());
        assert_eq!(pointer.target(), Some(target.branch_version()));

        let mut server = RevisionInfo::missing(ObjectId::Persistent(42), sub.head());
        server.synthetic = Some(Revision::detached(ObjectId::Persistent(42), sub.version(4), 900, 0));
        let mut buf = Vec::new();
        server.write_result(&mut DataOutput::new(&mut buf)).unwrap();
        let mut client = RevisionInfo::missing(ObjectId::Persistent(42), sub.head());
        let mut r = &buf[..];
        client.read_result(&mut DataInput::new(&mut r)).unwrap();
        assert!(client.result().is_none());
        let detached = client.synthetic().expect("detached");
        assert!(detached.is_detached());
        assert_eq!(detached.branch_version(), sub.version(4));
        assert_eq!(detached.created(), 900);
    }
}
