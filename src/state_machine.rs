/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Object state transitions
//!
//! Each session owns one `StateMachine`; sessions in one process do not
//! share transition state.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::StateError;
use crate::object::{CdoObject, ObjectData, ObjectState};

/// Events driving object state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectEvent {
    /// Object attached to a transaction
    Attach,
    /// Object detached earlier in the same transaction attached again
    Reattach,
    /// Local modification
    Write,
    /// Revision loaded
    Load,
    /// Transaction committed
    Commit,
    /// Transaction (or object) rolled back
    Rollback,
    /// Remote modification reported
    Invalidate,
    /// Object detached (locally or remotely)
    Detach,
    /// Conflict resolved
    Resolve,
}

impl ObjectEvent {
    fn name(self) -> &'static str {
        match self {
            ObjectEvent::Attach => "attach",
            ObjectEvent::Reattach => "reattach",
            ObjectEvent::Write => "write",
            ObjectEvent::Load => "load",
            ObjectEvent::Commit => "commit",
            ObjectEvent::Rollback => "rollback",
            ObjectEvent::Invalidate => "invalidate",
            ObjectEvent::Detach => "detach",
            ObjectEvent::Resolve => "resolve",
        }
    }
}

/// The per-session transition service
#[derive(Debug, Default)]
pub struct StateMachine {
    transitions: AtomicUsize,
}

impl StateMachine {
    /// Create
    pub fn new() -> StateMachine {
        StateMachine { transitions: AtomicUsize::new(0) }
    }

    /// Compute the state following `state` on `event`. Events which do not
    /// affect a state leave it unchanged; events not allowed in a state are
    /// errors.
    pub fn next(&self, state: ObjectState, event: ObjectEvent) -> Result<ObjectState, StateError> {
        use crate::object::ObjectState::*;
        use self::ObjectEvent::*;
        let next = match (state, event) {
            (Transient, Attach) => New,
            (Transient, Reattach) => Dirty,
            (Transient, Load) | (Transient, Rollback) | (Transient, Invalidate) => Transient,

            (New, Write) | (New, Load) | (New, Invalidate) => New,
            (New, Commit) => Clean,
            (New, Rollback) | (New, Detach) => Transient,

            (Clean, Write) => Dirty,
            (Clean, Load) | (Clean, Commit) | (Clean, Rollback) => Clean,
            (Clean, Invalidate) => Proxy,
            (Clean, Detach) => Transient,

            (Dirty, Write) | (Dirty, Load) | (Dirty, Resolve) => Dirty,
            (Dirty, Commit) | (Dirty, Rollback) => Clean,
            (Dirty, Invalidate) => Conflict,
            (Dirty, Detach) => Transient,

            (Conflict, Write) | (Conflict, Load) | (Conflict, Invalidate) => Conflict,
            (Conflict, Rollback) => Clean,
            (Conflict, Resolve) => Dirty,
            (Conflict, Detach) => Transient,

            (Proxy, Load) => Clean,
            (Proxy, Rollback) | (Proxy, Invalidate) => Proxy,
            (Proxy, Detach) => Transient,

            (state, event) => return Err(StateError { state, event: event.name() }),
        };
        Ok(next)
    }

    // Apply a transition to already-locked object data.
    pub(crate) fn apply(&self, data: &mut ObjectData, event: ObjectEvent) -> Result<ObjectState, StateError> {
        let next = self.next(data.state, event)?;
        if next != data.state {
            trace!("Object {}: {:?} --{}--> {:?}", data.id, data.state, event.name(), next);
            self.transitions.fetch_add(1, Ordering::Relaxed);
            data.state = next;
        }
        Ok(next)
    }

    // Apply `Commit` after the repository accepted a commit: the object is
    // clean afterwards even if the transition is not allowed.
    pub(crate) fn commit(&self, data: &mut ObjectData) {
        if let Err(e) = self.apply(data, ObjectEvent::Commit) {
            error!("Object {}: {}; forcing clean state", data.id, e);
            self.transitions.fetch_add(1, Ordering::Relaxed);
            data.state = ObjectState::Clean;
        }
    }

    /// Apply a transition to an object
    pub fn process(&self, object: &CdoObject, event: ObjectEvent) -> Result<ObjectState, StateError> {
        self.apply(&mut object.lock(), event)
    }

    /// Number of state changes made by this machine
    pub fn transitions(&self) -> usize {
        self.transitions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectState::*;
    use crate::revision::ClassRef;

    #[test]
    fn lifecycle() {
        let sm = StateMachine::new();
        assert_eq!(sm.next(Transient, ObjectEvent::Attach), Ok(New));
        assert_eq!(sm.next(New, ObjectEvent::Commit), Ok(Clean));
        assert_eq!(sm.next(Clean, ObjectEvent::Write), Ok(Dirty));
        assert_eq!(sm.next(Dirty, ObjectEvent::Invalidate), Ok(Conflict));
        assert_eq!(sm.next(Conflict, ObjectEvent::Resolve), Ok(Dirty));
        assert_eq!(sm.next(Dirty, ObjectEvent::Commit), Ok(Clean));
        assert_eq!(sm.next(Clean, ObjectEvent::Detach), Ok(Transient));
    }

    #[test]
    fn illegal_transitions() {
        let sm = StateMachine::new();
        assert_eq!(sm.next(Conflict, ObjectEvent::Commit),
                Err(StateError { state: Conflict, event: "commit" }));
        assert!(sm.next(Proxy, ObjectEvent::Write).is_err());
        assert!(sm.next(Clean, ObjectEvent::Attach).is_err());
        assert!(sm.next(Transient, ObjectEvent::Detach).is_err());
    }

    #[test]
    fn commit_always_cleans() {
        let sm = StateMachine::new();
        let obj = CdoObject::new(ClassRef::new("p", "C"));
        {
            let mut data = obj.lock();
            data.state = Conflict;
            sm.commit(&mut data);
        }
        assert_eq!(obj.state(), Clean);
        assert_eq!(sm.transitions(), 1);
    }

    #[test]
    fn machines_are_independent() {
        let a = StateMachine::new();
        let b = StateMachine::new();
        let obj = CdoObject::new(ClassRef::new("p", "C"));
        a.process(&obj, ObjectEvent::Attach).unwrap();
        assert_eq!(obj.state(), New);
        assert_eq!(a.transitions(), 1);
        assert_eq!(b.transitions(), 0);
    }
}
