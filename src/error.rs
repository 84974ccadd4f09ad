/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Error structs used by the transaction core

use std::{io, error, fmt, result};

use crate::id::ObjectId;
use crate::object::ObjectState;

/// Our custom result type
pub type Result<T, E = Error> = result::Result<T, E>;

/// Our custom compound error type
pub enum Error {
    /// Reading a stream failed
    Read(ReadError),
    /// Invalid argument supplied
    Arg(ArgError),
    /// Programmer error: operation not allowed in the current state. The
    /// transaction is left unchanged.
    IllegalState(String),
    /// Invalid object state transition
    State(StateError),
    /// Applying a feature delta failed
    Delta(DeltaOp),
    /// Commit refused or failed
    Transaction(TransactionError),
    /// A conflict resolver failed; touched objects have been restored
    Resolver(String),
    /// Repository access failed outside of a commit
    Store(StoreError),
    /// A listener or handler reported failure
    Listener(String),
    Io(io::Error),
}

/// For read errors; adds a read position
#[derive(PartialEq, Debug)]
pub struct ReadError {
    msg: &'static str,
    pos: usize,
    off_start: usize,
    off_end: usize,
}

impl ReadError {
    /// Create a `ReadError`
    pub fn new(msg: &'static str, pos: usize, offset: (usize, usize)) -> ReadError {
        ReadError { msg, pos, off_start: offset.0, off_end: offset.1 }
    }
    /// Create wrapped in an `Error::Read`, wrapped in `Err`
    pub fn err<T>(msg: &'static str, pos: usize, offset: (usize, usize)) -> Result<T> {
        Err(Error::Read(ReadError::new(msg, pos, offset)))
    }
    /// The message
    pub fn msg(&self) -> &'static str { self.msg }
    /// Position of the record in which the error was found
    pub fn pos(&self) -> usize { self.pos }
}

/// Any error where an invalid argument was supplied
#[derive(PartialEq, Debug)]
pub struct ArgError {
    msg: &'static str
}

/// Errors applying a feature delta to a revision
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum DeltaOp {
    /// Revision carries no feature data (pointer or detached)
    NoData,
    /// A list operation was applied to a feature which is not a list
    NotList,
    /// A list index was out of range
    IndexOutOfBounds,
    /// Merging deltas with a different object or base version
    Mismatch,
}

/// Invalid object state transition
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct StateError {
    /// State before the attempted transition
    pub state: ObjectState,
    /// Name of the event
    pub event: &'static str,
}

/// Errors reported by the repository
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum StoreError {
    /// Optimistic version check failed for these objects
    Conflict(Vec<ObjectId>),
    /// Objects are write-locked by another session
    Locked(Vec<ObjectId>),
    /// Object or branch is unknown to the repository
    NotFound(ObjectId),
    /// The branch is not known
    UnknownBranch(i32),
    /// Connection or other transport failure
    Transport(String),
}

/// Reasons a commit is refused or failed
#[derive(PartialEq, Debug)]
pub enum TransactionError {
    /// The transaction has unresolved conflicts
    Conflict,
    /// The repository rejected the commit or could not be reached; the
    /// transaction is still dirty
    Commit(StoreError),
    /// The pre-commit hook of a handler vetoed the commit
    Vetoed(String),
}

impl Error {
    /// Create an "invalid argument" error
    pub fn arg(msg: &'static str) -> Error {
        Error::Arg(ArgError { msg })
    }
    /// Create an "illegal state" error
    pub fn illegal<T: Into<String>>(msg: T) -> Error {
        Error::IllegalState(msg.into())
    }
    /// True if this is a "pending conflict" commit refusal
    pub fn is_conflict(&self) -> bool {
        match *self {
            Error::Transaction(TransactionError::Conflict) => true,
            Error::Transaction(TransactionError::Commit(StoreError::Conflict(_))) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DeltaOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match *self {
            DeltaOp::NoData => "revision has no feature data",
            DeltaOp::NotList => "feature is not a list",
            DeltaOp::IndexOutOfBounds => "list index out of bounds",
            DeltaOp::Mismatch => "deltas target different objects or base versions",
        };
        f.write_str(msg)
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "event {} not allowed in state {:?}", self.event, self.state)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            StoreError::Conflict(ref ids) => write!(f, "attempt to modify historical revisions of {} objects", ids.len()),
            StoreError::Locked(ref ids) => write!(f, "{} objects are locked by another session", ids.len()),
            StoreError::NotFound(id) => write!(f, "object not found: {}", id),
            StoreError::UnknownBranch(b) => write!(f, "unknown branch: {}", b),
            StoreError::Transport(ref msg) => write!(f, "transport failure: {}", msg),
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TransactionError::Conflict => f.write_str("this transaction has conflicts"),
            TransactionError::Commit(ref e) => write!(f, "commit failed: {}", e),
            TransactionError::Vetoed(ref msg) => write!(f, "commit vetoed: {}", msg),
        }
    }
}

// Important impls for compound type
impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Io(ref e) => Some(e),
            _ => None,
        }
    }
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Read(ref e) => write!(f, "Position {}, offset ({}, {}): {}", e.pos, e.off_start, e.off_end, e.msg),
            Error::Arg(ref e) => write!(f, "Invalid argument: {}", e.msg),
            Error::IllegalState(ref msg) => write!(f, "Illegal state: {}", msg),
            Error::State(ref e) => e.fmt(f),
            Error::Delta(ref e) => write!(f, "Failed to apply delta: {}", e),
            Error::Transaction(ref e) => e.fmt(f),
            Error::Resolver(ref msg) => write!(f, "Conflict resolution failed: {}", msg),
            Error::Store(ref e) => e.fmt(f),
            Error::Listener(ref msg) => write!(f, "Listener failed: {}", msg),
            Error::Io(ref e) => e.fmt(f),
        }
    }
}
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Transaction(ref e) => write!(f, "Transaction({:?})", e),
            Error::Store(ref e) => write!(f, "Store({:?})", e),
            _ => fmt::Display::fmt(self, f),
        }
    }
}

// From impls
impl From<ReadError> for Error {
    fn from(e: ReadError) -> Error { Error::Read(e) }
}
impl From<ArgError> for Error {
    fn from(e: ArgError) -> Error { Error::Arg(e) }
}
impl From<StateError> for Error {
    fn from(e: StateError) -> Error { Error::State(e) }
}
impl From<DeltaOp> for Error {
    fn from(e: DeltaOp) -> Error { Error::Delta(e) }
}
impl From<StoreError> for Error {
    fn from(e: StoreError) -> Error { Error::Store(e) }
}
impl From<TransactionError> for Error {
    fn from(e: TransactionError) -> Error { Error::Transaction(e) }
}
impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Read(ReadError::new("unexpected end of stream", 0, (0, 0)))
        } else {
            Error::Io(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_error_display() {
        let e = StateError { state: ObjectState::Clean, event: "commit" };
        assert_eq!(e.to_string(), "event commit not allowed in state Clean");
        assert_eq!(Error::from(e).to_string(), "event commit not allowed in state Clean");
    }
}
