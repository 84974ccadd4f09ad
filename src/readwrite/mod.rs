/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Binary encoding of identifiers, revisions, deltas and change streams.
//!
//! All numbers are big-endian. Readers track their byte position so that
//! errors report where in the stream a problem was found.

mod revision;
mod changes;

pub use self::changes::{ChangeBlock, read_change_blocks, write_change_blocks};

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::branch::{BranchId, BranchPoint, BranchVersion};
use crate::error::{Error, ReadError, Result};
use crate::id::ObjectId;

// Guard against allocating absurd amounts of memory on corrupt input.
const MAX_LEN: u32 = 1 << 24;

const ID_NULL: u8 = 0;
const ID_PERSISTENT: u8 = 1;
const ID_TEMP: u8 = 2;

/// Reads primitive values from a stream, counting bytes read
pub struct DataInput<'a> {
    r: &'a mut dyn Read,
    pos: usize,
}

impl<'a> DataInput<'a> {
    /// Wrap a reader
    pub fn new(r: &'a mut dyn Read) -> DataInput<'a> {
        DataInput { r, pos: 0 }
    }

    /// Number of bytes read so far
    pub fn pos(&self) -> usize { self.pos }

    /// Create an error at the current position, covering the last `len`
    /// bytes read
    pub fn err<T>(&self, msg: &'static str, len: usize) -> Result<T> {
        ReadError::err(msg, self.pos - len, (0, len))
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let v = self.r.read_u8()?;
        self.pos += 1;
        Ok(v)
    }
    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => self.err("invalid boolean", 1),
        }
    }
    pub fn read_i32(&mut self) -> Result<i32> {
        let v = self.r.read_i32::<BigEndian>()?;
        self.pos += 4;
        Ok(v)
    }
    pub fn read_u32(&mut self) -> Result<u32> {
        let v = self.r.read_u32::<BigEndian>()?;
        self.pos += 4;
        Ok(v)
    }
    pub fn read_i64(&mut self) -> Result<i64> {
        let v = self.r.read_i64::<BigEndian>()?;
        self.pos += 8;
        Ok(v)
    }
    pub fn read_u64(&mut self) -> Result<u64> {
        let v = self.r.read_u64::<BigEndian>()?;
        self.pos += 8;
        Ok(v)
    }

    /// Read a length or count, checked against a sanity limit
    pub fn read_len(&mut self) -> Result<usize> {
        let n = self.read_u32()?;
        if n > MAX_LEN {
            return self.err("length too large", 4);
        }
        Ok(n as usize)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_len()?;
        let mut buf = vec![0; len];
        self.r.read_exact(&mut buf)?;
        self.pos += len;
        match String::from_utf8(buf) {
            Ok(s) => Ok(s),
            Err(_) => self.err("content not valid UTF-8", len),
        }
    }

    pub fn read_id(&mut self) -> Result<ObjectId> {
        match self.read_u8()? {
            ID_NULL => Ok(ObjectId::Null),
            ID_PERSISTENT => Ok(ObjectId::Persistent(self.read_u64()?)),
            ID_TEMP => Ok(ObjectId::Temp(self.read_u32()?)),
            _ => self.err("unexpected contents (expected id tag)", 1),
        }
    }

    pub fn read_branch_version(&mut self) -> Result<BranchVersion> {
        let branch = BranchId(self.read_i32()?);
        let version = self.read_u32()?;
        Ok(BranchVersion { branch, version })
    }

    pub fn read_branch_point(&mut self) -> Result<BranchPoint> {
        let branch = BranchId(self.read_i32()?);
        let time = self.read_i64()?;
        Ok(BranchPoint { branch, time })
    }
}

/// Writes primitive values to a stream
pub struct DataOutput<'a> {
    w: &'a mut dyn Write,
}

impl<'a> DataOutput<'a> {
    /// Wrap a writer
    pub fn new(w: &'a mut dyn Write) -> DataOutput<'a> {
        DataOutput { w }
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        Ok(self.w.write_u8(v)?)
    }
    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(if v { 1 } else { 0 })
    }
    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        Ok(self.w.write_i32::<BigEndian>(v)?)
    }
    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        Ok(self.w.write_u32::<BigEndian>(v)?)
    }
    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        Ok(self.w.write_i64::<BigEndian>(v)?)
    }
    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        Ok(self.w.write_u64::<BigEndian>(v)?)
    }

    /// Write a length or count
    pub fn write_len(&mut self, n: usize) -> Result<()> {
        if n > MAX_LEN as usize {
            return Err(Error::arg("length exceeds the encodable maximum"));
        }
        self.write_u32(n as u32)
    }

    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_len(s.len())?;
        Ok(self.w.write_all(s.as_bytes())?)
    }

    pub fn write_id(&mut self, id: ObjectId) -> Result<()> {
        match id {
            ObjectId::Null => self.write_u8(ID_NULL),
            ObjectId::Persistent(n) => {
                self.write_u8(ID_PERSISTENT)?;
                self.write_u64(n)
            }
            ObjectId::Temp(n) => {
                self.write_u8(ID_TEMP)?;
                self.write_u32(n)
            }
        }
    }

    pub fn write_branch_version(&mut self, bv: BranchVersion) -> Result<()> {
        self.write_i32(bv.branch.0)?;
        self.write_u32(bv.version)
    }

    pub fn write_branch_point(&mut self, bp: BranchPoint) -> Result<()> {
        self.write_i32(bp.branch.0)?;
        self.write_i64(bp.time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives() {
        let mut buf = Vec::new();
        {
            let mut out = DataOutput::new(&mut buf);
            out.write_bool(true).unwrap();
            out.write_id(ObjectId::Temp(9)).unwrap();
            out.write_id(ObjectId::Persistent(1 << 40)).unwrap();
            out.write_string("héllo").unwrap();
            out.write_branch_version(BranchId(3).version(7)).unwrap();
        }
        let mut r = &buf[..];
        let mut input = DataInput::new(&mut r);
        assert_eq!(input.read_bool().unwrap(), true);
        assert_eq!(input.read_id().unwrap(), ObjectId::Temp(9));
        assert_eq!(input.read_id().unwrap(), ObjectId::Persistent(1 << 40));
        assert_eq!(input.read_string().unwrap(), "héllo");
        assert_eq!(input.read_branch_version().unwrap(), BranchId(3).version(7));
        assert_eq!(input.pos(), buf.len());
    }

    #[test]
    fn oversized_string_is_refused() {
        let long = "x".repeat(MAX_LEN as usize + 1);
        let mut buf = Vec::new();
        {
            let mut out = DataOutput::new(&mut buf);
            match out.write_string(&long) {
                Err(Error::Arg(_)) => {}
                r => panic!("unexpected: {:?}", r),
            }
            out.write_string(&long[1..]).unwrap();
        }
        assert_eq!(buf.len(), 4 + MAX_LEN as usize);
    }

    #[test]
    fn bad_input_reports_position() {
        let buf = [1u8, 7];
        let mut r = &buf[..];
        let mut input = DataInput::new(&mut r);
        assert_eq!(input.read_bool().unwrap(), true);
        match input.read_id() {
            Err(Error::Read(e)) => assert_eq!(e.pos(), 1),
            r => panic!("unexpected: {:?}", r),
        }
        // truncated stream
        match input.read_u64() {
            Err(Error::Read(_)) => {}
            r => panic!("unexpected: {:?}", r),
        }
    }
}
