use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::rbytes::{BYTE_COUNT_MASK, CLASS_MASK, IS_REFERENCED, MAP_OFFSET, NEW_CLASS_TAG};

/// Version is a decoded record header: the class version and, when the record was
/// written with a byte count, the position just past the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub version: i16,
    pub start: usize,
    pub end: Option<usize>,
}

/// ClassTag is what precedes an object streamed by pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassTag {
    Null,
    Class { name: String, end: Option<usize> },
}

/// RBuffer is a read cursor over a big-endian byte slice.
///
/// `origin` is the number of bytes that logically precede the slice (the key
/// header) and is added to positions recorded as class references.
pub struct RBuffer<'a> {
    buf: &'a [u8],
    pos: usize,
    origin: usize,
    classes: HashMap<u32, String>,
}

macro_rules! read_be {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty> {
            let data = self.read_bytes(std::mem::size_of::<$ty>())?;
            let mut raw = [0_u8; std::mem::size_of::<$ty>()];
            raw.copy_from_slice(data);
            Ok(<$ty>::from_be_bytes(raw))
        }
    };
}

impl<'a> RBuffer<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_origin(buf, 0)
    }

    pub fn with_origin(buf: &'a [u8], origin: usize) -> Self {
        Self {
            buf,
            pos: 0,
            origin,
            classes: HashMap::new(),
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn set_pos(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(Error::ShortBuffer {
                offset: self.pos,
                need: pos - self.pos,
                available: self.remaining(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    /// read_bytes consumes the next n bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(Error::ShortBuffer {
                offset: self.pos,
                need: n,
                available: self.remaining(),
            });
        }
        let data = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(data)
    }

    read_be!(read_u8, u8);
    read_be!(read_i8, i8);
    read_be!(read_u16, u16);
    read_be!(read_i16, i16);
    read_be!(read_u32, u32);
    read_be!(read_i32, i32);
    read_be!(read_u64, u64);
    read_be!(read_i64, i64);
    read_be!(read_f32, f32);
    read_be!(read_f64, f64);

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// read_string reads a length-prefixed string: one length byte, or 255
    /// followed by a 32-bit length for long strings.
    pub fn read_string(&mut self) -> Result<String> {
        let mut n = self.read_u8()? as usize;
        if n == 255 {
            let long = self.read_i32()?;
            if long < 0 {
                return Err(Error::corrupted(format!("negative string length {}", long)));
            }
            n = long as usize;
        }
        let data = self.read_bytes(n)?;
        Ok(String::from_utf8_lossy(data).into_owned())
    }

    /// read_cstring reads a null-terminated string.
    pub fn read_cstring(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let n = rest.iter().position(|b| *b == 0).ok_or(Error::ShortBuffer {
            offset: self.pos,
            need: rest.len() + 1,
            available: rest.len(),
        })?;
        let s = String::from_utf8_lossy(&rest[..n]).into_owned();
        self.pos += n + 1;
        Ok(s)
    }

    /// read_version reads a record header. Records written with a byte count
    /// carry `count | BYTE_COUNT_MASK` before the version.
    pub fn read_version(&mut self) -> Result<Version> {
        let start = self.pos;
        let bc = self.read_u32()?;
        if bc & BYTE_COUNT_MASK != 0 {
            let count = (bc & !BYTE_COUNT_MASK) as usize;
            let end = start + 4 + count;
            if end > self.buf.len() {
                return Err(Error::corrupted(format!(
                    "record at {} claims {} bytes, {} available",
                    start,
                    count,
                    self.buf.len() - start - 4
                )));
            }
            let version = self.read_i16()?;
            return Ok(Version {
                version,
                start,
                end: Some(end),
            });
        }

        self.pos = start;
        let version = self.read_i16()?;
        Ok(Version {
            version,
            start,
            end: None,
        })
    }

    /// check_byte_count moves past the record described by hdr. Bytes left
    /// unread inside the record belong to fields this reader does not know and
    /// are skipped; reading past the record is corruption.
    pub fn check_byte_count(&mut self, hdr: &Version, class: &str) -> Result<()> {
        let end = match hdr.end {
            Some(end) => end,
            None => return Ok(()),
        };
        if self.pos > end {
            return Err(Error::corrupted(format!(
                "{} record at {}: read {} bytes past its end",
                class,
                hdr.start,
                self.pos - end
            )));
        }
        if self.pos < end {
            tracing::trace!(
                "skipping {} trailing bytes of {} v{}",
                end - self.pos,
                class,
                hdr.version
            );
            self.pos = end;
        }
        Ok(())
    }

    /// read_tobject reads the base object record and returns its bits.
    pub fn read_tobject(&mut self) -> Result<u32> {
        let version = self.read_u16()?;
        if (version as u32) << 16 & BYTE_COUNT_MASK != 0 {
            // the version is preceded by a byte count: skip its low half and the version.
            self.skip(4)?;
        }
        let _unique_id = self.read_u32()?;
        let bits = self.read_u32()?;
        if bits & IS_REFERENCED != 0 {
            let _pid = self.read_u16()?;
        }
        Ok(bits)
    }

    /// read_tnamed reads a named object record and returns (name, title).
    pub fn read_tnamed(&mut self) -> Result<(String, String)> {
        let hdr = self.read_version()?;
        self.read_tobject()?;
        let name = self.read_string()?;
        let title = self.read_string()?;
        self.check_byte_count(&hdr, "TNamed")?;
        Ok((name, title))
    }

    /// read_class_tag reads the tag preceding an object streamed by pointer.
    pub fn read_class_tag(&mut self) -> Result<ClassTag> {
        let start = self.pos;
        let bc = self.read_u32()?;
        if bc == 0 {
            return Ok(ClassTag::Null);
        }

        let (tag_pos, tag, end) = if bc & BYTE_COUNT_MASK != 0 && bc != NEW_CLASS_TAG {
            let end = start + 4 + (bc & !BYTE_COUNT_MASK) as usize;
            let tag_pos = self.pos;
            (tag_pos, self.read_u32()?, Some(end))
        } else {
            (start, bc, None)
        };

        let name = if tag == NEW_CLASS_TAG {
            let name = self.read_cstring()?;
            let key = (tag_pos + self.origin) as u32 + MAP_OFFSET;
            self.classes.insert(key, name.clone());
            name
        } else if tag & CLASS_MASK != 0 {
            let key = tag & !CLASS_MASK;
            self.classes
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::corrupted(format!("unknown class reference {:#x} at {}", key, tag_pos)))?
        } else {
            return Err(Error::corrupted(format!(
                "object reference {:#x} at {} is not supported",
                tag, tag_pos
            )));
        };

        Ok(ClassTag::Class { name, end })
    }
}
