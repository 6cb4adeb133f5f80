use std::any::Any;

use rootfile_utils::time::Datime;

use crate::error::{Error, Result};
use crate::object::Object;
use crate::rbytes::{RBuffer, WBuffer, SHORT_STRING_MAX};
use crate::riofs::header::read_seek;
use crate::riofs::File;
use crate::streamer::StreamerRegistry;

const KEY_VERSION: i16 = 4;
const BIG_KEY_VERSION: i16 = 1000;

/// KeyHeader is the record in front of every stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHeader {
    /// total length of header and compressed payload.
    pub nbytes: i32,
    pub version: i16,
    /// uncompressed payload length.
    pub objlen: i32,
    pub datime: Datime,
    pub keylen: i16,
    pub cycle: i16,
    pub seek_key: i64,
    pub seek_pdir: i64,
    pub class: String,
    pub name: String,
    pub title: String,
}

fn string_len(s: &str) -> usize {
    if s.len() > SHORT_STRING_MAX {
        s.len() + 5
    } else {
        s.len() + 1
    }
}

impl KeyHeader {
    /// new fails when class, name and title do not fit a 16-bit key length.
    pub fn new(class: &str, name: &str, title: &str) -> Result<Self> {
        let keylen = Self::header_len(class, name, title);
        let keylen = i16::try_from(keylen).map_err(|_| {
            Error::InvalidArgument(format!("key header of {:?} too long: {} bytes", name, keylen))
        })?;
        Ok(Self {
            nbytes: 0,
            version: KEY_VERSION + BIG_KEY_VERSION,
            objlen: 0,
            datime: Datime::now(),
            keylen,
            cycle: 1,
            seek_key: 0,
            seek_pdir: 0,
            class: class.to_string(),
            name: name.to_string(),
            title: title.to_string(),
        })
    }

    /// header_len is the encoded length of a header with 64-bit seeks.
    pub fn header_len(class: &str, name: &str, title: &str) -> usize {
        4 + 2 + 4 + 4 + 2 + 2 + 8 + 8 + string_len(class) + string_len(name) + string_len(title)
    }

    pub fn is_big(&self) -> bool {
        self.version > BIG_KEY_VERSION
    }

    /// payload_len is the number of stored (possibly compressed) payload bytes.
    pub fn payload_len(&self) -> usize {
        (self.nbytes - self.keylen as i32).max(0) as usize
    }

    pub fn is_compressed(&self) -> bool {
        self.payload_len() != self.objlen as usize
    }

    pub fn marshal(&self, w: &mut WBuffer) {
        w.write_i32(self.nbytes);
        w.write_i16(KEY_VERSION + BIG_KEY_VERSION);
        w.write_i32(self.objlen);
        w.write_u32(self.datime.raw());
        w.write_i16(self.keylen);
        w.write_i16(self.cycle);
        w.write_i64(self.seek_key);
        w.write_i64(self.seek_pdir);
        w.write_string(&self.class);
        w.write_string(&self.name);
        w.write_string(&self.title);
    }

    /// unmarshal decodes a header and checks its declared lengths against the
    /// bytes it occupies. Basket keys extend the header with their own fields,
    /// so for them keylen may exceed the decoded length.
    pub fn unmarshal(r: &mut RBuffer) -> Result<Self> {
        let start = r.pos();
        let nbytes = r.read_i32()?;
        let version = r.read_i16()?;
        let objlen = r.read_i32()?;
        let datime = Datime::from_raw(r.read_u32()?);
        let keylen = r.read_i16()?;
        let cycle = r.read_i16()?;
        let big = version > BIG_KEY_VERSION;
        let seek_key = read_seek(r, big)?;
        let seek_pdir = read_seek(r, big)?;
        let class = r.read_string()?;
        let name = r.read_string()?;
        let title = r.read_string()?;

        let decoded = r.pos() - start;
        let keylen_ok = if class == "TBasket" {
            keylen as usize >= decoded
        } else {
            keylen as usize == decoded
        };
        if !keylen_ok {
            return Err(Error::corrupted(format!(
                "key {:?}: declared header length {} but decoded {} bytes",
                name, keylen, decoded
            )));
        }
        if nbytes < keylen as i32 || objlen < 0 {
            return Err(Error::corrupted(format!(
                "key {:?}: invalid sizes nbytes={} keylen={} objlen={}",
                name, nbytes, keylen, objlen
            )));
        }

        Ok(Self {
            nbytes,
            version,
            objlen,
            datime,
            keylen,
            cycle,
            seek_key,
            seek_pdir,
            class,
            name,
            title,
        })
    }
}

impl Object for KeyHeader {
    fn class(&self) -> &str {
        "TKey"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn marshal(&self, w: &mut WBuffer, _reg: &StreamerRegistry) -> Result<()> {
        KeyHeader::marshal(self, w);
        Ok(())
    }
}

/// Key is a handle on one stored object of an open file.
#[derive(Clone)]
pub struct Key {
    file: File,
    hdr: KeyHeader,
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key").field("hdr", &self.hdr).finish()
    }
}

impl Key {
    pub(crate) fn new(file: File, hdr: KeyHeader) -> Self {
        Self { file, hdr }
    }

    pub fn header(&self) -> &KeyHeader {
        &self.hdr
    }

    pub fn class(&self) -> &str {
        &self.hdr.class
    }

    pub fn name(&self) -> &str {
        &self.hdr.name
    }

    pub fn title(&self) -> &str {
        &self.hdr.title
    }

    pub fn cycle(&self) -> i16 {
        self.hdr.cycle
    }

    pub fn datime(&self) -> Datime {
        self.hdr.datime
    }

    pub fn obj_len(&self) -> usize {
        self.hdr.objlen as usize
    }

    pub fn nbytes(&self) -> usize {
        self.hdr.nbytes as usize
    }

    pub fn seek(&self) -> i64 {
        self.hdr.seek_key
    }

    pub fn is_directory(&self) -> bool {
        is_directory_class(&self.hdr.class)
    }

    /// payload reads and decompresses the object bytes.
    pub async fn payload(&self) -> Result<Vec<u8>> {
        self.file.read_payload(&self.hdr).await
    }

    /// object decodes the stored object through the file's factory.
    pub async fn object(&self) -> Result<Box<dyn Object>> {
        let payload = self.payload().await?;
        self.file.decode_object(&self.hdr, &payload)
    }
}

pub(crate) fn is_directory_class(class: &str) -> bool {
    matches!(class, "TDirectory" | "TDirectoryFile")
}
