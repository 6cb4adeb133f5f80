use uuid::Uuid;

use crate::error::{Error, Result};
use crate::rbytes::{RBuffer, WBuffer};

pub const MAGIC: &[u8; 4] = b"root";

/// Format version written by this crate; versions above 1000000 use 64-bit
/// seek pointers throughout.
pub const FILE_VERSION: i32 = 1_000_000 + 62206;
const BIG_FILE_VERSION: i32 = 1_000_000;

/// Offset of the first key; everything before it is the file header.
pub const BEGIN: i32 = 100;

const UNITS: u8 = 8;
const UUID_VERSION: u16 = 1;

/// FileHeader is the fixed-layout record at offset 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub version: i32,
    pub begin: i32,
    /// first byte past the last key.
    pub end: i64,
    pub seek_free: i64,
    pub nbytes_free: i32,
    pub nfree: i32,
    pub nbytes_name: i32,
    pub units: u8,
    pub compress: i32,
    pub seek_info: i64,
    pub nbytes_info: i32,
    pub uuid: Uuid,
}

impl FileHeader {
    pub fn new(compress: i32) -> Self {
        Self {
            version: FILE_VERSION,
            begin: BEGIN,
            end: BEGIN as i64,
            seek_free: 0,
            nbytes_free: 0,
            nfree: 0,
            nbytes_name: 0,
            units: UNITS,
            compress,
            seek_info: 0,
            nbytes_info: 0,
            uuid: Uuid::new_v4(),
        }
    }

    pub fn is_big(&self) -> bool {
        self.version > BIG_FILE_VERSION
    }

    /// format_version is the version without the 64-bit marker.
    pub fn format_version(&self) -> i32 {
        self.version % BIG_FILE_VERSION
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut w = WBuffer::new();
        w.write_bytes(MAGIC);
        w.write_i32(FILE_VERSION);
        w.write_i32(self.begin);
        w.write_i64(self.end);
        w.write_i64(self.seek_free);
        w.write_i32(self.nbytes_free);
        w.write_i32(self.nfree);
        w.write_i32(self.nbytes_name);
        w.write_u8(UNITS);
        w.write_i32(self.compress);
        w.write_i64(self.seek_info);
        w.write_i32(self.nbytes_info);
        write_uuid(&mut w, &self.uuid);

        let mut data = w.into_vec();
        data.resize(self.begin as usize, 0);
        data
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut r = RBuffer::new(data);
        let magic = r.read_bytes(4)?;
        if magic != MAGIC {
            return Err(Error::corrupted(format!(
                "not a ROOT file: magic {:?}",
                String::from_utf8_lossy(magic)
            )));
        }

        let version = r.read_i32()?;
        let begin = r.read_i32()?;
        if begin < 0 || (begin as usize) > data.len().max(BEGIN as usize) {
            return Err(Error::corrupted(format!("invalid first-key offset {}", begin)));
        }

        let big = version > BIG_FILE_VERSION;
        let end = read_seek(&mut r, big)?;
        let seek_free = read_seek(&mut r, big)?;
        let nbytes_free = r.read_i32()?;
        let nfree = r.read_i32()?;
        let nbytes_name = r.read_i32()?;
        let units = r.read_u8()?;
        let compress = r.read_i32()?;
        let seek_info = read_seek(&mut r, big)?;
        let nbytes_info = r.read_i32()?;
        let uuid = read_uuid(&mut r)?;

        Ok(Self {
            version,
            begin,
            end,
            seek_free,
            nbytes_free,
            nfree,
            nbytes_name,
            units,
            compress,
            seek_info,
            nbytes_info,
            uuid,
        })
    }
}

pub(crate) fn read_seek(r: &mut RBuffer, big: bool) -> Result<i64> {
    if big {
        r.read_i64()
    } else {
        Ok(r.read_i32()? as i64)
    }
}

pub(crate) fn write_uuid(w: &mut WBuffer, uuid: &Uuid) {
    w.write_u16(UUID_VERSION);
    w.write_bytes(uuid.as_bytes());
}

pub(crate) fn read_uuid(r: &mut RBuffer) -> Result<Uuid> {
    let _version = r.read_u16()?;
    let mut raw = [0_u8; 16];
    raw.copy_from_slice(r.read_bytes(16)?);
    Ok(Uuid::from_bytes(raw))
}

#[cfg(test)]
mod tests {
    use crate::rbytes::WBuffer;
    use crate::riofs::header::{FileHeader, BEGIN, FILE_VERSION};

    #[test]
    fn test_header_roundtrip() {
        let mut hdr = FileHeader::new(101);
        hdr.end = 1 << 33;
        hdr.seek_free = 4242;
        hdr.nbytes_free = 60;
        hdr.nfree = 2;
        hdr.seek_info = 1000;
        hdr.nbytes_info = 300;

        let data = hdr.marshal();
        assert_eq!(data.len(), BEGIN as usize);
        assert_eq!(&data[..4], b"root");

        let got = FileHeader::unmarshal(&data).unwrap();
        assert_eq!(got, hdr);
        assert!(got.is_big());
        assert_eq!(got.format_version(), 62206);
    }

    #[test]
    fn test_small_header() {
        let mut w = WBuffer::new();
        w.write_bytes(b"root");
        w.write_i32(62206);
        w.write_i32(100);
        w.write_i32(5000);
        w.write_i32(4900);
        w.write_i32(54);
        w.write_i32(1);
        w.write_i32(58);
        w.write_u8(4);
        w.write_i32(1);
        w.write_i32(4500);
        w.write_i32(400);
        w.write_u16(1);
        w.write_bytes(&[7_u8; 16]);

        let got = FileHeader::unmarshal(w.as_slice()).unwrap();
        assert!(!got.is_big());
        assert_eq!(got.end, 5000);
        assert_eq!(got.seek_info, 4500);
        assert_eq!(got.nbytes_info, 400);
        assert_ne!(got.version, FILE_VERSION);
    }

    #[test]
    fn test_bad_magic() {
        let mut data = FileHeader::new(0).marshal();
        data[0] = b'R';
        let err = FileHeader::unmarshal(&data).unwrap_err();
        assert!(err.to_string().contains("not a ROOT file"), "{}", err);

        assert!(FileHeader::unmarshal(b"roo").unwrap_err().is_short_buffer());
    }
}
