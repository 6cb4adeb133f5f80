use std::any::Any;

use crate::error::{Error, Result};
use crate::object::Object;
use crate::rbytes::{RBuffer, WBuffer};
use crate::riofs::KeyHeader;
use crate::streamer::StreamerRegistry;

const BASKET_VERSION: u16 = 2;

/// Length of the basket fields following the key header.
pub const BASKET_EXTRA_LEN: usize = 2 + 4 + 4 + 4 + 4 + 1;

/// Set in `flag` when per-entry offsets follow the entry data.
const FLAG_OFFSETS: u8 = 1;

/// BasketHeader is the key header of a basket and the fields extending it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasketHeader {
    pub key: KeyHeader,
    pub version: u16,
    pub buffer_size: i32,
    /// size of one entry for fixed-size leaves, 0 otherwise.
    pub ev_buffer_size: i32,
    /// number of entries.
    pub nevbuf: i32,
    /// offset, from the start of the key, past the last entry byte.
    pub last: i32,
    pub flag: u8,
}

impl BasketHeader {
    pub fn unmarshal(r: &mut RBuffer) -> Result<Self> {
        let start = r.pos();
        let key = KeyHeader::unmarshal(r)?;
        if key.class != "TBasket" {
            return Err(Error::corrupted(format!(
                "key {:?} at {} is a {}, not a TBasket",
                key.name, key.seek_key, key.class
            )));
        }

        let version = r.read_u16()?;
        let buffer_size = r.read_i32()?;
        let ev_buffer_size = r.read_i32()?;
        let nevbuf = r.read_i32()?;
        let last = r.read_i32()?;
        let flag = r.read_u8()?;

        if ev_buffer_size < 0 || nevbuf < 0 {
            return Err(Error::corrupted(format!(
                "basket {:?} at {}: invalid entry size {} or count {}",
                key.name, key.seek_key, ev_buffer_size, nevbuf
            )));
        }
        if r.pos() - start != key.keylen as usize {
            return Err(Error::corrupted(format!(
                "basket {:?} at {}: header is {} bytes, key declares {}",
                key.name,
                key.seek_key,
                r.pos() - start,
                key.keylen
            )));
        }
        if last < key.keylen as i32 || (last - key.keylen as i32) > key.objlen {
            return Err(Error::corrupted(format!(
                "basket {:?} at {}: last byte {} outside of payload",
                key.name, key.seek_key, last
            )));
        }

        Ok(Self {
            key,
            version,
            buffer_size,
            ev_buffer_size,
            nevbuf,
            last,
            flag,
        })
    }

    pub fn has_offsets(&self) -> bool {
        self.flag & FLAG_OFFSETS != 0
    }

    pub(crate) fn fields(&self) -> BasketFields {
        BasketFields {
            version: self.version,
            buffer_size: self.buffer_size,
            ev_buffer_size: self.ev_buffer_size,
            nevbuf: self.nevbuf,
            last: self.last,
            flag: self.flag,
        }
    }
}

impl Object for BasketHeader {
    fn class(&self) -> &str {
        "TBasket"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn marshal(&self, w: &mut WBuffer, _reg: &StreamerRegistry) -> Result<()> {
        self.key.marshal(w);
        w.write_bytes(&self.fields().encode());
        Ok(())
    }
}

/// BasketData is a decoded basket: the raw bytes of a run of entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasketData {
    first_entry: i64,
    entries: usize,
    data: Vec<u8>,
    /// entry boundaries into data, entries + 1 values, for variable-size entries.
    offsets: Option<Vec<usize>>,
    entry_size: usize,
}

impl BasketData {
    pub fn fixed(first_entry: i64, data: Vec<u8>, entry_size: usize) -> Self {
        let entries = if entry_size == 0 {
            0
        } else {
            data.len() / entry_size
        };
        Self {
            first_entry,
            entries,
            data,
            offsets: None,
            entry_size,
        }
    }

    pub fn variable(first_entry: i64, data: Vec<u8>, offsets: Vec<usize>) -> Self {
        Self {
            first_entry,
            entries: offsets.len().saturating_sub(1),
            data,
            offsets: Some(offsets),
            entry_size: 0,
        }
    }

    /// decode splits a decompressed basket payload into entries.
    pub fn decode(hdr: &BasketHeader, payload: &[u8], first_entry: i64) -> Result<Self> {
        let keylen = hdr.key.keylen as usize;
        let datalen = hdr.last as usize - keylen;
        let nevbuf = hdr.nevbuf as usize;
        if datalen > payload.len() {
            return Err(Error::corrupted(format!(
                "basket {:?} at {}: {} data bytes declared, {} decoded",
                hdr.key.name,
                hdr.key.seek_key,
                datalen,
                payload.len()
            )));
        }
        let data = payload[..datalen].to_vec();

        if !hdr.has_offsets() {
            let size = hdr.ev_buffer_size as usize;
            if size * nevbuf != datalen {
                return Err(Error::corrupted(format!(
                    "basket {:?} at {}: {} entries of {} bytes do not fill {} bytes",
                    hdr.key.name, hdr.key.seek_key, nevbuf, size, datalen
                )));
            }
            let mut basket = Self::fixed(first_entry, data, size);
            basket.entries = nevbuf;
            return Ok(basket);
        }

        let mut r = RBuffer::new(&payload[datalen..]);
        let n = r.read_i32()?;
        if n as i64 != nevbuf as i64 + 1 {
            return Err(Error::corrupted(format!(
                "basket {:?} at {}: {} offsets for {} entries",
                hdr.key.name, hdr.key.seek_key, n, nevbuf
            )));
        }
        let mut offsets = Vec::with_capacity((n.max(0) as usize).min(r.remaining() / 4));
        for _ in 0..n {
            let off = r.read_i32()? as i64 - keylen as i64;
            let prev = offsets.last().copied().unwrap_or(0) as i64;
            if off < prev || off > datalen as i64 {
                return Err(Error::corrupted(format!(
                    "basket {:?} at {}: entry offset {} out of order",
                    hdr.key.name, hdr.key.seek_key, off
                )));
            }
            offsets.push(off as usize);
        }
        Ok(Self::variable(first_entry, data, offsets))
    }

    pub fn first_entry(&self) -> i64 {
        self.first_entry
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn contains(&self, entry: i64) -> bool {
        entry >= self.first_entry && entry < self.first_entry + self.entries as i64
    }

    /// size is the memory held by the basket, as accounted by the cache.
    pub fn size(&self) -> usize {
        self.data.len()
            + self
                .offsets
                .as_ref()
                .map_or(0, |o| o.len() * std::mem::size_of::<usize>())
    }

    /// entry returns the bytes of a tree entry held by this basket.
    pub fn entry(&self, entry: i64) -> Result<&[u8]> {
        if !self.contains(entry) {
            return Err(Error::corrupted(format!(
                "entry {} is not in basket [{}, {})",
                entry,
                self.first_entry,
                self.first_entry + self.entries as i64
            )));
        }
        let i = (entry - self.first_entry) as usize;
        let (begin, end) = match &self.offsets {
            Some(offsets) => (offsets[i], offsets[i + 1]),
            None => (i * self.entry_size, (i + 1) * self.entry_size),
        };
        Ok(&self.data[begin..end])
    }
}

/// BasketBuilder accumulates encoded entries until a basket is flushed.
#[derive(Debug, Default)]
pub(crate) struct BasketBuilder {
    data: Vec<u8>,
    offsets: Vec<usize>,
    entry_size: Option<usize>,
}

impl BasketBuilder {
    /// new creates a builder for entries of entry_size bytes, or of varying
    /// size when None.
    pub fn new(entry_size: Option<usize>) -> Self {
        Self {
            data: Vec::new(),
            offsets: vec![0],
            entry_size,
        }
    }

    pub fn push(&mut self, entry: &[u8]) {
        self.data.extend_from_slice(entry);
        self.offsets.push(self.data.len());
    }

    pub fn entries(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries() == 0
    }

    /// finish returns the basket fields and the uncompressed payload of a key
    /// whose header, basket fields included, is keylen bytes long.
    pub fn finish(&mut self, keylen: usize, buffer_size: i32) -> (BasketFields, Vec<u8>) {
        let nevbuf = self.entries();
        let mut payload = std::mem::take(&mut self.data);
        let datalen = payload.len();
        let offsets = std::mem::replace(&mut self.offsets, vec![0]);

        let (ev_buffer_size, flag) = match self.entry_size {
            Some(size) => (size as i32, 0),
            None => {
                let mut w = WBuffer::new();
                w.write_i32(offsets.len() as i32);
                for off in &offsets {
                    w.write_i32((off + keylen) as i32);
                }
                payload.extend_from_slice(w.as_slice());
                (0, FLAG_OFFSETS)
            }
        };

        let fields = BasketFields {
            version: BASKET_VERSION,
            buffer_size,
            ev_buffer_size,
            nevbuf: nevbuf as i32,
            last: (keylen + datalen) as i32,
            flag,
        };
        (fields, payload)
    }
}

/// BasketFields are the basket header fields known before the key is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BasketFields {
    pub version: u16,
    pub buffer_size: i32,
    pub ev_buffer_size: i32,
    pub nevbuf: i32,
    pub last: i32,
    pub flag: u8,
}

impl BasketFields {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WBuffer::new();
        w.write_u16(self.version);
        w.write_i32(self.buffer_size);
        w.write_i32(self.ev_buffer_size);
        w.write_i32(self.nevbuf);
        w.write_i32(self.last);
        w.write_u8(self.flag);
        w.into_vec()
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::rbytes::{RBuffer, WBuffer};
    use crate::riofs::KeyHeader;
    use crate::rtree::basket::{BasketBuilder, BasketData, BasketHeader, BASKET_EXTRA_LEN};

    fn encode(builder: &mut BasketBuilder) -> (Vec<u8>, Vec<u8>) {
        let mut key = KeyHeader::new("TBasket", "one", "tree").unwrap();
        key.keylen += BASKET_EXTRA_LEN as i16;
        let (fields, payload) = builder.finish(key.keylen as usize, 32000);
        key.objlen = payload.len() as i32;
        key.nbytes = key.keylen as i32 + key.objlen;
        key.seek_key = 100;

        let mut w = WBuffer::new();
        key.marshal(&mut w);
        w.write_bytes(&fields.encode());
        (w.into_vec(), payload)
    }

    #[test]
    fn test_fixed_basket() {
        let mut b = BasketBuilder::new(Some(4));
        for i in 1..=3_i32 {
            b.push(&i.to_be_bytes());
        }
        let (head, payload) = encode(&mut b);
        assert!(b.is_empty());

        let hdr = BasketHeader::unmarshal(&mut RBuffer::new(&head)).unwrap();
        assert_eq!(hdr.nevbuf, 3);
        assert_eq!(hdr.ev_buffer_size, 4);
        assert!(!hdr.has_offsets());

        let basket = BasketData::decode(&hdr, &payload, 10).unwrap();
        assert_eq!(basket.entries(), 3);
        assert_eq!(basket.entry(11).unwrap(), &2_i32.to_be_bytes());
        assert!(basket.entry(13).is_err());
        assert!(basket.entry(9).is_err());
    }

    #[test]
    fn test_variable_basket() {
        let mut b = BasketBuilder::new(None);
        b.push(b"\x03uno");
        b.push(b"");
        b.push(b"\x06quatro");
        let (head, payload) = encode(&mut b);

        let hdr = BasketHeader::unmarshal(&mut RBuffer::new(&head)).unwrap();
        assert!(hdr.has_offsets());
        let basket = BasketData::decode(&hdr, &payload, 0).unwrap();
        assert_eq!(basket.entry(0).unwrap(), b"\x03uno");
        assert_eq!(basket.entry(1).unwrap(), b"");
        assert_eq!(basket.entry(2).unwrap(), b"\x06quatro");
    }

    #[test]
    fn test_invalid_headers() {
        let mut key = KeyHeader::new("TKey", "one", "tree").unwrap();
        key.nbytes = key.keylen as i32;
        let mut w = WBuffer::new();
        key.marshal(&mut w);
        let err = BasketHeader::unmarshal(&mut RBuffer::new(w.as_slice())).unwrap_err();
        assert!(matches!(err, Error::Corrupted(_)));

        let mut b = BasketBuilder::new(Some(4));
        b.push(&[0; 4]);
        let (mut head, _) = encode(&mut b);
        // ev_buffer_size follows the version and buffer size.
        let at = head.len() - BASKET_EXTRA_LEN + 2 + 4;
        head[at..at + 4].copy_from_slice(&(-1_i32).to_be_bytes());
        let err = BasketHeader::unmarshal(&mut RBuffer::new(&head)).unwrap_err();
        assert!(err.to_string().contains("invalid entry size -1"));
    }
}
