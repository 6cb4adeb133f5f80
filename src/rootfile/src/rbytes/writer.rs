use std::collections::HashMap;

use bytes::BufMut;

use crate::rbytes::{BYTE_COUNT_MASK, CLASS_MASK, MAP_OFFSET, NEW_CLASS_TAG, OBJECT_BITS, SHORT_STRING_MAX};

/// WBuffer is an append-only big-endian write buffer.
#[derive(Default)]
pub struct WBuffer {
    buf: Vec<u8>,
    origin: usize,
    classes: HashMap<String, u32>,
}

impl WBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// with_origin creates a buffer whose class references are offset by origin,
    /// the length of the key header the payload will be stored behind.
    pub fn with_origin(origin: usize) -> Self {
        Self {
            buf: Vec::new(),
            origin,
            classes: HashMap::new(),
        }
    }

    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v)
    }

    pub fn write_i8(&mut self, v: i8) {
        self.buf.put_i8(v)
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8)
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16(v)
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.put_i16(v)
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32(v)
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32(v)
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64(v)
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64(v)
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_f32(v)
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_f64(v)
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.put_slice(data)
    }

    pub fn write_string(&mut self, s: &str) {
        let n = s.len();
        if n <= SHORT_STRING_MAX {
            self.write_u8(n as u8);
        } else {
            self.write_u8(255);
            self.write_i32(n as i32);
        }
        self.write_bytes(s.as_bytes());
    }

    pub fn write_cstring(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
        self.write_u8(0);
    }

    /// write_version reserves room for a byte count and writes the version.
    /// The returned position must be passed to `set_byte_count` once the
    /// record is complete.
    pub fn write_version(&mut self, version: i16) -> usize {
        let pos = self.pos();
        self.write_u32(0);
        self.write_i16(version);
        pos
    }

    /// set_byte_count patches the byte count reserved at pos.
    pub fn set_byte_count(&mut self, pos: usize) {
        let count = (self.pos() - pos - 4) as u32;
        self.buf[pos..pos + 4].copy_from_slice(&(count | BYTE_COUNT_MASK).to_be_bytes());
    }

    pub fn write_tobject(&mut self) {
        self.write_i16(1);
        self.write_u32(0);
        self.write_u32(OBJECT_BITS);
    }

    pub fn write_tnamed(&mut self, name: &str, title: &str) {
        let pos = self.write_version(1);
        self.write_tobject();
        self.write_string(name);
        self.write_string(title);
        self.set_byte_count(pos);
    }

    /// write_class_tag starts an object streamed by pointer. The first time a
    /// class is written its name follows the tag; later objects of the same
    /// class refer back to it. The returned position is the object's byte count.
    pub fn write_class_tag(&mut self, class: &str) -> usize {
        let pos = self.pos();
        self.write_u32(0);
        match self.classes.get(class) {
            Some(offset) => self.write_u32(*offset | CLASS_MASK),
            None => {
                let tag_pos = (self.pos() + self.origin) as u32 + MAP_OFFSET;
                self.write_u32(NEW_CLASS_TAG);
                self.write_cstring(class);
                self.classes.insert(class.to_string(), tag_pos);
            }
        }
        pos
    }

    pub fn write_null_object(&mut self) {
        self.write_u32(0);
    }
}
