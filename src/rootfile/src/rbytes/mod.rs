//! Big-endian binary cursor used by every on-disk structure of the format.
//!
//! `RBuffer` reads from a borrowed byte slice and never reads past its end;
//! `WBuffer` appends to a growable buffer. Both understand the framing shared by
//! streamed objects: byte-count prefixed version headers and class tags.

mod reader;
mod writer;

pub use reader::{ClassTag, RBuffer, Version};
pub use writer::WBuffer;

/// Set on the leading word of a record whose byte count precedes its version.
pub const BYTE_COUNT_MASK: u32 = 0x4000_0000;
/// Set on a class tag that refers to a class name streamed earlier in the buffer.
pub const CLASS_MASK: u32 = 0x8000_0000;
/// Tag announcing that a null-terminated class name follows.
pub const NEW_CLASS_TAG: u32 = 0xffff_ffff;
/// Offset added to buffer positions recorded as class references.
pub const MAP_OFFSET: u32 = 2;

/// TObject bit telling that the object was referenced and carries a process id.
pub const IS_REFERENCED: u32 = 1 << 4;
/// Bits set on every object written by this crate (`kNotDeleted | kIsOnHeap`).
pub const OBJECT_BITS: u32 = 0x0300_0000;

/// Largest string length encoded with a single-byte prefix.
pub(crate) const SHORT_STRING_MAX: usize = 254;
