//! Keys, directories and the file container.

mod directory;
mod file;
mod free;
pub(crate) mod header;
mod key;

pub use directory::{Cycle, DirRecord, Directory, Walker};
pub use file::{DirId, File, FileOptions};
pub(crate) use file::NewKey;
pub use free::{FreeList, FreeSegment};
pub use header::FileHeader;
pub use key::{Key, KeyHeader};
