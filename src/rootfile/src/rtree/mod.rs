//! Trees: columnar entry storage in baskets, the bindings between leaves and
//! Rust values, and the reader and writer scanning them.

mod basket;
pub(crate) mod binder;
mod branch;
mod cache;
mod leaf;
mod reader;
mod reflect;
mod rvar;
mod tree;
mod writer;
mod wvar;

pub use basket::{BasketData, BasketHeader, BASKET_EXTRA_LEN};
pub use binder::{bind_fields, compatible, kind_of, parse_shape, record_streamers, FieldBinding, Shape};
pub use branch::BranchRecord;
pub use cache::{BasketCache, CacheStats};
pub use leaf::Leaf;
pub use reader::{RCtx, ReadOption, Reader, ReaderConfig};
pub use reflect::{record_set_value, record_to_value, FieldSpec, Reflect, Slot, StreamersFn, TypeDesc, RECORD_VERSION};
pub use rvar::{read_vars, read_vars_for, ReadVar};
pub use tree::{Tree, TreeRecord};
pub use writer::{WriteOption, Writer, WriterConfig};
pub use wvar::{write_vars, WriteVar};
