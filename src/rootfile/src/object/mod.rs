//! Objects stored under keys, and the factory mapping class names to decoders.

mod factory;
mod list;

use std::any::Any;
use std::fmt::Debug;

pub use factory::{DecodeFn, Factory};
pub use list::{List, ObjArray};

use crate::error::{Error, Result};
use crate::rbytes::WBuffer;
use crate::streamer::{write_record, write_streamer_info, Record, StreamerInfo, StreamerRegistry};

/// Object is anything that can be stored under a key.
pub trait Object: Debug + Send + Sync + 'static {
    /// class is the class name written in the key header.
    fn class(&self) -> &str;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;

    /// marshal writes the object body, starting with its version header.
    fn marshal(&self, w: &mut WBuffer, reg: &StreamerRegistry) -> Result<()>;
}

/// downcast converts a decoded object into its concrete type.
pub fn downcast<T: Object>(obj: Box<dyn Object>, name: &str) -> Result<T> {
    let class = obj.class().to_string();
    obj.into_any()
        .downcast::<T>()
        .map(|b| *b)
        .map_err(|_| Error::ClassMismatch {
            name: name.to_string(),
            got: class,
            want: std::any::type_name::<T>()
                .rsplit("::")
                .next()
                .unwrap_or_default()
                .to_string(),
        })
}

impl Object for Record {
    fn class(&self) -> &str {
        &self.class
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn marshal(&self, w: &mut WBuffer, reg: &StreamerRegistry) -> Result<()> {
        write_record(w, reg, self)
    }
}

impl Object for StreamerInfo {
    fn class(&self) -> &str {
        "TStreamerInfo"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn marshal(&self, w: &mut WBuffer, _reg: &StreamerRegistry) -> Result<()> {
        write_streamer_info(w, self)
    }
}
