#[macro_use]
extern crate async_trait;
#[macro_use]
extern crate lazy_static;

pub mod compress;
pub mod dump;
pub mod error;
pub mod object;
pub mod rbytes;
pub mod riofs;
pub mod rtree;
pub mod streamer;

pub use error::{Error, Result};
