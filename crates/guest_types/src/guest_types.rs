//! Guest Types - owned values that cross the host/guest boundary
//!
//! Everything in this crate is plain Rust data. Nothing here borrows from a
//! guest heap, so values can be queued, logged, compared and sent between
//! threads without touching the engine that produced them.

mod snapshot;
mod value;

pub use snapshot::*;
pub use value::*;
