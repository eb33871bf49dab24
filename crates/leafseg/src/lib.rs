//! Segment-based distributed ID generation.
//!
//! A [`SegmentKeyGenerator`] hands out monotonically increasing IDs for one
//! logical key. IDs are reserved in segments from a shared [`LockStore`] and
//! the next segment is reserved in the background, so the store is off the
//! hot path. Independent generators sharing a key and store never collide.
//!
//! Store sessions come from a [`StoreRegistry`] keyed by `store.type`, or can
//! be passed in directly with [`SegmentKeyGenerator::with_store`].

mod config;
mod error;
mod generator;
mod store;

pub use crate::config::*;
pub use crate::error::*;
pub use crate::generator::*;
pub use crate::store::*;
