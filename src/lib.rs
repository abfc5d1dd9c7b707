//! Host-side buffer sub-allocation on top of [`dust_chunk_alloc`].
//!
//! [`HostBuffer`] pairs a byte store with a [`chunk::ChunkTree`] that carves
//! it up, and keeps the two consistent across resizes, compaction and growth.
mod buffer;
mod config;
mod dirty;
mod error;

pub use dust_chunk_alloc as chunk;

pub use buffer::HostBuffer;
pub use config::BufferConfig;
pub use dirty::{DirtyRanges, MergeRanges};
pub use error::BufferError;
