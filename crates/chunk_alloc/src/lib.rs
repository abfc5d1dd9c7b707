//! Tree-structured sub-range allocator for large fixed-size buffers.
//!
//! A [`ChunkTree`] partitions the address space of one or more backing
//! buffers (vertex, uniform, storage data...) into chunks. Any chunk can be
//! subdivided further, so a mesh can own one chunk of the vertex buffer and
//! carve its LODs out of it.
//!
//! The tree only does space accounting. It never touches bytes: whenever a
//! chunk moves (a [`Resize::Relocated`] resize, or a [`Relocation`] returned
//! by [`ChunkTree::defragment`]), the owner of the backing storage copies the
//! payload from the old offset to the new one.
//!
//! Chunks are referred to by [`ChunkHandle`]s. Offsets are always looked up
//! through the tree, never cached, since any mutation of an arena may move
//! its children.
mod defrag;
mod error;
mod free_list;
mod handle;
mod resize;
mod tree;

pub use defrag::Relocation;
pub use error::{ChunkError, ChunkResult};
pub use free_list::{align_to, align_up, FreeList, FreeRange};
pub use handle::ChunkHandle;
pub use resize::Resize;
pub use tree::{ArenaStats, Chunk, ChunkTree};
