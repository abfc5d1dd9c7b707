use std::ops::Range;

use dust_chunk_alloc::{
    align_up, ArenaStats, Chunk, ChunkError, ChunkHandle, ChunkTree, Relocation, Resize,
};

use crate::{BufferConfig, BufferError, DirtyRanges};

/// A growable host-memory buffer sub-allocated through a [`ChunkTree`].
///
/// The tree does the space accounting; the buffer owns the bytes and keeps
/// them in step with it, copying payloads whenever the tree reports a chunk
/// moved. Every byte range whose contents changed is recorded so that a
/// device-side copy can be patched with [`HostBuffer::drain_dirty`].
pub struct HostBuffer {
    config: BufferConfig,
    tree: ChunkTree,
    root: ChunkHandle,
    data: Vec<u8>,
    dirty: DirtyRanges,
}

impl HostBuffer {
    pub fn new(config: BufferConfig) -> Result<Self, BufferError> {
        config.validate()?;
        let (tree, root) = ChunkTree::with_root(config.initial_size)?;
        let data = vec![0; config.initial_size as usize];
        tracing::debug!(capacity = config.initial_size, "created host buffer");
        Ok(Self {
            config,
            tree,
            root,
            data,
            dirty: DirtyRanges::new(),
        })
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }
    pub fn capacity(&self) -> u64 {
        self.data.len() as u64
    }
    pub fn root(&self) -> ChunkHandle {
        self.root
    }
    pub fn tree(&self) -> &ChunkTree {
        &self.tree
    }
    pub fn stats(&self) -> Result<ArenaStats, BufferError> {
        Ok(self.tree.stats(self.root)?)
    }
    pub fn chunk(&self, handle: ChunkHandle) -> Result<Chunk, BufferError> {
        Ok(self.tree.chunk(handle)?)
    }

    /// Allocates `size` zeroed bytes at the configured alignment, growing the
    /// buffer if needed.
    pub fn allocate(&mut self, size: u64) -> Result<ChunkHandle, BufferError> {
        self.reserve(self.root, size, self.config.alignment)
    }

    pub fn allocate_aligned(
        &mut self,
        size: u64,
        alignment: u64,
    ) -> Result<ChunkHandle, BufferError> {
        self.reserve(self.root, size, alignment)
    }

    /// Allocates inside `parent`, which becomes a nested arena. Nested arenas
    /// have a fixed size; running out of room there is an error.
    pub fn allocate_in(
        &mut self,
        parent: ChunkHandle,
        size: u64,
    ) -> Result<ChunkHandle, BufferError> {
        self.reserve(parent, size, self.config.alignment)
    }

    pub fn free(&mut self, handle: ChunkHandle) -> Result<(), BufferError> {
        let parent = self.parent_of(handle)?;
        self.tree.free_child(parent, handle)?;
        Ok(())
    }

    pub fn read(&self, handle: ChunkHandle) -> Result<&[u8], BufferError> {
        let chunk = self.tree.chunk(handle)?;
        Ok(&self.data[to_usize(chunk.byte_range())])
    }

    pub fn write(
        &mut self,
        handle: ChunkHandle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), BufferError> {
        let chunk = self.tree.chunk(handle)?;
        let len = bytes.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > chunk.range) {
            return Err(BufferError::OutOfBounds {
                offset,
                len,
                range: chunk.range,
            });
        }
        let start = chunk.offset + offset;
        self.data[to_usize(start..start + len)].copy_from_slice(bytes);
        self.dirty.mark(start..start + len);
        Ok(())
    }

    /// Resizes a chunk, keeping its payload.
    ///
    /// When a chunk of the root arena cannot grow, the root is compacted with
    /// the extension reserved for this chunk; if that does not make enough
    /// room either, the buffer grows.
    pub fn resize(&mut self, handle: ChunkHandle, new_size: u64) -> Result<Resize, BufferError> {
        let parent = self.parent_of(handle)?;
        let alignment = self.config.alignment;
        let before = self.tree.chunk(handle)?;
        let resize = match self.tree.resize_child(parent, handle, new_size, alignment) {
            Ok(resize) => resize,
            Err(err) if err.is_out_of_space() && parent == self.root => {
                return self.resize_compacting(handle, new_size, before);
            }
            Err(err) => return Err(err.into()),
        };
        self.apply_resize(handle, before, resize)?;
        Ok(resize)
    }

    /// Compacts the root arena. Returns the chunks that moved.
    pub fn defragment(&mut self) -> Result<Vec<Relocation>, BufferError> {
        self.defragment_arena(self.root)
    }

    pub fn defragment_arena(
        &mut self,
        arena: ChunkHandle,
    ) -> Result<Vec<Relocation>, BufferError> {
        let relocations = self
            .tree
            .defragment(arena, self.config.alignment, None)?;
        self.apply_relocations(&relocations);
        Ok(relocations)
    }

    /// Takes the byte ranges modified since the last call, merged and sorted.
    pub fn drain_dirty(&mut self) -> Vec<Range<u64>> {
        self.dirty.drain().collect()
    }

    fn parent_of(&self, handle: ChunkHandle) -> Result<ChunkHandle, BufferError> {
        Ok(self
            .tree
            .parent(handle)?
            .ok_or(ChunkError::InvalidHandle(handle))?)
    }

    fn reserve(
        &mut self,
        arena: ChunkHandle,
        size: u64,
        alignment: u64,
    ) -> Result<ChunkHandle, BufferError> {
        let handle = match self.tree.reserve_range(arena, size, alignment) {
            Ok(handle) => handle,
            Err(err) if err.is_out_of_space() && arena == self.root => {
                self.grow_for(worst_case(size, alignment))?;
                self.tree.reserve_range(arena, size, alignment)?
            }
            Err(err) => return Err(err.into()),
        };
        let chunk = self.tree.chunk(handle)?;
        self.data[to_usize(chunk.byte_range())].fill(0);
        self.dirty.mark(chunk.byte_range());
        Ok(handle)
    }

    fn resize_compacting(
        &mut self,
        handle: ChunkHandle,
        new_size: u64,
        before: Chunk,
    ) -> Result<Resize, BufferError> {
        let alignment = self.config.alignment;
        let Some(rounded) = align_up(new_size, alignment) else {
            return Err(BufferError::CapacityExceeded {
                required: u64::MAX,
                max: self.config.max_size,
            });
        };
        let extension = rounded - before.range;
        match self
            .tree
            .defragment(self.root, alignment, Some((handle, extension)))
        {
            Ok(relocations) => {
                self.apply_relocations(&relocations);
                let after = self.tree.chunk(handle)?;
                if after.offset != before.offset {
                    Ok(Resize::Relocated {
                        previous_offset: before.offset,
                        previous_range: before.range,
                    })
                } else {
                    Ok(Resize::Extended {
                        previous_range: before.range,
                    })
                }
            }
            Err(ChunkError::DefragmentationInfeasible(reason)) => {
                tracing::debug!(?handle, %reason, "compaction cannot fit resize, growing");
                self.grow_for(worst_case(new_size, alignment))?;
                let resize = self
                    .tree
                    .resize_child(self.root, handle, new_size, alignment)?;
                self.apply_resize(handle, before, resize)?;
                Ok(resize)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Grows the backing store so that at least `needed` more contiguous bytes
    /// are free at the end of the root arena.
    fn grow_for(&mut self, needed: u64) -> Result<(), BufferError> {
        let capacity = self.capacity();
        let max = self.config.max_size;
        let required = capacity.saturating_add(needed);
        if required > max {
            tracing::warn!(capacity, required, max, "host buffer cannot grow");
            return Err(BufferError::CapacityExceeded { required, max });
        }
        let scaled = (capacity as f64 * self.config.growth_factor) as u64;
        let new_capacity = scaled.max(required).min(max);
        self.tree.grow_root(self.root, new_capacity - capacity)?;
        self.data.resize(new_capacity as usize, 0);
        tracing::info!(capacity, new_capacity, "grew host buffer");
        Ok(())
    }

    fn apply_resize(
        &mut self,
        handle: ChunkHandle,
        before: Chunk,
        resize: Resize,
    ) -> Result<(), BufferError> {
        let after = self.tree.chunk(handle)?;
        match resize {
            Resize::Unchanged | Resize::Shrunk { .. } => {}
            Resize::Extended { .. } => {
                self.data[to_usize(before.end()..after.end())].fill(0);
                self.dirty.mark(before.end()..after.end());
            }
            Resize::Relocated { .. } => {
                self.data
                    .copy_within(to_usize(before.byte_range()), after.offset as usize);
                self.data[to_usize(after.offset + before.range..after.end())].fill(0);
                self.dirty.mark(after.byte_range());
            }
        }
        Ok(())
    }

    /// Copies payloads to match a defragmented layout.
    ///
    /// Destinations are disjoint but may overlap other chunks' sources.
    /// Payloads moving up are staged before anything is written; payloads
    /// moving down are copied lowest source first, so a copy never lands on a
    /// source that has not been read yet.
    fn apply_relocations(&mut self, relocations: &[Relocation]) {
        let mut staged = Vec::new();
        let mut downward = Vec::new();
        for relocation in relocations {
            let source = relocation.previous_offset
                ..relocation.previous_offset + relocation.copy_len();
            if relocation.offset > relocation.previous_offset {
                staged.push((relocation, self.data[to_usize(source)].to_vec()));
            } else if relocation.offset < relocation.previous_offset {
                downward.push((relocation, source));
            }
        }
        downward.sort_by_key(|(_, source)| source.start);
        for (relocation, source) in downward {
            self.data
                .copy_within(to_usize(source), relocation.offset as usize);
        }
        for (relocation, bytes) in staged {
            let start = relocation.offset as usize;
            self.data[start..start + bytes.len()].copy_from_slice(&bytes);
        }
        for relocation in relocations {
            let end = relocation.offset + relocation.range;
            if relocation.range > relocation.previous_range {
                let tail = relocation.offset + relocation.previous_range;
                self.data[to_usize(tail..end)].fill(0);
            }
            if relocation.moved() || relocation.range != relocation.previous_range {
                self.dirty.mark(relocation.offset..end);
            }
        }
    }
}

/// Room to request when growing for a `size` byte reservation, including the
/// worst alignment padding.
fn worst_case(size: u64, alignment: u64) -> u64 {
    align_up(size, alignment).map_or(u64::MAX, |size| {
        size.saturating_add(alignment.saturating_sub(1))
    })
}

fn to_usize(range: Range<u64>) -> Range<usize> {
    range.start as usize..range.end as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use dust_chunk_alloc::FreeRange;
    use rand::prelude::*;
    use rand::rngs::StdRng;
    use std::collections::HashMap;

    fn buffer(initial_size: u64, max_size: u64, alignment: u64) -> HostBuffer {
        HostBuffer::new(BufferConfig {
            initial_size,
            max_size,
            growth_factor: 2.0,
            alignment,
        })
        .unwrap()
    }

    #[test]
    fn test_write_read() {
        let mut buf = buffer(256, 256, 16);
        let a = buf.allocate(10).unwrap();
        assert_eq!(buf.read(a).unwrap(), &[0; 16]);
        buf.write(a, 2, b"dust").unwrap();
        assert_eq!(&buf.read(a).unwrap()[..8], b"\0\0dust\0\0");
        assert!(matches!(
            buf.write(a, 14, b"dust"),
            Err(BufferError::OutOfBounds {
                offset: 14,
                len: 4,
                range: 16
            })
        ));
    }

    #[test]
    fn test_new_chunks_are_zeroed() {
        let mut buf = buffer(64, 64, 0);
        let a = buf.allocate(32).unwrap();
        buf.write(a, 0, &[0xff; 32]).unwrap();
        buf.free(a).unwrap();
        let b = buf.allocate(32).unwrap();
        assert_eq!(buf.read(b).unwrap(), &[0; 32]);
    }

    #[test]
    fn test_grows_on_out_of_space() {
        let mut buf = buffer(64, 1024, 0);
        let a = buf.allocate(48).unwrap();
        buf.write(a, 0, &[7; 48]).unwrap();
        let b = buf.allocate(48).unwrap();
        assert_eq!(buf.capacity(), 128);
        assert_eq!(buf.chunk(b).unwrap(), Chunk { offset: 48, range: 48 });
        assert_eq!(buf.read(a).unwrap(), &[7; 48]);
        buf.tree().validate(buf.root()).unwrap();
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut buf = buffer(64, 64, 0);
        let err = buf.allocate(100).unwrap_err();
        assert!(err.is_out_of_space());
        assert!(matches!(
            err,
            BufferError::CapacityExceeded {
                required: 164,
                max: 64
            }
        ));
        assert_eq!(buf.capacity(), 64);
    }

    #[test]
    fn test_oversized_requests() {
        let mut buf = buffer(256, 1024, 16);
        let err = buf.allocate(u64::MAX - 5).unwrap_err();
        assert!(matches!(
            err,
            BufferError::CapacityExceeded {
                required: u64::MAX,
                max: 1024
            }
        ));
        assert!(buf.allocate_aligned(u64::MAX, 0).unwrap_err().is_out_of_space());
        assert_eq!(buf.capacity(), 256);

        let a = buf.allocate(16).unwrap();
        for size in [u64::MAX - 5, u64::MAX] {
            let err = buf.resize(a, size).unwrap_err();
            assert!(err.is_out_of_space(), "{}", err);
        }
        assert_eq!(buf.chunk(a).unwrap(), Chunk { offset: 0, range: 16 });
        assert_eq!(buf.stats().unwrap().free, 240);
        buf.tree().validate(buf.root()).unwrap();
    }

    #[test]
    fn test_nested_arena_does_not_grow() {
        let mut buf = buffer(256, 1024, 0);
        let mesh = buf.allocate(64).unwrap();
        buf.allocate_in(mesh, 64).unwrap();
        let err = buf.allocate_in(mesh, 1).unwrap_err();
        assert!(matches!(err, BufferError::Alloc(ChunkError::OutOfSpace { .. })));
        assert_eq!(buf.capacity(), 256);
    }

    #[test]
    fn test_relocation_keeps_payload() {
        let mut buf = buffer(256, 256, 0);
        let a = buf.allocate(16).unwrap();
        let _b = buf.allocate(16).unwrap();
        let payload: Vec<u8> = (1..=16).collect();
        buf.write(a, 0, &payload).unwrap();
        buf.drain_dirty();

        let resize = buf.resize(a, 32).unwrap();
        assert_eq!(resize.previous_offset(), Some(0));
        let chunk = buf.chunk(a).unwrap();
        assert_eq!(chunk, Chunk { offset: 32, range: 32 });
        assert_eq!(&buf.read(a).unwrap()[..16], &payload[..]);
        assert_eq!(&buf.read(a).unwrap()[16..], &[0; 16]);
        assert_eq!(buf.drain_dirty(), vec![32..64]);
    }

    #[test]
    fn test_resize_compacts_before_growing() {
        let mut buf = buffer(100, 100, 0);
        let a = buf.allocate(30).unwrap();
        let b = buf.allocate(30).unwrap();
        let c = buf.allocate(30).unwrap();
        buf.write(a, 0, &[0xa; 30]).unwrap();
        buf.write(c, 0, &[0xc; 30]).unwrap();
        buf.free(b).unwrap();

        let resize = buf.resize(c, 70).unwrap();
        assert_eq!(
            resize,
            Resize::Relocated {
                previous_offset: 60,
                previous_range: 30
            }
        );
        assert_eq!(buf.capacity(), 100);
        assert_eq!(buf.chunk(c).unwrap(), Chunk { offset: 30, range: 70 });
        assert_eq!(&buf.read(c).unwrap()[..30], &[0xc; 30]);
        assert_eq!(&buf.read(c).unwrap()[30..], &[0; 40]);
        assert_eq!(buf.read(a).unwrap(), &[0xa; 30]);
        assert!(buf.tree().free_ranges(buf.root()).unwrap().is_empty());
    }

    #[test]
    fn test_resize_grows_when_compaction_is_not_enough() {
        let mut buf = buffer(100, 1000, 0);
        let _a = buf.allocate(30).unwrap();
        let _b = buf.allocate(30).unwrap();
        let c = buf.allocate(30).unwrap();
        buf.write(c, 0, &[0xc; 30]).unwrap();

        let resize = buf.resize(c, 200).unwrap();
        assert_eq!(resize, Resize::Extended { previous_range: 30 });
        assert_eq!(buf.capacity(), 300);
        assert_eq!(buf.chunk(c).unwrap(), Chunk { offset: 60, range: 200 });
        assert_eq!(&buf.read(c).unwrap()[..30], &[0xc; 30]);
        buf.tree().validate(buf.root()).unwrap();
    }

    #[test]
    fn test_defragment_moves_payloads_down() {
        let mut buf = buffer(256, 256, 16);
        let a = buf.allocate(16).unwrap();
        let c = buf.allocate(32).unwrap();
        let d = buf.allocate(16).unwrap();
        buf.write(a, 0, &[0xa; 16]).unwrap();
        buf.write(c, 0, &[0xc; 32]).unwrap();
        buf.write(d, 0, &[0xd; 16]).unwrap();
        buf.free(a).unwrap();
        buf.drain_dirty();

        let relocations = buf.defragment().unwrap();
        assert_eq!(relocations.len(), 2);
        assert_eq!(buf.chunk(c).unwrap().offset, 0);
        assert_eq!(buf.chunk(d).unwrap().offset, 32);
        assert_eq!(buf.read(c).unwrap(), &[0xc; 32]);
        assert_eq!(buf.read(d).unwrap(), &[0xd; 16]);
        assert_eq!(buf.drain_dirty(), vec![0..48]);
    }

    #[test]
    fn test_defragment_moves_overlapping_payload_up() {
        let mut buf = buffer(256, 256, 16);
        let x = buf.allocate_aligned(10, 0).unwrap();
        let y = buf.allocate_aligned(16, 0).unwrap();
        assert_eq!(buf.chunk(y).unwrap().offset, 10);
        let payload: Vec<u8> = (100..116).collect();
        buf.write(y, 0, &payload).unwrap();

        buf.defragment().unwrap();
        assert_eq!(buf.chunk(x).unwrap().offset, 0);
        assert_eq!(buf.chunk(y).unwrap().offset, 16);
        assert_eq!(buf.read(y).unwrap(), &payload[..]);
    }

    #[test]
    fn test_defragment_keeps_requested_alignment() {
        let mut buf = buffer(1024, 1024, 16);
        let _x = buf.allocate(16).unwrap();
        let a = buf.allocate(16).unwrap();
        let b = buf.allocate_aligned(256, 256).unwrap();
        assert_eq!(buf.chunk(b).unwrap().offset, 256);
        buf.free(a).unwrap();
        assert!(buf.defragment().unwrap().is_empty());
        assert_eq!(buf.chunk(b).unwrap(), Chunk { offset: 256, range: 256 });

        let mut buf = buffer(1024, 1024, 16);
        let x = buf.allocate(16).unwrap();
        let y = buf.allocate(288).unwrap();
        let b = buf.allocate_aligned(256, 256).unwrap();
        assert_eq!(buf.chunk(b).unwrap().offset, 512);
        buf.write(b, 0, &[0xb; 256]).unwrap();
        buf.free(y).unwrap();

        let relocations = buf.defragment().unwrap();
        assert_eq!(relocations.len(), 1);
        assert_eq!(buf.chunk(x).unwrap().offset, 0);
        assert_eq!(buf.chunk(b).unwrap(), Chunk { offset: 256, range: 256 });
        assert_eq!(buf.read(b).unwrap(), &[0xb; 256]);
        assert_eq!(
            buf.tree().free_ranges(buf.root()).unwrap(),
            &[
                FreeRange::new(16, 240),
                FreeRange::new(512, 512)
            ]
        );
        buf.tree().validate(buf.root()).unwrap();
    }

    #[test]
    fn test_nested_payload_follows_parent() {
        let mut buf = buffer(256, 256, 0);
        let mesh = buf.allocate(64).unwrap();
        let lod = buf.allocate_in(mesh, 16).unwrap();
        buf.write(lod, 0, b"level of detail!").unwrap();
        let _blocker = buf.allocate(64).unwrap();

        assert!(buf.resize(mesh, 128).unwrap().relocated());
        assert_eq!(buf.chunk(lod).unwrap().offset, 128);
        assert_eq!(buf.read(lod).unwrap(), b"level of detail!");

        buf.free(lod).unwrap();
        assert!(matches!(
            buf.read(lod),
            Err(BufferError::Alloc(ChunkError::InvalidHandle(_)))
        ));
    }

    #[test]
    fn test_root_is_not_a_chunk() {
        let mut buf = buffer(64, 64, 0);
        let root = buf.root();
        assert!(matches!(
            buf.free(root),
            Err(BufferError::Alloc(ChunkError::InvalidHandle(_)))
        ));
        assert!(buf.resize(root, 10).is_err());
    }

    /// Mirrors every chunk's contents in a side table and checks the buffer
    /// against it through random allocation, writes, resizes, frees and
    /// compaction.
    #[test]
    fn test_random_operations_keep_payloads() {
        let mut rng = StdRng::seed_from_u64(0xd057);
        let mut buf = buffer(4096, 1 << 20, 16);
        let mut shadow: HashMap<ChunkHandle, Vec<u8>> = HashMap::new();

        for step in 0..1500 {
            let mut handles: Vec<ChunkHandle> = shadow.keys().copied().collect();
            handles.sort();
            match rng.gen_range(0..10) {
                0..=2 => {
                    let size = rng.gen_range(1..512);
                    let handle = buf.allocate(size).unwrap();
                    let range = buf.chunk(handle).unwrap().range;
                    shadow.insert(handle, vec![0; range as usize]);
                }
                3..=4 if !handles.is_empty() => {
                    let handle = *handles.choose(&mut rng).unwrap();
                    let contents = shadow.get_mut(&handle).unwrap();
                    let offset = rng.gen_range(0..contents.len());
                    let len = rng.gen_range(0..=contents.len() - offset);
                    let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                    buf.write(handle, offset as u64, &bytes).unwrap();
                    contents[offset..offset + len].copy_from_slice(&bytes);
                }
                5..=6 if !handles.is_empty() => {
                    let handle = *handles.choose(&mut rng).unwrap();
                    buf.resize(handle, rng.gen_range(1..1024))
                        .unwrap_or_else(|err| panic!("step {}: {}", step, err));
                    let range = buf.chunk(handle).unwrap().range;
                    shadow.get_mut(&handle).unwrap().resize(range as usize, 0);
                }
                7..=8 if !handles.is_empty() => {
                    let handle = *handles.choose(&mut rng).unwrap();
                    buf.free(handle).unwrap();
                    shadow.remove(&handle);
                }
                _ => {
                    buf.defragment().unwrap();
                }
            }
            for (handle, contents) in shadow.iter() {
                assert_eq!(buf.read(*handle).unwrap(), &contents[..], "step {}", step);
            }
            buf.tree().validate(buf.root()).unwrap();
        }
        assert!(buf.capacity() <= buf.config().max_size);
    }
}
