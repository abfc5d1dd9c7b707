use smallvec::SmallVec;
use std::ops::Range;

use crate::free_list::{align_up, congruence, lcm, FreeList, FreeRange};
use crate::{ChunkError, ChunkHandle, ChunkResult};

/// Snapshot of a chunk's placement.
///
/// This is a copy. It goes stale as soon as the owning arena is mutated, so
/// callers re-read it through [`ChunkTree::chunk`] after every resize or
/// defragmentation before doing byte-level I/O.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub offset: u64,
    pub range: u64,
}

impl Chunk {
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.range
    }
    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.end()
    }
}

/// Space accounting summary for one arena.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub capacity: u64,
    pub used: u64,
    pub free: u64,
    pub fragments: usize,
    pub largest_free: u64,
}

impl ArenaStats {
    /// 0.0 when the free space is one contiguous run (or there is none),
    /// approaching 1.0 as free space gets scattered.
    pub fn fragmentation(&self) -> f32 {
        if self.free == 0 {
            return 0.0;
        }
        1.0 - (self.largest_free as f32 / self.free as f32)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ArenaState {
    pub(crate) free_ranges: FreeList,
    pub(crate) children: Vec<ChunkHandle>,
}

impl ArenaState {
    fn new(offset: u64, range: u64) -> Self {
        Self {
            free_ranges: FreeList::spanning(offset, range),
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ChunkNode {
    pub(crate) offset: u64,
    pub(crate) range: u64,
    pub(crate) parent: Option<ChunkHandle>,
    /// Alignment the chunk was reserved with, at least 1. Moves never break it.
    pub(crate) alignment: u64,
    /// `None` until the chunk is first used as an arena.
    pub(crate) arena: Option<ArenaState>,
}

impl ChunkNode {
    fn leaf(offset: u64, range: u64, parent: Option<ChunkHandle>, alignment: u64) -> Self {
        Self {
            offset,
            range,
            parent,
            alignment: alignment.max(1),
            arena: None,
        }
    }
    pub(crate) fn end(&self) -> u64 {
        self.offset + self.range
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<ChunkNode>,
}

/// Owner of every chunk record.
///
/// Roots are created with [`ChunkTree::create_root`]; every other chunk is
/// carved out of an ancestor with [`ChunkTree::reserve_range`]. Any chunk can
/// host sub-reservations: the first reservation against it turns it into an
/// arena whose free list spans its whole range.
#[derive(Debug, Default)]
pub struct ChunkTree {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    len: usize,
}

impl ChunkTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tree holding a single root of `range` bytes at offset 0.
    pub fn with_root(range: u64) -> ChunkResult<(Self, ChunkHandle)> {
        let mut tree = Self::new();
        let root = tree.create_root(range)?;
        Ok((tree, root))
    }

    pub fn create_root(&mut self, range: u64) -> ChunkResult<ChunkHandle> {
        if range == 0 {
            return Err(ChunkError::ZeroSize);
        }
        let root = self.insert(ChunkNode::leaf(0, range, None, 1));
        tracing::debug!(?root, range, "created root chunk");
        Ok(root)
    }

    /// Tears down a root and everything reserved inside it.
    pub fn destroy_root(&mut self, root: ChunkHandle) -> ChunkResult<()> {
        if self.node(root)?.parent.is_some() {
            return Err(ChunkError::NotARoot(root));
        }
        self.remove_subtree(root)?;
        Ok(())
    }

    /// Extends a root by `extra` bytes at its tail, e.g. after the backing
    /// store behind it has been reallocated with a larger size. Returns the
    /// new range.
    pub fn grow_root(&mut self, root: ChunkHandle, extra: u64) -> ChunkResult<u64> {
        let node = self.node(root)?;
        if node.parent.is_some() {
            return Err(ChunkError::NotARoot(root));
        }
        let (offset, old_end) = (node.offset, node.end());
        let Some(new_end) = old_end.checked_add(extra) else {
            return Err(self.out_of_space(root, extra));
        };
        let node = self.node_mut(root)?;
        node.range = new_end - offset;
        if let Some(state) = node.arena.as_mut() {
            state.free_ranges.release(old_end, extra);
        }
        tracing::info!(?root, extra, range = node.range, "grew root chunk");
        Ok(node.range)
    }

    /// Number of live chunks, roots included.
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, handle: ChunkHandle) -> bool {
        self.node(handle).is_ok()
    }
    pub fn chunk(&self, handle: ChunkHandle) -> ChunkResult<Chunk> {
        let node = self.node(handle)?;
        Ok(Chunk {
            offset: node.offset,
            range: node.range,
        })
    }
    pub fn offset(&self, handle: ChunkHandle) -> ChunkResult<u64> {
        Ok(self.node(handle)?.offset)
    }
    pub fn range(&self, handle: ChunkHandle) -> ChunkResult<u64> {
        Ok(self.node(handle)?.range)
    }
    pub fn parent(&self, handle: ChunkHandle) -> ChunkResult<Option<ChunkHandle>> {
        Ok(self.node(handle)?.parent)
    }
    /// Alignment the chunk was reserved with (1 for roots and unaligned
    /// reservations).
    pub fn alignment(&self, handle: ChunkHandle) -> ChunkResult<u64> {
        Ok(self.node(handle)?.alignment)
    }
    /// Whether the chunk has ever been subdivided.
    pub fn is_arena(&self, handle: ChunkHandle) -> ChunkResult<bool> {
        Ok(self.node(handle)?.arena.is_some())
    }
    pub fn children(&self, handle: ChunkHandle) -> ChunkResult<&[ChunkHandle]> {
        Ok(self
            .node(handle)?
            .arena
            .as_ref()
            .map_or(&[][..], |state| &state.children[..]))
    }
    /// Free entries of an arena. Empty both for a fully reserved arena and for
    /// a chunk that was never subdivided; use [`ChunkTree::is_arena`] to tell
    /// them apart.
    pub fn free_ranges(&self, handle: ChunkHandle) -> ChunkResult<&[FreeRange]> {
        Ok(self
            .node(handle)?
            .arena
            .as_ref()
            .map_or(&[][..], |state| state.free_ranges.entries()))
    }

    pub fn stats(&self, handle: ChunkHandle) -> ChunkResult<ArenaStats> {
        let node = self.node(handle)?;
        let stats = match &node.arena {
            Some(state) => {
                let free = state.free_ranges.total();
                ArenaStats {
                    capacity: node.range,
                    used: node.range - free,
                    free,
                    fragments: state.free_ranges.len(),
                    largest_free: state.free_ranges.largest(),
                }
            }
            None => ArenaStats {
                capacity: node.range,
                used: 0,
                free: node.range,
                fragments: 1,
                largest_free: node.range,
            },
        };
        Ok(stats)
    }

    /// Reserves `size` bytes inside `arena`, first-fit.
    ///
    /// The size is rounded up to `alignment` and the returned chunk starts at
    /// an absolute offset that is a multiple of `alignment` (0 means
    /// unaligned).
    pub fn reserve_range(
        &mut self,
        arena: ChunkHandle,
        size: u64,
        alignment: u64,
    ) -> ChunkResult<ChunkHandle> {
        if size == 0 {
            return Err(ChunkError::ZeroSize);
        }
        let Some(size) = align_up(size, alignment) else {
            return Err(self.out_of_space(arena, size));
        };
        let node = self.node(arena)?;
        let fit = match &node.arena {
            Some(state) => state.free_ranges.first_fit(size, alignment, 0),
            None => FreeList::spanning(node.offset, node.range).first_fit(size, alignment, 0),
        };
        let Some(fit) = fit else {
            return Err(self.out_of_space(arena, size));
        };
        self.ensure_arena(arena)?.free_ranges.take(fit, size);

        let child = self.insert(ChunkNode::leaf(fit.offset, size, Some(arena), alignment));
        self.ensure_arena(arena)?.children.push(child);
        tracing::trace!(?arena, ?child, offset = fit.offset, range = size, "reserved chunk");
        Ok(child)
    }

    /// Releases `child` and everything reserved inside it back to `arena`.
    pub fn free_child(&mut self, arena: ChunkHandle, child: ChunkHandle) -> ChunkResult<()> {
        let position = self.child_position(arena, child)?;
        let removed = self.remove_subtree(child)?;
        let state = self.arena_state_mut(arena)?;
        state.children.remove(position);
        state.free_ranges.release(removed.offset, removed.range);
        tracing::trace!(?arena, ?child, offset = removed.offset, range = removed.range, "freed chunk");
        Ok(())
    }

    /// Checks the partition and coalescing invariants of `handle` and every
    /// arena below it.
    pub fn validate(&self, handle: ChunkHandle) -> ChunkResult<()> {
        let mut stack: SmallVec<[ChunkHandle; 8]> = SmallVec::new();
        stack.push(handle);
        while let Some(current) = stack.pop() {
            let node = self.node(current)?;
            let Some(state) = &node.arena else {
                continue;
            };
            let mut spans: Vec<(u64, u64, Option<ChunkHandle>)> = state
                .free_ranges
                .entries()
                .iter()
                .map(|e| (e.offset, e.range, None))
                .collect();
            for &child in state.children.iter() {
                let child_node = self.node(child).map_err(|_| {
                    ChunkError::Corrupted(format!("{:?} lists dead child {:?}", current, child))
                })?;
                if child_node.parent != Some(current) {
                    return Err(ChunkError::Corrupted(format!(
                        "{:?} lists {:?} whose parent is {:?}",
                        current, child, child_node.parent
                    )));
                }
                if child_node.offset % child_node.alignment != 0 {
                    return Err(ChunkError::Corrupted(format!(
                        "{:?} at {} breaks its {}-byte alignment",
                        child, child_node.offset, child_node.alignment
                    )));
                }
                spans.push((child_node.offset, child_node.range, Some(child)));
                stack.push(child);
            }
            spans.sort_by_key(|&(offset, _, _)| offset);

            let mut cursor = node.offset;
            let mut previous_free = false;
            for (offset, range, owner) in spans {
                if range == 0 {
                    return Err(ChunkError::Corrupted(format!(
                        "{:?} holds an empty span at {}",
                        current, offset
                    )));
                }
                if offset != cursor {
                    return Err(ChunkError::Corrupted(format!(
                        "{:?} expected a span at {} but found one at {}",
                        current, cursor, offset
                    )));
                }
                let is_free = owner.is_none();
                if is_free && previous_free {
                    return Err(ChunkError::Corrupted(format!(
                        "{:?} has adjacent free ranges at {}",
                        current, offset
                    )));
                }
                previous_free = is_free;
                cursor = offset + range;
            }
            if cursor != node.end() {
                return Err(ChunkError::Corrupted(format!(
                    "{:?} spans end at {} but the chunk ends at {}",
                    current,
                    cursor,
                    node.end()
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn node(&self, handle: ChunkHandle) -> ChunkResult<&ChunkNode> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.node.as_ref())
            .ok_or(ChunkError::InvalidHandle(handle))
    }

    pub(crate) fn node_mut(&mut self, handle: ChunkHandle) -> ChunkResult<&mut ChunkNode> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.node.as_mut())
            .ok_or(ChunkError::InvalidHandle(handle))
    }

    /// Arena state of a chunk that must already be subdivided.
    pub(crate) fn arena_state_mut(&mut self, handle: ChunkHandle) -> ChunkResult<&mut ArenaState> {
        self.node_mut(handle)?
            .arena
            .as_mut()
            .ok_or(ChunkError::InvalidHandle(handle))
    }

    pub(crate) fn ensure_arena(&mut self, handle: ChunkHandle) -> ChunkResult<&mut ArenaState> {
        let node = self.node_mut(handle)?;
        let (offset, range) = (node.offset, node.range);
        Ok(node
            .arena
            .get_or_insert_with(|| ArenaState::new(offset, range)))
    }

    /// Index of `child` in `arena`'s children, or `InvalidHandle` if either is
    /// stale or `child` belongs elsewhere.
    pub(crate) fn child_position(
        &self,
        arena: ChunkHandle,
        child: ChunkHandle,
    ) -> ChunkResult<usize> {
        if self.node(child)?.parent != Some(arena) {
            return Err(ChunkError::InvalidHandle(child));
        }
        self.node(arena)?
            .arena
            .as_ref()
            .and_then(|state| state.children.iter().position(|&c| c == child))
            .ok_or(ChunkError::InvalidHandle(child))
    }

    pub(crate) fn out_of_space(&self, arena: ChunkHandle, requested: u64) -> ChunkError {
        let (free, fragments) = match self.stats(arena) {
            Ok(stats) => (stats.free, stats.fragments),
            Err(err) => return err,
        };
        ChunkError::OutOfSpace {
            requested,
            free,
            fragments,
        }
    }

    /// Offsets `handle` may be moved to, as `(modulus, residue)`: any offset
    /// congruent to `residue` keeps the alignment of every chunk in its
    /// subtree, and also honours `alignment` when both can hold at once.
    /// Returns `None` if the combined alignment overflows.
    pub(crate) fn placement(
        &self,
        handle: ChunkHandle,
        alignment: u64,
    ) -> ChunkResult<Option<(u64, u64)>> {
        let offset = self.node(handle)?.offset;
        let mut subtree = 1u64;
        let mut stack: SmallVec<[ChunkHandle; 8]> = SmallVec::new();
        stack.push(handle);
        while let Some(current) = stack.pop() {
            let node = self.node(current)?;
            let Some(combined) = lcm(subtree, node.alignment) else {
                return Ok(None);
            };
            subtree = combined;
            if let Some(state) = &node.arena {
                stack.extend(state.children.iter().copied());
            }
        }
        let residue = offset % subtree;
        Ok(Some(
            congruence(subtree, residue, alignment).unwrap_or((subtree, residue)),
        ))
    }

    /// Moves `handle` to `new_offset`, carrying every descendant chunk and
    /// free range along by the same distance.
    pub(crate) fn relocate(&mut self, handle: ChunkHandle, new_offset: u64) -> ChunkResult<()> {
        let old_offset = self.node(handle)?.offset;
        if old_offset == new_offset {
            return Ok(());
        }
        let mut stack: SmallVec<[ChunkHandle; 8]> = SmallVec::new();
        stack.push(handle);
        while let Some(current) = stack.pop() {
            let node = self.node_mut(current)?;
            node.offset = node.offset - old_offset + new_offset;
            if let Some(state) = node.arena.as_mut() {
                state.free_ranges.rebase(old_offset, new_offset);
                stack.extend(state.children.iter().copied());
            }
        }
        Ok(())
    }

    fn insert(&mut self, node: ChunkNode) -> ChunkHandle {
        self.len += 1;
        if let Some(index) = self.free_slots.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.node.is_none());
            slot.node = Some(node);
            return ChunkHandle::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        ChunkHandle::new(index, 0)
    }

    /// Removes `handle` and all of its descendants, returning `handle`'s node.
    fn remove_subtree(&mut self, handle: ChunkHandle) -> ChunkResult<ChunkNode> {
        let removed = self.take_slot(handle)?;
        let mut stack: SmallVec<[ChunkHandle; 8]> = SmallVec::new();
        if let Some(state) = &removed.arena {
            stack.extend(state.children.iter().copied());
        }
        while let Some(current) = stack.pop() {
            let node = self.take_slot(current)?;
            if let Some(state) = node.arena {
                stack.extend(state.children);
            }
        }
        Ok(removed)
    }

    fn take_slot(&mut self, handle: ChunkHandle) -> ChunkResult<ChunkNode> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.node.is_some())
            .ok_or(ChunkError::InvalidHandle(handle))?;
        let node = slot.node.take().ok_or(ChunkError::InvalidHandle(handle))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(handle.index);
        self.len -= 1;
        Ok(node)
    }
}
