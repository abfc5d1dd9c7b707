use crate::free_list::align_up;
use crate::{ChunkError, ChunkHandle, ChunkResult, ChunkTree};

/// What [`ChunkTree::resize_child`] did to the chunk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resize {
    /// The requested size did not change the chunk.
    Unchanged,
    /// The tail was trimmed and returned to the arena.
    Shrunk { previous_range: u64 },
    /// The chunk grew into the free space right after it.
    Extended { previous_range: u64 },
    /// The chunk moved. Its payload is still at `previous_offset` and must be
    /// copied to the chunk's new offset by whoever owns the backing storage.
    Relocated {
        previous_offset: u64,
        previous_range: u64,
    },
}

impl Resize {
    pub fn relocated(&self) -> bool {
        matches!(self, Resize::Relocated { .. })
    }
    pub fn previous_offset(&self) -> Option<u64> {
        match self {
            Resize::Relocated {
                previous_offset, ..
            } => Some(*previous_offset),
            _ => None,
        }
    }
}

impl ChunkTree {
    /// Resizes `child`, a direct child of `arena`.
    ///
    /// Shrinking trims the tail. Growing first tries to extend into the free
    /// range right after the child, then falls back to reserving the full new
    /// size elsewhere in the arena. On failure nothing changes.
    pub fn resize_child(
        &mut self,
        arena: ChunkHandle,
        child: ChunkHandle,
        new_size: u64,
        alignment: u64,
    ) -> ChunkResult<Resize> {
        if new_size == 0 {
            return Err(ChunkError::ZeroSize);
        }
        self.child_position(arena, child)?;
        let range = self.node(child)?.range;
        let Some(rounded) = align_up(new_size, alignment) else {
            return Err(self.out_of_space(arena, new_size));
        };

        if rounded < range {
            self.shrink_child(arena, child, rounded)?;
            return Ok(Resize::Shrunk {
                previous_range: range,
            });
        }
        if new_size <= range {
            return Ok(Resize::Unchanged);
        }
        if self.extend_child(arena, child, new_size - range, alignment)? {
            return Ok(Resize::Extended {
                previous_range: range,
            });
        }
        let previous_offset = self.move_child(arena, child, rounded, alignment)?;
        Ok(Resize::Relocated {
            previous_offset,
            previous_range: range,
        })
    }

    /// Grows `child` in place by `extra` bytes (rounded up to `alignment`),
    /// consuming the free range that starts exactly at the child's end.
    ///
    /// Returns `Ok(false)` without changing anything when that free range is
    /// missing or too small, and `OutOfSpace` when the rounded size does not
    /// fit in a `u64`.
    pub fn extend_child(
        &mut self,
        arena: ChunkHandle,
        child: ChunkHandle,
        extra: u64,
        alignment: u64,
    ) -> ChunkResult<bool> {
        self.child_position(arena, child)?;
        let Some(extra) = align_up(extra, alignment) else {
            return Err(self.out_of_space(arena, extra));
        };
        if extra == 0 {
            return Ok(true);
        }
        let node = self.node(child)?;
        let (end, range) = (node.end(), node.range);
        let state = self.arena_state_mut(arena)?;
        if state.free_ranges.available_at(end) < extra {
            return Ok(false);
        }
        let carved = state.free_ranges.carve(end, extra);
        debug_assert!(carved);
        self.set_range(child, range + extra)?;
        tracing::trace!(?arena, ?child, extra, "extended chunk in place");
        Ok(true)
    }

    fn shrink_child(
        &mut self,
        arena: ChunkHandle,
        child: ChunkHandle,
        new_range: u64,
    ) -> ChunkResult<()> {
        let node = self.node_mut(child)?;
        let trimmed_at = node.offset + new_range;
        let trimmed = node.range - new_range;
        if let Some(state) = node.arena.as_mut() {
            if !state.free_ranges.carve(trimmed_at, trimmed) {
                return Err(ChunkError::TailInUse {
                    child,
                    required: new_range,
                });
            }
        }
        node.range = new_range;
        self.arena_state_mut(arena)?
            .free_ranges
            .release(trimmed_at, trimmed);
        tracing::trace!(?arena, ?child, trimmed, "shrunk chunk");
        Ok(())
    }

    /// Reserves `new_range` bytes elsewhere in `arena`, moves `child` there and
    /// releases its old location. Returns the previous offset.
    ///
    /// The new location is chosen so that every chunk reserved inside `child`
    /// keeps its alignment.
    fn move_child(
        &mut self,
        arena: ChunkHandle,
        child: ChunkHandle,
        new_range: u64,
        alignment: u64,
    ) -> ChunkResult<u64> {
        let node = self.node(child)?;
        let (previous_offset, previous_range) = (node.offset, node.range);
        let Some((modulus, residue)) = self.placement(child, alignment)? else {
            return Err(self.out_of_space(arena, new_range));
        };
        let fit = self
            .arena_state_mut(arena)?
            .free_ranges
            .first_fit(new_range, modulus, residue);
        let Some(fit) = fit else {
            return Err(self.out_of_space(arena, new_range));
        };
        let state = self.arena_state_mut(arena)?;
        state.free_ranges.take(fit, new_range);
        state.free_ranges.release(previous_offset, previous_range);

        self.relocate(child, fit.offset)?;
        self.set_range(child, new_range)?;
        tracing::debug!(
            ?arena,
            ?child,
            previous_offset,
            offset = fit.offset,
            range = new_range,
            "relocated chunk"
        );
        Ok(previous_offset)
    }

    /// Grows a chunk's range. A subdivided chunk receives the new tail bytes
    /// as free space.
    pub(crate) fn set_range(&mut self, handle: ChunkHandle, new_range: u64) -> ChunkResult<()> {
        let node = self.node_mut(handle)?;
        debug_assert!(new_range >= node.range);
        let old_end = node.end();
        let extra = new_range - node.range;
        node.range = new_range;
        if let Some(state) = node.arena.as_mut() {
            state.free_ranges.release(old_end, extra);
        }
        Ok(())
    }
}
