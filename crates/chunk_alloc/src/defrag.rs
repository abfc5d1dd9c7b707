use crate::free_list::{align_to, FreeRange};
use crate::{ChunkError, ChunkHandle, ChunkResult, ChunkTree};

/// A chunk moved or resized by [`ChunkTree::defragment`].
///
/// The tree already reflects `offset`/`range`; the payload is still at
/// `previous_offset` until the owner of the backing storage copies it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Relocation {
    pub chunk: ChunkHandle,
    pub previous_offset: u64,
    pub offset: u64,
    pub previous_range: u64,
    pub range: u64,
}

impl Relocation {
    /// Number of payload bytes that survive the move.
    pub fn copy_len(&self) -> u64 {
        self.previous_range.min(self.range)
    }
    pub fn moved(&self) -> bool {
        self.previous_offset != self.offset
    }
}

impl ChunkTree {
    /// Repacks the children of `arena` contiguously from its start, keeping
    /// their relative order and rounding each placement up to `alignment`.
    ///
    /// A child never moves by a distance that would break the alignment a
    /// chunk in its subtree was reserved with. When that alignment and
    /// `alignment` cannot both hold at one offset, the reserved one wins.
    ///
    /// `extend` optionally names a child to be placed after all the others
    /// and grown by the given number of bytes in the same pass; it is always
    /// reported in the returned relocations. Every other child is reported
    /// only if its offset changed.
    ///
    /// The layout is planned before anything is touched, so any failure
    /// leaves the arena exactly as it was.
    pub fn defragment(
        &mut self,
        arena: ChunkHandle,
        alignment: u64,
        extend: Option<(ChunkHandle, u64)>,
    ) -> ChunkResult<Vec<Relocation>> {
        let node = self.node(arena)?;
        let (base, end) = (node.offset, node.end());
        let (children, free) = match &node.arena {
            Some(state) if !state.children.is_empty() => {
                (state.children.clone(), state.free_ranges.total())
            }
            _ => {
                if let Some((target, _)) = extend {
                    return Err(ChunkError::DefragmentationInfeasible(format!(
                        "{:?} has no children, cannot extend {:?}",
                        arena, target
                    )));
                }
                return Ok(Vec::new());
            }
        };

        let (target, extension) = match extend {
            Some((target, extension)) => (Some(target), extension),
            None => (None, 0),
        };
        if let Some(target) = target {
            if !children.contains(&target) {
                return Err(ChunkError::DefragmentationInfeasible(format!(
                    "{:?} is not a child of {:?}",
                    target, arena
                )));
            }
        }
        if extension > free {
            return Err(ChunkError::DefragmentationInfeasible(format!(
                "extension of {} bytes exceeds {} free bytes",
                extension, free
            )));
        }

        let mut ordered = children
            .iter()
            .map(|&chunk| {
                let node = self.node(chunk)?;
                Ok((chunk, node.offset, node.range))
            })
            .collect::<ChunkResult<Vec<_>>>()?;
        ordered.sort_by_key(|&(_, offset, _)| offset);
        if let Some(position) = ordered
            .iter()
            .position(|&(chunk, _, _)| Some(chunk) == target)
        {
            let entry = ordered.remove(position);
            ordered.push(entry);
        }

        let overflow = || {
            ChunkError::DefragmentationInfeasible(format!(
                "packed layout of {:?} overflows the address space",
                arena
            ))
        };
        let mut cursor = base;
        let mut free_ranges = Vec::new();
        let mut relocations = Vec::new();
        for (chunk, offset, range) in ordered {
            let (modulus, residue) = self.placement(chunk, alignment)?.ok_or_else(overflow)?;
            let placed = align_to(cursor, modulus, residue).ok_or_else(overflow)?;
            if placed > cursor {
                free_ranges.push(FreeRange::new(cursor, placed - cursor));
            }
            let is_target = Some(chunk) == target;
            let new_range = if is_target {
                range.checked_add(extension).ok_or_else(overflow)?
            } else {
                range
            };
            if placed != offset || is_target {
                relocations.push(Relocation {
                    chunk,
                    previous_offset: offset,
                    offset: placed,
                    previous_range: range,
                    range: new_range,
                });
            }
            cursor = placed.checked_add(new_range).ok_or_else(overflow)?;
        }
        if cursor > end {
            return Err(ChunkError::DefragmentationInfeasible(format!(
                "packed layout needs {} bytes but {:?} holds {}",
                cursor - base,
                arena,
                end - base
            )));
        }
        if cursor < end {
            free_ranges.push(FreeRange::new(cursor, end - cursor));
        }

        for relocation in relocations.iter() {
            self.relocate(relocation.chunk, relocation.offset)?;
            if relocation.range != relocation.previous_range {
                self.set_range(relocation.chunk, relocation.range)?;
            }
        }
        let fragments = free_ranges.len();
        self.arena_state_mut(arena)?.free_ranges.replace(free_ranges);
        tracing::debug!(
            ?arena,
            moved = relocations.len(),
            fragments,
            extension,
            "defragmented arena"
        );
        Ok(relocations)
    }
}
