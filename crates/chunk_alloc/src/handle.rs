/// A generation-checked reference to a chunk owned by a [`ChunkTree`](crate::ChunkTree).
///
/// Handles are plain values: copying one never extends the lifetime of the
/// chunk it names. Once the chunk is freed its slot generation moves on and
/// every lookup through an old handle fails instead of aliasing whatever
/// chunk reuses the slot.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ChunkHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ChunkHandle {
    pub const fn none() -> Self {
        ChunkHandle {
            index: u32::MAX,
            generation: 0,
        }
    }
    #[inline]
    pub fn is_none(&self) -> bool {
        self.index == u32::MAX
    }
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        ChunkHandle { index, generation }
    }
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Default for ChunkHandle {
    fn default() -> Self {
        Self::none()
    }
}

impl std::fmt::Debug for ChunkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        if self.is_none() {
            return f.write_str("ChunkHandle(none)");
        }
        f.write_fmt(format_args!(
            "ChunkHandle({:?}v{:?})",
            self.index, self.generation
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none() {
        let handle = ChunkHandle::none();
        assert!(handle.is_none());
        assert_eq!(handle, ChunkHandle::default());
        assert!(!ChunkHandle::new(0, 0).is_none());
    }

    #[test]
    fn test_generation_distinguishes() {
        let a = ChunkHandle::new(3, 1);
        let b = ChunkHandle::new(3, 2);
        assert_ne!(a, b);
        assert_eq!((a.index, a.generation), (3, 1));
        assert_eq!(format!("{:?}", b), "ChunkHandle(3v2)");
    }
}
