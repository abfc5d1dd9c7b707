use crate::ChunkHandle;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("reservation size must be greater than zero")]
    ZeroSize,
    #[error("out of space: need {requested} bytes, {free} free in {fragments} fragments")]
    OutOfSpace {
        requested: u64,
        free: u64,
        fragments: usize,
    },
    /// The handle is stale, or it names a chunk that is not a child of the
    /// arena the call was made against.
    #[error("invalid chunk handle {0:?}")]
    InvalidHandle(ChunkHandle),
    #[error("chunk {0:?} is not a root chunk")]
    NotARoot(ChunkHandle),
    #[error("defragmentation infeasible: {0}")]
    DefragmentationInfeasible(String),
    #[error("cannot shrink {child:?} to {required} bytes: its tail holds live sub-chunks")]
    TailInUse { child: ChunkHandle, required: u64 },
    #[error("chunk tree corrupted: {0}")]
    Corrupted(String),
}

impl ChunkError {
    /// True for failures a caller may recover from by growing the backing
    /// store or defragmenting, then retrying.
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, ChunkError::OutOfSpace { .. })
    }
}

pub type ChunkResult<T> = Result<T, ChunkError>;
