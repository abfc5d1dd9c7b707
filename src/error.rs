use dust_chunk_alloc::ChunkError;

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("allocator error: {0}")]
    Alloc(#[from] ChunkError),
    #[error("access of {len} bytes at {offset} overruns a chunk of {range} bytes")]
    OutOfBounds { offset: u64, len: u64, range: u64 },
    #[error("buffer would need {required} bytes, over the {max} byte limit")]
    CapacityExceeded { required: u64, max: u64 },
    #[error("invalid config: {0}")]
    Config(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BufferError {
    /// Whether the request failed only for lack of room, i.e. dropping the
    /// allocation is a reasonable fallback.
    pub fn is_out_of_space(&self) -> bool {
        match self {
            BufferError::Alloc(err) => err.is_out_of_space(),
            BufferError::CapacityExceeded { .. } => true,
            _ => false,
        }
    }
}
