pub mod manager;
pub mod pacer;
pub mod types;

pub use manager::{StreamManager, StreamPhase, StreamRenderer};
pub use pacer::{ChunkQueue, PacerHandle};
pub use types::{normalize_chunk, ChunkPayload, StreamEvent};
