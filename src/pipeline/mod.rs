pub mod handoff;
pub mod pool;
#[cfg(test)]
pub(crate) mod testing;

pub use handoff::{
    HandoffPipeline, PipelineEvent, PipelineHandle, PipelineOptions, PipelineState, PipelineStats,
};
pub use pool::{Buffer, BufferAllocator, BufferId, BufferPool, Census, Ownership};
