//! The capability the pipeline needs from a message queue.

use super::PollBatch;
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// A topic whose partitions are all owned by this pipeline.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Topic being consumed.
    fn topic(&self) -> &str;

    /// Partitions assigned at startup.
    fn partitions(&self) -> &[i32];

    /// Wait at most `timeout` and return whatever arrived, possibly nothing.
    async fn poll(&mut self, timeout: Duration) -> Result<PollBatch>;

    /// Move every partition back to its earliest available offset.
    fn rewind(&mut self) -> Result<()>;
}
