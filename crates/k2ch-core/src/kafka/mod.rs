//! Kafka queue adapter: partition discovery, manual assignment, bounded polling.

mod consumer;
mod message;
mod offset;
mod source;

pub use consumer::KafkaSource;
pub use message::{PollBatch, RawMessage};
pub use offset::OffsetTracker;
pub use source::MessageSource;
