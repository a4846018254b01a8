//! Raw messages and per-partition poll results.

use std::collections::BTreeMap;

/// Longest payload excerpt written to logs for a dropped message.
const PREVIEW_BYTES: usize = 512;

/// A Kafka message as handed to the decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Topic name
    pub topic: String,

    /// Partition number
    pub partition: i32,

    /// Offset within the partition
    pub offset: i64,

    /// Broker or producer timestamp (milliseconds since epoch)
    pub timestamp: Option<i64>,

    /// Message key (optional)
    pub key: Option<Vec<u8>>,

    /// Message payload (absent for tombstones)
    pub payload: Option<Vec<u8>>,
}

impl RawMessage {
    /// Create a message with a payload and no key.
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            timestamp: None,
            key: None,
            payload: Some(payload.into()),
        }
    }

    /// Payload bytes, empty for tombstones.
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    /// Lossy, truncated payload text for logs.
    pub fn payload_preview(&self) -> String {
        let bytes = self.payload_bytes();
        let cut = bytes.len().min(PREVIEW_BYTES);
        let mut text = String::from_utf8_lossy(&bytes[..cut]).into_owned();
        if bytes.len() > cut {
            text.push_str("...");
        }
        text
    }
}

/// Messages returned by one poll call, grouped by partition.
///
/// Within a partition messages keep offset order. Across partitions there is
/// no ordering guarantee.
#[derive(Debug, Default, Clone)]
pub struct PollBatch {
    partitions: BTreeMap<i32, Vec<RawMessage>>,
}

impl PollBatch {
    /// Create an empty poll result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message to its partition group.
    pub fn push(&mut self, msg: RawMessage) {
        self.partitions.entry(msg.partition).or_default().push(msg);
    }

    /// Whether nothing arrived.
    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(Vec::is_empty)
    }

    /// Total message count across partitions.
    pub fn len(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }

    /// Partitions that delivered at least one message.
    pub fn partitions(&self) -> impl Iterator<Item = i32> + '_ {
        self.partitions
            .iter()
            .filter(|(_, msgs)| !msgs.is_empty())
            .map(|(p, _)| *p)
    }

    /// Messages for one partition.
    pub fn messages(&self, partition: i32) -> &[RawMessage] {
        self.partitions
            .get(&partition)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

impl FromIterator<RawMessage> for PollBatch {
    fn from_iter<I: IntoIterator<Item = RawMessage>>(iter: I) -> Self {
        let mut batch = PollBatch::new();
        for msg in iter {
            batch.push(msg);
        }
        batch
    }
}

impl IntoIterator for PollBatch {
    type Item = RawMessage;
    type IntoIter = std::iter::Flatten<std::collections::btree_map::IntoValues<i32, Vec<RawMessage>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.partitions.into_values().flatten()
    }
}
