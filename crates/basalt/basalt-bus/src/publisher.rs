use crate::error::Result;
use crate::topic::Topic;
use std::sync::Arc;

/// Publishing handle for one topic.
///
/// With exclusive publishing (the default), the first handle in a process
/// claims the topic for that process and the last one dropped releases the
/// claim; handles in other processes fail with
/// [`BusError::PublisherExists`](crate::BusError::PublisherExists) while the
/// claiming process lives. Without it, writers from any number of processes
/// are serialized by the topic's writer exclusion.
pub struct Publisher {
    topic: Arc<Topic>,
    exclusive: bool,
}

impl Publisher {
    pub(crate) fn new(topic: Arc<Topic>, exclusive: bool) -> Result<Self> {
        if exclusive {
            topic.claim_writer()?;
        }
        Ok(Self { topic, exclusive })
    }

    /// Publishes one message and returns its sequence number. Never waits for
    /// subscribers: the oldest messages are overwritten when the ring is full.
    pub fn publish(&mut self, payload: &[u8]) -> Result<u64> {
        self.topic.write_frame(payload)
    }

    #[inline]
    pub fn topic(&self) -> &Arc<Topic> {
        &self.topic
    }

    #[inline]
    pub fn max_payload(&self) -> usize {
        self.topic.max_payload()
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if self.exclusive {
            self.topic.release_writer();
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.topic.name())
            .field("exclusive", &self.exclusive)
            .finish()
    }
}
