use std::io;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("topic '{topic}' does not exist")]
    TopicNotFound { topic: String },

    #[error("invalid topic name '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: &'static str },

    #[error("region '{name}' has capacity {actual} bytes, requested {requested}")]
    CapacityMismatch {
        name: String,
        requested: u64,
        actual: u64,
    },

    #[error("invalid capacity {capacity} bytes: {reason}")]
    InvalidCapacity { capacity: usize, reason: &'static str },

    #[error("payload of {len} bytes exceeds the usable ring capacity of {max} bytes")]
    BufferTooSmall { len: usize, max: usize },

    #[error("sequence {requested} was overwritten, oldest available is {oldest}")]
    SequenceTooOld { requested: u64, oldest: u64 },

    #[error("region '{name}' is not a valid topic region: {reason}")]
    InvalidLayout { name: String, reason: &'static str },

    #[error("topic '{topic}' already has a live publisher (pid {pid})")]
    PublisherExists { topic: String, pid: u32 },

    #[error("out of shared resources for '{name}'")]
    ResourceExhausted {
        name: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("timed out after {waited:?} waiting for '{name}'")]
    Timeout { name: String, waited: Duration },

    #[error("{op} failed for '{name}'")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },
}

impl BusError {
    /// Classifies an OS failure: allocation-type errnos become
    /// [`BusError::ResourceExhausted`], everything else [`BusError::Os`].
    pub(crate) fn os(op: &'static str, name: &str, source: io::Error) -> Self {
        match source.raw_os_error() {
            Some(libc::ENOMEM | libc::ENOSPC | libc::EMFILE | libc::ENFILE | libc::EAGAIN) => {
                Self::ResourceExhausted {
                    name: name.to_owned(),
                    source: Some(source),
                }
            }
            _ => Self::Os {
                op,
                name: name.to_owned(),
                source,
            },
        }
    }
}
