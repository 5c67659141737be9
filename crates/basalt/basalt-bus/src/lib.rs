//! Host-local publish/subscribe over POSIX shared memory.
//!
//! Each topic is one shared-memory object holding a header, a process-shared
//! synchronization block and a byte ring of framed messages. Publishers append
//! under a robust process-shared mutex and wake subscribers through a
//! process-shared condition variable; subscribers read lock-free and keep
//! their own position. When the ring wraps past a slow subscriber it gets a
//! [`PollOutcome::Gap`] instead of the lost messages.
//!
//! ```no_run
//! use basalt_bus::{BusOptions, PollOutcome, StartPosition, TopicRegistry};
//! use std::time::Duration;
//!
//! let registry = TopicRegistry::new(BusOptions::default());
//! let mut publisher = registry.publisher("events")?;
//! let mut subscriber = registry.subscribe("events", StartPosition::Oldest)?;
//!
//! publisher.publish(b"hello")?;
//! if let PollOutcome::Messages(msgs) = subscriber.poll(Duration::from_millis(100))? {
//!     assert_eq!(msgs[0].payload, b"hello");
//! }
//! # Ok::<(), basalt_bus::BusError>(())
//! ```

mod error;
mod frame;
mod options;
mod publisher;
mod region;
mod registry;
mod ring;
mod seqlock;
mod shm_layout;
mod subscriber;
mod sync;
mod topic;

pub use error::{BusError, Result};
pub use frame::{FRAME_ALIGN, FRAME_HEADER_LEN, Message, frame_len};
pub use options::{BusOptions, DEFAULT_CAPACITY, DEFAULT_INIT_TIMEOUT, DEFAULT_NAMESPACE, Lifetime};
pub use publisher::Publisher;
pub use registry::{Mode, TopicRegistry, shm_name};
pub use ring::RingConfig;
pub use shm_layout::{Cursor, MAX_ATTACHMENTS, header_len};
pub use subscriber::{CancelHandle, PollOutcome, StartPosition, Subscriber, Subscription};
pub use sync::{WaitOutcome, WriterGuard};
pub use topic::{Liveness, Topic};
