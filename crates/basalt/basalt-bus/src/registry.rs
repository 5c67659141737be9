//! Maps topic names to attached regions, once per process.

use crate::error::{BusError, Result};
use crate::options::BusOptions;
use crate::publisher::Publisher;
use crate::region::Region;
use crate::ring::RingConfig;
use crate::subscriber::{StartPosition, Subscriber};
use crate::topic::Topic;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Longest shared object name the OS accepts, leading `/` excluded.
const SHM_NAME_MAX: usize = 255;

/// What the caller intends to do with a resolved topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Create the topic if it does not exist.
    Publish,
    /// Attach to an existing topic; create only with
    /// [`BusOptions::auto_create_on_subscribe`].
    Subscribe,
}

/// Entry point of the bus: resolves topics and hands out publishers and
/// subscribers.
///
/// A topic resolved twice in the same registry shares one mapping as long as
/// a handle to it is alive.
pub struct TopicRegistry {
    options: BusOptions,
    topics: Mutex<HashMap<String, Weak<Topic>>>,
    publishers: Mutex<HashMap<String, Arc<CachedPublisher>>>,
}

/// Publisher used by [`TopicRegistry::publish`]. The topic is kept beside the
/// lock so retirement checks never wait on a publish in flight.
struct CachedPublisher {
    topic: Arc<Topic>,
    publisher: Mutex<Publisher>,
}

impl TopicRegistry {
    pub fn new(options: BusOptions) -> Self {
        Self {
            options,
            topics: Mutex::new(HashMap::new()),
            publishers: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn options(&self) -> &BusOptions {
        &self.options
    }

    /// Name of the shared object that backs `topic` in this registry's namespace.
    pub fn shm_name(&self, topic: &str) -> Result<String> {
        shm_name(&self.options.namespace, topic)
    }

    /// The topic's shared mapping, attaching (and, per `mode`, creating) the
    /// region on first use.
    ///
    /// The registry's lock is not held while a region is created or awaited,
    /// so a slow topic does not stall resolves of other topics.
    pub fn resolve(&self, topic: &str, mode: Mode) -> Result<Arc<Topic>> {
        let name = self.shm_name(topic)?;
        if let Some(cached) = self.cached(topic) {
            self.check_capacity(&name, &cached, mode)?;
            return Ok(cached);
        }

        let region = match mode {
            Mode::Publish => self.create_or_attach(&name)?,
            Mode::Subscribe => match Region::attach(&name, self.options.init_timeout)? {
                Some(region) => region,
                None if self.options.auto_create_on_subscribe => self.create_or_attach(&name)?,
                None => {
                    return Err(BusError::TopicNotFound {
                        topic: topic.to_owned(),
                    });
                }
            },
        };

        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        // another thread may have resolved the topic meanwhile; keep one mapping
        if let Some(raced) = topics
            .get(topic)
            .and_then(Weak::upgrade)
            .filter(|t| !t.is_retired())
        {
            drop(topics);
            drop(region);
            self.check_capacity(&name, &raced, mode)?;
            return Ok(raced);
        }
        let resolved = Arc::new(Topic::new(topic, region));
        topics.retain(|_, weak| weak.strong_count() > 0);
        topics.insert(topic.to_owned(), Arc::downgrade(&resolved));
        Ok(resolved)
    }

    fn cached(&self, topic: &str) -> Option<Arc<Topic>> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .and_then(Weak::upgrade)
            .filter(|t| !t.is_retired())
    }

    fn check_capacity(&self, name: &str, topic: &Topic, mode: Mode) -> Result<()> {
        if mode == Mode::Publish && topic.capacity() != self.options.capacity {
            return Err(BusError::CapacityMismatch {
                name: name.to_owned(),
                requested: self.options.capacity as u64,
                actual: topic.capacity() as u64,
            });
        }
        Ok(())
    }

    fn create_or_attach(&self, name: &str) -> Result<Region> {
        let cfg = RingConfig::try_new(self.options.capacity)?;
        Region::create_or_attach(name, cfg, self.options.lifetime, self.options.init_timeout)
    }

    /// A new publisher handle, creating the topic on first use.
    pub fn publisher(&self, topic: &str) -> Result<Publisher> {
        let resolved = self.resolve(topic, Mode::Publish)?;
        Publisher::new(resolved, self.options.exclusive_publisher)
    }

    pub fn subscribe(&self, topic: &str, start: StartPosition) -> Result<Subscriber> {
        let resolved = self.resolve(topic, Mode::Subscribe)?;
        Subscriber::new(resolved, start)
    }

    /// Publishes through a publisher cached by this registry, creating the
    /// topic and the publisher on first use.
    ///
    /// Publishes to different topics do not wait for each other.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> Result<u64> {
        let publisher = match self.cached_publisher(topic) {
            Some(publisher) => publisher,
            None => {
                let publisher = self.publisher(topic)?;
                let created = Arc::new(CachedPublisher {
                    topic: Arc::clone(publisher.topic()),
                    publisher: Mutex::new(publisher),
                });
                let mut publishers = self
                    .publishers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match publishers.get(topic) {
                    Some(raced) if !raced.topic.is_retired() => Arc::clone(raced),
                    _ => {
                        publishers.insert(topic.to_owned(), Arc::clone(&created));
                        created
                    }
                }
            }
        };
        let mut publisher = publisher
            .publisher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        publisher.publish(payload)
    }

    fn cached_publisher(&self, topic: &str) -> Option<Arc<CachedPublisher>> {
        let mut publishers = self
            .publishers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match publishers.get(topic) {
            Some(cached) if !cached.topic.is_retired() => Some(Arc::clone(cached)),
            Some(_) => {
                publishers.remove(topic);
                None
            }
            None => None,
        }
    }

    /// Removes the topic's shared object. Attached processes keep their
    /// mapping; later resolves create a fresh region.
    ///
    /// Returns `false` if the topic did not exist.
    pub fn remove(&self, topic: &str) -> Result<bool> {
        let name = self.shm_name(topic)?;
        self.publishers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
        Region::remove(&name)
    }
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new(BusOptions::default())
    }
}

/// Derives the shared object name `/<namespace>.<topic>`.
///
/// Bytes outside `[A-Za-z0-9_.-]` are percent-escaped; the namespace must not
/// contain `.` so that the separator stays unambiguous.
///
/// ```
/// assert_eq!(basalt_bus::shm_name("basalt", "md/btc usd").unwrap(), "/basalt.md%2Fbtc%20usd");
/// ```
pub fn shm_name(namespace: &str, topic: &str) -> Result<String> {
    let invalid = |reason| BusError::InvalidTopic {
        topic: topic.to_owned(),
        reason,
    };
    if topic.is_empty() {
        return Err(invalid("topic name is empty"));
    }
    if topic.contains('\0') {
        return Err(invalid("topic name contains a NUL byte"));
    }
    if namespace.is_empty() || namespace.contains('.') || namespace.contains('\0') {
        return Err(invalid("namespace must be non-empty and free of '.' and NUL"));
    }

    let mut name = String::with_capacity(2 + namespace.len() + topic.len());
    name.push('/');
    escape_into(&mut name, namespace);
    name.push('.');
    escape_into(&mut name, topic);
    if name.len() - 1 > SHM_NAME_MAX {
        return Err(invalid("derived object name is too long"));
    }
    Ok(name)
}

fn escape_into(out: &mut String, s: &str) {
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-') {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(shm_name("basalt", "events").unwrap(), "/basalt.events");
        assert_eq!(shm_name("ns", "a.b-c_1").unwrap(), "/ns.a.b-c_1");
    }

    #[test]
    fn special_characters_are_escaped_injectively() {
        assert_eq!(shm_name("ns", "a/b").unwrap(), "/ns.a%2Fb");
        assert_eq!(shm_name("ns", "a%2Fb").unwrap(), "/ns.a%252Fb");
        assert_eq!(shm_name("ns", "é").unwrap(), "/ns.%C3%A9");
    }

    #[test]
    fn bad_names_are_rejected() {
        for topic in ["", "a\0b"] {
            assert!(matches!(shm_name("ns", topic), Err(BusError::InvalidTopic { .. })));
        }
        assert!(shm_name("a.b", "t").is_err());
        assert!(shm_name("", "t").is_err());

        let long = "x".repeat(SHM_NAME_MAX);
        assert!(matches!(shm_name("ns", &long), Err(BusError::InvalidTopic { .. })));
        let fits = "x".repeat(SHM_NAME_MAX - 3);
        assert!(shm_name("ns", &fits).is_ok());
    }
}
