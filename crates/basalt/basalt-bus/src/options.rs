use crate::ring::RingConfig;
use std::time::Duration;

/// What happens to a topic's shared object when nobody is attached any more.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Lifetime {
    /// Unlinked by the process whose detach drops the attachment count to zero.
    #[default]
    RemoveOnLastDetach,
    /// Survives until [`TopicRegistry::remove`](crate::TopicRegistry::remove).
    Persistent,
}

impl Lifetime {
    #[inline]
    pub(crate) fn as_raw(self) -> u32 {
        match self {
            Lifetime::RemoveOnLastDetach => 1,
            Lifetime::Persistent => 2,
        }
    }

    #[inline]
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Lifetime::RemoveOnLastDetach),
            2 => Some(Lifetime::Persistent),
            _ => None,
        }
    }
}

/// Options shared by every topic a [`TopicRegistry`](crate::TopicRegistry) resolves.
///
/// ```
/// use basalt_bus::{BusOptions, Lifetime};
/// use std::time::Duration;
///
/// let opts = BusOptions::default()
///     .namespace("telemetry")
///     .capacity(1 << 16)
///     .lifetime(Lifetime::Persistent)
///     .init_timeout(Duration::from_millis(250));
/// assert_eq!(opts.ring_config().capacity, 1 << 16);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusOptions {
    /// Prefix of every shared object name, keeps unrelated applications apart.
    pub namespace: String,
    /// Total region size in bytes for topics this process creates.
    pub capacity: usize,
    pub lifetime: Lifetime,
    /// Create the topic when subscribing to one that does not exist yet.
    pub auto_create_on_subscribe: bool,
    /// Allow only one publishing process per topic.
    pub exclusive_publisher: bool,
    /// How long an attacher waits for a concurrent creator to finish.
    pub init_timeout: Duration,
}

pub const DEFAULT_NAMESPACE: &str = "basalt";
pub const DEFAULT_CAPACITY: usize = 1 << 20;
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(1);

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_owned(),
            capacity: DEFAULT_CAPACITY,
            lifetime: Lifetime::default(),
            auto_create_on_subscribe: false,
            exclusive_publisher: true,
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }
}

impl BusOptions {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn auto_create_on_subscribe(mut self, enabled: bool) -> Self {
        self.auto_create_on_subscribe = enabled;
        self
    }

    pub fn exclusive_publisher(mut self, enabled: bool) -> Self {
        self.exclusive_publisher = enabled;
        self
    }

    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Ring geometry for topics created with these options.
    ///
    /// # Panics
    /// Panics if `capacity` is invalid; use [`RingConfig::try_new`] to check first.
    pub fn ring_config(&self) -> RingConfig {
        RingConfig::new(self.capacity)
    }
}
