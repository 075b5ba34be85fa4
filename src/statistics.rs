use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use parking_lot::RwLock;

/// The type of information passed into the statistics channel.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedBytes(usize),
    SendBytes(usize),
    ReceivedMsgs(usize),
    SendMsgs(usize),
    ErrorMsgs(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per connection counters.
pub struct Counts<T> {
    pub received_bytes: T,
    pub send_bytes: T,
    pub received_msgs: T,
    pub send_msgs: T,
    pub error_msgs: T,
}

impl<T: Number> Counts<T> {
    /// # Example
    ///
    /// ```
    /// use openlink_server::statistics::*;
    ///
    /// let counts = Counts {
    ///     received_bytes: Count::default(),
    ///     send_bytes: Count::default(),
    ///     received_msgs: Count::default(),
    ///     send_msgs: Count::default(),
    ///     error_msgs: Count::default(),
    /// };
    ///
    /// counts.add(&Stats::ReceivedBytes(120));
    /// assert_eq!(counts.received_bytes.get(), 120);
    ///
    /// counts.add(&Stats::ReceivedMsgs(1));
    /// assert_eq!(counts.received_msgs.get(), 1);
    ///
    /// counts.add(&Stats::SendBytes(80));
    /// assert_eq!(counts.send_bytes.get(), 80);
    /// ```
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedBytes(v) => self.received_bytes.add(*v),
            Stats::ReceivedMsgs(v) => self.received_msgs.add(*v),
            Stats::SendBytes(v) => self.send_bytes.add(*v),
            Stats::SendMsgs(v) => self.send_msgs.add(*v),
            Stats::ErrorMsgs(v) => self.error_msgs.add(*v),
        }
    }
}

/// Message and byte counters for every registered connection.
#[derive(Clone)]
pub struct Statistics(Arc<RwLock<AHashMap<String, Counts<Count>>>>);

impl Default for Statistics {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(AHashMap::with_capacity(1024))))
    }
}

impl Statistics {
    /// Add a connection to the watch list.
    ///
    /// # Example
    ///
    /// ```
    /// use openlink_server::statistics::*;
    ///
    /// let statistics = Statistics::default();
    ///
    /// statistics.register("conn-1");
    /// assert!(statistics.get("conn-1").is_some());
    /// ```
    pub fn register(&self, id: &str) {
        self.0.write().insert(
            id.to_string(),
            Counts {
                received_bytes: Count::default(),
                send_bytes: Count::default(),
                received_msgs: Count::default(),
                send_msgs: Count::default(),
                error_msgs: Count::default(),
            },
        );
    }

    /// Remove a connection from the watch list.
    ///
    /// # Example
    ///
    /// ```
    /// use openlink_server::statistics::*;
    ///
    /// let statistics = Statistics::default();
    ///
    /// statistics.register("conn-1");
    /// statistics.unregister("conn-1");
    /// assert!(statistics.get("conn-1").is_none());
    /// ```
    pub fn unregister(&self, id: &str) {
        self.0.write().remove(id);
    }

    /// Update a connection's counters.
    ///
    /// # Example
    ///
    /// ```
    /// use openlink_server::statistics::*;
    ///
    /// let statistics = Statistics::default();
    ///
    /// statistics.register("conn-1");
    /// statistics.add("conn-1", &[Stats::ReceivedBytes(100), Stats::ReceivedMsgs(1)]);
    ///
    /// let counts = statistics.get("conn-1").unwrap();
    /// assert_eq!(counts.received_bytes, 100);
    /// assert_eq!(counts.received_msgs, 1);
    /// ```
    pub fn add(&self, id: &str, reports: &[Stats]) {
        if let Some(counts) = self.0.read().get(id) {
            for report in reports {
                counts.add(report);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Counts<usize>> {
        self.0.read().get(id).map(|counts| Counts {
            received_bytes: counts.received_bytes.get(),
            send_bytes: counts.send_bytes.get(),
            received_msgs: counts.received_msgs.get(),
            send_msgs: counts.send_msgs.get(),
            error_msgs: counts.error_msgs.get(),
        })
    }
}
