//! Topic demultiplexer: one shared scan, per-topic message queues.
//!
//! A recording interleaves messages from every topic, but each execution
//! plan only wants one topic's messages. [`TopicDemux`] exclusively owns the
//! log's single forward iterator and fans it out: a request for topic A that
//! encounters messages for topics B and C parks them in those topics' FIFO
//! queues instead of discarding them, so the underlying log is scanned at
//! most once no matter how many topics are being pulled concurrently.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::source::{ImageMessage, LogSource};

/// Demultiplexes one [`LogSource`] scan into per-topic message streams.
pub struct TopicDemux {
    source: Box<dyn LogSource>,
    queues: HashMap<String, VecDeque<(ImageMessage, u64)>>,
    exhausted: bool,
}

impl TopicDemux {
    pub fn new(source: Box<dyn LogSource>) -> Self {
        Self {
            source,
            queues: HashMap::new(),
            exhausted: false,
        }
    }

    /// The next message for `topic`, or `None` once the log holds no more.
    ///
    /// Queue order is log emission order, which is time order; a message is
    /// enqueued to exactly one topic's queue and dequeued at most once.
    pub fn next(&mut self, topic: &str) -> Result<Option<(ImageMessage, u64)>> {
        if let Some(queue) = self.queues.get_mut(topic) {
            if let Some(entry) = queue.pop_front() {
                return Ok(Some(entry));
            }
        }

        if self.exhausted {
            return Ok(None);
        }

        // Scan forward until the requested topic shows up, parking every
        // other topic's messages in their queues.
        loop {
            match self.source.next_message()? {
                Some(msg) => {
                    if msg.topic == topic {
                        return Ok(Some((msg.message, msg.timestamp_ns)));
                    }
                    self.queues
                        .entry(msg.topic)
                        .or_default()
                        .push_back((msg.message, msg.timestamp_ns));
                }
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            }
        }
    }

    /// Wrap the demultiplexer for sharing across execution plans.
    pub fn into_shared(self) -> Arc<Mutex<TopicDemux>> {
        Arc::new(Mutex::new(self))
    }
}

/// A per-topic view onto a shared [`TopicDemux`].
///
/// Plans receive views, never their own readers: all views pull through the
/// one demultiplexer, which is what preserves the single-pass guarantee.
pub struct TopicReader {
    demux: Arc<Mutex<TopicDemux>>,
    topic: String,
}

impl TopicReader {
    pub fn new(demux: &Arc<Mutex<TopicDemux>>, topic: impl Into<String>) -> Self {
        Self {
            demux: Arc::clone(demux),
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn next(&mut self) -> Result<Option<(ImageMessage, u64)>> {
        self.demux.lock().unwrap().next(&self.topic)
    }
}
