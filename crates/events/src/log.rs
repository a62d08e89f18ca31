//! Shared workflow log channel.
//!
//! Append-only and multi-subscriber. Each subscriber reads from a bounded ring
//! buffer: under sustained backpressure the oldest lines are evicted and the
//! subscriber is told how many it missed. Publishing never waits on a reader,
//! so observers cannot slow down a workflow invocation.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use playop_core::ResourceId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::error::{Error, Result};

/// Who produced a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogSource {
    /// The controller itself.
    Operator,
    /// Output of an external workflow process.
    Workflow,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operator => write!(f, "OPERATOR"),
            Self::Workflow => write!(f, "PLAYBOOK"),
        }
    }
}

/// One timestamped line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
    pub resource: Option<ResourceId>,
    pub text: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(id) => write!(
                f,
                "{} [{}] {}: {}",
                self.timestamp.to_rfc3339(),
                self.source,
                id,
                self.text
            ),
            None => write!(f, "{} [{}] {}", self.timestamp.to_rfc3339(), self.source, self.text),
        }
    }
}

/// Bounded multi-subscriber log channel.
pub struct LogChannel {
    sender: broadcast::Sender<LogLine>,
    history: Mutex<VecDeque<LogLine>>,
    capacity: usize,
}

impl LogChannel {
    /// Create a channel retaining at most `capacity` lines per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a line.
    ///
    /// History and subscribers see lines in the same order: the send happens
    /// under the history lock.
    pub fn publish(&self, line: LogLine) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(line.clone());
        // No receivers is fine: nobody is tailing right now.
        let _ = self.sender.send(line);
    }

    /// Append a controller line.
    pub fn operator(&self, resource: Option<&ResourceId>, text: impl Into<String>) {
        self.publish(LogLine {
            timestamp: Utc::now(),
            source: LogSource::Operator,
            resource: resource.cloned(),
            text: text.into(),
        });
    }

    /// Append a line of workflow output.
    pub fn workflow(&self, resource: &ResourceId, text: impl Into<String>) {
        self.publish(LogLine {
            timestamp: Utc::now(),
            source: LogSource::Workflow,
            resource: Some(resource.clone()),
            text: text.into(),
        });
    }

    /// Start tailing from now on.
    #[must_use]
    pub fn subscribe(&self) -> LogSubscription {
        LogSubscription {
            receiver: self.sender.subscribe(),
            dropped: 0,
        }
    }

    /// Snapshot of the most recent lines, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<LogLine> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Maximum retained lines.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A tail on the log channel.
pub struct LogSubscription {
    receiver: broadcast::Receiver<LogLine>,
    dropped: u64,
}

impl LogSubscription {
    /// Receive the next line, skipping past evicted ones.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] once the channel is gone.
    pub async fn recv(&mut self) -> Result<LogLine> {
        loop {
            match self.receiver.recv().await {
                Ok(line) => return Ok(line),
                Err(RecvError::Lagged(missed)) => {
                    self.dropped = self.dropped.saturating_add(missed);
                }
                Err(RecvError::Closed) => return Err(Error::ChannelClosed),
            }
        }
    }

    /// Receive a line if one is ready.
    pub fn try_recv(&mut self) -> Option<LogLine> {
        loop {
            match self.receiver.try_recv() {
                Ok(line) => return Some(line),
                Err(TryRecvError::Lagged(missed)) => {
                    self.dropped = self.dropped.saturating_add(missed);
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Lines this subscriber missed due to eviction.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}
