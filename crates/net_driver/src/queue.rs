//! Multi-producer, single-consumer outbound queues.
//!
//! Producers are arbitrary application threads; the only consumer is the
//! network loop, which pops at most one entry per queue per iteration and
//! never blocks doing so.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;

use crate::config::{OverflowPolicy, QueueConfig};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
}

/// Result of a successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome<T> {
    Queued,
    /// The queue was full and the pushed item was discarded.
    Dropped(T),
    /// The queue was full and this older item was evicted to make room.
    Evicted(T),
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

/// FIFO queue with an optional bound and an explicit overflow policy.
#[derive(Debug)]
pub struct OutboundQueue<T> {
    state: Mutex<QueueState<T>>,
    space: Condvar,
    config: QueueConfig,
}

impl<T> OutboundQueue<T> {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
                dropped: 0,
            }),
            space: Condvar::new(),
            config,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(QueueConfig::unbounded())
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an item, applying the overflow policy if the queue is full.
    ///
    /// Only [`OverflowPolicy::Block`] ever waits; it returns
    /// [`QueueError::Closed`] if the queue closes while waiting.
    pub fn push(&self, item: T) -> Result<PushOutcome<T>, QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }

        let Some(capacity) = self.config.capacity else {
            state.items.push_back(item);
            return Ok(PushOutcome::Queued);
        };

        if state.items.len() < capacity {
            state.items.push_back(item);
            return Ok(PushOutcome::Queued);
        }

        match self.config.overflow {
            OverflowPolicy::DropNewest => {
                state.dropped += 1;
                Ok(PushOutcome::Dropped(item))
            }
            OverflowPolicy::DropOldest => {
                let evicted = state.items.pop_front();
                state.items.push_back(item);
                state.dropped += 1;
                Ok(match evicted {
                    Some(old) => PushOutcome::Evicted(old),
                    None => PushOutcome::Queued,
                })
            }
            OverflowPolicy::Block => {
                while state.items.len() >= capacity && !state.closed {
                    state = self
                        .space
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                if state.closed {
                    return Err(QueueError::Closed);
                }
                state.items.push_back(item);
                Ok(PushOutcome::Queued)
            }
        }
    }

    /// Removes the oldest item without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.lock();
        if state.items.is_empty() {
            return None;
        }
        let item = state.items.pop_front();
        drop(state);
        self.space.notify_one();
        item
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Number of items discarded by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Rejects further pushes and wakes blocked producers.
    ///
    /// Items already queued stay poppable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.space.notify_all();
    }

    /// Accepts pushes again after [`close`](Self::close).
    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    /// Empties the queue and returns how many items were discarded.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let count = state.items.len();
        state.items.clear();
        drop(state);
        self.space.notify_all();
        count
    }
}
