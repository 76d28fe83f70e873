use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue is empty")]
    Empty,
    #[error("Queue was closed by the producer")]
    Closed,
    #[error("Queue was poisoned by an aborting worker")]
    Poisoned,
    #[error("More items were acknowledged than were ever enqueued")]
    ExcessAck,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    /// enqueued items that have not been acknowledged via `task_done` yet
    unfinished: usize,
    closed: bool,
    poisoned: bool,
}

#[derive(Debug)]
struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
    all_done: Condvar,
}

/// Bounded FIFO queue shared between the dispatch coordinator and the job runners.
///
/// Every item taken with [`DispatchQueue::get_timeout`] must eventually be
/// acknowledged with [`DispatchQueue::task_done`], [`DispatchQueue::join`]
/// blocks until the acknowledgments balance out.
#[derive(Debug)]
pub struct DispatchQueue<T>(Arc<QueueInner<T>>);

impl<T> Clone for DispatchQueue<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> DispatchQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self(Arc::new(QueueInner {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                unfinished: 0,
                closed: false,
                poisoned: false,
            }),
            capacity: capacity.max(1),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            all_done: Condvar::new(),
        }))
    }

    /// Enqueue one item, blocking while the queue is at capacity.
    pub fn put(&self, item: T) -> Result<(), QueueError> {
        let mut state = self.0.state.lock();
        loop {
            if state.poisoned {
                return Err(QueueError::Poisoned);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.items.len() < self.0.capacity {
                break;
            }
            self.0.not_full.wait(&mut state);
        }
        state.items.push_back(item);
        state.unfinished += 1;
        self.0.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue one item, waiting up to `timeout` for a producer.
    ///
    /// [`QueueError::Empty`] is transient, the caller may retry.
    /// [`QueueError::Closed`] means the producer finished and the backlog is
    /// drained, no further item will ever arrive.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.0.state.lock();
        loop {
            if state.poisoned {
                return Err(QueueError::Poisoned);
            }
            if let Some(item) = state.items.pop_front() {
                self.0.not_full.notify_one();
                return Ok(item);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            if self.0.not_empty.wait_until(&mut state, deadline).timed_out() {
                return match state.items.pop_front() {
                    Some(item) => {
                        self.0.not_full.notify_one();
                        Ok(item)
                    }
                    None if state.poisoned => Err(QueueError::Poisoned),
                    None if state.closed => Err(QueueError::Closed),
                    None => Err(QueueError::Empty),
                };
            }
        }
    }

    /// Acknowledge one previously dequeued item.
    pub fn task_done(&self) -> Result<(), QueueError> {
        let mut state = self.0.state.lock();
        if state.unfinished == 0 {
            return Err(QueueError::ExcessAck);
        }
        state.unfinished -= 1;
        if state.unfinished == 0 {
            self.0.all_done.notify_all();
        }
        Ok(())
    }

    /// Block until every enqueued item has been acknowledged.
    pub fn join(&self) -> Result<(), QueueError> {
        let mut state = self.0.state.lock();
        while state.unfinished > 0 && !state.poisoned {
            self.0.all_done.wait(&mut state);
        }
        if state.poisoned {
            Err(QueueError::Poisoned)
        } else {
            Ok(())
        }
    }

    /// Producer signal that nothing more will be enqueued. Once the backlog
    /// is drained, waiting consumers see [`QueueError::Closed`].
    pub fn close(&self) {
        let mut state = self.0.state.lock();
        state.closed = true;
        self.0.not_empty.notify_all();
    }

    /// Worker signal that it aborted. Wakes the producer and all peers so
    /// nobody keeps waiting on items that will never be processed.
    pub fn poison(&self) {
        let mut state = self.0.state.lock();
        state.poisoned = true;
        self.0.not_empty.notify_all();
        self.0.not_full.notify_all();
        self.0.all_done.notify_all();
    }

}
