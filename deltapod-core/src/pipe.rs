//! Pipe: closable, unbounded FIFO shared between threads.
//!
//! `send` never blocks. `receive` blocks until an item arrives or the pipe is closed. Once
//! closed, every `send` and `receive` fails immediately; [`Pipe::drain`] still hands out
//! whatever was queued before the close.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct PipeState<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct Pipe<T> {
    state: Mutex<PipeState<T>>,
    ready: Condvar,
}

impl<T> Pipe<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PipeState {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Queue `item`. Returns false, dropping the item, if the pipe is closed.
    pub fn send(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Block until an item is available (`Some`) or the pipe is closed (`None`).
    pub fn receive(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Non-blocking receive.
    pub fn try_receive(&self) -> Option<T> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.items.pop_front()
    }

    /// Close the pipe and wake every blocked receiver. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.ready.notify_all();
    }

    /// Take everything still queued, closed or not.
    pub fn drain(&self) -> Vec<T> {
        self.state.lock().items.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Pipe<T> {
    /// Guard that closes this pipe when dropped, for the task that owns a shared pipe.
    pub fn close_on_drop(self: &Arc<Self>) -> CloseGuard<T> {
        CloseGuard { pipe: self.clone() }
    }
}

/// Closes its pipe on drop, waking receivers that hold other handles.
pub struct CloseGuard<T> {
    pipe: Arc<Pipe<T>>,
}

impl<T> Drop for CloseGuard<T> {
    fn drop(&mut self) {
        self.pipe.close();
    }
}

impl<T> Default for Pipe<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Pipe<T> {
    fn drop(&mut self) {
        self.close();
    }
}
