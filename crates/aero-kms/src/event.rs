//! Completion events and the client event queue.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::object::{FbId, ObjectId};
use crate::{KmsError, Result};

/// Event space charged per completion event.
pub const EVENT_SIZE: usize = 32;

/// Notification that a committed change reached the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    pub object: ObjectId,
    pub user_data: u64,
    /// Frame counter of the vblank at which the change latched.
    pub sequence: u32,
    pub tv_sec: u64,
    pub tv_usec: u32,
    /// Framebuffer that was replaced, if any.
    pub old_fb: Option<FbId>,
}

#[derive(Debug)]
struct Inner {
    events: VecDeque<CompletionEvent>,
    /// Bytes still available for reservations.
    space: usize,
}

/// Event queue of one client.
///
/// Space is reserved when a commit asks for events and returned once the client reads the event
/// (or the reservation is dropped).
#[derive(Debug)]
pub struct EventQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
    capacity: usize,
}

impl EventQueue {
    pub fn new(space: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                space,
            }),
            ready: Condvar::new(),
            capacity: space,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reserve space for one event. Fails with `NoSpace` when the client has too many events
    /// outstanding.
    pub fn reserve(self: &Arc<Self>, object: ObjectId, user_data: u64) -> Result<PendingEvent> {
        let mut inner = self.lock();
        if inner.space < EVENT_SIZE {
            return Err(KmsError::NoSpace("event space exhausted"));
        }
        inner.space -= EVENT_SIZE;
        Ok(PendingEvent {
            queue: Arc::clone(self),
            object,
            user_data,
            delivered: false,
        })
    }

    pub fn available_space(&self) -> usize {
        self.lock().space
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pop(&self) -> Option<CompletionEvent> {
        let mut inner = self.lock();
        let event = inner.events.pop_front()?;
        inner.space += EVENT_SIZE;
        Some(event)
    }

    pub fn drain(&self) -> Vec<CompletionEvent> {
        let mut inner = self.lock();
        let events: Vec<_> = inner.events.drain(..).collect();
        inner.space += events.len() * EVENT_SIZE;
        events
    }

    /// Block until an event is available or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<CompletionEvent> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(event) = inner.events.pop_front() {
                inner.space += EVENT_SIZE;
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            inner = match self.ready.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn push(&self, event: CompletionEvent) {
        self.lock().events.push_back(event);
        self.ready.notify_all();
    }

    fn release(&self) {
        self.lock().space += EVENT_SIZE;
    }
}

/// Reserved event slot. Delivering it queues the event; dropping it returns the space.
#[derive(Debug)]
pub struct PendingEvent {
    queue: Arc<EventQueue>,
    object: ObjectId,
    user_data: u64,
    delivered: bool,
}

impl PendingEvent {
    pub fn object(&self) -> ObjectId {
        self.object
    }

    pub fn deliver(mut self, sequence: u32, timestamp: Duration, old_fb: Option<FbId>) {
        self.delivered = true;
        self.queue.push(CompletionEvent {
            object: self.object,
            user_data: self.user_data,
            sequence,
            tv_sec: timestamp.as_secs(),
            tv_usec: timestamp.subsec_micros(),
            old_fb,
        });
    }
}

impl Drop for PendingEvent {
    fn drop(&mut self) {
        if !self.delivered {
            self.queue.release();
        }
    }
}
