//! Bounded frame queue between the telephony socket and the transcriber.
//!
//! Audio arrives in real time; if the transcriber falls behind, the oldest
//! frames are the least useful, so `push` never blocks and evicts from the
//! front when full. The producer side must stay on the socket read loop, so
//! only `pop` is async.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::warn;

pub struct FrameQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

struct Inner {
    frames: VecDeque<Vec<u8>>,
    dropped: u64,
    closed: bool,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity.max(1)),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue one frame, evicting the oldest when full. Returns false if
    /// the queue was already closed (the frame is discarded).
    pub fn push(&self, frame: Vec<u8>) -> bool {
        let dropped = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.closed {
                return false;
            }
            if inner.frames.len() == self.capacity {
                inner.frames.pop_front();
                inner.dropped += 1;
            }
            inner.frames.push_back(frame);
            inner.dropped
        };

        if dropped > 0 && dropped % 50 == 1 {
            warn!(dropped, "Transcriber lagging; audio frames evicted");
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next frame. Returns None once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<Vec<u8>> {
        loop {
            // Register before checking so a push between the check and the
            // await still wakes us.
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue; pending and future `pop`s drain what is buffered
    /// and then return None. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    /// Total frames evicted under backpressure since creation.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).dropped
    }
}
