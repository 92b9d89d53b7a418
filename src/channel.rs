/*
 * Copyright (C) 2024-2025 the seqwire authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

// what to do when a send would exceed capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    // the sender suspends until space is available. nothing is dropped
    Suspend,

    // the channel is closed in the overflowed state. the failed send and,
    // once the queue drains, the receiver both observe the overflow
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseKind {
    Normal,
    Overflow,
    Cancelled,
    Faulted,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError<T> {
    Overflow(T),
    Disconnected(T),
    Cancelled(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Overflow(t) => t,
            Self::Disconnected(t) => t,
            Self::Cancelled(t) => t,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    Full(T),
    Send(SendError<T>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    #[error("channel closed")]
    Closed,

    #[error("channel overflow")]
    Overflow,

    #[error("channel cancelled")]
    Cancelled,

    // the producing side failed; see the session's close reason
    #[error("channel faulted")]
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvTimeoutError {
    #[error("channel recv timed out")]
    Timeout,

    #[error(transparent)]
    Recv(RecvError),
}

struct Inner<T> {
    queue: VecDeque<T>,
    capacity: usize,
    policy: OverflowPolicy,
    closed: Option<CloseKind>,
    senders: usize,
}

impl<T> Inner<T> {
    fn send_fault<E, F: FnOnce(SendError<T>) -> E>(&self, t: T, wrap: F) -> Result<(), E> {
        let e = match self.closed.unwrap() {
            CloseKind::Cancelled => SendError::Cancelled(t),
            CloseKind::Overflow => SendError::Overflow(t),
            CloseKind::Normal | CloseKind::Faulted => SendError::Disconnected(t),
        };

        Err(wrap(e))
    }
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Shared<T> {
    fn close(&self, kind: CloseKind) {
        let mut inner = self.inner.lock().unwrap();

        if inner.closed.is_some() {
            return;
        }

        if kind == CloseKind::Cancelled {
            // a torn-down channel must not deliver stale items
            inner.queue.clear();
        }

        inner.closed = Some(kind);

        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

// frames are delivered to the receiver in exactly the order they were
// accepted from senders, regardless of overflow policy
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

pub fn channel<T>(capacity: usize, policy: OverflowPolicy) -> (Sender<T>, Receiver<T>) {
    assert!(capacity > 0);

    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            policy,
            closed: None,
            senders: 1,
        }),
        not_empty: Condvar::new(),
        not_full: Condvar::new(),
    });

    (
        Sender {
            shared: Arc::clone(&shared),
        },
        Receiver { shared },
    )
}

impl<T> Sender<T> {
    pub fn send(&self, t: T) -> Result<(), SendError<T>> {
        let shared = &*self.shared;

        let mut inner = shared.inner.lock().unwrap();

        loop {
            if inner.closed.is_some() {
                return inner.send_fault(t, |e| e);
            }

            if inner.queue.len() < inner.capacity {
                inner.queue.push_back(t);
                shared.not_empty.notify_one();

                return Ok(());
            }

            match inner.policy {
                OverflowPolicy::Suspend => {
                    inner = shared.not_full.wait(inner).unwrap();
                }
                OverflowPolicy::Close => {
                    inner.closed = Some(CloseKind::Overflow);
                    shared.not_empty.notify_all();
                    shared.not_full.notify_all();

                    return Err(SendError::Overflow(t));
                }
            }
        }
    }

    pub fn try_send(&self, t: T) -> Result<(), TrySendError<T>> {
        let shared = &*self.shared;

        let mut inner = shared.inner.lock().unwrap();

        if inner.closed.is_some() {
            return inner.send_fault(t, TrySendError::Send);
        }

        if inner.queue.len() < inner.capacity {
            inner.queue.push_back(t);
            shared.not_empty.notify_one();

            return Ok(());
        }

        match inner.policy {
            OverflowPolicy::Suspend => Err(TrySendError::Full(t)),
            OverflowPolicy::Close => {
                inner.closed = Some(CloseKind::Overflow);
                shared.not_empty.notify_all();
                shared.not_full.notify_all();

                Err(TrySendError::Send(SendError::Overflow(t)))
            }
        }
    }

    // close for send. items already queued remain drainable
    pub fn close(&self) {
        self.shared.close(CloseKind::Normal);
    }

    // close because the producing side hit a fault. items already queued
    // remain drainable; the receiver then observes the fault
    pub fn close_faulted(&self) {
        self.shared.close(CloseKind::Faulted);
    }

    pub fn cancel(&self) {
        self.shared.close(CloseKind::Cancelled);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().unwrap().closed.is_some()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.inner.lock().unwrap().senders += 1;

        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let shared = &*self.shared;

        let mut inner = shared.inner.lock().unwrap();

        inner.senders -= 1;

        if inner.senders == 0 && inner.closed.is_none() {
            inner.closed = Some(CloseKind::Normal);

            shared.not_empty.notify_all();
            shared.not_full.notify_all();
        }
    }
}

impl<T> Receiver<T> {
    pub fn recv(&self) -> Result<T, RecvError> {
        let shared = &*self.shared;

        let mut inner = shared.inner.lock().unwrap();

        loop {
            if let Some(t) = inner.queue.pop_front() {
                shared.not_full.notify_one();

                return Ok(t);
            }

            match inner.closed {
                Some(CloseKind::Normal) => return Err(RecvError::Closed),
                Some(CloseKind::Overflow) => return Err(RecvError::Overflow),
                Some(CloseKind::Cancelled) => return Err(RecvError::Cancelled),
                Some(CloseKind::Faulted) => return Err(RecvError::Faulted),
                None => {
                    inner = shared.not_empty.wait(inner).unwrap();
                }
            }
        }
    }

    pub fn try_recv(&self) -> Result<Option<T>, RecvError> {
        let shared = &*self.shared;

        let mut inner = shared.inner.lock().unwrap();

        if let Some(t) = inner.queue.pop_front() {
            shared.not_full.notify_one();

            return Ok(Some(t));
        }

        match inner.closed {
            Some(CloseKind::Normal) => Err(RecvError::Closed),
            Some(CloseKind::Overflow) => Err(RecvError::Overflow),
            Some(CloseKind::Cancelled) => Err(RecvError::Cancelled),
            Some(CloseKind::Faulted) => Err(RecvError::Faulted),
            None => Ok(None),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        let shared = &*self.shared;

        let mut inner = shared.inner.lock().unwrap();

        loop {
            if let Some(t) = inner.queue.pop_front() {
                shared.not_full.notify_one();

                return Ok(t);
            }

            match inner.closed {
                Some(CloseKind::Normal) => return Err(RecvTimeoutError::Recv(RecvError::Closed)),
                Some(CloseKind::Overflow) => {
                    return Err(RecvTimeoutError::Recv(RecvError::Overflow))
                }
                Some(CloseKind::Cancelled) => {
                    return Err(RecvTimeoutError::Recv(RecvError::Cancelled))
                }
                Some(CloseKind::Faulted) => {
                    return Err(RecvTimeoutError::Recv(RecvError::Faulted))
                }
                None => {
                    let (g, result) = shared.not_empty.wait_timeout(inner, timeout).unwrap();

                    inner = g;

                    if result.timed_out() && inner.queue.is_empty() && inner.closed.is_none() {
                        return Err(RecvTimeoutError::Timeout);
                    }
                }
            }
        }
    }

    // mark the channel closed for send. subsequent sends fail
    pub fn close(&self) {
        self.shared.close(CloseKind::Normal);
    }

    pub fn cancel(&self) {
        self.shared.close(CloseKind::Cancelled);
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.shared.close(CloseKind::Normal);
    }
}

// one-shot value slot. the first set wins; waiters observe the value
pub struct Deferred<T> {
    shared: Arc<(Mutex<Option<T>>, Condvar)>,
}

impl<T> Deferred<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            shared: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    // returns whether this call resolved the slot
    pub fn set(&self, value: T) -> bool {
        let (lock, cond) = &*self.shared;

        let mut slot = lock.lock().unwrap();

        if slot.is_some() {
            return false;
        }

        *slot = Some(value);
        cond.notify_all();

        true
    }

    pub fn is_set(&self) -> bool {
        self.shared.0.lock().unwrap().is_some()
    }
}

impl<T: Clone> Deferred<T> {
    pub fn wait(&self) -> T {
        let (lock, cond) = &*self.shared;

        let mut slot = lock.lock().unwrap();

        loop {
            if let Some(value) = &*slot {
                return value.clone();
            }

            slot = cond.wait(slot).unwrap();
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let (lock, cond) = &*self.shared;

        let mut slot = lock.lock().unwrap();

        loop {
            if let Some(value) = &*slot {
                return Some(value.clone());
            }

            let (g, result) = cond.wait_timeout(slot, timeout).unwrap();

            slot = g;

            if result.timed_out() && slot.is_none() {
                return None;
            }
        }
    }

    pub fn try_get(&self) -> Option<T> {
        self.shared.0.lock().unwrap().clone()
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_send_recv() {
        let (s, r) = channel(2, OverflowPolicy::Suspend);

        s.send(1).unwrap();
        s.send(2).unwrap();

        assert_eq!(r.recv(), Ok(1));
        assert_eq!(r.recv(), Ok(2));
        assert_eq!(r.try_recv(), Ok(None));

        drop(s);

        assert_eq!(r.recv(), Err(RecvError::Closed));
    }

    #[test]
    fn test_try_send_full() {
        let (s, r) = channel(1, OverflowPolicy::Suspend);

        s.send(1).unwrap();

        assert_eq!(s.try_send(2), Err(TrySendError::Full(2)));
        assert_eq!(r.recv(), Ok(1));

        s.try_send(2).unwrap();
        assert_eq!(r.recv(), Ok(2));
    }

    #[test]
    fn test_overflow_close() {
        let (s, r) = channel(1, OverflowPolicy::Close);

        s.send(1).unwrap();

        // exceeding capacity closes the channel in the overflowed state
        assert_eq!(s.send(2), Err(SendError::Overflow(2)));
        assert_eq!(s.send(3), Err(SendError::Overflow(3)));

        // queued items drain first, then the receiver observes the fault
        assert_eq!(r.recv(), Ok(1));
        assert_eq!(r.recv(), Err(RecvError::Overflow));
    }

    #[test]
    fn test_close_drains() {
        let (s, r) = channel(4, OverflowPolicy::Suspend);

        s.send(1).unwrap();
        s.send(2).unwrap();
        s.close();

        assert_eq!(s.send(3), Err(SendError::Disconnected(3)));

        assert_eq!(r.recv(), Ok(1));
        assert_eq!(r.recv(), Ok(2));
        assert_eq!(r.recv(), Err(RecvError::Closed));
    }

    #[test]
    fn test_cancel_discards() {
        let (s, r) = channel(4, OverflowPolicy::Suspend);

        s.send(1).unwrap();
        s.send(2).unwrap();
        s.cancel();

        // cancellation does not deliver stale items
        assert_eq!(r.recv(), Err(RecvError::Cancelled));
        assert_eq!(s.send(3), Err(SendError::Cancelled(3)));
    }

    #[test]
    fn test_cancel_unblocks_sender() {
        let (s, r) = channel(1, OverflowPolicy::Suspend);

        s.send(1).unwrap();

        let thread = thread::spawn(move || s.send(2));

        // let the sender reach the suspended state
        thread::sleep(Duration::from_millis(20));

        r.cancel();

        let result = thread.join().unwrap();
        assert_eq!(result, Err(SendError::Cancelled(2)));
    }

    #[test]
    fn test_recv_timeout() {
        let (s, r) = channel::<u32>(1, OverflowPolicy::Suspend);

        let result = r.recv_timeout(Duration::from_millis(10));
        assert_eq!(result, Err(RecvTimeoutError::Timeout));

        s.send(1).unwrap();

        assert_eq!(r.recv_timeout(Duration::from_millis(10)), Ok(1));
    }

    #[test]
    fn test_suspend_preserves_order() {
        let (s, r) = channel(1, OverflowPolicy::Suspend);

        let producer = thread::spawn(move || {
            for i in 1..=100 {
                s.send(i).unwrap();
            }
        });

        let mut got = Vec::new();

        loop {
            match r.recv() {
                Ok(v) => got.push(v),
                Err(RecvError::Closed) => break,
                Err(e) => panic!("unexpected: {:?}", e),
            }
        }

        producer.join().unwrap();

        let expected: Vec<u32> = (1..=100).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_deferred() {
        let d = Deferred::new();
        let d2 = d.clone();

        assert_eq!(d.try_get(), None);

        let thread = thread::spawn(move || d2.wait());

        assert!(d.set(42));
        assert!(!d.set(43));

        assert_eq!(thread.join().unwrap(), 42);
        assert_eq!(d.try_get(), Some(42));
    }

    #[test]
    fn test_deferred_wait_timeout() {
        let d: Deferred<u32> = Deferred::new();

        assert_eq!(d.wait_timeout(Duration::from_millis(10)), None);

        d.set(1);
        assert_eq!(d.wait_timeout(Duration::from_millis(10)), Some(1));
    }
}
