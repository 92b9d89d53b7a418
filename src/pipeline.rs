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

pub type CallId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("response queue cancelled")]
    Cancelled,

    // a call completed out of turn. this is a driver bug and fatal to
    // the connection
    #[error("completed call is not at the head of the queue")]
    NotHead,
}

struct Inner {
    queue: VecDeque<CallId>,
    next_id: CallId,
    cancelled: bool,
}

// per-connection FIFO of in-flight calls. responses may only flush once
// every earlier call has flushed, no matter in what order handlers finish.
// shared between the connection's read loop and its response producers
pub struct ResponseQueue {
    shared: Arc<(Mutex<Inner>, Condvar)>,
}

#[allow(clippy::new_without_default)]
impl ResponseQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new((
                Mutex::new(Inner {
                    queue: VecDeque::new(),
                    next_id: 1,
                    cancelled: false,
                }),
                Condvar::new(),
            )),
        }
    }

    // register a call at the tail. must be called exactly once per
    // accepted request, in wire arrival order
    pub fn started(&self) -> Result<CallId, QueueError> {
        let (lock, _) = &*self.shared;

        let mut inner = lock.lock().unwrap();

        if inner.cancelled {
            return Err(QueueError::Cancelled);
        }

        let id = inner.next_id;
        inner.next_id += 1;

        inner.queue.push_back(id);

        Ok(id)
    }

    // block until the call is at the head, i.e. all earlier calls have
    // flushed. returns immediately if it already is
    pub fn wait_turn(&self, id: CallId) -> Result<(), QueueError> {
        let (lock, cond) = &*self.shared;

        let mut inner = lock.lock().unwrap();

        loop {
            if inner.cancelled {
                return Err(QueueError::Cancelled);
            }

            if inner.queue.front() == Some(&id) {
                return Ok(());
            }

            inner = cond.wait(inner).unwrap();
        }
    }

    // pop the head and wake the next waiter
    pub fn completed(&self, id: CallId) -> Result<(), QueueError> {
        let (lock, cond) = &*self.shared;

        let mut inner = lock.lock().unwrap();

        if inner.cancelled {
            return Err(QueueError::Cancelled);
        }

        if inner.queue.front() != Some(&id) {
            return Err(QueueError::NotHead);
        }

        inner.queue.pop_front();
        cond.notify_all();

        Ok(())
    }

    // drain the queue, resuming every waiter with a cancellation fault.
    // later started/wait_turn calls observe the cancellation too
    pub fn cancel(&self) {
        let (lock, cond) = &*self.shared;

        let mut inner = lock.lock().unwrap();

        inner.cancelled = true;
        inner.queue.clear();

        cond.notify_all();
    }

    // block until fewer than max calls are outstanding. bounds pipeline
    // depth on one connection
    pub fn wait_capacity(&self, max: usize) -> Result<(), QueueError> {
        assert!(max > 0);

        let (lock, cond) = &*self.shared;

        let mut inner = lock.lock().unwrap();

        loop {
            if inner.cancelled {
                return Err(QueueError::Cancelled);
            }

            if inner.queue.len() < max {
                return Ok(());
            }

            inner = cond.wait(inner).unwrap();
        }
    }

    // block until every outstanding call has flushed
    pub fn wait_empty(&self) -> Result<(), QueueError> {
        let (lock, cond) = &*self.shared;

        let mut inner = lock.lock().unwrap();

        loop {
            if inner.cancelled {
                return Err(QueueError::Cancelled);
            }

            if inner.queue.is_empty() {
                return Ok(());
            }

            inner = cond.wait(inner).unwrap();
        }
    }

    pub fn len(&self) -> usize {
        self.shared.0.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Clone for ResponseQueue {
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
    use std::time::Duration;

    #[test]
    fn test_in_order() {
        let rq = ResponseQueue::new();

        let a = rq.started().unwrap();
        let b = rq.started().unwrap();

        // head returns immediately
        rq.wait_turn(a).unwrap();
        rq.completed(a).unwrap();

        rq.wait_turn(b).unwrap();
        rq.completed(b).unwrap();

        assert!(rq.is_empty());
    }

    #[test_log::test]
    fn test_fifo_under_reverse_completion() {
        let rq = ResponseQueue::new();

        let n = 8;

        let ids: Vec<CallId> = (0..n).map(|_| rq.started().unwrap()).collect();

        let flushed = Arc::new(Mutex::new(Vec::new()));

        let mut threads = Vec::new();

        for (i, id) in ids.iter().enumerate() {
            let rq = rq.clone();
            let flushed = Arc::clone(&flushed);
            let id = *id;

            threads.push(thread::spawn(move || {
                // later calls finish handling first
                thread::sleep(Duration::from_millis(((n - i) * 10) as u64));

                rq.wait_turn(id).unwrap();

                flushed.lock().unwrap().push(id);

                rq.completed(id).unwrap();
            }));
        }

        for t in threads {
            t.join().unwrap();
        }

        // flush order equals arrival order regardless of completion order
        assert_eq!(&*flushed.lock().unwrap(), &ids);
        assert!(rq.is_empty());
    }

    #[test]
    fn test_completed_not_head() {
        let rq = ResponseQueue::new();

        let a = rq.started().unwrap();
        let b = rq.started().unwrap();

        assert_eq!(rq.completed(b), Err(QueueError::NotHead));

        rq.completed(a).unwrap();
        rq.completed(b).unwrap();
    }

    #[test]
    fn test_cancel_resumes_all_waiters() {
        let rq = ResponseQueue::new();

        // head never completes, so these all suspend
        let _head = rq.started().unwrap();

        let mut threads = Vec::new();

        for _ in 0..10 {
            let id = rq.started().unwrap();
            let rq = rq.clone();

            threads.push(thread::spawn(move || rq.wait_turn(id)));
        }

        // let the waiters reach the suspended state
        thread::sleep(Duration::from_millis(20));

        rq.cancel();

        for t in threads {
            assert_eq!(t.join().unwrap(), Err(QueueError::Cancelled));
        }

        // the queue stays cancelled
        assert_eq!(rq.started(), Err(QueueError::Cancelled));
        assert_eq!(rq.wait_turn(1), Err(QueueError::Cancelled));
    }

    #[test]
    fn test_wait_capacity() {
        let rq = ResponseQueue::new();

        let a = rq.started().unwrap();
        let _b = rq.started().unwrap();

        rq.wait_capacity(3).unwrap();

        let rq2 = rq.clone();

        let thread = thread::spawn(move || {
            rq2.wait_capacity(2).unwrap();
            rq2.len()
        });

        thread::sleep(Duration::from_millis(20));

        rq.completed(a).unwrap();

        assert_eq!(thread.join().unwrap(), 1);
    }

    #[test]
    fn test_wait_empty() {
        let rq = ResponseQueue::new();

        let a = rq.started().unwrap();

        let rq2 = rq.clone();

        let thread = thread::spawn(move || rq2.wait_empty());

        thread::sleep(Duration::from_millis(20));

        rq.completed(a).unwrap();

        assert_eq!(thread.join().unwrap(), Ok(()));
    }
}
