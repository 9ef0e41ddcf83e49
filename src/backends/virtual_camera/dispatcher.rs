// SPDX-License-Identifier: GPL-3.0-only

//! Serial callback thread of the simulated camera stack
//!
//! Every device and session callback runs here, one at a time and in
//! deadline order, like a camera service delivering callbacks on a handler
//! thread. Delayed jobs model the latency of opening and configuring.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send>;

struct Scheduled {
    deadline: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed: BinaryHeap is a max-heap and the earliest job must pop first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct CallbackDispatcher {
    sender: Mutex<Option<mpsc::Sender<(Instant, Job)>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackDispatcher {
    pub(crate) fn start() -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("camera-callbacks".to_string())
            .spawn(move || dispatcher_main(receiver))?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Run `job` on the callback thread as soon as possible
    pub(crate) fn post(&self, job: impl FnOnce() + Send + 'static) {
        self.post_after(Duration::ZERO, job);
    }

    /// Run `job` on the callback thread after `delay`
    pub(crate) fn post_after(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(sender) => {
                if sender.send((Instant::now() + delay, Box::new(job))).is_err() {
                    debug!("Callback thread gone, dropping callback");
                }
            }
            None => debug!("Callback dispatcher stopped, dropping callback"),
        }
    }
}

impl Drop for CallbackDispatcher {
    fn drop(&mut self) {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let thread = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(thread) = thread {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if let Err(e) = thread.join() {
                error!("Callback thread panicked: {:?}", e);
            }
        }
    }
}

fn dispatcher_main(receiver: mpsc::Receiver<(Instant, Job)>) {
    let mut pending: BinaryHeap<Scheduled> = BinaryHeap::new();
    let mut seq = 0u64;

    loop {
        let now = Instant::now();
        while pending.peek().is_some_and(|next| next.deadline <= now) {
            if let Some(next) = pending.pop() {
                (next.job)();
            }
        }

        let received = match pending.peek() {
            Some(next) => {
                receiver.recv_timeout(next.deadline.saturating_duration_since(Instant::now()))
            }
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok((deadline, job)) => {
                seq += 1;
                pending.push(Scheduled { deadline, seq, job });
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Delayed callbacks still owed to their listeners
    while let Some(next) = pending.pop() {
        (next.job)();
    }
    debug!("Callback thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_jobs_run_in_deadline_order() {
        let dispatcher = CallbackDispatcher::start().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = mpsc::channel();

        let o = Arc::clone(&order);
        dispatcher.post_after(Duration::from_millis(40), move || {
            o.lock().unwrap().push("late");
            done_tx.send(()).unwrap();
        });
        let o = Arc::clone(&order);
        dispatcher.post(move || o.lock().unwrap().push("first"));
        let o = Arc::clone(&order);
        dispatcher.post(move || o.lock().unwrap().push("second"));

        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "late"]);
    }

    #[test]
    fn test_drop_flushes_delayed_jobs() {
        let ran = Arc::new(Mutex::new(false));
        {
            let dispatcher = CallbackDispatcher::start().unwrap();
            let flag = Arc::clone(&ran);
            dispatcher.post_after(Duration::from_secs(30), move || *flag.lock().unwrap() = true);
        }
        assert!(*ran.lock().unwrap());
    }
}
