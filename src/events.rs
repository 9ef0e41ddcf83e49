// SPDX-License-Identifier: GPL-3.0-only

//! Typed event channels for devices, sessions and frames
//!
//! Each entity owns one `EventBus` and is its only writer. Lifecycle buses
//! keep a short history that is replayed to new subscribers, so a client that
//! subscribes right after creating a session still sees events the platform
//! fired before it got there. Frame buses are live-only.

use crate::backends::camera::SessionId;
use crate::render::TextureHandle;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

/// Device lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Opened {
        camera_id: String,
    },
    /// `camera_id` is `None` if the device never finished opening
    Closed {
        camera_id: Option<String>,
    },
    Erred {
        camera_id: Option<String>,
        code: i32,
    },
    Disconnected {
        camera_id: String,
    },
    /// A pipeline could not be created on an open device
    SessionRejected {
        camera_id: String,
        reason: String,
    },
}

/// Session lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Configured {
        session: SessionId,
    },
    /// `is_access_or_security_error` is true when the platform already tore
    /// the session down and no further close action is needed
    ConfigurationFailed {
        session: SessionId,
        is_access_or_security_error: bool,
    },
    RequestSet {
        session: SessionId,
        sequence_id: u64,
    },
    RequestFailed {
        session: SessionId,
        code: i32,
    },
    Active {
        session: SessionId,
    },
    /// The graphics side could not be wired to an active session
    RegistrationFailed {
        session: SessionId,
        reason: String,
    },
    Closed {
        session: SessionId,
    },
    /// Session and bridge of a pipeline are both released
    DisposeCompleted {
        session: SessionId,
    },
}

/// Per-frame events
#[derive(Debug, Clone)]
pub enum FrameEvent {
    /// Raw planes were delivered on the capture thread
    FrameReady {
        session: SessionId,
        sequence: u64,
        timestamp_ns: i64,
        width: u32,
        height: u32,
    },
    /// A frame was converted into the pipeline's output texture
    FrameProcessed {
        session: SessionId,
        texture: TextureHandle,
        timestamp_ns: i64,
    },
}

impl FrameEvent {
    pub fn timestamp_ns(&self) -> i64 {
        match self {
            FrameEvent::FrameReady { timestamp_ns, .. }
            | FrameEvent::FrameProcessed { timestamp_ns, .. } => *timestamp_ns,
        }
    }
}

struct BusInner<E> {
    sender: broadcast::Sender<E>,
    history: Mutex<VecDeque<E>>,
    history_limit: usize,
}

/// Single-writer, multi-reader event channel
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Clone + Send + std::fmt::Debug + 'static> EventBus<E> {
    /// Bus that replays up to `limit` past events to new subscribers
    pub fn with_history(limit: usize) -> Self {
        Self::build(limit.max(1), limit)
    }

    /// Bus without replay
    pub fn live(capacity: usize) -> Self {
        Self::build(capacity.max(1), 0)
    }

    fn build(capacity: usize, history_limit: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                sender,
                history: Mutex::new(VecDeque::with_capacity(history_limit)),
                history_limit,
            }),
        }
    }

    pub fn emit(&self, event: E) {
        // Send under the history lock so subscribe() never sees an event twice
        let mut history = self.inner.history.lock().unwrap_or_else(|e| e.into_inner());
        if self.inner.history_limit > 0 {
            if history.len() == self.inner.history_limit {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // No subscribers is not an error
        let _ = self.inner.sender.send(event);
    }

    pub fn subscribe(&self) -> EventStream<E> {
        let history = self.inner.history.lock().unwrap_or_else(|e| e.into_inner());
        EventStream {
            backlog: history.clone(),
            receiver: self.inner.sender.subscribe(),
        }
    }

    /// Snapshot of the replay history
    pub fn history(&self) -> Vec<E> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Subscription to an `EventBus`
pub struct EventStream<E> {
    backlog: VecDeque<E>,
    receiver: broadcast::Receiver<E>,
}

impl<E: Clone + std::fmt::Debug> EventStream<E> {
    /// Next event; `None` once the bus is gone.
    ///
    /// Slow readers skip what they missed rather than fail.
    pub async fn recv(&mut self) -> Option<E> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event, or `None` if nothing arrives within `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<E> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<E> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// Wait for the first event matching `pred`, discarding others
    pub async fn wait_for(
        &mut self,
        timeout: Duration,
        mut pred: impl FnMut(&E) -> bool,
    ) -> Option<E> {
        let search = async {
            while let Some(event) = self.recv().await {
                if pred(&event) {
                    return Some(event);
                }
            }
            None
        };
        tokio::time::timeout(timeout, search).await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_history_replayed_to_late_subscriber() {
        let bus = EventBus::with_history(8);
        bus.emit(1u32);
        bus.emit(2);

        let mut stream = bus.subscribe();
        bus.emit(3);

        assert_eq!(stream.recv().await, Some(1));
        assert_eq!(stream.recv().await, Some(2));
        assert_eq!(stream.recv().await, Some(3));
        assert_eq!(stream.try_recv(), None);
    }

    #[tokio::test]
    async fn test_live_bus_has_no_replay() {
        let bus = EventBus::live(8);
        bus.emit(1u32);

        let mut stream = bus.subscribe();
        bus.emit(2);
        assert_eq!(stream.recv().await, Some(2));
        assert!(bus.history().is_empty());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let bus = EventBus::with_history(2);
        for i in 0..5u32 {
            bus.emit(i);
        }
        assert_eq!(bus.history(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_wait_for_skips_unmatched() {
        let bus = EventBus::with_history(8);
        let mut stream = bus.subscribe();
        bus.emit(1u32);
        bus.emit(10);

        let found = stream.wait_for(Duration::from_millis(100), |e| *e > 5).await;
        assert_eq!(found, Some(10));
        assert_eq!(
            stream.wait_for(Duration::from_millis(20), |_| true).await,
            None
        );
    }
}
