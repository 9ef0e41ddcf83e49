// SPDX-License-Identifier: GPL-3.0-only

//! Delivery gate for frame callbacks
//!
//! Every frame callback runs inside a permit. Closing the gate refuses new
//! permits and then waits for the outstanding ones, which is how session close
//! guarantees that no callback runs once it has completed.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct GateState {
    open: bool,
    in_flight: usize,
}

#[derive(Debug)]
pub struct DeliveryGate {
    state: Mutex<GateState>,
    drained: Condvar,
}

impl DeliveryGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                open: true,
                in_flight: 0,
            }),
            drained: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enter the gate for one delivery; `None` once it is closed.
    pub fn enter(&self) -> Option<GatePermit<'_>> {
        let mut state = self.lock();
        if !state.open {
            return None;
        }
        state.in_flight += 1;
        Some(GatePermit { gate: self })
    }

    /// Close the gate and block until in-flight deliveries finish.
    ///
    /// Returns `false` if deliveries were still running when `timeout` elapsed.
    /// The gate stays closed either way.
    pub fn close_and_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        state.open = false;
        while state.in_flight > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .drained
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }
}

impl Default for DeliveryGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the duration of one delivery
pub struct GatePermit<'a> {
    gate: &'a DeliveryGate,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.gate.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_closed_gate_refuses_entry() {
        let gate = DeliveryGate::new();
        assert!(gate.enter().is_some());
        assert!(gate.close_and_drain(Duration::from_millis(10)));
        assert!(gate.enter().is_none());
    }

    #[test]
    fn test_drain_waits_for_in_flight_delivery() {
        let gate = Arc::new(DeliveryGate::new());
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();

        let worker = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || {
                let _permit = gate.enter().unwrap();
                entered_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(50));
            })
        };

        entered_rx.recv().unwrap();
        let start = Instant::now();
        assert!(gate.close_and_drain(Duration::from_secs(2)));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(gate.in_flight(), 0);
        worker.join().unwrap();
    }

    #[test]
    fn test_drain_timeout_reports_failure() {
        let gate = DeliveryGate::new();
        let permit = gate.enter().unwrap();
        assert!(!gate.close_and_drain(Duration::from_millis(10)));
        drop(permit);
        assert_eq!(gate.in_flight(), 0);
    }
}
