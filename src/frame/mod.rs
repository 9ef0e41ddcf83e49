// SPDX-License-Identifier: GPL-3.0-only

//! Raw frame intake: the triple-buffered pool, its capture thread and the
//! delivery gate that fences callbacks against session close.

mod capture_thread;
mod gate;
mod pool;

pub use capture_thread::{FrameCallback, FrameSource, FrameSourceStats};
pub use gate::{DeliveryGate, GatePermit};
pub use pool::{FramePool, FrameProducer, FrameReadGuard, FrameWriteGuard, PoolStats};
