//! Shutdown state of one direction.
//!
//! ```text
//!   Open ──(drain begins)──▶ Closing ──(reader ends)──▶ Closed
//!     └────────────(reader ends)────────────────────────▲
//! ```
//!
//! Parse errors are only worth reporting while a direction is `Open`; once
//! the drain has started, truncated messages are expected.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Open,
    Closing,
    Closed,
}

impl Lifecycle {
    pub fn reports_errors(self) -> bool {
        self == Lifecycle::Open
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Lifecycle::Open,
            1 => Lifecycle::Closing,
            _ => Lifecycle::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Lifecycle::Open => 0,
            Lifecycle::Closing => 1,
            Lifecycle::Closed => 2,
        }
    }
}

/// Lifecycle shared between the driver, which starts the drain, and the
/// reader task, which observes it and finally closes it.
#[derive(Debug)]
pub struct LifecycleCell(AtomicU8);

impl Default for LifecycleCell {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(Lifecycle::Open.as_u8()))
    }

    pub fn get(&self) -> Lifecycle {
        Lifecycle::from_u8(self.0.load(Ordering::Acquire))
    }

    /// `Open → Closing`. A direction that already closed stays closed.
    pub fn begin_closing(&self) {
        let _ = self.0.compare_exchange(
            Lifecycle::Open.as_u8(),
            Lifecycle::Closing.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Any state `→ Closed`.
    pub fn finish(&self) {
        self.0.store(Lifecycle::Closed.as_u8(), Ordering::Release);
    }
}
