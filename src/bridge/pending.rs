//! Single-slot rendezvous for an outstanding remote data request.
//!
//! The host's paste thread claims the slot with [`PendingSlot::begin`] and
//! blocks in [`PendingTicket::wait`]. The transport task settles it with
//! [`PendingSlot::fulfill`] when the matching Data message arrives. At most
//! one request is outstanding; the slot returns to idle on every exit path
//! because the ticket resets it on drop.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::BridgeError;
use crate::proto::FormatId;

/// How long a host paste waits for the remote side.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum SlotState {
    Idle,
    Awaiting(FormatId),
    Fulfilled(Vec<u8>),
    Failed,
}

/// Outcome of offering reply data to the slot.
#[derive(Debug, PartialEq, Eq)]
pub enum Fulfillment {
    /// The waiter got the bytes.
    Delivered,
    /// A request was outstanding for a different type. The waiter was
    /// failed and the bytes dropped.
    Mismatched { expected: FormatId },
    /// Nothing was outstanding; the bytes are handed back.
    NotPending(Vec<u8>),
    /// The outstanding request was already settled and not yet collected.
    Settled,
}

pub struct PendingSlot {
    state: Mutex<SlotState>,
    settled: Condvar,
    timeout: Duration,
}

impl PendingSlot {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(SlotState::Idle),
            settled: Condvar::new(),
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the slot for a request of `format`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Fatal`] if another request is outstanding.
    pub fn begin(&self, format: FormatId) -> Result<PendingTicket<'_>, BridgeError> {
        let mut state = self.lock();
        if !matches!(*state, SlotState::Idle) {
            return Err(BridgeError::Fatal(format!(
                "request for {format} while another is outstanding ({state:?})"
            )));
        }
        *state = SlotState::Awaiting(format);
        Ok(PendingTicket { slot: self })
    }

    /// Offer `data` of `format` to an outstanding request.
    pub fn fulfill(&self, format: FormatId, data: Vec<u8>) -> Fulfillment {
        let mut state = self.lock();
        let outcome = match *state {
            SlotState::Idle => return Fulfillment::NotPending(data),
            SlotState::Fulfilled(_) | SlotState::Failed => return Fulfillment::Settled,
            SlotState::Awaiting(expected) if expected == format => {
                *state = SlotState::Fulfilled(data);
                Fulfillment::Delivered
            }
            SlotState::Awaiting(expected) => {
                *state = SlotState::Failed;
                Fulfillment::Mismatched { expected }
            }
        };
        drop(state);
        self.settled.notify_all();
        outcome
    }

    /// Fail an outstanding request for `format`. Returns whether it did.
    pub fn fail(&self, format: FormatId) -> bool {
        let mut state = self.lock();
        match *state {
            SlotState::Awaiting(expected) if expected == format => {
                *state = SlotState::Failed;
                drop(state);
                self.settled.notify_all();
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        matches!(*self.lock(), SlotState::Idle)
    }
}

/// Claim on the slot held by the waiting thread.
pub struct PendingTicket<'a> {
    slot: &'a PendingSlot,
}

impl PendingTicket<'_> {
    /// Block until the request settles or the timeout expires.
    pub fn wait(self) -> Result<Vec<u8>, BridgeError> {
        let guard = self.slot.lock();
        let (mut state, _) = self
            .slot
            .settled
            .wait_timeout_while(guard, self.slot.timeout, |s| {
                matches!(s, SlotState::Awaiting(_))
            })
            .unwrap_or_else(PoisonError::into_inner);

        let result = match std::mem::replace(&mut *state, SlotState::Idle) {
            SlotState::Fulfilled(data) => Ok(data),
            SlotState::Failed => Err(BridgeError::RequestFailed),
            SlotState::Awaiting(_) => Err(BridgeError::RequestTimeout),
            SlotState::Idle => Err(BridgeError::Fatal("pending slot reset while waiting".into())),
        };
        drop(state);
        result
    }
}

impl Drop for PendingTicket<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = SlotState::Idle;
    }
}
