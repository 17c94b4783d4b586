//! Single-slot correlation state shared by the caller and the channel task.
//!
//! Only the most recently sent request id is tracked. The release signal is
//! one-shot for the lifetime of the owning client: once a correlated reply
//! fires it, every later wait returns immediately with the same text.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug)]
pub struct PendingRequest {
    msg_id: Mutex<Option<String>>,
    released: watch::Sender<Option<String>>,
}

impl Default for PendingRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequest {
    #[must_use]
    pub fn new() -> Self {
        let (released, _) = watch::channel(None);
        Self { msg_id: Mutex::new(None), released }
    }

    /// Make `msg_id` the pending request, returning the id it replaces.
    pub fn arm(&self, msg_id: &str) -> Option<String> {
        let mut slot = self.msg_id.lock().unwrap_or_else(PoisonError::into_inner);
        slot.replace(msg_id.to_owned())
    }

    /// Put back the id that [`PendingRequest::arm`] replaced.
    pub fn restore(&self, previous: Option<String>) {
        *self.msg_id.lock().unwrap_or_else(PoisonError::into_inner) = previous;
    }

    #[must_use]
    pub fn current(&self) -> Option<String> {
        self.msg_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether `parent_msg_id` refers to the pending request (ASCII case-insensitive).
    #[must_use]
    pub fn matches(&self, parent_msg_id: &str) -> bool {
        self.msg_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            .is_some_and(|pending| pending.eq_ignore_ascii_case(parent_msg_id))
    }

    /// Fire the release signal with the reply text.
    ///
    /// Returns `false` if the signal had already fired; the first text is kept.
    pub fn release(&self, text: String) -> bool {
        self.released.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(text);
            true
        })
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.borrow().is_some()
    }

    /// Wait for the release signal, bounded by `timeout` when given.
    ///
    /// Returns the released text, or `None` if the bound elapsed first.
    pub async fn wait(&self, timeout: Option<Duration>) -> Option<String> {
        let mut rx = self.released.subscribe();
        let released = rx.wait_for(Option::is_some);
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, released).await.ok()?,
            None => released.await,
        };
        outcome.ok().and_then(|text| (*text).clone())
    }
}

#[cfg(test)]
#[path = "pending_test.rs"]
mod tests;
