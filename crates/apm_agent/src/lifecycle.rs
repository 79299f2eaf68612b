//! Forward-only server lifecycle shared by the request server and the collector.
//!
//! ```text
//! NotStarted ──start()──► Listening ──stop()/exit──► Stopping ──loop ends──► Stopped
//!      │                                                                        ▲
//!      └──────────────────────────── bind failure ──────────────────────────────┘
//! ```
//!
//! The state lives in a `watch` channel so any task can wait for readiness or
//! shutdown without polling.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServerState {
    NotStarted,
    Listening,
    Stopping,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::NotStarted => "NOT_STARTED",
            ServerState::Listening => "LISTENING",
            ServerState::Stopping => "STOPPING",
            ServerState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StartupError {
    /// `start()` was already called on this instance
    #[error("server already started (state {0})")]
    AlreadyStarted(ServerState),
    /// The listener could not be bound
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),
}

#[derive(Debug)]
pub struct Lifecycle {
    state: watch::Sender<ServerState>,
    start_claimed: AtomicBool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ServerState::NotStarted);
        Self {
            state,
            start_claimed: AtomicBool::new(false),
        }
    }

    /// Claims the single `start()` call of this instance.
    pub fn claim_start(&self) -> Result<(), StartupError> {
        if self
            .start_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StartupError::AlreadyStarted(self.state()));
        }
        Ok(())
    }

    /// Moves to `next` if it is later than the current state.
    ///
    /// Returns whether the state changed.
    pub fn advance(&self, next: ServerState) -> bool {
        self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Whether `start()` has been called on this instance.
    pub fn is_start_claimed(&self) -> bool {
        self.start_claimed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Waits until the state satisfies `predicate`.
    pub async fn wait_until(&self, predicate: impl FnMut(&ServerState) -> bool) -> ServerState {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we borrow it
        let reached = match rx.wait_for(predicate).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_advance_is_forward_only() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), ServerState::NotStarted);

        assert!(lifecycle.advance(ServerState::Listening));
        assert!(!lifecycle.advance(ServerState::Listening));
        assert!(lifecycle.advance(ServerState::Stopped));
        assert!(!lifecycle.advance(ServerState::Stopping));
        assert_eq!(lifecycle.state(), ServerState::Stopped);
    }

    #[test]
    fn test_second_claim_fails() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.is_start_claimed());
        lifecycle.claim_start().unwrap();
        assert!(lifecycle.is_start_claimed());
        lifecycle.advance(ServerState::Listening);

        match lifecycle.claim_start() {
            Err(StartupError::AlreadyStarted(state)) => assert_eq!(state, ServerState::Listening),
            other => panic!("unexpected claim result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_until_sees_later_transition() {
        let lifecycle = Arc::new(Lifecycle::new());

        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move {
                lifecycle
                    .wait_until(|s| *s >= ServerState::Stopped)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        lifecycle.advance(ServerState::Listening);
        lifecycle.advance(ServerState::Stopped);

        let state = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, ServerState::Stopped);
    }
}
