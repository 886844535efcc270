//! Request coalescing for cache fills
//!
//! The first caller to miss on a key claims a [`FillToken`]; everyone else
//! who misses while the token is alive subscribes to its outcome. The token
//! publishes exactly one terminal state: the computed value, a failure
//! (with the admission rejection behind it, if any), or (if it is dropped unresolved) `Abandoned`, which tells
//! waiters to race for a new token.

use crate::error::Rejection;
use crate::fingerprint::Fingerprint;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// State of one in-flight fill as seen by waiters
#[derive(Debug, Clone)]
pub(crate) enum FillState {
    Pending,
    Ready(Bytes),
    Failed(FillFailure),
    Abandoned,
}

/// Why a fill failed, as replayed to its waiters
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FillFailure {
    pub reason: String,
    /// Set when the filler was turned away before running
    pub rejection: Option<Rejection>,
}

type FillTable = DashMap<Fingerprint, watch::Receiver<FillState>>;

/// Table of fills currently in progress, keyed by fingerprint
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    fills: Arc<FillTable>,
}

pub(crate) enum Claim {
    /// The caller must compute the value
    Filler(FillToken),
    /// Someone else is computing it
    Waiter(watch::Receiver<FillState>),
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Become the filler for `key`, or subscribe to the current one
    pub(crate) fn claim(&self, key: &Fingerprint) -> Claim {
        match self.fills.entry(key.clone()) {
            Entry::Occupied(occupied) => Claim::Waiter(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let (sender, receiver) = watch::channel(FillState::Pending);
                vacant.insert(receiver);
                Claim::Filler(FillToken {
                    key: key.clone(),
                    sender,
                    fills: Arc::clone(&self.fills),
                    resolved: false,
                })
            }
        }
    }

    /// Number of fills currently running
    pub(crate) fn len(&self) -> usize {
        self.fills.len()
    }
}

/// Exclusive right to fill one key
///
/// At most one token exists per key. Dropping it without calling
/// [`complete`](Self::complete) or [`fail`](Self::fail) (e.g. because the
/// filler was cancelled) releases the key and wakes waiters.
#[derive(Debug)]
pub struct FillToken {
    key: Fingerprint,
    sender: watch::Sender<FillState>,
    fills: Arc<FillTable>,
    resolved: bool,
}

impl FillToken {
    pub fn key(&self) -> &Fingerprint {
        &self.key
    }

    pub(crate) fn complete(mut self, value: Bytes) {
        self.resolve(FillState::Ready(value));
    }

    pub(crate) fn fail(mut self, failure: FillFailure) {
        self.resolve(FillState::Failed(failure));
    }

    fn resolve(&mut self, state: FillState) {
        self.resolved = true;
        // Unregister first so that late arrivals start a fresh fill instead
        // of subscribing to a finished one
        self.fills.remove(&self.key);
        self.sender.send_replace(state);
    }
}

impl Drop for FillToken {
    fn drop(&mut self) {
        if !self.resolved {
            self.resolve(FillState::Abandoned);
        }
    }
}

/// Wait until the fill behind `receiver` reaches a terminal state
pub(crate) async fn wait_for_fill(mut receiver: watch::Receiver<FillState>) -> FillState {
    let outcome = receiver
        .wait_for(|state| !matches!(state, FillState::Pending))
        .await
        .map(|state| state.clone());

    match outcome {
        Ok(state) => state,
        // Sender vanished without publishing
        Err(_) => FillState::Abandoned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Fingerprint {
        Fingerprint::named("coalesce", "k")
    }

    #[tokio::test]
    async fn test_second_claim_waits_on_first() {
        let inflight = InFlight::new();

        let Claim::Filler(token) = inflight.claim(&key()) else {
            panic!("first claim must fill");
        };
        let Claim::Waiter(rx) = inflight.claim(&key()) else {
            panic!("second claim must wait");
        };
        assert_eq!(inflight.len(), 1);

        let waiter = tokio::spawn(wait_for_fill(rx));
        token.complete(Bytes::from_static(b"done"));

        match waiter.await.unwrap() {
            FillState::Ready(value) => assert_eq!(&value[..], b"done"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(inflight.len(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_broadcast_and_not_retained() {
        let inflight = InFlight::new();
        let Claim::Filler(token) = inflight.claim(&key()) else {
            panic!("first claim must fill");
        };
        let Claim::Waiter(rx) = inflight.claim(&key()) else {
            panic!("second claim must wait");
        };

        token.fail(FillFailure {
            reason: "upstream refused".to_string(),
            rejection: Some(Rejection::ShuttingDown),
        });

        match wait_for_fill(rx).await {
            FillState::Failed(failure) => {
                assert_eq!(failure.reason, "upstream refused");
                assert_eq!(failure.rejection, Some(Rejection::ShuttingDown));
            }
            other => panic!("unexpected {other:?}"),
        }
        // A later caller starts over
        assert!(matches!(inflight.claim(&key()), Claim::Filler(_)));
    }

    #[tokio::test]
    async fn test_dropped_token_abandons_fill() {
        let inflight = InFlight::new();
        let Claim::Filler(token) = inflight.claim(&key()) else {
            panic!("first claim must fill");
        };
        let Claim::Waiter(rx) = inflight.claim(&key()) else {
            panic!("second claim must wait");
        };

        drop(token);

        assert!(matches!(wait_for_fill(rx).await, FillState::Abandoned));
        assert_eq!(inflight.len(), 0);
    }
}
