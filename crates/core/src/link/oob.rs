//! Out-of-band token plumbing for security V4 associations.
//!
//! Tokens arrive outside the BLE link (an association URL, a companion
//! app, NFC) and are handed to the association flow through an
//! [`OutOfBandTokenProvider`]. [`PostedTokenProvider`] is the simple slot
//! most sources use; [`CoalescingTokenProvider`] fans a request out over
//! several sources and takes the first token any of them produces.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use log::*;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::wire::model::OutOfBandAssociationToken;

/// Source of out-of-band association tokens
#[async_trait]
pub trait OutOfBandTokenProvider: Send + Sync {
    /// Resolve with a token once one is available.
    ///
    /// Resolves with `None` when the provider can rule a token out, or
    /// when it is reset while the request is outstanding.
    async fn request_token(&self) -> Option<OutOfBandAssociationToken>;

    /// Discard stored tokens and resolve outstanding requests with `None`
    fn reset(&self);
}

#[derive(Debug, Clone, Default)]
struct PostedState {
    token: Option<OutOfBandAssociationToken>,
    resets: u64,
}

/// Token slot fed by [`post`](PostedTokenProvider::post).
///
/// A posted token satisfies exactly one request; it is consumed on
/// delivery.
#[derive(Debug)]
pub struct PostedTokenProvider {
    state: watch::Sender<PostedState>,
}

impl Default for PostedTokenProvider {
    fn default() -> Self {
        let (state, _) = watch::channel(PostedState::default());
        PostedTokenProvider { state }
    }
}

impl PostedTokenProvider {
    /// Empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `token` available, resolving an outstanding request if any
    pub fn post(&self, token: OutOfBandAssociationToken) {
        self.state.send_modify(|state| state.token = Some(token));
    }
}

#[async_trait]
impl OutOfBandTokenProvider for PostedTokenProvider {
    async fn request_token(&self) -> Option<OutOfBandAssociationToken> {
        let mut receiver = self.state.subscribe();
        let resets_at_start = receiver.borrow().resets;
        let outcome = receiver
            .wait_for(|state| state.token.is_some() || state.resets != resets_at_start)
            .await;
        if outcome.is_err() {
            return None;
        }
        let mut taken = None;
        self.state.send_modify(|state| {
            if state.resets == resets_at_start {
                taken = state.token.take();
            }
        });
        taken
    }

    fn reset(&self) {
        self.state.send_modify(|state| {
            state.token = None;
            state.resets += 1;
        });
    }
}

/// Fans one token request out over every child registered before the
/// request began. The first token any child produces wins; children
/// registered after the request was issued are ignored for that request.
#[derive(Default)]
pub struct CoalescingTokenProvider {
    children: Mutex<Vec<Arc<dyn OutOfBandTokenProvider>>>,
    resets: Mutex<Option<watch::Sender<u64>>>,
}

impl CoalescingTokenProvider {
    /// Provider with no children yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token source
    pub fn register(&self, child: Arc<dyn OutOfBandTokenProvider>) {
        self.children.lock().unwrap().push(child);
    }

    fn reset_channel(&self) -> watch::Sender<u64> {
        self.resets
            .lock()
            .unwrap()
            .get_or_insert_with(|| watch::channel(0).0)
            .clone()
    }
}

#[async_trait]
impl OutOfBandTokenProvider for CoalescingTokenProvider {
    async fn request_token(&self) -> Option<OutOfBandAssociationToken> {
        // Snapshot: late registrations do not join this request
        let children: Vec<Arc<dyn OutOfBandTokenProvider>> =
            self.children.lock().unwrap().clone();
        if children.is_empty() {
            return None;
        }

        let resets = self.reset_channel();
        let mut reset_rx = resets.subscribe();
        let resets_at_start = *reset_rx.borrow();

        let mut requests: FuturesUnordered<_> =
            children.iter().map(|child| child.request_token()).collect();
        loop {
            tokio::select! {
                changed = reset_rx.changed() => {
                    if changed.is_err() || *reset_rx.borrow() != resets_at_start {
                        return None;
                    }
                }
                token = requests.next() => {
                    match token {
                        Some(Some(token)) => {
                            debug!("Out-of-band token delivered by a child provider");
                            return Some(token);
                        }
                        // This child ruled itself out; keep waiting on the rest
                        Some(None) => {}
                        None => return None,
                    }
                }
            }
        }
    }

    fn reset(&self) {
        let resets = self.reset_channel();
        resets.send_modify(|count| *count += 1);
        for child in self.children.lock().unwrap().iter() {
            child.reset();
        }
    }
}
