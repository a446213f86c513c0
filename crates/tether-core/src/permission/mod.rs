//! USB permission tracking.
//!
//! Platforms grant USB access through a prompt that answers via callback.
//! [`PermissionGate`] turns that callback into an awaitable request and keeps
//! at most one prompt on screen: callers arriving while a prompt is pending
//! wait for the same answer.

use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};

use crate::error::{Error, Result};

/// Answer to a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOutcome {
    /// Access granted
    Granted,
    /// Access refused, or the prompt was dismissed
    Denied,
}

/// Completes one permission request.
///
/// Dropping it without answering counts as [`PermissionOutcome::Denied`].
#[derive(Debug)]
pub struct PermissionResponder {
    tx: oneshot::Sender<PermissionOutcome>,
}

impl PermissionResponder {
    /// Deliver the platform's answer.
    pub fn respond(self, outcome: PermissionOutcome) {
        // The gate may have been dropped; nobody is left to tell.
        let _ = self.tx.send(outcome);
    }

    /// Shorthand for `respond(Granted)`.
    pub fn grant(self) {
        self.respond(PermissionOutcome::Granted);
    }

    /// Shorthand for `respond(Denied)`.
    pub fn deny(self) {
        self.respond(PermissionOutcome::Denied);
    }
}

/// Platform side of USB permission handling.
pub trait PermissionPlatform: Send + Sync {
    /// Whether access is currently granted.
    fn has_permission(&self) -> bool;

    /// Show the platform prompt; answer through `responder` when it returns.
    fn prompt(&self, responder: PermissionResponder);
}

/// Platform whose answer never changes.
///
/// Desktop hosts where access is governed by device rules use `granted =
/// true`; builds without USB support use `false`.
#[derive(Debug, Clone, Copy)]
pub struct FixedPermission {
    granted: bool,
}

impl FixedPermission {
    /// Create a platform that always answers `granted`.
    pub const fn new(granted: bool) -> Self {
        Self { granted }
    }
}

impl PermissionPlatform for FixedPermission {
    fn has_permission(&self) -> bool {
        self.granted
    }

    fn prompt(&self, responder: PermissionResponder) {
        if self.granted {
            responder.grant();
        } else {
            responder.deny();
        }
    }
}

type PendingOutcome = Shared<BoxFuture<'static, PermissionOutcome>>;

struct PendingRequest {
    ticket: u64,
    outcome: PendingOutcome,
}

#[derive(Default)]
struct GateState {
    pending: Option<PendingRequest>,
    next_ticket: u64,
}

/// Tracks USB permission and serialises prompts.
pub struct PermissionGate {
    platform: Arc<dyn PermissionPlatform>,
    state: Mutex<GateState>,
    events: watch::Sender<bool>,
}

impl std::fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGate")
            .field("granted", &*self.events.borrow())
            .finish_non_exhaustive()
    }
}

impl PermissionGate {
    /// Create a gate over a platform.
    pub fn new(platform: Arc<dyn PermissionPlatform>) -> Self {
        let granted = platform.has_permission();
        let (events, _) = watch::channel(granted);
        Self {
            platform,
            state: Mutex::new(GateState::default()),
            events,
        }
    }

    /// Whether access is currently granted.
    pub fn has_permission(&self) -> bool {
        self.platform.has_permission()
    }

    /// Permission-changed events. The value is the current grant.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.events.subscribe()
    }

    /// Re-read the platform state and emit an event if it changed.
    ///
    /// Platforms call this from attach/detach or revocation callbacks.
    pub fn refresh(&self) {
        self.publish(self.platform.has_permission());
    }

    /// Ask the platform for access.
    ///
    /// Returns immediately if access is already granted. Otherwise suspends
    /// until the platform answers; concurrent callers share one prompt.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the gate's lock was poisoned.
    pub async fn request_permission(&self) -> Result<PermissionOutcome> {
        if self.has_permission() {
            return Ok(PermissionOutcome::Granted);
        }

        let (ticket, outcome) = self.join_or_prompt()?;
        let outcome = outcome.await;

        {
            let mut state = self.lock()?;
            if state.pending.as_ref().is_some_and(|p| p.ticket == ticket) {
                state.pending = None;
            }
        }

        tracing::info!(?outcome, "USB permission answered");
        self.publish(outcome == PermissionOutcome::Granted);
        Ok(outcome)
    }

    fn join_or_prompt(&self) -> Result<(u64, PendingOutcome)> {
        let mut state = self.lock()?;

        // A finished request nobody collected is stale; prompt again.
        if let Some(pending) = &state.pending {
            if pending.outcome.peek().is_none() {
                tracing::debug!(ticket = pending.ticket, "Joining pending permission request");
                return Ok((pending.ticket, pending.outcome.clone()));
            }
        }

        let (tx, rx) = oneshot::channel();
        let outcome: PendingOutcome = async move { rx.await.unwrap_or(PermissionOutcome::Denied) }
            .boxed()
            .shared();

        state.next_ticket += 1;
        let ticket = state.next_ticket;
        state.pending = Some(PendingRequest {
            ticket,
            outcome: outcome.clone(),
        });
        drop(state);

        tracing::debug!(ticket, "Prompting for USB permission");
        self.platform.prompt(PermissionResponder { tx });
        Ok((ticket, outcome))
    }

    fn publish(&self, granted: bool) {
        self.events.send_if_modified(|current| {
            if *current == granted {
                false
            } else {
                *current = granted;
                true
            }
        });
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, GateState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("permission gate lock poisoned".to_string()))
    }
}
