//! Connection state machine.
//!
//! Sequences transport opens and interprets their failures:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting(UsbDirect)          (permission held)
//! Disconnected ──connect──▶ PermissionRequired
//! PermissionRequired ──granted──▶ Connecting(UsbDirect)
//! PermissionRequired ──denied───▶ Connecting(AdbTunnel)
//! Connecting(UsbDirect) ──backend unavailable──▶ Connecting(AdbTunnel)
//! Connecting(AdbTunnel) ──host unreachable──▶ Connecting(SimulatedTcp)  (simulation enabled)
//! Connecting(k) ──open ok──▶ Connected(k)
//! Connected(k) ──link error──▶ Error
//! any ──disconnect──▶ Disconnected
//! ```
//!
//! The machine does no I/O itself; it asks a [`LinkOpener`] and hands the
//! resulting [`Link`] back to the caller. It is the only writer of
//! [`ConnectionState`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::permission::{PermissionGate, PermissionOutcome};
use crate::transport::{Link, LinkOpener, TransportKind};

/// Observable connection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No link and no attempt running
    Disconnected,
    /// Waiting for the user to answer the USB prompt
    PermissionRequired,
    /// Opening a transport
    Connecting(TransportKind),
    /// Link up
    Connected(TransportKind),
    /// Last attempt or link failed; not retried automatically
    Error(String),
}

impl ConnectionState {
    /// Whether a link is up.
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    /// Whether a connect attempt is running.
    pub const fn is_connecting(&self) -> bool {
        matches!(self, Self::PermissionRequired | Self::Connecting(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::PermissionRequired => f.write_str("waiting for USB permission"),
            Self::Connecting(kind) => write!(f, "connecting over {kind}"),
            Self::Connected(kind) => write!(f, "connected over {kind}"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Transitions kept for subscribers that lag behind.
const TRANSITION_BUFFER: usize = 32;

struct Attempt {
    id: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct AttemptSlot {
    current: Option<Attempt>,
    next_id: u64,
}

/// Owns [`ConnectionState`] and runs connect attempts.
///
/// Two views are published: a [`watch`] channel holding the latest state,
/// and a [`broadcast`] channel carrying every transition in order.
pub struct ConnectionStateMachine {
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    gate: Arc<PermissionGate>,
    opener: Arc<dyn LinkOpener>,
    simulation_enabled: bool,
    attempt: Mutex<AttemptSlot>,
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("state", &*self.state.borrow())
            .field("simulation_enabled", &self.simulation_enabled)
            .finish_non_exhaustive()
    }
}

impl ConnectionStateMachine {
    /// Create a machine in `Disconnected`.
    pub fn new(
        gate: Arc<PermissionGate>,
        opener: Arc<dyn LinkOpener>,
        simulation_enabled: bool,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        Self {
            state,
            transitions,
            gate,
            opener,
            simulation_enabled,
            attempt: Mutex::new(AttemptSlot::default()),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Subscribe to the latest state.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Subscribe to every transition from now on.
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    /// Run one connect attempt and return the opened link.
    ///
    /// Transports are tried in the fixed fallback order; a transport that
    /// failed in this attempt is never tried again within it.
    ///
    /// # Errors
    ///
    /// - `Error::ConnectInProgress` or `Error::AlreadyConnected` if the
    ///   machine is busy
    /// - `Error::Cancelled` if [`disconnect`](Self::disconnect) ran meanwhile
    /// - the last transport error, after moving to `Error`
    pub async fn connect(&self) -> Result<Link> {
        let (id, token) = {
            let mut slot = self.lock_attempt()?;
            // The attempt owns the slot before its first transition is visible.
            if slot.current.is_some() {
                return Err(Error::ConnectInProgress);
            }
            match &*self.state.borrow() {
                ConnectionState::PermissionRequired | ConnectionState::Connecting(_) => {
                    return Err(Error::ConnectInProgress)
                }
                ConnectionState::Connected(_) => return Err(Error::AlreadyConnected),
                ConnectionState::Disconnected | ConnectionState::Error(_) => {}
            }
            slot.next_id += 1;
            let id = slot.next_id;
            let token = CancellationToken::new();
            slot.current = Some(Attempt {
                id,
                token: token.clone(),
            });
            (id, token)
        };

        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(Error::Cancelled),
            result = self.run_attempt(&token) => result,
        };

        if let Ok(mut slot) = self.attempt.lock() {
            if slot.current.as_ref().is_some_and(|a| a.id == id) {
                slot.current = None;
            }
        }

        match result {
            Ok(mut link) if token.is_cancelled() => {
                link.close().await;
                Err(Error::Cancelled)
            }
            other => other,
        }
    }

    async fn run_attempt(&self, token: &CancellationToken) -> Result<Link> {
        let mut kind = if self.gate.has_permission() {
            TransportKind::UsbDirect
        } else {
            self.advance(token, ConnectionState::PermissionRequired)?;
            match self.gate.request_permission().await {
                Ok(PermissionOutcome::Granted) => TransportKind::UsbDirect,
                Ok(PermissionOutcome::Denied) => TransportKind::AdbTunnel,
                Err(e) => {
                    tracing::warn!(error = %e, "Permission prompt failed");
                    self.advance(token, ConnectionState::Error(e.to_string()))?;
                    return Err(e);
                }
            }
        };

        loop {
            self.advance(token, ConnectionState::Connecting(kind))?;

            let err = match self.opener.open_link(kind).await {
                Ok(link) => {
                    self.advance(token, ConnectionState::Connected(kind))?;
                    tracing::info!(%kind, "Connected");
                    return Ok(link);
                }
                Err(e) => e,
            };

            let next = match (kind, &err) {
                (
                    TransportKind::UsbDirect,
                    Error::BackendUnavailable(_) | Error::PermissionDenied,
                ) => Some(TransportKind::AdbTunnel),
                (TransportKind::AdbTunnel, Error::HostUnreachable { .. })
                    if self.simulation_enabled =>
                {
                    Some(TransportKind::SimulatedTcp)
                }
                _ => None,
            };

            match next {
                Some(next) => {
                    tracing::info!(from = %kind, to = %next, error = %err, "Falling back");
                    kind = next;
                }
                None => {
                    tracing::warn!(%kind, error = %err, "Connect failed");
                    self.advance(token, ConnectionState::Error(err.to_string()))?;
                    return Err(err);
                }
            }
        }
    }

    /// Move to `Disconnected`, aborting any running attempt.
    pub fn disconnect(&self) {
        let mut slot = match self.attempt.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(attempt) = slot.current.take() {
            attempt.token.cancel();
        }
        self.set(ConnectionState::Disconnected);
    }

    /// The connected link failed.
    ///
    /// Only acts while `Connected`; a late report after a disconnect is ignored.
    pub fn link_lost(&self, reason: &str) {
        if self.state.borrow().is_connected() {
            tracing::warn!(reason, "Link lost");
            self.set(ConnectionState::Error(reason.to_string()));
        }
    }

    /// Move to `Error` from any state, e.g. after a failed handshake.
    pub fn fail(&self, reason: &str) {
        self.set(ConnectionState::Error(reason.to_string()));
    }

    /// State update on behalf of the attempt owning `token`.
    ///
    /// Runs under the attempt lock so a concurrent disconnect cannot be
    /// overwritten by a stale transition.
    fn advance(&self, token: &CancellationToken, next: ConnectionState) -> Result<()> {
        let _slot = self.lock_attempt()?;
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.set(next);
        Ok(())
    }

    fn set(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Connection state changed");
            // No subscribers is fine.
            let _ = self.transitions.send(next);
        }
    }

    fn lock_attempt(&self) -> Result<MutexGuard<'_, AttemptSlot>> {
        self.attempt
            .lock()
            .map_err(|_| Error::Internal("connection attempt lock poisoned".to_string()))
    }
}
