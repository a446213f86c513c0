//! Session facade.
//!
//! A [`Session`] owns one of each component and wires them together:
//!
//! ```text
//! PermissionGate ─▶ ConnectionStateMachine ─▶ TransportLink
//!                         │ link
//!                         ▼
//!                  RequestDispatcher ◀── FileOperationsClient
//!                         ▲
//!                         └───────────── TransferManager
//! ```
//!
//! It is the only place that starts and stops dispatchers, so there is at
//! most one live link at any time. When the link ends on its own, the
//! session moves the connection to `Error` and fails running transfers.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connection::{ConnectionState, ConnectionStateMachine};
use crate::dispatch::{DispatcherSlot, RequestDispatcher};
use crate::error::{FailureKind, FailureReason, Result};
use crate::files::{FileOperationsClient, HostInfo};
use crate::permission::{FixedPermission, PermissionGate, PermissionOutcome, PermissionPlatform};
use crate::protocol::Opcode;
use crate::transfer::{TaskStore, TransferManager};
use crate::transport::usb::UsbBackend;
use crate::transport::{LinkOpener, TransportLink};

/// How long the goodbye message may take; the link is closed either way.
const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Builder for [`Session`].
pub struct SessionBuilder {
    config: Config,
    platform: Option<Arc<dyn PermissionPlatform>>,
    usb: Option<Arc<dyn UsbBackend>>,
    opener: Option<Arc<dyn LinkOpener>>,
}

impl SessionBuilder {
    /// Platform that answers USB permission questions.
    ///
    /// Defaults to one that never grants, so USB is skipped.
    #[must_use]
    pub fn permission_platform(mut self, platform: Arc<dyn PermissionPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Backend that opens the USB bulk endpoints.
    #[must_use]
    pub fn usb_backend(mut self, backend: Arc<dyn UsbBackend>) -> Self {
        self.usb = Some(backend);
        self
    }

    /// Replace the built-in transports entirely.
    ///
    /// `usb_backend` is ignored when an opener is set.
    #[must_use]
    pub fn link_opener(mut self, opener: Arc<dyn LinkOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    /// Assemble the session. Nothing is opened yet.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the configuration fails
    /// [`Config::validate`].
    pub fn build(self) -> Result<Session> {
        self.config.validate()?;

        let platform = self
            .platform
            .unwrap_or_else(|| Arc::new(FixedPermission::new(false)));
        let gate = Arc::new(PermissionGate::new(platform));

        let opener = self.opener.unwrap_or_else(|| {
            let mut transport = TransportLink::new(self.config.link.clone(), Arc::clone(&gate));
            if let Some(usb) = self.usb {
                transport = transport.with_usb_backend(usb);
            }
            Arc::new(transport)
        });

        let machine = ConnectionStateMachine::new(
            Arc::clone(&gate),
            opener,
            self.config.link.simulation_enabled,
        );

        let slot = DispatcherSlot::new();
        let files = FileOperationsClient::new(slot.handle());
        let store = self
            .config
            .transfer
            .persist_tasks
            .then(|| TaskStore::new(&self.config.transfer.state_dir()));
        let transfers = TransferManager::new(slot.handle(), self.config.transfer.clone(), store);

        Ok(Session {
            inner: Arc::new(SessionInner {
                config: self.config,
                gate,
                machine,
                slot,
                files,
                transfers,
                host: Mutex::new(None),
                supervisor: Mutex::new(None),
            }),
        })
    }
}

struct SessionInner {
    config: Config,
    gate: Arc<PermissionGate>,
    machine: ConnectionStateMachine,
    slot: DispatcherSlot,
    files: FileOperationsClient,
    transfers: TransferManager,
    host: Mutex<Option<HostInfo>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionInner {
    fn set_host(&self, host: Option<HostInfo>) {
        *self.host.lock().unwrap_or_else(PoisonError::into_inner) = host;
    }

    fn replace_supervisor(&self, handle: Option<JoinHandle<()>>) {
        let previous = std::mem::replace(
            &mut *self
                .supervisor
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            handle,
        );
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// React to a link that ended without being asked to.
    async fn on_link_closed(&self, dispatcher: &Arc<RequestDispatcher>, reason: &str) {
        if !self.slot.take_if(dispatcher) {
            return;
        }
        self.set_host(None);
        self.machine.link_lost(reason);
        self.transfers
            .fail_active(&FailureReason::new(
                FailureKind::LinkLost,
                format!("link lost: {reason}"),
            ))
            .await;
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.slot.take() {
            dispatcher.close();
        }
        self.replace_supervisor(None);
    }
}

/// The entry point: connect, browse, transfer.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.inner.machine.state())
            .field("transfers", &self.inner.transfers)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start building a session from `config`.
    pub fn builder(config: Config) -> SessionBuilder {
        SessionBuilder {
            config,
            platform: None,
            usb: None,
            opener: None,
        }
    }

    /// Configuration the session was built with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Open a link and greet the host.
    ///
    /// Pending transfers start once the handshake succeeds. Calling this
    /// while connected returns the host already greeted.
    ///
    /// # Errors
    ///
    /// Returns the connect error of the last transport tried, or the
    /// handshake error; either way the state ends in `Error`.
    pub async fn connect(&self) -> Result<HostInfo> {
        if self.inner.machine.state().is_connected() {
            if let Some(host) = self.host_info() {
                return Ok(host);
            }
        }

        let link = self.inner.machine.connect().await?;
        let dispatcher = RequestDispatcher::start(link, &self.inner.config.protocol);
        if let Some(stale) = self.inner.slot.install(Arc::clone(&dispatcher)) {
            stale.close();
        }

        let host = match self.inner.files.handshake().await {
            Ok(host) => host,
            Err(e) => {
                self.inner.slot.take_if(&dispatcher);
                dispatcher.close();
                // A disconnect during the handshake already settled the state.
                if self.inner.machine.state().is_connected() {
                    self.inner.machine.fail(&format!("handshake failed: {e}"));
                }
                return Err(e);
            }
        };

        self.inner.set_host(Some(host.clone()));
        self.inner
            .replace_supervisor(Some(tokio::spawn(supervise(
                Arc::downgrade(&self.inner),
                dispatcher,
            ))));
        self.inner.transfers.start_pending();

        Ok(host)
    }

    /// End the session.
    ///
    /// Sends a best-effort goodbye, closes the link and aborts any connect
    /// attempt still running. Transfers in progress fail as link lost. The
    /// task list is saved before this returns.
    pub async fn disconnect(&self) {
        self.inner.replace_supervisor(None);
        self.inner.set_host(None);

        if let Some(dispatcher) = self.inner.slot.take() {
            if let Err(e) = dispatcher
                .send_with_timeout(Opcode::Disconnect, Vec::new(), DISCONNECT_TIMEOUT)
                .await
            {
                tracing::debug!(error = %e, "Host did not acknowledge disconnect");
            }
            dispatcher.close();
            self.inner
                .transfers
                .fail_active(&FailureReason::new(
                    FailureKind::LinkLost,
                    "disconnected by user",
                ))
                .await;
        }

        self.inner.machine.disconnect();
        self.inner.transfers.flush().await;
        tracing::info!("Disconnected");
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.machine.state()
    }

    /// Latest-state stream.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.machine.subscribe()
    }

    /// Every state transition from now on.
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.machine.transitions()
    }

    /// Host identity from the last handshake, while connected.
    pub fn host_info(&self) -> Option<HostInfo> {
        self.inner
            .host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether USB permission is currently held.
    pub fn has_permission(&self) -> bool {
        self.inner.gate.has_permission()
    }

    /// Ask for USB permission; concurrent callers share one prompt.
    ///
    /// # Errors
    ///
    /// Returns an error only if the platform prompt fails outright.
    pub async fn request_permission(&self) -> Result<PermissionOutcome> {
        self.inner.gate.request_permission().await
    }

    /// Remote file operations.
    pub fn files(&self) -> &FileOperationsClient {
        &self.inner.files
    }

    /// Transfer tasks.
    pub fn transfers(&self) -> &TransferManager {
        &self.inner.transfers
    }

    /// Load transfer tasks saved by an earlier process.
    ///
    /// Returns how many tasks were restored; 0 when persistence is off.
    ///
    /// # Errors
    ///
    /// Returns an error if the saved list exists but cannot be read.
    pub async fn restore_transfers(&self) -> Result<usize> {
        self.inner.transfers.restore().await
    }
}

/// Watch one dispatcher until its link ends.
async fn supervise(session: Weak<SessionInner>, dispatcher: Arc<RequestDispatcher>) {
    let reason = dispatcher.closed().await;
    let Some(inner) = session.upgrade() else {
        return;
    };
    tracing::debug!(reason = %reason, "Link closed");
    inner.on_link_closed(&dispatcher, &reason).await;
}
