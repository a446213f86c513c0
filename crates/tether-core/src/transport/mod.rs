//! One byte stream over whichever transport is available.
//!
//! A [`Link`] is the unified handle: it reads and writes bytes the same way
//! whether it sits on a USB bulk endpoint pair, an ADB-forwarded TCP port or
//! a loopback simulation socket. The variant is picked once, in
//! [`TransportLink::open`], and never changes for the lifetime of the handle.

pub mod usb;

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::permission::PermissionGate;

pub use usb::{PreopenedUsbBackend, UsbBackend};

/// Any bidirectional byte stream a link can run on.
pub trait LinkIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> LinkIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed stream handed over by a USB backend.
pub type BoxedIo = Box<dyn LinkIo>;

/// The three supported transports, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Vendor bulk endpoints on a directly attached device
    UsbDirect,
    /// TCP to a local port forwarded by a host-side tunnel
    AdbTunnel,
    /// Loopback TCP, for development and tests
    SimulatedTcp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UsbDirect => "USB",
            Self::AdbTunnel => "ADB tunnel",
            Self::SimulatedTcp => "simulation",
        };
        f.write_str(name)
    }
}

enum LinkStream {
    Tcp(TcpStream),
    Boxed(BoxedIo),
}

/// An open link.
///
/// Reading or writing after [`Link::close`] fails with
/// `io::ErrorKind::NotConnected`.
pub struct Link {
    kind: TransportKind,
    stream: Option<LinkStream>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("kind", &self.kind)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl Link {
    fn tcp(kind: TransportKind, stream: TcpStream) -> Self {
        Self {
            kind,
            stream: Some(LinkStream::Tcp(stream)),
        }
    }

    /// Wrap an arbitrary stream as a link of the given kind.
    pub fn from_io(kind: TransportKind, io: BoxedIo) -> Self {
        Self {
            kind,
            stream: Some(LinkStream::Boxed(io)),
        }
    }

    /// Transport this link runs on.
    pub const fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Whether the link has not been closed yet.
    pub const fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Shut the stream down.
    ///
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        let result = match stream {
            LinkStream::Tcp(mut s) => s.shutdown().await,
            LinkStream::Boxed(mut s) => s.shutdown().await,
        };
        if let Err(e) = result {
            tracing::debug!(kind = %self.kind, error = %e, "Error shutting down link");
        }
        tracing::debug!(kind = %self.kind, "Link closed");
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "link is closed")
}

impl AsyncRead for Link {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(LinkStream::Tcp(s)) => Pin::new(s).poll_read(cx, buf),
            Some(LinkStream::Boxed(s)) => Pin::new(s).poll_read(cx, buf),
            None => Poll::Ready(Err(closed_error())),
        }
    }
}

impl AsyncWrite for Link {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream.as_mut() {
            Some(LinkStream::Tcp(s)) => Pin::new(s).poll_write(cx, buf),
            Some(LinkStream::Boxed(s)) => Pin::new(s).poll_write(cx, buf),
            None => Poll::Ready(Err(closed_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(LinkStream::Tcp(s)) => Pin::new(s).poll_flush(cx),
            Some(LinkStream::Boxed(s)) => Pin::new(s).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(LinkStream::Tcp(s)) => Pin::new(s).poll_shutdown(cx),
            Some(LinkStream::Boxed(s)) => Pin::new(s).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Something that can open a link of a given kind.
///
/// [`TransportLink`] is the real implementation; the connection state
/// machine only depends on this trait.
pub trait LinkOpener: Send + Sync {
    /// Open a link of `kind`.
    fn open_link(&self, kind: TransportKind) -> BoxFuture<'_, Result<Link>>;
}

/// Opens links over the configured transports.
pub struct TransportLink {
    config: LinkConfig,
    gate: Arc<PermissionGate>,
    usb: Option<Arc<dyn UsbBackend>>,
}

impl fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLink")
            .field("config", &self.config)
            .field("usb", &self.usb.as_ref().map(|b| b.name().to_string()))
            .finish_non_exhaustive()
    }
}

impl TransportLink {
    /// Create an opener with no USB backend registered.
    pub fn new(config: LinkConfig, gate: Arc<PermissionGate>) -> Self {
        Self {
            config,
            gate,
            usb: None,
        }
    }

    /// Register the platform USB backend.
    #[must_use]
    pub fn with_usb_backend(mut self, backend: Arc<dyn UsbBackend>) -> Self {
        self.usb = Some(backend);
        self
    }

    /// Address the ADB tunnel is expected on.
    pub fn tunnel_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.config.adb_port))
    }

    /// Open a link over `kind`.
    ///
    /// # Errors
    ///
    /// - `UsbDirect`: `Error::PermissionDenied` without USB access,
    ///   `Error::BackendUnavailable` when no backend responds
    /// - `AdbTunnel` and `SimulatedTcp`: `Error::HostUnreachable`
    pub async fn open(&self, kind: TransportKind) -> Result<Link> {
        tracing::info!(%kind, "Opening link");
        match kind {
            TransportKind::UsbDirect => self.open_usb().await,
            TransportKind::AdbTunnel => {
                let stream = self.connect_tcp(self.tunnel_addr()).await?;
                Ok(Link::tcp(kind, stream))
            }
            TransportKind::SimulatedTcp => {
                let stream = self.connect_tcp(self.config.simulation_addr).await?;
                Ok(Link::tcp(kind, stream))
            }
        }
    }

    async fn open_usb(&self) -> Result<Link> {
        if !self.gate.has_permission() {
            return Err(Error::PermissionDenied);
        }
        let backend = self
            .usb
            .as_ref()
            .ok_or_else(|| Error::BackendUnavailable("no USB backend registered".to_string()))?;

        match tokio::time::timeout(self.config.connect_timeout, backend.open()).await {
            Ok(Ok(io)) => {
                tracing::debug!(backend = backend.name(), "USB backend opened");
                Ok(Link::from_io(TransportKind::UsbDirect, io))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::BackendUnavailable(format!(
                "{} did not respond within {:?}",
                backend.name(),
                self.config.connect_timeout
            ))),
        }
    }

    async fn connect_tcp(&self, addr: SocketAddr) -> Result<TcpStream> {
        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::HostUnreachable {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(Error::HostUnreachable {
                    addr,
                    reason: format!("no answer within {:?}", self.config.connect_timeout),
                })
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%addr, error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(stream)
    }
}

impl LinkOpener for TransportLink {
    fn open_link(&self, kind: TransportKind) -> BoxFuture<'_, Result<Link>> {
        Box::pin(self.open(kind))
    }
}
