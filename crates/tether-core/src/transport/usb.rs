//! USB bulk backend seam.
//!
//! The core does not talk to USB hardware itself. The embedding platform
//! registers a [`UsbBackend`] that opens the vendor bulk endpoint pair and
//! hands back a duplex byte stream.

use std::sync::Mutex;

use futures::future::BoxFuture;

use crate::error::{Error, Result};

use super::BoxedIo;

/// Opens the bulk endpoint pair of an attached device.
pub trait UsbBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Open the device.
    ///
    /// Must fail with `Error::BackendUnavailable` when no device or driver
    /// responds, so the caller can fall back to the tunnel.
    fn open(&self) -> BoxFuture<'_, Result<BoxedIo>>;
}

/// Backend that hands out one stream opened elsewhere.
///
/// Useful when the platform opens the device itself (for example from a
/// USB attach intent) and passes the resulting stream in.
pub struct PreopenedUsbBackend {
    stream: Mutex<Option<BoxedIo>>,
}

impl PreopenedUsbBackend {
    /// Wrap an already open stream.
    pub fn new(stream: BoxedIo) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
        }
    }
}

impl std::fmt::Debug for PreopenedUsbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreopenedUsbBackend").finish_non_exhaustive()
    }
}

impl UsbBackend for PreopenedUsbBackend {
    fn name(&self) -> &str {
        "preopened"
    }

    fn open(&self) -> BoxFuture<'_, Result<BoxedIo>> {
        let stream = self
            .stream
            .lock()
            .map_err(|_| Error::Internal("USB stream lock poisoned".to_string()))
            .and_then(|mut slot| {
                slot.take().ok_or_else(|| {
                    Error::BackendUnavailable("preopened stream already consumed".to_string())
                })
            });
        Box::pin(async move { stream })
    }
}
