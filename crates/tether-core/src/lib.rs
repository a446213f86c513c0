//! # Tether Core Library
//!
//! `tether-core` is the device connectivity and transfer orchestration core
//! behind Tether: it lets a client browse and move files on a tethered host
//! over a direct USB bulk link, an ADB-forwarded TCP tunnel, or a loopback
//! TCP simulation used during development.
//!
//! ## Layers
//!
//! - [`protocol`] - Length-prefixed frame codec and payload encodings
//! - [`transport`] - One byte stream over USB, ADB tunnel or simulated TCP
//! - [`permission`] - USB permission tracking with single-flight requests
//! - [`connection`] - Connection state machine and transport fallback policy
//! - [`dispatch`] - Correlated request/response over the active link
//! - [`files`] - Typed remote file operations
//! - [`transfer`] - Supervised chunked uploads and downloads
//! - [`session`] - The entry point collaborators talk to
//! - [`config`] - Configuration management
//!
//! ## Example
//!
//! ```rust,ignore
//! use tether_core::config::Config;
//! use tether_core::session::Session;
//!
//! let session = Session::builder(Config::load()?).build()?;
//! session.connect().await?;
//!
//! let listing = session.files().list("/home", SortOrder::default()).await?;
//! let task = session.transfers().download_file("/home/a.bin", "a.bin").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod files;
pub mod permission;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod transport;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity string sent to the host during the handshake.
pub const CLIENT_IDENTITY: &str = concat!("tether/", env!("CARGO_PKG_VERSION"));

/// Fixed TCP port the host binds or forwards (ADB tunnel and simulation).
pub const DEFAULT_HOST_PORT: u16 = 5555;

/// Default chunk size for file transfers (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default number of transfers running at the same time
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 2;
