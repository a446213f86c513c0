//! Typed remote file operations.
//!
//! Every call is one request/response exchange through the current
//! [`RequestDispatcher`](crate::dispatch::RequestDispatcher). Listings are
//! snapshots: a new listing replaces the previous one wholesale.

use std::cmp::Ordering;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::ActiveDispatcher;
use crate::error::{Error, Result};
use crate::protocol::payload::{self, RenameRequest, SearchRequest};
use crate::protocol::{Frame, Opcode};

/// One entry of a listing or search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileItem {
    /// Full remote path, unique within one listing
    pub path: String,
    /// Final path component
    pub name: String,
    /// Size in bytes (0 for directories)
    pub size_bytes: u64,
    /// Whether this is a directory
    pub is_directory: bool,
    /// Last modification time
    pub modified_at: DateTime<Utc>,
    /// Unix-style permission bits as reported by the host
    pub permission_bits: u32,
}

impl FileItem {
    /// Lower-cased extension, empty for directories and extensionless files.
    pub fn extension(&self) -> String {
        if self.is_directory {
            return String::new();
        }
        Path::new(&self.name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default()
    }
}

/// Field a listing is sorted by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    /// Case-insensitive name
    #[default]
    Name,
    /// Size in bytes
    Size,
    /// Modification time
    ModifiedAt,
    /// File extension
    Type,
}

/// How a listing is ordered.
///
/// Directories always come first; ties are broken by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOrder {
    /// Sort key
    pub field: SortField,
    /// Ascending when true
    pub ascending: bool,
}

impl Default for SortOrder {
    fn default() -> Self {
        Self {
            field: SortField::Name,
            ascending: true,
        }
    }
}

impl SortOrder {
    /// Create an order.
    pub const fn new(field: SortField, ascending: bool) -> Self {
        Self { field, ascending }
    }

    /// Sort `items` in place.
    pub fn sort(&self, items: &mut [FileItem]) {
        items.sort_by(|a, b| self.compare(a, b));
    }

    fn compare(&self, a: &FileItem, b: &FileItem) -> Ordering {
        let by_kind = b.is_directory.cmp(&a.is_directory);
        if by_kind != Ordering::Equal {
            return by_kind;
        }

        let by_name = || a.name.to_lowercase().cmp(&b.name.to_lowercase());
        let by_field = match self.field {
            SortField::Name => by_name(),
            SortField::Size => a.size_bytes.cmp(&b.size_bytes),
            SortField::ModifiedAt => a.modified_at.cmp(&b.modified_at),
            SortField::Type => a.extension().cmp(&b.extension()),
        };
        let by_field = if self.ascending {
            by_field
        } else {
            by_field.reverse()
        };

        by_field.then_with(by_name)
    }
}

/// Capacity of the volume holding a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    /// Drive or mount label
    pub drive_label: String,
    /// Volume name, may be empty
    pub volume_name: String,
    /// Capacity in bytes
    pub total_bytes: u64,
    /// Free bytes, never more than `total_bytes`
    pub free_bytes: u64,
}

impl StorageInfo {
    /// Bytes in use.
    pub const fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }
}

/// What the host said about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Host identity string, e.g. `PCEX-Server-1.0`
    pub identity: String,
}

/// Remote file operations over the current link.
#[derive(Debug, Clone)]
pub struct FileOperationsClient {
    link: ActiveDispatcher,
    timeout: Option<Duration>,
}

impl FileOperationsClient {
    /// Create a client using the dispatcher's default timeout.
    pub fn new(link: ActiveDispatcher) -> Self {
        Self {
            link,
            timeout: None,
        }
    }

    /// Copy of this client with a different per-request timeout.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            link: self.link.clone(),
            timeout: Some(timeout),
        }
    }

    /// Exchange identities with the host.
    pub async fn handshake(&self) -> Result<HostInfo> {
        let frame = self
            .call(Opcode::Handshake, payload::encode_path(crate::CLIENT_IDENTITY))
            .await?;
        let identity = match frame.opcode {
            Opcode::Ok | Opcode::Data if frame.payload.is_empty() => String::new(),
            Opcode::Ok | Opcode::Data => payload::decode_path(&frame.payload)?,
            other => return Err(unexpected(Opcode::Ok, other)),
        };
        tracing::info!(host = %identity, "Handshake complete");
        Ok(HostInfo { identity })
    }

    /// List a directory.
    pub async fn list(&self, path: &str, order: SortOrder) -> Result<Vec<FileItem>> {
        let frame = self
            .call(Opcode::ListDir, payload::encode_path(path))
            .await?;
        let mut items = payload::decode_file_list(&data(frame, Opcode::Data)?)?;
        order.sort(&mut items);
        tracing::debug!(path, count = items.len(), "Listed directory");
        Ok(items)
    }

    /// Search for names containing `query` under `base_path`.
    pub async fn search(&self, query: &str, base_path: &str) -> Result<Vec<FileItem>> {
        let request = SearchRequest {
            query: query.to_string(),
            base_path: base_path.to_string(),
        };
        let frame = self.call(Opcode::Search, request.encode()).await?;
        payload::decode_file_list(&data(frame, Opcode::Data)?)
    }

    /// Metadata for one path.
    pub async fn get_info(&self, path: &str) -> Result<FileItem> {
        let frame = self
            .call(Opcode::GetFileInfo, payload::encode_path(path))
            .await?;
        payload::decode_file_item(&data(frame, Opcode::Data)?)
    }

    /// Create a directory.
    pub async fn create_folder(&self, path: &str) -> Result<()> {
        let frame = self
            .call(Opcode::CreateDir, payload::encode_path(path))
            .await?;
        data(frame, Opcode::Ok).map(drop)
    }

    /// Rename a path within its parent directory.
    pub async fn rename(&self, path: &str, new_name: &str) -> Result<()> {
        let request = RenameRequest {
            path: path.to_string(),
            new_name: new_name.to_string(),
        };
        let frame = self.call(Opcode::Rename, request.encode()).await?;
        data(frame, Opcode::Ok).map(drop)
    }

    /// Delete every path, one request each.
    ///
    /// Keeps going past individual failures. If any path could not be
    /// removed the result is `Error::DeleteFailed` listing each one; the
    /// others are gone. Once the link itself fails, the remaining paths are
    /// reported with that failure without being attempted.
    pub async fn delete<S>(&self, paths: &[S]) -> Result<()>
    where
        S: AsRef<str> + Sync,
    {
        let mut failures = Vec::new();
        let mut link_failure: Option<String> = None;

        for path in paths {
            let path = path.as_ref();
            if let Some(reason) = &link_failure {
                failures.push((path.to_string(), reason.clone()));
                continue;
            }

            let result = match self.call(Opcode::Delete, payload::encode_path(path)).await {
                Ok(frame) => data(frame, Opcode::Ok).map(drop),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => tracing::debug!(path, "Deleted"),
                Err(e) => {
                    if matches!(e, Error::LinkLost(_) | Error::NotConnected) {
                        link_failure = Some(e.to_string());
                    }
                    tracing::debug!(path, error = %e, "Delete failed");
                    failures.push((path.to_string(), e.to_string()));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::DeleteFailed(failures))
        }
    }

    /// Capacity of the volume holding `path`.
    pub async fn get_storage_info(&self, path: &str) -> Result<StorageInfo> {
        let frame = self
            .call(Opcode::GetStorageInfo, payload::encode_path(path))
            .await?;
        payload::decode_storage_info(&data(frame, Opcode::Data)?)
    }

    /// Drive roots on the host.
    pub async fn get_drives(&self) -> Result<Vec<String>> {
        let frame = self.call(Opcode::GetDrives, Vec::new()).await?;
        payload::decode_drive_list(&data(frame, Opcode::Data)?)
    }

    async fn call(&self, opcode: Opcode, request: Vec<u8>) -> Result<Frame> {
        let dispatcher = self.link.current()?;
        match self.timeout {
            Some(timeout) => dispatcher.send_with_timeout(opcode, request, timeout).await,
            None => dispatcher.send(opcode, request).await,
        }
    }
}

fn data(frame: Frame, expected: Opcode) -> Result<Vec<u8>> {
    if frame.opcode == expected {
        Ok(frame.payload)
    } else {
        Err(unexpected(expected, frame.opcode))
    }
}

fn unexpected(expected: Opcode, got: Opcode) -> Error {
    Error::Malformed(format!("expected {expected:?} response, got {got:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatcherSlot;

    fn item(name: &str, is_directory: bool, size_bytes: u64, secs: i64) -> FileItem {
        FileItem {
            path: format!("/{name}"),
            name: name.to_string(),
            size_bytes,
            is_directory,
            modified_at: DateTime::from_timestamp(secs, 0).unwrap(),
            permission_bits: 0o644,
        }
    }

    fn names(items: &[FileItem]) -> Vec<&str> {
        items.iter().map(|i| i.name.as_str()).collect()
    }

    #[test]
    fn test_sort_by_name_puts_directories_first() {
        let mut items = vec![
            item("beta.txt", false, 10, 0),
            item("Zeta", true, 0, 0),
            item("alpha.txt", false, 20, 0),
            item("docs", true, 0, 0),
        ];
        SortOrder::default().sort(&mut items);
        assert_eq!(names(&items), ["docs", "Zeta", "alpha.txt", "beta.txt"]);
    }

    #[test]
    fn test_sort_descending_keeps_directories_first() {
        let mut items = vec![
            item("small.bin", false, 1, 0),
            item("dir", true, 0, 0),
            item("big.bin", false, 100, 0),
        ];
        SortOrder::new(SortField::Size, false).sort(&mut items);
        assert_eq!(names(&items), ["dir", "big.bin", "small.bin"]);
    }

    #[test]
    fn test_sort_by_type_breaks_ties_by_name() {
        let mut items = vec![
            item("b.txt", false, 0, 0),
            item("a.png", false, 0, 0),
            item("a.txt", false, 0, 0),
        ];
        SortOrder::new(SortField::Type, true).sort(&mut items);
        assert_eq!(names(&items), ["a.png", "a.txt", "b.txt"]);
    }

    #[test]
    fn test_sort_by_modified() {
        let mut items = vec![item("new", false, 0, 200), item("old", false, 0, 100)];
        SortOrder::new(SortField::ModifiedAt, true).sort(&mut items);
        assert_eq!(names(&items), ["old", "new"]);
    }

    #[test]
    fn test_extension() {
        assert_eq!(item("Photo.JPG", false, 0, 0).extension(), "jpg");
        assert_eq!(item("Makefile", false, 0, 0).extension(), "");
        assert_eq!(item("dir.d", true, 0, 0).extension(), "");
    }

    #[tokio::test]
    async fn test_calls_without_link_are_not_connected() {
        let slot = DispatcherSlot::new();
        let client = FileOperationsClient::new(slot.handle());

        assert!(matches!(
            client.list("/", SortOrder::default()).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(client.get_drives().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_delete_without_link_reports_every_path() {
        let slot = DispatcherSlot::new();
        let client = FileOperationsClient::new(slot.handle());

        match client.delete(&["/a", "/b"]).await {
            Err(Error::DeleteFailed(failures)) => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].0, "/a");
                assert_eq!(failures[1].0, "/b");
            }
            other => panic!("expected DeleteFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_unexpected_response_is_malformed() {
        let frame = Frame::new(Opcode::Ok, 1, Vec::new());
        assert!(matches!(data(frame, Opcode::Data), Err(Error::Malformed(_))));
    }
}
