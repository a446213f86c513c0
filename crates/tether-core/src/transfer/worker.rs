//! Chunk loops for one running task.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, RemoteErrorCode, Result};
use crate::protocol::payload::{self, ReadRequest, WriteChunk};
use crate::protocol::Opcode;

use super::{Inner, TransferDirection, TransferTask};

/// Everything a worker needs, copied out of the task when it starts.
pub(super) struct Job {
    pub(super) id: Uuid,
    pub(super) run: u64,
    token: CancellationToken,
    direction: TransferDirection,
    remote_path: String,
    local_path: PathBuf,
    /// Offset to continue from (non-zero after a resume)
    offset: u64,
    total: u64,
}

impl Job {
    pub(super) fn new(task: &TransferTask, run: u64, token: CancellationToken) -> Self {
        Self {
            id: task.id,
            run,
            token,
            direction: task.direction,
            remote_path: task.remote_path.clone(),
            local_path: task.local_path.clone(),
            offset: task.transferred_bytes,
            total: task.total_bytes,
        }
    }
}

pub(super) async fn run(inner: Arc<Inner>, job: Job) {
    tracing::info!(
        task_id = %job.id,
        direction = ?job.direction,
        remote = %job.remote_path,
        local = %job.local_path.display(),
        offset = job.offset,
        "Transfer started"
    );

    let result = match job.direction {
        TransferDirection::Download => download(&inner, &job).await,
        TransferDirection::Upload => upload(&inner, &job).await,
    };

    super::finish_run(inner, &job, result).await;
}

fn next_chunk(chunk_size: usize, remaining: u64) -> u64 {
    remaining.min(chunk_size as u64)
}

fn check_cancelled(job: &Job) -> Result<()> {
    if job.token.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

async fn download(inner: &Inner, job: &Job) -> Result<()> {
    let dispatcher = inner.link.current()?;
    let mut offset = job.offset;

    let total = if offset == 0 {
        let frame = dispatcher
            .send(Opcode::GetFileInfo, payload::encode_path(&job.remote_path))
            .await?;
        let info = payload::decode_file_item(&frame.payload)?;
        if info.is_directory {
            return Err(Error::Remote {
                code: RemoteErrorCode::InvalidPath,
                message: format!("{} is a directory", job.remote_path),
            });
        }
        inner.set_total(job, info.size_bytes);
        info.size_bytes
    } else {
        job.total
    };

    let mut file = open_destination(&job.local_path, offset).await?;

    while offset < total {
        check_cancelled(job)?;

        let length = next_chunk(inner.config.chunk_size, total - offset);
        let request = ReadRequest {
            path: job.remote_path.clone(),
            offset,
            length,
        };
        let frame = dispatcher
            .send_with_timeout(Opcode::ReadFile, request.encode(), inner.config.chunk_timeout)
            .await?;

        if frame.opcode != Opcode::FileChunk {
            return Err(Error::Malformed(format!(
                "expected FileChunk response, got {:?}",
                frame.opcode
            )));
        }
        let received = frame.payload.len() as u64;
        if received == 0 || received > length {
            return Err(Error::Malformed(format!(
                "host sent {received} bytes for a {length}-byte read at offset {offset}"
            )));
        }

        file.write_all(&frame.payload).await?;
        offset += received;

        if !inner.record_progress(job, offset) {
            return Err(Error::Cancelled);
        }
        tracing::trace!(task_id = %job.id, offset, total, "Chunk received");
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// Open the local file for a download starting at `offset`.
///
/// A fresh download truncates; a resumed one drops anything past `offset`.
async fn open_destination(path: &Path, offset: u64) -> Result<File> {
    if offset == 0 {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        return Ok(File::create(path).await?);
    }

    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(offset).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(file)
}

async fn upload(inner: &Inner, job: &Job) -> Result<()> {
    let dispatcher = inner.link.current()?;
    let mut offset = job.offset;
    let mut file = File::open(&job.local_path).await?;

    let total = if offset == 0 {
        let len = file.metadata().await?.len();
        inner.set_total(job, len);
        len
    } else {
        file.seek(SeekFrom::Start(offset)).await?;
        job.total
    };

    let mut buf = vec![0u8; inner.config.chunk_size];
    loop {
        check_cancelled(job)?;

        #[allow(clippy::cast_possible_truncation)]
        let want = next_chunk(inner.config.chunk_size, total - offset) as usize;
        let read = read_full(&mut file, &mut buf[..want]).await?;
        if read < want {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} shrank during upload", job.local_path.display()),
            )));
        }

        let is_final = offset + read as u64 >= total;
        let chunk = WriteChunk {
            path: job.remote_path.clone(),
            offset,
            total_size: total,
            is_final,
            data: buf[..read].to_vec(),
        };
        let frame = dispatcher
            .send_with_timeout(Opcode::WriteFile, chunk.encode(), inner.config.chunk_timeout)
            .await?;
        if frame.opcode != Opcode::Ok {
            return Err(Error::Malformed(format!(
                "expected Ok response, got {:?}",
                frame.opcode
            )));
        }

        offset += read as u64;
        if !inner.record_progress(job, offset) {
            return Err(Error::Cancelled);
        }
        tracing::trace!(task_id = %job.id, offset, total, "Chunk acknowledged");

        if is_final {
            return Ok(());
        }
    }
}

async fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
