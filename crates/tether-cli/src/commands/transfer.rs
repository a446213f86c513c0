//! Transfer commands: get, put, history.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use uuid::Uuid;

use tether_core::session::Session;
use tether_core::transfer::{TransferDirection, TransferState, TransferTask};

use super::{GetArgs, GlobalArgs, HistoryArgs, PutArgs};
use crate::ui::{format_size, print_progress};

/// Run the get command.
pub async fn get(global: &GlobalArgs, args: GetArgs) -> Result<()> {
    let local = args.local.clone().unwrap_or_else(|| {
        let name = args
            .remote
            .rsplit(['/', '\\'])
            .find(|part| !part.is_empty())
            .unwrap_or("download");
        PathBuf::from(name)
    });

    let session = super::connect(global).await?;
    let task = session
        .transfers()
        .download_file(&args.remote, &local)
        .await
        .with_context(|| format!("Failed to start download of {}", args.remote))?;

    finish(global, &session, task, args.quiet).await
}

/// Run the put command.
pub async fn put(global: &GlobalArgs, args: PutArgs) -> Result<()> {
    let session = super::connect(global).await?;
    let task = session
        .transfers()
        .upload_file(&args.local, &args.remote)
        .await
        .with_context(|| format!("Failed to start upload of {}", args.local.display()))?;

    finish(global, &session, task, args.quiet).await
}

/// Follow a task to the end, report it, and close the session.
async fn finish(global: &GlobalArgs, session: &Session, task: TransferTask, quiet: bool) -> Result<()> {
    let show_progress = !quiet && !global.json;
    if show_progress {
        let verb = match task.direction {
            TransferDirection::Download => "Downloading",
            TransferDirection::Upload => "Uploading",
        };
        println!();
        println!("  {} {}", verb, task.file_name);
    }

    let start = Instant::now();
    let done = if show_progress {
        follow(session, task.id).await
    } else {
        session.transfers().wait_until_settled(task.id).await
    };
    session.disconnect().await;
    let done = done?;
    let elapsed = start.elapsed();

    if show_progress {
        println!();
        println!();
    }

    if global.json {
        let output = serde_json::json!({
            "status": done.state.name(),
            "task": &done,
            "elapsed_secs": elapsed.as_secs_f64(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    }

    match &done.state {
        TransferState::Completed => {
            if !quiet && !global.json {
                println!(
                    "  Transfer complete: {} in {:.1}s",
                    format_size(done.total_bytes),
                    elapsed.as_secs_f64()
                );
                println!();
            }
            Ok(())
        }
        TransferState::Failed(reason) => bail!("Transfer failed: {}", reason),
        other => bail!("Transfer ended {}", other.name()),
    }
}

/// Redraw progress until the task settles.
async fn follow(session: &Session, id: Uuid) -> tether_core::Result<TransferTask> {
    let mut rx = session.transfers().subscribe_tasks();
    loop {
        let current = rx.borrow_and_update().iter().find(|t| t.id == id).cloned();
        let Some(task) = current else {
            return Err(tether_core::Error::TaskNotFound(id));
        };
        print_progress(&task);
        if !task.is_active() {
            return Ok(task);
        }
        if rx.changed().await.is_err() {
            return session.transfers().wait_until_settled(id).await;
        }
    }
}

/// Run the history command.
pub async fn history(global: &GlobalArgs, args: HistoryArgs) -> Result<()> {
    let config = super::load_config(global);
    if !config.transfer.persist_tasks {
        bail!("Transfer persistence is disabled in the configuration");
    }

    let session = Session::builder(config)
        .build()
        .context("Invalid configuration")?;
    session
        .restore_transfers()
        .await
        .context("Failed to read saved transfers")?;

    if args.clear {
        let removed = session.transfers().clear_history().await;
        if global.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "removed": removed }))?
            );
        } else {
            println!("  Removed {} finished transfers", removed);
        }
        return Ok(());
    }

    let tasks = session.transfers().tasks();
    if global.json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("  No saved transfers");
        return Ok(());
    }
    for task in &tasks {
        let arrow = match task.direction {
            TransferDirection::Download => "<-",
            TransferDirection::Upload => "->",
        };
        let detail = match &task.state {
            TransferState::Failed(reason) => format!(" ({})", reason),
            _ => String::new(),
        };
        println!(
            "  {}  {} {:<11} {:>3}%  {}{}",
            task.created_at.format("%Y-%m-%d %H:%M"),
            arrow,
            task.state.name(),
            task.progress_percent(),
            task.remote_path,
            detail
        );
    }
    Ok(())
}
