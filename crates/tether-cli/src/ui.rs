//! UI utilities for Tether CLI.

use std::io::{self, Write};

use tether_core::files::FileItem;
use tether_core::transfer::TransferTask;

const BAR_WIDTH: usize = 24;

/// Format a byte count for display.
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// One listing line: kind, size, time, name.
pub fn format_item(item: &FileItem) -> String {
    let kind = if item.is_directory { "[dir]" } else { "[file]" };
    let size = if item.is_directory {
        "-".to_string()
    } else {
        format_size(item.size_bytes)
    };
    format!(
        "  {:<6} {:>9}  {}  {}",
        kind,
        size,
        item.modified_at.format("%Y-%m-%d %H:%M"),
        item.name
    )
}

/// Text progress bar for a percentage.
pub fn progress_bar(percent: u8) -> String {
    let filled = usize::from(percent.min(100)) * BAR_WIDTH / 100;
    format!("[{}{}]", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled))
}

/// Redraw the progress line for `task` in place.
pub fn print_progress(task: &TransferTask) {
    print!(
        "\r  {} {:>3}% {} ({} / {})    ",
        progress_bar(task.progress_percent()),
        task.progress_percent(),
        task.file_name,
        format_size(task.transferred_bytes),
        format_size(task.total_bytes)
    );
    let _ = io::stdout().flush();
}
