//! Read-only commands: ls, find, stat, df, drives.

use anyhow::{Context, Result};

use tether_core::files::{FileItem, SortOrder};

use super::{DfArgs, FindArgs, GlobalArgs, LsArgs, PathArgs};
use crate::ui::{format_item, format_size};

fn print_items(items: &[FileItem], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(items)?);
        return Ok(());
    }
    if items.is_empty() {
        println!("  (empty)");
    }
    for item in items {
        println!("{}", format_item(item));
    }
    Ok(())
}

/// Run the ls command.
pub async fn ls(global: &GlobalArgs, args: LsArgs) -> Result<()> {
    let session = super::connect(global).await?;
    let order = SortOrder::new(args.sort.into(), !args.desc);

    let result = session.files().list(&args.path, order).await;
    session.disconnect().await;

    let items = result.with_context(|| format!("Failed to list {}", args.path))?;
    print_items(&items, global.json)
}

/// Run the find command.
pub async fn find(global: &GlobalArgs, args: FindArgs) -> Result<()> {
    let session = super::connect(global).await?;

    let result = session.files().search(&args.query, &args.base).await;
    session.disconnect().await;

    let mut items = result.with_context(|| format!("Search under {} failed", args.base))?;
    SortOrder::default().sort(&mut items);
    print_items(&items, global.json)
}

/// Run the stat command.
pub async fn stat(global: &GlobalArgs, args: PathArgs) -> Result<()> {
    let session = super::connect(global).await?;

    let result = session.files().get_info(&args.path).await;
    session.disconnect().await;

    let item = result.with_context(|| format!("Failed to stat {}", args.path))?;
    if global.json {
        println!("{}", serde_json::to_string_pretty(&item)?);
        return Ok(());
    }

    println!();
    println!("  Path:        {}", item.path);
    println!(
        "  Type:        {}",
        if item.is_directory { "directory" } else { "file" }
    );
    if !item.is_directory {
        println!(
            "  Size:        {} ({} bytes)",
            format_size(item.size_bytes),
            item.size_bytes
        );
    }
    println!("  Modified:    {}", item.modified_at.to_rfc3339());
    println!("  Permissions: {:o}", item.permission_bits);
    println!();
    Ok(())
}

/// Run the df command.
pub async fn df(global: &GlobalArgs, args: DfArgs) -> Result<()> {
    let session = super::connect(global).await?;

    let result = session.files().get_storage_info(&args.path).await;
    session.disconnect().await;

    let info = result.with_context(|| format!("No storage info for {}", args.path))?;
    if global.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let label = if info.volume_name.is_empty() {
        info.drive_label.clone()
    } else {
        format!("{} ({})", info.drive_label, info.volume_name)
    };
    println!();
    println!("  Volume: {}", label);
    println!("  Total:  {}", format_size(info.total_bytes));
    println!("  Used:   {}", format_size(info.used_bytes()));
    println!("  Free:   {}", format_size(info.free_bytes));
    println!();
    Ok(())
}

/// Run the drives command.
pub async fn drives(global: &GlobalArgs) -> Result<()> {
    let session = super::connect(global).await?;

    let result = session.files().get_drives().await;
    session.disconnect().await;

    let drives = result.context("Failed to list drives")?;
    if global.json {
        println!("{}", serde_json::to_string_pretty(&drives)?);
    } else {
        for drive in drives {
            println!("  {}", drive);
        }
    }
    Ok(())
}
