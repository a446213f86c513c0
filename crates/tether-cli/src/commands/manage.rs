//! Mutating commands: mkdir, mv, rm.

use anyhow::{bail, Context, Result};

use tether_core::Error;

use super::{GlobalArgs, MvArgs, PathArgs, RmArgs};

/// Run the mkdir command.
pub async fn mkdir(global: &GlobalArgs, args: PathArgs) -> Result<()> {
    let session = super::connect(global).await?;

    let result = session.files().create_folder(&args.path).await;
    session.disconnect().await;

    result.with_context(|| format!("Failed to create {}", args.path))?;
    if global.json {
        let output = serde_json::json!({ "status": "created", "path": args.path });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("  Created {}", args.path);
    }
    Ok(())
}

/// Run the mv command.
pub async fn mv(global: &GlobalArgs, args: MvArgs) -> Result<()> {
    if args.new_name.contains(['/', '\\']) {
        bail!("New name must not contain a path separator: {}", args.new_name);
    }
    let session = super::connect(global).await?;

    let result = session.files().rename(&args.path, &args.new_name).await;
    session.disconnect().await;

    result.with_context(|| format!("Failed to rename {}", args.path))?;
    if global.json {
        let output = serde_json::json!({
            "status": "renamed",
            "path": args.path,
            "new_name": args.new_name,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("  Renamed {} to {}", args.path, args.new_name);
    }
    Ok(())
}

/// Run the rm command.
pub async fn rm(global: &GlobalArgs, args: RmArgs) -> Result<()> {
    let session = super::connect(global).await?;

    let result = session.files().delete(&args.paths).await;
    session.disconnect().await;

    let failed = match result {
        Ok(()) => Vec::new(),
        Err(Error::DeleteFailed(failed)) => failed,
        Err(e) => return Err(e).context("Delete failed"),
    };

    if global.json {
        let output = serde_json::json!({
            "deleted": args
                .paths
                .iter()
                .filter(|p| !failed.iter().any(|(f, _)| f == *p))
                .collect::<Vec<_>>(),
            "failed": failed
                .iter()
                .map(|(path, reason)| serde_json::json!({ "path": path, "reason": reason }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        for path in &args.paths {
            match failed.iter().find(|(f, _)| f == path) {
                Some((_, reason)) => eprintln!("  Failed  {}: {}", path, reason),
                None => println!("  Deleted {}", path),
            }
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        bail!("{} of {} paths could not be deleted", failed.len(), args.paths.len())
    }
}
