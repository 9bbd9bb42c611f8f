//! Host network configuration.
//!
//! Interface addressing and routing go through the platform's own tooling
//! (`ip` on Linux, `ifconfig`/`route` on macOS) rather than netlink, so every
//! mutation here is an external process run to completion. Nothing is
//! retried; callers decide whether a failure is fatal.

mod reverser;

pub use reverser::Reverser;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::*;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::*;

use anyhow::{Result, bail};

async fn command_exec(command: &str, args: &[&str]) -> Result<()> {
    log::debug!("exec {command}: {args:?}");

    let status = tokio::process::Command::new(command)
        .args(args)
        .status()
        .await?;

    if !status.success() {
        log::warn!("command failed: {command} {args:?} ({status})");
        bail!("{command} exited with {status}");
    }

    Ok(())
}
