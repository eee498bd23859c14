//! Shared helpers for child processes spawned by devserve.

use std::path::Path;
use std::process::Stdio;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::process::Command;

/// Build a command whose stdio is the terminal devserve runs in.
///
/// Children are not killed when the handle is dropped; the supervisor decides
/// when a backend goes away.
pub fn inherited_command(program: impl AsRef<std::ffi::OsStr>, args: &[String], working_dir: Option<&Path>) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(false);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    cmd
}

pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
