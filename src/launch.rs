//! The optional command whose traffic is being observed.

use std::process::Stdio;

use anyhow::Context;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::info;

/// A running command and when it was started.
#[derive(Debug)]
pub struct LaunchedCommand {
    pub program: String,
    pub child: Child,
    pub started: Instant,
}

/// Splits `command_line` on whitespace and spawns it with the terminal's
/// stdout and stderr. No shell is involved, so quoting is not interpreted.
pub fn launch(command_line: &str) -> anyhow::Result<LaunchedCommand> {
    let mut words = command_line.split_whitespace();
    let program = words
        .next()
        .context("command line is empty")?
        .to_string();

    let child = Command::new(&program)
        .args(words)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("starting command {program}"))?;

    info!(command = %command_line, pid = child.id(), "command started");
    Ok(LaunchedCommand {
        program,
        child,
        started: Instant::now(),
    })
}
