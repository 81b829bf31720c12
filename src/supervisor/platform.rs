//! Process-group launch and signalling per platform

use std::io;
use std::process::Stdio;

use tokio::process::Command;

/// Stop request sent to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ask the process to exit (`SIGTERM`)
    Terminate,
    /// Force the process to exit (`SIGKILL`)
    Kill,
}

async fn run_quiet(mut command: Command) -> io::Result<()> {
    let status = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("signal command exited with {status}")))
    }
}

#[cfg(unix)]
mod imp {
    use super::{Command, Signal, io, run_quiet};

    fn name(signal: Signal) -> &'static str {
        match signal {
            Signal::Terminate => "TERM",
            Signal::Kill => "KILL",
        }
    }

    fn kill(args: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(format!("kill {args}"));
        command
    }

    pub fn shell(command_line: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(command_line);
        command
    }

    pub fn configure(command: &mut Command) {
        command.process_group(0);
    }

    pub fn group_id(pid: u32) -> Option<u32> {
        Some(pid)
    }

    pub async fn signal_group(pgid: u32, signal: Signal) -> io::Result<()> {
        run_quiet(kill(&format!("-s {} -- -{pgid}", name(signal)))).await
    }

    pub async fn signal_process(pid: u32, signal: Signal) -> io::Result<()> {
        run_quiet(kill(&format!("-s {} {pid}", name(signal)))).await
    }
}

#[cfg(windows)]
mod imp {
    use super::{Command, Signal, io, run_quiet};

    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    fn taskkill(pid: u32, tree: bool, signal: Signal) -> Command {
        let mut command = Command::new("taskkill");
        if tree {
            command.arg("/T");
        }
        if signal == Signal::Kill {
            command.arg("/F");
        }
        command.arg("/PID").arg(pid.to_string());
        command
    }

    pub fn shell(command_line: &str) -> Command {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(command_line);
        command
    }

    pub fn configure(command: &mut Command) {
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    pub fn group_id(pid: u32) -> Option<u32> {
        Some(pid)
    }

    pub async fn signal_group(pgid: u32, signal: Signal) -> io::Result<()> {
        run_quiet(taskkill(pgid, true, signal)).await
    }

    pub async fn signal_process(pid: u32, signal: Signal) -> io::Result<()> {
        run_quiet(taskkill(pid, false, signal)).await
    }
}

pub use imp::{configure, group_id, shell, signal_group, signal_process};
