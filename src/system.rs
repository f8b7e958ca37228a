// Copyright (C) 2020, Oxide Computer Company

//! Host process execution.

use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::Command;

use log::debug;

use crate::command::ProcessDescription;
use crate::error::Error;

/// Runs compiled process descriptions on the host.
pub trait ProcessExecutor {
    /// Starts the process, waits for it, and returns its exit status. A
    /// process killed by a signal reports `128 + signal`.
    fn spawn_and_wait(&self, process: &ProcessDescription) -> Result<i32, Error>;

    /// Replaces the current process image. Only returns on failure.
    fn replace_current_process(&self, process: &ProcessDescription) -> Error;
}

/// The executor backed by the host's process table.
///
///     use bhyve_vm::command::ProcessDescription;
///     use bhyve_vm::system::*;
///     let status = HostSystem.spawn_and_wait(&ProcessDescription::new("/bin/true", vec![]))
///         .expect("failed to run /bin/true");
///     assert_eq!(status, 0);
pub struct HostSystem;

impl HostSystem {
    /// bhyve, bhyvectl and ifconfig need root; callers warn without it.
    pub fn is_privileged() -> bool {
        // geteuid cannot fail.
        unsafe { libc::geteuid() == 0 }
    }
}

fn command(process: &ProcessDescription) -> Command {
    let mut command = Command::new(process.executable());
    command.args(process.arguments());
    command
}

fn failure(process: &ProcessDescription, reason: impl ToString) -> Error {
    Error::ProcessFailure {
        executable: process.executable().display().to_string(),
        reason: reason.to_string(),
    }
}

impl ProcessExecutor for HostSystem {
    fn spawn_and_wait(&self, process: &ProcessDescription) -> Result<i32, Error> {
        debug!("spawning {}", process);
        let status = command(process)
            .status()
            .map_err(|e| failure(process, e))?;
        match (status.code(), status.signal()) {
            (Some(code), _) => Ok(code),
            (None, Some(signal)) => Ok(128 + signal),
            (None, None) => Err(failure(process, "terminated without an exit status")),
        }
    }

    fn replace_current_process(&self, process: &ProcessDescription) -> Error {
        debug!("executing {}", process);
        let error = command(process).exec();
        failure(process, error)
    }
}
