// Copyright (C) 2020, Oxide Computer Company

//! Serial console discovery and attachment.

use std::path::PathBuf;

use log::debug;
use uuid::Uuid;

use crate::command::ProcessDescription;
use crate::config::ClientConfiguration;
use crate::device::Device;
use crate::tty::TtyBackend;
use crate::vm::VirtualMachine;

/// The two ends of a machine's null-modem pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NmdmPaths {
    /// Handed to bhyve.
    pub guest: PathBuf,
    /// Opened by the operator's terminal.
    pub host: PathBuf,
}

pub fn nmdm_paths(machine_id: &Uuid) -> NmdmPaths {
    NmdmPaths {
        guest: PathBuf::from(format!("/dev/nmdm_{}_A", machine_id)),
        host: PathBuf::from(format!("/dev/nmdm_{}_B", machine_id)),
    }
}

/// A console-capable TTY backend and the LPC device carrying it.
#[derive(Clone, Copy, Debug)]
pub struct ConsoleDevice<'a> {
    pub device: &'a Device,
    pub backend: &'a TtyBackend,
}

/// Every console-capable backend on the machine's LPC devices.
pub fn console_candidates(machine: &VirtualMachine) -> Vec<ConsoleDevice<'_>> {
    machine
        .devices()
        .filter_map(|device| device.kind.lpc().map(|lpc| (device, lpc)))
        .flat_map(|(device, lpc)| {
            lpc.backends()
                .filter(|backend| backend.is_console())
                .map(move |backend| ConsoleDevice { device, backend })
        })
        .collect()
}

/// The machine's console, if it has exactly one.
pub fn find_console_device(machine: &VirtualMachine) -> Option<ConsoleDevice<'_>> {
    let candidates = console_candidates(machine);
    if candidates.len() == 1 {
        Some(candidates[0])
    } else {
        debug!(
            "machine {} has {} console candidates",
            machine.id(),
            candidates.len()
        );
        None
    }
}

/// The process that attaches the operator's terminal to the console.
///
/// Absent when there is no single console, or when the console is bhyve's
/// own standard I/O and so cannot be attached to separately.
pub fn compile_console(
    config: &ClientConfiguration,
    machine: &VirtualMachine,
) -> Option<ProcessDescription> {
    let console = find_console_device(machine)?;
    match console.backend {
        TtyBackend::Nmdm { .. } => {
            let host = nmdm_paths(&machine.id()).host;
            Some(ProcessDescription::new(
                &config.cu,
                vec!["-l".into(), host.display().to_string()],
            ))
        }
        TtyBackend::Stdio { .. } | TtyBackend::File { .. } => None,
    }
}
