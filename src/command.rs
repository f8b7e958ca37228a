// Copyright (C) 2020, Oxide Computer Company

//! Compilation of a machine into the processes that run and control it.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::boot::BootConfiguration;
use crate::config::ClientConfiguration;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::grub::{compile_grub, GrubLoader};
use crate::tty::TtyName;
use crate::vm::VirtualMachine;

/// An executable and its arguments, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessDescription {
    executable: PathBuf,
    arguments: Vec<String>,
}

impl ProcessDescription {
    pub fn new(executable: impl AsRef<Path>, arguments: Vec<String>) -> ProcessDescription {
        ProcessDescription {
            executable: executable.as_ref().to_path_buf(),
            arguments,
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }
}

/// Renders `executable arg1 arg2 ...`. Arguments that would not survive a
/// shell word split are single-quoted, so the text maps back to exactly
/// one argument list.
impl fmt::Display for ProcessDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&quote(&self.executable.to_string_lossy()))?;
        for argument in &self.arguments {
            write!(f, " {}", quote(argument))?;
        }
        Ok(())
    }
}

/// Single-quotes `word` unless it is made only of characters that need no
/// quoting. Shared by shell-style command lines and grub.cfg.
pub(crate) fn quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:,=+@%[]".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Everything needed to start a machine: an optional loader that runs to
/// completion first, then bhyve itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunPlan {
    pub loader: Option<GrubLoader>,
    pub bhyve: ProcessDescription,
}

/// Compiles the processes that boot `machine` with `boot`.
pub fn compile_run(
    config: &ClientConfiguration,
    machine: &VirtualMachine,
    boot: &BootConfiguration,
) -> Result<RunPlan> {
    let loader = match boot {
        BootConfiguration::GrubBhyve { .. } => Some(compile_grub(config, machine, boot)?),
        BootConfiguration::Uefi { .. } => None,
    };
    let bhyve = ProcessDescription::new(&config.bhyve, bhyve_arguments(config, machine, boot)?);
    Ok(RunPlan { loader, bhyve })
}

/// The bhyve argument list for `machine` booted with `boot`.
pub fn bhyve_arguments(
    config: &ClientConfiguration,
    machine: &VirtualMachine,
    boot: &BootConfiguration,
) -> Result<Vec<String>> {
    let mut arguments = Vec::new();

    let cpu = machine.cpu();
    arguments.push("-c".to_string());
    arguments.push(format!(
        "cpus={},sockets={},cores={},threads={}",
        cpu.cpus(),
        cpu.sockets(),
        cpu.cores(),
        cpu.threads()
    ));

    arguments.push("-m".to_string());
    arguments.push(format!("{}M", machine.memory().total_megabytes()));

    arguments.extend(machine.flags().switches().into_iter().map(str::to_string));

    for pin in cpu.pins() {
        arguments.push("-p".to_string());
        arguments.push(format!("{}:{}", pin.guest_cpu, pin.host_cpu));
    }

    for device in machine.devices() {
        arguments.push("-s".to_string());
        arguments.push(slot_argument(config, machine, device)?);
    }

    let lpc = machine.devices().find_map(|d| d.kind.lpc());
    if let Some(lpc) = lpc {
        for backend in lpc.backends() {
            arguments.push("-l".to_string());
            arguments.push(backend.lpc_option(&machine.id()));
        }
    }

    if let BootConfiguration::Uefi { firmware, .. } = boot {
        match lpc {
            None => {
                return Err(Error::validation(format!(
                    "boot configuration '{}' uses UEFI firmware, which requires an LPC device",
                    boot.name()
                )))
            }
            Some(lpc) if lpc.get(TtyName::Bootrom).is_some() => {
                return Err(Error::validation(format!(
                    "boot configuration '{}' supplies a bootrom, but the LPC device already has one",
                    boot.name()
                )))
            }
            Some(_) => {
                arguments.push("-l".to_string());
                arguments.push(format!("bootrom,{}", firmware.display()));
            }
        }
    }

    arguments.push("-U".to_string());
    arguments.push(machine.id().to_string());
    arguments.push(machine.bhyve_name());
    Ok(arguments)
}

/// `<bus>:<slot>:<function>,<type>[,<options>...]` for one device.
fn slot_argument(
    config: &ClientConfiguration,
    machine: &VirtualMachine,
    device: &Device,
) -> Result<String> {
    let mut fields = vec![device.slot.to_string(), device.external_name().to_string()];
    if let Some(storage) = device.kind.storage() {
        let path = storage.target_path(&config.zfs_root, &machine.id(), device.slot.device_id())?;
        fields.push(path.display().to_string());
        fields.extend(storage.bhyve_options());
    }
    fields.extend(device.kind.fixed_options());
    Ok(fields.join(","))
}

/// Destroys the running instance of `machine` with bhyvectl.
pub fn compile_kill(config: &ClientConfiguration, machine: &VirtualMachine) -> ProcessDescription {
    ProcessDescription::new(
        &config.bhyvectl,
        vec![format!("--vm={}", machine.bhyve_name()), "--destroy".into()],
    )
}
