// Copyright (C) 2020, Oxide Computer Company

//! grub-bhyve loader invocations.
//!
//! grub-bhyve loads a kernel into a freshly created VM and exits; bhyve
//! is started afterwards. The loader is driven by a device map naming the
//! attached disks and a `grub.cfg` holding the load commands, both
//! generated here.

use std::path::{Path, PathBuf};

use crate::boot::{BootConfiguration, KernelInstructions};
use crate::command::{quote, ProcessDescription};
use crate::config::ClientConfiguration;
use crate::error::{Error, Result};
use crate::slot::DeviceSlot;
use crate::vm::VirtualMachine;

/// A file the loader reads, written before it starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedFile {
    pub path: PathBuf,
    pub contents: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrubLoader {
    pub files: Vec<GeneratedFile>,
    pub process: ProcessDescription,
}

/// The directory holding a machine's generated loader files.
pub fn grub_directory(config: &ClientConfiguration, machine: &VirtualMachine) -> PathBuf {
    config
        .runtime_directory
        .join(machine.id().to_string())
        .join("grub")
}

struct Drive {
    slot: DeviceSlot,
    name: String,
    path: PathBuf,
}

impl Drive {
    fn is_optical(&self) -> bool {
        self.name.starts_with("cd")
    }
}

/// Names attached disks `hd0`, `hd1`, ... and optical disks `cd0`, ... in
/// attachment order.
fn drives(
    config: &ClientConfiguration,
    machine: &VirtualMachine,
    boot: &BootConfiguration,
) -> Result<Vec<Drive>> {
    let mut drives = Vec::new();
    let (mut disks, mut opticals) = (0, 0);
    for attachment in boot.disks() {
        let device = machine
            .device(attachment.slot)
            .ok_or_else(|| Error::nonexistent("device", attachment.slot.to_string()))?;
        let storage = device.kind.storage().ok_or_else(|| {
            Error::validation(format!(
                "{} is attached to boot configuration '{}' but is not a storage device",
                attachment.slot,
                boot.name()
            ))
        })?;
        let name = if device.kind.is_optical() {
            opticals += 1;
            format!("cd{}", opticals - 1)
        } else {
            disks += 1;
            format!("hd{}", disks - 1)
        };
        drives.push(Drive {
            slot: attachment.slot,
            name,
            path: storage.target_path(&config.zfs_root, &machine.id(), attachment.slot.device_id())?,
        });
    }
    Ok(drives)
}

fn locate(drives: &[Drive], slot: DeviceSlot, partition: &str, path: &Path) -> Result<String> {
    let drive = drives.iter().find(|d| d.slot == slot).ok_or_else(|| {
        Error::validation(format!("{} is not attached to the boot configuration", slot))
    })?;
    if drive.is_optical() {
        Ok(format!("({}){}", drive.name, path.display()))
    } else {
        Ok(format!("({},{}){}", drive.name, partition, path.display()))
    }
}

fn script(drives: &[Drive], kernel: &KernelInstructions) -> Result<String> {
    let mut lines = Vec::new();
    match kernel {
        KernelInstructions::OpenBsd {
            kernel_path,
            boot_device,
        } => {
            lines.push(format!(
                "kopenbsd -h com0 {}",
                locate(drives, *boot_device, "openbsd1", kernel_path)?
            ));
        }
        KernelInstructions::Linux {
            kernel_path,
            kernel_device,
            arguments,
            initrd_path,
            initrd_device,
        } => {
            let mut linux = format!("linux {}", locate(drives, *kernel_device, "msdos1", kernel_path)?);
            for argument in arguments {
                // A quoted word may not span lines in grub.cfg.
                if argument.chars().any(char::is_control) {
                    return Err(Error::validation(format!(
                        "kernel argument {:?} contains a control character",
                        argument
                    )));
                }
                linux.push(' ');
                linux.push_str(&quote(argument));
            }
            lines.push(linux);
            lines.push(format!(
                "initrd {}",
                locate(drives, *initrd_device, "msdos1", initrd_path)?
            ));
        }
    }
    lines.push("boot".to_string());
    Ok(lines.join("\n") + "\n")
}

/// Compiles the grub-bhyve run for a GRUB boot configuration.
pub fn compile_grub(
    config: &ClientConfiguration,
    machine: &VirtualMachine,
    boot: &BootConfiguration,
) -> Result<GrubLoader> {
    let kernel = match boot {
        BootConfiguration::GrubBhyve { kernel, .. } => kernel,
        BootConfiguration::Uefi { .. } => {
            return Err(Error::validation(format!(
                "boot configuration '{}' does not use grub-bhyve",
                boot.name()
            )))
        }
    };

    let drives = drives(config, machine, boot)?;
    let directory = grub_directory(config, machine);
    let map_path = directory.join("device.map");
    let device_map: String = drives
        .iter()
        .map(|d| format!("({}) {}\n", d.name, d.path.display()))
        .collect();

    let files = vec![
        GeneratedFile {
            path: map_path.clone(),
            contents: device_map,
        },
        GeneratedFile {
            path: directory.join("grub.cfg"),
            contents: script(&drives, kernel)?,
        },
    ];

    let process = ProcessDescription::new(
        &config.grub_bhyve,
        vec![
            "-m".into(),
            map_path.display().to_string(),
            "-r".into(),
            "host".into(),
            "-d".into(),
            directory.display().to_string(),
            "-M".into(),
            format!("{}M", machine.memory().total_megabytes()),
            machine.bhyve_name(),
        ],
    );

    Ok(GrubLoader { files, process })
}
