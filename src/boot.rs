// Copyright (C) 2020, Oxide Computer Company

//! Named boot configurations, and merging them into a machine.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, SlotReference};
use crate::slot::DeviceSlot;
use crate::vm::VirtualMachine;

/// A storage device made visible to the boot loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskAttachment {
    pub slot: DeviceSlot,
}

/// What grub-bhyve loads, and from which attached device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum KernelInstructions {
    OpenBsd {
        kernel_path: PathBuf,
        boot_device: DeviceSlot,
    },
    Linux {
        kernel_path: PathBuf,
        kernel_device: DeviceSlot,
        #[serde(default)]
        arguments: Vec<String>,
        initrd_path: PathBuf,
        initrd_device: DeviceSlot,
    },
}

impl KernelInstructions {
    pub fn slots(&self) -> Vec<DeviceSlot> {
        match self {
            KernelInstructions::OpenBsd { boot_device, .. } => vec![*boot_device],
            KernelInstructions::Linux {
                kernel_device,
                initrd_device,
                ..
            } => vec![*kernel_device, *initrd_device],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BootConfiguration {
    GrubBhyve {
        name: String,
        #[serde(default)]
        comment: String,
        kernel: KernelInstructions,
        #[serde(default)]
        disks: Vec<DiskAttachment>,
    },
    Uefi {
        name: String,
        #[serde(default)]
        comment: String,
        firmware: PathBuf,
        #[serde(default)]
        disks: Vec<DiskAttachment>,
    },
}

impl BootConfiguration {
    pub fn name(&self) -> &str {
        match self {
            BootConfiguration::GrubBhyve { name, .. } | BootConfiguration::Uefi { name, .. } => name,
        }
    }

    pub fn disks(&self) -> &[DiskAttachment] {
        match self {
            BootConfiguration::GrubBhyve { disks, .. } | BootConfiguration::Uefi { disks, .. } => {
                disks
            }
        }
    }

    /// Every device slot this configuration names, as a boot device or as
    /// an attached disk.
    pub fn referenced_slots(&self) -> BTreeSet<DeviceSlot> {
        let mut slots: BTreeSet<DeviceSlot> = self.disks().iter().map(|d| d.slot).collect();
        if let BootConfiguration::GrubBhyve { kernel, .. } = self {
            slots.extend(kernel.slots());
        }
        slots
    }

    /// Checks the configuration against the devices of `machine`.
    ///
    /// Every referenced slot must hold a device, attached disks must be
    /// storage devices, and a kernel must be loaded from an attached disk.
    pub fn validate(&self, machine: &VirtualMachine) -> Result<()> {
        if self.name().trim().is_empty() {
            return Err(Error::validation("boot configuration name cannot be empty"));
        }

        let missing: Vec<String> = self
            .referenced_slots()
            .into_iter()
            .filter(|slot| machine.device(*slot).is_none())
            .map(|slot| slot.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::Nonexistent {
                kind: "device",
                names: missing,
            });
        }

        for disk in self.disks() {
            let storage = machine.device(disk.slot).and_then(|d| d.kind.storage());
            if storage.is_none() {
                return Err(Error::validation(format!(
                    "boot configuration '{}' attaches {}, which is not a storage device",
                    self.name(),
                    disk.slot
                )));
            }
        }

        if let BootConfiguration::GrubBhyve { kernel, .. } = self {
            for slot in kernel.slots() {
                if !self.disks().iter().any(|d| d.slot == slot) {
                    return Err(Error::validation(format!(
                        "boot configuration '{}' loads from {}, which is not an attached disk",
                        self.name(),
                        slot
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Every boot configuration of `machine` that names `slot`.
pub fn references_to(machine: &VirtualMachine, slot: DeviceSlot) -> Vec<SlotReference> {
    machine
        .boot_configurations()
        .filter(|configuration| configuration.referenced_slots().contains(&slot))
        .map(|configuration| SlotReference {
            slot,
            configuration: configuration.name().to_string(),
        })
        .collect()
}

/// Adds the given configurations to a machine.
///
/// A name already present is replaced when `allow_update` is set and
/// rejected otherwise. Either every configuration is merged or the
/// machine is left as it was.
pub fn merge_boot_configurations(
    machine: &VirtualMachine,
    configurations: Vec<BootConfiguration>,
    allow_update: bool,
) -> Result<VirtualMachine> {
    let mut merged: BTreeMap<String, BootConfiguration> = machine
        .boot_configurations()
        .map(|c| (c.name().to_string(), c.clone()))
        .collect();
    let mut seen = BTreeSet::new();

    for configuration in configurations {
        let name = configuration.name().to_string();
        if !seen.insert(name.clone()) {
            return Err(Error::duplicate("boot configuration", name));
        }
        if merged.contains_key(&name) && !allow_update {
            return Err(Error::duplicate("boot configuration", name));
        }
        configuration.validate(machine)?;
        debug!("merging boot configuration '{}'", name);
        merged.insert(name, configuration);
    }

    Ok(machine.with_boot_configurations(merged))
}

/// Removes the named configurations. Every name must exist; otherwise
/// nothing is removed and all missing names are reported.
pub fn remove_boot_configurations<S: AsRef<str>>(
    machine: &VirtualMachine,
    names: &[S],
) -> Result<VirtualMachine> {
    let missing: Vec<String> = names
        .iter()
        .map(|n| n.as_ref())
        .filter(|n| machine.boot_configuration(n).is_none())
        .map(str::to_string)
        .collect();
    if !missing.is_empty() {
        return Err(Error::Nonexistent {
            kind: "boot configuration",
            names: missing,
        });
    }

    let remaining: BTreeMap<String, BootConfiguration> = machine
        .boot_configurations()
        .filter(|c| !names.iter().any(|n| n.as_ref() == c.name()))
        .map(|c| (c.name().to_string(), c.clone()))
        .collect();
    Ok(machine.with_boot_configurations(remaining))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;
    use crate::registry::{add_device, DeviceAddition};
    use crate::storage::StorageBackend;
    use crate::vm::MachineDefinition;

    fn slot(text: &str) -> DeviceSlot {
        text.parse().unwrap()
    }

    fn machine_with_disk() -> VirtualMachine {
        let machine = VirtualMachine::define(MachineDefinition::named("boot-test")).unwrap();
        let addition = DeviceAddition::new(DeviceKind::AhciDisk {
            backend: StorageBackend::file("/tmp/xyz"),
        })
        .at(slot("0:1:0"));
        add_device(&machine, addition).unwrap().0
    }

    fn openbsd(name: &str, device: &str) -> BootConfiguration {
        BootConfiguration::GrubBhyve {
            name: name.into(),
            comment: String::new(),
            kernel: KernelInstructions::OpenBsd {
                kernel_path: PathBuf::from("/bsd"),
                boot_device: slot(device),
            },
            disks: vec![DiskAttachment { slot: slot(device) }],
        }
    }

    #[test]
    fn test_merge_then_duplicate() {
        let machine = machine_with_disk();
        let machine = merge_boot_configurations(&machine, vec![openbsd("install", "0:1:0")], false)
            .unwrap();
        assert!(machine.boot_configuration("install").is_some());

        match merge_boot_configurations(&machine, vec![openbsd("install", "0:1:0")], false) {
            Err(Error::Duplicate { name, .. }) => assert_eq!(name, "install"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(merge_boot_configurations(&machine, vec![openbsd("install", "0:1:0")], true).is_ok());
    }

    #[test]
    fn test_merge_is_all_or_nothing() {
        let machine = machine_with_disk();
        let result = merge_boot_configurations(
            &machine,
            vec![openbsd("good", "0:1:0"), openbsd("bad", "0:9:0")],
            false,
        );
        match result {
            Err(Error::Nonexistent { kind, names }) => {
                assert_eq!(kind, "device");
                assert_eq!(names, vec!["0:9:0"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(machine.boot_configurations().count(), 0);
    }

    #[test]
    fn test_batch_with_repeated_name_rejected() {
        let machine = machine_with_disk();
        assert!(merge_boot_configurations(
            &machine,
            vec![openbsd("a", "0:1:0"), openbsd("a", "0:1:0")],
            true
        )
        .is_err());
    }

    #[test]
    fn test_kernel_device_must_be_attached() {
        let machine = machine_with_disk();
        let configuration = BootConfiguration::GrubBhyve {
            name: "detached".into(),
            comment: String::new(),
            kernel: KernelInstructions::OpenBsd {
                kernel_path: PathBuf::from("/bsd"),
                boot_device: slot("0:1:0"),
            },
            disks: Vec::new(),
        };
        match merge_boot_configurations(&machine, vec![configuration], false) {
            Err(Error::Validation { .. }) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_attached_host_bridge_rejected() {
        let machine = machine_with_disk();
        let configuration = BootConfiguration::Uefi {
            name: "uefi".into(),
            comment: String::new(),
            firmware: PathBuf::from("/usr/local/share/uefi-firmware/BHYVE_UEFI.fd"),
            disks: vec![DiskAttachment {
                slot: DeviceSlot::HOST_BRIDGE,
            }],
        };
        assert!(merge_boot_configurations(&machine, vec![configuration], false).is_err());
    }

    #[test]
    fn test_remove_reports_all_missing() {
        let machine = machine_with_disk();
        let machine =
            merge_boot_configurations(&machine, vec![openbsd("install", "0:1:0")], false).unwrap();
        match remove_boot_configurations(&machine, &["install", "x", "y"]) {
            Err(Error::Nonexistent { names, .. }) => assert_eq!(names, vec!["x", "y"]),
            other => panic!("unexpected {:?}", other),
        }
        let machine = remove_boot_configurations(&machine, &["install"]).unwrap();
        assert_eq!(machine.boot_configurations().count(), 0);
    }

    #[test]
    fn test_references_to() {
        let machine = machine_with_disk();
        let machine =
            merge_boot_configurations(&machine, vec![openbsd("install", "0:1:0")], false).unwrap();
        let references = references_to(&machine, slot("0:1:0"));
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].configuration, "install");
        assert!(references_to(&machine, slot("0:2:0")).is_empty());
    }
}
