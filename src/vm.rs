// Copyright (C) 2020, Oxide Computer Company

//! The virtual machine value.
//!
//! A `VirtualMachine` is never modified in place. Every operation reads a
//! machine and returns a new one, which the caller persists as a whole.

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::boot::BootConfiguration;
use crate::device::{check_volume_ids, Device, DeviceKind, HostBridgeVendor};
use crate::error::{Error, Result};
use crate::flags::{FlagOverrides, Flags};
use crate::slot::DeviceSlot;
use crate::topology::{CpuTopology, Memory};

/// Everything needed to define a new machine.
#[derive(Clone, Debug)]
pub struct MachineDefinition {
    pub id: Option<Uuid>,
    pub name: String,
    pub comment: String,
    pub cpu: CpuTopology,
    pub memory: Memory,
    pub flags: FlagOverrides,
}

impl MachineDefinition {
    /// One vCPU, no memory, default flags.
    pub fn named(name: impl Into<String>) -> MachineDefinition {
        MachineDefinition {
            id: None,
            name: name.into(),
            comment: String::new(),
            cpu: CpuTopology::default(),
            memory: Memory::default(),
            flags: FlagOverrides::new(),
        }
    }
}

/// Changes to the scalar properties of a machine. Unset fields keep
/// their current values.
#[derive(Clone, Debug, Default)]
pub struct MachineDelta {
    pub name: Option<String>,
    pub comment: Option<String>,
    pub cpu: Option<CpuTopology>,
    pub memory: Option<Memory>,
    pub flags: FlagOverrides,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MachineRecord", into = "MachineRecord")]
pub struct VirtualMachine {
    id: Uuid,
    name: String,
    comment: String,
    cpu: CpuTopology,
    memory: Memory,
    flags: Flags,
    devices: BTreeMap<DeviceSlot, Device>,
    boot_configurations: BTreeMap<String, BootConfiguration>,
    source: Option<PathBuf>,
}

impl VirtualMachine {
    /// Defines a new machine with a host bridge at `0:0:0`.
    pub fn define(definition: MachineDefinition) -> Result<VirtualMachine> {
        check_name(&definition.name)?;

        let mut devices = BTreeMap::new();
        devices.insert(
            DeviceSlot::HOST_BRIDGE,
            Device::new(
                DeviceSlot::HOST_BRIDGE,
                DeviceKind::HostBridge {
                    vendor: HostBridgeVendor::Default,
                },
            ),
        );

        Ok(VirtualMachine {
            id: definition.id.unwrap_or_else(Uuid::new_v4),
            name: definition.name,
            comment: definition.comment,
            cpu: definition.cpu,
            memory: definition.memory,
            flags: Flags::default().apply(&definition.flags),
            devices,
            boot_configurations: BTreeMap::new(),
            source: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn cpu(&self) -> &CpuTopology {
        &self.cpu
    }

    pub fn memory(&self) -> Memory {
        self.memory
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// The name bhyve and bhyvectl know this machine by.
    pub fn bhyve_name(&self) -> String {
        self.id.to_string()
    }

    /// Devices in slot order.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn device(&self, slot: DeviceSlot) -> Option<&Device> {
        self.devices.get(&slot)
    }

    pub fn boot_configurations(&self) -> impl Iterator<Item = &BootConfiguration> {
        self.boot_configurations.values()
    }

    pub fn boot_configuration(&self, name: &str) -> Option<&BootConfiguration> {
        self.boot_configurations.get(name)
    }

    /// The record this machine was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn apply(&self, delta: &MachineDelta) -> Result<VirtualMachine> {
        if let Some(name) = &delta.name {
            check_name(name)?;
        }
        Ok(VirtualMachine {
            name: delta.name.clone().unwrap_or_else(|| self.name.clone()),
            comment: delta.comment.clone().unwrap_or_else(|| self.comment.clone()),
            cpu: delta.cpu.clone().unwrap_or_else(|| self.cpu.clone()),
            memory: delta.memory.unwrap_or(self.memory),
            flags: self.flags.apply(&delta.flags),
            ..self.clone()
        })
    }

    pub(crate) fn with_devices(&self, devices: BTreeMap<DeviceSlot, Device>) -> VirtualMachine {
        VirtualMachine {
            devices,
            ..self.clone()
        }
    }

    pub(crate) fn with_boot_configurations(
        &self,
        boot_configurations: BTreeMap<String, BootConfiguration>,
    ) -> VirtualMachine {
        VirtualMachine {
            boot_configurations,
            ..self.clone()
        }
    }

    pub fn with_source(&self, source: impl Into<PathBuf>) -> VirtualMachine {
        VirtualMachine {
            source: Some(source.into()),
            ..self.clone()
        }
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::validation("machine name cannot be empty"));
    }
    if name.chars().any(char::is_control) {
        return Err(Error::validation(format!(
            "machine name {:?} contains control characters",
            name
        )));
    }
    Ok(())
}

// Persisted layout: devices and boot configurations as lists, so that
// slots and names stay inside the entries they key.
#[derive(Serialize, Deserialize)]
struct MachineRecord {
    id: Uuid,
    name: String,
    #[serde(default)]
    comment: String,
    cpu: CpuTopology,
    memory: Memory,
    #[serde(default)]
    flags: Flags,
    #[serde(default)]
    devices: Vec<Device>,
    #[serde(default)]
    boot_configurations: Vec<BootConfiguration>,
}

impl TryFrom<MachineRecord> for VirtualMachine {
    type Error = Error;

    fn try_from(record: MachineRecord) -> Result<VirtualMachine> {
        check_name(&record.name)?;

        let mut devices = BTreeMap::new();
        for device in record.devices {
            device.kind.validate()?;
            let slot = device.slot;
            if devices.insert(slot, device).is_some() {
                return Err(Error::duplicate("device slot", slot.to_string()));
            }
        }

        check_volume_ids(devices.values())?;

        let mut boot_configurations = BTreeMap::new();
        for configuration in record.boot_configurations {
            let name = configuration.name().to_string();
            if boot_configurations.insert(name.clone(), configuration).is_some() {
                return Err(Error::duplicate("boot configuration", name));
            }
        }

        Ok(VirtualMachine {
            id: record.id,
            name: record.name,
            comment: record.comment,
            cpu: record.cpu,
            memory: record.memory,
            flags: record.flags,
            devices,
            boot_configurations,
            source: None,
        })
    }
}

impl From<VirtualMachine> for MachineRecord {
    fn from(machine: VirtualMachine) -> MachineRecord {
        MachineRecord {
            id: machine.id,
            name: machine.name,
            comment: machine.comment,
            cpu: machine.cpu,
            memory: machine.memory,
            flags: machine.flags,
            devices: machine.devices.into_iter().map(|(_, d)| d).collect(),
            boot_configurations: machine
                .boot_configurations
                .into_iter()
                .map(|(_, c)| c)
                .collect(),
        }
    }
}
