// Copyright (C) 2020, Oxide Computer Company

//! Placement and removal of devices on a machine's PCI slots.

use std::collections::BTreeMap;

use log::debug;

use crate::boot::references_to;
use crate::device::{check_volume_ids, Device, DeviceKind};
use crate::error::{Error, Result};
use crate::slot::{DeviceSlot, SLOT_MAX};
use crate::vm::VirtualMachine;

/// A device to place on a machine.
#[derive(Clone, Debug)]
pub struct DeviceAddition {
    pub kind: DeviceKind,
    pub comment: String,
    /// Explicit slot; allocated on bus 0 when absent.
    pub slot: Option<DeviceSlot>,
    /// Whether an occupied explicit slot may be overwritten.
    pub replace: bool,
}

impl DeviceAddition {
    pub fn new(kind: DeviceKind) -> DeviceAddition {
        DeviceAddition {
            kind,
            comment: String::new(),
            slot: None,
            replace: false,
        }
    }

    pub fn at(self, slot: DeviceSlot) -> DeviceAddition {
        DeviceAddition {
            slot: Some(slot),
            ..self
        }
    }

    pub fn replacing(self) -> DeviceAddition {
        DeviceAddition {
            replace: true,
            ..self
        }
    }

    pub fn with_comment(self, comment: impl Into<String>) -> DeviceAddition {
        DeviceAddition {
            comment: comment.into(),
            ..self
        }
    }
}

/// The lowest free slot on bus 0, function 0. Slot 0 belongs to the host
/// bridge and is never handed out.
pub fn allocate_slot(machine: &VirtualMachine) -> Result<DeviceSlot> {
    for id in 1..=SLOT_MAX {
        let slot = DeviceSlot::new(0, id, 0)?;
        if machine.device(slot).is_none() {
            return Ok(slot);
        }
    }
    Err(Error::DeviceSlotsExhausted)
}

/// Places a device on a machine, returning the new machine and the slot
/// the device landed on.
pub fn add_device(
    machine: &VirtualMachine,
    addition: DeviceAddition,
) -> Result<(VirtualMachine, DeviceSlot)> {
    addition.kind.validate()?;

    let slot = match addition.slot {
        Some(slot) => {
            if machine.device(slot).is_some() && !addition.replace {
                return Err(Error::duplicate("device slot", slot.to_string()));
            }
            slot
        }
        None => allocate_slot(machine)?,
    };

    let host_bridge = matches!(addition.kind, DeviceKind::HostBridge { .. });
    match (slot == DeviceSlot::HOST_BRIDGE, host_bridge) {
        (true, false) => {
            return Err(Error::validation(format!(
                "{} is reserved for the host bridge",
                slot
            )))
        }
        (false, true) => {
            return Err(Error::validation(format!(
                "the host bridge belongs at {}, not {}",
                DeviceSlot::HOST_BRIDGE,
                slot
            )))
        }
        _ => (),
    }

    if addition.kind.lpc().is_some() {
        if slot.bus() != 0 {
            return Err(Error::validation(format!(
                "LPC devices must be on bus 0, not {}",
                slot
            )));
        }
        let other = machine
            .devices()
            .find(|d| d.kind.lpc().is_some() && d.slot != slot);
        if let Some(other) = other {
            return Err(Error::duplicate("LPC device", other.slot.to_string()));
        }
    }

    // A replaced device may still be attached to a boot loader.
    if addition.kind.storage().is_none() {
        let references = references_to(machine, slot);
        if !references.is_empty() {
            return Err(Error::ReferencedByBootConfiguration { references });
        }
    }

    debug!(
        "placing {} at {}{}",
        addition.kind.name(),
        slot,
        if machine.device(slot).is_some() { " (replacing)" } else { "" }
    );

    let mut devices: BTreeMap<DeviceSlot, Device> =
        machine.devices().map(|d| (d.slot, d.clone())).collect();
    devices.insert(
        slot,
        Device::new(slot, addition.kind).with_comment(addition.comment),
    );
    check_volume_ids(devices.values())?;
    Ok((machine.with_devices(devices), slot))
}

/// Removes devices from a machine.
///
/// Every slot must hold a device and none may be referenced by a boot
/// configuration. Any failure leaves the machine untouched and reports
/// every offending slot.
pub fn delete_devices(machine: &VirtualMachine, slots: &[DeviceSlot]) -> Result<VirtualMachine> {
    let missing: Vec<String> = slots
        .iter()
        .filter(|slot| machine.device(**slot).is_none())
        .map(|slot| slot.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(Error::Nonexistent {
            kind: "device",
            names: missing,
        });
    }

    if slots.contains(&DeviceSlot::HOST_BRIDGE) {
        return Err(Error::validation(format!(
            "the host bridge at {} cannot be deleted",
            DeviceSlot::HOST_BRIDGE
        )));
    }

    let references: Vec<_> = slots
        .iter()
        .flat_map(|slot| references_to(machine, *slot))
        .collect();
    if !references.is_empty() {
        return Err(Error::ReferencedByBootConfiguration { references });
    }

    let devices: BTreeMap<DeviceSlot, Device> = machine
        .devices()
        .filter(|d| !slots.contains(&d.slot))
        .map(|d| (d.slot, d.clone()))
        .collect();
    Ok(machine.with_devices(devices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HostBridgeVendor, Lpc};
    use crate::storage::StorageBackend;
    use crate::tty::{TtyBackend, TtyName};
    use crate::vm::MachineDefinition;

    fn machine() -> VirtualMachine {
        VirtualMachine::define(MachineDefinition::named("registry")).unwrap()
    }

    fn disk(path: &str) -> DeviceKind {
        DeviceKind::VirtioBlock {
            backend: StorageBackend::file(path),
        }
    }

    fn lpc() -> DeviceKind {
        DeviceKind::Lpc {
            lpc: Lpc::new(vec![TtyBackend::Stdio { name: TtyName::Com1 }]).unwrap(),
        }
    }

    #[test]
    fn test_allocation_skips_host_bridge() {
        let (_, slot) = add_device(&machine(), DeviceAddition::new(disk("/a"))).unwrap();
        assert_eq!(slot.to_string(), "0:1:0");
    }

    #[test]
    fn test_allocation_fills_gaps() {
        let m = machine();
        let (m, _) = add_device(&m, DeviceAddition::new(disk("/a")).at("0:2:0".parse().unwrap()))
            .unwrap();
        let (m, first) = add_device(&m, DeviceAddition::new(disk("/b"))).unwrap();
        let (_, second) = add_device(&m, DeviceAddition::new(disk("/c"))).unwrap();
        assert_eq!(first.to_string(), "0:1:0");
        assert_eq!(second.to_string(), "0:3:0");
    }

    #[test]
    fn test_lpc_must_be_on_bus_zero() {
        let result = add_device(&machine(), DeviceAddition::new(lpc()).at("1:31:0".parse().unwrap()));
        match result {
            Err(Error::Validation { .. }) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_single_lpc() {
        let (m, _) = add_device(&machine(), DeviceAddition::new(lpc()).at("0:31:0".parse().unwrap()))
            .unwrap();
        assert!(add_device(&m, DeviceAddition::new(lpc())).is_err());
        assert!(add_device(
            &m,
            DeviceAddition::new(lpc()).at("0:31:0".parse().unwrap()).replacing()
        )
        .is_ok());
    }

    #[test]
    fn test_delete_missing_leaves_machine() {
        let (m, slot) = add_device(&machine(), DeviceAddition::new(disk("/a"))).unwrap();
        let missing: DeviceSlot = "0:7:0".parse().unwrap();
        match delete_devices(&m, &[slot, missing]) {
            Err(Error::Nonexistent { names, .. }) => assert_eq!(names, vec!["0:7:0"]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(m.device(slot).is_some());
    }

    #[test]
    fn test_host_bridge_slot_is_reserved() {
        let m = machine();
        let host_bridge = DeviceSlot::HOST_BRIDGE;
        assert!(add_device(&m, DeviceAddition::new(disk("/a")).at(host_bridge).replacing()).is_err());
        assert!(delete_devices(&m, &[host_bridge]).is_err());
        assert!(add_device(
            &m,
            DeviceAddition::new(DeviceKind::HostBridge {
                vendor: HostBridgeVendor::Default
            })
            .at("0:5:0".parse().unwrap())
        )
        .is_err());

        let amd = DeviceKind::HostBridge {
            vendor: HostBridgeVendor::Amd,
        };
        let (m, _) = add_device(&m, DeviceAddition::new(amd).at(host_bridge).replacing()).unwrap();
        assert_eq!(m.device(host_bridge).unwrap().external_name(), "amd_hostbridge");
    }

    #[test]
    fn test_delete_removes_exactly_one() {
        let (m, a) = add_device(&machine(), DeviceAddition::new(disk("/a"))).unwrap();
        let (m, b) = add_device(&m, DeviceAddition::new(disk("/b"))).unwrap();
        let m = delete_devices(&m, &[a]).unwrap();
        assert!(m.device(a).is_none());
        assert!(m.device(b).is_some());
        assert!(m.device(DeviceSlot::HOST_BRIDGE).is_some());
    }
}
