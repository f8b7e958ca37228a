//! # Declarative bhyve virtual machines
//!
//! `bhyve-vm` keeps a description of each virtual machine on a FreeBSD
//! host: its CPU topology, memory, runtime flags, the devices on its
//! virtual PCI bus, and named ways of booting it. From that description
//! it provisions the backing storage and network interfaces, and compiles
//! the exact `bhyve`, `grub-bhyve`, `bhyvectl` and console invocations
//! needed to run, attach to, or stop the machine.
//!
//! Machines are immutable values. Every change produces a new
//! `VirtualMachine`, which is then written back whole to its record in
//! the machine store.
//!
//!     use bhyve_vm::registry::{add_device, DeviceAddition};
//!     use bhyve_vm::device::DeviceKind;
//!     use bhyve_vm::storage::StorageBackend;
//!     use bhyve_vm::vm::{MachineDefinition, VirtualMachine};
//!     let machine = VirtualMachine::define(MachineDefinition::named("web")).expect("failed to define");
//!     let disk = DeviceKind::AhciDisk { backend: StorageBackend::file("/tmp/web.img") };
//!     let (machine, slot) = add_device(&machine, DeviceAddition::new(disk)).expect("failed to add disk");
//!     assert_eq!(slot.to_string(), "0:1:0");
//!     assert_eq!(machine.devices().count(), 2);

pub mod boot;
pub mod codec;
pub mod command;
pub mod config;
pub mod console;
pub mod device;
pub mod error;
pub mod flags;
pub mod grub;
pub mod network;
pub mod realize;
pub mod registry;
pub mod slot;
pub mod storage;
pub mod store;
pub mod system;
pub mod topology;
pub mod tty;
pub mod vm;

pub use crate::error::{Error, Result};
