// Copyright (C) 2020, Oxide Computer Company

//! Realization: bringing a machine's host-side resources into existence.

use std::fmt;

use log::info;

use crate::command::ProcessDescription;
use crate::config::ClientConfiguration;
use crate::error::{Error, Result};
use crate::slot::DeviceSlot;
use crate::storage::{realize_storage, StorageRealization, StorageTool};
use crate::system::ProcessExecutor;
use crate::vm::VirtualMachine;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RealizationStep {
    Storage {
        slot: DeviceSlot,
        outcome: StorageRealization,
    },
    Network {
        slot: DeviceSlot,
        commands: Vec<ProcessDescription>,
        executed: bool,
    },
}

impl fmt::Display for RealizationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RealizationStep::Storage { slot, outcome } => match outcome {
                StorageRealization::Existing { path, size } => {
                    write!(f, "{}: {} exists ({} bytes)", slot, path.display(), size)
                }
                StorageRealization::Missing { path } => {
                    write!(f, "{}: {} does not exist", slot, path.display())
                }
                StorageRealization::SizeMismatch {
                    path,
                    expected,
                    actual,
                } => write!(
                    f,
                    "{}: {} is {} bytes, expected {}",
                    slot,
                    path.display(),
                    actual,
                    expected
                ),
                StorageRealization::Created { path, size } => {
                    write!(f, "{}: created {} ({} bytes)", slot, path.display(), size)
                }
                StorageRealization::WouldCreate { steps, .. } => {
                    write!(f, "{}: would run:", slot)?;
                    for step in steps {
                        write!(f, "\n  {}", step)?;
                    }
                    Ok(())
                }
            },
            RealizationStep::Network {
                slot,
                commands,
                executed,
            } => {
                write!(f, "{}: {}", slot, if *executed { "ran:" } else { "would run:" })?;
                for command in commands {
                    write!(f, "\n  {}", command)?;
                }
                Ok(())
            }
        }
    }
}

pub struct Realizer<'a> {
    config: &'a ClientConfiguration,
    storage: &'a dyn StorageTool,
    executor: &'a dyn ProcessExecutor,
}

impl<'a> Realizer<'a> {
    pub fn new(
        config: &'a ClientConfiguration,
        storage: &'a dyn StorageTool,
        executor: &'a dyn ProcessExecutor,
    ) -> Realizer<'a> {
        Realizer {
            config,
            storage,
            executor,
        }
    }

    /// Realizes every storage and network backend of `machine`, in slot
    /// order. A dry run queries but changes nothing.
    pub fn realize(&self, machine: &VirtualMachine, dry_run: bool) -> Result<Vec<RealizationStep>> {
        let mut steps = Vec::new();
        for device in machine.devices() {
            if let Some(backend) = device.kind.storage() {
                let target =
                    backend.target_path(&self.config.zfs_root, &machine.id(), device.slot.device_id())?;
                let outcome = realize_storage(
                    self.storage,
                    backend,
                    &target,
                    backend.expected_size(),
                    dry_run,
                )?;
                steps.push(RealizationStep::Storage {
                    slot: device.slot,
                    outcome,
                });
            }

            if let Some(backend) = device.kind.network() {
                let exists = self.storage.size(&backend.device_node())?.is_some();
                let commands = backend.realization_commands(&self.config.ifconfig, exists);
                if !dry_run {
                    for command in &commands {
                        info!("{}", command);
                        let status = self.executor.spawn_and_wait(command)?;
                        if status != 0 {
                            return Err(Error::ProcessFailure {
                                executable: command.executable().display().to_string(),
                                reason: format!("'{}' exited with status {}", command, status),
                            });
                        }
                    }
                }
                steps.push(RealizationStep::Network {
                    slot: device.slot,
                    commands,
                    executed: !dry_run,
                });
            }
        }
        Ok(steps)
    }
}
