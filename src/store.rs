// Copyright (C) 2020, Oxide Computer Company

//! One persisted record per machine, keyed by UUID.
//!
//! Records are only ever replaced whole: a new value is written to a
//! temporary file beside the record and renamed over it. There is no
//! locking between concurrent invocations.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};
use uuid::Uuid;
use vmm_sys_util::rand::rand_alphanumerics;

use crate::codec::{JsonCodec, MachineCodec};
use crate::error::{Error, Result};
use crate::vm::VirtualMachine;

const RECORD_EXTENSION: &str = "json";
const TEMPORARY_SUFFIX_LENGTH: usize = 12;

pub struct MachineStore<C: MachineCodec = JsonCodec> {
    directory: PathBuf,
    codec: C,
}

impl MachineStore<JsonCodec> {
    /// Opens the store at `directory`, creating it if necessary.
    pub fn open(directory: impl Into<PathBuf>) -> Result<MachineStore<JsonCodec>> {
        MachineStore::with_codec(directory, JsonCodec)
    }
}

impl<C: MachineCodec> MachineStore<C> {
    pub fn with_codec(directory: impl Into<PathBuf>, codec: C) -> Result<MachineStore<C>> {
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|e| Error::io(&directory, e))?;
        Ok(MachineStore { directory, codec })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn record_path(&self, id: &Uuid) -> PathBuf {
        self.directory.join(format!("{}.{}", id, RECORD_EXTENSION))
    }

    /// Every stored machine, ordered by name and then UUID.
    pub fn list(&self) -> Result<Vec<VirtualMachine>> {
        let entries = fs::read_dir(&self.directory).map_err(|e| Error::io(&self.directory, e))?;
        let mut machines = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Error::io(&self.directory, e))?.path();
            let id = match record_id(&path) {
                Some(id) => id,
                None => continue,
            };
            machines.push(self.get(&id)?);
        }
        machines.sort_by(|a, b| (a.name(), a.id()).cmp(&(b.name(), b.id())));
        Ok(machines)
    }

    pub fn get(&self, id: &Uuid) -> Result<VirtualMachine> {
        let path = self.record_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::nonexistent("machine", id.to_string()))
            }
            Err(e) => return Err(Error::io(&path, e)),
        };
        let machine = self.codec.decode(&bytes)?;
        if machine.id() != *id {
            return Err(Error::Codec {
                reason: format!(
                    "{} holds machine {}",
                    path.display(),
                    machine.id()
                ),
            });
        }
        Ok(machine.with_source(path))
    }

    /// Looks a machine up by UUID, or failing that by name.
    pub fn find(&self, key: &str) -> Result<VirtualMachine> {
        if let Ok(id) = Uuid::parse_str(key) {
            return self.get(&id);
        }
        let mut matches: Vec<VirtualMachine> = self
            .list()?
            .into_iter()
            .filter(|m| m.name() == key)
            .collect();
        match matches.len() {
            0 => Err(Error::nonexistent("machine", key)),
            1 => Ok(matches.remove(0)),
            n => Err(Error::validation(format!(
                "{} machines are named '{}'; use a UUID",
                n, key
            ))),
        }
    }

    pub fn exists(&self, id: &Uuid) -> bool {
        self.record_path(id).exists()
    }

    /// Stores a newly defined machine. Its UUID and name must be unused.
    pub fn insert(&self, machine: &VirtualMachine) -> Result<VirtualMachine> {
        if self.exists(&machine.id()) {
            return Err(Error::duplicate("machine", machine.id().to_string()));
        }
        if self.list()?.iter().any(|m| m.name() == machine.name()) {
            return Err(Error::duplicate("machine name", machine.name()));
        }
        self.put(machine)
    }

    /// Atomically writes the record for `machine`, replacing any previous
    /// one.
    pub fn put(&self, machine: &VirtualMachine) -> Result<VirtualMachine> {
        let bytes = self.codec.encode(machine)?;
        let target = self.record_path(&machine.id());
        let temporary = self.directory.join(format!(
            ".{}.{}.tmp",
            machine.id(),
            rand_alphanumerics(TEMPORARY_SUFFIX_LENGTH).to_string_lossy()
        ));

        let result = write_synced(&temporary, &bytes)
            .and_then(|_| fs::rename(&temporary, &target).map_err(|e| Error::io(&target, e)));
        if result.is_err() {
            let _ = fs::remove_file(&temporary);
        }
        result?;

        // Persist the rename itself.
        File::open(&self.directory)
            .and_then(|directory| directory.sync_all())
            .map_err(|e| Error::io(&self.directory, e))?;

        debug!("wrote {}", target.display());
        Ok(machine.with_source(target))
    }

    pub fn delete(&self, id: &Uuid) -> Result<()> {
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("deleted machine {}", id);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::nonexistent("machine", id.to_string()))
            }
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    pub fn export(&self, id: &Uuid) -> Result<Vec<u8>> {
        self.codec.encode(&self.get(id)?)
    }

    /// Stores an exported record. An existing machine with the same UUID
    /// is only overwritten when `replace` is set.
    pub fn import(&self, bytes: &[u8], replace: bool) -> Result<VirtualMachine> {
        let machine = self.codec.decode(bytes)?;
        if !replace {
            return self.insert(&machine);
        }
        // Replacing keeps the id but must not take another machine's name.
        if self
            .list()?
            .iter()
            .any(|m| m.id() != machine.id() && m.name() == machine.name())
        {
            return Err(Error::duplicate("machine name", machine.name()));
        }
        self.put(&machine)
    }
}

fn record_id(path: &Path) -> Option<Uuid> {
    if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
        return None;
    }
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| Uuid::parse_str(stem).ok())
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(|e| Error::io(path, e))?;
    file.write_all(bytes).map_err(|e| Error::io(path, e))?;
    file.sync_all().map_err(|e| Error::io(path, e))
}
