// Copyright (C) 2020, Oxide Computer Company

//! Stand-ins for the host, shared by the integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bhyve_vm::command::ProcessDescription;
use bhyve_vm::error::{Error, Result};
use bhyve_vm::storage::StorageTool;
use bhyve_vm::system::ProcessExecutor;

/// Records every process instead of running it.
pub struct FakeExecutor {
    pub status: i32,
    pub spawned: RefCell<Vec<ProcessDescription>>,
}

impl FakeExecutor {
    pub fn new() -> FakeExecutor {
        FakeExecutor::exiting_with(0)
    }

    pub fn exiting_with(status: i32) -> FakeExecutor {
        FakeExecutor {
            status,
            spawned: RefCell::new(Vec::new()),
        }
    }

    pub fn spawned(&self) -> Vec<String> {
        self.spawned.borrow().iter().map(|p| p.to_string()).collect()
    }
}

impl ProcessExecutor for FakeExecutor {
    fn spawn_and_wait(&self, process: &ProcessDescription) -> Result<i32> {
        self.spawned.borrow_mut().push(process.clone());
        Ok(self.status)
    }

    fn replace_current_process(&self, process: &ProcessDescription) -> Error {
        self.spawned.borrow_mut().push(process.clone());
        Error::ProcessFailure {
            executable: process.executable().display().to_string(),
            reason: "not replaced in tests".into(),
        }
    }
}

/// Paths and sizes held in memory.
#[derive(Default)]
pub struct MemoryStorage {
    pub objects: RefCell<BTreeMap<PathBuf, u64>>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }

    pub fn with_object(self, path: impl Into<PathBuf>, size: u64) -> MemoryStorage {
        self.objects.borrow_mut().insert(path.into(), size);
        self
    }
}

impl StorageTool for MemoryStorage {
    fn size(&self, path: &Path) -> Result<Option<u64>> {
        Ok(self.objects.borrow().get(path).copied())
    }

    fn create(&self, path: &Path, size: u64) -> Result<()> {
        self.objects.borrow_mut().insert(path.to_path_buf(), size);
        Ok(())
    }

    fn describe_create(&self, path: &Path, size: u64) -> Vec<String> {
        vec![format!("create {} ({} bytes)", path.display(), size)]
    }
}
