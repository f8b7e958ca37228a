// Copyright (C) 2020, Oxide Computer Company

//! Client configuration: where the host tools live and where state is kept.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_BHYVE: &str = "/usr/sbin/bhyve";
pub const DEFAULT_BHYVECTL: &str = "/usr/sbin/bhyvectl";
pub const DEFAULT_GRUB_BHYVE: &str = "/usr/local/sbin/grub-bhyve";
pub const DEFAULT_ZFS: &str = "/sbin/zfs";
pub const DEFAULT_IFCONFIG: &str = "/sbin/ifconfig";
pub const DEFAULT_CU: &str = "/usr/bin/cu";
pub const DEFAULT_ZFS_ROOT: &str = "/storage/vm";
pub const DEFAULT_MACHINE_DIRECTORY: &str = "/var/db/bhyve-vm";
pub const DEFAULT_RUNTIME_DIRECTORY: &str = "/var/run/bhyve-vm";

/// Every field may be set independently in the configuration file; the
/// rest keep their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ClientConfiguration {
    pub bhyve: PathBuf,
    pub bhyvectl: PathBuf,
    pub grub_bhyve: PathBuf,
    pub zfs: PathBuf,
    pub ifconfig: PathBuf,
    /// Attaches a terminal to a serial device.
    pub cu: PathBuf,
    /// Mountpoint of the ZFS filesystem holding machine volumes.
    pub zfs_root: PathBuf,
    /// Directory of persisted machine records.
    pub machine_directory: PathBuf,
    /// Scratch space for generated loader files.
    pub runtime_directory: PathBuf,
}

impl Default for ClientConfiguration {
    fn default() -> ClientConfiguration {
        ClientConfiguration {
            bhyve: PathBuf::from(DEFAULT_BHYVE),
            bhyvectl: PathBuf::from(DEFAULT_BHYVECTL),
            grub_bhyve: PathBuf::from(DEFAULT_GRUB_BHYVE),
            zfs: PathBuf::from(DEFAULT_ZFS),
            ifconfig: PathBuf::from(DEFAULT_IFCONFIG),
            cu: PathBuf::from(DEFAULT_CU),
            zfs_root: PathBuf::from(DEFAULT_ZFS_ROOT),
            machine_directory: PathBuf::from(DEFAULT_MACHINE_DIRECTORY),
            runtime_directory: PathBuf::from(DEFAULT_RUNTIME_DIRECTORY),
        }
    }
}

impl ClientConfiguration {
    /// Parses a TOML document and checks that every path is absolute.
    pub fn parse(text: &str) -> Result<ClientConfiguration> {
        let config: ClientConfiguration = toml::from_str(text)
            .map_err(|e| Error::validation(format!("client configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration at `path`. A file that does not exist
    /// yields the defaults.
    pub fn load(path: &Path) -> Result<ClientConfiguration> {
        match fs::read_to_string(path) {
            Ok(text) => {
                debug!("loading client configuration from {}", path.display());
                ClientConfiguration::parse(&text)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} not found, using defaults", path.display());
                Ok(ClientConfiguration::default())
            }
            Err(e) => Err(Error::io(path, e)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let paths = [
            ("bhyve", &self.bhyve),
            ("bhyvectl", &self.bhyvectl),
            ("grub-bhyve", &self.grub_bhyve),
            ("zfs", &self.zfs),
            ("ifconfig", &self.ifconfig),
            ("cu", &self.cu),
            ("zfs-root", &self.zfs_root),
            ("machine-directory", &self.machine_directory),
            ("runtime-directory", &self.runtime_directory),
        ];
        for (name, path) in paths.iter() {
            if !path.is_absolute() {
                return Err(Error::validation(format!(
                    "{} must be an absolute path, not {}",
                    name,
                    path.display()
                )));
            }
        }
        Ok(())
    }
}
