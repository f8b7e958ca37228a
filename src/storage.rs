// Copyright (C) 2020, Oxide Computer Company

//! Storage backends for block devices, and realization of their
//! on-disk state.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::ProcessDescription;
use crate::error::{Error, Result};
use crate::system::ProcessExecutor;

/// How bhyve opens a file backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpenOption {
    NoCache,
    Synchronous,
    ReadOnly,
}

impl OpenOption {
    fn bhyve_option(self) -> &'static str {
        match self {
            OpenOption::NoCache => "nocache",
            OpenOption::Synchronous => "direct",
            OpenOption::ReadOnly => "ro",
        }
    }
}

/// Logical and, optionally, physical sector sizes in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorSizes {
    pub logical: u32,
    pub physical: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StorageBackend {
    File {
        path: PathBuf,
        #[serde(default)]
        options: BTreeSet<OpenOption>,
        #[serde(default)]
        sector_sizes: Option<SectorSizes>,
    },
    ZfsVolume {
        #[serde(default)]
        expected_size: Option<u64>,
    },
    Scsi,
}

/// Where a ZFS-volume-backed device keeps its data:
/// `<root>/<machine>/disk-<device>`.
pub fn zfs_volume_path(root: &Path, machine_id: &Uuid, device_id: u32) -> PathBuf {
    root.join(machine_id.to_string())
        .join(format!("disk-{}", device_id))
}

impl StorageBackend {
    pub fn file(path: impl Into<PathBuf>) -> StorageBackend {
        StorageBackend::File {
            path: path.into(),
            options: BTreeSet::new(),
            sector_sizes: None,
        }
    }

    /// The path bhyve opens for this backend.
    pub fn target_path(&self, zfs_root: &Path, machine_id: &Uuid, device_id: u32) -> Result<PathBuf> {
        match self {
            StorageBackend::File { path, .. } => Ok(path.clone()),
            StorageBackend::ZfsVolume { .. } => Ok(zfs_volume_path(zfs_root, machine_id, device_id)),
            StorageBackend::Scsi => Err(Error::Unimplemented {
                feature: "SCSI storage backend",
            }),
        }
    }

    pub fn expected_size(&self) -> Option<u64> {
        match self {
            StorageBackend::ZfsVolume { expected_size } => *expected_size,
            StorageBackend::File { .. } | StorageBackend::Scsi => None,
        }
    }

    /// The comma-separated options bhyve accepts after the backing path.
    pub fn bhyve_options(&self) -> Vec<String> {
        let mut result = Vec::new();
        if let StorageBackend::File {
            options,
            sector_sizes,
            ..
        } = self
        {
            result.extend(options.iter().map(|o| o.bhyve_option().to_string()));
            match sector_sizes {
                Some(SectorSizes {
                    logical,
                    physical: Some(physical),
                }) => result.push(format!("sectorsize={}/{}", logical, physical)),
                Some(SectorSizes {
                    logical,
                    physical: None,
                }) => result.push(format!("sectorsize={}", logical)),
                None => (),
            }
        }
        result
    }
}

impl FromStr for StorageBackend {
    type Err = Error;

    /// `file;<path>[;nocache][;sync][;ro][;sectorsize=L[/P]]`,
    /// `zfs-volume[;<bytes>]` or `scsi`.
    fn from_str(text: &str) -> Result<StorageBackend> {
        let fields: Vec<&str> = text.split(';').collect();
        match fields[0] {
            "file" => {
                let path = fields
                    .get(1)
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| Error::validation("file backend requires a path"))?;
                let mut options = BTreeSet::new();
                let mut sector_sizes = None;
                for field in &fields[2..] {
                    match *field {
                        "nocache" => {
                            options.insert(OpenOption::NoCache);
                        }
                        "sync" => {
                            options.insert(OpenOption::Synchronous);
                        }
                        "ro" => {
                            options.insert(OpenOption::ReadOnly);
                        }
                        other if other.starts_with("sectorsize=") => {
                            sector_sizes = Some(parse_sector_sizes(&other["sectorsize=".len()..])?);
                        }
                        other => {
                            return Err(Error::validation(format!(
                                "unknown file backend option '{}'",
                                other
                            )))
                        }
                    }
                }
                Ok(StorageBackend::File {
                    path: PathBuf::from(*path),
                    options,
                    sector_sizes,
                })
            }
            "zfs-volume" => {
                let expected_size = match fields.get(1) {
                    Some(size) if !size.is_empty() => Some(size.parse().map_err(|_| {
                        Error::validation(format!("'{}' is not a size in bytes", size))
                    })?),
                    _ => None,
                };
                if fields.len() > 2 {
                    return Err(Error::validation("zfs-volume backend takes at most a size"));
                }
                Ok(StorageBackend::ZfsVolume { expected_size })
            }
            "scsi" => Ok(StorageBackend::Scsi),
            other => Err(Error::validation(format!(
                "unknown storage backend kind '{}'",
                other
            ))),
        }
    }
}

fn parse_sector_sizes(text: &str) -> Result<SectorSizes> {
    let parse = |s: &str| -> Result<u32> {
        s.parse()
            .map_err(|_| Error::validation(format!("'{}' is not a sector size", s)))
    };
    let mut parts = text.splitn(2, '/');
    let logical = parse(parts.next().unwrap_or(""))?;
    let physical = match parts.next() {
        Some(physical) => Some(parse(physical)?),
        None => None,
    };
    Ok(SectorSizes { logical, physical })
}

/// Filesystem and ZFS queries and mutations used during realization.
pub trait StorageTool {
    /// Size in bytes of the object at `path`, or `None` if it is absent.
    fn size(&self, path: &Path) -> Result<Option<u64>>;

    /// Creates the object at `path` with the given size.
    fn create(&self, path: &Path, size: u64) -> Result<()>;

    /// Describes what `create` would run, for dry runs.
    fn describe_create(&self, path: &Path, size: u64) -> Vec<String>;
}

/// What realization found or did for one backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageRealization {
    /// The backing object exists, with this size.
    Existing { path: PathBuf, size: u64 },
    /// A file backend whose path does not exist. Not created.
    Missing { path: PathBuf },
    /// The object exists but its size differs from the configured one.
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    /// The object was absent and has been created.
    Created { path: PathBuf, size: u64 },
    /// Dry run: the object is absent and would be created.
    WouldCreate { path: PathBuf, size: u64, steps: Vec<String> },
}

/// Brings the storage behind one backend into existence.
///
/// File backends are never created; their existence is only reported. A
/// ZFS volume is created when absent. An existing volume whose size does
/// not match the expected size is reported, not rejected, since volumes
/// may have been resized outside this tool.
pub fn realize_storage(
    tool: &dyn StorageTool,
    backend: &StorageBackend,
    target: &Path,
    expected_size: Option<u64>,
    dry_run: bool,
) -> Result<StorageRealization> {
    match backend {
        StorageBackend::Scsi => Err(Error::Unimplemented {
            feature: "SCSI storage backend",
        }),
        StorageBackend::File { .. } => match tool.size(target)? {
            Some(size) => Ok(StorageRealization::Existing {
                path: target.to_path_buf(),
                size,
            }),
            None => {
                warn!("file backend {} does not exist", target.display());
                Ok(StorageRealization::Missing {
                    path: target.to_path_buf(),
                })
            }
        },
        StorageBackend::ZfsVolume { .. } => match tool.size(target)? {
            Some(actual) => match expected_size {
                Some(expected) if expected != actual => {
                    warn!(
                        "{} is {} bytes but {} bytes are configured; leaving it as is",
                        target.display(),
                        actual,
                        expected
                    );
                    Ok(StorageRealization::SizeMismatch {
                        path: target.to_path_buf(),
                        expected,
                        actual,
                    })
                }
                _ => Ok(StorageRealization::Existing {
                    path: target.to_path_buf(),
                    size: actual,
                }),
            },
            None => {
                let size = expected_size.unwrap_or(0);
                if dry_run {
                    return Ok(StorageRealization::WouldCreate {
                        path: target.to_path_buf(),
                        size,
                        steps: tool.describe_create(target, size),
                    });
                }
                info!("creating {} ({} bytes)", target.display(), size);
                tool.create(target, size)?;
                Ok(StorageRealization::Created {
                    path: target.to_path_buf(),
                    size,
                })
            }
        },
    }
}

/// The host's filesystem, with per-machine directories created as ZFS
/// datasets.
///
/// A directory `/storage/vm/<id>` corresponds to dataset `storage/vm/<id>`,
/// following the default ZFS mountpoint layout.
pub struct HostStorage<'a> {
    zfs: PathBuf,
    executor: &'a dyn ProcessExecutor,
}

impl<'a> HostStorage<'a> {
    pub fn new(zfs: impl Into<PathBuf>, executor: &'a dyn ProcessExecutor) -> HostStorage<'a> {
        HostStorage {
            zfs: zfs.into(),
            executor,
        }
    }

    fn dataset_command(&self, directory: &Path) -> Result<ProcessDescription> {
        let dataset = directory
            .strip_prefix("/")
            .map_err(|_| {
                Error::validation(format!(
                    "{} is not an absolute path",
                    directory.display()
                ))
            })?
            .to_string_lossy()
            .into_owned();
        Ok(ProcessDescription::new(
            &self.zfs,
            vec!["create".into(), "-p".into(), dataset],
        ))
    }
}

impl<'a> StorageTool for HostStorage<'a> {
    fn size(&self, path: &Path) -> Result<Option<u64>> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    fn create(&self, path: &Path, size: u64) -> Result<()> {
        if let Some(directory) = path.parent() {
            if !directory.exists() {
                let command = self.dataset_command(directory)?;
                debug!("{}", command);
                let status = self.executor.spawn_and_wait(&command)?;
                if status != 0 {
                    return Err(Error::ProcessFailure {
                        executable: command.executable().display().to_string(),
                        reason: format!("exited with status {}", status),
                    });
                }
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        file.set_len(size).map_err(|e| Error::io(path, e))?;
        Ok(())
    }

    fn describe_create(&self, path: &Path, size: u64) -> Vec<String> {
        let mut steps = Vec::new();
        if let Some(directory) = path.parent() {
            if !directory.exists() {
                match self.dataset_command(directory) {
                    Ok(command) => steps.push(command.to_string()),
                    Err(e) => steps.push(format!("# {}", e)),
                }
            }
        }
        steps.push(format!("allocate {} bytes at {}", size, path.display()));
        steps
    }
}
