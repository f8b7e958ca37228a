// Copyright (C) 2020, Oxide Computer Company

//! Error types shared by every machine operation.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::slot::DeviceSlot;

/// Result type for machine operations
pub type Result<T> = std::result::Result<T, Error>;

/// A device slot that a boot configuration still refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotReference {
    pub slot: DeviceSlot,
    pub configuration: String,
}

impl fmt::Display for SlotReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (boot configuration '{}')", self.slot, self.configuration)
    }
}

/// Errors that can occur while defining, validating, realizing or
/// launching a machine.
///
/// None of these are transient; callers report them and stop.
#[derive(Error, Debug)]
pub enum Error {
    /// A machine, device or boot configuration was not found
    #[error("nonexistent {kind}: {}", names.join(", "))]
    Nonexistent { kind: &'static str, names: Vec<String> },

    /// A slot or name is already in use
    #[error("duplicate {kind}: {name}")]
    Duplicate { kind: &'static str, name: String },

    /// Every auto-allocatable slot on bus 0 is occupied
    #[error("no free device slots remain on bus 0")]
    DeviceSlotsExhausted,

    /// A device is still named by one or more boot configurations
    #[error("device referenced by boot configuration: {}", join(references))]
    ReferencedByBootConfiguration { references: Vec<SlotReference> },

    /// The machine lacks exactly one attachable console
    #[error("machine has no single attachable console ({candidates} console-capable devices)")]
    NoSingleConsole { candidates: usize },

    /// Malformed input or an inconsistent machine description
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    /// A modelled feature without an implementation
    #[error("unimplemented: {feature}")]
    Unimplemented { feature: &'static str },

    /// An external tool could not be started or exited unsuccessfully
    #[error("process {executable} failed: {reason}")]
    ProcessFailure { executable: String, reason: String },

    /// Filesystem access failed
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted machine record could not be encoded or decoded
    #[error("machine record: {reason}")]
    Codec { reason: String },
}

impl Error {
    pub fn validation(reason: impl Into<String>) -> Error {
        Error::Validation {
            reason: reason.into(),
        }
    }

    pub fn nonexistent(kind: &'static str, name: impl Into<String>) -> Error {
        Error::Nonexistent {
            kind,
            names: vec![name.into()],
        }
    }

    pub fn duplicate(kind: &'static str, name: impl Into<String>) -> Error {
        Error::Duplicate {
            kind,
            name: name.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Error {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
