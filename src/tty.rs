// Copyright (C) 2020, Oxide Computer Company

//! Serial endpoints attached to the LPC bridge.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::console::nmdm_paths;
use crate::error::{Error, Result};

/// The LPC device names a TTY backend can be attached under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtyName {
    Com1,
    Com2,
    Bootrom,
}

impl TtyName {
    pub fn as_str(self) -> &'static str {
        match self {
            TtyName::Com1 => "com1",
            TtyName::Com2 => "com2",
            TtyName::Bootrom => "bootrom",
        }
    }
}

impl fmt::Display for TtyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TtyName {
    type Err = Error;

    fn from_str(text: &str) -> Result<TtyName> {
        match text {
            "com1" => Ok(TtyName::Com1),
            "com2" => Ok(TtyName::Com2),
            "bootrom" => Ok(TtyName::Bootrom),
            other => Err(Error::validation(format!(
                "'{}' is not one of com1, com2, bootrom",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TtyBackend {
    /// Output to a host file or device node.
    File { name: TtyName, path: PathBuf },
    /// A null-modem pair; the guest side is handed to bhyve.
    Nmdm { name: TtyName },
    /// bhyve's own standard input and output.
    Stdio { name: TtyName },
}

impl TtyBackend {
    pub fn name(&self) -> TtyName {
        match self {
            TtyBackend::File { name, .. } | TtyBackend::Nmdm { name } | TtyBackend::Stdio { name } => {
                *name
            }
        }
    }

    /// Whether an operator can attach to this endpoint as a console.
    pub fn is_console(&self) -> bool {
        match self {
            TtyBackend::Nmdm { .. } | TtyBackend::Stdio { .. } => true,
            TtyBackend::File { .. } => false,
        }
    }

    /// The `-l` value bhyve expects for this backend.
    pub fn lpc_option(&self, machine_id: &Uuid) -> String {
        match self {
            TtyBackend::File { name, path } => format!("{},{}", name, path.display()),
            TtyBackend::Nmdm { name } => {
                format!("{},{}", name, nmdm_paths(machine_id).guest.display())
            }
            TtyBackend::Stdio { name } => format!("{},stdio", name),
        }
    }
}

impl FromStr for TtyBackend {
    type Err = Error;

    /// `file;<name>;<path>`, `nmdm;<name>` or `stdio;<name>`.
    fn from_str(text: &str) -> Result<TtyBackend> {
        let fields: Vec<&str> = text.split(';').collect();
        let name = fields
            .get(1)
            .ok_or_else(|| Error::validation(format!("tty backend '{}' has no device name", text)))?
            .parse()?;
        match (fields[0], fields.len()) {
            ("file", 3) if !fields[2].is_empty() => Ok(TtyBackend::File {
                name,
                path: PathBuf::from(fields[2]),
            }),
            ("nmdm", 2) => Ok(TtyBackend::Nmdm { name }),
            ("stdio", 2) => Ok(TtyBackend::Stdio { name }),
            _ => Err(Error::validation(format!(
                "tty backend '{}' must be file;<name>;<path>, nmdm;<name> or stdio;<name>",
                text
            ))),
        }
    }
}
