// Copyright (C) 2020, Oxide Computer Company

//! Encoding of persisted machine records.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::vm::VirtualMachine;

/// The schema written by this version.
pub const SCHEMA: &str = "urn:bhyve-vm:machine:1";

pub trait MachineCodec {
    fn encode(&self, machine: &VirtualMachine) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<VirtualMachine>;
}

#[derive(Serialize)]
struct Envelope<'a> {
    schema: &'a str,
    machine: &'a VirtualMachine,
}

#[derive(Deserialize)]
struct RawEnvelope {
    schema: String,
    machine: serde_json::Value,
}

/// Pretty-printed JSON inside a versioned envelope.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl MachineCodec for JsonCodec {
    fn encode(&self, machine: &VirtualMachine) -> Result<Vec<u8>> {
        let envelope = Envelope {
            schema: SCHEMA,
            machine,
        };
        let mut bytes = serde_json::to_vec_pretty(&envelope).map_err(|e| Error::Codec {
            reason: e.to_string(),
        })?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<VirtualMachine> {
        let envelope: RawEnvelope = serde_json::from_slice(bytes).map_err(|e| Error::Codec {
            reason: e.to_string(),
        })?;
        if envelope.schema != SCHEMA {
            return Err(Error::Codec {
                reason: format!("unsupported schema '{}'", envelope.schema),
            });
        }
        serde_json::from_value(envelope.machine).map_err(|e| Error::Codec {
            reason: e.to_string(),
        })
    }
}
