// Copyright (C) 2020, Oxide Computer Company

//! Virtual CPU topology and guest memory size.

use std::collections::BTreeSet;
use std::convert::TryFrom;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MB_PER_GB: u64 = 1024;

/// Binds one guest vCPU to one host CPU. Ordered by host CPU, then guest CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CpuPin {
    pub host_cpu: u32,
    pub guest_cpu: u32,
}

/// Sockets, cores per socket and threads per core.
///
/// The total vCPU count is always the product of the three; a topology
/// that disagrees with its own count cannot be constructed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CpuTopologyRecord", into = "CpuTopologyRecord")]
pub struct CpuTopology {
    sockets: u32,
    cores: u32,
    threads: u32,
    cpus: u32,
    pins: BTreeSet<CpuPin>,
}

impl CpuTopology {
    /// Builds a topology. `cpus` defaults to `sockets * cores * threads`
    /// and is rejected if given and different.
    pub fn new(sockets: u32, cores: u32, threads: u32, cpus: Option<u32>) -> Result<CpuTopology> {
        if sockets == 0 || cores == 0 || threads == 0 {
            return Err(Error::validation(format!(
                "sockets ({}), cores ({}) and threads ({}) must all be at least 1",
                sockets, cores, threads
            )));
        }
        let product = sockets
            .checked_mul(cores)
            .and_then(|n| n.checked_mul(threads))
            .ok_or_else(|| Error::validation("cpu topology overflows"))?;

        let cpus = cpus.unwrap_or(product);
        if cpus != product {
            return Err(Error::validation(format!(
                "cpus ({}) must equal sockets ({}) * cores ({}) * threads ({})",
                cpus, sockets, cores, threads
            )));
        }

        Ok(CpuTopology {
            sockets,
            cores,
            threads,
            cpus,
            pins: BTreeSet::new(),
        })
    }

    /// A single socket with `count` cores of one thread each.
    pub fn with_cpu_count(count: u32) -> Result<CpuTopology> {
        CpuTopology::new(1, count, 1, None)
    }

    /// Returns a copy of this topology with the given pins replacing any
    /// existing ones.
    pub fn with_pins<I>(&self, pins: I) -> Result<CpuTopology>
    where
        I: IntoIterator<Item = CpuPin>,
    {
        let pins: BTreeSet<CpuPin> = pins.into_iter().collect();
        for pin in &pins {
            if pin.guest_cpu >= self.cpus {
                return Err(Error::validation(format!(
                    "pinned guest cpu {} is outside the {} configured cpus",
                    pin.guest_cpu, self.cpus
                )));
            }
        }
        Ok(CpuTopology {
            pins,
            ..self.clone()
        })
    }

    pub fn sockets(&self) -> u32 {
        self.sockets
    }

    pub fn cores(&self) -> u32 {
        self.cores
    }

    pub fn threads(&self) -> u32 {
        self.threads
    }

    pub fn cpus(&self) -> u32 {
        self.cpus
    }

    pub fn pins(&self) -> impl Iterator<Item = &CpuPin> {
        self.pins.iter()
    }
}

impl Default for CpuTopology {
    fn default() -> CpuTopology {
        CpuTopology {
            sockets: 1,
            cores: 1,
            threads: 1,
            cpus: 1,
            pins: BTreeSet::new(),
        }
    }
}

// Serialized form; decoding goes back through `CpuTopology::new` so a
// hand-edited record cannot smuggle in an inconsistent count.
#[derive(Serialize, Deserialize)]
struct CpuTopologyRecord {
    sockets: u32,
    cores: u32,
    threads: u32,
    cpus: u32,
    #[serde(default)]
    pins: Vec<CpuPin>,
}

impl TryFrom<CpuTopologyRecord> for CpuTopology {
    type Error = Error;

    fn try_from(record: CpuTopologyRecord) -> Result<CpuTopology> {
        CpuTopology::new(record.sockets, record.cores, record.threads, Some(record.cpus))?
            .with_pins(record.pins)
    }
}

impl From<CpuTopology> for CpuTopologyRecord {
    fn from(topology: CpuTopology) -> CpuTopologyRecord {
        CpuTopologyRecord {
            sockets: topology.sockets,
            cores: topology.cores,
            threads: topology.threads,
            cpus: topology.cpus,
            pins: topology.pins.into_iter().collect(),
        }
    }
}

/// Guest memory, expressed as whole gigabytes plus megabytes.
///
/// The combined size always fits in a `u64` count of megabytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MemoryRecord", into = "MemoryRecord")]
pub struct Memory {
    gigabytes: u64,
    megabytes: u64,
}

impl Memory {
    pub fn new(gigabytes: u64, megabytes: u64) -> Result<Memory> {
        gigabytes
            .checked_mul(MB_PER_GB)
            .and_then(|total| total.checked_add(megabytes))
            .ok_or_else(|| {
                Error::validation(format!(
                    "memory of {}G + {}M does not fit in 64 bits of megabytes",
                    gigabytes, megabytes
                ))
            })?;
        Ok(Memory {
            gigabytes,
            megabytes,
        })
    }

    pub fn gigabytes(&self) -> u64 {
        self.gigabytes
    }

    pub fn megabytes(&self) -> u64 {
        self.megabytes
    }

    /// Combined size in megabytes.
    pub fn total_megabytes(&self) -> u64 {
        self.gigabytes * MB_PER_GB + self.megabytes
    }
}

#[derive(Serialize, Deserialize)]
struct MemoryRecord {
    gigabytes: u64,
    megabytes: u64,
}

impl TryFrom<MemoryRecord> for Memory {
    type Error = Error;

    fn try_from(record: MemoryRecord) -> Result<Memory> {
        Memory::new(record.gigabytes, record.megabytes)
    }
}

impl From<Memory> for MemoryRecord {
    fn from(memory: Memory) -> MemoryRecord {
        MemoryRecord {
            gigabytes: memory.gigabytes,
            megabytes: memory.megabytes,
        }
    }
}
