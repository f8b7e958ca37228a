// Copyright (C) 2020, Oxide Computer Company

//! Boolean runtime toggles and the bhyve switches they enable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The named toggles a machine carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    YieldCpuOnHlt,
    GenerateAcpiTables,
    WireGuestMemory,
    RtcIsUtc,
    GuestApicIsX2Apic,
    DisableMpTableGeneration,
    ForceVirtioPciMsi,
    IncludeGuestMemoryInCoreFiles,
}

impl Flag {
    /// Every flag, in the order their switches appear on the command line.
    pub const ALL: [Flag; 8] = [
        Flag::YieldCpuOnHlt,
        Flag::GenerateAcpiTables,
        Flag::WireGuestMemory,
        Flag::RtcIsUtc,
        Flag::GuestApicIsX2Apic,
        Flag::DisableMpTableGeneration,
        Flag::ForceVirtioPciMsi,
        Flag::IncludeGuestMemoryInCoreFiles,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Flag::YieldCpuOnHlt => "yield-cpu-on-hlt",
            Flag::GenerateAcpiTables => "generate-acpi-tables",
            Flag::WireGuestMemory => "wire-guest-memory",
            Flag::RtcIsUtc => "rtc-is-utc",
            Flag::GuestApicIsX2Apic => "guest-apic-is-x2apic",
            Flag::DisableMpTableGeneration => "disable-mptable-generation",
            Flag::ForceVirtioPciMsi => "force-virtio-pci-msi",
            Flag::IncludeGuestMemoryInCoreFiles => "include-guest-memory-in-core-files",
        }
    }

    /// The bhyve switch that turns this flag on. FreeBSD 13/14 bhyve(8).
    pub fn switch(self) -> &'static str {
        match self {
            Flag::YieldCpuOnHlt => "-H",
            Flag::GenerateAcpiTables => "-A",
            Flag::WireGuestMemory => "-S",
            Flag::RtcIsUtc => "-u",
            Flag::GuestApicIsX2Apic => "-x",
            Flag::DisableMpTableGeneration => "-Y",
            Flag::ForceVirtioPciMsi => "-W",
            Flag::IncludeGuestMemoryInCoreFiles => "-C",
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(name: &str) -> Result<Flag> {
        Flag::ALL
            .iter()
            .copied()
            .find(|flag| flag.name() == name)
            .ok_or_else(|| Error::validation(format!("unknown flag '{}'", name)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Flags {
    pub yield_cpu_on_hlt: bool,
    pub generate_acpi_tables: bool,
    pub wire_guest_memory: bool,
    pub rtc_is_utc: bool,
    pub guest_apic_is_x2apic: bool,
    pub disable_mptable_generation: bool,
    pub force_virtio_pci_msi: bool,
    pub include_guest_memory_in_core_files: bool,
}

impl Default for Flags {
    fn default() -> Flags {
        Flags {
            yield_cpu_on_hlt: true,
            generate_acpi_tables: true,
            wire_guest_memory: false,
            rtc_is_utc: false,
            guest_apic_is_x2apic: false,
            disable_mptable_generation: false,
            force_virtio_pci_msi: false,
            include_guest_memory_in_core_files: false,
        }
    }
}

impl Flags {
    pub fn get(&self, flag: Flag) -> bool {
        match flag {
            Flag::YieldCpuOnHlt => self.yield_cpu_on_hlt,
            Flag::GenerateAcpiTables => self.generate_acpi_tables,
            Flag::WireGuestMemory => self.wire_guest_memory,
            Flag::RtcIsUtc => self.rtc_is_utc,
            Flag::GuestApicIsX2Apic => self.guest_apic_is_x2apic,
            Flag::DisableMpTableGeneration => self.disable_mptable_generation,
            Flag::ForceVirtioPciMsi => self.force_virtio_pci_msi,
            Flag::IncludeGuestMemoryInCoreFiles => self.include_guest_memory_in_core_files,
        }
    }

    fn slot(&mut self, flag: Flag) -> &mut bool {
        match flag {
            Flag::YieldCpuOnHlt => &mut self.yield_cpu_on_hlt,
            Flag::GenerateAcpiTables => &mut self.generate_acpi_tables,
            Flag::WireGuestMemory => &mut self.wire_guest_memory,
            Flag::RtcIsUtc => &mut self.rtc_is_utc,
            Flag::GuestApicIsX2Apic => &mut self.guest_apic_is_x2apic,
            Flag::DisableMpTableGeneration => &mut self.disable_mptable_generation,
            Flag::ForceVirtioPciMsi => &mut self.force_virtio_pci_msi,
            Flag::IncludeGuestMemoryInCoreFiles => &mut self.include_guest_memory_in_core_files,
        }
    }

    /// Applies the overrides; flags not mentioned keep their current value.
    pub fn apply(&self, overrides: &FlagOverrides) -> Flags {
        let mut flags = *self;
        for (flag, value) in &overrides.values {
            *flags.slot(*flag) = *value;
        }
        flags
    }

    /// Switches for every enabled flag, in command-line order.
    pub fn switches(&self) -> Vec<&'static str> {
        Flag::ALL
            .iter()
            .filter(|flag| self.get(**flag))
            .map(|flag| flag.switch())
            .collect()
    }
}

/// A partial set of flag values to lay over an existing `Flags`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlagOverrides {
    values: Vec<(Flag, bool)>,
}

impl FlagOverrides {
    pub fn new() -> FlagOverrides {
        FlagOverrides::default()
    }

    pub fn set(mut self, flag: Flag, value: bool) -> FlagOverrides {
        self.values.retain(|(existing, _)| *existing != flag);
        self.values.push((flag, value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parses `name=true` / `name=false` assignments.
    pub fn parse<'a, I>(assignments: I) -> Result<FlagOverrides>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut overrides = FlagOverrides::new();
        for assignment in assignments {
            let mut parts = assignment.splitn(2, '=');
            let name = parts.next().unwrap_or("");
            let value = parts.next().ok_or_else(|| {
                Error::validation(format!("flag assignment '{}' must be name=value", assignment))
            })?;
            let value: bool = value.parse().map_err(|_| {
                Error::validation(format!("flag value '{}' must be true or false", value))
            })?;
            overrides = overrides.set(name.parse()?, value);
        }
        Ok(overrides)
    }
}
