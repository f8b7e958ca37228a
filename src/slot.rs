// Copyright (C) 2020, Oxide Computer Company

//! PCI addresses for guest devices.

use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const BUS_MAX: u32 = 255;
pub const SLOT_MAX: u32 = 31;
pub const FUNCTION_MAX: u32 = 7;

/// A guest PCI address, `bus:slot:function`.
///
/// Slots order by bus, then slot, then function; that order is the one
/// used when compiling a machine's devices onto a bhyve command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceSlot {
    bus: u32,
    slot: u32,
    function: u32,
}

impl DeviceSlot {
    /// The slot the host bridge occupies on every machine.
    pub const HOST_BRIDGE: DeviceSlot = DeviceSlot {
        bus: 0,
        slot: 0,
        function: 0,
    };

    pub fn new(bus: u32, slot: u32, function: u32) -> Result<DeviceSlot> {
        if bus > BUS_MAX {
            return Err(Error::validation(format!(
                "bus {} exceeds max {}",
                bus, BUS_MAX
            )));
        }
        if slot > SLOT_MAX {
            return Err(Error::validation(format!(
                "slot {} exceeds max {}",
                slot, SLOT_MAX
            )));
        }
        if function > FUNCTION_MAX {
            return Err(Error::validation(format!(
                "function {} exceeds max {}",
                function, FUNCTION_MAX
            )));
        }
        Ok(DeviceSlot {
            bus,
            slot,
            function,
        })
    }

    pub fn bus(&self) -> u32 {
        self.bus
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn function(&self) -> u32 {
        self.function
    }

    /// The integer used to name per-device storage, e.g. `disk-3`.
    pub fn device_id(&self) -> u32 {
        self.slot
    }
}

impl fmt::Display for DeviceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.bus, self.slot, self.function)
    }
}

impl FromStr for DeviceSlot {
    type Err = Error;

    fn from_str(text: &str) -> Result<DeviceSlot> {
        let parts: Vec<&str> = text.trim().split(':').collect();
        if parts.len() != 3 {
            return Err(Error::validation(format!(
                "device slot '{}' must have the form bus:slot:function",
                text
            )));
        }

        let mut numbers = [0u32; 3];
        for (number, part) in numbers.iter_mut().zip(parts.iter()) {
            *number = part.parse().map_err(|_| {
                Error::validation(format!(
                    "device slot '{}' contains a non-numeric component '{}'",
                    text, part
                ))
            })?;
        }
        DeviceSlot::new(numbers[0], numbers[1], numbers[2])
    }
}

impl TryFrom<String> for DeviceSlot {
    type Error = Error;

    fn try_from(text: String) -> Result<DeviceSlot> {
        text.parse()
    }
}

impl From<DeviceSlot> for String {
    fn from(slot: DeviceSlot) -> String {
        slot.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let slot: DeviceSlot = "0:31:0".parse().expect("valid slot");
        assert_eq!(slot.bus(), 0);
        assert_eq!(slot.slot(), 31);
        assert_eq!(slot.function(), 0);
        assert_eq!(slot.to_string(), "0:31:0");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("0:1".parse::<DeviceSlot>().is_err());
        assert!("0:x:0".parse::<DeviceSlot>().is_err());
        assert!("0:32:0".parse::<DeviceSlot>().is_err());
        assert!("0:1:8".parse::<DeviceSlot>().is_err());
        assert!("-1:1:0".parse::<DeviceSlot>().is_err());
    }

    #[test]
    fn test_ordering_is_bus_slot_function() {
        let mut slots = vec![
            DeviceSlot::new(1, 0, 0).unwrap(),
            DeviceSlot::new(0, 2, 1).unwrap(),
            DeviceSlot::new(0, 2, 0).unwrap(),
            DeviceSlot::new(0, 10, 0).unwrap(),
        ];
        slots.sort();
        let rendered: Vec<String> = slots.iter().map(|s| s.to_string()).collect();
        assert_eq!(rendered, vec!["0:2:0", "0:2:1", "0:10:0", "1:0:0"]);
    }

    #[test]
    fn test_serializes_as_string() {
        let slot = DeviceSlot::new(0, 4, 0).unwrap();
        let json = serde_json::to_string(&slot).unwrap();
        assert_eq!(json, "\"0:4:0\"");
        let back: DeviceSlot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, slot);
    }
}
