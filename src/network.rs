// Copyright (C) 2020, Oxide Computer Company

//! Host network interfaces backing guest NICs.

use std::convert::TryFrom;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::command::ProcessDescription;
use crate::error::{Error, Result};

// IFNAMSIZ minus the terminating NUL
const INTERFACE_NAME_LENGTH_MAX: usize = 15;
const GROUP_NAME_LENGTH_MAX: usize = 15;

/// An Ethernet address, written as six colon-separated hex octets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> MacAddress {
        MacAddress(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(text: &str) -> Result<MacAddress> {
        let invalid = || Error::validation(format!("'{}' is not a valid MAC address", text));
        let parts: Vec<&str> = text.split(':').collect();
        if parts.len() != 6 {
            return Err(invalid());
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts.iter()) {
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(MacAddress(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = Error;

    fn try_from(text: String) -> Result<MacAddress> {
        text.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> String {
        mac.to_string()
    }
}

/// A host interface, its addresses and the interface groups it joins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub host_mac: MacAddress,
    pub guest_mac: MacAddress,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NetworkBackend {
    Tap(NetworkInterface),
    VmNet(NetworkInterface),
}

impl NetworkBackend {
    pub fn tap(interface: NetworkInterface) -> Result<NetworkBackend> {
        check_interface("tap", &interface)?;
        Ok(NetworkBackend::Tap(interface))
    }

    pub fn vmnet(interface: NetworkInterface) -> Result<NetworkBackend> {
        check_interface("vmnet", &interface)?;
        Ok(NetworkBackend::VmNet(interface))
    }

    pub fn interface(&self) -> &NetworkInterface {
        match self {
            NetworkBackend::Tap(interface) | NetworkBackend::VmNet(interface) => interface,
        }
    }

    /// Re-checks the naming rules; decoded records go through this.
    pub fn validate(&self) -> Result<()> {
        match self {
            NetworkBackend::Tap(interface) => check_interface("tap", interface),
            NetworkBackend::VmNet(interface) => check_interface("vmnet", interface),
        }
    }

    /// The character device the kernel creates for this interface.
    pub fn device_node(&self) -> PathBuf {
        Path::new("/dev").join(&self.interface().name)
    }

    /// The `ifconfig` invocations that bring the host interface into the
    /// configured state. `exists` says whether the interface is already
    /// present.
    pub fn realization_commands(&self, ifconfig: &Path, exists: bool) -> Vec<ProcessDescription> {
        let interface = self.interface();
        let mut commands = Vec::new();
        if !exists {
            commands.push(ProcessDescription::new(ifconfig, vec![interface.name.clone(), "create".into()]));
        }
        commands.push(ProcessDescription::new(
            ifconfig,
            vec![
                interface.name.clone(),
                "ether".into(),
                interface.host_mac.to_string(),
            ],
        ));
        for group in &interface.groups {
            commands.push(ProcessDescription::new(
                ifconfig,
                vec![interface.name.clone(), "group".into(), group.clone()],
            ));
        }
        commands
    }
}

impl FromStr for NetworkBackend {
    type Err = Error;

    /// `tap;<name>;<host-mac>;<guest-mac>[;<group>,...]`, or the same with
    /// `vmnet` as the first field.
    fn from_str(text: &str) -> Result<NetworkBackend> {
        let fields: Vec<&str> = text.split(';').collect();
        if fields.len() < 4 || fields.len() > 5 {
            return Err(Error::validation(format!(
                "network backend '{}' must have the form kind;name;host-mac;guest-mac[;groups]",
                text
            )));
        }
        let groups = match fields.get(4) {
            Some(list) if !list.is_empty() => list.split(',').map(str::to_string).collect(),
            _ => Vec::new(),
        };
        let interface = NetworkInterface {
            name: fields[1].to_string(),
            host_mac: fields[2].parse()?,
            guest_mac: fields[3].parse()?,
            groups,
        };
        match fields[0] {
            "tap" => NetworkBackend::tap(interface),
            "vmnet" => NetworkBackend::vmnet(interface),
            other => Err(Error::validation(format!(
                "unknown network backend kind '{}'",
                other
            ))),
        }
    }
}

fn check_interface(prefix: &str, interface: &NetworkInterface) -> Result<()> {
    let name = &interface.name;
    let unit = name.strip_prefix(prefix).unwrap_or("");
    if !name.starts_with(prefix)
        || unit.is_empty()
        || !unit.chars().all(|c| c.is_ascii_digit())
        || name.len() > INTERFACE_NAME_LENGTH_MAX
    {
        return Err(Error::validation(format!(
            "interface name '{}' must be {} followed by a unit number",
            name, prefix
        )));
    }
    for group in &interface.groups {
        check_group(group)?;
    }
    Ok(())
}

// ifconfig(8) rejects group names that end in a digit.
fn check_group(group: &str) -> Result<()> {
    let valid = !group.is_empty()
        && group.len() <= GROUP_NAME_LENGTH_MAX
        && group.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !group.ends_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "interface group name '{}' is not valid",
            group
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_roundtrip_lowercases() {
        let mac: MacAddress = "58:9C:FC:00:00:01".parse().unwrap();
        assert_eq!(mac.to_string(), "58:9c:fc:00:00:01");
    }

    #[test]
    fn test_mac_rejects_malformed() {
        assert!("58:9c:fc:00:00".parse::<MacAddress>().is_err());
        assert!("58:9c:fc:00:00:zz".parse::<MacAddress>().is_err());
        assert!("589:c:fc:00:00:01".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_parse_tap() {
        let backend: NetworkBackend = "tap;tap0;58:9c:fc:00:00:01;58:9c:fc:00:00:02;vms,lan"
            .parse()
            .unwrap();
        match &backend {
            NetworkBackend::Tap(interface) => {
                assert_eq!(interface.name, "tap0");
                assert_eq!(interface.groups, vec!["vms", "lan"]);
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn test_name_must_match_kind() {
        assert!("tap;vmnet0;58:9c:fc:00:00:01;58:9c:fc:00:00:02"
            .parse::<NetworkBackend>()
            .is_err());
        assert!("vmnet;vmnet;58:9c:fc:00:00:01;58:9c:fc:00:00:02"
            .parse::<NetworkBackend>()
            .is_err());
        assert!("vmnet;vmnet3;58:9c:fc:00:00:01;58:9c:fc:00:00:02"
            .parse::<NetworkBackend>()
            .is_ok());
    }

    #[test]
    fn test_group_may_not_end_in_digit() {
        assert!("tap;tap0;58:9c:fc:00:00:01;58:9c:fc:00:00:02;vlan2"
            .parse::<NetworkBackend>()
            .is_err());
    }

    #[test]
    fn test_realization_commands() {
        let backend: NetworkBackend = "tap;tap4;58:9c:fc:00:00:01;58:9c:fc:00:00:02;vms"
            .parse()
            .unwrap();
        let commands: Vec<String> = backend
            .realization_commands(Path::new("/sbin/ifconfig"), false)
            .iter()
            .map(|c| c.to_string())
            .collect();
        assert_eq!(
            commands,
            vec![
                "/sbin/ifconfig tap4 create",
                "/sbin/ifconfig tap4 ether 58:9c:fc:00:00:01",
                "/sbin/ifconfig tap4 group vms",
            ]
        );
        assert_eq!(
            backend.realization_commands(Path::new("/sbin/ifconfig"), true).len(),
            2
        );
    }
}
