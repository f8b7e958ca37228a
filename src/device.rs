// Copyright (C) 2020, Oxide Computer Company

//! Guest devices.

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::NetworkBackend;
use crate::slot::DeviceSlot;
use crate::storage::StorageBackend;
use crate::tty::{TtyBackend, TtyName};

// bhyve's framebuffer refuses anything larger
pub const FRAMEBUFFER_WIDTH_MAX: u32 = 1920;
pub const FRAMEBUFFER_HEIGHT_MAX: u32 = 1200;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostBridgeVendor {
    Default,
    Amd,
}

impl FromStr for HostBridgeVendor {
    type Err = Error;

    fn from_str(text: &str) -> Result<HostBridgeVendor> {
        match text {
            "default" => Ok(HostBridgeVendor::Default),
            "amd" => Ok(HostBridgeVendor::Amd),
            other => Err(Error::validation(format!("unknown host bridge vendor '{}'", other))),
        }
    }
}

/// A PCI address on the host, as bhyve's passthru device names it
/// (`bus/slot/function`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostPciAddress {
    pub bus: u32,
    pub slot: u32,
    pub function: u32,
}

impl fmt::Display for HostPciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.bus, self.slot, self.function)
    }
}

impl FromStr for HostPciAddress {
    type Err = Error;

    fn from_str(text: &str) -> Result<HostPciAddress> {
        let invalid = || {
            Error::validation(format!(
                "host slot '{}' must have the form bus/slot/function",
                text
            ))
        };
        let parts: Vec<&str> = text.split('/').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }
        let mut numbers = [0u32; 3];
        for (number, part) in numbers.iter_mut().zip(parts.iter()) {
            *number = part.parse().map_err(|_| invalid())?;
        }
        Ok(HostPciAddress {
            bus: numbers[0],
            slot: numbers[1],
            function: numbers[2],
        })
    }
}

impl TryFrom<String> for HostPciAddress {
    type Error = Error;

    fn try_from(text: String) -> Result<HostPciAddress> {
        text.parse()
    }
}

impl From<HostPciAddress> for String {
    fn from(address: HostPciAddress) -> String {
        address.to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VgaMode {
    On,
    Off,
    Io,
}

impl VgaMode {
    fn as_str(self) -> &'static str {
        match self {
            VgaMode::On => "on",
            VgaMode::Off => "off",
            VgaMode::Io => "io",
        }
    }
}

impl FromStr for VgaMode {
    type Err = Error;

    fn from_str(text: &str) -> Result<VgaMode> {
        match text {
            "on" => Ok(VgaMode::On),
            "off" => Ok(VgaMode::Off),
            "io" => Ok(VgaMode::Io),
            other => Err(Error::validation(format!("unknown vga mode '{}'", other))),
        }
    }
}

/// A VNC-exported framebuffer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Framebuffer {
    pub width: u32,
    pub height: u32,
    pub listen_address: IpAddr,
    pub listen_port: u16,
    pub vga_mode: VgaMode,
    pub wait_for_vnc: bool,
}

impl Framebuffer {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.width > FRAMEBUFFER_WIDTH_MAX {
            return Err(Error::validation(format!(
                "framebuffer width {} must be between 1 and {}",
                self.width, FRAMEBUFFER_WIDTH_MAX
            )));
        }
        if self.height == 0 || self.height > FRAMEBUFFER_HEIGHT_MAX {
            return Err(Error::validation(format!(
                "framebuffer height {} must be between 1 and {}",
                self.height, FRAMEBUFFER_HEIGHT_MAX
            )));
        }
        Ok(())
    }

    fn bhyve_options(&self) -> Vec<String> {
        let listen = match self.listen_address {
            IpAddr::V4(address) => format!("tcp={}:{}", address, self.listen_port),
            IpAddr::V6(address) => format!("tcp=[{}]:{}", address, self.listen_port),
        };
        let mut options = vec![
            listen,
            format!("w={}", self.width),
            format!("h={}", self.height),
            format!("vga={}", self.vga_mode.as_str()),
        ];
        if self.wait_for_vnc {
            options.push("wait".into());
        }
        options
    }
}

/// The LPC bridge and its serial endpoints, at most one per name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<TtyBackend>", into = "Vec<TtyBackend>")]
pub struct Lpc {
    backends: BTreeMap<TtyName, TtyBackend>,
}

impl Lpc {
    pub fn new<I>(backends: I) -> Result<Lpc>
    where
        I: IntoIterator<Item = TtyBackend>,
    {
        let mut map = BTreeMap::new();
        for backend in backends {
            let name = backend.name();
            if map.insert(name, backend).is_some() {
                return Err(Error::duplicate("tty device", name.as_str()));
            }
        }

        match map.get(&TtyName::Bootrom) {
            Some(TtyBackend::File { .. }) | None => (),
            Some(_) => {
                return Err(Error::validation(
                    "bootrom must be backed by a firmware file",
                ))
            }
        }

        // A machine has a single nmdm pair.
        let nmdm: Vec<&str> = map
            .values()
            .filter(|backend| matches!(backend, TtyBackend::Nmdm { .. }))
            .map(|backend| backend.name().as_str())
            .collect();
        if nmdm.len() > 1 {
            return Err(Error::validation(format!(
                "only one tty may use nmdm, not {}",
                nmdm.join(" and ")
            )));
        }
        Ok(Lpc { backends: map })
    }

    pub fn get(&self, name: TtyName) -> Option<&TtyBackend> {
        self.backends.get(&name)
    }

    /// Backends in name order.
    pub fn backends(&self) -> impl Iterator<Item = &TtyBackend> {
        self.backends.values()
    }
}

impl TryFrom<Vec<TtyBackend>> for Lpc {
    type Error = Error;

    fn try_from(backends: Vec<TtyBackend>) -> Result<Lpc> {
        Lpc::new(backends)
    }
}

impl From<Lpc> for Vec<TtyBackend> {
    fn from(lpc: Lpc) -> Vec<TtyBackend> {
        lpc.backends.into_iter().map(|(_, backend)| backend).collect()
    }
}

/// What a device is, and the backend it is wired to on the host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DeviceKind {
    HostBridge { vendor: HostBridgeVendor },
    VirtioNetwork { backend: NetworkBackend },
    VirtioBlock { backend: StorageBackend },
    AhciDisk { backend: StorageBackend },
    AhciOpticalDisk { backend: StorageBackend },
    Lpc { lpc: Lpc },
    Passthru { host_slot: HostPciAddress },
    Framebuffer { framebuffer: Framebuffer },
    XhciUsbTablet,
    E1000Network { backend: NetworkBackend },
}

impl DeviceKind {
    /// Our name for the kind, as used on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            DeviceKind::HostBridge { .. } => "host-bridge",
            DeviceKind::VirtioNetwork { .. } => "virtio-network",
            DeviceKind::VirtioBlock { .. } => "virtio-block",
            DeviceKind::AhciDisk { .. } => "ahci-disk",
            DeviceKind::AhciOpticalDisk { .. } => "ahci-optical-disk",
            DeviceKind::Lpc { .. } => "lpc",
            DeviceKind::Passthru { .. } => "passthru",
            DeviceKind::Framebuffer { .. } => "framebuffer",
            DeviceKind::XhciUsbTablet => "xhci-usb-tablet",
            DeviceKind::E1000Network { .. } => "e1000-network",
        }
    }

    /// bhyve's name for the emulation, the second field of `-s`.
    pub fn external_name(&self) -> &'static str {
        match self {
            DeviceKind::HostBridge {
                vendor: HostBridgeVendor::Default,
            } => "hostbridge",
            DeviceKind::HostBridge {
                vendor: HostBridgeVendor::Amd,
            } => "amd_hostbridge",
            DeviceKind::VirtioNetwork { .. } => "virtio-net",
            DeviceKind::VirtioBlock { .. } => "virtio-blk",
            DeviceKind::AhciDisk { .. } => "ahci-hd",
            DeviceKind::AhciOpticalDisk { .. } => "ahci-cd",
            DeviceKind::Lpc { .. } => "lpc",
            DeviceKind::Passthru { .. } => "passthru",
            DeviceKind::Framebuffer { .. } => "fbuf",
            DeviceKind::XhciUsbTablet => "xhci",
            DeviceKind::E1000Network { .. } => "e1000",
        }
    }

    pub fn storage(&self) -> Option<&StorageBackend> {
        match self {
            DeviceKind::VirtioBlock { backend }
            | DeviceKind::AhciDisk { backend }
            | DeviceKind::AhciOpticalDisk { backend } => Some(backend),
            _ => None,
        }
    }

    pub fn network(&self) -> Option<&NetworkBackend> {
        match self {
            DeviceKind::VirtioNetwork { backend } | DeviceKind::E1000Network { backend } => {
                Some(backend)
            }
            _ => None,
        }
    }

    pub fn lpc(&self) -> Option<&Lpc> {
        match self {
            DeviceKind::Lpc { lpc } => Some(lpc),
            _ => None,
        }
    }

    pub fn is_optical(&self) -> bool {
        matches!(self, DeviceKind::AhciOpticalDisk { .. })
    }

    /// Backend-specific fields that follow the device type in `-s`,
    /// except for storage paths, which depend on the machine.
    pub(crate) fn fixed_options(&self) -> Vec<String> {
        match self {
            DeviceKind::VirtioNetwork { backend } | DeviceKind::E1000Network { backend } => {
                let interface = backend.interface();
                vec![
                    interface.name.clone(),
                    format!("mac={}", interface.guest_mac),
                ]
            }
            DeviceKind::Passthru { host_slot } => vec![host_slot.to_string()],
            DeviceKind::Framebuffer { framebuffer } => framebuffer.bhyve_options(),
            DeviceKind::XhciUsbTablet => vec!["tablet".into()],
            DeviceKind::HostBridge { .. }
            | DeviceKind::Lpc { .. }
            | DeviceKind::VirtioBlock { .. }
            | DeviceKind::AhciDisk { .. }
            | DeviceKind::AhciOpticalDisk { .. } => Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            DeviceKind::VirtioNetwork { backend } | DeviceKind::E1000Network { backend } => {
                backend.validate()
            }
            DeviceKind::Framebuffer { framebuffer } => framebuffer.validate(),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub slot: DeviceSlot,
    #[serde(default)]
    pub comment: String,
    #[serde(flatten)]
    pub kind: DeviceKind,
}

impl Device {
    pub fn new(slot: DeviceSlot, kind: DeviceKind) -> Device {
        Device {
            slot,
            comment: String::new(),
            kind,
        }
    }

    pub fn with_comment(self, comment: impl Into<String>) -> Device {
        Device {
            comment: comment.into(),
            ..self
        }
    }

    pub fn external_name(&self) -> &'static str {
        self.kind.external_name()
    }
}

/// Rejects ZFS volumes that would be stored under the same `disk-<id>`
/// path. Devices are expected in slot order.
pub(crate) fn check_volume_ids<'a, I>(devices: I) -> Result<()>
where
    I: IntoIterator<Item = &'a Device>,
{
    let mut seen: BTreeMap<u32, DeviceSlot> = BTreeMap::new();
    for device in devices {
        if let Some(StorageBackend::ZfsVolume { .. }) = device.kind.storage() {
            let id = device.slot.device_id();
            if let Some(other) = seen.insert(id, device.slot) {
                return Err(Error::validation(format!(
                    "ZFS volumes at {} and {} would share disk-{}",
                    other, device.slot, id
                )));
            }
        }
    }
    Ok(())
}
