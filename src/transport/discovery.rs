//! Serial device discovery by USB vendor/product id.
//!
//! Device paths like `/dev/ttyUSB0` or `COM3` change between reboots and
//! re-plugs, so the gateway never configures a path directly. Instead it
//! enumerates the serial ports the OS knows about and picks the first whose USB
//! descriptor matches the configured `(vendor_id, product_id)` pair.
//!
//! # Usage
//!
//! ```rust,ignore
//! use telemetry_gateway::transport::discovery::{find_device, SystemPorts};
//!
//! let path = find_device(&SystemPorts, 0x1a86, 0x7523)?;
//! ```

use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info};

/// A USB vendor or product id as written in configuration.
///
/// Strings are always parsed as hexadecimal, with or without a `0x` prefix;
/// integers are taken as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UsbId {
    /// Numeric id (`vendor_id = 4660`)
    Numeric(u16),
    /// Hexadecimal id (`vendor_id = "1234"` or `"0x1234"`)
    Hex(String),
}

impl UsbId {
    /// Resolve to the numeric id.
    pub fn value(&self) -> GatewayResult<u16> {
        match self {
            UsbId::Numeric(id) => Ok(*id),
            UsbId::Hex(text) => {
                let trimmed = text.trim();
                let digits = trimmed
                    .strip_prefix("0x")
                    .or_else(|| trimmed.strip_prefix("0X"))
                    .unwrap_or(trimmed);
                u16::from_str_radix(digits, 16)
                    .map_err(|_| GatewayError::InvalidDeviceId(text.clone()))
            }
        }
    }
}

impl From<u16> for UsbId {
    fn from(value: u16) -> Self {
        UsbId::Numeric(value)
    }
}

impl From<&str> for UsbId {
    fn from(value: &str) -> Self {
        UsbId::Hex(value.to_string())
    }
}

/// Information about an available serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// The device path (e.g., `/dev/ttyUSB0`, `COM3`)
    pub device_path: String,
    /// USB vendor id, if the port is a USB device
    pub vid: Option<u16>,
    /// USB product id, if the port is a USB device
    pub pid: Option<u16>,
    /// USB product string, if reported
    pub product: Option<String>,
}

impl PortInfo {
    /// A USB port with the given ids.
    pub fn usb(device_path: impl Into<String>, vid: u16, pid: u16) -> Self {
        Self {
            device_path: device_path.into(),
            vid: Some(vid),
            pid: Some(pid),
            product: None,
        }
    }

    /// Whether this port matches `(vid, pid)` exactly.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == Some(vid) && self.pid == Some(pid)
    }
}

impl fmt::Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => write!(
                f,
                "{} (vid={:04x}, pid={:04x}{})",
                self.device_path,
                vid,
                pid,
                self.product
                    .as_deref()
                    .map(|p| format!(", {p}"))
                    .unwrap_or_default()
            ),
            _ => write!(f, "{} (not a USB device)", self.device_path),
        }
    }
}

/// Source of serial port listings.
pub trait PortEnumerator: Send + Sync {
    /// List the ports currently available.
    fn available_ports(&self) -> GatewayResult<Vec<PortInfo>>;
}

/// Enumerates the ports the operating system reports via `serialport`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl PortEnumerator for SystemPorts {
    fn available_ports(&self) -> GatewayResult<Vec<PortInfo>> {
        let ports = serialport::available_ports()
            .map_err(|e| GatewayError::PortEnumeration(e.to_string()))?;

        Ok(ports
            .into_iter()
            .map(|port| match port.port_type {
                serialport::SerialPortType::UsbPort(usb) => PortInfo {
                    device_path: port.port_name,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    product: usb.product,
                },
                _ => PortInfo {
                    device_path: port.port_name,
                    vid: None,
                    pid: None,
                    product: None,
                },
            })
            .collect())
    }
}

/// A fixed port list, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticPorts(pub Vec<PortInfo>);

impl PortEnumerator for StaticPorts {
    fn available_ports(&self) -> GatewayResult<Vec<PortInfo>> {
        Ok(self.0.clone())
    }
}

/// Return the device path of the first port matching `(vid, pid)`.
pub fn find_device_in(ports: &[PortInfo], vid: u16, pid: u16) -> GatewayResult<String> {
    match ports.iter().find(|port| port.matches(vid, pid)) {
        Some(port) => {
            info!(device = %port.device_path, "Serial device found");
            Ok(port.device_path.clone())
        }
        None => {
            let err = GatewayError::DeviceNotFound { vid, pid };
            error!("{err}");
            Err(err)
        }
    }
}

/// Enumerate ports and return the path of the first `(vid, pid)` match.
pub fn find_device(
    enumerator: &dyn PortEnumerator,
    vendor_id: impl Into<UsbId>,
    product_id: impl Into<UsbId>,
) -> GatewayResult<String> {
    let vid = vendor_id.into().value()?;
    let pid = product_id.into().value()?;
    let ports = enumerator.available_ports()?;
    debug!(count = ports.len(), "Enumerated serial ports");
    find_device_in(&ports, vid, pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports() -> Vec<PortInfo> {
        vec![
            PortInfo {
                device_path: "/dev/ttyS0".into(),
                vid: None,
                pid: None,
                product: None,
            },
            PortInfo::usb("/dev/ttyUSB0", 0x0403, 0x6001),
            PortInfo::usb("/dev/ttyUSB1", 0x1234, 0x5678),
            PortInfo::usb("/dev/ttyUSB2", 0x1234, 0x5678),
        ]
    }

    #[test]
    fn test_usb_id_parsing() {
        assert_eq!(UsbId::from("1234").value().unwrap(), 0x1234);
        assert_eq!(UsbId::from("0x1a86").value().unwrap(), 0x1a86);
        assert_eq!(UsbId::from("0XFFFF").value().unwrap(), 0xffff);
        assert_eq!(UsbId::from(4660).value().unwrap(), 0x1234);
        assert!(matches!(
            UsbId::from("12345").value(),
            Err(GatewayError::InvalidDeviceId(_))
        ));
        assert!(UsbId::from("not-hex").value().is_err());
    }

    #[test]
    fn test_find_device_returns_first_match() {
        let path = find_device_in(&ports(), 0x1234, 0x5678).unwrap();
        assert_eq!(path, "/dev/ttyUSB1");
    }

    #[test]
    fn test_find_device_miss_is_error() {
        let err = find_device_in(&ports(), 0x1234, 0x9999).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::DeviceNotFound {
                vid: 0x1234,
                pid: 0x9999
            }
        ));
    }

    #[test]
    fn test_find_device_accepts_mixed_id_forms() {
        let enumerator = StaticPorts(ports());
        assert_eq!(
            find_device(&enumerator, "0x1234", 0x5678u16).unwrap(),
            "/dev/ttyUSB1"
        );
        assert_eq!(
            find_device(&enumerator, 0x0403u16, "6001").unwrap(),
            "/dev/ttyUSB0"
        );
    }

    #[test]
    fn test_empty_port_list() {
        let enumerator = StaticPorts::default();
        assert!(find_device(&enumerator, 0x1234u16, 0x5678u16).is_err());
    }

    #[test]
    fn test_port_info_display() {
        let port = PortInfo::usb("/dev/ttyUSB1", 0x1234, 0x5678);
        assert_eq!(port.to_string(), "/dev/ttyUSB1 (vid=1234, pid=5678)");
    }
}
