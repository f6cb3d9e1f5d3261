//! Serial device discovery.
//!
//! Enumerates the serial ports known to the OS and picks the adapter by an
//! explicit path, by USB vendor/product id, or - with no filter at all - the
//! first USB serial device found. Discovery never touches an already opened
//! descriptor, so it is safe to call while the supervisor is doing I/O.

use serialport::{available_ports, SerialPortType};

/// What the operator told us about the adapter.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub device: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// Returns the path of the first matching serial device, or `None`.
pub fn find_device(filter: &DeviceFilter) -> Option<String> {
    let ports = match available_ports() {
        Ok(ports) => ports,
        Err(err) => {
            log::warn!("serial port enumeration failed: {}", err);
            return None;
        }
    };

    if let Some(path) = &filter.device {
        return ports
            .iter()
            .find(|p| &p.port_name == path)
            .map(|p| p.port_name.clone());
    }

    for port in &ports {
        if let SerialPortType::UsbPort(usb) = &port.port_type {
            if usb_matches(filter, usb.vid, usb.pid) {
                log::info!(
                    "found adapter {} (VID 0x{:04x}, PID 0x{:04x})",
                    port.port_name,
                    usb.vid,
                    usb.pid
                );
                return Some(port.port_name.clone());
            }
        }
    }
    None
}

/// VID and PID are checked independently; an unset half of the filter
/// matches anything.
fn usb_matches(filter: &DeviceFilter, vid: u16, pid: u16) -> bool {
    if let Some(want) = filter.vid {
        if vid != want {
            return false;
        }
    }
    if let Some(want) = filter.pid {
        if pid != want {
            return false;
        }
    }
    true
}
