//! Serial port discovery.
//!
//! Enumeration is a read-only OS query. A host that cannot enumerate ports
//! yields an empty list so the operator can still type a device path by hand.

use serialport::SerialPortType;

/// A discovered serial port with a human-readable description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEntry {
    pub port_name: String,
    pub description: String,
}

/// Device paths of all serial ports currently present, sorted and deduplicated.
pub fn list_available_ports() -> Vec<String> {
    let mut names: Vec<String> = list_port_details()
        .into_iter()
        .map(|p| p.port_name)
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Like [`list_available_ports`] but keeps what the OS reports about each port.
pub fn list_port_details() -> Vec<PortEntry> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            log::warn!(target: "ports", "Serial port enumeration unavailable: {e}");
            return Vec::new();
        }
    };

    let mut out: Vec<PortEntry> = ports
        .into_iter()
        .map(|p| PortEntry {
            description: describe(&p.port_type),
            port_name: p.port_name,
        })
        .collect();
    out.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    out.dedup_by(|a, b| a.port_name == b.port_name);
    log::debug!(target: "ports", "Discovered {} serial port(s)", out.len());
    out
}

fn describe(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(info) => {
            let parts: Vec<&str> = [info.manufacturer.as_deref(), info.product.as_deref()]
                .into_iter()
                .flatten()
                .collect();
            if parts.is_empty() {
                format!("USB serial {:04x}:{:04x}", info.vid, info.pid)
            } else {
                parts.join(" ")
            }
        }
        SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        SerialPortType::PciPort => "PCI".to_string(),
        SerialPortType::Unknown => "unknown".to_string(),
    }
}

/// Picks the device to use after a refresh.
///
/// Keeps `current` when it is still present, or when nothing was found (a
/// manually entered path must survive a refresh on hosts without
/// enumeration). Otherwise selects the first discovered port.
pub fn choose_device(current: &str, ports: &[String]) -> String {
    if ports.is_empty() || ports.iter().any(|p| p == current) {
        return current.to_string();
    }
    ports[0].clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn listing_is_repeatable() {
        // Whatever the host has, two back-to-back queries agree.
        assert_eq!(list_available_ports(), list_available_ports());
    }

    #[test]
    fn choose_device_keeps_listed_current() {
        let ports = names(&["/dev/ttyACM0", "/dev/ttyUSB0"]);
        assert_eq!(choose_device("/dev/ttyUSB0", &ports), "/dev/ttyUSB0");
    }

    #[test]
    fn choose_device_replaces_missing_current_with_first() {
        let ports = names(&["/dev/ttyACM0", "/dev/ttyUSB1"]);
        assert_eq!(choose_device("/dev/ttyUSB0", &ports), "/dev/ttyACM0");
    }

    #[test]
    fn choose_device_keeps_manual_path_when_nothing_found() {
        assert_eq!(choose_device("/dev/rotor", &[]), "/dev/rotor");
    }

    #[test]
    fn describe_usb_prefers_manufacturer_and_product() {
        let info = UsbPortInfo {
            vid: 0x0403,
            pid: 0x6001,
            serial_number: None,
            manufacturer: Some("FTDI".into()),
            product: Some("FT232R".into()),
        };
        assert_eq!(describe(&SerialPortType::UsbPort(info)), "FTDI FT232R");
    }

    #[test]
    fn describe_usb_falls_back_to_ids() {
        let info = UsbPortInfo {
            vid: 0x0403,
            pid: 0x6001,
            serial_number: None,
            manufacturer: None,
            product: None,
        };
        assert_eq!(describe(&SerialPortType::UsbPort(info)), "USB serial 0403:6001");
    }
}
