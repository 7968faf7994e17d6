//! Serial device discovery.
//!
//! Enumerates attached serial ports and selects the one matching the USB
//! vendor id reserved for this device family.  The selection logic is
//! pure and testable; the system enumeration is a thin wrapper.

use crate::repl::transport::TransportError;
use serde::{Deserialize, Serialize};
use upylink_core::{LinkError, LinkResult};

/// USB vendor id of the device family, in the textual form the port
/// enumeration reports.  Matched case-insensitively.
pub const DEVICE_VENDOR_ID: &str = "0d28";

/// Metadata about one enumerated serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCandidate {
    /// Device path (e.g. `/dev/ttyACM0`, `COM4`).
    pub path: String,
    /// USB vendor id as a hex string, if the port is a USB device.
    pub vendor_id: Option<String>,
    /// USB product id as a hex string.
    pub product_id: Option<String>,
    /// USB serial number, if reported.
    pub serial_number: Option<String>,
}

/// Whether a candidate belongs to the target device family.
pub fn is_target_device(candidate: &DeviceCandidate) -> bool {
    candidate
        .vendor_id
        .as_deref()
        .map(|vid| vid.eq_ignore_ascii_case(DEVICE_VENDOR_ID))
        .unwrap_or(false)
}

/// Select the single attached device from an enumeration result.
///
/// Fails with `NoDeviceFound` when nothing matches and with
/// `AmbiguousDevice` when more than one does; there is no heuristic
/// disambiguation, the extra device has to be removed.
pub fn select_device(candidates: &[DeviceCandidate]) -> LinkResult<DeviceCandidate> {
    let mut matches = candidates.iter().filter(|c| is_target_device(c));
    match (matches.next(), matches.next()) {
        (Some(only), None) => Ok(only.clone()),
        (Some(_), Some(_)) => Err(LinkError::AmbiguousDevice),
        (None, _) => Err(LinkError::NoDeviceFound),
    }
}

/// Enumerate serial ports via the system back-end.
pub fn enumerate_system_ports() -> Result<Vec<DeviceCandidate>, TransportError> {
    let ports = serialport::available_ports()
        .map_err(|e| TransportError::new(format!("port enumeration failed: {e}")))?;
    Ok(ports
        .into_iter()
        .map(|port| {
            let (vendor_id, product_id, serial_number) = match port.port_type {
                serialport::SerialPortType::UsbPort(usb) => (
                    Some(format!("{:04x}", usb.vid)),
                    Some(format!("{:04x}", usb.pid)),
                    usb.serial_number,
                ),
                _ => (None, None, None),
            };
            DeviceCandidate {
                path: port.port_name,
                vendor_id,
                product_id,
                serial_number,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(path: &str, vid: Option<&str>) -> DeviceCandidate {
        DeviceCandidate {
            path: path.to_string(),
            vendor_id: vid.map(|v| v.to_string()),
            product_id: None,
            serial_number: None,
        }
    }

    #[test]
    fn test_select_single_device() {
        let candidates = vec![
            candidate("/dev/ttyS0", None),
            candidate("/dev/ttyACM0", Some("0d28")),
            candidate("/dev/ttyUSB0", Some("0403")),
        ];
        let chosen = select_device(&candidates).unwrap();
        assert_eq!(chosen.path, "/dev/ttyACM0");
    }

    #[test]
    fn test_select_is_case_insensitive() {
        let candidates = vec![candidate("COM7", Some("0D28"))];
        assert!(select_device(&candidates).is_ok());
    }

    #[test]
    fn test_zero_devices_fails() {
        let candidates = vec![
            candidate("/dev/ttyS0", None),
            candidate("/dev/ttyUSB0", Some("1a86")),
        ];
        assert_eq!(
            select_device(&candidates).unwrap_err(),
            LinkError::NoDeviceFound
        );
    }

    #[test]
    fn test_two_devices_fails() {
        let candidates = vec![
            candidate("/dev/ttyACM0", Some("0d28")),
            candidate("/dev/ttyACM1", Some("0d28")),
        ];
        assert_eq!(
            select_device(&candidates).unwrap_err(),
            LinkError::AmbiguousDevice
        );
    }

    #[test]
    fn test_empty_list_fails() {
        assert_eq!(select_device(&[]).unwrap_err(), LinkError::NoDeviceFound);
    }

    #[test]
    fn test_candidate_serialises_camel_case() {
        let c = candidate("/dev/ttyACM0", Some("0d28"));
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"vendorId\""));
        assert!(json.contains("\"serialNumber\""));
    }
}
