use serialport::{SerialPortInfo, SerialPortType};

use crate::serial_bias_link::{SerialBiasLink, SerialLinkSettings};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiasDevice {
    pub name: String,
    pub port: String,
}

impl BiasDevice {
    pub fn new(name: String, port: String) -> Self {
        Self { name, port }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BiasConnectorError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("Port {port} is not the bias supply you're looking for")]
    InvalidPort { port: String },

    #[error("No bias supply {name} found. Please connect one or specify the port manually")]
    DeviceNotFound { name: String },
}

pub struct BiasConnector;

impl BiasConnector {
    pub const DEFAULT_NAME: &'static str = "BiasSupply";

    /// USB bridges the supply ships with (vendor id, product id).
    const KNOWN_BRIDGES: [(u16, u16); 3] = [(0x0403, 0x6001), (0x0403, 0x6015), (0x10c4, 0xea60)];

    /// Resolve a bias supply and return an unopened link to it.
    pub fn connect(
        name: Option<&str>,
        port: Option<&str>,
        settings: SerialLinkSettings,
    ) -> Result<SerialBiasLink, BiasConnectorError> {
        let port = match port {
            Some(port) => {
                log::debug!("Connecting to bias supply on port {}", port);
                Self::validate_port(name, port)?;
                port.to_string()
            }
            None => Self::device_port(name.unwrap_or(Self::DEFAULT_NAME))?,
        };
        Ok(SerialBiasLink::new(&port, settings))
    }

    fn validate_port(name: Option<&str>, port: &str) -> Result<(), BiasConnectorError> {
        let devices = Self::available_devices(name)?;
        if !devices.iter().any(|d| d.port == port) {
            return Err(BiasConnectorError::InvalidPort {
                port: port.to_string(),
            });
        }
        Ok(())
    }

    fn device_port(name: &str) -> Result<String, BiasConnectorError> {
        log::debug!("Searching for bias supply with name {}", name);
        let filter = (name != Self::DEFAULT_NAME).then_some(name);
        Self::available_devices(filter)?
            .into_iter()
            .next()
            .map(|device| device.port)
            .ok_or_else(|| BiasConnectorError::DeviceNotFound {
                name: name.to_string(),
            })
    }

    /// All connected bias supplies, optionally filtered by USB product name.
    pub fn available_devices(name: Option<&str>) -> Result<Vec<BiasDevice>, BiasConnectorError> {
        Ok(serialport::available_ports()?
            .iter()
            .filter_map(|info| Self::match_port(name, info))
            .collect())
    }

    fn match_port(name: Option<&str>, info: &SerialPortInfo) -> Option<BiasDevice> {
        match &info.port_type {
            SerialPortType::UsbPort(usb) => {
                Self::is_bias_supply(name, usb.vid, usb.pid, usb.product.as_deref()).then(|| {
                    BiasDevice::new(
                        usb.product
                            .clone()
                            .unwrap_or_else(|| Self::DEFAULT_NAME.to_string()),
                        info.port_name.clone(),
                    )
                })
            }
            _ => None,
        }
    }

    fn is_bias_supply(name: Option<&str>, vid: u16, pid: u16, product: Option<&str>) -> bool {
        let known = Self::KNOWN_BRIDGES
            .iter()
            .any(|&(v, p)| v == vid && p == pid);
        known && name.map_or(true, |expected| product == Some(expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_bridges_are_accepted() {
        assert!(BiasConnector::is_bias_supply(None, 0x0403, 0x6001, None));
        assert!(BiasConnector::is_bias_supply(None, 0x10c4, 0xea60, Some("CP2102")));
        assert!(!BiasConnector::is_bias_supply(None, 0x2341, 0x0043, None));
    }

    #[test]
    fn test_name_filter_uses_product() {
        assert!(BiasConnector::is_bias_supply(
            Some("HV-1"),
            0x0403,
            0x6015,
            Some("HV-1")
        ));
        assert!(!BiasConnector::is_bias_supply(
            Some("HV-1"),
            0x0403,
            0x6015,
            Some("HV-2")
        ));
        assert!(!BiasConnector::is_bias_supply(Some("HV-1"), 0x0403, 0x6015, None));
    }

    #[test]
    fn test_available_devices_have_ports() {
        // Depends on attached hardware; enumeration itself may be unavailable.
        if let Ok(devices) = BiasConnector::available_devices(None) {
            for device in devices {
                assert!(!device.name.is_empty());
                assert!(!device.port.is_empty());
            }
        }
    }

    #[test]
    fn test_unknown_port_is_rejected() {
        match BiasConnector::connect(None, Some("/dev/not-a-supply"), SerialLinkSettings::default()) {
            Err(BiasConnectorError::InvalidPort { port }) => assert_eq!(port, "/dev/not-a-supply"),
            Err(BiasConnectorError::SerialPort(_)) => {}
            other => unreachable!("unexpected result: {:?}", other.map(|l| l.port().to_string())),
        }
    }
}
