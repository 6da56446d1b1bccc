use crate::bulk_transport;
use crate::oscilloscope::{Oscilloscope, ScopeError};
use crate::rpc_client::RpcClient;
use crate::scpi_link::LinkConfig;
use crate::transport::{DeviceDescriptor, TransportError, TransportKind};
use std::time::Duration;

/// How long to listen for VXI-11 replies when no address is given.
pub const DEFAULT_DISCOVERY_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error("Cannot interpret '{target}' as an instrument address")]
    InvalidTarget { target: String },

    #[error("No oscilloscope found. Connect one over USB or give its network address")]
    NoDevices,
}

/// Turn a user supplied address into a descriptor.
///
/// Accepted forms: `usb:<bus>:<address>`, an absolute device node path,
/// `tcp://host[:port]`, `vxi11://host` and a bare `host`, which means VXI-11.
pub fn parse_target(target: &str) -> Result<DeviceDescriptor, ConnectorError> {
    let target = target.trim();
    let invalid = || ConnectorError::InvalidTarget {
        target: target.to_string(),
    };

    if target.starts_with("usb:") || target.starts_with('/') {
        return Ok(DeviceDescriptor::new(target, target, TransportKind::UsbTmc));
    }
    let (kind, rest) = if let Some(rest) = target.strip_prefix("tcp://") {
        (TransportKind::RawTcp, rest)
    } else if let Some(rest) = target.strip_prefix("vxi11://") {
        (TransportKind::Vxi11, rest)
    } else {
        (TransportKind::Vxi11, target)
    };

    if rest.is_empty() || rest.contains('/') || rest.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    Ok(DeviceDescriptor::new(rest, rest, kind))
}

pub struct ScopeConnector;

impl ScopeConnector {
    /// Every instrument reachable over USBTMC or answering a VXI-11
    /// broadcast within `discovery_window`. A transport that cannot be
    /// scanned contributes nothing.
    pub fn available_devices(discovery_window: Duration) -> Vec<DeviceDescriptor> {
        Self::merge_scans(
            bulk_transport::enumerate_usbtmc(),
            RpcClient::discover(discovery_window),
        )
    }

    fn merge_scans(
        usb: Result<Vec<DeviceDescriptor>, TransportError>,
        network: Result<Vec<DeviceDescriptor>, TransportError>,
    ) -> Vec<DeviceDescriptor> {
        let mut devices = match usb {
            Ok(devices) => devices,
            Err(e) => {
                log::debug!("USB enumeration failed: {}", e);
                Vec::new()
            }
        };

        match network {
            Ok(found) => devices.extend(found),
            Err(e) => log::debug!("VXI-11 discovery failed: {}", e),
        }

        log::debug!("{} instrument(s) available", devices.len());
        devices
    }

    /// Connect to `target`, or to the first instrument that identifies as a
    /// supported scope when no target is given.
    pub fn connect(target: Option<&str>, config: LinkConfig) -> Result<Oscilloscope, ConnectorError> {
        if let Some(target) = target {
            log::debug!("Connecting to {}", target);
            let descriptor = parse_target(target)?;
            return Ok(Oscilloscope::open(&descriptor, config)?);
        }

        for descriptor in Self::available_devices(DEFAULT_DISCOVERY_WINDOW) {
            match Oscilloscope::open(&descriptor, config.clone()) {
                Ok(scope) => return Ok(scope),
                Err(e) => log::debug!("Skipping {}: {}", descriptor, e),
            }
        }
        Err(ConnectorError::NoDevices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        let usb = parse_target("usb:001:007").unwrap();
        assert_eq!(usb.kind, TransportKind::UsbTmc);
        assert_eq!(usb.path, "usb:001:007");
        assert_eq!(parse_target("/dev/usbtmc0").unwrap().kind, TransportKind::UsbTmc);

        let tcp = parse_target("tcp://192.168.1.20:5555").unwrap();
        assert_eq!(tcp.kind, TransportKind::RawTcp);
        assert_eq!(tcp.host_and_port(), ("192.168.1.20", Some(5555)));

        let vxi = parse_target(" 192.168.1.20 ").unwrap();
        assert_eq!(vxi.kind, TransportKind::Vxi11);
        assert_eq!(vxi.host_and_port(), ("192.168.1.20", None));

        assert_eq!(parse_target("vxi11://scope.lab").unwrap().path, "scope.lab");
    }

    #[test]
    fn test_invalid_targets() {
        for target in ["", "tcp://", "vxi11://host/inst0", "two words"] {
            assert!(
                matches!(parse_target(target), Err(ConnectorError::InvalidTarget { .. })),
                "{target}"
            );
        }
    }

    #[test]
    fn test_failed_scan_contributes_nothing() {
        let usb = DeviceDescriptor::usb("DS1054Z", 1, 7);
        let lan = DeviceDescriptor::vxi11("192.168.1.20");

        let devices = ScopeConnector::merge_scans(
            Err(TransportError::Usb(rusb::Error::Other)),
            Ok(vec![lan.clone()]),
        );
        assert_eq!(devices, vec![lan.clone()]);

        let devices = ScopeConnector::merge_scans(
            Ok(vec![usb.clone()]),
            Err(TransportError::Io(std::io::ErrorKind::PermissionDenied.into())),
        );
        assert_eq!(devices, vec![usb.clone()]);

        let devices = ScopeConnector::merge_scans(Ok(vec![usb.clone()]), Ok(vec![lan.clone()]));
        assert_eq!(devices, vec![usb, lan]);
    }
}
