// Find the controller's serial port: preferred path first, then the fallbacks in order

use std::time::Duration;
use tracing::{debug, info};

use super::link::LinkOpener;

/// Tries candidate paths until one opens
#[derive(Debug, Clone)]
pub struct PortLocator {
    baud_rate: u32,
    check_timeout: Duration,
}

impl PortLocator {
    pub fn new(baud_rate: u32, check_timeout: Duration) -> Self {
        Self {
            baud_rate,
            check_timeout,
        }
    }

    /// Return the first candidate that opens, or `None` once all are exhausted.
    ///
    /// Opening a port says nothing about whether a working controller sits
    /// behind it; the handshake happens later in the session.
    pub fn locate<O: LinkOpener>(
        &self,
        opener: &O,
        preferred: Option<&str>,
        fallbacks: &[String],
    ) -> Option<String> {
        preferred
            .into_iter()
            .chain(fallbacks.iter().map(String::as_str))
            .find(|path| {
                let found = opener.can_open(path, self.baud_rate, self.check_timeout);
                if found {
                    info!("Found controller port: {}", path);
                } else {
                    debug!("Port {} not available", path);
                }
                found
            })
            .map(str::to_string)
    }
}

/// Serial ports the OS reports, for diagnostics when no candidate opens
pub fn available_ports() -> Vec<String> {
    serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|p| p.port_name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::fake::FakeController;

    fn fallbacks() -> Vec<String> {
        vec!["/dev/ttyACM0".into(), "/dev/ttyUSB0".into(), "/dev/ttyAMA0".into()]
    }

    #[test]
    fn test_preferred_port_wins() {
        let fake = FakeController::new().with_ports(&["/dev/cu.usbmodem1101", "/dev/ttyACM0"]);
        let locator = PortLocator::new(9600, Duration::from_millis(100));

        let found = locator.locate(&fake, Some("/dev/cu.usbmodem1101"), &fallbacks());
        assert_eq!(found.as_deref(), Some("/dev/cu.usbmodem1101"));
        // Nothing past the preferred port is tried
        assert_eq!(fake.checked_paths(), vec!["/dev/cu.usbmodem1101".to_string()]);
    }

    #[test]
    fn test_fallbacks_tried_in_order() {
        let fake = FakeController::new().with_ports(&["/dev/ttyUSB0", "/dev/ttyAMA0"]);
        let locator = PortLocator::new(9600, Duration::from_millis(100));

        let found = locator.locate(&fake, Some("/dev/cu.usbmodem1101"), &fallbacks());
        assert_eq!(found.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(
            fake.checked_paths(),
            vec![
                "/dev/cu.usbmodem1101".to_string(),
                "/dev/ttyACM0".to_string(),
                "/dev/ttyUSB0".to_string(),
            ]
        );
    }

    #[test]
    fn test_exhausted_candidates() {
        let fake = FakeController::new().with_ports(&[]);
        let locator = PortLocator::new(9600, Duration::from_millis(100));

        assert_eq!(locator.locate(&fake, None, &fallbacks()), None);
        assert_eq!(fake.checked_paths().len(), 3);
        assert_eq!(locator.locate(&fake, None, &[]), None);
    }
}
