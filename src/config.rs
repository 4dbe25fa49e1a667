// Timeouts, serial settings and candidate ports for the controller link
use std::time::Duration;

// Serial line settings
pub const BAUD_RATE: u32 = 9600;

// How long checking whether a port opens may take
pub const PORT_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

// Poll interval of the serial reader thread (its read timeout)
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

// A write that can't drain within this is a link fault
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

// The controller reboots when the port is opened; give it time before talking
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

// How long to wait for the readiness marker after the settle delay
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
pub const HANDSHAKE_POLL: Duration = Duration::from_millis(100);

// Line emitted by the controller firmware once it has booted
pub const READY_MARKER: &str = "ARDUINO_READY";

// Reply wait for a single exchange
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

// Time given to the controller to act on the parting STOP before the port closes
pub const PARTING_DELAY: Duration = Duration::from_millis(100);

// Failsafe: stop the robot if no command was dispatched for this long
pub const FAILSAFE_TIMEOUT: Duration = Duration::from_secs(2);
pub const WATCHDOG_INTERVAL: Duration = Duration::from_millis(500);

// Ports tried after the preferred one
pub const FALLBACK_PORTS: [&str; 5] = [
    "/dev/ttyACM0",
    "/dev/ttyACM1",
    "/dev/ttyUSB0",
    "/dev/ttyUSB1",
    "/dev/ttyAMA0",
];

/// Settings for a single controller session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub baud_rate: u32,
    pub settle_delay: Duration,
    pub handshake_timeout: Duration,
    pub handshake_poll: Duration,
    pub response_timeout: Duration,
    pub parting_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            settle_delay: SETTLE_DELAY,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            handshake_poll: HANDSHAKE_POLL,
            response_timeout: RESPONSE_TIMEOUT,
            parting_delay: PARTING_DELAY,
        }
    }
}

/// Failsafe timer settings
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub failsafe_timeout: Duration,
    pub interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            failsafe_timeout: FAILSAFE_TIMEOUT,
            interval: WATCHDOG_INTERVAL,
        }
    }
}

/// Everything the gateway needs to find, open and guard the controller
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub preferred_port: Option<String>,
    pub fallback_ports: Vec<String>,
    pub port_check_timeout: Duration,
    pub session: SessionConfig,
    pub watchdog: WatchdogConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            preferred_port: None,
            fallback_ports: FALLBACK_PORTS.iter().map(|p| p.to_string()).collect(),
            port_check_timeout: PORT_CHECK_TIMEOUT,
            session: SessionConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}
