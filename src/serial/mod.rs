// Serial side of the relay
//
// Provides:
// - The `Link`/`LinkOpener` seam and the real serialport-backed link
// - Port location (preferred path, then fallbacks)
// - A scripted fake controller for tests

pub mod fake;
mod link;
pub mod locator;

pub use link::{Link, LinkError, LinkOpener, SerialLink, SerialOpener};
pub use locator::{available_ports, PortLocator};
