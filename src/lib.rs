// Serial command relay for the robot dog's motor controller
//
// Callers hand motion commands to a `CommandGateway`, which validates them and
// relays them one exchange at a time over the controller's serial line, while a
// watchdog stops the robot when commands stop arriving.

pub mod config;
pub mod error;
pub mod gateway;
pub mod messages;
pub mod serial;
pub mod session;
pub mod watchdog;

pub use error::{RelayError, Result};
pub use gateway::CommandGateway;
pub use messages::{Command, GatewayStatus, Handshake, LinkState, Outcome};
