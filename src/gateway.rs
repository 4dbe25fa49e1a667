// Command gateway: the only surface the request-handling layer talks to
//
// Validates command tokens, locates the port, and keeps the watchdog's
// lifetime tied to the link's.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::error::{RelayError, Result};
use crate::messages::{Command, GatewayStatus, Handshake, LinkState, Outcome};
use crate::serial::{available_ports, LinkOpener, PortLocator, SerialOpener};
use crate::session::SessionManager;
use crate::watchdog::Watchdog;

pub struct CommandGateway<O: LinkOpener = SerialOpener> {
    session: Arc<SessionManager<O>>,
    locator: PortLocator,
    config: GatewayConfig,
    watchdog: Mutex<Option<Watchdog>>,
}

impl CommandGateway<SerialOpener> {
    /// Gateway over real serial devices
    pub fn serial(config: GatewayConfig) -> Self {
        Self::new(SerialOpener, config)
    }
}

impl<O: LinkOpener> CommandGateway<O> {
    pub fn new(opener: O, config: GatewayConfig) -> Self {
        let locator = PortLocator::new(config.session.baud_rate, config.port_check_timeout);
        let session = Arc::new(SessionManager::new(opener, config.session.clone()));
        Self {
            session,
            locator,
            config,
            watchdog: Mutex::new(None),
        }
    }

    /// Find the controller, connect and arm the failsafe
    pub async fn connect(&self) -> Result<Handshake> {
        let mut watchdog = self.watchdog.lock().await;
        if let Some(previous) = watchdog.take() {
            previous.shutdown().await;
        }

        let path = self
            .locator
            .locate(
                self.session.opener(),
                self.config.preferred_port.as_deref(),
                &self.config.fallback_ports,
            )
            .ok_or_else(|| {
                warn!(
                    "Controller not found. Available ports: {:?}",
                    available_ports()
                );
                RelayError::PortNotFound
            })?;

        let handshake = self.session.connect(&path).await?;
        info!("Controller connected on {} ({:?})", path, handshake);

        *watchdog = Some(Watchdog::spawn(
            self.session.clone(),
            self.config.watchdog.clone(),
        ));
        Ok(handshake)
    }

    /// Validate `raw` and relay it to the controller
    pub async fn execute(&self, raw: &str) -> Result<Outcome> {
        let command: Command = raw.parse()?;
        let outcome = self.session.send(command.as_str()).await?;
        info!("Command executed: {} -> {:?}", command, outcome);
        Ok(outcome)
    }

    /// Stop the robot, close the link and disarm the failsafe.
    ///
    /// Closing first interrupts a connect or exchange in flight; the watchdog
    /// does nothing without a link.
    pub async fn disconnect(&self) {
        self.session.disconnect_with(Command::Stop.as_str()).await;
        if let Some(watchdog) = self.watchdog.lock().await.take() {
            watchdog.shutdown().await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_ready()
    }

    pub fn link_state(&self) -> LinkState {
        self.session.link_state()
    }

    /// `None` until the first command is dispatched
    pub fn time_since_last_activity(&self) -> Option<Duration> {
        self.session.activity().elapsed()
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            connected: self.is_connected(),
            link_state: self.link_state(),
            port: self.session.port(),
            seconds_since_last_command: self
                .time_since_last_activity()
                .map(|elapsed| (elapsed.as_secs_f64() * 100.0).round() / 100.0),
        }
    }

    pub fn session(&self) -> &Arc<SessionManager<O>> {
        &self.session
    }
}
