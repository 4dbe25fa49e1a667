// Serial command session: connect handshake and serialized exchanges
//
// Every exchange (write a command, then wait for its reply) runs under one
// lock, so the watchdog and any number of callers never interleave on the wire.
// The link state is published on a watch channel; waits on the link also watch
// it, so a disconnect interrupts an exchange instead of waiting it out.

use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{SessionConfig, READY_MARKER};
use crate::error::{RelayError, Result};
use crate::messages::{Handshake, LinkState, Outcome};
use crate::serial::{Link, LinkOpener};

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Time of the last command dispatched to the controller
#[derive(Debug, Default)]
pub struct ActivityClock {
    last: StdMutex<Option<Instant>>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self) {
        *lock(&self.last) = Some(Instant::now());
    }

    /// `None` until the first dispatch
    pub fn last(&self) -> Option<Instant> {
        *lock(&self.last)
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.last().map(|at| at.elapsed())
    }

    /// True when nothing was dispatched within `timeout`; never dispatching counts as stale
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.elapsed().is_none_or(|elapsed| elapsed > timeout)
    }
}

/// Resolves once the session is marked disconnected
async fn closed(state: &mut watch::Receiver<LinkState>) {
    // An error means the sender is gone, which only happens with the session itself
    let _ = state
        .wait_for(|state| *state == LinkState::Disconnected)
        .await;
}

/// Owns the controller link and runs one exchange at a time
pub struct SessionManager<O: LinkOpener> {
    opener: O,
    config: SessionConfig,
    link: Mutex<Option<O::Link>>,
    state: watch::Sender<LinkState>,
    port: StdMutex<Option<String>>,
    activity: ActivityClock,
}

impl<O: LinkOpener> SessionManager<O> {
    pub fn new(opener: O, config: SessionConfig) -> Self {
        Self {
            opener,
            config,
            link: Mutex::new(None),
            state: watch::Sender::new(LinkState::Disconnected),
            port: StdMutex::new(None),
            activity: ActivityClock::new(),
        }
    }

    /// Open `path`, let the controller boot and wait for its readiness marker.
    ///
    /// A missing marker is logged and reported as `Handshake::Incomplete`; the
    /// link is still usable since firmware that is already running does not
    /// announce itself again.
    pub async fn connect(&self, path: &str) -> Result<Handshake> {
        let mut guard = self.link.lock().await;
        if let Some(mut previous) = guard.take() {
            info!("Closing previous controller link");
            previous.close();
        }
        *lock(&self.port) = None;
        self.state.send_replace(LinkState::Connecting);

        info!(
            "Connecting to controller on {} at {} baud",
            path, self.config.baud_rate
        );
        let mut link = match self.opener.open(path, self.config.baud_rate) {
            Ok(link) => link,
            Err(e) => {
                error!("Failed to open {}: {}", path, e);
                self.state.send_replace(LinkState::Disconnected);
                return Err(e.into());
            }
        };

        match self.handshake(&mut link).await {
            Ok(handshake) => {
                *guard = Some(link);
                *lock(&self.port) = Some(path.to_string());
                self.state.send_replace(LinkState::Ready);
                Ok(handshake)
            }
            Err(e) => {
                warn!("Connect to {} aborted: {}", path, e);
                link.close();
                self.state.send_replace(LinkState::Disconnected);
                Err(e)
            }
        }
    }

    async fn handshake(&self, link: &mut O::Link) -> Result<Handshake> {
        let mut state = self.state.subscribe();

        // Opening the port resets the controller
        tokio::select! {
            _ = sleep(self.config.settle_delay) => {}
            _ = closed(&mut state) => return Err(RelayError::LinkClosed),
        }
        link.reset_buffers()?;

        let deadline = Instant::now() + self.config.handshake_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let line = tokio::select! {
                line = link.read_line(remaining.min(self.config.handshake_poll)) => line,
                _ = closed(&mut state) => return Err(RelayError::LinkClosed),
            };
            match line? {
                Some(line) if line.contains(READY_MARKER) => {
                    info!("Controller ready");
                    return Ok(Handshake::Ready);
                }
                Some(line) => debug!("Ignoring line during handshake: {}", line),
                None => {}
            }
        }

        warn!(
            "Controller ready signal not received within {:?}, continuing anyway",
            self.config.handshake_timeout
        );
        Ok(Handshake::Incomplete)
    }

    /// Send one command and wait for its reply.
    ///
    /// Callers queue on the exchange lock in order. A write or read fault
    /// closes the link and leaves the session `Disconnected`.
    pub async fn send(&self, command: &str) -> Result<Outcome> {
        self.send_when(command, || true)
            .await
            .map(|outcome| outcome.unwrap_or(Outcome::Unanswered))
    }

    /// Send `command` only if nothing was dispatched within `timeout`.
    ///
    /// Staleness is decided while holding the exchange lock, so a command that
    /// lands while this call is queued is never followed by a redundant send.
    /// Returns `Ok(None)` when the clock turned out to be fresh.
    pub async fn send_if_stale(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<Option<Outcome>> {
        self.send_when(command, || {
            let stale = self.activity.is_stale(timeout);
            if stale {
                match self.activity.elapsed() {
                    Some(age) => warn!(
                        "No command for {:.1}s, sending {}",
                        age.as_secs_f32(),
                        command
                    ),
                    None => warn!("No command since connecting, sending {}", command),
                }
            }
            stale
        })
        .await
    }

    async fn send_when(
        &self,
        command: &str,
        proceed: impl FnOnce() -> bool,
    ) -> Result<Option<Outcome>> {
        // Connecting holds the lock for the whole handshake; don't queue behind it
        if !self.is_ready() {
            debug!("Dropping {}: controller not connected", command);
            return Err(RelayError::NotConnected);
        }

        let mut guard = self.link.lock().await;
        let link = match guard.as_mut() {
            Some(link) if self.is_ready() => link,
            _ => {
                debug!("Dropping {}: controller not connected", command);
                return Err(RelayError::NotConnected);
            }
        };
        if !proceed() {
            return Ok(None);
        }
        let mut state = self.state.subscribe();

        let result = self.exchange(link, command, &mut state).await;
        if let Err(RelayError::Link(e)) = &result {
            error!("Serial communication error on {}: {}", command, e);
            if let Some(mut link) = guard.take() {
                link.close();
            }
            *lock(&self.port) = None;
            self.state.send_replace(LinkState::Disconnected);
        }
        result.map(Some)
    }

    async fn exchange(
        &self,
        link: &mut O::Link,
        command: &str,
        state: &mut watch::Receiver<LinkState>,
    ) -> Result<Outcome> {
        // Lines already buffered answer earlier exchanges
        while let Some(stale) = link.read_line(Duration::ZERO).await? {
            debug!("Discarding stale line: {}", stale);
        }

        link.write_line(command)?;
        // Dispatch time, not reply time, feeds the failsafe
        self.activity.touch();
        info!("Sent command to controller: {}", command);

        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let line = tokio::select! {
                line = link.read_line(remaining) => line,
                _ = closed(state) => return Err(RelayError::LinkClosed),
            };
            match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    debug!("Controller response: {}", line);
                    return Ok(Outcome::from_reply(line));
                }
                None => break,
            }
        }

        warn!(
            "No response to {} within {:?}",
            command, self.config.response_timeout
        );
        Ok(Outcome::Unanswered)
    }

    /// Close the link. Interrupts any exchange or handshake in flight.
    pub async fn disconnect(&self) {
        self.shutdown(None).await
    }

    /// Like `disconnect`, but write `parting` to the controller before closing
    pub async fn disconnect_with(&self, parting: &str) {
        self.shutdown(Some(parting)).await
    }

    async fn shutdown(&self, parting: Option<&str>) {
        // Publish first so whoever holds the link gives it up
        self.state.send_replace(LinkState::Disconnected);

        let mut guard = self.link.lock().await;
        if let Some(mut link) = guard.take() {
            if let Some(command) = parting {
                match link.write_line(command) {
                    Ok(()) => {
                        self.activity.touch();
                        info!("Sent {} before disconnecting", command);
                        sleep(self.config.parting_delay).await;
                    }
                    Err(e) => warn!("Failed to send {} before disconnecting: {}", command, e),
                }
            }
            link.close();
            info!("Disconnected from controller");
        }
        *lock(&self.port) = None;
        self.state.send_replace(LinkState::Disconnected);
    }

    pub fn link_state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.link_state() == LinkState::Ready
    }

    /// Path of the open link, if any
    pub fn port(&self) -> Option<String> {
        lock(&self.port).clone()
    }

    pub fn activity(&self) -> &ActivityClock {
        &self.activity
    }

    pub fn opener(&self) -> &O {
        &self.opener
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::fake::{FakeController, WireEvent};
    use crate::serial::LinkError;
    use std::sync::Arc;

    const PORT: &str = "/dev/ttyACM0";

    fn session(fake: &FakeController) -> SessionManager<FakeController> {
        SessionManager::new(fake.clone(), SessionConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sees_ready_marker() {
        let fake = FakeController::new().with_ready_marker(Duration::from_millis(300));
        let session = session(&fake);
        let config = SessionConfig::default();

        let start = Instant::now();
        let handshake = session.connect(PORT).await.unwrap();

        assert_eq!(handshake, Handshake::Ready);
        assert!(session.is_ready());
        assert_eq!(session.port().as_deref(), Some(PORT));
        assert!(start.elapsed() < config.settle_delay + config.handshake_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_without_marker_still_ready() {
        let fake = FakeController::new();
        let session = session(&fake);
        let config = SessionConfig::default();

        let start = Instant::now();
        let handshake = session.connect(PORT).await.unwrap();

        assert_eq!(handshake, Handshake::Incomplete);
        assert!(session.is_ready());
        assert!(start.elapsed() >= config.settle_delay + config.handshake_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_ignores_boot_chatter() {
        let fake = FakeController::new().with_ready_marker(Duration::from_millis(400));
        let session = Arc::new(session(&fake));

        let connecting = tokio::spawn({
            let session = session.clone();
            async move { session.connect(PORT).await }
        });
        // After the settle delay, before the marker
        sleep(Duration::from_millis(2100)).await;
        fake.emit("Motor driver init");

        assert_eq!(connecting.await.unwrap().unwrap(), Handshake::Ready);
        assert!(fake.events().contains(&WireEvent::Read("Motor driver init".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_open_failure() {
        let fake = FakeController::new().with_ports(&[]);
        let session = session(&fake);

        let result = session.connect(PORT).await;
        assert!(matches!(
            result,
            Err(RelayError::Link(LinkError::Open { .. }))
        ));
        assert_eq!(session.link_state(), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_connection() {
        let fake = FakeController::new().echo_ok(Duration::from_millis(10));
        let session = session(&fake);

        assert!(matches!(
            session.send("STOP").await,
            Err(RelayError::NotConnected)
        ));
        assert!(fake.writes().is_empty());
        assert!(session.activity().last().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_classifies_replies() {
        let fake = FakeController::new().replying(Duration::from_millis(20), |line| {
            Some(match line {
                "FORWARD" => "OK:FWD-DONE".to_string(),
                "LEFT" => "ERROR:Obstacle".to_string(),
                _ => format!("Executing {}", line),
            })
        });
        let session = session(&fake);
        session.connect(PORT).await.unwrap();

        assert_eq!(
            session.send("FORWARD").await.unwrap(),
            Outcome::Acknowledged("OK:FWD-DONE".into())
        );
        assert_eq!(
            session.send("LEFT").await.unwrap(),
            Outcome::Rejected("ERROR:Obstacle".into())
        );
        assert_eq!(
            session.send("RIGHT").await.unwrap(),
            Outcome::Acknowledged("Executing RIGHT".into())
        );
        assert!(session.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_lines_are_not_replies() {
        let fake = FakeController::new().replying(Duration::from_millis(20), |_| Some("  ".into()));
        let session = session(&fake);
        session.connect(PORT).await.unwrap();

        assert_eq!(session.send("STOP").await.unwrap(), Outcome::Unanswered);
        assert!(session.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_recorded_at_dispatch() {
        let fake = FakeController::new();
        let session = session(&fake);
        session.connect(PORT).await.unwrap();
        assert!(session.activity().last().is_none());

        let before = Instant::now();
        assert_eq!(session.send("STOP").await.unwrap(), Outcome::Unanswered);

        let dispatched = session.activity().last().unwrap();
        assert_eq!(dispatched, before);
        assert!(session.activity().elapsed().unwrap() >= session.config().response_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_not_attributed_to_next_exchange() {
        let fake = FakeController::new().echo_ok(Duration::from_millis(1500));
        let session = session(&fake);
        session.connect(PORT).await.unwrap();

        assert_eq!(session.send("FORWARD").await.unwrap(), Outcome::Unanswered);
        // The late OK:FORWARD lands while nobody is waiting
        sleep(Duration::from_secs(1)).await;
        assert_eq!(session.send("LEFT").await.unwrap(), Outcome::Unanswered);

        assert_eq!(
            fake.events(),
            vec![
                WireEvent::Write("FORWARD".into()),
                WireEvent::Read("OK:FORWARD".into()),
                WireEvent::Write("LEFT".into()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_fault_disconnects() {
        let fake = FakeController::new().echo_ok(Duration::from_millis(10));
        let session = session(&fake);
        session.connect(PORT).await.unwrap();

        fake.set_fail_writes(true);
        assert!(matches!(
            session.send("FORWARD").await,
            Err(RelayError::Link(LinkError::Io(_)))
        ));
        assert_eq!(session.link_state(), LinkState::Disconnected);
        assert_eq!(session.port(), None);

        fake.set_fail_writes(false);
        assert!(matches!(
            session.send("FORWARD").await,
            Err(RelayError::NotConnected)
        ));

        session.connect(PORT).await.unwrap();
        assert_eq!(
            session.send("FORWARD").await.unwrap(),
            Outcome::Acknowledged("OK:FORWARD".into())
        );
        assert_eq!(fake.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_interrupts_exchange() {
        let fake = FakeController::new();
        let session = Arc::new(session(&fake));
        session.connect(PORT).await.unwrap();

        let start = Instant::now();
        let in_flight = tokio::spawn({
            let session = session.clone();
            async move { session.send("FORWARD").await }
        });
        sleep(Duration::from_millis(100)).await;
        session.disconnect().await;

        assert!(matches!(
            in_flight.await.unwrap(),
            Err(RelayError::LinkClosed)
        ));
        assert!(start.elapsed() < session.config().response_timeout);
        assert_eq!(session.link_state(), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_interrupts_handshake() {
        let fake = FakeController::new();
        let session = Arc::new(session(&fake));

        let connecting = tokio::spawn({
            let session = session.clone();
            async move { session.connect(PORT).await }
        });
        sleep(Duration::from_millis(2500)).await;
        assert_eq!(session.link_state(), LinkState::Connecting);
        session.disconnect().await;

        assert!(matches!(
            connecting.await.unwrap(),
            Err(RelayError::LinkClosed)
        ));
        assert_eq!(session.link_state(), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_with_parting_command() {
        let fake = FakeController::new();
        let session = session(&fake);
        session.connect(PORT).await.unwrap();

        session.disconnect_with("STOP").await;
        assert_eq!(fake.writes(), vec!["STOP".to_string()]);
        assert!(!session.is_ready());

        // Already disconnected: nothing more reaches the wire
        session.disconnect_with("STOP").await;
        assert_eq!(fake.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_survives_reconnect() {
        let fake = FakeController::new().echo_ok(Duration::from_millis(10));
        let session = session(&fake);
        session.connect(PORT).await.unwrap();
        session.send("STOP").await.unwrap();
        let dispatched = session.activity().last();

        session.disconnect().await;
        session.connect(PORT).await.unwrap();
        assert_eq!(session.activity().last(), dispatched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_connecting_fails_fast() {
        let fake = FakeController::new().echo_ok(Duration::from_millis(10));
        let session = Arc::new(session(&fake));

        let connecting = tokio::spawn({
            let session = session.clone();
            async move { session.connect(PORT).await }
        });
        sleep(Duration::from_millis(100)).await;
        assert_eq!(session.link_state(), LinkState::Connecting);

        let start = Instant::now();
        assert!(matches!(
            session.send("FORWARD").await,
            Err(RelayError::NotConnected)
        ));
        assert_eq!(start.elapsed(), Duration::ZERO);

        connecting.await.unwrap().unwrap();
        assert!(fake.writes().is_empty());
    }

    #[test]
    fn test_staleness() {
        let clock = ActivityClock::new();
        assert!(clock.is_stale(Duration::from_secs(2)));
        clock.touch();
        assert!(!clock.is_stale(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_if_stale_rechecks_under_lock() {
        // LEFT is never answered, so it holds the exchange for the full response timeout
        let fake = FakeController::new().replying(Duration::from_millis(10), |line| {
            (line != "LEFT").then(|| format!("OK:{}", line))
        });
        let session = Arc::new(session(&fake));
        session.connect(PORT).await.unwrap();
        let failsafe = Duration::from_millis(500);

        let left = tokio::spawn({
            let session = session.clone();
            async move { session.send("LEFT").await }
        });
        sleep(Duration::from_millis(600)).await;
        let forward = tokio::spawn({
            let session = session.clone();
            async move { session.send("FORWARD").await }
        });
        sleep(Duration::from_millis(100)).await;

        // Stale when queued, fresh once FORWARD has gone through
        assert!(session.activity().is_stale(failsafe));
        assert_eq!(session.send_if_stale("STOP", failsafe).await.unwrap(), None);

        assert_eq!(left.await.unwrap().unwrap(), Outcome::Unanswered);
        assert_eq!(
            forward.await.unwrap().unwrap(),
            Outcome::Acknowledged("OK:FORWARD".into())
        );
        assert_eq!(fake.writes(), vec!["LEFT".to_string(), "FORWARD".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_if_stale_sends_when_idle() {
        let fake = FakeController::new().echo_ok(Duration::from_millis(10));
        let session = session(&fake);
        session.connect(PORT).await.unwrap();

        let outcome = session
            .send_if_stale("STOP", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(outcome, Some(Outcome::Acknowledged("OK:STOP".into())));
        assert_eq!(
            session.send_if_stale("STOP", Duration::from_secs(2)).await.unwrap(),
            None
        );
        assert_eq!(fake.count_writes("STOP"), 1);
    }
}
