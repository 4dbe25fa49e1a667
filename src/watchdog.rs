// Failsafe watchdog
// Note: a watchdog is a safety mechanism that triggers a safe action if something goes wrong
// Eg. if the remote client crashes and stops sending commands, the controller would keep
// executing the last one; the watchdog commands STOP instead

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::WatchdogConfig;
use crate::messages::Command;
use crate::serial::LinkOpener;
use crate::session::SessionManager;

/// Handle to a running watchdog task
pub struct Watchdog {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start checking `session` every `config.interval`. The first check runs
    /// one interval after arming.
    pub fn spawn<O: LinkOpener>(session: Arc<SessionManager<O>>, config: WatchdogConfig) -> Self {
        let (shutdown, mut stop) = watch::channel(false);

        info!(
            "Watchdog armed: {}ms failsafe timeout, checking every {}ms",
            config.failsafe_timeout.as_millis(),
            config.interval.as_millis()
        );

        let task = tokio::spawn(async move {
            let mut tick = interval(config.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await; // completes immediately

            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = stop.changed() => break,
                }
                check(&session, &config).await;
            }
            debug!("Watchdog stopped");
        });

        Self {
            shutdown,
            task: Some(task),
        }
    }

    /// Stop the task, letting a STOP already in flight finish
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// One tick. Returns true when a failsafe STOP was attempted.
async fn check<O: LinkOpener>(session: &SessionManager<O>, config: &WatchdogConfig) -> bool {
    if !session.is_ready() {
        return false;
    }

    // Staleness is re-checked under the exchange lock; a command that slips in
    // ahead of us wins and no STOP follows it
    match session
        .send_if_stale(Command::Stop.as_str(), config.failsafe_timeout)
        .await
    {
        Ok(Some(outcome)) => {
            debug!("Failsafe STOP outcome: {:?}", outcome);
            true
        }
        Ok(None) => false,
        Err(e) => {
            debug!("Failsafe STOP failed: {}", e);
            true
        }
    }
}
