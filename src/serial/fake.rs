// Scripted in-memory controller
//
// `FakeController` opens `FakeLink`s and records every line written to and read
// from them, so tests can check exactly what reached the wire and in which order.
// Replies and the readiness marker are delivered by tokio tasks, so the fake
// follows tokio's paused clock in tests.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use super::link::{Link, LinkError, LinkOpener, Result};
use crate::config::READY_MARKER;

/// One line crossing the fake wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Write(String),
    Read(String),
}

type Responder = dyn Fn(&str) -> Option<String> + Send + Sync;

#[derive(Default)]
struct Shared {
    events: Mutex<Vec<WireEvent>>,
    checked: Mutex<Vec<String>>,
    // None = every path opens
    ports: Mutex<Option<Vec<String>>>,
    responder: Mutex<Option<Arc<Responder>>>,
    reply_delay: Mutex<Duration>,
    ready_after: Mutex<Option<Duration>>,
    fail_writes: AtomicBool,
    inbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    opens: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fake controller and link opener. Clones share the same wire.
#[derive(Clone, Default)]
pub struct FakeController {
    shared: Arc<Shared>,
}

impl FakeController {
    /// A controller on any path that never replies and never emits the readiness marker
    pub fn new() -> Self {
        Self::default()
    }

    /// Only these paths can be opened
    pub fn with_ports(self, paths: &[&str]) -> Self {
        *lock(&self.shared.ports) = Some(paths.iter().map(|p| p.to_string()).collect());
        self
    }

    /// Emit the readiness marker `after` the session resets the buffers
    pub fn with_ready_marker(self, after: Duration) -> Self {
        *lock(&self.shared.ready_after) = Some(after);
        self
    }

    /// Answer each written line with `respond(line)` after `delay`; `None` stays silent
    pub fn replying<F>(self, delay: Duration, respond: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        *lock(&self.shared.responder) = Some(Arc::new(respond));
        *lock(&self.shared.reply_delay) = delay;
        self
    }

    /// Answer every line with `OK:<line>` after `delay`
    pub fn echo_ok(self, delay: Duration) -> Self {
        self.replying(delay, |line| Some(format!("OK:{}", line)))
    }

    /// Make every subsequent write fail with an I/O error
    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Push an unsolicited line to the currently open link
    pub fn emit(&self, line: &str) {
        if let Some(tx) = lock(&self.shared.inbound).as_ref() {
            let _ = tx.send(line.to_string());
        }
    }

    pub fn events(&self) -> Vec<WireEvent> {
        lock(&self.shared.events).clone()
    }

    /// Lines written to the wire, in order
    pub fn writes(&self) -> Vec<String> {
        lock(&self.shared.events)
            .iter()
            .filter_map(|event| match event {
                WireEvent::Write(line) => Some(line.clone()),
                WireEvent::Read(_) => None,
            })
            .collect()
    }

    pub fn count_writes(&self, line: &str) -> usize {
        self.writes().iter().filter(|w| w.as_str() == line).count()
    }

    /// Paths checked by `can_open`, in order
    pub fn checked_paths(&self) -> Vec<String> {
        lock(&self.shared.checked).clone()
    }

    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    fn reachable(&self, path: &str) -> bool {
        match lock(&self.shared.ports).as_ref() {
            Some(ports) => ports.iter().any(|p| p == path),
            None => true,
        }
    }
}

impl LinkOpener for FakeController {
    type Link = FakeLink;

    fn open(&self, path: &str, _baud_rate: u32) -> Result<FakeLink> {
        if !self.reachable(path) {
            return Err(LinkError::Open {
                path: path.to_string(),
                source: serialport::Error::new(serialport::ErrorKind::NoDevice, "no such fake port"),
            });
        }
        self.shared.opens.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.inbound) = Some(tx.clone());
        Ok(FakeLink {
            shared: self.shared.clone(),
            tx,
            rx,
            open: true,
        })
    }

    fn can_open(&self, path: &str, _baud_rate: u32, _timeout: Duration) -> bool {
        lock(&self.shared.checked).push(path.to_string());
        self.reachable(path)
    }
}

/// Link handed out by `FakeController`
pub struct FakeLink {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
    open: bool,
}

impl FakeLink {
    fn deliver(&self, line: String, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(line);
        });
    }
}

impl Link for FakeLink {
    fn write_line(&mut self, line: &str) -> Result<()> {
        if !self.open {
            return Err(LinkError::Closed);
        }
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(LinkError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated write fault",
            )));
        }

        lock(&self.shared.events).push(WireEvent::Write(line.to_string()));

        let responder = lock(&self.shared.responder).clone();
        if let Some(reply) = responder.and_then(|respond| (*respond)(line)) {
            let delay = *lock(&self.shared.reply_delay);
            self.deliver(reply, delay);
        }
        Ok(())
    }

    async fn read_line(&mut self, wait: Duration) -> Result<Option<String>> {
        if !self.open {
            return Err(LinkError::Closed);
        }
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(line)) => {
                lock(&self.shared.events).push(WireEvent::Read(line.clone()));
                Ok(Some(line))
            }
            Ok(None) => Err(LinkError::Closed),
            Err(_) => Ok(None),
        }
    }

    fn reset_buffers(&mut self) -> Result<()> {
        if !self.open {
            return Err(LinkError::Closed);
        }
        while self.rx.try_recv().is_ok() {}

        let ready_after = *lock(&self.shared.ready_after);
        if let Some(after) = ready_after {
            self.deliver(READY_MARKER.to_string(), after);
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.rx.close();
            *lock(&self.shared.inbound) = None;
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
