// Line-oriented serial link to the motor controller
//
// A reader thread polls the device and forwards complete lines into a channel,
// so waiting for a line is a timeout on a channel receive and never blocks
// past its deadline, even when the controller stops mid-line.

use serialport::{ClearBuffer, SerialPort};
use std::future::Future;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{READ_POLL_INTERVAL, WRITE_TIMEOUT};

/// Error types for the serial link
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Failed to open serial port {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serial link is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, LinkError>;

/// One open, line-oriented connection to the controller
pub trait Link: Send + 'static {
    /// Write `line` followed by the line terminator and flush
    fn write_line(&mut self, line: &str) -> Result<()>;

    /// Wait up to `wait` for the next complete line.
    ///
    /// `Ok(None)` means the wait elapsed without a complete line; errors are
    /// reserved for I/O faults and closed links.
    fn read_line(
        &mut self,
        wait: Duration,
    ) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Drop everything buffered in both directions, partial lines included
    fn reset_buffers(&mut self) -> Result<()>;

    /// Release the device. Closing twice is a no-op.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Opens links by path; the injection point for tests
pub trait LinkOpener: Send + Sync + 'static {
    type Link: Link;

    fn open(&self, path: &str, baud_rate: u32) -> Result<Self::Link>;

    /// Check that `path` can be opened, closing it again straight away
    fn can_open(&self, path: &str, baud_rate: u32, timeout: Duration) -> bool;
}

/// Opens real serial devices
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl LinkOpener for SerialOpener {
    type Link = SerialLink;

    fn open(&self, path: &str, baud_rate: u32) -> Result<SerialLink> {
        SerialLink::open(path, baud_rate)
    }

    fn can_open(&self, path: &str, baud_rate: u32, timeout: Duration) -> bool {
        // The handle is dropped (closed) on return
        match serialport::new(path, baud_rate).timeout(timeout).open() {
            Ok(_) => true,
            Err(e) => {
                debug!("Cannot open {}: {}", path, e);
                false
            }
        }
    }
}

/// Serial device owned by the session
pub struct SerialLink {
    path: String,
    port: Option<Box<dyn SerialPort>>,
    lines: mpsc::UnboundedReceiver<io::Result<String>>,
    shutdown: Arc<AtomicBool>,
    discard: Arc<AtomicBool>,
    reader: Option<thread::JoinHandle<()>>,
}

impl SerialLink {
    /// Open `path` and start the reader thread
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(WRITE_TIMEOUT)
            .open()
            .map_err(|source| LinkError::Open {
                path: path.to_string(),
                source,
            })?;
        debug!("Opened {} at {} baud", path, baud_rate);
        Self::from_port(path, port)
    }

    /// Wrap an already open port. Writes keep the port's own timeout; the
    /// reader thread gets a clone that polls every `READ_POLL_INTERVAL`.
    pub fn from_port(path: &str, port: Box<dyn SerialPort>) -> Result<Self> {
        let mut reader = port.try_clone()?;
        reader.set_timeout(READ_POLL_INTERVAL)?;

        let (tx, lines) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let discard = Arc::new(AtomicBool::new(false));

        let handle = {
            let shutdown = shutdown.clone();
            let discard = discard.clone();
            thread::Builder::new()
                .name(format!("serial-reader {}", path))
                .spawn(move || pump_lines(reader, tx, shutdown, discard))?
        };

        Ok(Self {
            path: path.to_string(),
            port: Some(port),
            lines,
            shutdown,
            discard,
            reader: Some(handle),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Link for SerialLink {
    fn write_line(&mut self, line: &str) -> Result<()> {
        let port = self.port.as_mut().ok_or(LinkError::Closed)?;
        port.write_all(format!("{}\n", line).as_bytes())?;
        port.flush()?;
        Ok(())
    }

    async fn read_line(&mut self, wait: Duration) -> Result<Option<String>> {
        if self.port.is_none() {
            return Err(LinkError::Closed);
        }
        match tokio::time::timeout(wait, self.lines.recv()).await {
            Ok(Some(Ok(line))) => Ok(Some(line)),
            Ok(Some(Err(e))) => Err(LinkError::Io(e)),
            // Reader thread is gone
            Ok(None) => Err(LinkError::Closed),
            Err(_) => Ok(None),
        }
    }

    fn reset_buffers(&mut self) -> Result<()> {
        let port = self.port.as_mut().ok_or(LinkError::Closed)?;
        port.clear(ClearBuffer::All)?;
        self.discard.store(true, Ordering::SeqCst);
        while let Ok(item) = self.lines.try_recv() {
            if let Ok(line) = item {
                debug!("Discarding buffered line: {}", line);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_none() {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);
        self.lines.close();

        // The reader sees the flag within one poll interval
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("Serial reader for {} panicked", self.path);
            }
        }
        debug!("Closed {}", self.path);
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader thread body: assemble bytes into lines until shut down or the device fails
fn pump_lines(
    mut port: Box<dyn SerialPort>,
    tx: mpsc::UnboundedSender<io::Result<String>>,
    shutdown: Arc<AtomicBool>,
    discard: Arc<AtomicBool>,
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 256];

    while !shutdown.load(Ordering::SeqCst) {
        if discard.swap(false, Ordering::SeqCst) {
            pending.clear();
        }

        match port.read(&mut chunk) {
            Ok(0) => continue,
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                for line in split_lines(&mut pending) {
                    if tx.send(Ok(line)).is_err() {
                        return; // link closed
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                if !shutdown.load(Ordering::SeqCst) {
                    warn!("Serial read failed: {}", e);
                    let _ = tx.send(Err(e));
                }
                return;
            }
        }
    }
}

/// Remove every complete line from `pending`, leaving a trailing partial line in place
fn split_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = pending.drain(..=pos).collect();
        lines.push(String::from_utf8_lossy(&raw).trim().to_string());
    }
    lines
}
