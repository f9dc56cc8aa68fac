// Serial link to the motor controller
//
// The port is opened once and cloned: the original handle is used for writes,
// the clone is moved into a blocking line-reader task.

use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{TransportError, TransportEvent};
use crate::config::SERIAL_READ_TIMEOUT;

/// Longest inbound line kept; longer runs without a newline are dropped
const MAX_LINE_LENGTH: usize = 2048;

/// Device identifiers of the serial ports present right now
pub fn list_available_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            warn!("Failed to enumerate serial ports: {}", e);
            Vec::new()
        }
    }
}

/// Open a port as 8N1 without flow control
pub fn open(port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>, TransportError> {
    let port = serialport::new(port_name, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(SERIAL_READ_TIMEOUT)
        .open()
        .map_err(|source| TransportError::Connect {
            port: port_name.to_string(),
            source,
        })?;

    info!("Opened serial port {} at {} baud", port_name, baud_rate);
    Ok(port)
}

/// Blocking line reader running on the blocking thread pool
///
/// Stopping is cooperative: the flag is checked between reads, and every read
/// is bounded by the port timeout.
pub struct LineReader {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LineReader {
    pub fn spawn<R>(source: R, session: u64, events: UnboundedSender<TransportEvent>) -> Self
    where
        R: Read + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle =
            tokio::task::spawn_blocking(move || read_lines(source, &flag, session, &events));
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop and wait for the reader to return. Safe to call more than once.
    pub async fn stop(&mut self) -> Result<(), TransportError> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| TransportError::Join(e.to_string()))?;
            debug!("Serial reader joined");
        }
        Ok(())
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }
}

fn read_lines<R: Read>(
    source: R,
    stop: &AtomicBool,
    session: u64,
    events: &UnboundedSender<TransportEvent>,
) {
    let mut reader = BufReader::new(source);
    // Partial lines survive read timeouts
    let mut pending = Vec::new();
    // Set after an overlong line, until its terminating newline is skipped
    let mut overflowed = false;

    while !stop.load(Ordering::SeqCst) {
        // Never zero, so Ok(0) always means end of stream
        let room = (MAX_LINE_LENGTH - pending.len()) as u64;
        match (&mut reader).take(room).read_until(b'\n', &mut pending) {
            Ok(0) => {
                debug!("Serial stream closed");
                break;
            }
            Ok(_) => {
                if pending.last() != Some(&b'\n') {
                    if pending.len() >= MAX_LINE_LENGTH {
                        pending.clear();
                        if !overflowed {
                            overflowed = true;
                            warn!("Serial line longer than {} bytes dropped", MAX_LINE_LENGTH);
                            let line = format!("Read error: line too long (over {} bytes)", MAX_LINE_LENGTH);
                            if stop.load(Ordering::SeqCst)
                                || events.send(TransportEvent::Line { session, line }).is_err()
                            {
                                return;
                            }
                        }
                    }
                    continue;
                }
                let line = std::mem::take(&mut pending);
                if std::mem::take(&mut overflowed) {
                    continue;
                }
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                let text = match String::from_utf8(line) {
                    Ok(text) => text.trim().to_string(),
                    Err(e) => format!("Read error: {}", e),
                };
                if !text.is_empty()
                    && events
                        .send(TransportEvent::Line {
                            session,
                            line: text,
                        })
                        .is_err()
                {
                    return;
                }
            }
            Err(e) if is_transient(e.kind()) => continue,
            Err(e) if is_closed(e.kind()) => {
                debug!("Serial handle closed: {}", e);
                break;
            }
            Err(e) => {
                warn!("Serial read failed: {}", e);
                if !stop.load(Ordering::SeqCst) {
                    let _ = events.send(TransportEvent::Line {
                        session,
                        line: format!("Read error: {}", e),
                    });
                }
                break;
            }
        }
    }

    if !stop.load(Ordering::SeqCst) {
        let _ = events.send(TransportEvent::ReaderStopped { session });
    }
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

fn is_closed(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionAborted
    )
}
