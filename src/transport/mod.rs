// Transport management for the motor controller link
//
// Exactly one transport (serial or UDP) is active at a time. The outbound
// link and the inbound listener are tracked separately: sends only need the
// link, while connect/disconnect also own the listener lifecycle.

pub mod serial;
pub mod udp;

use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

pub use serial::{LineReader, list_available_ports};
pub use udp::{UdpListener, UdpSender};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to open {port}: {source}")]
    Connect {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot resolve {0}")]
    Resolve(String),

    #[error("Send failed: {0}")]
    Send(#[source] std::io::Error),

    #[error("Reader task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    ConnectingSerial,
    ConnectedSerial,
    ListeningUdp,
}

/// Everything the transports report back to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One decoded inbound line (telemetry or noise) read by `session`
    Line { session: u64, line: String },
    StateChanged(ConnectionState),
    /// The reader of `session` ended on its own, without being stopped
    ReaderStopped { session: u64 },
}

/// Where a sent packet went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Serial,
    Udp,
    /// Nothing is open; the send was a no-op
    NotOpen,
}

enum Link {
    Idle,
    Serial(Box<dyn SerialPort>),
    Udp(UdpSender),
}

enum Listener {
    Serial(LineReader),
    Udp(UdpListener),
}

impl Listener {
    async fn stop(&mut self) -> Result<(), TransportError> {
        match self {
            Listener::Serial(reader) => reader.stop().await,
            Listener::Udp(listener) => listener.stop().await,
        }
    }
}

#[derive(Default)]
struct Session {
    id: u64,
    listener: Option<Listener>,
    udp_addr: Option<SocketAddr>,
}

/// Locked outbound link, handed out so callers can order sends
pub struct LinkGuard<'a>(MutexGuard<'a, Link>);

impl LinkGuard<'_> {
    /// Write one packet to whichever link is open
    pub fn send(&mut self, bytes: &[u8]) -> Result<Delivery, TransportError> {
        match &mut *self.0 {
            Link::Idle => Ok(Delivery::NotOpen),
            Link::Serial(port) => {
                port.write_all(bytes).map_err(TransportError::Send)?;
                port.flush().map_err(TransportError::Send)?;
                Ok(Delivery::Serial)
            }
            Link::Udp(sender) => {
                sender.send(bytes).map_err(TransportError::Send)?;
                Ok(Delivery::Udp)
            }
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(*self.0, Link::Idle)
    }
}

pub struct TransportManager {
    link: Mutex<Link>,
    state: Mutex<ConnectionState>,
    session: tokio::sync::Mutex<Session>,
    events: UnboundedSender<TransportEvent>,
}

impl TransportManager {
    pub fn new(events: UnboundedSender<TransportEvent>) -> Self {
        Self {
            link: Mutex::new(Link::Idle),
            state: Mutex::new(ConnectionState::Disconnected),
            session: tokio::sync::Mutex::new(Session::default()),
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the outbound link
    pub fn link(&self) -> LinkGuard<'_> {
        LinkGuard(self.link.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Send on the active link; `Delivery::NotOpen` when nothing is open
    pub fn send(&self, bytes: &[u8]) -> Result<Delivery, TransportError> {
        self.link().send(bytes)
    }

    /// Address the UDP listener is bound to, while listening
    pub async fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.session.lock().await.udp_addr
    }

    /// Open a serial port, replacing whatever transport is active
    pub async fn connect_serial(&self, port: &str, baud_rate: u32) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        self.shutdown(&mut session).await;
        self.set_state(ConnectionState::ConnectingSerial);

        let name = port.to_string();
        let opened = tokio::task::spawn_blocking(move || {
            let port = serial::open(&name, baud_rate)?;
            let reader = port.try_clone().map_err(|source| TransportError::Connect {
                port: name.clone(),
                source,
            })?;
            Ok::<_, TransportError>((port, reader))
        })
        .await
        .map_err(|e| TransportError::Join(e.to_string()))
        .and_then(|result| result);

        let (writer, reader) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Serial connect failed: {}", e);
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        session.id += 1;
        session.listener = Some(Listener::Serial(LineReader::spawn(
            reader,
            session.id,
            self.events.clone(),
        )));
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Link::Serial(writer);
        self.set_state(ConnectionState::ConnectedSerial);
        info!("Connected to {} @ {}", port, baud_rate);
        Ok(())
    }

    /// Start the UDP listener on `bind` and send to `remote_ip:remote_port`,
    /// replacing whatever transport is active
    pub async fn listen_udp(
        &self,
        remote_ip: &str,
        remote_port: u16,
        bind: SocketAddr,
    ) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        self.shutdown(&mut session).await;

        let started = UdpSender::open(remote_ip, remote_port).and_then(|sender| {
            let listener = UdpListener::bind(bind, session.id + 1, self.events.clone())?;
            Ok((sender, listener))
        });
        let (sender, listener) = match started {
            Ok(pair) => pair,
            Err(e) => {
                warn!("UDP start failed: {}", e);
                return Err(e);
            }
        };

        session.id += 1;
        session.udp_addr = Some(listener.local_addr());
        info!(
            "UDP listening on {}, sending to {}",
            listener.local_addr(),
            sender.remote()
        );
        session.listener = Some(Listener::Udp(listener));
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Link::Udp(sender);
        self.set_state(ConnectionState::ListeningUdp);
        Ok(())
    }

    /// Stop the listener, then close the link. Safe to call when disconnected.
    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        self.shutdown(&mut session).await;
    }

    /// True while `session_id` owns the active listener
    pub async fn is_current(&self, session_id: u64) -> bool {
        let session = self.session.lock().await;
        session.id == session_id && session.listener.is_some()
    }

    /// Handle a reader that ended on its own. Returns true if it belonged to the
    /// active session, which is then torn down.
    pub async fn reader_stopped(&self, session_id: u64) -> bool {
        let mut session = self.session.lock().await;
        if session.id != session_id || session.listener.is_none() {
            debug!("Ignoring stop notice from stale session {}", session_id);
            return false;
        }
        warn!("Inbound reader stopped, closing transport");
        self.shutdown(&mut session).await;
        true
    }

    /// Run `source` as a serial session without opening a port
    #[cfg(test)]
    pub(crate) async fn attach_serial_reader<R>(&self, source: R) -> u64
    where
        R: std::io::Read + Send + 'static,
    {
        let mut session = self.session.lock().await;
        self.shutdown(&mut session).await;
        session.id += 1;
        session.listener = Some(Listener::Serial(LineReader::spawn(
            source,
            session.id,
            self.events.clone(),
        )));
        self.set_state(ConnectionState::ConnectedSerial);
        session.id
    }

    async fn shutdown(&self, session: &mut Session) {
        // Reader first, so it never sees a half-closed handle
        if let Some(mut listener) = session.listener.take() {
            if let Err(e) = listener.stop().await {
                warn!("Listener did not stop cleanly: {}", e);
            }
        }
        session.udp_addr = None;

        let previous = std::mem::replace(
            &mut *self.link.lock().unwrap_or_else(PoisonError::into_inner),
            Link::Idle,
        );
        if !matches!(previous, Link::Idle) {
            info!("Transport closed");
        }
        drop(previous);
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            debug!("Transport state {:?} -> {:?}", *state, next);
            *state = next;
            let _ = self.events.send(TransportEvent::StateChanged(next));
        }
    }
}
