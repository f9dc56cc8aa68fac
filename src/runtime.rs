// Command loop with a 30 ms ramp ticker
// Note: the ticker is a separate task so smoothing keeps running while the
// command loop waits on a (re)connect. Both call into the same ControlLoop.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_SURFACE_RADIUS, Settings, TICK_PERIOD};
use crate::control::{ControlLoop, Dispatch};
use crate::messages::{Command, Event};
use crate::protocol::{Inbound, WireCodec, classify};
use crate::state::InputMode;
use crate::transport::{TransportEvent, TransportManager, list_available_ports};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Event receiver dropped")]
    EventsClosed,
}

/// Periodic ramp task, alive only while the joystick surface is active
///
/// Each tick runs on the blocking pool, since a tick may write to the serial port.
#[derive(Default)]
pub struct RampTicker {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RampTicker {
    pub fn start(&mut self, control: Arc<ControlLoop>, period: Duration, events: UnboundedSender<Event>) {
        if self.handle.is_some() {
            return;
        }
        debug!("Ramp ticker started ({}ms)", period.as_millis());
        let (stop, mut stopped) = oneshot::channel();
        self.stop = Some(stop);
        self.handle = Some(tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = tick.tick() => {}
                }
                let control = control.clone();
                let Ok((speeds, dispatch)) = tokio::task::spawn_blocking(move || control.tick()).await else {
                    break;
                };
                if events.send(Event::WheelSpeeds { speeds }).is_err() {
                    break;
                }
                if let Some(event) = dispatch_event(&dispatch) {
                    if events.send(event).is_err() {
                        break;
                    }
                }
            }
        }));
    }

    /// Wait for the tick in flight, then end the task; nothing ticks after this returns
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
            debug!("Ramp ticker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

/// UI event for a dispatch worth showing, if any
fn dispatch_event(dispatch: &Dispatch) -> Option<Event> {
    match dispatch {
        Dispatch::Sent { packet, .. } => Some(Event::PacketSent {
            packet: packet.to_string(),
        }),
        Dispatch::Failed { error, .. } => Some(Event::diagnostic(format!("Send error: {}", error))),
        _ => None,
    }
}

pub struct Runtime {
    settings: Settings,
    config_path: Option<PathBuf>,
    control: Arc<ControlLoop>,
    transport: Arc<TransportManager>,
    transport_events: UnboundedReceiver<TransportEvent>,
    ticker: RampTicker,
    tick_period: Duration,
    events: UnboundedSender<Event>,
}

impl Runtime {
    pub fn new(settings: Settings, mode: InputMode, events: UnboundedSender<Event>) -> Self {
        let (transport_tx, transport_events) = mpsc::unbounded_channel();
        let transport = Arc::new(TransportManager::new(transport_tx));
        let control = Arc::new(ControlLoop::new(
            transport.clone(),
            WireCodec::new(settings.profile),
            mode,
            DEFAULT_SURFACE_RADIUS,
        ));
        Self {
            settings,
            config_path: None,
            control,
            transport,
            transport_events,
            ticker: RampTicker::default(),
            tick_period: TICK_PERIOD,
            events,
        }
    }

    /// Persist settings to `path` after every successful connect
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }

    pub fn control(&self) -> Arc<ControlLoop> {
        self.control.clone()
    }

    pub fn transport(&self) -> Arc<TransportManager> {
        self.transport.clone()
    }

    /// Process commands until `Command::Shutdown` or the sender is dropped
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Result<(), RuntimeError> {
        info!(
            "Runtime started: {:?} profile, {:?} input, {}ms ramp tick",
            self.settings.profile,
            self.control.mode(),
            self.tick_period.as_millis()
        );
        if self.control.mode().ramps() {
            self.start_ticker();
        }

        let result = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break Ok(()),
                    Some(command) => {
                        if let Err(e) = self.handle_command(command).await {
                            break Err(e);
                        }
                    }
                },
                Some(event) = self.transport_events.recv() => {
                    if let Err(e) = self.handle_transport_event(event).await {
                        break Err(e);
                    }
                }
            }
        };

        self.shutdown().await;
        result
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), RuntimeError> {
        debug!("Command: {:?}", command);
        match command {
            Command::PointerMoved { offset } => {
                let dispatch = self.control.pointer_moved(offset);
                self.report(&dispatch)
            }
            Command::PointerReleased => {
                let dispatch = self.control.pointer_released();
                self.report(&dispatch)
            }
            Command::SetSpeed { speed } => {
                let dispatch = self.control.set_speed(speed);
                self.report(&dispatch)
            }
            Command::Brake { engaged } => {
                let dispatch = self.control.set_brake(engaged);
                self.report(&dispatch)
            }
            Command::SetLimit { position } => {
                let (limit, dispatch) = self.control.set_limit(position);
                self.emit(Event::LimitChanged {
                    percent: limit.percent(),
                })?;
                self.report(&dispatch)
            }
            Command::SelectMode { mode } => self.select_mode(mode).await,
            Command::ConnectSerial { port, baud_rate } => {
                self.connect_serial(port, baud_rate).await
            }
            Command::ListenUdp => self.listen_udp().await,
            Command::Disconnect => {
                self.transport.disconnect().await;
                self.emit(Event::diagnostic("Disconnected"))
            }
            Command::RefreshPorts => {
                let ports = tokio::task::spawn_blocking(list_available_ports)
                    .await
                    .unwrap_or_default();
                self.emit(Event::Ports { ports })
            }
            Command::Shutdown => Ok(()),
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<(), RuntimeError> {
        match event {
            TransportEvent::Line { session, line } => {
                // Lines still queued from a transport that has since been replaced
                if !self.transport.is_current(session).await {
                    debug!("Dropping line from closed session {}: {}", session, line);
                    return Ok(());
                }
                match classify(line) {
                    Inbound::Telemetry(line) => self.emit(Event::Telemetry { line }),
                    Inbound::Noise(text) => {
                        debug!("Noise: {}", text);
                        self.emit(Event::Diagnostic { text })
                    }
                }
            }
            TransportEvent::StateChanged(state) => self.emit(Event::ConnectionState { state }),
            TransportEvent::ReaderStopped { session } => {
                if self.transport.reader_stopped(session).await {
                    self.emit(Event::diagnostic("Connection lost: inbound reader stopped"))
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn select_mode(&mut self, mode: InputMode) -> Result<(), RuntimeError> {
        if self.control.mode() == mode {
            return Ok(());
        }
        info!("Input mode: {:?}", mode);
        self.ticker.stop().await;
        let dispatch = self.control.set_mode(mode);
        if mode.ramps() {
            self.start_ticker();
        }
        self.report(&dispatch)
    }

    async fn connect_serial(
        &mut self,
        port: Option<String>,
        baud_rate: Option<u32>,
    ) -> Result<(), RuntimeError> {
        let baud_rate = baud_rate.unwrap_or(self.settings.baud_rate);
        let Some(port) = port.or_else(|| self.settings.port.clone()) else {
            return self.emit(Event::diagnostic("No serial port selected"));
        };

        match self.transport.connect_serial(&port, baud_rate).await {
            Ok(()) => {
                self.emit(Event::diagnostic(format!("Connected to {} @ {}", port, baud_rate)))?;
                self.settings.port = Some(port);
                self.settings.baud_rate = baud_rate;
                self.persist();
                let dispatch = self.control.resync();
                self.report(&dispatch)
            }
            Err(e) => self.emit(Event::diagnostic(format!("Connection error: {}", e))),
        }
    }

    async fn listen_udp(&mut self) -> Result<(), RuntimeError> {
        let bind = SocketAddr::from(([0, 0, 0, 0], self.settings.udp_rx_port));
        let result = self
            .transport
            .listen_udp(&self.settings.udp_ip, self.settings.udp_tx_port, bind)
            .await;

        match result {
            Ok(()) => {
                self.emit(Event::diagnostic(format!(
                    "UDP listening on :{}, sending to {}:{}",
                    self.settings.udp_rx_port, self.settings.udp_ip, self.settings.udp_tx_port
                )))?;
                self.persist();
                let dispatch = self.control.resync();
                self.report(&dispatch)
            }
            Err(e) => self.emit(Event::diagnostic(format!("UDP error: {}", e))),
        }
    }

    fn start_ticker(&mut self) {
        self.ticker
            .start(self.control.clone(), self.tick_period, self.events.clone());
    }

    fn persist(&self) {
        if let Some(path) = &self.config_path {
            if let Err(e) = self.settings.save(path) {
                warn!("Failed to save settings: {}", e);
            }
        }
    }

    fn report(&self, dispatch: &Dispatch) -> Result<(), RuntimeError> {
        match dispatch_event(dispatch) {
            Some(event) => self.emit(event),
            None => Ok(()),
        }
    }

    fn emit(&self, event: Event) -> Result<(), RuntimeError> {
        self.events.send(event).map_err(|_| RuntimeError::EventsClosed)
    }

    async fn shutdown(&mut self) {
        info!("Shutting down");
        self.ticker.stop().await;
        self.transport.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::{SurfaceOffset, WheelTarget};
    use crate::transport::ConnectionState;
    use tokio::net::UdpSocket;

    const WAIT: Duration = Duration::from_secs(2);

    async fn device() -> (UdpSocket, Settings) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let settings = Settings {
            udp_ip: "127.0.0.1".into(),
            udp_tx_port: socket.local_addr().unwrap().port(),
            udp_rx_port: 0,
            ..Settings::default()
        };
        (socket, settings)
    }

    async fn recv_packet(socket: &UdpSocket) -> String {
        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(WAIT, socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    async fn wait_for(
        events: &mut UnboundedReceiver<Event>,
        mut wanted: impl FnMut(&Event) -> bool,
    ) -> Event {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = events.recv().await.unwrap();
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_udp_session_end_to_end() {
        let (device, settings) = device().await;
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::channel(16);
        let runtime = Runtime::new(settings, InputMode::Slider, events_tx);
        let transport = runtime.transport();
        let task = tokio::spawn(runtime.run(commands_rx));

        commands.send(Command::ListenUdp).await.unwrap();
        wait_for(&mut events, |e| {
            *e == Event::ConnectionState {
                state: ConnectionState::ListeningUdp,
            }
        })
        .await;
        // Reconnect resends the current (neutral) command
        assert_eq!(recv_packet(&device).await, "TX:0,0,0\n");

        commands.send(Command::SetSpeed { speed: 80 }).await.unwrap();
        commands.send(Command::SetSpeed { speed: 80 }).await.unwrap();
        commands.send(Command::Brake { engaged: true }).await.unwrap();
        assert_eq!(recv_packet(&device).await, "TX:80,80,0\n");
        assert_eq!(recv_packet(&device).await, "TX:80,80,1\n");

        let listen_port = transport.udp_local_addr().await.unwrap().port();
        device
            .send_to(b"RX:80,79\nboot\n", ("127.0.0.1", listen_port))
            .await
            .unwrap();
        let telemetry = wait_for(&mut events, |e| matches!(e, Event::Telemetry { .. })).await;
        assert_eq!(
            telemetry,
            Event::Telemetry {
                line: "RX:80,79".into()
            }
        );
        wait_for(&mut events, |e| *e == Event::diagnostic("boot")).await;

        commands.send(Command::Shutdown).await.unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_ticker_ramps_and_stops_with_surface() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::channel(16);
        let runtime = Runtime::new(Settings::default(), InputMode::Joystick, events_tx)
            .with_tick_period(Duration::from_millis(5));
        let control = runtime.control();
        let task = tokio::spawn(runtime.run(commands_rx));

        commands
            .send(Command::PointerMoved {
                offset: SurfaceOffset::new(0.0, -80.0),
            })
            .await
            .unwrap();
        wait_for(&mut events, |e| {
            *e == Event::WheelSpeeds {
                speeds: WheelTarget::new(255, 255),
            }
        })
        .await;

        commands
            .send(Command::SelectMode {
                mode: InputMode::Slider,
            })
            .await
            .unwrap();
        commands.send(Command::SetSpeed { speed: 40 }).await.unwrap();
        // Once the slider value lands, the ticker has already been joined
        tokio::time::timeout(WAIT, async {
            while control.snapshot().current != WheelTarget::straight(40) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        while events.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, Event::WheelSpeeds { .. }),
                "tick after stop: {:?}",
                event
            );
        }

        commands.send(Command::Shutdown).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_limit_and_missing_port() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::channel(16);
        let runtime = Runtime::new(Settings::default(), InputMode::Slider, events_tx);
        let task = tokio::spawn(runtime.run(commands_rx));

        commands.send(Command::SetLimit { position: 3 }).await.unwrap();
        wait_for(&mut events, |e| *e == Event::LimitChanged { percent: 60 }).await;

        commands
            .send(Command::ConnectSerial {
                port: None,
                baud_rate: None,
            })
            .await
            .unwrap();
        wait_for(&mut events, |e| *e == Event::diagnostic("No serial port selected")).await;

        drop(commands);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_serial_connect_is_reported() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::channel(16);
        let runtime = Runtime::new(Settings::default(), InputMode::Slider, events_tx);
        let transport = runtime.transport();
        let task = tokio::spawn(runtime.run(commands_rx));

        commands
            .send(Command::ConnectSerial {
                port: Some("/dev/does-not-exist-wheel-teleop".into()),
                baud_rate: Some(9600),
            })
            .await
            .unwrap();
        let event = wait_for(&mut events, |e| {
            matches!(e, Event::Diagnostic { text } if text.starts_with("Connection error"))
        })
        .await;
        match event {
            Event::Diagnostic { text } => assert!(text.contains("/dev/does-not-exist-wheel-teleop")),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(transport.state(), ConnectionState::Disconnected);

        commands.send(Command::Shutdown).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropped_event_receiver_ends_runtime() {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::channel(16);
        let runtime = Runtime::new(Settings::default(), InputMode::Slider, events_tx);
        let transport = runtime.transport();
        let task = tokio::spawn(runtime.run(commands_rx));

        drop(events);
        commands.send(Command::SetLimit { position: 2 }).await.unwrap();
        let result = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(result, Err(RuntimeError::EventsClosed)));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    /// Serial stand-in that streams telemetry until dropped
    struct StreamingPort;

    impl std::io::Read for StreamingPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(Duration::from_millis(1));
            let line = b"RX:serial\n";
            let n = line.len().min(buf.len());
            buf[..n].copy_from_slice(&line[..n]);
            Ok(n)
        }
    }

    #[tokio::test]
    async fn test_no_serial_telemetry_after_switch_to_udp() {
        let (_device, settings) = device().await;
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::channel(16);
        let runtime = Runtime::new(settings, InputMode::Slider, events_tx);
        let transport = runtime.transport();
        transport.attach_serial_reader(StreamingPort).await;
        let task = tokio::spawn(runtime.run(commands_rx));

        wait_for(&mut events, |e| matches!(e, Event::Telemetry { .. })).await;
        commands.send(Command::ListenUdp).await.unwrap();
        wait_for(&mut events, |e| {
            matches!(e, Event::Diagnostic { text } if text.starts_with("UDP listening"))
        })
        .await;

        // Everything after the switch comes from the UDP session only
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(&event, Event::Telemetry { line } if line == "RX:serial"),
                "serial telemetry after switch: {:?}",
                event
            );
        }
        assert_eq!(transport.state(), ConnectionState::ListeningUdp);

        commands.send(Command::Shutdown).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ticker_stop_joins_tick_in_flight() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let control = Arc::new(ControlLoop::new(
            Arc::new(TransportManager::new(tx)),
            WireCodec::default(),
            InputMode::Joystick,
            DEFAULT_SURFACE_RADIUS,
        ));
        control.pointer_moved(SurfaceOffset::new(0.0, -80.0));

        let (events_tx, _events) = mpsc::unbounded_channel();
        let mut ticker = RampTicker::default();
        ticker.start(control.clone(), Duration::from_millis(1), events_tx);
        assert!(ticker.is_running());
        tokio::time::sleep(Duration::from_millis(10)).await;
        ticker.stop().await;
        assert!(!ticker.is_running());

        let stopped_at = control.snapshot().current;
        assert_ne!(stopped_at, WheelTarget::zero());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(control.snapshot().current, stopped_at);
    }
}
