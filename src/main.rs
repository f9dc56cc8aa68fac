mod teleop;

use std::path::PathBuf;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use wheel_teleop::config::{DEFAULT_CONFIG_FILE, DEFAULT_SURFACE_RADIUS, Settings};
use wheel_teleop::messages::Event;
use wheel_teleop::protocol::Profile;
use wheel_teleop::runtime::Runtime;
use wheel_teleop::state::InputMode;
use wheel_teleop::transport::list_available_ports;

#[derive(Parser, Debug)]
#[command(
    name = "wheel-teleop",
    about = "Drive a two-wheel motor controller over serial or UDP"
)]
struct Cli {
    /// Settings file (JSON)
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Packet profile; overrides the saved one
    #[arg(long, value_enum)]
    profile: Option<Profile>,
    /// Input mode at startup
    #[arg(long, value_enum, default_value_t = InputMode::Joystick)]
    mode: InputMode,
    /// Serial port; overrides the saved one
    #[arg(long)]
    port: Option<String>,
    /// Serial baud rate; overrides the saved one
    #[arg(long)]
    baud: Option<u32>,
    /// Print available serial ports and exit
    #[arg(long, default_value_t = false)]
    list_ports: bool,
    /// Print events as JSON lines
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug); stderr keeps stdout for the surface
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init();

    let cli = Cli::parse();
    let ports = list_available_ports();
    if cli.list_ports {
        for port in &ports {
            println!("{}", port);
        }
        return;
    }

    let mut settings = Settings::load_or_default(&cli.config);
    settings.sanitize(&ports);
    if let Some(profile) = cli.profile {
        settings.profile = profile;
    }
    if let Some(port) = cli.port {
        settings.port = Some(port);
    }
    if let Some(baud) = cli.baud {
        settings.baud_rate = baud;
    }

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (commands, commands_rx) = mpsc::channel(64);
    let runtime = Runtime::new(settings, cli.mode, events_tx).with_config_path(&cli.config);
    let runtime_task = tokio::spawn(runtime.run(commands_rx));

    let json = cli.json;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event, json);
        }
    });

    let surface = tokio::task::spawn_blocking(move || {
        teleop::run(commands, cli.mode, DEFAULT_SURFACE_RADIUS)
    });
    if let Ok(Err(e)) = surface.await {
        eprintln!("Operator surface error: {}", e);
    }

    match runtime_task.await {
        Ok(Ok(())) => info!("Stopped"),
        Ok(Err(e)) => {
            eprintln!("Runtime error: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Runtime task failed: {}", e);
            std::process::exit(1);
        }
    }
}

// Raw mode needs explicit carriage returns
fn print_event(event: &Event, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            print!("{}\r\n", line);
        }
        return;
    }
    match event {
        Event::Telemetry { line } => print!("{}\r\n", line),
        Event::Diagnostic { text } => print!("# {}\r\n", text),
        Event::ConnectionState { state } => print!("# state: {:?}\r\n", state),
        Event::PacketSent { packet } => print!("> {}\r\n", packet),
        Event::LimitChanged { percent } => print!("# power: {}%\r\n", percent),
        Event::Ports { ports } => print!("# ports: {}\r\n", ports.join(", ")),
        Event::WheelSpeeds { .. } => {}
    }
}
