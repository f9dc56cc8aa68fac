// Keyboard operator surface
// Arrows/WASD drive, space toggles brake, 1-5 power limit, m switches input mode,
// c/u/x connect serial / start UDP / disconnect, p lists ports, q quits
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Sender;
use tracing::info;

use wheel_teleop::drive::SurfaceOffset;
use wheel_teleop::messages::Command;
use wheel_teleop::state::InputMode;

const KNOB_STEP: f32 = 20.0; // surface units per key press
const SPEED_STEP: i32 = 15;
const INPUT_TIMEOUT_MS: u64 = 150; // Spring back to center after this much time with no input

pub fn run(commands: Sender<Command>, mode: InputMode, radius: f32) -> std::io::Result<()> {
    info!("Controls: arrows/WASD=drive, space=brake, 1-5=power, m=mode, c/u/x=serial/udp/off, q=quit");

    enable_raw_mode()?;
    let result = run_surface(&commands, mode, radius);
    disable_raw_mode()?;

    let _ = commands.blocking_send(Command::Shutdown);
    result
}

struct Surface {
    mode: InputMode,
    radius: f32,
    knob: SurfaceOffset,
    speed: i32,
    brake: bool,
    held: bool,
}

impl Surface {
    /// Move the knob (joystick) or nudge the speed (slider)
    fn nudge(&mut self, dx: f32, dy: f32) -> Option<Command> {
        self.held = true;
        match self.mode {
            InputMode::Joystick => {
                self.knob = SurfaceOffset::new(self.knob.dx + dx, self.knob.dy + dy).clamped(self.radius);
                Some(Command::PointerMoved { offset: self.knob })
            }
            InputMode::Slider if dy != 0.0 => {
                let delta = if dy < 0.0 { SPEED_STEP } else { -SPEED_STEP };
                self.speed = (self.speed + delta).clamp(-255, 255);
                Some(Command::SetSpeed { speed: self.speed })
            }
            InputMode::Slider => None,
        }
    }

    /// Knob and targets return to center together
    fn release(&mut self) -> Command {
        self.held = false;
        self.knob = SurfaceOffset::default();
        self.speed = 0;
        match self.mode {
            InputMode::Joystick => Command::PointerReleased,
            InputMode::Slider => Command::SetSpeed { speed: 0 },
        }
    }

    fn toggle_mode(&mut self) -> Command {
        self.mode = match self.mode {
            InputMode::Joystick => InputMode::Slider,
            InputMode::Slider => InputMode::Joystick,
        };
        self.held = false;
        self.knob = SurfaceOffset::default();
        self.speed = 0;
        info!("Input mode: {:?}", self.mode);
        Command::SelectMode { mode: self.mode }
    }
}

fn run_surface(commands: &Sender<Command>, mode: InputMode, radius: f32) -> std::io::Result<()> {
    let mut surface = Surface {
        mode,
        radius,
        knob: SurfaceOffset::default(),
        speed: 0,
        brake: false,
        held: false,
    };
    let mut last_input = Instant::now();

    loop {
        let mut outgoing = None;

        // Poll for key with 20ms timeout
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                outgoing = match code {
                    KeyCode::Up | KeyCode::Char('w') if pressed => {
                        last_input = Instant::now();
                        surface.nudge(0.0, -KNOB_STEP)
                    }
                    KeyCode::Down | KeyCode::Char('s') if pressed => {
                        last_input = Instant::now();
                        surface.nudge(0.0, KNOB_STEP)
                    }
                    KeyCode::Left | KeyCode::Char('a') if pressed => {
                        last_input = Instant::now();
                        surface.nudge(-KNOB_STEP, 0.0)
                    }
                    KeyCode::Right | KeyCode::Char('d') if pressed => {
                        last_input = Instant::now();
                        surface.nudge(KNOB_STEP, 0.0)
                    }

                    // Terminals rarely report key release, so brake toggles
                    KeyCode::Char(' ') if pressed => {
                        surface.brake = !surface.brake;
                        Some(Command::Brake {
                            engaged: surface.brake,
                        })
                    }
                    KeyCode::Char(c @ '1'..='5') if pressed => Some(Command::SetLimit {
                        position: c as u8 - b'0',
                    }),
                    KeyCode::Char('m') if pressed => Some(surface.toggle_mode()),

                    KeyCode::Char('c') if pressed => Some(Command::ConnectSerial {
                        port: None,
                        baud_rate: None,
                    }),
                    KeyCode::Char('u') if pressed => Some(Command::ListenUdp),
                    KeyCode::Char('x') if pressed => Some(Command::Disconnect),
                    KeyCode::Char('p') if pressed => Some(Command::RefreshPorts),

                    // Quit
                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => None,
                };
            }
        }

        if outgoing.is_none()
            && surface.held
            && last_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS)
        {
            outgoing = Some(surface.release());
        }

        if let Some(command) = outgoing {
            if commands.blocking_send(command).is_err() {
                break;
            }
        }
    }

    Ok(())
}
