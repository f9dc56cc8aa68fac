// Control loop: every state change goes through `update`
//
// 1. Lock the command state and apply the mutation
// 2. Encode the packet and compare it with the last one sent
// 3. Lock the link before releasing the state, so packets leave in order
// 4. Send and log outside the state lock

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::drive::{PowerLimit, SpeedRamper, SurfaceOffset, WheelTarget, mixer};
use crate::protocol::{Packet, WireCodec};
use crate::state::{CommandState, InputMode};
use crate::transport::{Delivery, TransportError, TransportManager};

/// Result of pushing a state change toward the controller
#[derive(Debug)]
pub enum Dispatch {
    /// Packet identical to the last one sent; nothing transmitted
    Unchanged,
    /// Input came from a producer that does not own the wheels in the current mode
    Ignored,
    Sent { packet: Packet, via: Delivery },
    /// No transport open; a reconnect resends the current state
    NotOpen(Packet),
    Failed {
        packet: Packet,
        error: TransportError,
    },
}

impl Dispatch {
    pub fn sent_packet(&self) -> Option<&Packet> {
        match self {
            Dispatch::Sent { packet, .. } => Some(packet),
            _ => None,
        }
    }
}

pub struct ControlLoop {
    state: Mutex<CommandState>,
    codec: WireCodec,
    ramper: SpeedRamper,
    radius: f32,
    transport: Arc<TransportManager>,
}

impl ControlLoop {
    pub fn new(
        transport: Arc<TransportManager>,
        codec: WireCodec,
        mode: InputMode,
        radius: f32,
    ) -> Self {
        Self {
            state: Mutex::new(CommandState::new(mode)),
            codec,
            ramper: SpeedRamper::default(),
            radius,
            transport,
        }
    }

    pub fn with_ramper(mut self, ramper: SpeedRamper) -> Self {
        self.ramper = ramper;
        self
    }

    pub fn snapshot(&self) -> CommandState {
        self.lock_state().clone()
    }

    pub fn mode(&self) -> InputMode {
        self.lock_state().mode
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    /// Pointer moved on the control surface (joystick mode)
    pub fn pointer_moved(&self, offset: SurfaceOffset) -> Dispatch {
        let target = mixer::map(offset, self.radius);
        self.drive(InputMode::Joystick, target)
    }

    /// Pointer released: spring back to center
    pub fn pointer_released(&self) -> Dispatch {
        self.drive(InputMode::Joystick, WheelTarget::zero())
    }

    /// Single-axis speed (slider mode); 0 on release
    pub fn set_speed(&self, speed: i32) -> Dispatch {
        self.drive(InputMode::Slider, WheelTarget::straight(speed))
    }

    pub fn set_brake(&self, engaged: bool) -> Dispatch {
        self.update(|state| state.brake = engaged).1
    }

    /// Select a power-limit position (1..=5)
    pub fn set_limit(&self, position: u8) -> (PowerLimit, Dispatch) {
        self.update(|state| {
            state.limit = PowerLimit::from_position(position);
            state.limit
        })
    }

    /// Switch the producer that owns the wheel targets
    pub fn set_mode(&self, mode: InputMode) -> Dispatch {
        self.update(|state| state.switch_mode(mode)).1
    }

    /// One ramp tick; returns the updated current speeds
    pub fn tick(&self) -> (WheelTarget, Dispatch) {
        self.update(|state| state.ramp(&self.ramper))
    }

    /// Forget the last packet and send the current state again (after a reconnect)
    pub fn resync(&self) -> Dispatch {
        self.update(|state| state.last_sent = None).1
    }

    fn drive(&self, producer: InputMode, target: WheelTarget) -> Dispatch {
        let (accepted, dispatch) = self.update(|state| {
            if state.mode != producer {
                return false;
            }
            state.set_target(target);
            true
        });
        if accepted {
            dispatch
        } else {
            warn!("Ignoring {:?} input while in {:?} mode", producer, self.mode());
            Dispatch::Ignored
        }
    }

    /// Apply a mutation, then transmit the resulting packet if it changed
    ///
    /// An undelivered packet still counts as sent: the same state is not tried
    /// again until it changes or `resync` runs. Writers queue on the state lock
    /// for at most one send, which the port and socket write timeouts bound.
    pub fn update<T>(&self, mutate: impl FnOnce(&mut CommandState) -> T) -> (T, Dispatch) {
        let mut state = self.lock_state();
        let output = mutate(&mut state);
        let packet = self.codec.encode(&state);
        if state.last_sent.as_ref() == Some(&packet) {
            return (output, Dispatch::Unchanged);
        }
        state.last_sent = Some(packet.clone());
        let mut link = self.transport.link();
        drop(state);

        let result = link.send(packet.as_bytes());
        drop(link);

        let dispatch = match result {
            Ok(Delivery::NotOpen) => Dispatch::NotOpen(packet),
            Ok(via) => Dispatch::Sent { packet, via },
            Err(error) => Dispatch::Failed { packet, error },
        };
        match &dispatch {
            Dispatch::Sent { packet, via } => debug!("Sent {} via {:?}", packet, via),
            Dispatch::NotOpen(packet) => debug!("Not connected, dropped {}", packet),
            Dispatch::Failed { packet, error } => warn!("Failed to send {}: {}", packet, error),
            Dispatch::Unchanged | Dispatch::Ignored => {}
        }
        (output, dispatch)
    }

    fn lock_state(&self) -> MutexGuard<'_, CommandState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
