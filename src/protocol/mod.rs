// Text protocol spoken with the motor controller
//
// Provides:
// - Outbound packet encoding for the legacy and differential profiles
// - Classification of inbound lines into telemetry and noise

pub mod codec;
pub mod inbound;

pub use codec::{Packet, Profile, WireCodec};
pub use inbound::{Inbound, TELEMETRY_PREFIX, classify};
