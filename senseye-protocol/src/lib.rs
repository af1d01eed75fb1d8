//! Belief data model and wire protocol for the senseye mesh
//!
//! The wire format is newline-delimited JSON over TCP: each frame is one
//! complete message terminated by `\n`. There is no protocol version field;
//! compatibility is maintained by additive fields only.

pub mod belief;
pub mod codec;
pub mod messages;

pub use belief::{Belief, DeviceBelief, LinkBelief, ZoneBelief};
pub use codec::{encode_frame, CodecError, FrameReader, FrameWriter};
pub use messages::WireMessage;

/// Default TCP port of the peer mesh.
pub const DEFAULT_PORT: u16 = 5483;

/// mDNS service type published by every node.
pub const SERVICE_TYPE: &str = "_senseye._tcp.local.";
