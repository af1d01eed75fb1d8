//! Wire message types exchanged between mesh peers.

use serde::{Deserialize, Serialize};

use senseye_common::{NodeId, NodeRole};

use crate::belief::Belief;

/// A mesh wire message.
///
/// Serialized as internally-tagged JSON (`"type"` field). Unknown message
/// types fail to decode and are dropped by the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Connection handshake: identifies the connecting node.
    Announce {
        /// Connecting node id
        node_id: NodeId,
        /// Node role
        role: NodeRole,
        /// Known position `[x, y]` for fixed anchors
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<[f64; 2]>,
    },
    /// Gossiped belief (heartbeat and relay payload).
    Belief(Belief),
    /// Request the peer to emit a chirp after `delay_s`.
    AcousticPing {
        /// Correlation id echoed in the pong
        request_id: u64,
        /// Seconds the peer should wait before chirping
        delay_s: f64,
        /// Audio sample rate (Hz)
        sample_rate: u32,
        /// Chirp start frequency (Hz)
        freq_start: u32,
        /// Chirp end frequency (Hz)
        freq_end: u32,
        /// Chirp duration (seconds)
        chirp_duration: f64,
    },
    /// Response to an acoustic ping.
    AcousticPong {
        /// Correlation id from the ping
        request_id: u64,
        /// Whether the chirp was played
        ok: bool,
        /// Failure description when `ok` is false
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl WireMessage {
    /// Short type name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Announce { .. } => "announce",
            WireMessage::Belief(_) => "belief",
            WireMessage::AcousticPing { .. } => "acoustic_ping",
            WireMessage::AcousticPong { .. } => "acoustic_pong",
        }
    }
}
