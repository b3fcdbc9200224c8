//! Wire protocol spoken between lproxy tunnels and the remote gateway
//!
//! Each tunnel is a single WebSocket session. Logical TCP/UDP connections are
//! multiplexed over it as JSON frames tagged with a per-tunnel stream ID.

mod codec;
mod messages;

pub use codec::{CodecError, TunnelCodec, MAX_FRAME_SIZE};
pub use messages::{ClientFrame, GatewayFrame, StreamKind, TargetAddr};
