//! Inbound network sources.
pub mod udp;

pub use udp::{DatagramSource, UdpReceiver, MAX_DATAGRAM_SIZE};
