//! # Telemetry Gateway
//!
//! Library behind the `telemetry-gateway` binary. The gateway ingests raw
//! measurement datagrams over UDP, aggregates them over fixed time windows per
//! logical channel and forwards summary statistics as text lines over a USB serial
//! link. An inbound `rsh-reboot` line on the link triggers a host reboot.
//!
//! ## Crate Structure
//!
//! - **`config`**: TOML + environment configuration loaded with `figment`. See
//!   `config::GatewayConfig`.
//! - **`data`**: datagram parsing, per-channel `ChannelBuffer`s, the statistics
//!   engine that produces the wire line, and archival sinks.
//! - **`error`**: the `GatewayError` enum and its severity classification.
//! - **`gateway`**: the orchestration loop tying source, buffers and transport
//!   together.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`network`**: the UDP datagram source with liveness file.
//! - **`transport`**: the `Transport` trait with the reconnecting
//!   `SerialTransport` and the `ConsoleTransport` stand-in, plus USB device
//!   discovery.
//!
//! ## Data flow
//!
//! ```text
//! UDP datagram -> parse_datagram -> ChannelBuffer::add
//!     -> (window elapsed) fetch_and_clear -> summarize -> format_message
//!     -> Transport::enqueue -> writer task -> serial line
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod network;
pub mod transport;

pub use error::{GatewayError, GatewayResult};
