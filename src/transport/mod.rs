//! Outbound message transports.
//!
//! A transport accepts summary lines from the gateway loop and delivers them to the
//! downstream consumer in the order they were enqueued. It also watches the inbound
//! direction for the reboot command. Two variants exist, chosen once at startup from
//! configuration:
//!
//! - [`SerialTransport`]: a USB serial device located by vendor/product id, with a
//!   reconnecting writer worker and an independent reader worker.
//! - [`ConsoleTransport`]: stdout/stdin stand-in for running without hardware.

pub mod console;
pub mod discovery;
pub mod link;
pub mod reboot;
pub mod serial;

pub use console::ConsoleTransport;
pub use discovery::{find_device, PortEnumerator, PortInfo, SystemPorts, UsbId};
pub use link::{DynSerial, LinkOpener, SerialLinkOpener};
pub use reboot::{contains_reboot_command, CommandReboot, EmulatedReboot, RebootAction};
pub use serial::{SerialTransport, SerialTransportOptions};

use crate::config::{GatewayConfig, TransportKind};
use crate::error::GatewayResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::error;

/// Common contract of every transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Append a message to the outbound queue. Never blocks.
    fn enqueue(&self, message: String);

    /// Request shutdown of the worker loops. Idempotent.
    fn close(&self);

    /// Wait until the worker loops have exited.
    async fn join(&self);

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Connection state shared by the reader and writer workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// No connection attempt has been made yet.
    Never = 0,
    /// The last attempt succeeded and no failure has been observed since.
    Up = 1,
    /// An attempt failed or a live connection errored.
    Down = 2,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Never => "never",
            ConnectionState::Up => "up",
            ConnectionState::Down => "down",
        };
        f.write_str(s)
    }
}

/// Atomic cell holding a [`ConnectionState`] together with the generation of the
/// link it refers to.
///
/// The writer bumps the generation every time it opens a link. A reader that fails
/// on a link that has since been replaced must not mark the new one `Down`, which is
/// what [`set_down_if_current`](Self::set_down_if_current) guards against.
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU64);

const STATE_MASK: u64 = 0xff;

fn decode_state(raw: u64) -> ConnectionState {
    match raw & STATE_MASK {
        0 => ConnectionState::Never,
        1 => ConnectionState::Up,
        _ => ConnectionState::Down,
    }
}

impl AtomicConnectionState {
    /// New cell in the `Never` state, generation 0.
    pub fn new() -> Self {
        Self(AtomicU64::new(ConnectionState::Never as u64))
    }

    /// Current state.
    pub fn load(&self) -> ConnectionState {
        decode_state(self.0.load(Ordering::Acquire))
    }

    /// Generation of the most recently opened link.
    pub fn generation(&self) -> u64 {
        self.0.load(Ordering::Acquire) >> 8
    }

    /// Mark link `generation` as up.
    pub fn set_up(&self, generation: u64) {
        self.0
            .store((generation << 8) | ConnectionState::Up as u64, Ordering::Release);
    }

    /// Mark the current link down, returning the previous state.
    pub fn set_down(&self) -> ConnectionState {
        let previous = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                Some((raw & !STATE_MASK) | ConnectionState::Down as u64)
            })
            .unwrap_or_else(|raw| raw);
        decode_state(previous)
    }

    /// Mark the link down only if `generation` is still the current link.
    ///
    /// Returns whether the state changed.
    pub fn set_down_if_current(&self, generation: u64) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                (raw >> 8 == generation && decode_state(raw) != ConnectionState::Down)
                    .then_some((raw & !STATE_MASK) | ConnectionState::Down as u64)
            })
            .is_ok()
    }
}

impl Default for AtomicConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether shutdown was requested or the owning transport was dropped.
pub(crate) fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleep for `duration`, waking early on shutdown.
pub(crate) async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) {
    tokio::select! {
        _ = shutdown.changed() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Join handles of a transport's worker tasks.
#[derive(Debug, Default)]
pub(crate) struct Workers(Mutex<Vec<JoinHandle<()>>>);

impl Workers {
    pub(crate) fn new(handles: Vec<JoinHandle<()>>) -> Self {
        Self(Mutex::new(handles))
    }

    /// Wait for every worker; later calls return immediately.
    pub(crate) async fn join(&self) {
        let handles = std::mem::take(&mut *self.0.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Transport worker panicked");
            }
        }
    }
}

/// Construct the configured transport and start its workers.
///
/// Must be called from within a Tokio runtime.
pub fn build(config: &GatewayConfig) -> GatewayResult<Arc<dyn Transport>> {
    match config.transport.kind {
        TransportKind::Serial => {
            let opener = SerialLinkOpener::new(&config.serial, Arc::new(SystemPorts))?;
            let reboot = CommandReboot::new(config.serial.reboot_command.clone());
            Ok(Arc::new(SerialTransport::spawn(
                Arc::new(opener),
                Arc::new(reboot),
                SerialTransportOptions::from_settings(&config.serial),
            )))
        }
        TransportKind::Console => Ok(Arc::new(ConsoleTransport::stdio())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_state_transitions() {
        let state = AtomicConnectionState::default();
        assert_eq!(state.load(), ConnectionState::Never);
        assert_eq!(state.generation(), 0);

        assert_eq!(state.set_down(), ConnectionState::Never);
        assert_eq!(state.load(), ConnectionState::Down);

        state.set_up(1);
        assert_eq!(state.load(), ConnectionState::Up);
        assert_eq!(state.generation(), 1);

        assert_eq!(state.set_down(), ConnectionState::Up);
        assert_eq!(state.load(), ConnectionState::Down);
        assert_eq!(state.generation(), 1);
    }

    #[test]
    fn test_stale_generation_cannot_mark_down() {
        let state = AtomicConnectionState::default();
        state.set_up(1);
        state.set_up(2);

        assert!(!state.set_down_if_current(1));
        assert_eq!(state.load(), ConnectionState::Up);

        assert!(state.set_down_if_current(2));
        assert_eq!(state.load(), ConnectionState::Down);
        assert!(!state.set_down_if_current(2));
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_stop() {
        let (tx, rx) = watch::channel(false);
        assert!(!stop_requested(&rx));
        drop(tx);
        assert!(stop_requested(&rx));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Never.to_string(), "never");
        assert_eq!(ConnectionState::Up.to_string(), "up");
        assert_eq!(ConnectionState::Down.to_string(), "down");
    }
}
