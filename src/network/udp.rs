//! UDP datagram source.
//!
//! Binds the configured address (retrying while the network comes up), receives
//! one datagram per read and keeps a liveness file current so an external watchdog
//! can tell whether data is still arriving.

use crate::config::UdpSettings;
use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Largest datagram accepted; anything longer is truncated by the socket.
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Source of textual datagrams for the gateway loop.
#[async_trait]
pub trait DatagramSource: Send {
    /// Wait for the next datagram.
    ///
    /// Returns `None` when a datagram could not be received or decoded; the caller
    /// skips it and reads again. Must be cancel-safe.
    async fn read(&mut self) -> Option<String>;
}

/// Datagram source bound to a UDP socket.
pub struct UdpReceiver {
    socket: UdpSocket,
    last_seen_file: PathBuf,
    buf: Vec<u8>,
}

impl UdpReceiver {
    /// Bind the configured address.
    ///
    /// The liveness file is written once before binding. Failed binds are retried
    /// every `retry_delay`; once `startup_timeout` has passed the error is fatal.
    pub async fn bind(settings: &UdpSettings) -> GatewayResult<Self> {
        write_last_seen(&settings.udp_last_seen_file);

        let address = settings.bind_address();
        let started = Instant::now();
        let socket = loop {
            match UdpSocket::bind(address.as_str()).await {
                Ok(socket) => break socket,
                Err(e) => {
                    error!(address = %address, error = %e, "Failed to bind UDP socket");
                    if started.elapsed() >= settings.startup_timeout {
                        error!("Network did not initialize within timeout");
                        return Err(GatewayError::NetworkTimeout {
                            address,
                            waited_secs: settings.startup_timeout.as_secs(),
                        });
                    }
                    warn!(
                        retry_in = ?settings.retry_delay,
                        "Network not initialized, retrying"
                    );
                    tokio::time::sleep(settings.retry_delay).await;
                }
            }
        };

        info!(address = %address, "Bound to UDP socket");
        Ok(Self {
            socket,
            last_seen_file: settings.udp_last_seen_file.clone(),
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    /// Address the socket is actually bound to.
    pub fn local_addr(&self) -> GatewayResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl DatagramSource for UdpReceiver {
    async fn read(&mut self) -> Option<String> {
        let len = match self.socket.recv(&mut self.buf).await {
            Ok(len) => len,
            Err(e) => {
                error!(error = %e, "Socket read error");
                return None;
            }
        };

        match std::str::from_utf8(&self.buf[..len]) {
            Ok(text) => {
                debug!(datagram = %text);
                write_last_seen(&self.last_seen_file);
                Some(text.to_string())
            }
            Err(e) => {
                error!(error = %e, "Decoding error while reading UDP packet");
                None
            }
        }
    }
}

/// Overwrite `path` with the current Unix time in float seconds.
fn write_last_seen(path: &Path) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    if let Err(e) = std::fs::write(path, now.to_string()) {
        error!(path = %path.display(), error = %e, "Failed to write last seen timestamp");
    }
}
