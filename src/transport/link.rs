//! Byte-stream link abstraction for the serial transport.
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//! - [`LinkOpener`]: Capability to discover and open a fresh link
//! - [`SerialLinkOpener`]: Real hardware, found by USB vid/pid and opened with `tokio-serial`
//!
//! The transport only ever sees a [`DynSerial`], which is what makes it possible to
//! drive the worker loops in tests with `tokio::io::duplex` instead of a device.

use crate::config::SerialSettings;
use crate::error::{GatewayError, GatewayResult};
use crate::transport::discovery::{find_device, PortEnumerator};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial link. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Opens a fresh link each time the writer loop reconnects.
#[async_trait]
pub trait LinkOpener: Send + Sync {
    /// Run discovery and open the link.
    async fn open(&self) -> GatewayResult<DynSerial>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Serial line parameters resolved from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineParameters {
    /// Baud rate
    pub baud_rate: u32,
    /// Character size
    pub data_bits: tokio_serial::DataBits,
    /// Parity
    pub parity: tokio_serial::Parity,
    /// Stop bits
    pub stop_bits: tokio_serial::StopBits,
}

impl LineParameters {
    /// Map validated configuration values to `tokio-serial` settings.
    pub fn from_settings(settings: &SerialSettings) -> GatewayResult<Self> {
        let data_bits = match settings.bytesize {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            other => {
                return Err(GatewayError::Configuration(format!(
                    "Invalid bytesize {other}"
                )))
            }
        };
        let parity = match settings.parity.to_uppercase().as_str() {
            "N" => tokio_serial::Parity::None,
            "E" => tokio_serial::Parity::Even,
            "O" => tokio_serial::Parity::Odd,
            other => {
                return Err(GatewayError::Configuration(format!(
                    "Invalid parity '{other}'"
                )))
            }
        };
        let stop_bits = match settings.stopbits {
            1 => tokio_serial::StopBits::One,
            2 => tokio_serial::StopBits::Two,
            other => {
                return Err(GatewayError::Configuration(format!(
                    "Invalid stopbits {other}"
                )))
            }
        };

        Ok(Self {
            baud_rate: settings.baudrate,
            data_bits,
            parity,
            stop_bits,
        })
    }
}

/// Opens the USB serial device matching the configured vendor/product id.
pub struct SerialLinkOpener {
    vid: u16,
    pid: u16,
    line: LineParameters,
    enumerator: Arc<dyn PortEnumerator>,
}

impl SerialLinkOpener {
    /// Build an opener from configuration.
    pub fn new(
        settings: &SerialSettings,
        enumerator: Arc<dyn PortEnumerator>,
    ) -> GatewayResult<Self> {
        Ok(Self {
            vid: settings.vendor_id.value()?,
            pid: settings.product_id.value()?,
            line: LineParameters::from_settings(settings)?,
            enumerator,
        })
    }
}

#[async_trait]
impl LinkOpener for SerialLinkOpener {
    async fn open(&self) -> GatewayResult<DynSerial> {
        use tokio::task::spawn_blocking;
        use tokio_serial::SerialPortBuilderExt;

        let device = find_device(self.enumerator.as_ref(), self.vid, self.pid)?;
        let line = self.line;
        debug!(device = %device, baud = line.baud_rate, "Opening serial port");

        // No read timeout: the reader awaits lines indefinitely.
        let port_path = device.clone();
        let stream = spawn_blocking(move || {
            tokio_serial::new(&port_path, line.baud_rate)
                .data_bits(line.data_bits)
                .parity(line.parity)
                .stop_bits(line.stop_bits)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
        })
        .await
        .map_err(|e| GatewayError::SerialOpen {
            port: device.clone(),
            reason: format!("open task failed: {e}"),
        })?
        .map_err(|e| GatewayError::SerialOpen {
            port: device.clone(),
            reason: e.to_string(),
        })?;

        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!(
            "usb {:04x}:{:04x} @ {} baud",
            self.vid, self.pid, self.line.baud_rate
        )
    }
}
