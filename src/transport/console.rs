//! Console stand-in for the serial transport.
//!
//! Messages go to stdout in FIFO order and stdin is watched for the reboot command,
//! so the gateway can be run and poked at without any hardware attached. The reboot
//! action here is emulated.

use crate::transport::reboot::{contains_reboot_command, EmulatedReboot, RebootAction};
use crate::transport::{stop_requested, Transport, Workers};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Transport backed by standard input/output.
pub struct ConsoleTransport {
    queue: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
    workers: Workers,
}

impl ConsoleTransport {
    /// Console transport on the process's stdin/stdout.
    pub fn stdio() -> Self {
        Self::with_io(
            tokio::io::stdin(),
            tokio::io::stdout(),
            Arc::new(EmulatedReboot),
        )
    }

    /// Console transport on arbitrary streams.
    pub fn with_io<R, W>(input: R, output: W, reboot: Arc<dyn RebootAction>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!("ConsoleTransport up and running.");
        let workers = Workers::new(vec![
            tokio::spawn(write_to_output(output, queue_rx, shutdown_rx.clone())),
            tokio::spawn(read_from_input(input, reboot, shutdown_rx)),
        ]);

        Self {
            queue: queue_tx,
            shutdown: shutdown_tx,
            workers,
        }
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    fn enqueue(&self, message: String) {
        if self.queue.send(message).is_err() {
            error!("Console writer has stopped; message discarded");
        }
    }

    fn close(&self) {
        self.shutdown.send_replace(true);
    }

    async fn join(&self) {
        self.workers.join().await;
    }

    fn name(&self) -> &'static str {
        "console"
    }
}

impl Drop for ConsoleTransport {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn write_to_output<W>(
    mut output: W,
    mut queue: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin + Send,
{
    while !stop_requested(&shutdown) {
        let message = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = queue.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };

        let written = async {
            output.write_all(message.as_bytes()).await?;
            output.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                info!("Message printed to console.");
                debug!(message = %message.trim_end());
            }
            Err(e) => error!(error = %e, "Cannot write to console"),
        }
    }
}

async fn read_from_input<R>(
    input: R,
    reboot: Arc<dyn RebootAction>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin + Send,
{
    info!("ConsoleTransport read task started. Type to emulate serial input.");
    let mut input = BufReader::new(input);
    let mut line = Vec::new();

    while !stop_requested(&shutdown) {
        let result = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = input.read_until(b'\n', &mut line) => result,
        };

        match result {
            Ok(0) => {
                debug!("Console input closed");
                break;
            }
            Ok(_) => {
                let text = String::from_utf8_lossy(&line).trim().to_string();
                line.clear();
                if contains_reboot_command(&text) {
                    info!("Reboot command received via console.");
                    reboot.trigger();
                }
            }
            Err(e) => {
                error!(error = %e, "Error reading from console input");
                line.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct CountingReboot(AtomicUsize);

    impl RebootAction for CountingReboot {
        fn trigger(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_messages_written_in_order() {
        let (_input_host, input) = tokio::io::duplex(64);
        let (output, mut output_host) = tokio::io::duplex(256);
        let transport =
            ConsoleTransport::with_io(input, output, Arc::new(CountingReboot::default()));

        transport.enqueue("m1\n".to_string());
        transport.enqueue("m2\n".to_string());
        transport.enqueue("m3\n".to_string());

        let mut buf = vec![0u8; 9];
        output_host.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"m1\nm2\nm3\n");

        transport.close();
        transport.join().await;
    }

    #[tokio::test]
    async fn test_reboot_token_on_input() {
        let (mut input_host, input) = tokio::io::duplex(64);
        let (output, _output_host) = tokio::io::duplex(64);
        let reboot = Arc::new(CountingReboot::default());
        let transport = ConsoleTransport::with_io(input, output, reboot.clone());

        input_host
            .write_all(b"please rsh-reboot\nplain\nreboot\nRsh-Reboot\n")
            .await
            .unwrap();
        drop(input_host);

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while reboot.0.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        transport.close();
        transport.join().await;
        assert_eq!(reboot.0.load(Ordering::SeqCst), 2);
    }
}
