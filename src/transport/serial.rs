//! Resilient serial transport.
//!
//! [`SerialTransport`] owns two long-lived Tokio tasks:
//!
//! - the **writer**, the only task that opens or closes links. While the link is
//!   `Up` it waits on the outbound queue and writes each message. Otherwise it
//!   closes any stale link, runs discovery, opens the port and on failure sleeps a
//!   fixed backoff before trying again, forever.
//! - the **reader**, which consumes lines from the read half of the current link and
//!   fires the reboot action when a line carries the reboot token. It never reopens
//!   the port; when the link is not `Up` it just polls.
//!
//! Each opened link is split in two. The writer keeps the write half; the read half
//! is handed to the reader over a channel, so neither task can touch the other's
//! half of the handle. The device stays open until both halves are dropped, so
//! before reopening the writer waits for the reader to report the old half released.
//!
//! ```text
//!  enqueue() ──► [ unbounded FIFO ] ──► writer ──► WriteHalf ─┐
//!                                        │ open/close          ├─ link
//!                      reader ◄── ReadHalf ◄── handoff ◄───────┘
//! ```

use crate::config::{DeliveryPolicy, SerialSettings};
use crate::transport::link::{DynSerial, LinkOpener};
use crate::transport::reboot::{contains_reboot_command, RebootAction};
use crate::transport::{
    sleep_or_shutdown, stop_requested, AtomicConnectionState, ConnectionState, Transport, Workers,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

/// Tuning knobs for the worker loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialTransportOptions {
    /// Fixed delay after a failed open attempt
    pub reconnect_delay: Duration,
    /// How often the reader re-checks the connection state
    pub reader_poll_interval: Duration,
    /// Fate of a message whose write failed
    pub delivery: DeliveryPolicy,
}

impl Default for SerialTransportOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            reader_poll_interval: Duration::from_secs(1),
            delivery: DeliveryPolicy::AtMostOnce,
        }
    }
}

impl SerialTransportOptions {
    /// Options from the `[serial]` configuration section.
    pub fn from_settings(settings: &SerialSettings) -> Self {
        Self {
            reconnect_delay: settings.reconnect_delay,
            reader_poll_interval: settings.reader_poll_interval,
            delivery: settings.delivery,
        }
    }

    /// Set the reconnect delay
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the reader poll interval
    pub fn with_reader_poll_interval(mut self, interval: Duration) -> Self {
        self.reader_poll_interval = interval;
        self
    }

    /// Set the delivery policy
    pub fn with_delivery(mut self, delivery: DeliveryPolicy) -> Self {
        self.delivery = delivery;
        self
    }
}

/// Read half of a link, tagged with the generation it was opened as.
struct Handoff {
    generation: u64,
    half: ReadHalf<DynSerial>,
}

/// Serial transport with automatic reconnection.
pub struct SerialTransport {
    queue: mpsc::UnboundedSender<String>,
    state: Arc<AtomicConnectionState>,
    shutdown: watch::Sender<bool>,
    workers: Workers,
}

impl SerialTransport {
    /// Start the reader and writer workers.
    ///
    /// Must be called from within a Tokio runtime. No connection is attempted
    /// before the writer task first runs, so the state starts as `Never`.
    pub fn spawn(
        opener: Arc<dyn LinkOpener>,
        reboot: Arc<dyn RebootAction>,
        options: SerialTransportOptions,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();
        let (released_tx, released_rx) = watch::channel(0);
        let state = Arc::new(AtomicConnectionState::new());
        let link_lost = Arc::new(Notify::new());

        let writer = WriterLoop {
            opener,
            queue: queue_rx,
            state: state.clone(),
            shutdown: shutdown_rx.clone(),
            handoff: handoff_tx,
            options,
            link_lost: link_lost.clone(),
            released: released_rx,
            link: None,
            in_flight: None,
        };
        let reader = ReaderLoop {
            state: state.clone(),
            shutdown: shutdown_rx,
            handoff: handoff_rx,
            reboot,
            poll_interval: options.reader_poll_interval,
            link_lost,
            released: released_tx,
            link: None,
        };

        let workers = Workers::new(vec![
            tokio::spawn(writer.run()),
            tokio::spawn(reader.run()),
        ]);

        Self {
            queue: queue_tx,
            state,
            shutdown: shutdown_tx,
            workers,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn enqueue(&self, message: String) {
        if self.queue.send(message).is_err() {
            warn!("Serial writer has stopped; message discarded");
        } else {
            debug!("Message put in transmission queue.");
        }
    }

    fn close(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Serial transport shutdown requested");
        }
    }

    async fn join(&self) {
        self.workers.join().await;
    }

    fn name(&self) -> &'static str {
        "serial"
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

struct WriterLoop {
    opener: Arc<dyn LinkOpener>,
    queue: mpsc::UnboundedReceiver<String>,
    state: Arc<AtomicConnectionState>,
    shutdown: watch::Receiver<bool>,
    handoff: mpsc::UnboundedSender<Handoff>,
    options: SerialTransportOptions,
    /// Wakes the reader when a write fails on the current link.
    link_lost: Arc<Notify>,
    /// Highest generation whose read half the reader has dropped.
    released: watch::Receiver<u64>,
    link: Option<WriteHalf<DynSerial>>,
    /// Message to write before the next one is taken from the queue.
    in_flight: Option<String>,
}

impl WriterLoop {
    async fn run(mut self) {
        info!(link = %self.opener.describe(), "Serial writer started");

        while !stop_requested(&self.shutdown) {
            if self.state.load() != ConnectionState::Up {
                self.reopen().await;
                continue;
            }

            let message = match self.in_flight.take() {
                Some(message) => message,
                None => tokio::select! {
                    biased;
                    _ = self.shutdown.changed() => break,
                    next = self.queue.recv() => match next {
                        Some(message) => message,
                        None => break,
                    },
                    // Notice a link lost by the reader even when nothing is queued.
                    _ = tokio::time::sleep(self.options.reader_poll_interval) => continue,
                },
            };

            // The reader may have lost the link while the queue was empty.
            if self.state.load() != ConnectionState::Up {
                self.in_flight = Some(message);
                continue;
            }
            self.write(message).await;
        }

        self.close_link().await;
        info!("Serial writer stopped");
    }

    async fn write(&mut self, message: String) {
        let Some(link) = self.link.as_mut() else {
            // Never written, so it is retried regardless of the delivery policy.
            self.state.set_down();
            self.in_flight = Some(message);
            return;
        };

        match write_message(link, &message).await {
            Ok(()) => {
                info!("Message written to serial connection.");
                debug!(message = %message.trim_end());
            }
            Err(e) => {
                error!(error = %e, "Cannot write to serial device.");
                self.state.set_down();
                self.link_lost.notify_one();
                match self.options.delivery {
                    DeliveryPolicy::AtMostOnce => {
                        warn!(message = %message.trim_end(), "Message lost with the connection");
                    }
                    DeliveryPolicy::AtLeastOnce => self.in_flight = Some(message),
                }
            }
        }
    }

    async fn reopen(&mut self) {
        if let Some(generation) = self.close_link().await {
            self.await_release(generation).await;
        }

        match self.opener.open().await {
            Ok(stream) => {
                let generation = self.state.generation() + 1;
                let (read_half, write_half) = tokio::io::split(stream);
                self.link = Some(write_half);
                // Up before the handoff, so the reader never takes its new link for stale.
                self.state.set_up(generation);
                if self
                    .handoff
                    .send(Handoff {
                        generation,
                        half: read_half,
                    })
                    .is_err()
                {
                    debug!("Serial reader has stopped; read half dropped");
                }
                info!(generation, "Serial connection is up and running!");
            }
            Err(e) => {
                let previous = self.state.set_down();
                warn!(
                    error = %e,
                    previous = %previous,
                    retry_in = ?self.options.reconnect_delay,
                    "Cannot open serial port! Retrying."
                );
                sleep_or_shutdown(&mut self.shutdown, self.options.reconnect_delay).await;
            }
        }
    }

    /// Shut down and drop the write half, returning the generation it belonged to.
    async fn close_link(&mut self) -> Option<u64> {
        let mut link = self.link.take()?;
        if let Err(e) = link.shutdown().await {
            debug!(error = %e, "Error while shutting down stale serial link");
        }
        drop(link);
        info!("Serial connection closed.");
        Some(self.state.generation())
    }

    /// Wait up to one reader poll interval for the reader to drop its half of link
    /// `generation`. Serial devices are opened exclusively.
    async fn await_release(&mut self, generation: u64) {
        let released = &mut self.released;
        let wait = tokio::time::timeout(self.options.reader_poll_interval, async move {
            released.wait_for(|r| *r >= generation).await.is_ok()
        });

        tokio::select! {
            biased;
            _ = self.shutdown.changed() => {}
            result = wait => {
                if result.is_err() {
                    debug!(generation, "Reader still holds the previous link");
                }
            }
        }
    }
}

async fn write_message(link: &mut WriteHalf<DynSerial>, message: &str) -> std::io::Result<()> {
    link.write_all(message.as_bytes()).await?;
    link.flush().await
}

struct ReaderLoop {
    state: Arc<AtomicConnectionState>,
    shutdown: watch::Receiver<bool>,
    handoff: mpsc::UnboundedReceiver<Handoff>,
    reboot: Arc<dyn RebootAction>,
    poll_interval: Duration,
    link_lost: Arc<Notify>,
    released: watch::Sender<u64>,
    link: Option<(u64, BufReader<ReadHalf<DynSerial>>)>,
}

enum ReadEvent {
    Shutdown,
    NewLink(Option<Handoff>),
    Line(u64, std::io::Result<usize>),
    Recheck,
}

impl ReaderLoop {
    async fn run(mut self) {
        info!("Serial reader started");
        let mut line = Vec::new();

        while !stop_requested(&self.shutdown) {
            while let Ok(handoff) = self.handoff.try_recv() {
                self.adopt(handoff, &mut line);
            }

            let up = self.state.load() == ConnectionState::Up;
            if !up {
                // Release a stale read half so the writer can reopen the device. A link
                // newer than the state was handed over ahead of its `Up` and is kept.
                let current = self.state.generation();
                if matches!(&self.link, Some((generation, _)) if *generation <= current) {
                    self.release();
                    line.clear();
                }
            }

            let event = match self.link.as_mut() {
                Some((generation, reader)) if up => {
                    let generation = *generation;
                    tokio::select! {
                        biased;
                        _ = self.shutdown.changed() => ReadEvent::Shutdown,
                        next = self.handoff.recv() => ReadEvent::NewLink(next),
                        result = reader.read_until(b'\n', &mut line) => {
                            ReadEvent::Line(generation, result)
                        }
                        _ = self.link_lost.notified() => ReadEvent::Recheck,
                        _ = tokio::time::sleep(self.poll_interval) => ReadEvent::Recheck,
                    }
                }
                _ => tokio::select! {
                    biased;
                    _ = self.shutdown.changed() => ReadEvent::Shutdown,
                    next = self.handoff.recv() => ReadEvent::NewLink(next),
                    _ = self.link_lost.notified() => ReadEvent::Recheck,
                    _ = tokio::time::sleep(self.poll_interval) => ReadEvent::Recheck,
                },
            };

            match event {
                ReadEvent::Shutdown => break,
                ReadEvent::NewLink(Some(handoff)) => self.adopt(handoff, &mut line),
                ReadEvent::NewLink(None) => break,
                ReadEvent::Recheck => {}
                ReadEvent::Line(generation, Ok(0)) => {
                    warn!("Serial connection closed by peer.");
                    self.lose_link(generation, &mut line);
                }
                ReadEvent::Line(_, Ok(_)) => {
                    let text = String::from_utf8_lossy(&line).trim().to_string();
                    line.clear();
                    self.handle_line(&text);
                }
                ReadEvent::Line(generation, Err(e)) => {
                    error!(error = %e, "Cannot read from serial device.");
                    self.lose_link(generation, &mut line);
                }
            }
        }

        info!("Serial reader stopped");
    }

    fn adopt(&mut self, handoff: Handoff, line: &mut Vec<u8>) {
        debug!(generation = handoff.generation, "Reader switched to new link");
        self.release();
        self.link = Some((handoff.generation, BufReader::new(handoff.half)));
        line.clear();
    }

    /// Drop the current read half and report its generation to the writer.
    fn release(&mut self) {
        let Some((generation, reader)) = self.link.take() else {
            return;
        };
        drop(reader);
        self.released.send_replace(generation);
    }

    fn lose_link(&mut self, generation: u64, line: &mut Vec<u8>) {
        self.release();
        line.clear();
        if !self.state.set_down_if_current(generation) {
            debug!(generation, "Ignoring failure of a replaced link");
        }
    }

    fn handle_line(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        info!(line = %text, "Command received via serial connection.");
        if contains_reboot_command(text) {
            info!("Reboot command received over serial.");
            self.reboot.trigger();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GatewayError, GatewayResult};
    use parking_lot::Mutex;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio::time::timeout;

    struct NeverOpens {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl LinkOpener for NeverOpens {
        async fn open(&self) -> GatewayResult<DynSerial> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::DeviceNotFound {
                vid: 0x1234,
                pid: 0x5678,
            })
        }

        fn describe(&self) -> String {
            "nothing".to_string()
        }
    }

    struct NoReboot;

    impl RebootAction for NoReboot {
        fn trigger(&self) {}
    }

    #[derive(Default)]
    struct CountingReboot(AtomicUsize);

    impl RebootAction for CountingReboot {
        fn trigger(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A device that can be open only once at a time. Writes always fail.
    struct ExclusiveLink {
        in_use: Arc<AtomicBool>,
    }

    impl Drop for ExclusiveLink {
        fn drop(&mut self) {
            self.in_use.store(false, Ordering::SeqCst);
        }
    }

    impl AsyncRead for ExclusiveLink {
        fn poll_read(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for ExclusiveLink {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Opens an [`ExclusiveLink`] first, then the spare link. Opening while the
    /// exclusive device is still held fails as busy.
    struct ExclusiveOpener {
        in_use: Arc<AtomicBool>,
        opened: AtomicUsize,
        busy: AtomicUsize,
        spare: Mutex<Option<DynSerial>>,
    }

    #[async_trait]
    impl LinkOpener for ExclusiveOpener {
        async fn open(&self) -> GatewayResult<DynSerial> {
            if self.in_use.load(Ordering::SeqCst) {
                self.busy.fetch_add(1, Ordering::SeqCst);
                return Err(GatewayError::SerialOpen {
                    port: "exclusive".to_string(),
                    reason: "device busy".to_string(),
                });
            }
            if self.opened.fetch_add(1, Ordering::SeqCst) == 0 {
                self.in_use.store(true, Ordering::SeqCst);
                return Ok(Box::new(ExclusiveLink {
                    in_use: self.in_use.clone(),
                }));
            }
            self.spare
                .lock()
                .take()
                .ok_or(GatewayError::DeviceNotFound {
                    vid: 0x1234,
                    pid: 0x5678,
                })
        }

        fn describe(&self) -> String {
            "exclusive".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_fixed_and_unbounded() {
        let opener = Arc::new(NeverOpens {
            attempts: AtomicUsize::new(0),
        });
        let transport = SerialTransport::spawn(
            opener.clone(),
            Arc::new(NoReboot),
            SerialTransportOptions::default().with_reconnect_delay(Duration::from_secs(1)),
        );

        // First attempt happens immediately, then one per second.
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        let attempts = opener.attempts.load(Ordering::SeqCst);
        assert!((10..=12).contains(&attempts), "attempts = {attempts}");
        assert_eq!(transport.state(), ConnectionState::Down);

        transport.close();
        transport.join().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = SerialTransport::spawn(
            Arc::new(NeverOpens {
                attempts: AtomicUsize::new(0),
            }),
            Arc::new(NoReboot),
            SerialTransportOptions::default(),
        );
        transport.close();
        transport.close();
        transport.join().await;
        transport.join().await;
        assert_eq!(transport.name(), "serial");
    }

    #[tokio::test]
    async fn test_reader_keeps_link_handed_over_before_up() {
        let state = Arc::new(AtomicConnectionState::new());
        state.set_down();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();
        let (released_tx, _released_rx) = watch::channel(0);
        let reboot = Arc::new(CountingReboot::default());
        let reader = ReaderLoop {
            state: state.clone(),
            shutdown: shutdown_rx,
            handoff: handoff_rx,
            reboot: reboot.clone(),
            poll_interval: Duration::from_millis(5),
            link_lost: Arc::new(Notify::new()),
            released: released_tx,
            link: None,
        };
        let task = tokio::spawn(reader.run());

        let (device, mut host) = tokio::io::duplex(64);
        let (read_half, _write_half) = tokio::io::split(Box::new(device) as DynSerial);
        handoff_tx
            .send(Handoff {
                generation: 1,
                half: read_half,
            })
            .unwrap();

        // Several reader polls pass before the link is marked up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        state.set_up(1);

        host.write_all(b"rsh-reboot\n").await.unwrap();
        timeout(Duration::from_secs(5), async {
            while reboot.0.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send_replace(true);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_waits_for_reader_to_release_device() {
        let (device, host) = tokio::io::duplex(64);
        let opener = Arc::new(ExclusiveOpener {
            in_use: Arc::new(AtomicBool::new(false)),
            opened: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            spare: Mutex::new(Some(Box::new(device))),
        });
        // A busy failure would cost the full reconnect delay.
        let transport = SerialTransport::spawn(
            opener.clone(),
            Arc::new(NoReboot),
            SerialTransportOptions::default()
                .with_reconnect_delay(Duration::from_secs(30))
                .with_reader_poll_interval(Duration::from_secs(1)),
        );

        transport.enqueue("lost\n".to_string());
        transport.enqueue("kept\n".to_string());

        let mut host = BufReader::new(host);
        let mut line = String::new();
        timeout(Duration::from_secs(5), host.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "kept\n");
        assert_eq!(opener.busy.load(Ordering::SeqCst), 0);

        transport.close();
        transport.join().await;
    }
}
